use std::fs;
use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result};
use serde::Serialize;
use slipstream_core::InterceptConfig;
use tracing::{info, warn};

/// Machine-readable `status` report for the host UI.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub hosts_modified: bool,
    pub proxy_running: bool,
    pub pid: Option<u32>,
}

/// Invoke the external hosts helper. The proxy itself never edits the hosts
/// file; the helper's whole contract is `add`, `remove` and `check` of one
/// marker line for the platform host.
fn hosts_helper(config: &InterceptConfig, action: &str) -> Result<bool> {
    let Some(helper) = config.hosts_helper.as_deref() else {
        anyhow::bail!("no hosts helper configured (set hosts_helper)");
    };
    let status = Command::new(helper)
        .arg(action)
        .arg(&config.platform_host)
        .status()
        .with_context(|| format!("running hosts helper {helper} {action}"))?;
    Ok(status.success())
}

/// `initialize`: point the platform host at loopback via the helper.
pub fn initialize(config: &InterceptConfig) -> Result<()> {
    if !hosts_helper(config, "add")? {
        anyhow::bail!("hosts helper refused to add the redirect entry");
    }
    info!(host = %config.platform_host, "hosts redirect installed");
    Ok(())
}

/// `restore`: stop the proxy if running, then revert the hosts entry.
pub fn restore(config: &InterceptConfig) -> Result<()> {
    if let Err(err) = stop(config) {
        warn!(%err, "proxy was not running");
    }
    if !hosts_helper(config, "remove")? {
        anyhow::bail!("hosts helper refused to remove the redirect entry");
    }
    info!(host = %config.platform_host, "hosts redirect removed");
    Ok(())
}

pub fn write_pidfile(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, std::process::id().to_string()).context("writing pid file")
}

pub fn remove_pidfile(path: &Path) {
    let _ = fs::remove_file(path);
}

fn read_pidfile(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn process_alive(pid: u32) -> bool {
    // signal 0 probes liveness without touching the process
    Command::new("kill")
        .args(["-0", &pid.to_string()])
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// `stop`: terminate the running proxy child via its pid file.
pub fn stop(config: &InterceptConfig) -> Result<()> {
    let Some(pid) = read_pidfile(&config.pid_file) else {
        anyhow::bail!("no pid file at {}", config.pid_file.display());
    };
    let status = Command::new("kill")
        .arg(pid.to_string())
        .status()
        .context("sending TERM to proxy")?;
    if !status.success() {
        anyhow::bail!("kill failed for pid {pid}");
    }
    remove_pidfile(&config.pid_file);
    info!(pid, "interception proxy stopped");
    Ok(())
}

/// `status`: whether the hosts redirect is present and the proxy alive.
pub fn status(config: &InterceptConfig) -> StatusReport {
    let hosts_modified = hosts_helper(config, "check").unwrap_or(false);
    let pid = read_pidfile(&config.pid_file);
    let proxy_running = pid.map(process_alive).unwrap_or(false);
    StatusReport {
        hosts_modified,
        proxy_running,
        pid,
    }
}

/// Before serving, confirm the platform SNI actually resolves to loopback;
/// without the redirect every intercepted dial would just be a broken
/// mirror.
pub async fn verify_redirect(config: &InterceptConfig) -> bool {
    let target = format!("{}:443", config.platform_host);
    match tokio::net::lookup_host(target).await {
        Ok(mut addresses) => addresses.any(|a| a.ip().is_loopback()),
        Err(err) => {
            warn!(%err, host = %config.platform_host, "platform host does not resolve");
            false
        }
    }
}
