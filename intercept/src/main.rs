//! Interception proxy binary.
//!
//! Exposes the five lifecycle operations the host UI drives: `initialize`
//! (hosts redirect via the external helper), `run`, `stop`, `restore` and
//! `status`. Only `run` keeps a process alive; the rest are one-shot.

mod ca;
mod control;
mod dns;
mod proxy;
mod tls;

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use slipstream_core::config::{self, ConfigOverrides};
use slipstream_core::{init_tracing, LogFormat};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::ca::CertAuthority;
use crate::proxy::InterceptProxy;

#[derive(Parser, Debug)]
#[command(name = "slipstream-intercept", about = "Local TLS interception proxy")]
struct InterceptCli {
    #[arg(long)]
    config: Option<std::path::PathBuf>,
    #[arg(long = "log-level")]
    log_level: Option<String>,
    #[arg(long = "log-format")]
    log_format: Option<String>,
    #[command(subcommand)]
    command: InterceptCommand,
}

#[derive(Subcommand, Debug)]
enum InterceptCommand {
    /// Install the hosts redirect through the external helper.
    Initialize,
    /// Serve the proxy; forwards to the gateway when a URL is given,
    /// otherwise splices through to the real platform.
    Run {
        #[arg(long = "gateway-url")]
        gateway_url: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Terminate a running proxy.
    Stop,
    /// Stop the proxy and revert the hosts redirect.
    Restore,
    /// Report hosts and proxy state as JSON.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = InterceptCli::parse();
    let overrides = ConfigOverrides {
        config_path: cli.config.clone(),
        host: None,
        port: match &cli.command {
            InterceptCommand::Run { port, .. } => *port,
            _ => None,
        },
        log_level: cli.log_level.clone(),
        log_format: cli.log_format.clone(),
    };
    let mut config =
        config::load_intercept(overrides).context("failed to load intercept configuration")?;

    let log_format = LogFormat::from_str(&config.log_format)?;
    init_tracing(&config.log_level, log_format)?;
    tls::init_crypto();

    match cli.command {
        InterceptCommand::Initialize => control::initialize(&config),
        InterceptCommand::Stop => control::stop(&config),
        InterceptCommand::Restore => control::restore(&config),
        InterceptCommand::Status => {
            let report = control::status(&config);
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        InterceptCommand::Run { gateway_url, .. } => {
            if let Some(url) = gateway_url {
                config.gateway_url = Some(url);
            }
            run(config).await
        }
    }
}

async fn run(config: slipstream_core::InterceptConfig) -> Result<()> {
    if !control::verify_redirect(&config).await {
        warn!(
            host = %config.platform_host,
            "platform host does not resolve to loopback; run `initialize` first"
        );
    }

    let ca = Arc::new(
        CertAuthority::load_or_generate(&config.ca_dir)
            .context("failed to prepare certificate authority")?,
    );
    let proxy = Arc::new(InterceptProxy::new(&config, ca)?);

    let addr = config.bind_address().context("invalid listen address")?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr} (port 443 usually needs privileges)"))?;
    info!(?addr, "interception proxy listening");

    control::write_pidfile(&config.pid_file)?;
    let result = tokio::select! {
        result = proxy.run(listener) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            Ok(())
        }
    };
    control::remove_pidfile(&config.pid_file);
    result
}
