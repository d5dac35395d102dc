use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use slipstream_core::config::{self, ConfigOverrides};
use slipstream_core::{init_tracing, LogFormat};
use slipstream_gateway::{build_router, AppState};
use slipstream_pool::health::{spawn_account_monitor, spawn_health_monitor, spawn_keepalive};
use slipstream_pool::refresh::spawn_token_refresh;
use slipstream_pool::{HealthThresholds, MonitorConfig, RefreshConfig};
use slipstream_quota::store::spawn_recovery;
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};

#[derive(Parser, Debug, Clone)]
#[command(name = "slipstream-gateway", about = "Slipstream central gateway")]
struct GatewayCli {
    #[arg(long)]
    config: Option<std::path::PathBuf>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long = "log-level")]
    log_level: Option<String>,
    #[arg(long = "log-format")]
    log_format: Option<String>,
}

impl GatewayCli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            config_path: self.config.clone(),
            host: self.host.clone(),
            port: self.port,
            log_level: self.log_level.clone(),
            log_format: self.log_format.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = GatewayCli::parse();
    let config =
        config::load_gateway(cli.overrides()).context("failed to load gateway configuration")?;

    let log_format = LogFormat::from_str(&config.log_format)?;
    init_tracing(&config.log_level, log_format)?;

    let addr = config.bind_address().context("invalid bind address")?;
    let tls = load_rustls(&config).await?;
    let state = AppState::new(config).context("failed to assemble gateway state")?;

    match state.sessions.load() {
        Ok(count) => info!(count, "session pool loaded"),
        Err(err) => warn!(%err, "session pool failed to load, starting empty"),
    }
    if let Err(err) = state.accounts.load() {
        warn!(%err, "account pool failed to load, starting empty");
    }
    if let Err(err) = state.users.load() {
        warn!(%err, "user table failed to load, starting empty");
    }

    spawn_background_tasks(&state);

    let router = build_router(state);
    if let Some(tls) = tls {
        info!(?addr, "starting TLS gateway server");
        let handle = axum_server::Handle::new();
        let shutdown_handle = handle.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown_handle.graceful_shutdown(None);
        });
        axum_server::bind_rustls(addr, tls)
            .handle(handle)
            .serve(router.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .context("gateway server exited")?;
    } else {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind gateway address {addr}"))?;
        info!(?addr, "starting HTTP gateway server");
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("gateway server exited")?;
    }

    Ok(())
}

fn spawn_background_tasks(state: &AppState) {
    let config = &state.config;
    let monitor = MonitorConfig {
        health_interval: Duration::from_millis(config.session_healthcheck_interval_ms),
        health_timeout: Duration::from_millis(config.session_healthcheck_timeout_ms),
        keepalive_interval: Duration::from_millis(config.session_keepalive_interval_ms),
        thresholds: HealthThresholds::default(),
        max_age: match config.session_max_age_ms {
            0 => None,
            ms => Some(chrono::Duration::milliseconds(ms as i64)),
        },
    };

    spawn_health_monitor(
        state.sessions.clone(),
        state.affinity.clone(),
        state.adapters.clone(),
        state.upstream.http().clone(),
        monitor.clone(),
    );
    spawn_keepalive(
        state.sessions.clone(),
        state.adapters.clone(),
        state.upstream.http().clone(),
        monitor.keepalive_interval,
        monitor.health_timeout,
    );
    spawn_account_monitor(
        state.accounts.clone(),
        state.upstream.http().clone(),
        Duration::from_millis(config.account_healthcheck_interval_ms),
        Duration::from_millis(config.account_healthcheck_timeout_ms),
        HealthThresholds::default(),
    );
    spawn_token_refresh(
        state.sessions.clone(),
        state.upstream.http().clone(),
        RefreshConfig {
            interval: Duration::from_millis(config.token_refresh_interval_ms),
            token_endpoint: config.token_endpoint.clone(),
            api_key: config.firebase_api_key.clone(),
        },
    );
    spawn_recovery(state.users.clone());
    state.affinity.spawn_sweeper();
    slipstream_gateway::reset::spawn_daily_reset(
        state.sessions.clone(),
        state.accounts.clone(),
        state.users.clone(),
    );
    info!("background tasks started");
}

async fn load_rustls(config: &slipstream_core::GatewayConfig) -> Result<Option<RustlsConfig>> {
    if let (Some(cert), Some(key)) = (&config.tls_cert_path, &config.tls_key_path) {
        let tls = RustlsConfig::from_pem_file(cert.clone(), key.clone())
            .await
            .context("failed to load gateway TLS material")?;
        return Ok(Some(tls));
    }
    Ok(None)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
