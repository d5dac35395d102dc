use std::net::SocketAddr;
use std::path::PathBuf;

use config::{Config, ConfigError as BuilderError, Environment, File, FileFormat};
use serde::Deserialize;
use thiserror::Error;

const DEFAULT_CONFIG_FILE: &str = "config/gateway.toml";
const DEFAULT_INTERCEPT_FILE: &str = "config/intercept.toml";

/// Gateway configuration, resolved once at startup.
///
/// Sources, lowest to highest precedence: built-in defaults, the optional
/// TOML file, flat environment variables (`PORT`, `MAX_RPM_PER_TOKEN`, ...),
/// then CLI overrides.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub service_name: String,
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,

    pub platform_host: String,
    pub sessions_file: PathBuf,
    pub users_file: PathBuf,
    pub account_pool_file: PathBuf,

    pub max_rpm_per_token: u32,
    pub event_retention: usize,
    pub max_users_per_session: u32,
    pub payload_limit_bytes: usize,
    pub upstream_timeout_ms: u64,

    pub session_keepalive_interval_ms: u64,
    pub session_healthcheck_interval_ms: u64,
    pub session_healthcheck_timeout_ms: u64,
    /// 0 disables the age-based expiry predicate.
    pub session_max_age_ms: u64,
    pub session_affinity_ttl_ms: u64,

    pub account_healthcheck_interval_ms: u64,
    pub account_healthcheck_timeout_ms: u64,
    /// 0 means no daily token limit for accounts that do not declare one.
    pub default_account_daily_limit: u64,

    pub trial_initial_credits: f64,
    pub trial_low_credits_threshold: f64,

    pub token_refresh_interval_ms: u64,
    /// Identity-provider token endpoint. Refresh is skipped when unset.
    pub token_endpoint: Option<String>,
    pub firebase_api_key: Option<String>,
    /// HS256 secret accepted for subscription-style bearer JWTs.
    pub jwt_secret: Option<String>,

    pub simulate_enabled: bool,
    pub refund_on_upstream_error: bool,

    pub log_level: String,
    pub log_format: String,
}

impl GatewayConfig {
    pub fn bind_address(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }

    pub fn platform_base_url(&self) -> String {
        format!("https://{}", self.platform_host)
    }
}

/// Interception-proxy configuration. Same layering as [`GatewayConfig`].
#[derive(Debug, Clone, Deserialize)]
pub struct InterceptConfig {
    pub listen_host: String,
    pub listen_port: u16,
    /// Gateway-mode target; passthrough when unset.
    pub gateway_url: Option<String>,
    pub platform_host: String,
    /// External resolver consulted for passthrough dials, bypassing the
    /// locally mutated hosts file.
    pub bypass_resolver_ip: String,
    pub ca_dir: PathBuf,
    pub pid_file: PathBuf,
    /// External helper command with `add`/`remove`/`check` subcommands.
    /// The proxy never edits the hosts file itself.
    pub hosts_helper: Option<String>,
    pub log_level: String,
    pub log_format: String,
}

impl InterceptConfig {
    pub fn bind_address(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.listen_host, self.listen_port).parse()
    }
}

/// CLI-level overrides applied on top of file and environment sources.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub config_path: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub log_level: Option<String>,
    pub log_format: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Builder(#[from] BuilderError),
}

pub fn load_gateway(overrides: ConfigOverrides) -> Result<GatewayConfig, ConfigError> {
    let mut builder = Config::builder()
        .set_default("host", "0.0.0.0")?
        .set_default("port", 8080)?
        .set_default("service_name", "slipstream-gateway")?
        .set_default("platform_host", "server.codeium.com")?
        .set_default("sessions_file", "config/sessions.json")?
        .set_default("users_file", "config/users.json")?
        .set_default("account_pool_file", "config/accounts.json")?
        .set_default("max_rpm_per_token", 30)?
        .set_default("event_retention", 500)?
        .set_default("max_users_per_session", 4)?
        .set_default("payload_limit_bytes", 1024 * 1024)?
        .set_default("upstream_timeout_ms", 120_000)?
        .set_default("session_keepalive_interval_ms", 300_000)?
        .set_default("session_healthcheck_interval_ms", 60_000)?
        .set_default("session_healthcheck_timeout_ms", 5_000)?
        .set_default("session_max_age_ms", 0)?
        .set_default("session_affinity_ttl_ms", 1_800_000)?
        .set_default("account_healthcheck_interval_ms", 30_000)?
        .set_default("account_healthcheck_timeout_ms", 2_500)?
        .set_default("default_account_daily_limit", 0)?
        .set_default("trial_initial_credits", 1000.0)?
        .set_default("trial_low_credits_threshold", 50.0)?
        .set_default("token_refresh_interval_ms", 2_700_000)?
        .set_default("simulate_enabled", false)?
        .set_default("refund_on_upstream_error", false)?
        .set_default("log_level", "info")?
        .set_default("log_format", "pretty")?;

    builder = builder.add_source(
        File::with_name(DEFAULT_CONFIG_FILE)
            .required(false)
            .format(FileFormat::Toml),
    );
    if let Some(path) = overrides.config_path.as_ref() {
        builder = builder.add_source(File::from(path.clone()));
    }
    builder = builder.add_source(Environment::default().try_parsing(true));

    if let Some(host) = overrides.host {
        builder = builder.set_override("host", host)?;
    }
    if let Some(port) = overrides.port {
        builder = builder.set_override("port", port as i64)?;
    }
    if let Some(level) = overrides.log_level {
        builder = builder.set_override("log_level", level)?;
    }
    if let Some(format) = overrides.log_format {
        builder = builder.set_override("log_format", format)?;
    }

    Ok(builder.build()?.try_deserialize()?)
}

pub fn load_intercept(overrides: ConfigOverrides) -> Result<InterceptConfig, ConfigError> {
    let mut builder = Config::builder()
        .set_default("listen_host", "127.0.0.1")?
        .set_default("listen_port", 443)?
        .set_default("platform_host", "server.codeium.com")?
        .set_default("bypass_resolver_ip", "8.8.8.8")?
        .set_default("ca_dir", "config/ca")?
        .set_default("pid_file", "config/intercept.pid")?
        .set_default("log_level", "info")?
        .set_default("log_format", "pretty")?;

    builder = builder.add_source(
        File::with_name(DEFAULT_INTERCEPT_FILE)
            .required(false)
            .format(FileFormat::Toml),
    );
    if let Some(path) = overrides.config_path.as_ref() {
        builder = builder.add_source(File::from(path.clone()));
    }
    builder = builder.add_source(
        Environment::with_prefix("INTERCEPT")
            .try_parsing(true)
            .separator("__"),
    );

    if let Some(host) = overrides.host {
        builder = builder.set_override("listen_host", host)?;
    }
    if let Some(port) = overrides.port {
        builder = builder.set_override("listen_port", port as i64)?;
    }
    if let Some(level) = overrides.log_level {
        builder = builder.set_override("log_level", level)?;
    }
    if let Some(format) = overrides.log_format {
        builder = builder.set_override("log_format", format)?;
    }

    Ok(builder.build()?.try_deserialize()?)
}
