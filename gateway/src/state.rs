use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use slipstream_core::GatewayConfig;
use slipstream_pool::{
    AccountStore, AdapterRegistry, AffinityRouter, SessionStore,
};
use slipstream_quota::{RateLimiter, UserStore};

use crate::bandwidth::BandwidthTracker;
use crate::events::EventLog;
use crate::upstream::UpstreamClient;

/// Everything a request handler needs, cheaply cloneable.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub sessions: Arc<SessionStore>,
    pub accounts: Arc<AccountStore>,
    pub users: Arc<UserStore>,
    pub affinity: Arc<AffinityRouter>,
    pub rate: Arc<RateLimiter>,
    pub adapters: Arc<AdapterRegistry>,
    pub events: Arc<EventLog>,
    pub bandwidth: Arc<BandwidthTracker>,
    pub upstream: UpstreamClient,
}

impl AppState {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let sessions = Arc::new(SessionStore::new(&config.sessions_file));
        let default_limit = match config.default_account_daily_limit {
            0 => None,
            limit => Some(limit),
        };
        let accounts = Arc::new(AccountStore::new(&config.account_pool_file, default_limit));
        let users = Arc::new(UserStore::new(&config.users_file, config.jwt_secret.clone()));
        let affinity = Arc::new(AffinityRouter::new(
            Duration::from_millis(config.session_affinity_ttl_ms),
            config.max_users_per_session as usize,
        ));
        let rate = Arc::new(RateLimiter::new(config.max_rpm_per_token));
        let adapters = Arc::new(AdapterRegistry::new(&config.platform_host));
        let events = Arc::new(EventLog::new(config.event_retention));
        let bandwidth = Arc::new(BandwidthTracker::new());
        let upstream = UpstreamClient::new(Duration::from_millis(config.upstream_timeout_ms))
            .context("failed to build upstream HTTP client")?;

        Ok(Self {
            config: Arc::new(config),
            sessions,
            accounts,
            users,
            affinity,
            rate,
            adapters,
            events,
            bandwidth,
            upstream,
        })
    }
}
