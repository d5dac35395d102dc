use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::account::AccountStore;
use crate::adapter::AdapterRegistry;
use crate::affinity::AffinityRouter;
use crate::session::Session;
use crate::store::{HealthThresholds, HealthTransition, SessionStore};

/// Timings and thresholds for the session monitors.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub health_interval: Duration,
    pub health_timeout: Duration,
    pub keepalive_interval: Duration,
    pub thresholds: HealthThresholds,
    /// Age-based expiry; `None` disables the age clock.
    pub max_age: Option<chrono::Duration>,
}

/// Outcome of one probe, as reported by the admin health-check endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeOutcome {
    pub id: String,
    pub healthy: bool,
    pub transition: String,
}

fn transition_label(transition: HealthTransition) -> &'static str {
    match transition {
        HealthTransition::Unchanged => "unchanged",
        HealthTransition::Disabled => "disabled",
        HealthTransition::Recovered => "recovered",
    }
}

async fn probe_session(
    client: &reqwest::Client,
    registry: &AdapterRegistry,
    session: &Session,
    timeout: Duration,
) -> bool {
    let adapter = registry.get(&session.platform);
    let request = adapter.health_request(session);
    let result = client
        .post(&request.url)
        .timeout(timeout)
        .header(reqwest::header::CONTENT_TYPE, request.content_type)
        .header(
            reqwest::header::AUTHORIZATION,
            format!("Bearer {}", request.bearer),
        )
        .body(request.body)
        .send()
        .await;
    match result {
        Ok(response) => response.status().is_success(),
        Err(err) => {
            debug!(id = %session.id, %err, "session probe transport failure");
            false
        }
    }
}

/// One full probe sweep over the pool. Expiry runs first so that expired
/// sessions are demoted before their probes would be wasted.
pub async fn run_health_sweep(
    store: &SessionStore,
    affinity: &AffinityRouter,
    registry: &AdapterRegistry,
    client: &reqwest::Client,
    config: &MonitorConfig,
) -> Vec<ProbeOutcome> {
    for id in store.sweep_expired(config.max_age) {
        warn!(id = %id, "session expired, disabling");
        affinity.evict_session(&id);
    }

    let mut outcomes = Vec::new();
    // credentials are cloned out; no I/O happens under the store lock
    for session in store.snapshot() {
        if !session.enabled
            && session.disabled_reason
                != Some(crate::session::DisabledReason::HealthCheckFailed)
        {
            continue;
        }
        let healthy = probe_session(client, registry, &session, config.health_timeout).await;
        let transition = store.mark_health(&session.id, healthy, config.thresholds);
        match transition {
            HealthTransition::Disabled => {
                warn!(id = %session.id, "session disabled after consecutive health failures");
                affinity.evict_session(&session.id);
            }
            HealthTransition::Recovered => {
                info!(id = %session.id, "session recovered after consecutive health successes");
            }
            HealthTransition::Unchanged => {}
        }
        outcomes.push(ProbeOutcome {
            id: session.id,
            healthy,
            transition: transition_label(transition).to_string(),
        });
    }
    if let Err(err) = store.save() {
        warn!(%err, "failed to persist session store after health sweep");
    }
    outcomes
}

/// Periodic health-check task (fine interval).
pub fn spawn_health_monitor(
    store: Arc<SessionStore>,
    affinity: Arc<AffinityRouter>,
    registry: Arc<AdapterRegistry>,
    client: reqwest::Client,
    config: MonitorConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.health_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let outcomes =
                run_health_sweep(&store, &affinity, &registry, &client, &config).await;
            debug!(probed = outcomes.len(), "session health sweep finished");
        }
    })
}

/// Periodic keepalive task (coarse interval). Failures are recorded, never
/// disabling.
pub fn spawn_keepalive(
    store: Arc<SessionStore>,
    registry: Arc<AdapterRegistry>,
    client: reqwest::Client,
    interval: Duration,
    timeout: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            for session in store.snapshot() {
                if !session.enabled {
                    continue;
                }
                let adapter = registry.get(&session.platform);
                let request = adapter.keepalive_request(&session);
                let ok = client
                    .post(&request.url)
                    .timeout(timeout)
                    .header(reqwest::header::CONTENT_TYPE, request.content_type)
                    .header(
                        reqwest::header::AUTHORIZATION,
                        format!("Bearer {}", request.bearer),
                    )
                    .body(request.body)
                    .send()
                    .await
                    .map(|r| r.status().is_success())
                    .unwrap_or(false);
                store.mark_keepalive(&session.id, ok);
            }
        }
    })
}

/// Upstream-account health monitor (30 s default). Probes the account's
/// OpenAI-compatible `/models` listing with its stored key.
pub fn spawn_account_monitor(
    accounts: Arc<AccountStore>,
    client: reqwest::Client,
    interval: Duration,
    timeout: Duration,
    thresholds: HealthThresholds,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            for account in accounts.snapshot() {
                if !account.enabled
                    && account.disabled_reason
                        != Some(crate::session::DisabledReason::HealthCheckFailed)
                {
                    continue;
                }
                let url = format!("{}/models", account.base_url.trim_end_matches('/'));
                let healthy = client
                    .get(&url)
                    .timeout(timeout)
                    .bearer_auth(&account.api_key)
                    .send()
                    .await
                    .map(|r| r.status().is_success())
                    .unwrap_or(false);
                match accounts.mark_health(&account.id, healthy, thresholds) {
                    HealthTransition::Disabled => {
                        warn!(id = %account.id, "upstream account disabled after failed probes");
                    }
                    HealthTransition::Recovered => {
                        info!(id = %account.id, "upstream account recovered");
                    }
                    HealthTransition::Unchanged => {}
                }
            }
        }
    })
}
