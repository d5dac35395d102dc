use std::collections::HashMap;

use axum::extract::{Query, State};
use axum::Json;
use chrono::Duration;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::events::EventRecord;
use crate::state::AppState;

const ALERT_WINDOW_MIN: i64 = 10;
const INVALID_TOKEN_BURST: usize = 5;

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    100
}

/// `GET /soc/events?limit=`: the trailing slice of the audit log.
pub async fn events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Json<Value> {
    let limit = query.limit.min(1000);
    Json(json!({
        "total": state.events.len(),
        "events": state.events.recent(limit),
    }))
}

/// `GET /soc/alerts`: alerts derived from the last ten minutes of events.
pub async fn alerts(State(state): State<AppState>) -> Json<Value> {
    let window = state.events.since(Duration::minutes(ALERT_WINDOW_MIN));
    let mut alerts = derive_alerts(&window, state.config.max_rpm_per_token as usize);

    for user in state
        .users
        .low_credit_views(state.config.trial_low_credits_threshold)
    {
        alerts.push(json!({
            "type": "quota_nearing",
            "severity": "info",
            "user": user,
        }));
    }

    Json(json!({
        "windowMinutes": ALERT_WINDOW_MIN,
        "alerts": alerts,
    }))
}

fn derive_alerts(window: &[EventRecord], rpm_cap: usize) -> Vec<Value> {
    let mut alerts = Vec::new();

    // bursts of unauthorized requests, grouped by source address
    let mut invalid_by_ip: HashMap<&str, usize> = HashMap::new();
    for event in window.iter().filter(|e| e.status == 401) {
        *invalid_by_ip.entry(event.ip.as_str()).or_insert(0) += 1;
    }
    for (ip, count) in invalid_by_ip {
        if count >= INVALID_TOKEN_BURST {
            alerts.push(json!({
                "type": "invalid_token_burst",
                "severity": "warning",
                "ip": ip,
                "count": count,
            }));
        }
    }

    // tokens pushing past the per-minute cap across the window
    let mut requests_by_token: HashMap<&str, usize> = HashMap::new();
    for event in window {
        if let Some(token_hash) = event.token_hash.as_deref() {
            *requests_by_token.entry(token_hash).or_insert(0) += 1;
        }
    }
    for (token_hash, count) in requests_by_token {
        if count > rpm_cap * ALERT_WINDOW_MIN as usize {
            alerts.push(json!({
                "type": "rpm_anomaly",
                "severity": "warning",
                "tokenHash": token_hash,
                "count": count,
            }));
        }
    }

    // payloads the chat handler tagged as suspicious
    for event in window {
        if event.tags.iter().any(|t| t == "prompt_injection_suspected") {
            alerts.push(json!({
                "type": "prompt_injection_suspected",
                "severity": "warning",
                "tokenHash": event.token_hash,
                "path": event.path,
                "timestamp": event.timestamp,
            }));
        }
    }

    alerts
}
