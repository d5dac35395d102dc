use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};
use slipstream_core::GatewayError;
use slipstream_pool::health::{run_health_sweep, MonitorConfig};
use slipstream_pool::{HealthThresholds, Session, SessionCredentials};
use tracing::{info, warn};

use crate::error::ApiError;
use crate::state::AppState;

fn monitor_config(state: &AppState) -> MonitorConfig {
    let config = &state.config;
    MonitorConfig {
        health_interval: std::time::Duration::from_millis(config.session_healthcheck_interval_ms),
        health_timeout: std::time::Duration::from_millis(config.session_healthcheck_timeout_ms),
        keepalive_interval: std::time::Duration::from_millis(config.session_keepalive_interval_ms),
        thresholds: HealthThresholds::default(),
        max_age: match config.session_max_age_ms {
            0 => None,
            ms => Some(chrono::Duration::milliseconds(ms as i64)),
        },
    }
}

// --- accounts ---

pub async fn accounts_status(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "accounts": state.accounts.status_views(),
    }))
}

pub async fn accounts_reload(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let count = state
        .accounts
        .load()
        .map_err(|err| GatewayError::Internal(err.to_string()))?;
    info!(count, "account pool reloaded");
    Ok(Json(json!({ "ok": true, "accounts": count })))
}

pub async fn accounts_health_check(State(state): State<AppState>) -> Json<Value> {
    let timeout =
        std::time::Duration::from_millis(state.config.account_healthcheck_timeout_ms);
    let thresholds = HealthThresholds::default();
    let mut results = Vec::new();
    for account in state.accounts.snapshot() {
        let url = format!("{}/models", account.base_url.trim_end_matches('/'));
        let healthy = state
            .upstream
            .http()
            .get(&url)
            .timeout(timeout)
            .bearer_auth(&account.api_key)
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false);
        state.accounts.mark_health(&account.id, healthy, thresholds);
        results.push(json!({ "id": account.id, "healthy": healthy }));
    }
    Json(json!({ "results": results }))
}

// --- sessions ---

pub async fn sessions_status(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "sessions": state.sessions.status_views(),
        "activeBindings": state.affinity.active_bindings(),
    }))
}

pub async fn sessions_reload(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let count = state
        .sessions
        .reload()
        .map_err(|err| GatewayError::Internal(err.to_string()))?;
    info!(count, "session pool reloaded");
    Ok(Json(json!({ "ok": true, "sessions": count })))
}

/// Admin injection of an externally harvested session.
pub async fn sessions_register(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let api_key = payload["apiKey"]
        .as_str()
        .or_else(|| payload["sessionToken"].as_str())
        .ok_or_else(|| GatewayError::BadRequest("apiKey or sessionToken required".into()))?
        .to_string();
    let id = payload["id"]
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let jwt = payload["firebaseIdToken"]
        .as_str()
        .or_else(|| payload["jwt"].as_str())
        .map(str::to_string);

    let mut session = Session::new(
        id.clone(),
        payload["platform"].as_str().unwrap_or("windsurf"),
        SessionCredentials {
            api_key,
            jwt: jwt.clone(),
            refresh_token: payload["refreshToken"].as_str().map(str::to_string),
            device_id: payload["uid"].as_str().map(str::to_string),
            editor_version: payload["editorVersion"].as_str().map(str::to_string),
            locale: payload["locale"].as_str().map(str::to_string),
            os_tag: payload["os"].as_str().map(str::to_string),
            machine_id: payload["machineId"].as_str().map(str::to_string),
        },
    );
    session.label = payload["label"].as_str().map(str::to_string);
    session.pool_name = payload["poolName"].as_str().map(str::to_string);
    session.email = payload["email"].as_str().map(str::to_string);
    if let Some(credits) = payload["credits"].as_f64() {
        session.credits_remaining = credits;
        session.credits_total = credits;
    }
    if let Some(limit) = payload["dailyLimit"].as_u64() {
        session.daily_limit = Some(limit);
    }
    // a decodable JWT seeds the expiry predicate
    if session.expires_at.is_none() {
        if let Some(jwt) = jwt.as_deref() {
            session.expires_at = slipstream_pool::refresh::jwt_expiry(jwt);
        }
    }

    if !state.sessions.add(session) {
        return Err(GatewayError::BadRequest(format!("session {id} already exists")).into());
    }
    if let Err(err) = state.sessions.save() {
        warn!(%err, "failed to persist sessions after register");
    }
    Ok(Json(json!({ "ok": true, "id": id })))
}

pub async fn sessions_remove(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let id = payload["id"]
        .as_str()
        .ok_or_else(|| GatewayError::BadRequest("id required".into()))?;
    if !state.sessions.remove(id) {
        return Err(GatewayError::NotFound.into());
    }
    state.affinity.evict_session(id);
    if let Err(err) = state.sessions.save() {
        warn!(%err, "failed to persist sessions after remove");
    }
    info!(id, "session removed");
    Ok(Json(json!({ "ok": true })))
}

pub async fn sessions_health_check(State(state): State<AppState>) -> Json<Value> {
    let config = monitor_config(&state);
    let outcomes = run_health_sweep(
        &state.sessions,
        &state.affinity,
        &state.adapters,
        state.upstream.http(),
        &config,
    )
    .await;
    Json(json!({ "results": outcomes }))
}

/// Operator view of per-session credit standing.
pub async fn session_credits(State(state): State<AppState>) -> Json<Value> {
    let sessions: Vec<Value> = state
        .sessions
        .snapshot()
        .iter()
        .map(|s| {
            json!({
                "id": s.id,
                "creditsRemaining": s.credits_remaining,
                "creditsTotal": s.credits_total,
                "boundUsers": state.affinity.bound_count(&s.id),
                "enabled": s.enabled,
                "disabledReason": s.disabled_reason,
            })
        })
        .collect();
    Json(json!({ "sessions": sessions }))
}

// --- users ---

pub async fn users_status(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "users": state.users.status_views() }))
}

pub async fn users_create(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let user = state
        .users
        .create(payload, state.config.trial_initial_credits)?;
    if let Err(err) = state.users.save() {
        warn!(%err, "failed to persist users after create");
    }
    Ok(Json(user.status_view()))
}

pub async fn users_update(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let id = payload["id"]
        .as_str()
        .ok_or_else(|| GatewayError::BadRequest("id required".into()))?
        .to_string();
    let user = state.users.update(&id, payload)?;
    if let Err(err) = state.users.save() {
        warn!(%err, "failed to persist users after update");
    }
    Ok(Json(user.status_view()))
}

pub async fn users_delete(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let id = payload["id"]
        .as_str()
        .ok_or_else(|| GatewayError::BadRequest("id required".into()))?;
    if !state.users.delete(id) {
        return Err(GatewayError::NotFound.into());
    }
    if let Err(err) = state.users.save() {
        warn!(%err, "failed to persist users after delete");
    }
    Ok(Json(json!({ "ok": true })))
}

pub async fn users_reset_credits(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let id = payload["id"]
        .as_str()
        .ok_or_else(|| GatewayError::BadRequest("id required".into()))?;
    let user = state.users.reset_credits(id)?;
    if let Err(err) = state.users.save() {
        warn!(%err, "failed to persist users after credit reset");
    }
    Ok(Json(user.status_view()))
}

pub async fn users_reload(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let count = state
        .users
        .reload()
        .map_err(|err| GatewayError::Internal(err.to_string()))?;
    info!(count, "user table reloaded");
    Ok(Json(json!({ "ok": true, "users": count })))
}

// --- telemetry ---

pub async fn bandwidth(State(state): State<AppState>) -> Json<Value> {
    let metrics = state.bandwidth.metrics();
    Json(json!({
        "generatedAt": Utc::now(),
        "metrics": metrics,
    }))
}
