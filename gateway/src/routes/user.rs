use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};
use slipstream_core::GatewayError;

use crate::error::ApiError;
use crate::routes::bearer_token;
use crate::state::AppState;

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "ok": true, "service": state.config.service_name }))
}

/// OpenAI-shaped model listing derived from the credit table.
pub async fn models(State(_state): State<AppState>) -> Json<Value> {
    let created = Utc::now().timestamp();
    let data: Vec<Value> = slipstream_quota::known_models()
        .map(|id| {
            json!({
                "id": id,
                "object": "model",
                "owned_by": "slipstream",
                "created": created,
            })
        })
        .collect();
    Json(json!({ "object": "list", "data": data }))
}

/// Per-user credit standing, for the authenticated bearer.
pub async fn credits(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let token = bearer_token(&headers)
        .ok_or_else(|| GatewayError::Unauthorized("missing bearer token".into()))?;
    let user = state.users.authenticate(token)?;
    let now = Utc::now();
    let usage_percent = if user.credit_limit > 0.0 {
        (user.used_credits / user.credit_limit * 100.0).min(100.0)
    } else {
        0.0
    };
    Ok(Json(json!({
        "userId": user.id,
        "name": user.name,
        "credits": {
            "available": user.available_credits(),
            "limit": user.credit_limit,
            "used": user.used_credits,
            "usagePercent": usage_percent,
        },
        "recovery": {
            "amount": user.credit_recovery_amount,
            "intervalHours": user.credit_recovery_interval_ms as f64 / 3_600_000.0,
            "lastRecoveryAt": user.last_recovery_at,
            "nextRecoveryInMs": user.next_recovery_in_ms(now),
        },
        "stats": {
            "totalUsed": user.total_used,
            "requestCount": user.request_count,
            "lastRequestAt": user.last_request_at,
        },
    })))
}
