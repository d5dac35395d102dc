use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::store::SessionStore;

/// Identity-provider coordinates. Both come from configuration; there is no
/// baked-in endpoint.
#[derive(Debug, Clone)]
pub struct RefreshConfig {
    pub interval: Duration,
    pub token_endpoint: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    id_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JwtClaims {
    #[serde(default)]
    exp: Option<i64>,
}

/// Pull the `exp` claim out of a JWT without verifying the signature. The
/// pool does not hold the platform's signing keys; the claim only seeds the
/// expiry predicate for sessions injected without one.
pub fn jwt_expiry(jwt: &str) -> Option<DateTime<Utc>> {
    let mut validation = Validation::new(Algorithm::RS256);
    validation.algorithms = vec![Algorithm::RS256, Algorithm::HS256, Algorithm::ES256];
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();
    let data = decode::<JwtClaims>(jwt, &DecodingKey::from_secret(&[]), &validation).ok()?;
    let exp = data.claims.exp?;
    Utc.timestamp_opt(exp, 0).single()
}

/// Refresh one session's JWT. Soft-fails with a warn log.
async fn refresh_session(
    client: &reqwest::Client,
    store: &SessionStore,
    config: &RefreshConfig,
    id: &str,
    refresh_token: &str,
) -> bool {
    let Some(endpoint) = config.token_endpoint.as_deref() else {
        return false;
    };
    let mut request = client.post(endpoint).json(&serde_json::json!({
        "grant_type": "refresh_token",
        "refresh_token": refresh_token,
    }));
    if let Some(key) = config.api_key.as_deref() {
        request = request.query(&[("key", key)]);
    }
    let response = match request.send().await {
        Ok(response) if response.status().is_success() => response,
        Ok(response) => {
            warn!(id, status = %response.status(), "token refresh rejected");
            return false;
        }
        Err(err) => {
            warn!(id, %err, "token refresh transport failure");
            return false;
        }
    };
    let parsed: RefreshResponse = match response.json().await {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(id, %err, "token refresh response unparseable");
            return false;
        }
    };
    let expires_at = jwt_expiry(&parsed.id_token);
    store.apply_refresh(id, parsed.id_token, parsed.refresh_token);
    if let Some(expires_at) = expires_at {
        store.with_session(id, |s| s.expires_at = Some(expires_at));
    }
    info!(id, "session token refreshed");
    true
}

/// Periodic refresh of every session that carries a refresh token. Failures
/// leave the prior JWT in place; the health monitor demotes the session if
/// the old token stops working.
pub fn spawn_token_refresh(
    store: Arc<SessionStore>,
    client: reqwest::Client,
    config: RefreshConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if config.token_endpoint.is_none() {
            warn!("token endpoint not configured, refresh task idle");
        }
        let mut ticker = tokio::time::interval(config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let mut refreshed = 0usize;
            for session in store.snapshot() {
                let Some(refresh_token) = session.credentials.refresh_token.clone() else {
                    continue;
                };
                if refresh_session(&client, &store, &config, &session.id, &refresh_token).await {
                    refreshed += 1;
                }
            }
            if refreshed > 0 {
                if let Err(err) = store.save() {
                    warn!(%err, "failed to persist refreshed sessions");
                }
            }
            debug!(refreshed, "token refresh tick finished");
        }
    })
}
