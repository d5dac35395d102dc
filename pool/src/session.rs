use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use slipstream_core::mask_secret;

/// Credits granted to a freshly injected session when the operator does not
/// say otherwise.
pub const DEFAULT_SESSION_CREDITS: f64 = 1000.0;

/// Why a session is currently out of rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisabledReason {
    DisabledInConfig,
    QuotaExhausted,
    SessionExpired,
    HealthCheckFailed,
}

/// Mutable credentials owned by a session. Harvested externally and injected
/// as already-valid material; the pool only rotates the JWT via refresh.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCredentials {
    pub api_key: String,
    #[serde(default)]
    pub jwt: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub editor_version: Option<String>,
    #[serde(default)]
    pub locale: Option<String>,
    #[serde(default)]
    pub os_tag: Option<String>,
    #[serde(default)]
    pub machine_id: Option<String>,
}

/// One harvested platform session: immutable identity, credentials, runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub platform: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub pool_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    pub credentials: SessionCredentials,

    pub enabled: bool,
    #[serde(default)]
    pub disabled_reason: Option<DisabledReason>,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub consecutive_successes: u32,
    #[serde(default)]
    pub last_keepalive_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_health_check_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub used_requests: u64,
    #[serde(default)]
    pub used_tokens: u64,
    #[serde(default)]
    pub daily_limit: Option<u64>,
    #[serde(default)]
    pub acquired_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default = "default_credits")]
    pub credits_remaining: f64,
    #[serde(default = "default_credits")]
    pub credits_total: f64,
    #[serde(default)]
    pub requests_served: u64,
    #[serde(default)]
    pub last_model_seen: Option<String>,
}

fn default_credits() -> f64 {
    DEFAULT_SESSION_CREDITS
}

impl Session {
    pub fn new(id: impl Into<String>, platform: impl Into<String>, credentials: SessionCredentials) -> Self {
        Self {
            id: id.into(),
            platform: platform.into(),
            label: None,
            pool_name: None,
            email: None,
            credentials,
            enabled: true,
            disabled_reason: None,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_keepalive_at: None,
            last_health_check_at: None,
            last_used_at: None,
            used_requests: 0,
            used_tokens: 0,
            daily_limit: None,
            acquired_at: Some(Utc::now()),
            expires_at: None,
            credits_remaining: DEFAULT_SESSION_CREDITS,
            credits_total: DEFAULT_SESSION_CREDITS,
            requests_served: 0,
            last_model_seen: None,
        }
    }

    /// Bearer value used on the wire towards the platform: the JWT when the
    /// session has one, otherwise the API key.
    pub fn bearer(&self) -> &str {
        self.credentials
            .jwt
            .as_deref()
            .unwrap_or(&self.credentials.api_key)
    }

    /// Disabling and the reason are set together; enabling clears the reason.
    pub fn disable(&mut self, reason: DisabledReason) {
        self.enabled = false;
        self.disabled_reason = Some(reason);
    }

    pub fn enable(&mut self) {
        self.enabled = true;
        self.disabled_reason = None;
    }

    /// Expiry is a predicate, not a stored state: an explicit `expires_at` in
    /// the past, or age beyond `max_age` when one is configured.
    pub fn is_expired(&self, now: DateTime<Utc>, max_age: Option<Duration>) -> bool {
        if let Some(expires_at) = self.expires_at {
            if expires_at < now {
                return true;
            }
        }
        if let (Some(acquired_at), Some(max_age)) = (self.acquired_at, max_age) {
            if acquired_at + max_age < now {
                return true;
            }
        }
        false
    }

    pub fn has_credits(&self) -> bool {
        self.credits_remaining > 0.0
    }

    pub fn status_view(&self) -> SessionStatusView {
        SessionStatusView {
            id: self.id.clone(),
            platform: self.platform.clone(),
            label: self.label.clone(),
            pool_name: self.pool_name.clone(),
            email: self.email.clone(),
            api_key: mask_secret(&self.credentials.api_key),
            jwt: self.credentials.jwt.as_deref().map(mask_secret),
            enabled: self.enabled,
            disabled_reason: self.disabled_reason,
            consecutive_failures: self.consecutive_failures,
            consecutive_successes: self.consecutive_successes,
            last_keepalive_at: self.last_keepalive_at,
            last_health_check_at: self.last_health_check_at,
            last_used_at: self.last_used_at,
            used_requests: self.used_requests,
            used_tokens: self.used_tokens,
            credits_remaining: self.credits_remaining,
            credits_total: self.credits_total,
            requests_served: self.requests_served,
            expires_at: self.expires_at,
            last_model_seen: self.last_model_seen.clone(),
        }
    }
}

/// Admin-facing projection; credentials are masked to their last four
/// characters, never exposed whole.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusView {
    pub id: String,
    pub platform: String,
    pub label: Option<String>,
    pub pool_name: Option<String>,
    pub email: Option<String>,
    pub api_key: String,
    pub jwt: Option<String>,
    pub enabled: bool,
    pub disabled_reason: Option<DisabledReason>,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_keepalive_at: Option<DateTime<Utc>>,
    pub last_health_check_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub used_requests: u64,
    pub used_tokens: u64,
    pub credits_remaining: f64,
    pub credits_total: f64,
    pub requests_served: u64,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_model_seen: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(
            "s1",
            "windsurf",
            SessionCredentials {
                api_key: "key-123456".into(),
                jwt: Some("jwt-abcdef".into()),
                ..Default::default()
            },
        )
    }

    #[test]
    fn bearer_prefers_jwt() {
        let mut s = session();
        assert_eq!(s.bearer(), "jwt-abcdef");
        s.credentials.jwt = None;
        assert_eq!(s.bearer(), "key-123456");
    }

    #[test]
    fn disable_sets_reason_atomically() {
        let mut s = session();
        s.disable(DisabledReason::HealthCheckFailed);
        assert!(!s.enabled);
        assert_eq!(s.disabled_reason, Some(DisabledReason::HealthCheckFailed));
        s.enable();
        assert!(s.enabled);
        assert!(s.disabled_reason.is_none());
    }

    #[test]
    fn expiry_predicate_covers_both_clocks() {
        let mut s = session();
        let now = Utc::now();
        assert!(!s.is_expired(now, None));

        s.expires_at = Some(now - Duration::seconds(1));
        assert!(s.is_expired(now, None));

        s.expires_at = None;
        s.acquired_at = Some(now - Duration::hours(10));
        assert!(s.is_expired(now, Some(Duration::hours(8))));
        assert!(!s.is_expired(now, Some(Duration::hours(12))));
    }

    #[test]
    fn status_view_masks_credentials() {
        let view = session().status_view();
        assert_eq!(view.api_key, "****3456");
        assert_eq!(view.jwt.as_deref(), Some("****cdef"));
    }
}
