use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use slipstream_core::{mask_secret, token_fingerprint};

/// One internal bearer-token identity, with its credit plan and runtime
/// consumption counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub token: String,
    pub name: String,
    pub credit_limit: f64,
    pub credit_recovery_amount: f64,
    pub credit_recovery_interval_ms: u64,
    pub enabled: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub note: Option<String>,

    #[serde(default)]
    pub used_credits: f64,
    #[serde(default)]
    pub total_used: f64,
    #[serde(default)]
    pub request_count: u64,
    #[serde(default)]
    pub last_request_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_recovery_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn available_credits(&self) -> f64 {
        (self.credit_limit - self.used_credits).max(0.0)
    }

    pub fn token_hash(&self) -> String {
        token_fingerprint(&self.token)
    }

    /// Milliseconds until this user's next recovery fires, relative to `now`.
    pub fn next_recovery_in_ms(&self, now: DateTime<Utc>) -> Option<i64> {
        if self.credit_recovery_amount <= 0.0 || self.credit_recovery_interval_ms == 0 {
            return None;
        }
        let base = self.last_recovery_at.or(self.created_at)?;
        let due = base + chrono::Duration::milliseconds(self.credit_recovery_interval_ms as i64);
        Some((due - now).num_milliseconds().max(0))
    }

    pub fn status_view(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "name": self.name,
            "token": mask_secret(&self.token),
            "tokenHash": self.token_hash(),
            "creditLimit": self.credit_limit,
            "usedCredits": self.used_credits,
            "availableCredits": self.available_credits(),
            "creditRecoveryAmount": self.credit_recovery_amount,
            "creditRecoveryIntervalMs": self.credit_recovery_interval_ms,
            "enabled": self.enabled,
            "totalUsed": self.total_used,
            "requestCount": self.request_count,
            "lastRequestAt": self.last_request_at,
            "lastRecoveryAt": self.last_recovery_at,
            "createdAt": self.created_at,
            "note": self.note,
        })
    }
}
