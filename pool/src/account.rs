use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use slipstream_core::mask_secret;
use tracing::{info, warn};

use crate::session::DisabledReason;
use crate::store::{HealthThresholds, HealthTransition, StoreError};

/// One OpenAI-compatible upstream account from the local pool.
///
/// Accounts are the non-platform leg of `/v1/chat/completions`: a stored API
/// key plus base URL, with daily token accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamAccount {
    pub id: String,
    #[serde(default)]
    pub label: Option<String>,
    pub api_key: String,
    pub base_url: String,
    #[serde(default)]
    pub model: Option<String>,
    pub enabled: bool,
    #[serde(default)]
    pub disabled_reason: Option<DisabledReason>,
    #[serde(default)]
    pub daily_limit: Option<u64>,
    #[serde(default)]
    pub used_tokens: u64,
    #[serde(default)]
    pub used_requests: u64,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub consecutive_successes: u32,
    #[serde(default)]
    pub last_health_check_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
}

impl UpstreamAccount {
    pub fn disable(&mut self, reason: DisabledReason) {
        self.enabled = false;
        self.disabled_reason = Some(reason);
    }

    pub fn enable(&mut self) {
        self.enabled = true;
        self.disabled_reason = None;
    }

    pub fn status_view(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "label": self.label,
            "apiKey": mask_secret(&self.api_key),
            "baseUrl": self.base_url,
            "model": self.model,
            "enabled": self.enabled,
            "disabledReason": self.disabled_reason,
            "dailyLimit": self.daily_limit,
            "usedTokens": self.used_tokens,
            "usedRequests": self.used_requests,
            "lastHealthCheckAt": self.last_health_check_at,
            "lastUsedAt": self.last_used_at,
        })
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AccountsFile {
    accounts: Vec<UpstreamAccount>,
}

/// File-backed pool of upstream accounts. Same locking discipline as the
/// session store.
pub struct AccountStore {
    path: PathBuf,
    default_daily_limit: Option<u64>,
    inner: Mutex<Vec<UpstreamAccount>>,
}

impl AccountStore {
    pub fn new(path: impl Into<PathBuf>, default_daily_limit: Option<u64>) -> Self {
        Self {
            path: path.into(),
            default_daily_limit,
            inner: Mutex::new(Vec::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<usize, StoreError> {
        if !self.path.exists() {
            warn!(path = %self.path.display(), "account pool file missing, starting empty");
            *self.inner.lock() = Vec::new();
            return Ok(0);
        }
        let raw = fs::read_to_string(&self.path)?;
        let file: AccountsFile = serde_json::from_str(&raw)?;
        let mut accounts = file.accounts;
        for account in &mut accounts {
            if account.daily_limit.is_none() {
                account.daily_limit = self.default_daily_limit;
            }
        }
        let count = accounts.len();
        *self.inner.lock() = accounts;
        info!(count, "account pool loaded");
        Ok(count)
    }

    pub fn save(&self) -> Result<(), StoreError> {
        let file = AccountsFile {
            accounts: self.inner.lock().clone(),
        };
        let json = serde_json::to_string_pretty(&file)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn snapshot(&self) -> Vec<UpstreamAccount> {
        self.inner.lock().clone()
    }

    pub fn status_views(&self) -> Vec<serde_json::Value> {
        self.inner
            .lock()
            .iter()
            .map(UpstreamAccount::status_view)
            .collect()
    }

    /// Least-used enabled account.
    pub fn pick(&self) -> Option<UpstreamAccount> {
        self.inner
            .lock()
            .iter()
            .filter(|a| a.enabled)
            .min_by_key(|a| a.used_tokens)
            .cloned()
    }

    pub fn record_usage(&self, id: &str, tokens: u64) {
        let mut guard = self.inner.lock();
        if let Some(account) = guard.iter_mut().find(|a| a.id == id) {
            account.used_tokens = account.used_tokens.saturating_add(tokens);
            account.used_requests += 1;
            account.last_used_at = Some(Utc::now());
            if let Some(limit) = account.daily_limit {
                if account.enabled && limit > 0 && account.used_tokens >= limit {
                    account.disable(DisabledReason::QuotaExhausted);
                    warn!(id = %account.id, limit, "account daily limit reached");
                }
            }
        }
    }

    pub fn mark_health(
        &self,
        id: &str,
        healthy: bool,
        thresholds: HealthThresholds,
    ) -> HealthTransition {
        let mut guard = self.inner.lock();
        let Some(account) = guard.iter_mut().find(|a| a.id == id) else {
            return HealthTransition::Unchanged;
        };
        account.last_health_check_at = Some(Utc::now());
        if healthy {
            account.consecutive_failures = 0;
            account.consecutive_successes += 1;
            if !account.enabled
                && account.disabled_reason == Some(DisabledReason::HealthCheckFailed)
                && account.consecutive_successes >= thresholds.recovery
            {
                account.enable();
                return HealthTransition::Recovered;
            }
        } else {
            account.consecutive_successes = 0;
            account.consecutive_failures += 1;
            if account.enabled && account.consecutive_failures >= thresholds.failure {
                account.disable(DisabledReason::HealthCheckFailed);
                return HealthTransition::Disabled;
            }
        }
        HealthTransition::Unchanged
    }

    pub fn reset_daily(&self) -> usize {
        let mut guard = self.inner.lock();
        let mut reenabled = 0;
        for account in guard.iter_mut() {
            account.used_tokens = 0;
            if account.disabled_reason == Some(DisabledReason::QuotaExhausted) {
                account.enable();
                reenabled += 1;
            }
        }
        reenabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn account(id: &str, used: u64) -> UpstreamAccount {
        UpstreamAccount {
            id: id.into(),
            label: None,
            api_key: format!("sk-{id}-123456"),
            base_url: "https://api.example.com/v1".into(),
            model: None,
            enabled: true,
            disabled_reason: None,
            daily_limit: None,
            used_tokens: used,
            used_requests: 0,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_health_check_at: None,
            last_used_at: None,
        }
    }

    #[test]
    fn load_applies_default_daily_limit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("accounts.json");
        let seed = AccountsFile {
            accounts: vec![account("a", 0)],
        };
        fs::write(&path, serde_json::to_string(&seed).unwrap()).unwrap();

        let store = AccountStore::new(&path, Some(5000));
        store.load().expect("load");
        assert_eq!(store.snapshot()[0].daily_limit, Some(5000));
    }

    #[test]
    fn pick_is_least_used() {
        let store = AccountStore::new("unused.json", None);
        *store.inner.lock() = vec![account("a", 30), account("b", 10)];
        assert_eq!(store.pick().unwrap().id, "b");
    }

    #[test]
    fn usage_hits_limit_and_resets() {
        let store = AccountStore::new("unused.json", None);
        let mut a = account("a", 0);
        a.daily_limit = Some(10);
        *store.inner.lock() = vec![a];
        store.record_usage("a", 10);
        assert!(!store.snapshot()[0].enabled);
        assert_eq!(store.reset_daily(), 1);
        assert!(store.snapshot()[0].enabled);
        assert_eq!(store.snapshot()[0].used_tokens, 0);
    }

    #[test]
    fn status_view_masks_key() {
        let view = account("a", 0).status_view();
        assert_eq!(view["apiKey"], "****3456");
    }
}
