use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::session::{DisabledReason, Session, SessionCredentials, SessionStatusView};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// On-disk record shape for `config/sessions.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionRecord {
    id: String,
    platform: String,
    session_token: String,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    pool_name: Option<String>,
    enabled: bool,
    #[serde(default)]
    extra: SessionExtra,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionExtra {
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    firebase_id_token: Option<String>,
    #[serde(default)]
    uid: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

/// Runtime counters persisted alongside the session array so that restarts
/// do not reset accounting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RuntimeSnapshot {
    #[serde(default)]
    disabled_reason: Option<DisabledReason>,
    #[serde(default)]
    consecutive_failures: u32,
    #[serde(default)]
    consecutive_successes: u32,
    #[serde(default)]
    used_requests: u64,
    #[serde(default)]
    used_tokens: u64,
    #[serde(default)]
    daily_limit: Option<u64>,
    #[serde(default)]
    acquired_at: Option<DateTime<Utc>>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    credits_remaining: Option<f64>,
    #[serde(default)]
    credits_total: Option<f64>,
    #[serde(default)]
    requests_served: u64,
    #[serde(default)]
    last_model_seen: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SessionsFile {
    sessions: Vec<SessionRecord>,
    #[serde(default)]
    runtime: BTreeMap<String, RuntimeSnapshot>,
}

/// Result of folding one health-probe outcome into a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    Unchanged,
    Disabled,
    Recovered,
}

#[derive(Debug, Clone, Copy)]
pub struct HealthThresholds {
    pub failure: u32,
    pub recovery: u32,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            failure: 3,
            recovery: 2,
        }
    }
}

/// Insertion-ordered session store guarded by a single mutex.
///
/// Holders never perform network I/O under the lock; callers clone the
/// credentials out and release before dialing.
pub struct SessionStore {
    path: PathBuf,
    inner: Mutex<Vec<Session>>,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            inner: Mutex::new(Vec::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the in-memory set from disk. Missing file loads empty.
    pub fn load(&self) -> Result<usize, StoreError> {
        let sessions = self.read_file()?;
        let count = sessions.len();
        *self.inner.lock() = sessions;
        Ok(count)
    }

    /// Re-read the file but keep runtime counters for ids that survive.
    pub fn reload(&self) -> Result<usize, StoreError> {
        let fresh = self.read_file()?;
        let mut guard = self.inner.lock();
        let previous: BTreeMap<String, Session> =
            guard.drain(..).map(|s| (s.id.clone(), s)).collect();
        *guard = fresh
            .into_iter()
            .map(|mut next| {
                if let Some(old) = previous.get(&next.id) {
                    next.consecutive_failures = old.consecutive_failures;
                    next.consecutive_successes = old.consecutive_successes;
                    next.last_keepalive_at = old.last_keepalive_at;
                    next.last_health_check_at = old.last_health_check_at;
                    next.last_used_at = old.last_used_at;
                    next.used_requests = old.used_requests;
                    next.used_tokens = old.used_tokens;
                    next.credits_remaining = old.credits_remaining;
                    next.credits_total = old.credits_total;
                    next.requests_served = old.requests_served;
                    next.last_model_seen = old.last_model_seen.clone();
                }
                next
            })
            .collect();
        Ok(guard.len())
    }

    fn read_file(&self) -> Result<Vec<Session>, StoreError> {
        if !self.path.exists() {
            warn!(path = %self.path.display(), "sessions file missing, starting empty");
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.path)?;
        let file: SessionsFile = serde_json::from_str(&raw)?;
        Ok(file
            .sessions
            .into_iter()
            .map(|record| {
                let runtime = file.runtime.get(&record.id).cloned().unwrap_or_default();
                session_from_record(record, runtime)
            })
            .collect())
    }

    /// Atomic persist: parent dirs, temp file, rename.
    pub fn save(&self) -> Result<(), StoreError> {
        let file = {
            let guard = self.inner.lock();
            SessionsFile {
                sessions: guard.iter().map(record_from_session).collect(),
                runtime: guard
                    .iter()
                    .map(|s| (s.id.clone(), runtime_from_session(s)))
                    .collect(),
            }
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

    /// Returns false when the id already exists.
    pub fn add(&self, session: Session) -> bool {
        let mut guard = self.inner.lock();
        if guard.iter().any(|s| s.id == session.id) {
            return false;
        }
        info!(id = %session.id, platform = %session.platform, "session registered");
        guard.push(session);
        true
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut guard = self.inner.lock();
        let before = guard.len();
        guard.retain(|s| s.id != id);
        guard.len() != before
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.inner.lock().iter().find(|s| s.id == id).cloned()
    }

    pub fn snapshot(&self) -> Vec<Session> {
        self.inner.lock().clone()
    }

    pub fn status_views(&self) -> Vec<SessionStatusView> {
        self.inner.lock().iter().map(Session::status_view).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Apply a closure to one session under the lock.
    pub fn with_session<T>(&self, id: &str, f: impl FnOnce(&mut Session) -> T) -> Option<T> {
        let mut guard = self.inner.lock();
        guard.iter_mut().find(|s| s.id == id).map(f)
    }

    /// Least-used enabled session, optionally filtered by platform tag.
    pub fn pick(&self, platform: Option<&str>) -> Option<Session> {
        let guard = self.inner.lock();
        guard
            .iter()
            .filter(|s| s.enabled)
            .filter(|s| platform.map_or(true, |p| s.platform == p))
            .min_by_key(|s| s.used_tokens)
            .cloned()
    }

    /// Record token consumption; hitting a configured daily limit disables
    /// the session with `QuotaExhausted` in the same critical section.
    pub fn record_usage(&self, id: &str, tokens: u64) {
        let mut guard = self.inner.lock();
        if let Some(session) = guard.iter_mut().find(|s| s.id == id) {
            session.used_tokens = session.used_tokens.saturating_add(tokens);
            session.used_requests += 1;
            session.last_used_at = Some(Utc::now());
            if let Some(limit) = session.daily_limit {
                if session.enabled && session.used_tokens >= limit {
                    session.disable(DisabledReason::QuotaExhausted);
                    warn!(id = %session.id, limit, "session daily limit reached");
                }
            }
        }
    }

    /// Deduct session credits for one routed request. Returns the remaining
    /// balance, or `None` for an unknown id. Deductions per id are
    /// serialised by the store lock.
    pub fn deduct_credits(&self, id: &str, cost: f64, model: Option<&str>) -> Option<f64> {
        let mut guard = self.inner.lock();
        let session = guard.iter_mut().find(|s| s.id == id)?;
        session.credits_remaining = (session.credits_remaining - cost).max(0.0);
        session.requests_served += 1;
        session.last_used_at = Some(Utc::now());
        if let Some(model) = model {
            session.last_model_seen = Some(model.to_string());
        }
        Some(session.credits_remaining)
    }

    /// Fold a probe outcome into the consecutive counters, disabling or
    /// recovering the session when a threshold is crossed.
    pub fn mark_health(
        &self,
        id: &str,
        healthy: bool,
        thresholds: HealthThresholds,
    ) -> HealthTransition {
        let mut guard = self.inner.lock();
        let Some(session) = guard.iter_mut().find(|s| s.id == id) else {
            return HealthTransition::Unchanged;
        };
        session.last_health_check_at = Some(Utc::now());
        if healthy {
            session.consecutive_failures = 0;
            session.consecutive_successes += 1;
            if !session.enabled
                && session.disabled_reason == Some(DisabledReason::HealthCheckFailed)
                && session.consecutive_successes >= thresholds.recovery
            {
                session.enable();
                return HealthTransition::Recovered;
            }
        } else {
            session.consecutive_successes = 0;
            session.consecutive_failures += 1;
            if session.enabled && session.consecutive_failures >= thresholds.failure {
                session.disable(DisabledReason::HealthCheckFailed);
                return HealthTransition::Disabled;
            }
        }
        HealthTransition::Unchanged
    }

    pub fn mark_keepalive(&self, id: &str, ok: bool) {
        let mut guard = self.inner.lock();
        if let Some(session) = guard.iter_mut().find(|s| s.id == id) {
            session.last_keepalive_at = Some(Utc::now());
            if !ok {
                warn!(id = %session.id, "keepalive failed");
            }
        }
    }

    /// Disable sessions whose expiry predicate fires. Returns affected ids.
    pub fn sweep_expired(&self, max_age: Option<chrono::Duration>) -> Vec<String> {
        let now = Utc::now();
        let mut expired = Vec::new();
        let mut guard = self.inner.lock();
        for session in guard.iter_mut() {
            if session.enabled && session.is_expired(now, max_age) {
                session.disable(DisabledReason::SessionExpired);
                expired.push(session.id.clone());
            }
        }
        expired
    }

    /// Rotate the JWT (and possibly the refresh token) after an identity
    /// provider round-trip.
    pub fn apply_refresh(&self, id: &str, jwt: String, refresh_token: Option<String>) {
        let mut guard = self.inner.lock();
        if let Some(session) = guard.iter_mut().find(|s| s.id == id) {
            session.credentials.jwt = Some(jwt);
            if let Some(refresh_token) = refresh_token {
                session.credentials.refresh_token = Some(refresh_token);
            }
        }
    }

    /// Midnight reset: zero daily token counters and re-enable sessions
    /// whose only disable reason was the daily quota.
    pub fn reset_daily(&self) -> usize {
        let mut guard = self.inner.lock();
        let mut reenabled = 0;
        for session in guard.iter_mut() {
            session.used_tokens = 0;
            if session.disabled_reason == Some(DisabledReason::QuotaExhausted) {
                session.enable();
                reenabled += 1;
            }
        }
        reenabled
    }
}

fn session_from_record(record: SessionRecord, runtime: RuntimeSnapshot) -> Session {
    let api_key = record
        .extra
        .api_key
        .clone()
        .unwrap_or_else(|| record.session_token.clone());
    let mut session = Session::new(
        record.id,
        record.platform,
        SessionCredentials {
            api_key,
            jwt: record.extra.firebase_id_token,
            refresh_token: record.extra.refresh_token,
            device_id: record.extra.uid,
            ..Default::default()
        },
    );
    session.label = record.label;
    session.pool_name = record.pool_name;
    session.email = record.extra.email;
    session.enabled = record.enabled;
    if !record.enabled {
        session.disabled_reason = Some(
            runtime
                .disabled_reason
                .unwrap_or(DisabledReason::DisabledInConfig),
        );
    } else {
        session.disabled_reason = None;
    }
    session.consecutive_failures = runtime.consecutive_failures;
    session.consecutive_successes = runtime.consecutive_successes;
    session.used_requests = runtime.used_requests;
    session.used_tokens = runtime.used_tokens;
    session.daily_limit = runtime.daily_limit;
    if runtime.acquired_at.is_some() {
        session.acquired_at = runtime.acquired_at;
    }
    session.expires_at = runtime.expires_at;
    if let Some(credits) = runtime.credits_remaining {
        session.credits_remaining = credits;
    }
    if let Some(credits) = runtime.credits_total {
        session.credits_total = credits;
    }
    session.requests_served = runtime.requests_served;
    session.last_model_seen = runtime.last_model_seen;
    session
}

fn record_from_session(session: &Session) -> SessionRecord {
    SessionRecord {
        id: session.id.clone(),
        platform: session.platform.clone(),
        session_token: session.credentials.api_key.clone(),
        label: session.label.clone(),
        pool_name: session.pool_name.clone(),
        enabled: session.enabled,
        extra: SessionExtra {
            api_key: Some(session.credentials.api_key.clone()),
            firebase_id_token: session.credentials.jwt.clone(),
            uid: session.credentials.device_id.clone(),
            refresh_token: session.credentials.refresh_token.clone(),
            email: session.email.clone(),
        },
    }
}

fn runtime_from_session(session: &Session) -> RuntimeSnapshot {
    RuntimeSnapshot {
        disabled_reason: session.disabled_reason,
        consecutive_failures: session.consecutive_failures,
        consecutive_successes: session.consecutive_successes,
        used_requests: session.used_requests,
        used_tokens: session.used_tokens,
        daily_limit: session.daily_limit,
        acquired_at: session.acquired_at,
        expires_at: session.expires_at,
        credits_remaining: Some(session.credits_remaining),
        credits_total: Some(session.credits_total),
        requests_served: session.requests_served,
        last_model_seen: session.last_model_seen.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::DEFAULT_SESSION_CREDITS;
    use tempfile::tempdir;

    fn store_with(path: &Path, sessions: Vec<Session>) -> SessionStore {
        let store = SessionStore::new(path);
        for session in sessions {
            store.add(session);
        }
        store
    }

    fn session(id: &str) -> Session {
        Session::new(
            id,
            "windsurf",
            SessionCredentials {
                api_key: format!("key-{id}"),
                jwt: Some(format!("jwt-{id}")),
                refresh_token: Some(format!("rt-{id}")),
                ..Default::default()
            },
        )
    }

    #[test]
    fn save_load_roundtrip_ignoring_runtime() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        let store = store_with(&path, vec![session("a"), session("b")]);
        store.save().expect("save");

        let reloaded = SessionStore::new(&path);
        assert_eq!(reloaded.load().expect("load"), 2);
        let ids: Vec<_> = reloaded.snapshot().iter().map(|s| s.id.clone()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        let restored = reloaded.get("a").unwrap();
        assert_eq!(restored.credentials.api_key, "key-a");
        assert_eq!(restored.credentials.jwt.as_deref(), Some("jwt-a"));
    }

    #[test]
    fn runtime_counters_survive_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        let store = store_with(&path, vec![session("a")]);
        store.record_usage("a", 321);
        store.deduct_credits("a", 2.5, Some("gpt-4o"));
        store.save().expect("save");

        let reloaded = SessionStore::new(&path);
        reloaded.load().expect("load");
        let restored = reloaded.get("a").unwrap();
        assert_eq!(restored.used_tokens, 321);
        assert_eq!(restored.credits_remaining, DEFAULT_SESSION_CREDITS - 2.5);
        assert_eq!(restored.last_model_seen.as_deref(), Some("gpt-4o"));
    }

    #[test]
    fn reload_preserves_runtime_for_surviving_ids() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        let store = store_with(&path, vec![session("a"), session("b")]);
        store.save().expect("seed file");

        store.record_usage("a", 100);
        // rewrite the file without runtime (simulating an external edit that
        // drops "b" and adds "c")
        let external = store_with(&path, vec![session("a"), session("c")]);
        external.save().expect("external rewrite");

        store.reload().expect("reload");
        assert_eq!(store.get("a").unwrap().used_tokens, 100);
        assert!(store.get("b").is_none());
        assert!(store.get("c").is_some());
    }

    #[test]
    fn pick_prefers_least_used_enabled() {
        let dir = tempdir().unwrap();
        let store = store_with(
            &dir.path().join("s.json"),
            vec![session("a"), session("b"), session("c")],
        );
        store.record_usage("a", 50);
        store.record_usage("b", 10);
        store.with_session("c", |s| s.disable(DisabledReason::DisabledInConfig));
        assert_eq!(store.pick(None).unwrap().id, "b");
        assert_eq!(store.pick(Some("windsurf")).unwrap().id, "b");
        assert!(store.pick(Some("other")).is_none());
    }

    #[test]
    fn daily_limit_disables_with_quota_reason() {
        let dir = tempdir().unwrap();
        let store = store_with(&dir.path().join("s.json"), vec![session("a")]);
        store.with_session("a", |s| s.daily_limit = Some(100));
        store.record_usage("a", 99);
        assert!(store.get("a").unwrap().enabled);
        store.record_usage("a", 1);
        let after = store.get("a").unwrap();
        assert!(!after.enabled);
        assert_eq!(after.disabled_reason, Some(DisabledReason::QuotaExhausted));

        assert_eq!(store.reset_daily(), 1);
        let reset = store.get("a").unwrap();
        assert!(reset.enabled);
        assert_eq!(reset.used_tokens, 0);
    }

    #[test]
    fn health_thresholds_disable_and_recover() {
        let dir = tempdir().unwrap();
        let store = store_with(&dir.path().join("s.json"), vec![session("a")]);
        let thresholds = HealthThresholds::default();

        assert_eq!(
            store.mark_health("a", false, thresholds),
            HealthTransition::Unchanged
        );
        assert_eq!(
            store.mark_health("a", false, thresholds),
            HealthTransition::Unchanged
        );
        assert_eq!(
            store.mark_health("a", false, thresholds),
            HealthTransition::Disabled
        );
        assert_eq!(
            store.get("a").unwrap().disabled_reason,
            Some(DisabledReason::HealthCheckFailed)
        );

        assert_eq!(
            store.mark_health("a", true, thresholds),
            HealthTransition::Unchanged
        );
        assert_eq!(
            store.mark_health("a", true, thresholds),
            HealthTransition::Recovered
        );
        assert!(store.get("a").unwrap().enabled);
    }

    #[test]
    fn refresh_rotates_jwt_and_optionally_refresh_token() {
        let dir = tempdir().unwrap();
        let store = store_with(&dir.path().join("s.json"), vec![session("a")]);
        store.apply_refresh("a", "jwt-new".into(), None);
        let session = store.get("a").unwrap();
        assert_eq!(session.credentials.jwt.as_deref(), Some("jwt-new"));
        assert_eq!(session.credentials.refresh_token.as_deref(), Some("rt-a"));

        store.apply_refresh("a", "jwt-newer".into(), Some("rt-rotated".into()));
        let session = store.get("a").unwrap();
        assert_eq!(session.credentials.jwt.as_deref(), Some("jwt-newer"));
        assert_eq!(session.credentials.refresh_token.as_deref(), Some("rt-rotated"));
    }

    #[test]
    fn credits_never_go_negative() {
        let dir = tempdir().unwrap();
        let store = store_with(&dir.path().join("s.json"), vec![session("a")]);
        store.with_session("a", |s| s.credits_remaining = 1.0);
        assert_eq!(store.deduct_credits("a", 5.0, None), Some(0.0));
    }
}
