use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use slipstream_core::GatewayError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::credit::recovery_tick_period;
use crate::user::User;

#[derive(Debug, serde::Serialize, Deserialize, Default)]
struct UsersFile {
    users: Vec<User>,
}

#[derive(Debug, Deserialize)]
struct BearerClaims {
    sub: String,
}

/// Receipt for a successful credit deduction.
#[derive(Debug, Clone, Copy)]
pub struct CreditReceipt {
    pub cost: f64,
    pub available_after: f64,
}

/// File-backed user table guarded by a single mutex.
///
/// Authentication accepts either a literal bearer token from the table or,
/// when a JWT secret is configured, an HS256 subscription token whose `sub`
/// names a user id. A valid subscription token without a matching user maps
/// to `no_subscription` rather than `unauthorized`.
pub struct UserStore {
    path: PathBuf,
    jwt_secret: Option<String>,
    inner: Mutex<Vec<User>>,
}

impl UserStore {
    pub fn new(path: impl Into<PathBuf>, jwt_secret: Option<String>) -> Self {
        Self {
            path: path.into(),
            jwt_secret,
            inner: Mutex::new(Vec::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<usize, std::io::Error> {
        if !self.path.exists() {
            warn!(path = %self.path.display(), "users file missing, starting empty");
            *self.inner.lock() = Vec::new();
            return Ok(0);
        }
        let raw = fs::read_to_string(&self.path)?;
        let file: UsersFile = serde_json::from_str(&raw)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        let count = file.users.len();
        *self.inner.lock() = file.users;
        info!(count, "user table loaded");
        Ok(count)
    }

    /// Re-read the file, preserving runtime counters for surviving ids.
    pub fn reload(&self) -> Result<usize, std::io::Error> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(self.inner.lock().len())
            }
            Err(err) => return Err(err),
        };
        let file: UsersFile = serde_json::from_str(&raw)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        let mut guard = self.inner.lock();
        let previous: BTreeMap<String, User> =
            guard.drain(..).map(|u| (u.id.clone(), u)).collect();
        *guard = file
            .users
            .into_iter()
            .map(|mut next| {
                if let Some(old) = previous.get(&next.id) {
                    next.used_credits = old.used_credits;
                    next.total_used = old.total_used;
                    next.request_count = old.request_count;
                    next.last_request_at = old.last_request_at;
                    next.last_recovery_at = old.last_recovery_at;
                }
                next
            })
            .collect();
        Ok(guard.len())
    }

    pub fn save(&self) -> Result<(), std::io::Error> {
        let file = UsersFile {
            users: self.inner.lock().clone(),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Resolve a bearer value to a user. Misses are `unauthorized`; a
    /// decodable subscription JWT naming an unknown user is
    /// `no_subscription`.
    pub fn authenticate(&self, bearer: &str) -> Result<User, GatewayError> {
        {
            let guard = self.inner.lock();
            if let Some(user) = guard.iter().find(|u| u.token == bearer) {
                if !user.enabled {
                    return Err(GatewayError::Unauthorized("user disabled".into()));
                }
                return Ok(user.clone());
            }
        }
        if let Some(secret) = self.jwt_secret.as_deref() {
            let mut validation = Validation::new(Algorithm::HS256);
            validation.validate_aud = false;
            if let Ok(data) = decode::<BearerClaims>(
                bearer,
                &DecodingKey::from_secret(secret.as_bytes()),
                &validation,
            ) {
                let guard = self.inner.lock();
                return match guard.iter().find(|u| u.id == data.claims.sub) {
                    Some(user) if user.enabled => Ok(user.clone()),
                    Some(_) => Err(GatewayError::Unauthorized("user disabled".into())),
                    None => Err(GatewayError::NoSubscription),
                };
            }
        }
        Err(GatewayError::Unauthorized("unknown bearer token".into()))
    }

    /// Pre-check and deduction in one critical section. Zero-cost requests
    /// neither deduct nor advance the pacing counters.
    pub fn consume(&self, user_id: &str, cost: f64) -> Result<CreditReceipt, GatewayError> {
        let mut guard = self.inner.lock();
        let Some(user) = guard.iter_mut().find(|u| u.id == user_id) else {
            return Err(GatewayError::Unauthorized("unknown user".into()));
        };
        if cost <= 0.0 {
            return Ok(CreditReceipt {
                cost: 0.0,
                available_after: user.available_credits(),
            });
        }
        let now = Utc::now();
        if user.used_credits + cost > user.credit_limit {
            let next_recovery_min = user
                .next_recovery_in_ms(now)
                .map(|ms| (ms as f64 / 60_000.0).ceil() as i64);
            return Err(GatewayError::CreditsExhausted {
                available: user.available_credits(),
                next_recovery_min,
            });
        }
        user.used_credits += cost;
        user.total_used += cost;
        user.request_count += 1;
        user.last_request_at = Some(now);
        Ok(CreditReceipt {
            cost,
            available_after: user.available_credits(),
        })
    }

    /// Give credits back after an upstream failure. Only called when the
    /// refund flag is on; default behavior keeps the deduction.
    pub fn refund(&self, user_id: &str, cost: f64) {
        if cost <= 0.0 {
            return;
        }
        let mut guard = self.inner.lock();
        if let Some(user) = guard.iter_mut().find(|u| u.id == user_id) {
            user.used_credits = (user.used_credits - cost).max(0.0);
            user.total_used = (user.total_used - cost).max(0.0);
        }
    }

    /// One scan of the recovery scheduler: every user whose interval has
    /// elapsed gets `credit_recovery_amount` back (used clamped at zero).
    pub fn recover_tick(&self) -> usize {
        let now = Utc::now();
        let mut recovered = 0;
        let mut guard = self.inner.lock();
        for user in guard.iter_mut() {
            if user.credit_recovery_amount <= 0.0 || user.credit_recovery_interval_ms == 0 {
                continue;
            }
            let base = match user.last_recovery_at.or(user.created_at) {
                Some(base) => base,
                None => {
                    // first sighting starts the clock
                    user.last_recovery_at = Some(now);
                    continue;
                }
            };
            let interval = chrono::Duration::milliseconds(user.credit_recovery_interval_ms as i64);
            if now - base >= interval {
                user.used_credits = (user.used_credits - user.credit_recovery_amount).max(0.0);
                user.last_recovery_at = Some(now);
                recovered += 1;
            }
        }
        recovered
    }

    pub fn get(&self, id: &str) -> Option<User> {
        self.inner.lock().iter().find(|u| u.id == id).cloned()
    }

    pub fn snapshot(&self) -> Vec<User> {
        self.inner.lock().clone()
    }

    pub fn status_views(&self) -> Vec<serde_json::Value> {
        self.inner.lock().iter().map(User::status_view).collect()
    }

    pub fn recovery_intervals(&self) -> Vec<u64> {
        self.inner
            .lock()
            .iter()
            .map(|u| u.credit_recovery_interval_ms)
            .collect()
    }

    /// Create a user from an admin payload; missing fields fall back to the
    /// trial plan.
    pub fn create(
        &self,
        payload: serde_json::Value,
        trial_credits: f64,
    ) -> Result<User, GatewayError> {
        let name = payload["name"]
            .as_str()
            .ok_or_else(|| GatewayError::BadRequest("name required".into()))?
            .to_string();
        let user = User {
            id: payload["id"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            token: payload["token"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| format!("sk-lab-{}", Uuid::new_v4().simple())),
            name,
            credit_limit: payload["creditLimit"].as_f64().unwrap_or(trial_credits),
            credit_recovery_amount: payload["creditRecoveryAmount"]
                .as_f64()
                .unwrap_or(trial_credits),
            credit_recovery_interval_ms: payload["creditRecoveryIntervalMs"]
                .as_u64()
                .unwrap_or(24 * 3600 * 1000),
            enabled: payload["enabled"].as_bool().unwrap_or(true),
            created_at: Some(Utc::now()),
            note: payload["note"].as_str().map(str::to_string),
            used_credits: 0.0,
            total_used: 0.0,
            request_count: 0,
            last_request_at: None,
            last_recovery_at: None,
        };
        let mut guard = self.inner.lock();
        if guard.iter().any(|u| u.id == user.id || u.token == user.token) {
            return Err(GatewayError::BadRequest("duplicate user id or token".into()));
        }
        guard.push(user.clone());
        Ok(user)
    }

    pub fn update(&self, id: &str, patch: serde_json::Value) -> Result<User, GatewayError> {
        let mut guard = self.inner.lock();
        let user = guard
            .iter_mut()
            .find(|u| u.id == id)
            .ok_or(GatewayError::NotFound)?;
        if let Some(name) = patch["name"].as_str() {
            user.name = name.to_string();
        }
        if let Some(token) = patch["token"].as_str() {
            user.token = token.to_string();
        }
        if let Some(limit) = patch["creditLimit"].as_f64() {
            user.credit_limit = limit;
        }
        if let Some(amount) = patch["creditRecoveryAmount"].as_f64() {
            user.credit_recovery_amount = amount;
        }
        if let Some(interval) = patch["creditRecoveryIntervalMs"].as_u64() {
            user.credit_recovery_interval_ms = interval;
        }
        if let Some(enabled) = patch["enabled"].as_bool() {
            user.enabled = enabled;
        }
        if let Some(note) = patch["note"].as_str() {
            user.note = Some(note.to_string());
        }
        Ok(user.clone())
    }

    pub fn delete(&self, id: &str) -> bool {
        let mut guard = self.inner.lock();
        let before = guard.len();
        guard.retain(|u| u.id != id);
        guard.len() != before
    }

    pub fn reset_credits(&self, id: &str) -> Result<User, GatewayError> {
        let mut guard = self.inner.lock();
        let user = guard
            .iter_mut()
            .find(|u| u.id == id)
            .ok_or(GatewayError::NotFound)?;
        user.used_credits = 0.0;
        Ok(user.clone())
    }

    /// Midnight reset of daily consumption.
    pub fn reset_daily(&self) {
        let mut guard = self.inner.lock();
        for user in guard.iter_mut() {
            user.used_credits = 0.0;
        }
    }

    /// Users whose remaining credits sit under the given threshold.
    pub fn low_credit_views(&self, threshold: f64) -> Vec<serde_json::Value> {
        self.inner
            .lock()
            .iter()
            .filter(|u| u.enabled && u.available_credits() < threshold)
            .map(|u| {
                json!({
                    "id": u.id,
                    "name": u.name,
                    "availableCredits": u.available_credits(),
                })
            })
            .collect()
    }
}

/// Periodic credit recovery: the scan period follows
/// [`recovery_tick_period`] over the configured intervals.
pub fn spawn_recovery(store: Arc<UserStore>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let period = recovery_tick_period(store.recovery_intervals().into_iter());
            tokio::time::sleep(period).await;
            let recovered = store.recover_tick();
            if recovered > 0 {
                info!(recovered, "credit recovery applied");
                if let Err(err) = store.save() {
                    warn!(%err, "failed to persist users after recovery");
                }
            } else {
                debug!("credit recovery tick, nothing due");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use tempfile::tempdir;

    fn seeded_store(jwt_secret: Option<&str>) -> UserStore {
        let store = UserStore::new("unused.json", jwt_secret.map(str::to_string));
        *store.inner.lock() = vec![User {
            id: "u1".into(),
            token: "tok-1".into(),
            name: "alpha".into(),
            credit_limit: 1000.0,
            credit_recovery_amount: 1000.0,
            credit_recovery_interval_ms: 24 * 3600 * 1000,
            enabled: true,
            created_at: Some(Utc::now()),
            note: None,
            used_credits: 0.0,
            total_used: 0.0,
            request_count: 0,
            last_request_at: None,
            last_recovery_at: None,
        }];
        store
    }

    #[test]
    fn authenticates_literal_token() {
        let store = seeded_store(None);
        assert_eq!(store.authenticate("tok-1").unwrap().id, "u1");
        assert!(matches!(
            store.authenticate("tok-x"),
            Err(GatewayError::Unauthorized(_))
        ));
    }

    #[test]
    fn subscription_jwt_resolves_or_reports_no_subscription() {
        let store = seeded_store(Some("topsecret"));
        let token_for = |sub: &str| {
            encode(
                &Header::default(),
                &serde_json::json!({"sub": sub, "exp": Utc::now().timestamp() + 600}),
                &EncodingKey::from_secret(b"topsecret"),
            )
            .unwrap()
        };
        assert_eq!(store.authenticate(&token_for("u1")).unwrap().id, "u1");
        assert!(matches!(
            store.authenticate(&token_for("ghost")),
            Err(GatewayError::NoSubscription)
        ));
    }

    #[test]
    fn consume_is_atomic_with_precheck() {
        let store = seeded_store(None);
        let receipt = store.consume("u1", 999.0).expect("within limit");
        assert_eq!(receipt.available_after, 1.0);

        let err = store.consume("u1", 1.5).expect_err("over limit");
        match err {
            GatewayError::CreditsExhausted { available, .. } => assert_eq!(available, 1.0),
            other => panic!("unexpected error: {other:?}"),
        }
        // failed attempt must not have deducted anything
        assert_eq!(store.get("u1").unwrap().used_credits, 999.0);
    }

    #[test]
    fn zero_cost_does_not_touch_counters() {
        let store = seeded_store(None);
        store.consume("u1", 0.0).expect("free model");
        let user = store.get("u1").unwrap();
        assert_eq!(user.used_credits, 0.0);
        assert_eq!(user.request_count, 0);
        assert!(user.last_request_at.is_none());
    }

    #[test]
    fn recover_tick_honours_interval_and_clamps() {
        let store = seeded_store(None);
        store.consume("u1", 600.0).unwrap();

        // interval not elapsed: nothing recovers
        {
            let mut guard = store.inner.lock();
            guard[0].last_recovery_at = Some(Utc::now() - chrono::Duration::hours(1));
        }
        assert_eq!(store.recover_tick(), 0);
        assert_eq!(store.get("u1").unwrap().used_credits, 600.0);

        // elapsed: recovers and clamps at zero
        {
            let mut guard = store.inner.lock();
            guard[0].last_recovery_at = Some(Utc::now() - chrono::Duration::hours(25));
        }
        assert_eq!(store.recover_tick(), 1);
        let user = store.get("u1").unwrap();
        assert_eq!(user.used_credits, 0.0);
        assert!(user.last_recovery_at.unwrap() > Utc::now() - chrono::Duration::minutes(1));
    }

    #[test]
    fn used_credits_stay_in_bounds_under_mixed_traffic() {
        let store = seeded_store(None);
        for _ in 0..100 {
            let _ = store.consume("u1", 150.0);
            let user = store.get("u1").unwrap();
            assert!(user.used_credits >= 0.0 && user.used_credits <= user.credit_limit);
        }
        store.refund("u1", 10_000.0);
        assert_eq!(store.get("u1").unwrap().used_credits, 0.0);
    }

    #[test]
    fn file_roundtrip_and_reload_preserve_runtime() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("users.json");
        let store = UserStore::new(&path, None);
        *store.inner.lock() = seeded_store(None).snapshot();
        store.consume("u1", 42.0).unwrap();
        store.save().expect("save");

        let fresh = UserStore::new(&path, None);
        fresh.load().expect("load");
        assert_eq!(fresh.get("u1").unwrap().used_credits, 42.0);

        // reload keeps in-memory counters even when the file regresses
        store.consume("u1", 8.0).unwrap();
        store.reload().expect("reload");
        assert_eq!(store.get("u1").unwrap().used_credits, 50.0);
    }

    #[test]
    fn crud_cycle() {
        let store = seeded_store(None);
        let created = store
            .create(json!({"name": "beta", "creditLimit": 500.0}), 1000.0)
            .expect("create");
        assert_eq!(created.credit_limit, 500.0);
        assert!(created.token.starts_with("sk-lab-"));

        let updated = store
            .update(&created.id, json!({"enabled": false}))
            .expect("update");
        assert!(!updated.enabled);

        store.consume("u1", 10.0).unwrap();
        store.reset_credits("u1").expect("reset");
        assert_eq!(store.get("u1").unwrap().used_credits, 0.0);

        assert!(store.delete(&created.id));
        assert!(!store.delete(&created.id));
    }
}
