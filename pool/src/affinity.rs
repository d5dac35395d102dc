use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::session::Session;
use crate::store::SessionStore;

/// One client→session binding. Valid while unexpired and while the bound
/// session stays enabled with credits.
#[derive(Debug, Clone)]
pub struct Binding {
    pub session_id: String,
    pub expires_at: Instant,
}

/// Pins clients (keyed by remote address) to sessions so the upstream
/// observes a stable device sequence, while balancing bound counts and
/// draining exhausted sessions.
pub struct AffinityRouter {
    bindings: DashMap<String, Binding>,
    ttl: Duration,
    max_per_session: usize,
}

impl AffinityRouter {
    pub fn new(ttl: Duration, max_per_session: usize) -> Self {
        Self {
            bindings: DashMap::new(),
            ttl,
            max_per_session,
        }
    }

    /// Resolve the session for a client, installing or re-installing a
    /// binding as needed. Returns `None` when the pool has nothing at all.
    pub fn resolve(&self, client_key: &str, store: &SessionStore) -> Option<Session> {
        let now = Instant::now();
        if let Some(mut entry) = self.bindings.get_mut(client_key) {
            if entry.expires_at > now {
                if let Some(session) = store.get(&entry.session_id) {
                    if session.enabled && session.has_credits() {
                        entry.expires_at = now + self.ttl;
                        return Some(session);
                    }
                }
            }
        }
        // miss, expiry, or the bound session became ineligible
        self.bindings.remove(client_key);
        let session = self.select(store)?;
        self.bindings.insert(
            client_key.to_string(),
            Binding {
                session_id: session.id.clone(),
                expires_at: now + self.ttl,
            },
        );
        info!(client = %client_key, session = %session.id, "affinity binding installed");
        Some(session)
    }

    /// Selection: enabled sessions with credits, under the per-session cap,
    /// least-bound first then most credits. Falls back to the most-credited
    /// enabled session, then to the globally least-used one.
    fn select(&self, store: &SessionStore) -> Option<Session> {
        let sessions = store.snapshot();
        let counts = self.bound_counts();

        let mut candidates: Vec<&Session> = sessions
            .iter()
            .filter(|s| s.enabled && s.has_credits())
            .filter(|s| counts.get(s.id.as_str()).copied().unwrap_or(0) < self.max_per_session)
            .collect();
        candidates.sort_by(|a, b| {
            let bound_a = counts.get(a.id.as_str()).copied().unwrap_or(0);
            let bound_b = counts.get(b.id.as_str()).copied().unwrap_or(0);
            bound_a.cmp(&bound_b).then(
                b.credits_remaining
                    .partial_cmp(&a.credits_remaining)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
        });
        if let Some(best) = candidates.first() {
            return Some((*best).clone());
        }

        if let Some(overflow) = sessions
            .iter()
            .filter(|s| s.enabled && s.has_credits())
            .max_by(|a, b| {
                a.credits_remaining
                    .partial_cmp(&b.credits_remaining)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
        {
            debug!(session = %overflow.id, "all candidates at capacity, overflowing onto most-credited session");
            return Some(overflow.clone());
        }

        let last_resort = sessions
            .iter()
            .filter(|s| s.enabled)
            .min_by_key(|s| s.used_tokens)?;
        warn!(session = %last_resort.id, "no session with credits remaining, using least-used session");
        Some(last_resort.clone())
    }

    fn bound_counts(&self) -> HashMap<String, usize> {
        let now = Instant::now();
        let mut counts = HashMap::new();
        for entry in self.bindings.iter() {
            if entry.expires_at > now {
                *counts.entry(entry.session_id.clone()).or_insert(0) += 1;
            }
        }
        counts
    }

    pub fn bound_count(&self, session_id: &str) -> usize {
        self.bound_counts()
            .get(session_id)
            .copied()
            .unwrap_or(0)
    }

    /// Drop every binding for a session (credit depletion, removal, death).
    pub fn evict_session(&self, session_id: &str) -> usize {
        let before = self.bindings.len();
        self.bindings.retain(|_, b| b.session_id != session_id);
        let evicted = before - self.bindings.len();
        if evicted > 0 {
            info!(session = %session_id, evicted, "affinity bindings evicted");
        }
        evicted
    }

    /// Remove expired bindings; run periodically.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.bindings.len();
        self.bindings.retain(|_, b| b.expires_at > now);
        before - self.bindings.len()
    }

    pub fn active_bindings(&self) -> usize {
        let now = Instant::now();
        self.bindings
            .iter()
            .filter(|e| e.expires_at > now)
            .count()
    }

    /// Background sweeper, every five minutes.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(300));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = router.sweep();
                if removed > 0 {
                    debug!(removed, "affinity sweeper removed expired bindings");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Session, SessionCredentials};

    fn store_with(ids: &[&str]) -> SessionStore {
        let store = SessionStore::new("unused.json");
        for id in ids {
            store.add(Session::new(
                *id,
                "windsurf",
                SessionCredentials {
                    api_key: format!("key-{id}"),
                    ..Default::default()
                },
            ));
        }
        store
    }

    #[test]
    fn binding_is_stable_within_ttl() {
        let store = store_with(&["a", "b", "c"]);
        let router = AffinityRouter::new(Duration::from_secs(60), 4);
        let first = router.resolve("10.0.0.1", &store).unwrap();
        for _ in 0..5 {
            assert_eq!(router.resolve("10.0.0.1", &store).unwrap().id, first.id);
        }
    }

    #[test]
    fn capacity_spreads_clients_evenly() {
        let store = store_with(&["a", "b", "c"]);
        let router = AffinityRouter::new(Duration::from_secs(60), 4);
        for i in 0..12 {
            router.resolve(&format!("10.0.0.{i}"), &store).unwrap();
        }
        let mut counts = vec![
            router.bound_count("a"),
            router.bound_count("b"),
            router.bound_count("c"),
        ];
        counts.sort();
        assert_eq!(counts, vec![4, 4, 4]);

        // thirteenth client overflows onto a full session rather than failing
        assert!(router.resolve("10.0.1.1", &store).is_some());
    }

    #[test]
    fn ineligible_session_forces_rebind() {
        let store = store_with(&["a", "b"]);
        let router = AffinityRouter::new(Duration::from_secs(60), 4);
        let bound = router.resolve("10.0.0.1", &store).unwrap();
        store.with_session(&bound.id, |s| s.credits_remaining = 0.0);
        router.evict_session(&bound.id);

        let rebound = router.resolve("10.0.0.1", &store).unwrap();
        assert_ne!(rebound.id, bound.id);
    }

    #[test]
    fn depletion_evicts_every_binding() {
        let store = store_with(&["a"]);
        let router = AffinityRouter::new(Duration::from_secs(60), 8);
        for i in 0..5 {
            router.resolve(&format!("10.0.0.{i}"), &store).unwrap();
        }
        assert_eq!(router.bound_count("a"), 5);
        assert_eq!(router.evict_session("a"), 5);
        assert_eq!(router.active_bindings(), 0);
    }

    #[test]
    fn last_resort_is_least_used_without_credits() {
        let store = store_with(&["a", "b"]);
        store.with_session("a", |s| {
            s.credits_remaining = 0.0;
            s.used_tokens = 5;
        });
        store.with_session("b", |s| {
            s.credits_remaining = 0.0;
            s.used_tokens = 50;
        });
        let router = AffinityRouter::new(Duration::from_secs(60), 4);
        assert_eq!(router.resolve("10.0.0.1", &store).unwrap().id, "a");
    }
}
