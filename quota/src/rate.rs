use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use slipstream_core::GatewayError;

const WINDOW: Duration = Duration::from_secs(60);

/// Sliding 60-second window of request instants per bearer token.
///
/// The cap-th request inside the window passes; the cap-plus-one-th is
/// rejected. Keys are token fingerprints, never raw tokens.
pub struct RateLimiter {
    cap: usize,
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(cap: u32) -> Self {
        Self {
            cap: cap as usize,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, token_fingerprint: &str) -> Result<(), GatewayError> {
        self.check_at(token_fingerprint, Instant::now())
    }

    fn check_at(&self, token_fingerprint: &str, now: Instant) -> Result<(), GatewayError> {
        let mut windows = self.windows.lock();
        let window = windows.entry(token_fingerprint.to_string()).or_default();
        while let Some(front) = window.front() {
            if now.duration_since(*front) >= WINDOW {
                window.pop_front();
            } else {
                break;
            }
        }
        if window.len() >= self.cap {
            return Err(GatewayError::RateLimited);
        }
        window.push_back(now);
        Ok(())
    }

    /// Requests recorded in the current window for a token.
    pub fn current(&self, token_fingerprint: &str) -> usize {
        let now = Instant::now();
        self.windows
            .lock()
            .get(token_fingerprint)
            .map(|w| {
                w.iter()
                    .filter(|t| now.duration_since(**t) < WINDOW)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Drop windows that have gone fully idle.
    pub fn prune(&self) {
        let now = Instant::now();
        self.windows.lock().retain(|_, window| {
            window
                .back()
                .map(|t| now.duration_since(*t) < WINDOW)
                .unwrap_or(false)
        });
    }
}
