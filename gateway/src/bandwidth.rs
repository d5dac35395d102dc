use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

const RING_CAPACITY: usize = 200;
const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct RequestSample {
    at: Instant,
    duration_ms: u64,
    bytes_in: u64,
    bytes_out: u64,
    status: u16,
}

#[derive(Debug, Default)]
struct Totals {
    requests: u64,
    bytes_in: u64,
    bytes_out: u64,
    errors: u64,
}

/// Derived view over the trailing 60 seconds.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BandwidthMetrics {
    pub window_requests: usize,
    pub requests_per_minute: usize,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: u64,
    pub max_latency_ms: u64,
    pub bytes_in_per_sec: f64,
    pub bytes_out_per_sec: f64,
    pub error_rate_pct: f64,
    pub current_concurrent: usize,
    pub smoothness_score: u32,
    pub bucket: &'static str,
    pub total_requests: u64,
    pub total_bytes_in: u64,
    pub total_bytes_out: u64,
    pub total_errors: u64,
}

/// Rolling request telemetry: a 200-slot ring plus cumulative totals and a
/// live concurrency gauge.
pub struct BandwidthTracker {
    ring: Mutex<VecDeque<RequestSample>>,
    totals: Mutex<Totals>,
    concurrent: AtomicUsize,
}

/// RAII concurrency marker, held for the life of one request.
pub struct ConcurrencyToken {
    tracker: Arc<BandwidthTracker>,
}

impl Drop for ConcurrencyToken {
    fn drop(&mut self) {
        self.tracker.concurrent.fetch_sub(1, Ordering::Relaxed);
    }
}

impl BandwidthTracker {
    pub fn new() -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(RING_CAPACITY)),
            totals: Mutex::new(Totals::default()),
            concurrent: AtomicUsize::new(0),
        }
    }

    pub fn begin(self: &Arc<Self>) -> ConcurrencyToken {
        self.concurrent.fetch_add(1, Ordering::Relaxed);
        ConcurrencyToken {
            tracker: Arc::clone(self),
        }
    }

    pub fn current_concurrent(&self) -> usize {
        self.concurrent.load(Ordering::Relaxed)
    }

    pub fn record(&self, duration: Duration, bytes_in: u64, bytes_out: u64, status: u16) {
        let sample = RequestSample {
            at: Instant::now(),
            duration_ms: duration.as_millis() as u64,
            bytes_in,
            bytes_out,
            status,
        };
        {
            let mut ring = self.ring.lock();
            if ring.len() == RING_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(sample);
        }
        let mut totals = self.totals.lock();
        totals.requests += 1;
        totals.bytes_in += bytes_in;
        totals.bytes_out += bytes_out;
        if status >= 400 {
            totals.errors += 1;
        }
    }

    pub fn metrics(&self) -> BandwidthMetrics {
        let now = Instant::now();
        let window: Vec<RequestSample> = {
            let ring = self.ring.lock();
            ring.iter()
                .filter(|s| now.duration_since(s.at) < WINDOW)
                .cloned()
                .collect()
        };
        let totals = {
            let totals = self.totals.lock();
            (
                totals.requests,
                totals.bytes_in,
                totals.bytes_out,
                totals.errors,
            )
        };

        let count = window.len();
        let mut latencies: Vec<u64> = window.iter().map(|s| s.duration_ms).collect();
        latencies.sort_unstable();
        let avg_latency_ms = if count == 0 {
            0.0
        } else {
            latencies.iter().sum::<u64>() as f64 / count as f64
        };
        let p95_latency_ms = percentile(&latencies, 95);
        let max_latency_ms = latencies.last().copied().unwrap_or(0);
        let errors = window.iter().filter(|s| s.status >= 400).count();
        let error_rate_pct = if count == 0 {
            0.0
        } else {
            errors as f64 * 100.0 / count as f64
        };
        let bytes_in: u64 = window.iter().map(|s| s.bytes_in).sum();
        let bytes_out: u64 = window.iter().map(|s| s.bytes_out).sum();
        let current_concurrent = self.current_concurrent();
        let smoothness_score = smoothness(avg_latency_ms, error_rate_pct, current_concurrent);

        BandwidthMetrics {
            window_requests: count,
            requests_per_minute: count,
            avg_latency_ms,
            p95_latency_ms,
            max_latency_ms,
            bytes_in_per_sec: bytes_in as f64 / WINDOW.as_secs_f64(),
            bytes_out_per_sec: bytes_out as f64 / WINDOW.as_secs_f64(),
            error_rate_pct,
            current_concurrent,
            smoothness_score,
            bucket: bucket(smoothness_score),
            total_requests: totals.0,
            total_bytes_in: totals.1,
            total_bytes_out: totals.2,
            total_errors: totals.3,
        }
    }
}

impl Default for BandwidthTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn percentile(sorted: &[u64], pct: usize) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (sorted.len() * pct).div_ceil(100);
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
}

/// Composite 0-100 health indicator over the last minute:
/// 0.4·latency + 0.3·errors + 0.3·concurrency, each sub-score clamped.
pub fn smoothness(avg_latency_ms: f64, error_rate_pct: f64, concurrent: usize) -> u32 {
    let latency_score = (100.0 - avg_latency_ms / 5000.0 * 100.0).clamp(0.0, 100.0);
    let error_score = (100.0 - error_rate_pct * 5.0).clamp(0.0, 100.0);
    let concurrency_score = (100.0 - concurrent as f64 / 50.0 * 100.0).clamp(0.0, 100.0);
    (0.4 * latency_score + 0.3 * error_score + 0.3 * concurrency_score)
        .round()
        .clamp(0.0, 100.0) as u32
}

pub fn bucket(score: u32) -> &'static str {
    if score >= 70 {
        "smooth"
    } else if score >= 40 {
        "moderate"
    } else {
        "congested"
    }
}
