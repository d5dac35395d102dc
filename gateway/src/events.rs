use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// How a request was routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventMode {
    Platform,
    PlatformStream,
    Upstream,
    UpstreamStream,
    Simulate,
    WindsurfProxy,
}

/// One append-only audit record per gateway request.
///
/// Bearer tokens appear only as their 12-hex SHA-256 fingerprint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_hash: Option<String>,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credit_cost: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub mode: EventMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl EventRecord {
    pub fn new(method: &str, path: &str, ip: &str, mode: EventMode, status: u16) -> Self {
        Self {
            seq: 0,
            timestamp: Utc::now(),
            method: method.to_string(),
            path: path.to_string(),
            ip: ip.to_string(),
            token_hash: None,
            status,
            session_id: None,
            user_name: None,
            model: None,
            prompt_tokens: None,
            credit_cost: None,
            tags: Vec::new(),
            mode,
            reason: None,
        }
    }
}

/// Bounded FIFO of event records, appended in arrival order.
pub struct EventLog {
    retention: usize,
    inner: Mutex<EventLogInner>,
}

struct EventLogInner {
    next_seq: u64,
    ring: VecDeque<EventRecord>,
}

impl EventLog {
    pub fn new(retention: usize) -> Self {
        Self {
            retention: retention.max(1),
            inner: Mutex::new(EventLogInner {
                next_seq: 0,
                ring: VecDeque::new(),
            }),
        }
    }

    /// Append at arrival; returns the sequence number so later pipeline
    /// stages (e.g. a finished stream) can enrich the record in place.
    pub fn append(&self, mut record: EventRecord) -> u64 {
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        record.seq = seq;
        inner.ring.push_back(record);
        while inner.ring.len() > self.retention {
            inner.ring.pop_front();
        }
        seq
    }

    /// Enrich a record still inside the retention window.
    pub fn update(&self, seq: u64, f: impl FnOnce(&mut EventRecord)) {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.ring.iter_mut().find(|r| r.seq == seq) {
            f(record);
        }
    }

    /// Newest `limit` records, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<EventRecord> {
        let inner = self.inner.lock();
        let skip = inner.ring.len().saturating_sub(limit);
        inner.ring.iter().skip(skip).cloned().collect()
    }

    /// Records from the trailing window.
    pub fn since(&self, window: Duration) -> Vec<EventRecord> {
        let cutoff = Utc::now() - window;
        self.inner
            .lock()
            .ring
            .iter()
            .filter(|r| r.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().ring.is_empty()
    }
}
