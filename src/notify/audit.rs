//! Delivery audit trail.
//!
//! Every outbound POST is described by an [`HttpLogEntry`] whatever its
//! outcome, and handed to an [`AuditSink`].

use crate::error::Result;
use crate::store::{StoreHandle, DEFAULT_SCAN_PAGE_SIZE};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, info, warn};

/// Resource type under which [`StoreAuditSink`] writes entries.
pub const HTTP_LOG_RESOURCE: &str = "http-log";

/// Audit record of one outbound request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HttpLogEntry {
    pub id: u64,
    pub logger_name: String,
    /// Always "TX" for notifications.
    pub direction: String,
    pub url: String,
    /// Path component of `url`.
    pub endpoint: String,
    pub method: String,
    pub body: String,
    pub resp_body: String,
    /// "500" when no response was received.
    pub resp_code: String,
    pub proc_time_us: u64,
}

impl HttpLogEntry {
    /// Flat field map, as stored in hash entries.
    pub fn fields(&self) -> BTreeMap<String, String> {
        [
            ("id", self.id.to_string()),
            ("logger_name", self.logger_name.clone()),
            ("msg_type", self.direction.clone()),
            ("url", self.url.clone()),
            ("endpoint", self.endpoint.clone()),
            ("method", self.method.clone()),
            ("body", self.body.clone()),
            ("resp_body", self.resp_body.clone()),
            ("resp_code", self.resp_code.clone()),
            ("proc_time", self.proc_time_us.to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }
}

/// Receives audit records. Must not block for long; it runs on the
/// delivering thread.
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: &HttpLogEntry);
}

/// Emits each entry as a structured log event.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, entry: &HttpLogEntry) {
        info!(
            target: "subscription_engine::http_log",
            id = entry.id,
            logger_name = %entry.logger_name,
            direction = %entry.direction,
            method = %entry.method,
            url = %entry.url,
            endpoint = %entry.endpoint,
            resp_code = %entry.resp_code,
            proc_time_us = entry.proc_time_us,
            body = %entry.body,
            resp_body = %entry.resp_body,
            "HTTP notification"
        );
    }
}

/// Keeps the most recent entries in memory.
#[derive(Debug)]
pub struct MemoryAuditSink {
    capacity: usize,
    entries: Mutex<VecDeque<HttpLogEntry>>,
}

impl MemoryAuditSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Oldest first.
    pub fn entries(&self) -> Vec<HttpLogEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, entry: &HttpLogEntry) {
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry.clone());
    }
}

/// Writes entries as hashes at `<namespace>:http-log:<seq>`.
///
/// Sequence numbers continue after the highest one already stored, so a
/// restarted service never merges into earlier records. Only the newest
/// `retention` entries are kept; older ones are deleted as new ones land.
pub struct StoreAuditSink {
    store: StoreHandle,
    retention: usize,
    state: Mutex<StoreAuditState>,
}

struct StoreAuditState {
    next_seq: u64,
    /// Sequence numbers in the store, oldest first.
    kept: VecDeque<u64>,
}

impl StoreAuditSink {
    /// Pick up the entries already in the store and trim them to `retention`.
    pub fn open(store: StoreHandle, retention: usize) -> Result<Self> {
        let prefix = store.prefix(HTTP_LOG_RESOURCE);
        let mut seqs = Vec::new();
        let mut cursor = 0;
        loop {
            let (next, keys) = store.scan(cursor, &prefix, DEFAULT_SCAN_PAGE_SIZE)?;
            seqs.extend(
                keys.iter()
                    .filter_map(|key| key.strip_prefix(&prefix)?.parse::<u64>().ok()),
            );
            if next == 0 {
                break;
            }
            cursor = next;
        }
        seqs.sort_unstable();

        let sink = Self {
            retention: retention.max(1),
            state: Mutex::new(StoreAuditState {
                next_seq: seqs.last().map_or(1, |last| last + 1),
                kept: seqs.into(),
            }),
            store,
        };
        let evicted = sink.evict(&mut sink.state.lock());
        debug!(
            next_seq = sink.state.lock().next_seq,
            evicted, "Store audit sink opened"
        );
        Ok(sink)
    }

    /// Entries currently kept in the store.
    pub fn len(&self) -> usize {
        self.state.lock().kept.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict(&self, state: &mut StoreAuditState) -> usize {
        let mut evicted = 0;
        while state.kept.len() > self.retention {
            let Some(oldest) = state.kept.pop_front() else {
                break;
            };
            let key = self.store.key(HTTP_LOG_RESOURCE, oldest);
            match self.store.delete(&[key.as_str()]) {
                Ok(_) => evicted += 1,
                Err(e) => warn!(key = %key, error = %e, "Failed to evict HTTP log entry"),
            }
        }
        evicted
    }
}

impl AuditSink for StoreAuditSink {
    fn record(&self, entry: &HttpLogEntry) {
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;

        let key = self.store.key(HTTP_LOG_RESOURCE, seq);
        let mut fields = entry.fields();
        fields.insert("id".to_string(), seq.to_string());
        if let Err(e) = self.store.hash_set(&key, &fields) {
            warn!(key = %key, error = %e, "Failed to persist HTTP log entry");
            return;
        }
        state.kept.push_back(seq);
        self.evict(&mut state);
    }
}

/// Fan out to several sinks.
impl AuditSink for Vec<std::sync::Arc<dyn AuditSink>> {
    fn record(&self, entry: &HttpLogEntry) {
        for sink in self {
            sink.record(entry);
        }
    }
}
