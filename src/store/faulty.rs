//! Store wrapper that injects delete failures and pauses.

use super::{DocumentStore, MemoryStore, PubSubHandle};
use crate::error::{EngineError, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

pub(crate) struct FaultyStore {
    inner: MemoryStore,
    fail_deletes: AtomicBool,
    pause: Mutex<Option<(Sender<()>, Receiver<()>)>>,
}

impl FaultyStore {
    pub fn new(label: &str) -> Self {
        Self {
            inner: MemoryStore::new(label),
            fail_deletes: AtomicBool::new(false),
            pause: Mutex::new(None),
        }
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// The next delete signals on the first channel once applied, then
    /// waits for a message on the second.
    pub fn pause_next_delete(&self) -> (Receiver<()>, Sender<()>) {
        let (deleted_tx, deleted_rx) = bounded(1);
        let (resume_tx, resume_rx) = bounded(1);
        *self.pause.lock() = Some((deleted_tx, resume_rx));
        (deleted_rx, resume_tx)
    }
}

impl DocumentStore for FaultyStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &Value) -> Result<()> {
        self.inner.set(key, value)
    }

    fn delete(&self, keys: &[&str]) -> Result<usize> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(EngineError::Io(io::Error::new(
                io::ErrorKind::Other,
                "injected delete failure",
            )));
        }
        let removed = self.inner.delete(keys)?;

        let paused = self.pause.lock().take();
        if let Some((deleted, resume)) = paused {
            let _ = deleted.send(());
            let _ = resume.recv();
        }
        Ok(removed)
    }

    fn scan(&self, cursor: u64, prefix: &str, count: usize) -> Result<(u64, Vec<String>)> {
        self.inner.scan(cursor, prefix, count)
    }

    fn hash_set(&self, key: &str, fields: &BTreeMap<String, String>) -> Result<()> {
        self.inner.hash_set(key, fields)
    }

    fn hash_get_all(&self, key: &str) -> Result<Option<BTreeMap<String, String>>> {
        self.inner.hash_get_all(key)
    }

    fn publish(&self, channel: &str, message: &str) -> Result<usize> {
        self.inner.publish(channel, message)
    }

    fn subscribe(&self, channels: &[&str]) -> Result<PubSubHandle> {
        self.inner.subscribe(channels)
    }
}
