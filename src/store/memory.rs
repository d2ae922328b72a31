//! Process-local document store.

use super::keyspace::Keyspace;
use super::pubsub::{PubSubBroker, PubSubHandle};
use super::DocumentStore;
use crate::error::Result;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Document store kept entirely in memory.
pub struct MemoryStore {
    label: String,
    keyspace: RwLock<Keyspace>,
    broker: Arc<PubSubBroker>,
}

impl MemoryStore {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            keyspace: RwLock::new(Keyspace::new()),
            broker: PubSubBroker::new(),
        }
    }

    /// Use a custom per-subscriber buffer for pub/sub.
    pub fn with_pubsub_buffer(label: impl Into<String>, buffer_size: usize) -> Self {
        Self {
            label: label.into(),
            keyspace: RwLock::new(Keyspace::new()),
            broker: PubSubBroker::with_buffer_size(buffer_size),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn len(&self) -> usize {
        self.keyspace.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DocumentStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        self.keyspace.read().get_json(key)
    }

    fn set(&self, key: &str, value: &Value) -> Result<()> {
        self.keyspace.write().set_json(key, value.clone());
        Ok(())
    }

    fn delete(&self, keys: &[&str]) -> Result<usize> {
        Ok(self.keyspace.write().delete(keys))
    }

    fn scan(&self, cursor: u64, prefix: &str, count: usize) -> Result<(u64, Vec<String>)> {
        Ok(self.keyspace.read().scan(cursor, prefix, count))
    }

    fn hash_set(&self, key: &str, fields: &BTreeMap<String, String>) -> Result<()> {
        self.keyspace.write().hash_set(key, fields)
    }

    fn hash_get_all(&self, key: &str) -> Result<Option<BTreeMap<String, String>>> {
        self.keyspace.read().get_hash(key)
    }

    fn publish(&self, channel: &str, message: &str) -> Result<usize> {
        Ok(self.broker.publish(channel, message))
    }

    fn subscribe(&self, channels: &[&str]) -> Result<PubSubHandle> {
        Ok(self.broker.subscribe(channels))
    }
}
