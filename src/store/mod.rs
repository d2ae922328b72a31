//! Document store: JSON entries by key, cursor-based prefix scans and
//! channel publish/subscribe.
//!
//! Two backends implement [`DocumentStore`]:
//! - [`MemoryStore`]: process-local, nothing survives a restart
//! - [`FileStore`]: keyspace rebuilt from an append-only operation log
//!
//! # Example
//!
//! ```ignore
//! let store = connect("memory://test", "sbox1")?;
//! let key = store.key("subscriptions", 1);
//! store.set(&key, &json!({"callbackReference": "http://cb"}))?;
//!
//! store.scan_prefix(&store.prefix("subscriptions"), 50, &mut |key, value| {
//!     println!("{} => {}", key, value);
//!     Ok(())
//! })?;
//! ```

#[cfg(test)]
pub(crate) mod faulty;
mod file;
mod keyspace;
mod memory;
mod pubsub;

pub use file::FileStore;
pub use keyspace::Entry;
pub use memory::MemoryStore;
pub use pubsub::{
    DropReason, Listener, ListenerStop, Message, PubSubBroker, PubSubHandle, Unsubscriber,
    DEFAULT_BUFFER_SIZE, RECEIVE_TIMEOUT,
};

use crate::config::StoreConfig;
use crate::error::{EngineError, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Default number of keys fetched per scan round trip.
pub const DEFAULT_SCAN_PAGE_SIZE: usize = 50;

/// Key/JSON persistence with bounded scans and pub/sub.
///
/// Implementations must tolerate concurrent callers. I/O failures are
/// returned as-is; nothing is retried internally.
pub trait DocumentStore: Send + Sync {
    /// Absent key is `Ok(None)`, not an error.
    fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Upsert; replaces the whole value.
    fn set(&self, key: &str, value: &Value) -> Result<()>;

    /// Delete zero or more keys. Returns how many existed.
    fn delete(&self, keys: &[&str]) -> Result<usize>;

    /// One `SCAN cursor MATCH prefix* COUNT count` round trip.
    ///
    /// Returns the cursor for the next call and the matching keys; a returned
    /// cursor of 0 ends the iteration.
    fn scan(&self, cursor: u64, prefix: &str, count: usize) -> Result<(u64, Vec<String>)>;

    /// Merge fields into the flat field map at `key`.
    fn hash_set(&self, key: &str, fields: &BTreeMap<String, String>) -> Result<()>;

    fn hash_get_all(&self, key: &str) -> Result<Option<BTreeMap<String, String>>>;

    /// Returns how many subscribers received the message.
    fn publish(&self, channel: &str, message: &str) -> Result<usize>;

    fn subscribe(&self, channels: &[&str]) -> Result<PubSubHandle>;

    /// Visit every JSON entry whose key starts with `prefix`.
    ///
    /// Fetches at most about `page_size` keys per round trip. Stops at the
    /// first visitor error and returns it. Entries added or removed during the
    /// scan may or may not be seen; entries present throughout are seen once.
    fn scan_prefix(
        &self,
        prefix: &str,
        page_size: usize,
        visit: &mut dyn FnMut(&str, &Value) -> Result<()>,
    ) -> Result<()> {
        let mut cursor = 0;
        loop {
            let (next, keys) = self.scan(cursor, prefix, page_size)?;
            for key in &keys {
                match self.get(key) {
                    Ok(Some(value)) => visit(key, &value)?,
                    // Deleted since the page was fetched
                    Ok(None) => {}
                    Err(EngineError::WrongType(_)) => {
                        debug!(key = %key, "Skipping non-JSON entry in scan");
                    }
                    Err(e) => return Err(e),
                }
            }
            if next == 0 {
                return Ok(());
            }
            cursor = next;
        }
    }

    /// Delete every key starting with `prefix`, page by page. Not atomic.
    fn flush_prefix(&self, prefix: &str, page_size: usize) -> Result<usize> {
        let mut cursor = 0;
        let mut removed = 0;
        loop {
            let (next, keys) = self.scan(cursor, prefix, page_size)?;
            if !keys.is_empty() {
                let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
                removed += self.delete(&refs)?;
            }
            if next == 0 {
                return Ok(removed);
            }
            cursor = next;
        }
    }
}

/// Connected store plus the tenant namespace its keys live under.
#[derive(Clone)]
pub struct StoreHandle {
    store: Arc<dyn DocumentStore>,
    namespace: String,
}

impl StoreHandle {
    pub fn new(store: Arc<dyn DocumentStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Canonical key `<namespace>:<resourceType>:<id>`.
    pub fn key(&self, resource_type: &str, id: impl Display) -> String {
        format!("{}:{}:{}", self.namespace, resource_type, id)
    }

    /// Scan prefix `<namespace>:<resourceType>:`.
    pub fn prefix(&self, resource_type: &str) -> String {
        format!("{}:{}:", self.namespace, resource_type)
    }

    pub fn backend(&self) -> Arc<dyn DocumentStore> {
        Arc::clone(&self.store)
    }
}

impl Deref for StoreHandle {
    type Target = dyn DocumentStore;

    fn deref(&self) -> &Self::Target {
        self.store.as_ref()
    }
}

/// Backend selected by a store address.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Address {
    Memory(String),
    File(PathBuf),
}

fn parse_address(address: &str) -> Result<Address> {
    let address = address.trim();
    if address.is_empty() {
        return Ok(Address::Memory("default".to_string()));
    }
    if let Some(label) = address.strip_prefix("memory://") {
        return Ok(Address::Memory(label.to_string()));
    }
    if let Some(path) = address.strip_prefix("file://") {
        if path.is_empty() {
            return Err(EngineError::Connection("file:// address without a path".into()));
        }
        return Ok(Address::File(PathBuf::from(path)));
    }
    if address.contains("://") {
        return Err(EngineError::Connection(format!(
            "unsupported store address: {}",
            address
        )));
    }
    Ok(Address::File(PathBuf::from(address)))
}

/// Establish the backing store. Failure here should stop service startup.
pub fn connect(address: &str, namespace: &str) -> Result<StoreHandle> {
    connect_with(&StoreConfig {
        address: address.to_string(),
        namespace: namespace.to_string(),
        ..Default::default()
    })
}

pub fn connect_with(config: &StoreConfig) -> Result<StoreHandle> {
    let store: Arc<dyn DocumentStore> = match parse_address(&config.address)? {
        Address::Memory(label) => Arc::new(MemoryStore::new(label)),
        Address::File(path) => Arc::new(
            FileStore::open_with_compaction(&path, config.compact_after).map_err(|e| match e {
                EngineError::Locked => EngineError::Locked,
                other => EngineError::Connection(format!("{}: {}", path.display(), other)),
            })?,
        ),
    };
    info!(address = %config.address, namespace = %config.namespace, "Store connected");
    Ok(StoreHandle::new(store, config.namespace.clone()))
}
