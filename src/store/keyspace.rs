//! Slotted in-memory keyspace shared by the store backends.
//!
//! Keys are spread over a fixed number of hash slots. A scan cursor is the
//! index of the next slot to visit, so a key that stays put for the whole
//! iteration is returned exactly once no matter what else is inserted or
//! removed meanwhile, and cursor 0 both starts and ends an iteration.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Number of hash slots. Never changes, so keys never move between slots.
pub(crate) const SLOT_COUNT: usize = 4096;

/// Value stored under a key.
#[derive(Clone, Debug, PartialEq)]
pub enum Entry {
    Json(Value),
    Hash(BTreeMap<String, String>),
}

/// A keyspace mutation, as recorded by durable backends.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) enum KeyspaceOp {
    /// JSON document stored as text (MessagePack cannot round-trip every `Value`).
    Set { key: String, json: String },
    HashSet {
        key: String,
        fields: BTreeMap<String, String>,
    },
    Delete { keys: Vec<String> },
}

pub(crate) struct Keyspace {
    slots: Vec<BTreeMap<String, Entry>>,
    len: usize,
}

impl Keyspace {
    pub fn new() -> Self {
        Self {
            slots: vec![BTreeMap::new(); SLOT_COUNT],
            len: 0,
        }
    }

    fn slot_of(key: &str) -> usize {
        crc32fast::hash(key.as_bytes()) as usize % SLOT_COUNT
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn get(&self, key: &str) -> Option<&Entry> {
        self.slots[Self::slot_of(key)].get(key)
    }

    pub fn get_json(&self, key: &str) -> Result<Option<Value>> {
        match self.get(key) {
            None => Ok(None),
            Some(Entry::Json(value)) => Ok(Some(value.clone())),
            Some(Entry::Hash(_)) => Err(EngineError::WrongType(key.to_string())),
        }
    }

    pub fn get_hash(&self, key: &str) -> Result<Option<BTreeMap<String, String>>> {
        match self.get(key) {
            None => Ok(None),
            Some(Entry::Hash(fields)) => Ok(Some(fields.clone())),
            Some(Entry::Json(_)) => Err(EngineError::WrongType(key.to_string())),
        }
    }

    /// Overwrites whatever the key held.
    pub fn set_json(&mut self, key: &str, value: Value) {
        let slot = &mut self.slots[Self::slot_of(key)];
        if slot.insert(key.to_string(), Entry::Json(value)).is_none() {
            self.len += 1;
        }
    }

    /// Merges fields into the hash at `key`, creating it if needed.
    pub fn hash_set(&mut self, key: &str, fields: &BTreeMap<String, String>) -> Result<()> {
        let slot = &mut self.slots[Self::slot_of(key)];
        match slot.get_mut(key) {
            Some(Entry::Hash(existing)) => {
                existing.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            Some(Entry::Json(_)) => return Err(EngineError::WrongType(key.to_string())),
            None => {
                slot.insert(key.to_string(), Entry::Hash(fields.clone()));
                self.len += 1;
            }
        }
        Ok(())
    }

    /// Returns the number of keys that existed.
    pub fn delete(&mut self, keys: &[&str]) -> usize {
        let mut removed = 0;
        for key in keys {
            if self.slots[Self::slot_of(key)].remove(*key).is_some() {
                removed += 1;
            }
        }
        self.len -= removed;
        removed
    }

    /// One round trip of a prefix scan.
    ///
    /// Examines whole slots starting at `cursor` until about `count` keys have
    /// been looked at. A page only exceeds `count` when a single slot holds
    /// more keys than that. Returns the next cursor (0 when done) and the
    /// matching keys.
    pub fn scan(&self, cursor: u64, prefix: &str, count: usize) -> (u64, Vec<String>) {
        let count = count.max(1);
        let mut slot = cursor as usize;
        let mut examined = 0;
        let mut keys = Vec::new();

        while slot < SLOT_COUNT {
            let entries = &self.slots[slot];
            if examined > 0 && examined + entries.len() > count {
                break;
            }
            examined += entries.len();
            keys.extend(entries.keys().filter(|k| k.starts_with(prefix)).cloned());
            slot += 1;
            if examined >= count {
                break;
            }
        }

        if slot >= SLOT_COUNT {
            (0, keys)
        } else {
            (slot as u64, keys)
        }
    }

    /// Fails if `op` would not apply to the current contents.
    pub fn check(&self, op: &KeyspaceOp) -> Result<()> {
        match op {
            KeyspaceOp::HashSet { key, .. } => match self.get(key) {
                Some(Entry::Json(_)) => Err(EngineError::WrongType(key.clone())),
                _ => Ok(()),
            },
            KeyspaceOp::Set { .. } | KeyspaceOp::Delete { .. } => Ok(()),
        }
    }

    pub fn apply(&mut self, op: KeyspaceOp) -> Result<()> {
        match op {
            KeyspaceOp::Set { key, json } => {
                let value = serde_json::from_str(&json)?;
                self.set_json(&key, value);
            }
            KeyspaceOp::HashSet { key, fields } => self.hash_set(&key, &fields)?,
            KeyspaceOp::Delete { keys } => {
                let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
                self.delete(&refs);
            }
        }
        Ok(())
    }

    /// Operations that rebuild the current contents from nothing.
    pub fn snapshot_ops(&self) -> Result<Vec<KeyspaceOp>> {
        let mut ops = Vec::with_capacity(self.len);
        for slot in &self.slots {
            for (key, entry) in slot {
                ops.push(match entry {
                    Entry::Json(value) => KeyspaceOp::Set {
                        key: key.clone(),
                        json: serde_json::to_string(value)?,
                    },
                    Entry::Hash(fields) => KeyspaceOp::HashSet {
                        key: key.clone(),
                        fields: fields.clone(),
                    },
                });
            }
        }
        Ok(ops)
    }
}
