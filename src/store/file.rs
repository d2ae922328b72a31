//! Durable document store backed by an append-only operation log.
//!
//! Every mutation is appended to `store.log` (length-prefixed MessagePack
//! with a CRC32 trailer) before it is applied in memory. Opening the store
//! replays the log. A torn or corrupt tail left by a crash is truncated.
//! The log is rewritten as a snapshot by [`FileStore::compact`].

use super::keyspace::{Keyspace, KeyspaceOp};
use super::pubsub::{PubSubBroker, PubSubHandle};
use super::DocumentStore;
use crate::error::{EngineError, Result};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Magic bytes for the operation log.
const LOG_MAGIC: &[u8; 4] = b"DOC\0";

/// Current log format version.
const LOG_VERSION: u8 = 1;

const HEADER_LEN: u64 = 5;

/// Upper bound on a single encoded entry.
const MAX_ENTRY_LEN: usize = 64 * 1024 * 1024;

const LOG_FILE: &str = "store.log";
const COMPACT_FILE: &str = "store.log.compact";
const LOCK_FILE: &str = "LOCK";

struct LogWriter {
    file: File,

    /// Length of the intact log. A failed append is cut back to this.
    len: u64,

    ops_since_compact: u64,
}

/// Document store persisted in a directory.
pub struct FileStore {
    path: PathBuf,

    /// Lock file for exclusive access.
    _lock_file: File,

    keyspace: RwLock<Keyspace>,

    /// Held across validate, append and apply, so log order matches apply
    /// order and every logged op is one that applies.
    log: Mutex<LogWriter>,

    /// Appended ops before an automatic compaction (0 = never).
    compact_after: u64,

    broker: Arc<PubSubBroker>,
}

impl FileStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_compaction(path, 0)
    }

    /// Open or create the store directory.
    pub fn open_with_compaction(path: impl AsRef<Path>, compact_after: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        let lock_file = Self::acquire_lock(&path)?;

        let log_path = path.join(LOG_FILE);
        let mut keyspace = Keyspace::new();
        let replayed = if log_path.exists() {
            Self::replay(&log_path, &mut keyspace)?
        } else {
            Self::write_header(&log_path)?;
            0
        };

        let file = OpenOptions::new().append(true).open(&log_path)?;
        let len = file.metadata()?.len();
        info!(
            path = %path.display(),
            keys = keyspace.len(),
            replayed,
            "File store opened"
        );

        Ok(Self {
            path,
            _lock_file: lock_file,
            keyspace: RwLock::new(keyspace),
            log: Mutex::new(LogWriter {
                file,
                len,
                ops_since_compact: replayed,
            }),
            compact_after,
            broker: PubSubBroker::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.keyspace.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewrite the log so it holds exactly one op per live key.
    pub fn compact(&self) -> Result<()> {
        let mut log = self.log.lock();
        self.compact_locked(&mut log)
    }

    fn compact_locked(&self, log: &mut LogWriter) -> Result<()> {
        let ops = self.keyspace.read().snapshot_ops()?;
        let log_path = self.path.join(LOG_FILE);
        let tmp_path = self.path.join(COMPACT_FILE);

        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            file.write_all(LOG_MAGIC)?;
            file.write_all(&[LOG_VERSION])?;
            let mut writer = BufWriter::new(file);
            for op in &ops {
                writer.write_all(&Self::frame_entry(op, MAX_ENTRY_LEN)?)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &log_path)?;

        log.file = OpenOptions::new().append(true).open(&log_path)?;
        log.len = log.file.metadata()?.len();
        log.ops_since_compact = 0;
        debug!(entries = ops.len(), "Compacted store log");
        Ok(())
    }

    /// Validate, log durably, then apply in memory. Caller holds the log lock.
    fn commit_locked(&self, log: &mut LogWriter, op: KeyspaceOp) -> Result<()> {
        self.keyspace.read().check(&op)?;
        let frame = Self::frame_entry(&op, MAX_ENTRY_LEN)?;

        if let Err(e) = log
            .file
            .write_all(&frame)
            .and_then(|_| log.file.sync_data())
        {
            warn!(len = log.len, error = %e, "Store log append failed, rolling back");
            log.file.set_len(log.len)?;
            return Err(e.into());
        }
        log.len += frame.len() as u64;
        log.ops_since_compact += 1;

        self.keyspace.write().apply(op)?;

        if self.compact_after > 0 && log.ops_since_compact >= self.compact_after {
            self.compact_locked(log)?;
        }
        Ok(())
    }

    fn commit(&self, op: KeyspaceOp) -> Result<()> {
        let mut log = self.log.lock();
        self.commit_locked(&mut log, op)
    }

    fn write_header(log_path: &Path) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(log_path)?;
        file.write_all(LOG_MAGIC)?;
        file.write_all(&[LOG_VERSION])?;
        file.sync_all()?;
        Ok(())
    }

    /// Apply every intact entry. Returns the number applied.
    fn replay(log_path: &Path, keyspace: &mut Keyspace) -> Result<u64> {
        let file = File::open(log_path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != LOG_MAGIC {
            return Err(EngineError::InvalidFormat("Invalid store log magic".into()));
        }

        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != LOG_VERSION {
            return Err(EngineError::InvalidFormat(format!(
                "Unsupported store log version: {}",
                version[0]
            )));
        }

        let mut offset = HEADER_LEN;
        let mut applied = 0;
        while offset < file_len {
            match Self::read_entry(&mut reader) {
                Ok((op, entry_len)) => {
                    match keyspace.apply(op) {
                        Ok(()) => applied += 1,
                        Err(e) => warn!(
                            offset,
                            error = %e,
                            "Skipping store log entry that does not apply"
                        ),
                    }
                    offset += entry_len;
                }
                Err(e) => {
                    warn!(
                        offset,
                        error = %e,
                        "Truncating damaged tail of store log"
                    );
                    OpenOptions::new().write(true).open(log_path)?.set_len(offset)?;
                    break;
                }
            }
        }

        Ok(applied)
    }

    /// Encode one log frame: `len | msgpack | crc32`.
    fn frame_entry(op: &KeyspaceOp, max_len: usize) -> Result<Vec<u8>> {
        let encoded = rmp_serde::to_vec(op)?;
        if encoded.len() > max_len {
            return Err(EngineError::EntryTooLarge {
                len: encoded.len(),
                max: max_len,
            });
        }

        let mut frame = Vec::with_capacity(encoded.len() + 8);
        frame.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
        frame.extend_from_slice(&encoded);
        frame.extend_from_slice(&crc32fast::hash(&encoded).to_le_bytes());
        Ok(frame)
    }

    /// Returns the op and the number of bytes it occupied.
    fn read_entry(reader: &mut BufReader<File>) -> Result<(KeyspaceOp, u64)> {
        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;

        if len > MAX_ENTRY_LEN {
            return Err(EngineError::Corruption("Store log entry too large".into()));
        }

        let mut encoded = vec![0u8; len];
        reader.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let stored = u32::from_le_bytes(checksum_bytes);

        let computed = crc32fast::hash(&encoded);
        if stored != computed {
            return Err(EngineError::ChecksumMismatch {
                expected: stored,
                got: computed,
            });
        }

        let op = rmp_serde::from_slice(&encoded)?;
        Ok((op, 4 + len as u64 + 4))
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_path = path.join(LOCK_FILE);
        let lock_file = File::create(lock_path)?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| EngineError::Locked)?;

        Ok(lock_file)
    }
}

impl DocumentStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        self.keyspace.read().get_json(key)
    }

    fn set(&self, key: &str, value: &Value) -> Result<()> {
        self.commit(KeyspaceOp::Set {
            key: key.to_string(),
            json: serde_json::to_string(value)?,
        })
    }

    fn delete(&self, keys: &[&str]) -> Result<usize> {
        let mut log = self.log.lock();
        // Only log keys that exist; deleting absent keys is a no-op.
        let present: Vec<String> = {
            let keyspace = self.keyspace.read();
            keys.iter()
                .filter(|k| keyspace.get(k).is_some())
                .map(|k| k.to_string())
                .collect()
        };
        if present.is_empty() {
            return Ok(0);
        }
        let removed = present.len();
        self.commit_locked(&mut log, KeyspaceOp::Delete { keys: present })?;
        Ok(removed)
    }

    fn scan(&self, cursor: u64, prefix: &str, count: usize) -> Result<(u64, Vec<String>)> {
        Ok(self.keyspace.read().scan(cursor, prefix, count))
    }

    fn hash_set(&self, key: &str, fields: &BTreeMap<String, String>) -> Result<()> {
        self.commit(KeyspaceOp::HashSet {
            key: key.to_string(),
            fields: fields.clone(),
        })
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
