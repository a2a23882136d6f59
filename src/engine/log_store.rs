//! TICKVAULT - Append-Only Log Store
//! Durable key/value persistence with overwrite-by-append semantics.
//!
//! ## Layout
//! One data file per store directory. Every `put` and `delete` appends a
//! record; nothing is ever rewritten in place. An in-memory index maps each
//! live key to the offset of its most recent record and is rebuilt on open
//! by replaying the file from offset 0.
//!
//! ## Concurrency Model
//! - `get`, `list_keys`, `len`, `stats` take a **read lock** (shared)
//! - `put`, `delete`, `replay` take a **write lock** (exclusive)

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use crate::config::LOG_FILE_NAME;
use crate::error::{Result, TickError};
use crate::types::{Key, Mark, Record, Value};

use super::record;

/// Point-in-time size figures for a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    /// Keys currently present in the index.
    pub live_keys: usize,
    /// Records (PUT and DEL) physically present in the file.
    pub total_records: u64,
    /// Logical end of the file in bytes.
    pub file_size: u64,
}

impl StoreStats {
    /// Fraction of records that no longer back a live key.
    pub fn garbage_ratio(&self) -> f64 {
        if self.total_records == 0 {
            return 0.0;
        }
        1.0 - self.live_keys as f64 / self.total_records as f64
    }
}

struct StoreInner {
    /// Path of the data file.
    path: PathBuf,
    /// File handle opened for reading and appending.
    file: File,
    /// Key -> offset of its latest PUT record.
    index: HashMap<Key, u64>,
    /// Logical end of the log; the next record lands here.
    write_offset: u64,
    total_records: u64,
}

/// Append-only key/value store with an in-memory offset index.
pub struct LogStore {
    inner: RwLock<StoreInner>,
    sync_writes: bool,
}

impl LogStore {
    /// Open or create a store in `dir`, replaying the existing log.
    pub fn open(dir: impl AsRef<Path>, sync_writes: bool) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(LOG_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let store = Self {
            inner: RwLock::new(StoreInner {
                path,
                file,
                index: HashMap::new(),
                write_offset: 0,
                total_records: 0,
            }),
            sync_writes,
        };
        store.replay()?;
        Ok(store)
    }

    /// Rebuild the index by reading every record from offset 0.
    ///
    /// A PUT records its offset under the key, a DEL removes the key. A torn
    /// final record is cut off so later appends stay reachable. A damaged
    /// record with more data after it fails with `Corruption` and leaves the
    /// file untouched. Returns the number of records replayed.
    pub fn replay(&self) -> Result<u64> {
        let mut inner = self.inner.write();
        let file_len = inner.file.metadata()?.len();

        let mut index = HashMap::new();
        let mut offset = 0u64;
        let mut records = 0u64;
        while offset < file_len {
            let torn = match record::read_at(&inner.file, offset, file_len) {
                Ok((rec, size)) => {
                    match rec.mark {
                        Mark::Put => {
                            index.insert(rec.key, offset);
                        }
                        Mark::Del => {
                            index.remove(&rec.key);
                        }
                    }
                    offset += size;
                    records += 1;
                    continue;
                }
                Err(err @ TickError::EndOfData { .. }) => err,
                // a bad checksum on the last record is a write that never completed
                Err(err @ TickError::Corruption(_))
                    if record::claimed_len(&inner.file, offset, file_len)
                        == Some(file_len - offset) =>
                {
                    err
                }
                Err(err) => {
                    log::error!("Refusing to replay {:?}: {}", inner.path, err);
                    return Err(err);
                }
            };
            log::warn!(
                "Truncating {:?} at offset {} ({} trailing bytes): {}",
                inner.path,
                offset,
                file_len - offset,
                torn
            );
            inner.file.set_len(offset)?;
            break;
        }

        log::debug!(
            "Replayed {} records from {:?} ({} live keys)",
            records,
            inner.path,
            index.len()
        );
        inner.index = index;
        inner.write_offset = offset;
        inner.total_records = records;
        Ok(records)
    }

    /// Append a PUT record and point the index at it.
    /// An empty key is ignored.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Ok(());
        }
        let rec = Record::put(key.to_vec(), value.to_vec());
        let mut inner = self.inner.write();
        let offset = self.append(&mut inner, &rec)?;
        inner.index.insert(rec.key, offset);
        Ok(())
    }

    /// Read the latest value stored under `key`.
    ///
    /// `Ok(None)` when the key is empty or absent; `EndOfData` when the
    /// indexed record runs past the logical end of the file.
    pub fn get(&self, key: &[u8]) -> Result<Option<Value>> {
        if key.is_empty() {
            return Ok(None);
        }
        let inner = self.inner.read();
        let offset = match inner.index.get(key) {
            Some(&offset) => offset,
            None => return Ok(None),
        };
        let (rec, _) = record::read_at(&inner.file, offset, inner.write_offset)?;
        Ok(rec.value)
    }

    /// Append a DEL record and drop the key from the index.
    /// Deleting an empty or absent key is a no-op.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.write();
        if !inner.index.contains_key(key) {
            return Ok(());
        }
        let rec = Record::delete(key.to_vec());
        self.append(&mut inner, &rec)?;
        inner.index.remove(key);
        Ok(())
    }

    /// Snapshot of every indexed key, in no particular order.
    pub fn list_keys(&self) -> Vec<Key> {
        self.inner.read().index.keys().cloned().collect()
    }

    /// Returns true if `key` is currently indexed.
    pub fn contains(&self, key: &[u8]) -> bool {
        self.inner.read().index.contains_key(key)
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.inner.read().index.len()
    }

    /// Returns true if no key is live.
    pub fn is_empty(&self) -> bool {
        self.inner.read().index.is_empty()
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.read();
        StoreStats {
            live_keys: inner.index.len(),
            total_records: inner.total_records,
            file_size: inner.write_offset,
        }
    }

    /// Copy of the key -> offset index.
    pub fn index_snapshot(&self) -> HashMap<Key, u64> {
        self.inner.read().index.clone()
    }

    /// Path of the data file.
    pub fn path(&self) -> PathBuf {
        self.inner.read().path.clone()
    }

    /// Flush file contents and metadata to disk.
    pub(crate) fn sync(&self) -> Result<()> {
        self.inner.read().file.sync_all()?;
        Ok(())
    }

    /// Point the store at `dir` after its directory was renamed.
    /// The open file handle follows the rename.
    pub(crate) fn relocate(&self, dir: &Path) {
        self.inner.write().path = dir.join(LOG_FILE_NAME);
    }

    /// Write one record at the logical end; returns its offset.
    /// A failed write is rolled back so the tail stays replayable.
    fn append(&self, inner: &mut StoreInner, rec: &Record) -> Result<u64> {
        let encoded = record::encode(rec);
        let offset = inner.write_offset;
        let written = inner.file.write_all(&encoded).and_then(|()| {
            if self.sync_writes {
                inner.file.sync_data()
            } else {
                Ok(())
            }
        });
        if let Err(err) = written {
            if let Err(rollback) = inner.file.set_len(offset) {
                log::error!(
                    "Failed to roll back partial append at offset {}: {}",
                    offset,
                    rollback
                );
            }
            return Err(err.into());
        }
        inner.write_offset += encoded.len() as u64;
        inner.total_records += 1;
        Ok(offset)
    }
}
