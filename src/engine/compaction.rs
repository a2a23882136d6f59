//! TICKVAULT - Online Compaction
//! Rewrites the live log into a fresh file while triggers keep being
//! registered and fired.
//!
//! ## Protocol
//! 1. Open an empty successor store in the sibling `<data_dir>.compact`
//! 2. Under the scheduler write lock: raise the compaction flag and
//!    snapshot the live keys. Every mutation from here on is applied to
//!    the old store *and* recorded in the write buffer
//! 3. Copy each snapshotted key's current value into the successor,
//!    skipping keys that disappeared meanwhile
//! 4. Drain the write buffer into the successor, in recorded order
//! 5. Under the scheduler write lock: drain what arrived during step 4,
//!    sync the successor and delete the old log file. That deletion is the
//!    commit point. Then swap the successor in, clear the flag and move the
//!    sibling into the data directory
//!
//! Only steps 2 and 5 block registrations and fires. If moving the sibling
//! fails, the successor keeps serving from `<data_dir>.compact` and the
//! next pass (or the next open) finishes the move.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::config::{Config, LOG_FILE_NAME};
use crate::error::{Result, TickError};
use crate::types::Mark;

use super::log_store::{LogStore, StoreStats};
use super::write_buffer::WriteBuffer;
use super::{Shared, TriggerScheduler};

/// Decides when a log is worth rewriting.
pub trait CompactionPolicy: Send + Sync {
    fn should_compact(&self, stats: &StoreStats) -> bool;

    /// Returns the human-readable name of this policy.
    fn name(&self) -> &str;
}

/// Compact once the share of dead records reaches `threshold`.
pub struct GarbageRatio {
    threshold: f64,
}

impl GarbageRatio {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }
}

impl CompactionPolicy for GarbageRatio {
    fn should_compact(&self, stats: &StoreStats) -> bool {
        stats.total_records > 0 && stats.garbage_ratio() >= self.threshold
    }

    fn name(&self) -> &str {
        "GarbageRatio"
    }
}

/// What one compaction pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CompactionStats {
    /// Snapshotted keys copied into the successor.
    pub keys_copied: usize,
    /// Snapshotted keys gone by the time they were read.
    pub keys_skipped: usize,
    /// Buffered mutations replayed onto the successor.
    pub buffered_applied: usize,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

impl<T: Send + 'static> TriggerScheduler<T> {
    /// Rewrite the log, dropping tombstones and superseded records.
    ///
    /// Fails fast with `CompactionInProgress` if another pass is running.
    /// Must not be called from a fire callback: the final swap waits for
    /// every in-flight fire.
    pub fn compact(&self) -> Result<CompactionStats> {
        self.shared.compact()
    }

    /// Run `compact` if the configured policy asks for it.
    pub fn compact_if_needed(&self) -> Result<Option<CompactionStats>> {
        let stats = self.store_stats();
        if !self.shared.policy.should_compact(&stats) {
            return Ok(None);
        }
        log::info!(
            "{} policy triggered compaction (garbage ratio {:.2})",
            self.shared.policy.name(),
            stats.garbage_ratio()
        );
        self.compact().map(Some)
    }
}

/// Undoes a pass that did not reach the swap.
struct PassGuard<'a, T> {
    shared: &'a Shared<T>,
    tmp_dir: PathBuf,
    armed: bool,
}

impl<T> Drop for PassGuard<'_, T> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        log::warn!("Compaction aborted; discarding {:?}", self.tmp_dir);
        self.shared.compacting.store(false, Ordering::SeqCst);
        self.shared.buffer.clear();
        if let Err(err) = fs::remove_dir_all(&self.tmp_dir) {
            log::warn!("Failed to remove {:?}: {}", self.tmp_dir, err);
        }
    }
}

impl<T: Send + 'static> Shared<T> {
    fn compact(&self) -> Result<CompactionStats> {
        let _gate = self
            .compaction_gate
            .try_lock()
            .ok_or(TickError::CompactionInProgress)?;

        let tmp_dir = self.config.compaction_dir();
        {
            let active = self.active.write();
            if active.path().starts_with(&tmp_dir) {
                log::warn!("Finishing the directory swap of an earlier pass");
                promote_sibling(&self.config)?;
                active.relocate(&self.config.data_dir);
            }
        }
        if tmp_dir.exists() {
            fs::remove_dir_all(&tmp_dir)?;
        }
        let successor = LogStore::open(&tmp_dir, self.config.sync_writes)?;
        let mut guard = PassGuard {
            shared: self,
            tmp_dir: tmp_dir.clone(),
            armed: true,
        };

        let (old, keys) = {
            let active = self.active.write();
            self.buffer.clear();
            self.compacting.store(true, Ordering::SeqCst);
            (Arc::clone(&active), active.list_keys())
        };
        let mut stats = CompactionStats {
            bytes_before: old.stats().file_size,
            ..Default::default()
        };
        log::info!("Compaction started: {} live keys", keys.len());

        for key in keys {
            match old.get(&key) {
                Ok(Some(value)) => {
                    successor.put(&key, &value)?;
                    stats.keys_copied += 1;
                }
                Ok(None) | Err(TickError::EndOfData { .. }) => stats.keys_skipped += 1,
                Err(err) => return Err(err),
            }
        }
        drop(old);

        stats.buffered_applied = apply_buffer(&self.buffer, &successor)?;

        let mut active = self.active.write();
        stats.buffered_applied += apply_buffer(&self.buffer, &successor)?;
        stats.bytes_after = successor.stats().file_size;
        successor.sync()?;

        // with the old log gone, a restart picks the sibling
        fs::remove_file(self.config.log_path())?;
        let previous = std::mem::replace(&mut *active, Arc::new(successor));
        self.compacting.store(false, Ordering::SeqCst);
        guard.armed = false;
        drop(previous);

        let promoted = promote_sibling(&self.config);
        if promoted.is_ok() {
            active.relocate(&self.config.data_dir);
        }
        drop(active);

        self.metrics.record_compaction(stats.keys_copied as u64);
        if let Err(err) = promoted {
            log::error!(
                "Compaction committed but the log still lives in {:?}: {}",
                tmp_dir,
                err
            );
            return Err(err);
        }
        log::info!(
            "Compaction finished: {} copied, {} skipped, {} buffered, {} -> {} bytes",
            stats.keys_copied,
            stats.keys_skipped,
            stats.buffered_applied,
            stats.bytes_before,
            stats.bytes_after
        );
        Ok(stats)
    }
}

/// Replay buffered mutations onto `store` in FIFO order.
fn apply_buffer(buffer: &WriteBuffer, store: &LogStore) -> Result<usize> {
    let mut applied = 0;
    while let Some(rec) = buffer.drain() {
        match rec.mark {
            Mark::Put => store.put(&rec.key, rec.value.as_deref().unwrap_or_default())?,
            Mark::Del => store.delete(&rec.key)?,
        }
        applied += 1;
    }
    Ok(applied)
}

/// Settle a swap that a crash interrupted.
///
/// A sibling directory next to an intact data directory is an unfinished
/// pass and is discarded. A sibling with the data directory gone (or
/// emptied of its log) is a finished pass whose rename never happened.
pub(crate) fn finish_interrupted_swap(config: &Config) -> Result<()> {
    let tmp_dir = config.compaction_dir();
    if !tmp_dir.is_dir() {
        return Ok(());
    }
    let data_dir = &config.data_dir;
    if has_log(data_dir) {
        log::warn!("Discarding unfinished compaction at {:?}", tmp_dir);
        fs::remove_dir_all(&tmp_dir)?;
    } else {
        log::warn!("Completing interrupted compaction swap from {:?}", tmp_dir);
        promote_sibling(config)?;
    }
    Ok(())
}

/// Replace the data directory with the compaction sibling.
fn promote_sibling(config: &Config) -> Result<()> {
    let data_dir = &config.data_dir;
    if data_dir.exists() {
        fs::remove_dir_all(data_dir)?;
    }
    fs::rename(config.compaction_dir(), data_dir)?;
    Ok(())
}

fn has_log(dir: &Path) -> bool {
    dir.join(LOG_FILE_NAME).is_file()
}
