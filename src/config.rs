//! TICKVAULT - Scheduler Configuration
//! Defines tunable parameters for the log store, the timer wheel
//! and the compaction policy.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, TickError};

/// Name of the append-only data file inside `data_dir`.
pub const LOG_FILE_NAME: &str = "tick.log";

/// Suffix of the sibling directory used while a compaction pass runs.
pub const COMPACT_DIR_SUFFIX: &str = ".compact";

/// What recovery does with a trigger whose deadline passed while the
/// process was down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverduePolicy {
    /// Discard the trigger and delete its record.
    Drop,
    /// Deliver it late, on the next wheel tick.
    FireImmediately,
}

/// Configuration for a tickvault scheduler.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the append-only log.
    pub data_dir: PathBuf,

    /// Whether to fsync every append.
    pub sync_writes: bool,

    /// Timer wheel granularity.
    pub tick: Duration,

    /// Number of buckets in the timer wheel.
    pub wheel_slots: usize,

    /// Threads executing fire callbacks.
    pub dispatch_workers: usize,

    /// Handling of triggers found overdue during recovery.
    pub overdue_policy: OverduePolicy,

    /// Garbage ratio at which `compact_if_needed` rewrites the log.
    pub compaction_garbage_ratio: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            sync_writes: true,
            tick: Duration::from_millis(1),
            wheel_slots: 512,
            dispatch_workers: 4,
            overdue_policy: OverduePolicy::Drop,
            compaction_garbage_ratio: 0.5,
        }
    }
}

impl Config {
    /// Create a new Config with a custom data directory.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Enable or disable fsync on every append.
    pub fn with_sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }

    /// Set the timer wheel tick.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Set the number of wheel buckets.
    pub fn with_wheel_slots(mut self, slots: usize) -> Self {
        self.wheel_slots = slots;
        self
    }

    /// Set the number of callback dispatch threads.
    pub fn with_dispatch_workers(mut self, workers: usize) -> Self {
        self.dispatch_workers = workers;
        self
    }

    /// Set the overdue recovery policy.
    pub fn with_overdue_policy(mut self, policy: OverduePolicy) -> Self {
        self.overdue_policy = policy;
        self
    }

    /// Set the garbage ratio threshold for `compact_if_needed`.
    pub fn with_compaction_garbage_ratio(mut self, ratio: f64) -> Self {
        self.compaction_garbage_ratio = ratio;
        self
    }

    /// Path of the data file.
    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join(LOG_FILE_NAME)
    }

    /// Sibling directory a compaction pass writes into.
    pub fn compaction_dir(&self) -> PathBuf {
        let mut name = self
            .data_dir
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "data".into());
        name.push(COMPACT_DIR_SUFFIX);
        self.data_dir.with_file_name(name)
    }

    /// Reject values the wheel or the policy cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.tick.is_zero() {
            return Err(TickError::Config("tick must be non-zero".into()));
        }
        if self.wheel_slots == 0 {
            return Err(TickError::Config("wheel_slots must be non-zero".into()));
        }
        if self.dispatch_workers == 0 {
            return Err(TickError::Config(
                "dispatch_workers must be non-zero".into(),
            ));
        }
        if !(self.compaction_garbage_ratio > 0.0 && self.compaction_garbage_ratio <= 1.0) {
            return Err(TickError::Config(format!(
                "compaction_garbage_ratio {} outside (0, 1]",
                self.compaction_garbage_ratio
            )));
        }
        Ok(())
    }

    /// Ensure the data directory exists.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)
    }
}
