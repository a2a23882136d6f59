//! TICKVAULT - Scheduler Metrics
//! Atomic counters for trigger registration, delivery, recovery and
//! compaction, readable at any time without taking scheduler locks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Atomic counters for one scheduler instance.
///
/// All counters use `Ordering::Relaxed`: they are for observability,
/// never for synchronization.
#[derive(Debug)]
pub struct SchedulerMetrics {
    /// Triggers accepted by `register` / `register_at`.
    pub registered: AtomicU64,
    /// Triggers delivered from a wheel callback.
    pub fired: AtomicU64,
    /// Triggers delivered synchronously because they were already due.
    pub fired_inline: AtomicU64,
    /// Fires whose payload or record handling failed.
    pub fire_failures: AtomicU64,
    /// Triggers rescheduled by `recover`.
    pub recovered: AtomicU64,
    /// Overdue triggers discarded by `recover`.
    pub dropped_overdue: AtomicU64,
    /// Completed compaction passes.
    pub compactions: AtomicU64,
    /// Keys copied by the bulk phase of compaction.
    pub records_copied: AtomicU64,
    /// Mutations mirrored into the write buffer.
    pub buffered_mutations: AtomicU64,
    /// Payload bytes appended to the log.
    pub bytes_written: AtomicU64,
    started: Instant,
}

impl SchedulerMetrics {
    pub fn new() -> Self {
        Self {
            registered: AtomicU64::new(0),
            fired: AtomicU64::new(0),
            fired_inline: AtomicU64::new(0),
            fire_failures: AtomicU64::new(0),
            recovered: AtomicU64::new(0),
            dropped_overdue: AtomicU64::new(0),
            compactions: AtomicU64::new(0),
            records_copied: AtomicU64::new(0),
            buffered_mutations: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub fn record_register(&self, payload_size: usize) {
        self.registered.fetch_add(1, Ordering::Relaxed);
        self.bytes_written
            .fetch_add(payload_size as u64, Ordering::Relaxed);
    }

    pub fn record_fire(&self, inline: bool) {
        if inline {
            self.fired_inline.fetch_add(1, Ordering::Relaxed);
        } else {
            self.fired.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_fire_failure(&self) {
        self.fire_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recovered(&self) {
        self.recovered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_overdue(&self) {
        self.dropped_overdue.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_buffered(&self) {
        self.buffered_mutations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_compaction(&self, copied: u64) {
        self.compactions.fetch_add(1, Ordering::Relaxed);
        self.records_copied.fetch_add(copied, Ordering::Relaxed);
    }

    /// Deliveries of either kind.
    pub fn total_fired(&self) -> u64 {
        self.fired.load(Ordering::Relaxed) + self.fired_inline.load(Ordering::Relaxed)
    }

    pub fn uptime_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Format metrics as a human-readable report.
    pub fn report(&self) -> String {
        format!(
            "\n═══ TICKVAULT Scheduler Metrics ═══\n\
             Triggers:\n\
               registered:  {}\n\
               fired:       {} ({} inline)\n\
               failures:    {}\n\
             Recovery:\n\
               recovered:   {}\n\
               overdue:     {} dropped\n\
             Compaction:\n\
               passes:      {}\n\
               copied:      {} records\n\
               buffered:    {} mutations\n\
             I/O:\n\
               written:     {} payload bytes\n\
             Uptime: {:.2}s",
            self.registered.load(Ordering::Relaxed),
            self.total_fired(),
            self.fired_inline.load(Ordering::Relaxed),
            self.fire_failures.load(Ordering::Relaxed),
            self.recovered.load(Ordering::Relaxed),
            self.dropped_overdue.load(Ordering::Relaxed),
            self.compactions.load(Ordering::Relaxed),
            self.records_copied.load(Ordering::Relaxed),
            self.buffered_mutations.load(Ordering::Relaxed),
            self.bytes_written.load(Ordering::Relaxed),
            self.uptime_secs(),
        )
    }
}

impl Default for SchedulerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
