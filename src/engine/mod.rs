//! TICKVAULT - Trigger Scheduler
//! Top-level module tying the log store, the write buffer and the timing
//! wheel into a durable delayed-trigger service.

pub mod codec;
pub mod compaction;
pub mod log_store;
pub mod metrics;
pub mod record;
pub mod trigger;
pub mod wheel;
pub mod write_buffer;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::{Mutex, RwLock, RwLockReadGuard};

use crate::config::{Config, OverduePolicy};
use crate::error::{Result, TickError};
use crate::types::{Key, Mark, Value};

use self::codec::Codec;
use self::compaction::{CompactionPolicy, GarbageRatio};
use self::log_store::{LogStore, StoreStats};
use self::metrics::SchedulerMetrics;
use self::trigger::TriggerId;
use self::wheel::TimingWheel;
use self::write_buffer::WriteBuffer;

type FireFn<T> = Box<dyn Fn(T) + Send + Sync>;

/// Outcome of a `recover` call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Triggers put back on the wheel with their remaining delay.
    pub rescheduled: usize,
    /// Overdue triggers discarded under `OverduePolicy::Drop`.
    pub overdue_dropped: usize,
    /// Overdue triggers queued for late delivery.
    pub overdue_fired: usize,
    /// Keys that vanished, were torn, or could not be parsed.
    pub skipped: usize,
}

/// State shared between the scheduler handle and wheel callbacks.
struct Shared<T> {
    config: Config,
    /// The one live store. Read-locked by registrations, fires and
    /// recovery; write-locked only to start and to finish a compaction pass.
    active: RwLock<Arc<LogStore>>,
    buffer: WriteBuffer,
    /// Set while a compaction pass is copying; mutations are mirrored
    /// into `buffer` while it is.
    compacting: AtomicBool,
    compaction_gate: Mutex<()>,
    policy: Box<dyn CompactionPolicy>,
    wheel: TimingWheel,
    codec: Box<dyn Codec<T>>,
    on_fire: FireFn<T>,
    seq: AtomicU64,
    /// First sequence handed out by this process. Keys at or above it were
    /// scheduled by `register` and are not recovery's business.
    recover_below: u64,
    recovered: AtomicBool,
    metrics: SchedulerMetrics,
}

/// Builder for a [`TriggerScheduler`].
pub struct SchedulerBuilder<T> {
    config: Config,
    codec: Box<dyn Codec<T>>,
    on_fire: Option<FireFn<T>>,
    policy: Option<Box<dyn CompactionPolicy>>,
}

impl<T: Send + 'static> SchedulerBuilder<T> {
    /// The callback every trigger is delivered to. Required.
    pub fn on_fire(mut self, f: impl Fn(T) + Send + Sync + 'static) -> Self {
        self.on_fire = Some(Box::new(f));
        self
    }

    /// Override the policy used by `compact_if_needed`.
    pub fn compaction_policy(mut self, policy: impl CompactionPolicy + 'static) -> Self {
        self.policy = Some(Box::new(policy));
        self
    }

    /// Open the store, replay it and start the timing wheel.
    ///
    /// Persisted triggers are not scheduled until `recover` is called.
    pub fn open(self) -> Result<TriggerScheduler<T>> {
        let config = self.config;
        config.validate()?;
        let on_fire = self.on_fire.ok_or(TickError::NoCallback)?;

        compaction::finish_interrupted_swap(&config)?;
        config.ensure_dirs()?;
        let store = LogStore::open(&config.data_dir, config.sync_writes)?;

        let next_seq = store
            .list_keys()
            .iter()
            .filter_map(|key| TriggerId::parse(key).ok())
            .map(|id| id.seq.saturating_add(1))
            .max()
            .unwrap_or(0);

        let wheel = TimingWheel::new(config.tick, config.wheel_slots, config.dispatch_workers);
        wheel.start();

        log::info!(
            "Tickvault opened at {:?} ({} persisted triggers)",
            config.data_dir,
            store.len()
        );

        let policy = self
            .policy
            .unwrap_or_else(|| Box::new(GarbageRatio::new(config.compaction_garbage_ratio)));

        Ok(TriggerScheduler {
            shared: Arc::new(Shared {
                active: RwLock::new(Arc::new(store)),
                buffer: WriteBuffer::new(),
                compacting: AtomicBool::new(false),
                compaction_gate: Mutex::new(()),
                policy,
                wheel,
                codec: self.codec,
                on_fire,
                seq: AtomicU64::new(next_seq),
                recover_below: next_seq,
                recovered: AtomicBool::new(false),
                metrics: SchedulerMetrics::new(),
                config,
            }),
        })
    }
}

/// Durable delayed-trigger scheduler.
///
/// ## Example
/// ```no_run
/// use std::time::Duration;
/// use tickvault::config::Config;
/// use tickvault::engine::{codec::BincodeCodec, TriggerScheduler};
///
/// let scheduler = TriggerScheduler::builder(Config::new("./ticks"), BincodeCodec::<String>::new())
///     .on_fire(|msg| println!("fired: {}", msg))
///     .open()
///     .unwrap();
/// scheduler.recover().unwrap();
/// scheduler.register(Duration::from_secs(5), "hello".to_string()).unwrap();
/// ```
pub struct TriggerScheduler<T: Send + 'static> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> TriggerScheduler<T> {
    pub fn builder(config: Config, codec: impl Codec<T> + 'static) -> SchedulerBuilder<T> {
        SchedulerBuilder {
            config,
            codec: Box::new(codec),
            on_fire: None,
            policy: None,
        }
    }

    /// Persist `payload` and deliver it once `delay` has elapsed.
    ///
    /// A delay reaching past the representable range is saturated to
    /// [`trigger::far_future`].
    pub fn register(&self, delay: Duration, payload: T) -> Result<TriggerId> {
        let deadline = SystemTime::now()
            .checked_add(delay)
            .unwrap_or_else(trigger::far_future);
        self.register_at(deadline, payload)
    }

    /// Persist `payload` and deliver it at `deadline`.
    ///
    /// A deadline that has already passed once the record is durable is
    /// delivered inline, and its record removed, before this returns.
    pub fn register_at(&self, deadline: SystemTime, payload: T) -> Result<TriggerId> {
        let shared = &self.shared;
        let bytes = shared.codec.serialize(&payload)?;
        let id = TriggerId::new(deadline, shared.seq.fetch_add(1, Ordering::Relaxed));
        let key = id.to_key();

        let active = shared.read_active();
        active.put(&key, &bytes)?;
        shared.metrics.record_register(bytes.len());
        shared.mirror(key, Some(bytes), Mark::Put);

        match id.remaining(SystemTime::now()) {
            Some(left) => {
                log::debug!("Trigger {} scheduled in {:?}", id, left);
                Shared::schedule(shared, id, payload, left);
            }
            None => {
                log::debug!("Trigger {} already due, firing inline", id);
                shared.fire_locked(&active, id, payload, true)?;
            }
        }
        Ok(id)
    }

    /// Put every persisted trigger back on the wheel.
    ///
    /// Only triggers persisted before this scheduler was opened are
    /// considered; those registered since are already scheduled.
    /// Runs once per scheduler; later calls return an empty report. The
    /// first payload that fails to decode aborts the remaining keys and is
    /// returned; triggers already rescheduled stay scheduled.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let shared = &self.shared;
        let mut report = RecoveryReport::default();
        if shared.recovered.swap(true, Ordering::SeqCst) {
            log::warn!("recover() called again; persisted triggers are already scheduled");
            return Ok(report);
        }

        let active = shared.read_active();
        let now = SystemTime::now();
        for key in active.list_keys() {
            let id = match TriggerId::parse(&key) {
                Ok(id) => id,
                Err(err) => {
                    log::warn!("Skipping record during recovery: {}", err);
                    report.skipped += 1;
                    continue;
                }
            };
            if id.seq >= shared.recover_below {
                continue;
            }
            let bytes = match active.get(&key) {
                Ok(Some(bytes)) => bytes,
                Ok(None) => {
                    report.skipped += 1;
                    continue;
                }
                Err(TickError::EndOfData { offset }) => {
                    log::warn!("Trigger {} record torn at offset {}", id, offset);
                    report.skipped += 1;
                    continue;
                }
                Err(err) => return Err(err),
            };
            let payload = shared.codec.deserialize(&bytes)?;

            match (id.remaining(now), shared.config.overdue_policy) {
                (Some(left), _) => {
                    Shared::schedule(shared, id, payload, left);
                    report.rescheduled += 1;
                    shared.metrics.record_recovered();
                }
                (None, OverduePolicy::Drop) => {
                    log::warn!("Dropping trigger {}: deadline passed while offline", id);
                    active.delete(&key)?;
                    shared.mirror(key, None, Mark::Del);
                    report.overdue_dropped += 1;
                    shared.metrics.record_dropped_overdue();
                }
                (None, OverduePolicy::FireImmediately) => {
                    log::info!("Trigger {} overdue, delivering late", id);
                    Shared::schedule(shared, id, payload, Duration::ZERO);
                    report.overdue_fired += 1;
                    shared.metrics.record_recovered();
                }
            }
        }

        log::info!(
            "Recovery complete: {} rescheduled, {} overdue dropped, {} overdue fired, {} skipped",
            report.rescheduled,
            report.overdue_dropped,
            report.overdue_fired,
            report.skipped
        );
        Ok(report)
    }

    /// Triggers persisted and not yet delivered.
    pub fn pending(&self) -> usize {
        self.shared.read_active().len()
    }

    /// Size figures of the live store.
    pub fn store_stats(&self) -> StoreStats {
        self.shared.read_active().stats()
    }

    /// Persisted payload bytes for a trigger, if it is still pending.
    pub fn payload_bytes(&self, id: &TriggerId) -> Result<Option<Value>> {
        self.shared.read_active().get(&id.to_key())
    }

    pub fn metrics(&self) -> &SchedulerMetrics {
        &self.shared.metrics
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn is_compacting(&self) -> bool {
        self.shared.compacting.load(Ordering::SeqCst)
    }

    /// Stop the wheel. Undelivered triggers stay durable for the next
    /// `recover`.
    pub fn shutdown(&self) {
        self.shared.wheel.stop();
    }
}

impl<T: Send + 'static> Drop for TriggerScheduler<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<T: Send + 'static> Shared<T> {
    /// Read access to the live store. Recursive, so a fire callback may
    /// register new triggers while a compaction waits to swap.
    fn read_active(&self) -> RwLockReadGuard<'_, Arc<LogStore>> {
        self.active.read_recursive()
    }

    /// Record a mutation for the successor store while a pass is copying.
    /// Callers hold the read lock, so the flag cannot flip underneath them.
    fn mirror(&self, key: Key, value: Option<Value>, mark: Mark) {
        if self.compacting.load(Ordering::SeqCst) {
            self.buffer.record(key, value, mark);
            self.metrics.record_buffered();
        }
    }

    fn schedule(this: &Arc<Self>, id: TriggerId, payload: T, delay: Duration) {
        let weak = Arc::downgrade(this);
        this.wheel.after(delay, move || {
            if let Some(shared) = weak.upgrade() {
                Shared::fire_scheduled(&shared, id, payload);
            }
        });
    }

    fn fire_scheduled(this: &Arc<Self>, id: TriggerId, payload: T) {
        // the wheel caps a single timer; far deadlines are re-armed
        if let Some(left) = id.remaining(SystemTime::now()) {
            log::debug!("Trigger {} woke early, re-arming for {:?}", id, left);
            Shared::schedule(this, id, payload, left);
            return;
        }
        let active = this.read_active();
        if let Err(err) = this.fire_locked(&active, id, payload, false) {
            this.metrics.record_fire_failure();
            log::error!("Trigger {} fired but its record was not removed: {}", id, err);
        }
    }

    /// Deliver a trigger, then delete its record. The caller holds the
    /// read lock on `store`.
    fn fire_locked(&self, store: &LogStore, id: TriggerId, payload: T, inline: bool) -> Result<()> {
        (self.on_fire)(payload);
        let key = id.to_key();
        store.delete(&key)?;
        self.mirror(key, None, Mark::Del);
        self.metrics.record_fire(inline);
        log::debug!("Trigger {} delivered", id);
        Ok(())
    }
}
