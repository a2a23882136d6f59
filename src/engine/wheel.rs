//! TICKVAULT - Hashed Timing Wheel
//! Schedules many one-shot callbacks with O(1) insertion.
//!
//! ## Design
//! - A fixed ring of `slots` buckets, one bucket per tick
//! - A timer due further out than one revolution carries a round counter
//!   that is decremented each time the cursor passes its bucket
//! - Ticks are counted from a fixed epoch, so a late driver catches up
//!   instead of drifting
//! - Due callbacks are handed to a pool of worker threads; a slow callback
//!   never stalls the wheel
//!
//! Nothing here is persisted: stopping the wheel discards pending timers.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

/// A callback waiting on the wheel.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Longest delay a single timer is armed for. Longer delays are clamped;
/// callers that need an exact far deadline re-arm when the timer runs.
pub const MAX_DELAY: Duration = Duration::from_secs(u32::MAX as u64);

struct Timer {
    /// Revolutions left before the timer is due.
    rounds: u64,
    task: Task,
}

struct WheelState {
    slots: Vec<Vec<Timer>>,
    /// Last tick processed, counted from the epoch.
    current_tick: u64,
    pending: usize,
}

struct WheelShared {
    tick: Duration,
    epoch: Instant,
    state: Mutex<WheelState>,
    wake: Condvar,
    running: AtomicBool,
}

struct Threads {
    driver: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

/// Single-level hashed timing wheel.
pub struct TimingWheel {
    shared: Arc<WheelShared>,
    workers: usize,
    threads: Mutex<Option<Threads>>,
}

impl WheelShared {
    fn lock(&self) -> MutexGuard<'_, WheelState> {
        self.state.lock()
    }

    fn ticks_until(&self, at: Instant) -> u64 {
        let ticks = at.saturating_duration_since(self.epoch).as_nanos() / self.tick.as_nanos();
        u64::try_from(ticks).unwrap_or(u64::MAX)
    }

    fn tick_start(&self, tick: u64) -> Instant {
        let nanos = (self.tick.as_nanos() as u64).saturating_mul(tick);
        self.epoch + Duration::from_nanos(nanos)
    }

    /// First tick whose start is at or after `at`.
    fn ceil_tick(&self, at: Instant) -> u64 {
        let nanos = at.saturating_duration_since(self.epoch).as_nanos();
        let tick = self.tick.as_nanos();
        u64::try_from(nanos.div_ceil(tick)).unwrap_or(u64::MAX)
    }
}

impl WheelState {
    /// Advance through every tick up to `due_tick`, collecting due tasks.
    fn advance(&mut self, due_tick: u64, due: &mut Vec<Task>) {
        let slots = self.slots.len() as u64;
        while self.current_tick < due_tick {
            if self.pending == 0 {
                self.current_tick = due_tick;
                break;
            }
            self.current_tick += 1;
            let idx = (self.current_tick % slots) as usize;
            let bucket = std::mem::take(&mut self.slots[idx]);
            for mut timer in bucket {
                if timer.rounds == 0 {
                    self.pending -= 1;
                    due.push(timer.task);
                } else {
                    timer.rounds -= 1;
                    self.slots[idx].push(timer);
                }
            }
        }
    }
}

impl TimingWheel {
    /// Create a stopped wheel.
    pub fn new(tick: Duration, slots: usize, workers: usize) -> Self {
        let slots = slots.max(1);
        Self {
            shared: Arc::new(WheelShared {
                tick: tick.max(Duration::from_nanos(1)),
                epoch: Instant::now(),
                state: Mutex::new(WheelState {
                    slots: (0..slots).map(|_| Vec::new()).collect(),
                    current_tick: 0,
                    pending: 0,
                }),
                wake: Condvar::new(),
                running: AtomicBool::new(false),
            }),
            workers: workers.max(1),
            threads: Mutex::new(None),
        }
    }

    /// Spawn the driver and the dispatch workers. Calling it again is a no-op.
    pub fn start(&self) {
        let mut threads = self.threads.lock();
        if threads.is_some() {
            return;
        }
        self.shared.running.store(true, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel::<Task>();
        let rx = Arc::new(Mutex::new(rx));
        let workers = (0..self.workers)
            .map(|i| {
                let rx = Arc::clone(&rx);
                thread::Builder::new()
                    .name(format!("tickvault-fire-{}", i))
                    .spawn(move || worker_loop(rx))
            })
            .collect::<std::io::Result<Vec<_>>>();
        let shared = Arc::clone(&self.shared);
        let driver = thread::Builder::new()
            .name("tickvault-wheel".into())
            .spawn(move || driver_loop(shared, tx));

        match (driver, workers) {
            (Ok(driver), Ok(workers)) => {
                *threads = Some(Threads { driver, workers });
            }
            (driver, workers) => {
                // spawn failed; unwind whatever did start
                {
                    let _state = self.shared.lock();
                    self.shared.running.store(false, Ordering::SeqCst);
                    self.shared.wake.notify_all();
                }
                log::error!("Failed to spawn timing wheel threads");
                if let Ok(driver) = driver {
                    let _ = driver.join();
                }
                if let Ok(workers) = workers {
                    for worker in workers {
                        let _ = worker.join();
                    }
                }
            }
        }
    }

    /// Run `task` once, no earlier than `delay` from now.
    ///
    /// A delay above [`MAX_DELAY`] is clamped to it.
    pub fn after(&self, delay: Duration, task: impl FnOnce() + Send + 'static) {
        let shared = &self.shared;
        let now = Instant::now();
        let target = shared.ceil_tick(now + delay.min(MAX_DELAY));

        let mut state = shared.lock();
        if state.pending == 0 {
            // idle wheel: skip the ticks that went by with nothing to do
            let now_tick = shared.ticks_until(now);
            state.current_tick = state.current_tick.max(now_tick);
        }
        let target = target.max(state.current_tick + 1);
        let slots = state.slots.len() as u64;
        let rounds = (target - state.current_tick - 1) / slots;
        state.slots[(target % slots) as usize].push(Timer {
            rounds,
            task: Box::new(task),
        });
        state.pending += 1;
        if state.pending == 1 {
            shared.wake.notify_all();
        }
    }

    /// Number of timers not yet dispatched.
    pub fn pending(&self) -> usize {
        self.shared.lock().pending
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Stop the driver, let workers finish what was already dispatched,
    /// and drop every pending timer.
    pub fn stop(&self) {
        let Some(threads) = self.threads.lock().take() else {
            return;
        };
        {
            let _state = self.shared.lock();
            self.shared.running.store(false, Ordering::SeqCst);
            self.shared.wake.notify_all();
        }
        if threads.driver.join().is_err() {
            log::error!("Timing wheel driver panicked");
        }
        for worker in threads.workers {
            // a callback stopping the wheel it runs on must not join itself
            if worker.thread().id() == thread::current().id() {
                continue;
            }
            let _ = worker.join();
        }

        let mut state = self.shared.lock();
        for slot in state.slots.iter_mut() {
            slot.clear();
        }
        state.pending = 0;
    }
}

impl Drop for TimingWheel {
    fn drop(&mut self) {
        self.stop();
    }
}

fn driver_loop(shared: Arc<WheelShared>, tx: Sender<Task>) {
    let mut due = Vec::new();
    let mut state = shared.lock();
    while shared.running.load(Ordering::SeqCst) {
        if state.pending == 0 {
            shared.wake.wait(&mut state);
            continue;
        }

        let next = shared.tick_start(state.current_tick + 1);
        if Instant::now() < next {
            shared.wake.wait_until(&mut state, next);
            continue;
        }

        let due_tick = shared.ticks_until(Instant::now());
        state.advance(due_tick, &mut due);
        if due.is_empty() {
            continue;
        }
        drop(state);
        for task in due.drain(..) {
            if tx.send(task).is_err() {
                log::error!("Timing wheel workers are gone; dropping due timer");
            }
        }
        state = shared.lock();
    }
}

fn worker_loop(rx: Arc<Mutex<Receiver<Task>>>) {
    loop {
        let next = rx.lock().recv();
        let Ok(task) = next else {
            break;
        };
        if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
            log::error!("Timer callback panicked");
        }
    }
}
