//! TICKVAULT - Compaction Write Buffer
//! Captures mutations that race a compaction pass so they can be
//! replayed onto the successor store in the order they happened.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::types::{Key, Mark, Record, Value};

/// Ordered, thread-safe FIFO of recorded mutations.
/// Purely in-memory; it only bridges the copy window of one compaction pass.
#[derive(Default)]
pub struct WriteBuffer {
    queue: Mutex<VecDeque<Record>>,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a mutation to the tail of the queue.
    pub fn record(&self, key: Key, value: Option<Value>, mark: Mark) {
        let entry = match mark {
            Mark::Put => Record::put(key, value.unwrap_or_default()),
            Mark::Del => Record::delete(key),
        };
        self.queue.lock().push_back(entry);
    }

    /// Pop the oldest entry, or `None` once the queue is empty.
    pub fn drain(&self) -> Option<Record> {
        self.queue.lock().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Discard everything recorded so far.
    pub fn clear(&self) {
        self.queue.lock().clear();
    }
}
