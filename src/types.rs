//! TICKVAULT - Core Type Definitions
//! Defines fundamental types shared by the log store and the scheduler.

/// Key type for the log store.
pub type Key = Vec<u8>;

/// Value type for the log store.
pub type Value = Vec<u8>;

/// Operation marker carried by every record in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Mark {
    Put = 1,
    Del = 2,
}

impl Mark {
    /// Decode a mark byte read from disk.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Mark::Put),
            2 => Some(Mark::Del),
            _ => None,
        }
    }
}

/// One logged mutation: the unit of durability in the log and of
/// replay in the write buffer.
/// A `Del` carries no value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Key,
    pub value: Option<Value>,
    pub mark: Mark,
}

impl Record {
    /// Create a PUT mutation.
    pub fn put(key: Key, value: Value) -> Self {
        Self {
            key,
            value: Some(value),
            mark: Mark::Put,
        }
    }

    /// Create a DEL (tombstone) mutation.
    pub fn delete(key: Key) -> Self {
        Self {
            key,
            value: None,
            mark: Mark::Del,
        }
    }

    /// Returns true if this mutation is a tombstone.
    pub fn is_tombstone(&self) -> bool {
        self.mark == Mark::Del
    }
}
