//! TICKVAULT - Trigger Identity
//! A trigger is keyed by its deadline plus a sequence number, so two
//! triggers due at the same nanosecond never overwrite each other.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{Result, TickError};
use crate::types::Key;

/// Identity of a persisted trigger.
///
/// Stored as the key `"<deadline_nanos>-<seq>"`. A bare `"<deadline_nanos>"`
/// is also accepted when parsing, with `seq = 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TriggerId {
    /// Deadline in nanoseconds since the Unix epoch.
    pub deadline_nanos: u64,
    /// Disambiguates triggers sharing a deadline.
    pub seq: u64,
}

impl TriggerId {
    pub fn new(deadline: SystemTime, seq: u64) -> Self {
        Self {
            deadline_nanos: to_nanos(deadline),
            seq,
        }
    }

    pub fn deadline(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_nanos(self.deadline_nanos)
    }

    /// Time left until the deadline; `None` once it has passed.
    pub fn remaining(&self, now: SystemTime) -> Option<Duration> {
        match self.deadline().duration_since(now) {
            Ok(left) if !left.is_zero() => Some(left),
            _ => None,
        }
    }

    pub fn to_key(&self) -> Key {
        self.to_string().into_bytes()
    }

    pub fn parse(key: &[u8]) -> Result<Self> {
        let invalid = || TickError::InvalidTriggerKey(String::from_utf8_lossy(key).into_owned());
        let text = std::str::from_utf8(key).map_err(|_| invalid())?;
        let (deadline, seq) = match text.split_once('-') {
            Some((deadline, seq)) => (deadline, seq.parse().map_err(|_| invalid())?),
            None => (text, 0),
        };
        Ok(Self {
            deadline_nanos: deadline.parse().map_err(|_| invalid())?,
            seq,
        })
    }
}

impl fmt::Display for TriggerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.deadline_nanos, self.seq)
    }
}

/// The latest deadline a trigger can carry.
pub fn far_future() -> SystemTime {
    UNIX_EPOCH + Duration::from_nanos(u64::MAX)
}

/// Nanoseconds since the Unix epoch, clamped into `u64`.
pub fn to_nanos(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
