//! TICKVAULT - Custom Error Types
//! Defines the error hierarchy for the log store and trigger scheduler.

use thiserror::Error;

/// Custom Result type for tickvault.
pub type Result<T> = std::result::Result<T, TickError>;

/// Error types for the log store and the trigger scheduler.
#[derive(Error, Debug)]
pub enum TickError {
    /// I/O errors from file operations (log file, directories).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The codec rejected a payload.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The codec rejected stored bytes.
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// The scheduler was built without a fire callback.
    #[error("No fire callback configured")]
    NoCallback,

    /// A record read ran past the logical end of the file (torn tail).
    #[error("End of data at offset {offset}")]
    EndOfData { offset: u64 },

    /// Data corruption detected (CRC mismatch, unknown mark).
    #[error("Data corruption detected: {0}")]
    Corruption(String),

    /// A persisted key could not be parsed back into a trigger id.
    #[error("Invalid trigger key: {0}")]
    InvalidTriggerKey(String),

    /// Another compaction pass is already running.
    #[error("Compaction already in progress")]
    CompactionInProgress,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}
