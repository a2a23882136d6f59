//! TICKVAULT - Durable Delayed-Trigger Scheduler
//!
//! Register a payload to be delivered to a callback at (or after) a future
//! instant. Registrations survive restarts, and the backing log can be
//! compacted online without pausing delivery.
//!
//! ## Features
//! - **Log Store**: append-only file + in-memory offset index, CRC32-checked
//!   records, crash recovery by replay
//! - **Timing Wheel**: hashed wheel with O(1) insertion and a callback
//!   worker pool
//! - **Online Compaction**: rewrites the log while triggers keep flowing,
//!   using a write buffer to absorb racing mutations
//! - **Metrics**: lock-free atomic counters for observability
//!
//! ## Example
//! ```no_run
//! use std::time::Duration;
//! use tickvault::{config::Config, engine::codec::BincodeCodec, engine::TriggerScheduler};
//!
//! let scheduler = TriggerScheduler::builder(Config::new("./ticks"), BincodeCodec::<u64>::new())
//!     .on_fire(|order_id| println!("order {} expired", order_id))
//!     .open()
//!     .unwrap();
//! scheduler.recover().unwrap();
//! scheduler.register(Duration::from_secs(30), 42).unwrap();
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod types;
