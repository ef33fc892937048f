//! opqueue - a durable offline operation queue
//!
//! Application mutations are captured as operations, persisted to SQLite and
//! replayed against module handlers by a prioritized worker pool, with
//! deduplication, backpressure, per-module circuit breakers and rate limits,
//! retry policies and a dead-letter queue.

#![deny(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod error;
pub mod executors;
pub mod output;
pub mod queue;
pub mod storage;
pub mod telemetry;

pub use cli::args::{Cli, Commands, OutputFormat};
pub use error::QueueError;
pub use queue::{Operation, QueueManager};
