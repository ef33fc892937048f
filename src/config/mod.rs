//! Configuration management for opqueue.
//!
//! This module handles loading configuration from `~/.opqueue/`.

mod paths;
mod settings;

pub use paths::Paths;
pub use settings::{BackpressureStrategy, Config, HandlerConfig, LoggingConfig, QueueConfig};
