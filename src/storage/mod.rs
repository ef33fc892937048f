//! Storage layer for opqueue.
//!
//! The queue persists through the [`Persistence`] contract:
//! - [`SqlitePersistence`] stores rows in `~/.opqueue/opqueue.db`
//! - [`MemoryPersistence`] keeps them in process (tests, embedding)

mod database;
mod migrations;
pub mod persistence;
mod sqlite;

pub use database::Database;
pub use persistence::{Condition, MemoryPersistence, Persistence, Query, Row, WriteOp};
pub use sqlite::SqlitePersistence;
