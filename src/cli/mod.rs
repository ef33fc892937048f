//! Command-line interface for the `opqueue` binary.

pub mod args;
pub mod commands;
