//! Handlers the `opqueue` binary can register from configuration.

mod shell;

pub use shell::{registry_from_config, ShellExecutor};
