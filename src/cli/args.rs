use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::queue::{OperationStatus, Priority};

#[derive(Parser)]
#[command(name = "opqueue")]
#[command(about = "A durable offline operation queue with prioritized workers")]
#[command(long_about = "opqueue - a durable offline operation queue

Operations are persisted to SQLite and replayed against shell handlers
configured in ~/.opqueue/config.yaml. Failed attempts are retried with
backoff; operations that exhaust their retries land in the dead-letter
queue, where they can be inspected and re-driven.

QUICK START:
  opqueue enqueue lyrics create_song --payload '{\"title\":\"Psalm 23\"}'
  opqueue list                 Show queued operations
  opqueue run                  Process the queue until it drains
  opqueue dlq list             Show dead-lettered operations

OUTPUT FORMATS:
  --output pretty    Human-readable colored output (default)
  --output json      Machine-readable JSON for scripting

For more information on a specific command, run:
  opqueue <command> --help")]
#[command(version, propagate_version = true)]
pub struct Cli {
    /// Output format for command results
    ///
    /// Use 'pretty' for human-readable colored output (default),
    /// or 'json' for machine-readable output suitable for scripting.
    #[arg(short, long, value_enum, default_value = "pretty", global = true)]
    pub output: OutputFormat,

    /// Config file (default: ~/.opqueue/config.yaml)
    #[arg(long, global = true, env = "OPQUEUE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Database file (default: ~/.opqueue/opqueue.db)
    #[arg(long, global = true, env = "OPQUEUE_DB")]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Output format for command results.
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable colored output.
    #[default]
    Pretty,
    /// Machine-readable JSON output.
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show queue counts by status
    ///
    /// # Examples
    ///
    ///   opqueue status
    ///   opqueue status -o json
    #[command(alias = "s")]
    Status,

    /// Add an operation to the queue
    ///
    /// The operation is validated, checked against recently enqueued
    /// identical operations and persisted. It runs on the next 'opqueue run'.
    ///
    /// # Examples
    ///
    ///   opqueue enqueue lyrics create_song --payload '{"title":"Psalm 23"}'
    ///   opqueue enqueue sync push --priority critical
    ///   opqueue enqueue sync push --id sync-42 --skip-dedup
    #[command(alias = "e")]
    Enqueue(EnqueueArgs),

    /// List persisted operations
    ///
    /// # Examples
    ///
    ///   opqueue list
    ///   opqueue list --status processed --limit 10
    #[command(alias = "ls")]
    List(ListArgs),

    /// Process queued operations with the configured handlers
    ///
    /// Exits once nothing is queued or executing. With --follow, keeps
    /// running until interrupted with Ctrl-C.
    Run(RunArgs),

    /// Inspect and re-drive the dead-letter queue
    Dlq(DlqArgs),

    /// Cancel a waiting operation
    Dequeue {
        /// Operation ID
        id: String,
    },

    /// Discard every waiting operation
    ///
    /// Dead-lettered operations are kept. Requires --force.
    Clear {
        /// Confirm discarding the queue
        #[arg(long)]
        force: bool,
    },

    /// Delete processed operations older than the retention window
    Purge,
}

#[derive(Args)]
pub struct EnqueueArgs {
    /// Module owning the handler
    pub module: String,

    /// Handler action
    pub action: String,

    /// Payload as a JSON object
    #[arg(short, long, default_value = "{}")]
    pub payload: String,

    /// Priority tier: low, normal, high or critical
    #[arg(short = 'P', long, default_value = "normal")]
    pub priority: Priority,

    /// Operation ID (generated when omitted)
    #[arg(long)]
    pub id: Option<String>,

    /// Accept the operation even if an identical one was enqueued recently
    #[arg(long)]
    pub skip_dedup: bool,
}

#[derive(Args)]
pub struct ListArgs {
    /// Only show operations with this status
    #[arg(short, long)]
    pub status: Option<OperationStatus>,

    /// Maximum number of operations to show
    #[arg(short, long, default_value = "50")]
    pub limit: usize,
}

#[derive(Args)]
pub struct RunArgs {
    /// Keep processing new work until interrupted
    #[arg(short, long)]
    pub follow: bool,
}

#[derive(Args)]
pub struct DlqArgs {
    #[command(subcommand)]
    pub command: DlqCommands,
}

#[derive(Subcommand)]
pub enum DlqCommands {
    /// List dead-lettered operations
    #[command(alias = "ls")]
    List,

    /// Move a dead-lettered operation back to the queue with a fresh retry budget
    Retry {
        /// Operation ID
        id: String,
    },
}
