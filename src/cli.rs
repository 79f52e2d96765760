//! Command line interface.
//!
//! [`Cli`] holds the global flags (--config, --max-retries, --verbose) and
//! one [`Command`] per queue operation or user action.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Job queue daemon for local, SSH, SGE and Galaxy back-ends.
#[derive(Debug, Parser)]
#[command(name = "waves-runner", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file (defaults to ./waves.toml when present).
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Retries allowed before a job is put in error.
    #[arg(long, global = true)]
    pub max_retries: Option<u32>,

    /// Debug logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Queue daemon operations.
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Submits a job from a JSON or TOML definition.
    Submit {
        /// Definition file; relative input paths resolve against its directory.
        file: PathBuf,
    },

    /// Lists jobs, oldest first.
    List {
        /// Only jobs that are not finished.
        #[arg(long)]
        pending: bool,
    },

    /// Shows a job with its history.
    Show {
        /// Slug or unique slug prefix.
        slug: String,
    },

    /// Cancels a job.
    Cancel { slug: String },

    /// Puts a finished job back in the queue.
    Rerun { slug: String },

    /// Drives one job to completion in the foreground.
    Follow { slug: String },

    /// Lists configured adaptors.
    Adaptors,
}

#[derive(Debug, Subcommand)]
pub enum QueueAction {
    /// Polls the queue until Ctrl-C.
    Run,
    /// Runs a single queue pass.
    Once,
    /// Job count per status.
    Status,
    /// Deletes finished jobs past their retention period.
    Purge,
}
