//! CLI command definitions using clap.
//!
//! Defines the main CLI structure and subcommands:
//! - run: process a JSONL file of jobs to completion
//! - listen: process jobs streamed on stdin until stopped

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::EngineConfig;

/// Batchwise - rate-limited batch requests against completion APIs.
#[derive(Parser, Debug)]
#[command(name = "batchwise")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Check if verbose mode is enabled.
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// Main subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run every job in a JSONL file and write the result rows.
    Run {
        /// JSONL file with one `{endpoint, metadata, params}` job per line.
        #[arg(short, long)]
        input: PathBuf,

        /// Where to write the result rows (JSONL).
        #[arg(short, long)]
        output: PathBuf,

        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Read jobs from stdin and stream result rows as they arrive.
    Listen {
        /// Where to append the result rows (JSONL).
        #[arg(short, long)]
        output: PathBuf,

        #[command(flatten)]
        engine: EngineArgs,
    },
}

impl Commands {
    pub fn engine(&self) -> &EngineArgs {
        match self {
            Commands::Run { engine, .. } | Commands::Listen { engine, .. } => engine,
        }
    }
}

/// Engine overrides shared by every subcommand.
#[derive(Args, Debug, Clone, Default)]
pub struct EngineArgs {
    /// Tokens-per-minute limit.
    #[arg(long)]
    pub tpm: Option<u32>,

    /// Requests-per-minute limit (derived from --tpm when unset).
    #[arg(long)]
    pub rpm: Option<u32>,

    /// Number of workers.
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Per-call timeout in seconds.
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// Sort results by this field; repeat for a compound index.
    #[arg(long = "index")]
    pub index: Vec<String>,

    /// Answer every call with a local stub instead of the remote service.
    #[arg(long)]
    pub dry_run: bool,
}

impl EngineArgs {
    /// Layer the command-line overrides on top of the configured engine.
    pub fn apply(&self, mut engine: EngineConfig) -> EngineConfig {
        if let Some(tpm) = self.tpm {
            engine.tokens_per_minute = tpm;
        }
        if let Some(rpm) = self.rpm {
            engine.requests_per_minute = Some(rpm);
        }
        if let Some(workers) = self.workers {
            engine.workers = workers;
        }
        if let Some(timeout) = self.timeout {
            engine.timeout_secs = timeout;
        }
        if !self.index.is_empty() {
            engine.result_index = Some(self.index.clone());
        }
        engine
    }
}
