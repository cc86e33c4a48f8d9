//! CLI module for batchwise - command-line interface and subcommands.
//!
//! Provides the main entry point with subcommands for running a job file
//! to completion and for listening on stdin.

pub mod commands;

pub use commands::Cli;
