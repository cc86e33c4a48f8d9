//! Human-readable per-run log file.
//!
//! Lines look like `WORKER 3 | 2026-10-19 14:02:11 | PROCESSED | {...}`.
//! The file is truncated at the start of every run.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::client::Params;
use crate::error::{BatchError, Result};

/// How much of each request the run log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    Silent = 0,
    Metadata = 1,
    Full = 2,
}

impl TryFrom<u8> for Verbosity {
    type Error = BatchError;

    fn try_from(level: u8) -> Result<Self> {
        match level {
            0 => Ok(Verbosity::Silent),
            1 => Ok(Verbosity::Metadata),
            2 => Ok(Verbosity::Full),
            other => Err(BatchError::Configuration(format!(
                "Allowable `log_verbosity` values are 0, 1, or 2; found {}",
                other
            ))),
        }
    }
}

#[derive(Debug)]
pub struct RunLog {
    path: Option<PathBuf>,
    verbosity: Verbosity,
    file: Mutex<Option<File>>,
}

impl RunLog {
    pub fn new(path: Option<PathBuf>, verbosity: Verbosity) -> Self {
        Self {
            path,
            verbosity,
            file: Mutex::new(None),
        }
    }

    pub fn verbosity(&self) -> Verbosity {
        self.verbosity
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn enabled(&self) -> bool {
        self.verbosity > Verbosity::Silent && self.path.is_some()
    }

    /// Truncate the file and keep it open for appending.
    pub fn clear(&self) -> Result<()> {
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        *file = None;
        if let Some(path) = &self.path {
            File::create(path)?;
            if self.enabled() {
                *file = Some(OpenOptions::new().append(true).open(path)?);
            }
        }
        Ok(())
    }

    /// Release the file handle.
    pub fn close(&self) {
        *self.file.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn main(&self, message: impl AsRef<str>) {
        self.write("MAIN", message.as_ref());
    }

    pub fn worker(&self, worker: usize, message: impl AsRef<str>) {
        self.write(&format!("WORKER {}", worker), message.as_ref());
    }

    /// Render a request for the log according to the verbosity.
    pub fn describe(&self, metadata: &Params, parameters: &Params) -> String {
        let metadata = serde_json::to_string(metadata).unwrap_or_default();
        match self.verbosity {
            Verbosity::Full => format!(
                "{} | {}",
                metadata,
                serde_json::to_string(parameters).unwrap_or_default()
            ),
            _ => metadata,
        }
    }

    fn write(&self, prefix: &str, message: &str) {
        if !self.enabled() {
            return;
        }
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        let line = format!("{:>8} | {} | {}\n", prefix, timestamp, message);

        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(f) = file.as_mut() {
            if let Err(e) = f.write_all(line.as_bytes()) {
                tracing::warn!(error = %e, "Failed to write run log");
            }
        }
    }
}
