use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::client::{AzureConfig, OPENAI_API_KEY_ENV, OPENAI_API_URL};
use crate::error::BatchError;

/// Top-level configuration file. Process logging is filtered by `RUST_LOG`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub api: ApiConfig,
}

/// Knobs for one `Batch` engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Dispatch attempts per minute; derived from the token limit when unset.
    pub requests_per_minute: Option<u32>,
    pub tokens_per_minute: u32,
    pub workers: usize,
    /// Fraction of the token budget held in reserve, in [0, 1).
    pub safety_margin: f64,
    pub timeout_secs: u64,
    /// 0 = silent, 1 = metadata only, 2 = metadata and parameters.
    pub log_verbosity: u8,
    /// Run log. It is truncated by the first write after a finished run,
    /// which is the first `add` or else the run start.
    pub log_path: Option<PathBuf>,
    /// Fields the final result set is sorted by, e.g. `metadata.pid`.
    pub result_index: Option<Vec<String>>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: None,
            tokens_per_minute: 10_000,
            workers: 8,
            safety_margin: 0.1,
            timeout_secs: 60,
            log_verbosity: 1,
            log_path: Some(PathBuf::from("batchwise.log")),
            result_index: None,
        }
    }
}

impl EngineConfig {
    pub fn with_tokens_per_minute(mut self, tpm: u32) -> Self {
        self.tokens_per_minute = tpm;
        self
    }

    pub fn with_requests_per_minute(mut self, rpm: u32) -> Self {
        self.requests_per_minute = Some(rpm);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_safety_margin(mut self, safety_margin: f64) -> Self {
        self.safety_margin = safety_margin;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_log_verbosity(mut self, verbosity: u8) -> Self {
        self.log_verbosity = verbosity;
        self
    }

    pub fn with_log_path(mut self, path: Option<PathBuf>) -> Self {
        self.log_path = path;
        self
    }

    pub fn with_result_index<S: Into<String>>(mut self, fields: impl IntoIterator<Item = S>) -> Self {
        self.result_index = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Requests-per-minute cap, derived as `tpm / 1000 * 6` when unset.
    pub fn effective_requests_per_minute(&self) -> u32 {
        self.requests_per_minute
            .unwrap_or(self.tokens_per_minute / 1000 * 6)
            .max(1)
    }

    pub fn per_call_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Reject settings the engine cannot honour.
    pub fn validate(&self) -> crate::Result<()> {
        if self.log_verbosity > 2 {
            return Err(BatchError::Configuration(format!(
                "Allowable `log_verbosity` values are 0, 1, or 2; found {}",
                self.log_verbosity
            )));
        }
        if !(0.0..1.0).contains(&self.safety_margin) {
            return Err(BatchError::Configuration(format!(
                "`safety_margin` must be in [0, 1); found {}",
                self.safety_margin
            )));
        }
        if self.workers == 0 {
            return Err(BatchError::Configuration("`workers` must be at least 1".to_string()));
        }
        if self.tokens_per_minute == 0 {
            return Err(BatchError::Configuration(
                "`tokens_per_minute` must be at least 1".to_string(),
            ));
        }
        if self.requests_per_minute == Some(0) {
            return Err(BatchError::Configuration(
                "`requests_per_minute` must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Where and how to reach the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub api_key_env: String,
    /// One engine per entry; jobs are split evenly across them.
    pub azure: Vec<AzureConfig>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: OPENAI_API_URL.to_string(),
            api_key_env: OPENAI_API_KEY_ENV.to_string(),
            azure: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration with fallback chain.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try primary location: ~/.config/<project>/<project>.yml
        if let Some(config_dir) = dirs::config_dir() {
            let project_name = env!("CARGO_PKG_NAME");
            let primary_config = config_dir.join(project_name).join(format!("{}.yml", project_name));
            if primary_config.exists() {
                match Self::load_from_file(&primary_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from {}: {}", primary_config.display(), e);
                    }
                }
            }
        }

        // Try fallback location: ./<project>.yml
        let project_name = env!("CARGO_PKG_NAME");
        let fallback_config = PathBuf::from(format!("{}.yml", project_name));
        if fallback_config.exists() {
            match Self::load_from_file(&fallback_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", fallback_config.display(), e);
                }
            }
        }

        // No config file found, use defaults
        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        config.engine.validate().context("Invalid engine settings")?;

        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}
