//! State shared by the controller, workers, dispatcher tasks and the ticker.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::engine::descriptor::ResultRow;
use crate::engine::queue::RequestQueue;
use crate::engine::rate::{RateLimits, RateTracker};
use crate::engine::runlog::{RunLog, Verbosity};
use crate::engine::stop::StopSignal;
use crate::engine::tasks::TaskSet;
use crate::error::Result;

/// Lifecycle of a `Batch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Idle,
    Running,
    Listening,
    Stopping,
    Stopped,
}

impl EngineState {
    /// Whether a new `run`/`listen` may start from this state.
    pub fn can_start(&self) -> bool {
        matches!(self, EngineState::Idle | EngineState::Stopped)
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EngineState::Idle => "idle",
            EngineState::Running => "running",
            EngineState::Listening => "listening",
            EngineState::Stopping => "stopping",
            EngineState::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

/// Per-result hook, run as its own task after a row is appended.
pub type RowCallback = Arc<dyn Fn(ResultRow) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a `RowCallback`.
pub fn callback<F, Fut>(f: F) -> RowCallback
where
    F: Fn(ResultRow) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |row| f(row).boxed())
}

/// Terminal outcomes counted during one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Totals {
    pub succeeded: u64,
    pub timed_out: u64,
    pub failed: u64,
}

impl Totals {
    pub fn completed(&self) -> u64 {
        self.succeeded + self.timed_out + self.failed
    }
}

pub(crate) struct Shared {
    pub config: EngineConfig,
    pub queue: RequestQueue,
    pub rate: RateTracker,
    pub stop: StopSignal,
    /// Serializes "pull + authorize" across workers.
    pub turn: tokio::sync::Mutex<()>,
    pub totals: Mutex<Totals>,
    pub output: Mutex<Vec<ResultRow>>,
    pub processing: TaskSet,
    pub callbacks: TaskSet,
    /// First response headers seen this run.
    pub headers: Mutex<Option<HashMap<String, String>>>,
    pub callback: RwLock<Option<RowCallback>>,
    pub log: RunLog,
    pub state: Mutex<EngineState>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Shared {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let verbosity = Verbosity::try_from(config.log_verbosity)?;
        let log = RunLog::new(config.log_path.clone(), verbosity);
        let rate = RateTracker::new(RateLimits::from_config(&config), config.safety_margin);

        Ok(Self {
            config,
            queue: RequestQueue::new(),
            rate,
            stop: StopSignal::new(),
            turn: tokio::sync::Mutex::new(()),
            totals: Mutex::new(Totals::default()),
            output: Mutex::new(Vec::new()),
            processing: TaskSet::new(),
            callbacks: TaskSet::new(),
            headers: Mutex::new(None),
            callback: RwLock::new(None),
            log,
            state: Mutex::new(EngineState::Idle),
        })
    }

    pub fn state(&self) -> EngineState {
        *lock(&self.state)
    }

    pub fn set_state(&self, state: EngineState) {
        let previous = std::mem::replace(&mut *lock(&self.state), state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "Engine state changed");
        }
    }

    pub fn totals(&self) -> Totals {
        *lock(&self.totals)
    }

    pub fn update_totals(&self, f: impl FnOnce(&mut Totals)) {
        f(&mut lock(&self.totals));
    }

    pub fn push_row(&self, row: ResultRow) {
        lock(&self.output).push(row);
    }

    pub fn take_output(&self) -> Vec<ResultRow> {
        std::mem::take(&mut *lock(&self.output))
    }

    /// Cache the headers if they are the first of this run. Returns true
    /// when they were cached.
    pub fn cache_headers(&self, headers: &HashMap<String, String>) -> bool {
        let mut cached = lock(&self.headers);
        if cached.is_some() {
            return false;
        }
        *cached = Some(headers.clone());
        true
    }

    pub fn callback(&self) -> Option<RowCallback> {
        self.callback.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_callback(&self, callback: Option<RowCallback>) {
        *self.callback.write().unwrap_or_else(|e| e.into_inner()) = callback;
    }

    /// Zero everything that belongs to a single run.
    pub fn reset_run(&self) {
        *lock(&self.totals) = Totals::default();
        *lock(&self.headers) = None;
        self.rate.reset();
    }
}
