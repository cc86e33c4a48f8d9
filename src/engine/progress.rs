//! Progress snapshots published by the ticker task.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::engine::context::{EngineState, Shared};

/// How often the ticker wakes.
pub const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Minimum spacing between two recomputed snapshots.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunStatus {
    Running,
    /// Some worker is held back by the token budget.
    Waiting,
    Done,
    Stopped,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Running => "Running",
            RunStatus::Waiting => "Waiting",
            RunStatus::Done => "Done",
            RunStatus::Stopped => "Stopped",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub state: EngineState,
    pub completed: u64,
    pub queued: u64,
    pub current_rpm: f64,
    pub current_tpm: f64,
    pub rpm_limit: u32,
    pub tpm_limit: u32,
    pub status: RunStatus,
}

impl ProgressSnapshot {
    /// Snapshot of an engine that has not run yet.
    pub fn idle() -> Self {
        Self {
            state: EngineState::Idle,
            completed: 0,
            queued: 0,
            current_rpm: 0.0,
            current_tpm: 0.0,
            rpm_limit: 0,
            tpm_limit: 0,
            status: RunStatus::Done,
        }
    }

    /// Fraction of queued descriptors that reached a terminal outcome.
    pub fn fraction(&self) -> f64 {
        if self.queued == 0 {
            0.0
        } else {
            (self.completed as f64 / self.queued as f64).min(1.0)
        }
    }

    pub(crate) fn capture(shared: &Shared) -> Self {
        let (current_rpm, current_tpm) = shared.rate.current_rates();
        let limits = shared.rate.limits();
        let completed = shared.totals().completed();
        let queued = shared.queue.queued_total();

        let status = match shared.stop.exit_code() {
            Some(0) => RunStatus::Done,
            Some(_) => RunStatus::Stopped,
            None if shared.rate.is_throttled() => RunStatus::Waiting,
            None => RunStatus::Running,
        };

        Self {
            state: shared.state(),
            completed,
            queued,
            current_rpm: finite(current_rpm),
            current_tpm: finite(current_tpm),
            rpm_limit: limits.requests_per_minute,
            tpm_limit: limits.tokens_per_minute,
            status,
        }
    }
}

/// Rates are unbounded in the first instant of a run; report those as zero.
fn finite(rate: f64) -> f64 {
    if rate.is_finite() { rate } else { 0.0 }
}

/// Tick until the stop event is set, publishing a snapshot at most once per
/// `REFRESH_INTERVAL`. The controller publishes the final snapshot itself.
pub(crate) async fn run_clock(shared: Arc<Shared>, progress: Arc<watch::Sender<ProgressSnapshot>>) {
    let mut last_refresh: Option<Instant> = None;
    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    while !shared.stop.is_set() {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shared.stop.wait() => break,
        }
        let now = Instant::now();
        if last_refresh.is_none_or(|last| now.duration_since(last) >= REFRESH_INTERVAL) {
            last_refresh = Some(now);
            progress.send_replace(ProgressSnapshot::capture(&shared));
        }
    }
}

/// Publish a snapshot immediately, bypassing the refresh interval.
pub(crate) fn final_tick(shared: &Shared, progress: &watch::Sender<ProgressSnapshot>) {
    progress.send_replace(ProgressSnapshot::capture(shared));
}
