//! Token and request budgets for coordinated throttling.
//!
//! The remote service enforces two independent per-minute budgets. Workers
//! consult a single shared `RateTracker` before every dispatch: the token
//! budget is checked against the observed consumption rate (with a safety
//! margin, since a response's cost is unknown until it arrives), and the
//! request budget is enforced by pacing dispatch attempts.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::{Instant, sleep};

use crate::client::HeaderLimits;
use crate::config::EngineConfig;
use crate::engine::stop::StopSignal;

/// How often a throttled worker re-checks the token budget.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The two per-minute limits imposed by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimits {
    pub requests_per_minute: u32,
    pub tokens_per_minute: u32,
}

impl RateLimits {
    /// Create limits. A request limit of 0 is raised to 1.
    pub fn new(tokens_per_minute: u32, requests_per_minute: u32) -> Self {
        Self {
            requests_per_minute: requests_per_minute.max(1),
            tokens_per_minute,
        }
    }

    /// Limits for an engine, deriving the request limit when it is unset.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.tokens_per_minute, config.effective_requests_per_minute())
    }

    /// Minimum spacing between dispatch attempts.
    pub fn pacing_interval(&self) -> Duration {
        Duration::from_secs_f64(60.0 / f64::from(self.requests_per_minute.max(1)))
    }
}

/// Rolling counters for one run.
#[derive(Debug)]
pub struct RateState {
    pub limits: RateLimits,
    pub safety_margin: f64,
    pub observed_requests: u64,
    pub observed_tokens: u64,
    pub window_start: Instant,
    /// When the previous dispatch attempt was authorized.
    pub last_dispatch: Option<Instant>,
}

impl RateState {
    pub fn new(limits: RateLimits, safety_margin: f64) -> Self {
        Self {
            limits,
            safety_margin,
            observed_requests: 0,
            observed_tokens: 0,
            window_start: Instant::now(),
            last_dispatch: None,
        }
    }

    fn elapsed_minutes(&self, now: Instant) -> f64 {
        now.saturating_duration_since(self.window_start).as_secs_f64() / 60.0
    }

    fn per_minute(&self, count: u64, now: Instant) -> f64 {
        if count == 0 {
            return 0.0;
        }
        let minutes = self.elapsed_minutes(now);
        if minutes <= 0.0 {
            return f64::INFINITY;
        }
        count as f64 / minutes
    }

    /// Observed tokens per minute since the window started.
    pub fn current_tpm(&self, now: Instant) -> f64 {
        self.per_minute(self.observed_tokens, now)
    }

    /// Observed successful requests per minute since the window started.
    pub fn current_rpm(&self, now: Instant) -> f64 {
        self.per_minute(self.observed_requests, now)
    }

    /// Mean cost of a request so far; the estimate for the next one.
    pub fn average_tokens_per_request(&self) -> f64 {
        if self.observed_requests == 0 {
            0.0
        } else {
            self.observed_tokens as f64 / self.observed_requests as f64
        }
    }

    /// Token rate the engine aims to stay under.
    pub fn effective_tpm(&self) -> f64 {
        (1.0 - self.safety_margin) * f64::from(self.limits.tokens_per_minute)
    }

    /// Whether one more average-sized request fits in the token budget.
    pub fn is_within_budget(&self, now: Instant) -> bool {
        self.current_tpm(now) + self.average_tokens_per_request() < self.effective_tpm()
    }

    /// How long until the request pacing allows another dispatch.
    pub fn pacing_delay(&self, now: Instant) -> Duration {
        match self.last_dispatch {
            Some(last) => self
                .limits
                .pacing_interval()
                .saturating_sub(now.saturating_duration_since(last)),
            None => Duration::ZERO,
        }
    }

    /// Count one successful call.
    pub fn record(&mut self, tokens: u64) {
        self.observed_requests += 1;
        self.observed_tokens += tokens;
    }

    /// Adopt limits reported by the service. Returns true if anything changed.
    pub fn apply_limits(&mut self, reported: HeaderLimits) -> bool {
        let mut limits = self.limits;
        if let Some(rpm) = reported.requests_per_minute.filter(|v| *v > 0) {
            limits.requests_per_minute = rpm;
        }
        if let Some(tpm) = reported.tokens_per_minute.filter(|v| *v > 0) {
            limits.tokens_per_minute = tpm;
        }
        let changed = limits != self.limits;
        self.limits = limits;
        changed
    }

    /// Start a fresh window with zeroed counters.
    pub fn reset(&mut self, limits: RateLimits) {
        self.limits = limits;
        self.observed_requests = 0;
        self.observed_tokens = 0;
        self.window_start = Instant::now();
        self.last_dispatch = None;
    }
}

/// Shared gatekeeper consulted by every worker before dispatch.
#[derive(Debug)]
pub struct RateTracker {
    state: Mutex<RateState>,
    configured: RateLimits,
    throttled: AtomicBool,
}

impl RateTracker {
    pub fn new(limits: RateLimits, safety_margin: f64) -> Self {
        Self {
            state: Mutex::new(RateState::new(limits, safety_margin)),
            configured: limits,
            throttled: AtomicBool::new(false),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut RateState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    /// Wait until a dispatch fits both budgets, then mark it as started.
    ///
    /// Only delays, never rejects. Returns early if the run is stopped.
    /// Pacing sleeps in poll-sized steps and the token budget is re-checked
    /// after each one: responses and reported limits keep landing while a
    /// worker waits.
    pub async fn authorize(&self, stop: &StopSignal) {
        loop {
            self.wait_for_budget(stop).await;
            let delay = self.with_state(|s| s.pacing_delay(Instant::now()));
            if delay.is_zero() || stop.is_set() {
                break;
            }
            tokio::select! {
                _ = sleep(delay.min(POLL_INTERVAL)) => {}
                _ = stop.wait() => break,
            }
        }
        self.with_state(|s| s.last_dispatch = Some(Instant::now()));
    }

    async fn wait_for_budget(&self, stop: &StopSignal) {
        let mut throttled = false;
        while !stop.is_set() && !self.with_state(|s| s.is_within_budget(Instant::now())) {
            if !throttled {
                throttled = true;
                self.throttled.store(true, Ordering::SeqCst);
                let (tpm, effective) = self.with_state(|s| (s.current_tpm(Instant::now()), s.effective_tpm()));
                tracing::debug!(current_tpm = tpm, effective_tpm = effective, "Token budget exhausted, waiting");
            }
            sleep(POLL_INTERVAL).await;
        }
        self.throttled.store(false, Ordering::SeqCst);
    }

    /// Whether some worker is currently held back by the token budget.
    pub fn is_throttled(&self) -> bool {
        self.throttled.load(Ordering::SeqCst)
    }

    pub fn record(&self, tokens: u64) {
        self.with_state(|s| s.record(tokens));
    }

    /// Correct the limits from response headers (the latest report wins).
    pub fn apply_limits(&self, reported: HeaderLimits) {
        if reported.is_empty() {
            return;
        }
        let (changed, limits) = self.with_state(|s| (s.apply_limits(reported), s.limits));
        if changed {
            tracing::info!(
                rpm = limits.requests_per_minute,
                tpm = limits.tokens_per_minute,
                "Service reported different rate limits, adopting them"
            );
        }
    }

    pub fn limits(&self) -> RateLimits {
        self.with_state(|s| s.limits)
    }

    /// `(requests, tokens)` observed so far.
    pub fn totals(&self) -> (u64, u64) {
        self.with_state(|s| (s.observed_requests, s.observed_tokens))
    }

    /// `(rpm, tpm)` observed so far.
    pub fn current_rates(&self) -> (f64, f64) {
        let now = Instant::now();
        self.with_state(|s| (s.current_rpm(now), s.current_tpm(now)))
    }

    /// Zero the counters and restore the configured limits.
    pub fn reset(&self) {
        self.with_state(|s| s.reset(self.configured));
        self.throttled.store(false, Ordering::SeqCst);
    }
}
