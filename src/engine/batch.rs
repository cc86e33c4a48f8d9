//! Lifecycle controller.
//!
//! A `Batch` owns the queue, the worker pool and the ticker for one engine.
//! `run` drains the queue and returns the collected rows; `listen` keeps
//! polling until it is stopped from outside. Either way cleanup runs exactly
//! once per run, even when the caller drops the future.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::client::{OperationRegistry, Params};
use crate::config::EngineConfig;
use crate::engine::context::{EngineState, RowCallback, Shared};
use crate::engine::descriptor::{CallDescriptor, Job, ResultSet, RunSummary};
use crate::engine::progress::{self, ProgressSnapshot};
use crate::engine::stop::StopSignal;
use crate::engine::tasks::TaskSet;
use crate::engine::worker;
use crate::error::{BatchError, Result};

/// Cloneable handle for stopping a run from elsewhere, e.g. a Ctrl-C task.
#[derive(Debug, Clone)]
pub struct StopHandle {
    signal: StopSignal,
}

impl StopHandle {
    /// Request a stop. Idempotent; returns false if already stopped.
    pub fn stop(&self, exit_code: i32) -> bool {
        let first = self.signal.trigger(exit_code);
        if first {
            tracing::info!(exit_code, "Stop requested");
        }
        first
    }

    pub fn is_stopped(&self) -> bool {
        self.signal.is_set()
    }
}

pub struct Batch {
    shared: Arc<Shared>,
    registry: OperationRegistry,
    workers: TaskSet,
    clock: Mutex<Option<JoinHandle<()>>>,
    progress: Arc<watch::Sender<ProgressSnapshot>>,
    /// The run log is truncated by the first write after this is set.
    log_fresh: AtomicBool,
}

impl Batch {
    /// Build an engine. Fails on an invalid configuration.
    pub fn new(config: EngineConfig, registry: OperationRegistry) -> Result<Self> {
        let shared = Arc::new(Shared::new(config)?);
        let (progress, _) = watch::channel(ProgressSnapshot::idle());

        Ok(Self {
            shared,
            registry,
            workers: TaskSet::new(),
            clock: Mutex::new(None),
            progress: Arc::new(progress),
            log_fresh: AtomicBool::new(true),
        })
    }

    /// Queue one call. `endpoint` must name a registered operation.
    pub async fn add(&self, endpoint: &str, metadata: Params, params: Params) -> Result<()> {
        let invocable = self.registry.resolve(endpoint)?;
        let descriptor = CallDescriptor::new(endpoint, invocable, params, metadata);
        let label = descriptor.model().unwrap_or(endpoint).to_string();

        self.prepare_log();
        self.shared.queue.enqueue(descriptor);
        self.shared.log.main(format!("QUEUED | {}", label));
        tracing::trace!(endpoint, queued = self.shared.queue.queued_total(), "Queued request");
        Ok(())
    }

    pub async fn add_job(&self, job: Job) -> Result<()> {
        self.add(&job.endpoint, job.metadata, job.params).await
    }

    /// Process every queued call and return the rows that succeeded.
    ///
    /// Fails only when nothing is queued or the engine is already running.
    pub async fn run(&self, callback: Option<RowCallback>) -> Result<ResultSet> {
        if self.shared.queue.is_empty() {
            return Err(BatchError::Configuration(
                "Engine cannot run without at least one job scheduled".to_string(),
            ));
        }
        self.begin(EngineState::Running)?;
        let mut guard = RunGuard::new(self);
        self.setup(callback);

        let drained = tokio::select! {
            _ = self.shared.queue.join() => self.finish_processing().await,
            _ = self.shared.stop.wait() => false,
        };

        let output = self.cleanup(drained).await;
        guard.disarm();
        Ok(output)
    }

    /// Keep polling the queue until stopped. Calls may be added while
    /// listening; the rows collected so far are returned on stop.
    pub async fn listen(&self, callback: Option<RowCallback>) -> Result<ResultSet> {
        self.begin(EngineState::Listening)?;
        let mut guard = RunGuard::new(self);
        self.shared.queue.set_listening(true);
        self.setup(callback);

        self.shared.stop.wait().await;

        let output = self.cleanup(false).await;
        guard.disarm();
        Ok(output)
    }

    /// Stop the current run. Idempotent and non-blocking.
    pub fn stop(&self, exit_code: i32) -> bool {
        self.stop_handle().stop(exit_code)
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            signal: self.shared.stop.clone(),
        }
    }

    /// Subscribe to progress snapshots.
    pub fn progress(&self) -> watch::Receiver<ProgressSnapshot> {
        self.progress.subscribe()
    }

    pub fn state(&self) -> EngineState {
        self.shared.state()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    /// Dispatched calls still waiting on the collaborator.
    pub fn in_flight(&self) -> usize {
        self.shared.processing.active()
    }

    /// Calls waiting in the queue.
    pub fn queue_len(&self) -> usize {
        self.shared.queue.len()
    }

    /// Calls queued this run that have not reached an outcome yet.
    pub fn pending(&self) -> u64 {
        self.shared
            .queue
            .queued_total()
            .saturating_sub(self.shared.totals().completed())
    }

    /// Nothing queued, in flight, or left in a callback.
    pub fn is_idle(&self) -> bool {
        self.pending() == 0 && self.shared.callbacks.active() == 0
    }

    fn clock(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.clock.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn begin(&self, next: EngineState) -> Result<()> {
        let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.can_start() {
            return Err(BatchError::Configuration(format!("Engine is already {}", *state)));
        }
        *state = next;
        Ok(())
    }

    fn prepare_log(&self) {
        if self.log_fresh.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.shared.log.clear() {
                tracing::warn!(error = %e, path = ?self.shared.log.path(), "Failed to open run log");
            }
        }
    }

    fn setup(&self, callback: Option<RowCallback>) {
        let shared = &self.shared;
        shared.stop.reset();
        self.prepare_log();
        shared.reset_run();
        shared.set_callback(callback);

        let limits = shared.rate.limits();
        tracing::info!(
            workers = shared.config.workers,
            queued = shared.queue.len(),
            rpm = limits.requests_per_minute,
            tpm = limits.tokens_per_minute,
            state = %shared.state(),
            "Starting engine"
        );

        let clock = tokio::spawn(progress::run_clock(shared.clone(), self.progress.clone()));
        *self.clock() = Some(clock);

        for id in 1..=shared.config.workers {
            self.workers.spawn(worker::run_worker(shared.clone(), id));
        }
    }

    /// Wait for workers, in-flight calls and callbacks after the queue
    /// drained. Returns false if a stop arrived first.
    async fn finish_processing(&self) -> bool {
        self.shared.log.main("FINISHING PROCESSING");
        let settle = async {
            self.workers.join_all().await;
            self.shared.processing.join_all().await;
            self.shared.callbacks.join_all().await;
        };

        tokio::select! {
            _ = settle => {
                self.shared.stop.trigger(0);
                true
            }
            _ = self.shared.stop.wait() => false,
        }
    }

    async fn cleanup(&self, drained: bool) -> ResultSet {
        let shared = &self.shared;
        shared.set_state(EngineState::Stopping);
        let exit_code = shared.stop.exit_code().unwrap_or(0);
        shared.log.main(format!("STOP EVENT | Exit code {}", exit_code));

        let clock = self.clock().take();
        let mut aborted = 0;
        if drained {
            shared.log.main("WAITING FOR CLOCK");
            if let Some(clock) = clock {
                let _ = clock.await;
            }
        } else {
            shared.log.main("CANCELLING ALL TASKS");
            if let Some(clock) = clock {
                clock.abort();
                let _ = clock.await;
            }
            self.workers.abort_all().await;
            aborted += shared.processing.abort_all().await;
            aborted += shared.callbacks.abort_all().await;
        }

        let totals = shared.totals();
        let (_, tokens) = shared.rate.totals();
        let summary = RunSummary {
            queued: shared.queue.queued_total(),
            succeeded: totals.succeeded,
            timed_out: totals.timed_out,
            failed: totals.failed,
            tokens,
            exit_code,
            cancelled: aborted > 0 || !shared.queue.is_empty(),
        };
        progress::final_tick(shared, &self.progress);

        let index = shared.config.result_index.clone();
        if let Some(fields) = &index {
            shared.log.main(format!("INDEX | {}", fields.join(", ")));
        }
        let output = ResultSet::new(shared.take_output(), index, summary);

        shared.queue.close();
        shared.reset_run();
        shared.set_callback(None);
        self.workers.clear();

        shared.log.main(format!("RETURNING OUTPUT | {} rows", output.len()));
        shared.log.close();
        self.log_fresh.store(true, Ordering::SeqCst);

        shared.set_state(EngineState::Stopped);
        self.progress.send_modify(|p| p.state = EngineState::Stopped);
        tracing::info!(
            queued = summary.queued,
            succeeded = summary.succeeded,
            timed_out = summary.timed_out,
            failed = summary.failed,
            tokens = summary.tokens,
            exit_code,
            cancelled = summary.cancelled,
            "Engine stopped"
        );
        output
    }

    /// Tear down after the run future was dropped mid-flight.
    fn abandon(&self) {
        let shared = &self.shared;
        shared.stop.trigger(1);
        if let Some(clock) = self.clock().take() {
            clock.abort();
        }
        self.workers.abort_now();
        let aborted = shared.processing.abort_now() + shared.callbacks.abort_now();
        let dropped = shared.queue.close();
        shared.take_output();
        shared.reset_run();
        shared.set_callback(None);
        shared.log.close();
        self.log_fresh.store(true, Ordering::SeqCst);
        shared.set_state(EngineState::Stopped);
        tracing::warn!(aborted, dropped, "Run abandoned before completion");
    }
}

impl fmt::Debug for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batch")
            .field("state", &self.state())
            .field("queued", &self.queue_len())
            .field("in_flight", &self.in_flight())
            .field("registry", &self.registry)
            .finish()
    }
}

/// Runs `abandon` if a run/listen future is dropped before cleanup finished.
struct RunGuard<'a> {
    batch: &'a Batch,
    armed: bool,
}

impl<'a> RunGuard<'a> {
    fn new(batch: &'a Batch) -> Self {
        Self { batch, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.batch.abandon();
        }
    }
}
