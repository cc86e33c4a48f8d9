//! Batch Engine - throttled, concurrent execution of queued API calls.
//!
//! This module provides:
//! - **RequestQueue**: unbounded FIFO of call descriptors with a listening mode
//! - **RateTracker**: token and request budgets, enforced by waiting
//! - **Worker pool**: N workers serializing "pull + authorize" behind a turn lock
//! - **Dispatcher**: one call with a timeout; failures are logged and dropped
//! - **Batch**: lifecycle controller with run/listen/stop and progress snapshots
//!
//! # Example
//!
//! ```ignore
//! use batchwise::client::StubInvocable;
//! use batchwise::config::EngineConfig;
//! use batchwise::engine::Batch;
//!
//! let batch = Batch::new(EngineConfig::default(), StubInvocable::new(50).into_registry())?;
//! batch.add("chat.completions.create", metadata, params).await?;
//! let rows = batch.run(None).await?;
//! ```

pub mod batch;
pub mod context;
pub mod descriptor;
pub mod dispatcher;
pub mod progress;
pub mod queue;
pub mod rate;
pub mod runlog;
pub mod shard;
pub mod stop;
pub mod tasks;
mod worker;

pub use batch::{Batch, StopHandle};
pub use context::{EngineState, RowCallback, Totals, callback};
pub use descriptor::{CallDescriptor, Job, ResultRow, ResultSet, RunSummary, compare_values};
pub use dispatcher::Outcome;
pub use progress::{ProgressSnapshot, RunStatus};
pub use queue::{QueueEmpty, RequestQueue};
pub use rate::{RateLimits, RateState, RateTracker};
pub use runlog::{RunLog, Verbosity};
pub use shard::{run_sharded, split_evenly};
pub use stop::StopSignal;
