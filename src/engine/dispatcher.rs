//! Execute one descriptor against its collaborator.
//!
//! Failures never escape this module: a timeout or remote error is logged,
//! counted and the descriptor is dropped. Only successes produce a row.

use std::sync::Arc;

use crate::engine::context::Shared;
use crate::engine::descriptor::{CallDescriptor, ResultRow};
use crate::error::BatchError;

/// How a single dispatch ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded { tokens: u64 },
    TimedOut,
    Failed(String),
}

pub(crate) async fn process(shared: Arc<Shared>, descriptor: CallDescriptor, worker: usize) -> Outcome {
    let description = shared.log.describe(&descriptor.metadata, &descriptor.parameters);
    shared.log.worker(worker, format!("PROCESSING | {}", description));

    let timeout = shared.config.per_call_timeout();
    let call = descriptor.invocable.invoke(&descriptor.parameters);
    let response = match tokio::time::timeout(timeout, call).await {
        Err(_) => {
            let err = BatchError::Timeout { secs: timeout.as_secs() };
            tracing::warn!(worker, endpoint = %descriptor.endpoint, error = %err, "Dropping request");
            shared.log.worker(worker, format!("TIMEOUT | {}", description));
            shared.update_totals(|t| t.timed_out += 1);
            return Outcome::TimedOut;
        }
        Ok(Err(err)) => {
            tracing::warn!(worker, endpoint = %descriptor.endpoint, error = %err, "Dropping request");
            shared.log.worker(worker, format!("PROCESSING ERROR | {} | {}", description, err));
            shared.update_totals(|t| t.failed += 1);
            return Outcome::Failed(err.to_string());
        }
        Ok(Ok(response)) => response,
    };

    shared.rate.apply_limits(response.rate_limits());
    if shared.cache_headers(&response.headers) {
        let headers = serde_json::to_string(&response.headers).unwrap_or_default();
        shared.log.worker(worker, format!("HEADERS | {}", headers));
    }

    let tokens = response.total_tokens();
    shared.rate.record(tokens);

    let row = ResultRow {
        metadata: descriptor.metadata,
        endpoint: descriptor.endpoint,
        parameters: descriptor.parameters,
        result: response.body,
    };
    shared.push_row(row.clone());
    shared.log.worker(worker, format!("PROCESSED | {}", description));
    shared.update_totals(|t| t.succeeded += 1);
    tracing::debug!(worker, tokens, "Request processed");

    if let Some(callback) = shared.callback() {
        shared.callbacks.spawn(callback(row));
    }

    Outcome::Succeeded { tokens }
}
