//! Spread one job list over several engines, e.g. one per Azure deployment.

use futures::future::try_join_all;

use crate::engine::batch::Batch;
use crate::engine::descriptor::{Job, ResultSet};
use crate::error::{BatchError, Result};

/// Split `jobs` into `parts` contiguous chunks of `len / parts`, the
/// remainder going to the last chunk.
pub fn split_evenly<T>(mut items: Vec<T>, parts: usize) -> Vec<Vec<T>> {
    if parts == 0 {
        return Vec::new();
    }
    let size = items.len() / parts;
    let mut chunks = Vec::with_capacity(parts);
    for _ in 0..parts - 1 {
        let rest = items.split_off(size);
        chunks.push(items);
        items = rest;
    }
    chunks.push(items);
    chunks
}

/// Run the jobs across `batches` concurrently and concatenate the rows.
///
/// Engines that receive no jobs are skipped. An unknown endpoint fails the
/// whole call before anything is queued. The combined set is sorted by the
/// first engine's result index, if any.
pub async fn run_sharded(batches: &[Batch], jobs: Vec<Job>) -> Result<ResultSet> {
    if batches.is_empty() {
        return Err(BatchError::Configuration("No engines configured".to_string()));
    }
    if jobs.is_empty() {
        return Err(BatchError::Configuration(
            "Engine cannot run without at least one job scheduled".to_string(),
        ));
    }

    let chunks = split_evenly(jobs, batches.len());
    // Resolve every endpoint before queueing so a bad job leaves no engine
    // holding part of the list.
    for (batch, chunk) in batches.iter().zip(&chunks) {
        for job in chunk {
            batch.registry().resolve(&job.endpoint)?;
        }
    }

    let mut runs = Vec::new();
    for (batch, chunk) in batches.iter().zip(chunks) {
        if chunk.is_empty() {
            continue;
        }
        for job in chunk {
            batch.add_job(job).await?;
        }
        runs.push(batch.run(None));
    }
    tracing::info!(engines = runs.len(), "Running sharded batch");

    let results = try_join_all(runs).await?;
    let mut combined = ResultSet::new(
        Vec::new(),
        batches[0].config().result_index.clone(),
        Default::default(),
    );
    for result in results {
        combined.extend(result);
    }
    Ok(combined)
}
