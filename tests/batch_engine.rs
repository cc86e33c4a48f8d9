//! Batch engine integration tests.
//!
//! Every test drives a real `Batch` against the in-process stub collaborator
//! on a paused clock, so rate-limit waits of several minutes run instantly.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use batchwise::client::{Params, StubInvocable};
use batchwise::config::EngineConfig;
use batchwise::engine::{Batch, EngineState, Job, ResultRow, RunStatus, callback, run_sharded};
use batchwise::BatchError;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::time::Instant;

const CHAT: &str = "chat.completions.create";

fn params(value: Value) -> Params {
    match value {
        Value::Object(map) => map,
        _ => Params::new(),
    }
}

/// Generous budgets and no run log.
fn config() -> EngineConfig {
    EngineConfig::default()
        .with_log_path(None)
        .with_tokens_per_minute(1_000_000)
}

fn chat_params(content: &str) -> Params {
    params(json!({
        "model": "gpt-4o-mini",
        "messages": [{ "role": "user", "content": content }],
    }))
}

async fn add_pids(batch: &Batch, pids: impl IntoIterator<Item = i64>) {
    for pid in pids {
        batch
            .add(CHAT, params(json!({ "pid": pid })), chat_params("hello"))
            .await
            .unwrap();
    }
}

fn pids(rows: &[ResultRow]) -> Vec<i64> {
    rows.iter().filter_map(|r| r.metadata["pid"].as_i64()).collect()
}

fn minutes_between(start: Instant, at: Instant) -> f64 {
    at.duration_since(start).as_secs_f64() / 60.0
}

/// K descriptors against an always-succeeding stub give exactly K rows.
#[tokio::test(start_paused = true)]
async fn test_drain_convergence() {
    let stub = Arc::new(StubInvocable::new(10));
    let batch = Batch::new(config(), StubInvocable::registry(stub.clone())).unwrap();
    add_pids(&batch, 0..25).await;

    let output = batch.run(None).await.unwrap();

    assert_eq!(output.len(), 25);
    assert_eq!(stub.calls(), 25);
    let summary = output.summary();
    assert_eq!(summary.queued, 25);
    assert_eq!(summary.completed(), summary.queued);
    assert_eq!(summary.tokens, 250);
    assert_eq!(summary.exit_code, 0);
    assert!(!summary.cancelled);
}

/// No descriptor is dispatched twice or produces two rows.
#[tokio::test(start_paused = true)]
async fn test_no_duplicate_processing() {
    let stub = Arc::new(StubInvocable::new(5).with_latency_param("delay_ms"));
    let batch = Batch::new(config().with_workers(6), StubInvocable::registry(stub.clone())).unwrap();
    for pid in 0..40 {
        let delay = (pid * 37) % 250;
        batch
            .add(CHAT, params(json!({ "pid": pid })), params(json!({ "model": "m", "delay_ms": delay })))
            .await
            .unwrap();
    }

    let output = batch.run(None).await.unwrap();

    assert_eq!(stub.calls(), 40);
    let mut seen = pids(output.rows());
    seen.sort();
    assert_eq!(seen, (0..40).collect::<Vec<_>>());
}

/// A call that never resolves is dropped after the timeout and the run completes.
#[tokio::test(start_paused = true)]
async fn test_drop_on_timeout() {
    let batch = Batch::new(config().with_timeout_secs(1), StubInvocable::hanging().into_registry()).unwrap();
    add_pids(&batch, [1]).await;

    let start = Instant::now();
    let output = tokio::time::timeout(Duration::from_secs(30), batch.run(None))
        .await
        .expect("run should not hang")
        .unwrap();

    assert!(output.is_empty());
    assert_eq!(output.summary().timed_out, 1);
    assert_eq!(output.summary().exit_code, 0);
    assert!(start.elapsed() >= Duration::from_secs(1));
    assert_eq!(batch.state(), EngineState::Stopped);
}

/// Remote errors are swallowed: no row, no error from `run`.
#[tokio::test(start_paused = true)]
async fn test_remote_errors_are_dropped() {
    let batch = Batch::new(config(), StubInvocable::failing("invalid_request_error").into_registry()).unwrap();
    add_pids(&batch, 0..3).await;

    let output = batch.run(None).await.unwrap();

    assert!(output.is_empty());
    assert_eq!(output.summary().failed, 3);
}

/// Stopping after three rows returns exactly those three rows.
#[tokio::test(start_paused = true)]
async fn test_cancellation_keeps_completed_rows() {
    // 60 rpm => one dispatch per second, each answered after 100ms
    let stub = Arc::new(StubInvocable::new(10).with_latency(Duration::from_millis(100)));
    let config = config().with_workers(1).with_requests_per_minute(60);
    let batch = Batch::new(config, StubInvocable::registry(stub.clone())).unwrap();
    add_pids(&batch, 0..10).await;

    let handle = batch.stop_handle();
    let completed = Arc::new(AtomicUsize::new(0));
    let counter = completed.clone();
    let on_row = callback(move |_row| {
        let handle = handle.clone();
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                handle.stop(1);
            }
        }
    });

    let output = batch.run(Some(on_row)).await.unwrap();

    assert_eq!(output.len(), 3);
    assert_eq!(pids(output.rows()), vec![0, 1, 2]);
    assert_eq!(stub.calls(), 3);
    let summary = output.summary();
    assert_eq!(summary.exit_code, 1);
    assert!(summary.cancelled);
    assert_eq!(summary.queued, 10);
    assert_eq!(batch.state(), EngineState::Stopped);
    assert_eq!(batch.queue_len(), 0);
}

/// An external stop mid-call discards the in-flight call.
#[tokio::test(start_paused = true)]
async fn test_stop_discards_in_flight_calls() {
    let stub = Arc::new(StubInvocable::new(10).with_latency(Duration::from_secs(10)));
    let batch = Arc::new(Batch::new(config().with_workers(2), StubInvocable::registry(stub.clone())).unwrap());
    add_pids(&batch, 0..4).await;

    let stopper = batch.stop_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        stopper.stop(1);
    });

    let output = batch.run(None).await.unwrap();

    assert!(output.is_empty());
    assert!(stub.calls() >= 1);
    assert!(output.summary().cancelled);
    assert_eq!(batch.in_flight(), 0);
}

/// Rows come back sorted by the index even when they complete out of order.
#[tokio::test(start_paused = true)]
async fn test_index_ordering() {
    let stub = StubInvocable::new(10).with_latency_param("delay_ms");
    let config = config().with_workers(3).with_result_index(["metadata.pid"]);
    let batch = Batch::new(config, stub.into_registry()).unwrap();

    for (pid, delay) in [(3, 10), (1, 300), (2, 100)] {
        batch
            .add(CHAT, params(json!({ "pid": pid })), params(json!({ "model": "m", "delay_ms": delay })))
            .await
            .unwrap();
    }

    let arrivals = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = arrivals.clone();
    let on_row = callback(move |row: ResultRow| {
        let sink = sink.clone();
        async move {
            sink.lock().unwrap().push(row.metadata["pid"].as_i64().unwrap());
        }
    });

    let output = batch.run(Some(on_row)).await.unwrap();

    assert_eq!(*arrivals.lock().unwrap(), vec![3, 2, 1]);
    assert_eq!(pids(output.rows()), vec![1, 2, 3]);
    assert_eq!(output.index(), Some(&["metadata.pid".to_string()][..]));
}

/// Five 50-token calls under a 100 tpm budget with a 10% margin.
#[tokio::test(start_paused = true)]
async fn test_token_budget_spreads_dispatches() {
    let stub = Arc::new(StubInvocable::new(50));
    let config = config().with_tokens_per_minute(100).with_safety_margin(0.1);
    let batch = Batch::new(config, StubInvocable::registry(stub.clone())).unwrap();
    add_pids(&batch, 0..5).await;

    let start = Instant::now();
    let output = batch.run(None).await.unwrap();

    assert_eq!(output.len(), 5);
    for row in output.rows() {
        assert_eq!(row.result["usage"]["total_tokens"], json!(50));
    }

    // 50k/m + 50 < 90 first holds at m = 1.25k minutes
    let offsets: Vec<Duration> = stub.call_instants().iter().map(|t| t.duration_since(start)).collect();
    assert_eq!(offsets.len(), 5);
    for (k, offset) in offsets.iter().enumerate() {
        let expected = Duration::from_secs(75 * k as u64);
        assert!(*offset >= expected, "call {} at {:?}", k, offset);
        assert!(*offset <= expected + Duration::from_millis(200), "call {} at {:?}", k, offset);
    }
}

/// After the first minute the token rate never exceeds the effective budget.
#[tokio::test(start_paused = true)]
async fn test_rate_ceiling() {
    let stub = Arc::new(StubInvocable::new(100));
    let config = config()
        .with_tokens_per_minute(6_000)
        .with_requests_per_minute(6_000)
        .with_safety_margin(0.1)
        .with_workers(4);
    let batch = Batch::new(config, StubInvocable::registry(stub.clone())).unwrap();
    add_pids(&batch, 0..150).await;

    let start = Instant::now();
    let output = batch.run(None).await.unwrap();
    assert_eq!(output.len(), 150);

    let effective = 0.9 * 6_000.0;
    let mut checked = 0;
    for (k, at) in stub.call_instants().into_iter().enumerate() {
        let minutes = minutes_between(start, at);
        if minutes < 1.0 {
            continue;
        }
        let tokens = 100.0 * (k + 1) as f64;
        let rate = tokens / minutes;
        assert!(rate <= effective * 1.01, "call {} at {:.3} min: {:.0} tpm", k, minutes, rate);
        checked += 1;
    }
    assert!(checked > 50);
}

/// Limits reported in response headers replace the configured ones.
#[tokio::test(start_paused = true)]
async fn test_header_limits_are_adopted() {
    let stub = StubInvocable::new(50)
        .with_header("x-ratelimit-limit-requests", "6000")
        .with_header("x-ratelimit-limit-tokens", "1000000");
    let config = config().with_tokens_per_minute(100);
    let batch = Batch::new(config, stub.into_registry()).unwrap();
    add_pids(&batch, 0..5).await;

    let start = Instant::now();
    let output = batch.run(None).await.unwrap();

    assert_eq!(output.len(), 5);
    assert!(start.elapsed() < Duration::from_secs(5), "took {:?}", start.elapsed());
}

/// Every row reaches the callback, and the run waits for slow callbacks.
#[tokio::test(start_paused = true)]
async fn test_callbacks_fire_for_every_row() {
    let batch = Batch::new(config(), StubInvocable::new(10).into_registry()).unwrap();
    add_pids(&batch, 0..12).await;

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    let on_row = callback(move |_row| {
        let counter = counter.clone();
        async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    let output = batch.run(Some(on_row)).await.unwrap();

    assert_eq!(output.len(), 12);
    assert_eq!(fired.load(Ordering::SeqCst), 12);
}

#[tokio::test]
async fn test_run_with_empty_queue_fails() {
    let batch = Batch::new(config(), StubInvocable::new(1).into_registry()).unwrap();
    let err = batch.run(None).await.unwrap_err();
    assert!(matches!(err, BatchError::Configuration(_)));
}

/// Listening mode keeps polling until stopped and streams rows to the callback.
#[tokio::test(start_paused = true)]
async fn test_listen_until_stopped() {
    let batch = Arc::new(Batch::new(config(), StubInvocable::new(10).into_registry()).unwrap());

    let streamed = Arc::new(AtomicUsize::new(0));
    let counter = streamed.clone();
    let on_row = callback(move |_row| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    let listener = batch.clone();
    let listening = tokio::spawn(async move { listener.listen(Some(on_row)).await });

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(batch.state(), EngineState::Listening);
    assert!(batch.is_idle());

    add_pids(&batch, 0..3).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(streamed.load(Ordering::SeqCst), 3);

    add_pids(&batch, 3..5).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(batch.is_idle());

    batch.stop(0);
    let output = listening.await.unwrap().unwrap();

    assert_eq!(output.len(), 5);
    assert_eq!(streamed.load(Ordering::SeqCst), 5);
    assert_eq!(output.summary().exit_code, 0);
    assert_eq!(batch.state(), EngineState::Stopped);
}

/// The progress channel ends on a final snapshot for the finished run.
#[tokio::test(start_paused = true)]
async fn test_progress_final_snapshot() {
    let config = config().with_tokens_per_minute(60_000).with_requests_per_minute(120);
    let batch = Batch::new(config, StubInvocable::new(10).into_registry()).unwrap();
    add_pids(&batch, 0..4).await;
    let progress = batch.progress();

    batch.run(None).await.unwrap();

    let snapshot = progress.borrow().clone();
    assert_eq!(snapshot.state, EngineState::Stopped);
    assert_eq!(snapshot.status, RunStatus::Done);
    assert_eq!(snapshot.completed, 4);
    assert_eq!(snapshot.queued, 4);
    assert_eq!(snapshot.rpm_limit, 120);
    assert_eq!(snapshot.tpm_limit, 60_000);
}

/// Jobs are split across engines and the rows recombined in index order.
#[tokio::test(start_paused = true)]
async fn test_sharded_run() {
    let first = Arc::new(StubInvocable::new(10));
    let second = Arc::new(StubInvocable::new(10));
    let config = config().with_result_index(["metadata.pid"]);
    let batches = vec![
        Batch::new(config.clone(), StubInvocable::registry(first.clone())).unwrap(),
        Batch::new(config, StubInvocable::registry(second.clone())).unwrap(),
    ];

    let jobs: Vec<Job> = [5, 0, 6, 2, 4, 1, 3]
        .into_iter()
        .map(|pid| Job::new(CHAT, params(json!({ "pid": pid })), chat_params("hi")))
        .collect();

    let output = run_sharded(&batches, jobs).await.unwrap();

    assert_eq!(first.calls(), 3);
    assert_eq!(second.calls(), 4);
    assert_eq!(pids(output.rows()), (0..7).collect::<Vec<_>>());
    assert_eq!(output.summary().queued, 7);
}

#[tokio::test]
async fn test_sharded_run_without_jobs_fails() {
    let batches = vec![Batch::new(config(), StubInvocable::new(1).into_registry()).unwrap()];
    let err = run_sharded(&batches, Vec::new()).await.unwrap_err();
    assert!(err.is_configuration());
}

/// An unknown endpoint anywhere in the list queues nothing on any engine.
#[tokio::test(start_paused = true)]
async fn test_sharded_run_unknown_endpoint_queues_nothing() {
    let stub = Arc::new(StubInvocable::new(10));
    let batches = vec![
        Batch::new(config(), StubInvocable::registry(stub.clone())).unwrap(),
        Batch::new(config(), StubInvocable::registry(stub.clone())).unwrap(),
    ];

    let mut jobs: Vec<Job> = (0..3)
        .map(|pid| Job::new(CHAT, params(json!({ "pid": pid })), chat_params("hi")))
        .collect();
    jobs.push(Job::new("images.generate", Params::new(), Params::new()));

    let err = run_sharded(&batches, jobs).await.unwrap_err();
    assert!(matches!(err, BatchError::UnknownOperation(ref name) if name == "images.generate"));
    assert_eq!(batches[0].queue_len(), 0);
    assert_eq!(batches[1].queue_len(), 0);
    assert_eq!(batches[0].pending(), 0);

    // A later run only sees its own job
    add_pids(&batches[0], [7]).await;
    let output = batches[0].run(None).await.unwrap();
    assert_eq!(pids(output.rows()), vec![7]);
    assert_eq!(stub.calls(), 1);
}

/// The run log records the lifecycle and is cleared for the next run.
#[tokio::test(start_paused = true)]
async fn test_run_log_lifecycle() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("batch.log");
    let config = config()
        .with_log_path(Some(path.clone()))
        .with_log_verbosity(2)
        .with_result_index(["metadata.pid"]);
    let batch = Batch::new(config, StubInvocable::new(10).into_registry()).unwrap();

    add_pids(&batch, [1, 2]).await;
    batch.run(None).await.unwrap();

    let content = std::fs::read_to_string(&path).unwrap();
    for marker in [
        "QUEUED | gpt-4o-mini",
        "REQUESTS: ",
        "PROCESSING | {\"pid\":1} | {",
        "HEADERS | ",
        "PROCESSED | ",
        "EMPTY QUEUE",
        "FINISHING PROCESSING",
        "STOP EVENT | Exit code 0",
        "WAITING FOR CLOCK",
        "INDEX | metadata.pid",
        "RETURNING OUTPUT | 2 rows",
    ] {
        assert!(content.contains(marker), "missing {:?} in:\n{}", marker, content);
    }
    assert_eq!(content.matches("HEADERS | ").count(), 1);

    add_pids(&batch, [3]).await;
    batch.run(None).await.unwrap();
    let content = std::fs::read_to_string(&path).unwrap();
    assert!(!content.contains("{\"pid\":1}"));
    assert!(content.contains("{\"pid\":3}"));
}

/// Verbosity 0 leaves the log file empty.
#[tokio::test(start_paused = true)]
async fn test_silent_run_log() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("batch.log");
    let config = config().with_log_path(Some(path.clone())).with_log_verbosity(0);
    let batch = Batch::new(config, StubInvocable::new(10).into_registry()).unwrap();

    add_pids(&batch, [1]).await;
    batch.run(None).await.unwrap();

    assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
}

/// Written rows are flat records: metadata, endpoint, params, result.
#[tokio::test(start_paused = true)]
async fn test_write_jsonl_rows() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("rows.jsonl");
    let batch = Batch::new(config(), StubInvocable::new(10).into_registry()).unwrap();
    add_pids(&batch, [7]).await;

    let output = batch.run(None).await.unwrap();
    output.write_jsonl(&path).unwrap();

    let content = std::fs::read_to_string(&path).unwrap();
    let record: HashMap<String, Value> = serde_json::from_str(content.trim()).unwrap();
    assert_eq!(record["pid"], json!(7));
    assert_eq!(record["endpoint"], json!(CHAT));
    assert_eq!(record["model"], json!("gpt-4o-mini"));
    assert_eq!(record["result"]["usage"]["total_tokens"], json!(10));
}
