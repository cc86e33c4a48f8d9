//! Scriptable in-process collaborator for tests and dry runs.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::time::Instant;

use crate::client::invocable::{Invocable, OperationRegistry};
use crate::client::openai::EndpointKind;
use crate::client::types::{CallResponse, Params, Usage};
use crate::error::{BatchError, Result};

#[derive(Debug, Clone)]
enum Behavior {
    Succeed,
    Fail(String),
    Hang,
}

/// Answers every call with a canned completion of a fixed token cost.
#[derive(Debug)]
pub struct StubInvocable {
    tokens: u64,
    latency: Duration,
    latency_param: Option<String>,
    behavior: Behavior,
    headers: Vec<(String, String)>,
    calls: AtomicU64,
    started: Mutex<Vec<Instant>>,
}

impl StubInvocable {
    /// Succeeds instantly, charging `tokens` per call.
    pub fn new(tokens: u64) -> Self {
        Self {
            tokens,
            latency: Duration::ZERO,
            latency_param: None,
            behavior: Behavior::Succeed,
            headers: Vec::new(),
            calls: AtomicU64::new(0),
            started: Mutex::new(Vec::new()),
        }
    }

    /// Never resolves.
    pub fn hanging() -> Self {
        Self {
            behavior: Behavior::Hang,
            ..Self::new(0)
        }
    }

    /// Always fails with a remote error.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            behavior: Behavior::Fail(message.into()),
            ..Self::new(0)
        }
    }

    /// Sleep this long before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Take the latency (milliseconds) from a numeric parameter when present.
    pub fn with_latency_param(mut self, name: impl Into<String>) -> Self {
        self.latency_param = Some(name.into());
        self
    }

    /// Attach a response header to every answer.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Number of times `invoke` was entered.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Instants at which each call started, in call order.
    pub fn call_instants(&self) -> Vec<Instant> {
        self.started.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Register this stub under every known operation name.
    pub fn into_registry(self) -> OperationRegistry {
        Self::registry(Arc::new(self))
    }

    /// Register a shared stub under every known operation name.
    pub fn registry(stub: Arc<StubInvocable>) -> OperationRegistry {
        EndpointKind::ALL.iter().fold(OperationRegistry::new(), |registry, kind| {
            registry.with(kind.operation_name(), stub.clone())
        })
    }

    fn latency_for(&self, params: &Params) -> Duration {
        self.latency_param
            .as_ref()
            .and_then(|name| params.get(name))
            .and_then(|v| v.as_u64())
            .map(Duration::from_millis)
            .unwrap_or(self.latency)
    }
}

#[async_trait]
impl Invocable for StubInvocable {
    async fn invoke(&self, params: &Params) -> Result<CallResponse> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut started) = self.started.lock() {
            started.push(Instant::now());
        }

        let latency = self.latency_for(params);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        match &self.behavior {
            Behavior::Hang => std::future::pending().await,
            Behavior::Fail(message) => Err(BatchError::remote(500, message.clone())),
            Behavior::Succeed => {
                let completion = self.tokens / 2;
                let usage = Usage::new(self.tokens - completion, completion);
                let body = json!({
                    "id": format!("stub-{}", n),
                    "object": "chat.completion",
                    "model": params.get("model").cloned().unwrap_or_else(|| json!("stub-model")),
                    "choices": [{
                        "index": 0,
                        "message": { "role": "assistant", "content": "ok" },
                        "finish_reason": "stop"
                    }],
                    "usage": usage,
                });
                let response = self
                    .headers
                    .iter()
                    .fold(CallResponse::new(body), |r, (k, v)| r.with_header(k, v.clone()));
                Ok(response)
            }
        }
    }
}
