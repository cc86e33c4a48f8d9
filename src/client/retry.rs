//! Truncate-and-retry wrapper for inputs that overflow the model context.
//!
//! The engine itself never retries. Callers that prefer a shortened answer
//! over a dropped row can wrap an operation in `TruncatingRetry` before
//! registering it.

use async_trait::async_trait;
use serde_json::Value;

use crate::client::invocable::Invocable;
use crate::client::types::{CallResponse, Params};
use crate::error::Result;

/// Halves the input and tries again whenever the remote rejects it as too long.
pub struct TruncatingRetry<I> {
    inner: I,
    max_halvings: u32,
}

impl<I: Invocable> TruncatingRetry<I> {
    pub fn new(inner: I, max_halvings: u32) -> Self {
        Self { inner, max_halvings }
    }
}

#[async_trait]
impl<I: Invocable> Invocable for TruncatingRetry<I> {
    async fn invoke(&self, params: &Params) -> Result<CallResponse> {
        let mut params = params.clone();
        let mut halvings = 0;

        loop {
            match self.inner.invoke(&params).await {
                Err(e) if e.is_context_overflow() && halvings < self.max_halvings => {
                    if !halve_input(&mut params) {
                        return Err(e);
                    }
                    halvings += 1;
                    tracing::warn!(halvings, "Input exceeds model context, retrying with half");
                }
                other => return other,
            }
        }
    }
}

/// Cut the prompt text in half: the last chat message's content, or the
/// `input` string of an embeddings call. Returns false if nothing could shrink.
pub fn halve_input(params: &mut Params) -> bool {
    if let Some(Value::Array(messages)) = params.get_mut("messages") {
        if let Some(Value::String(content)) = messages.last_mut().and_then(|m| m.get_mut("content")) {
            return halve_string(content);
        }
        return false;
    }

    match params.get_mut("input") {
        Some(Value::String(input)) => halve_string(input),
        _ => false,
    }
}

fn halve_string(text: &mut String) -> bool {
    let chars = text.chars().count();
    if chars < 2 {
        return false;
    }
    *text = text.chars().take(chars / 2).collect();
    true
}
