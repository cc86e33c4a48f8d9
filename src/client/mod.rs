//! Client Layer - the remote completion service as seen by the engine.
//!
//! This module provides:
//! - The `Invocable` trait and the operation-name registry
//! - Response types carrying token usage and rate-limit headers
//! - `OpenAiClient` for OpenAI and Azure OpenAI
//! - `TruncatingRetry`, an opt-in wrapper for over-long inputs
//! - `StubInvocable` for tests and dry runs

pub mod invocable;
pub mod openai;
pub mod retry;
pub mod stub;
pub mod types;

pub use invocable::{DEFAULT_OPERATION, Invocable, OperationRegistry};
pub use openai::{AzureConfig, EndpointKind, OPENAI_API_KEY_ENV, OPENAI_API_URL, OpenAiClient};
pub use retry::{TruncatingRetry, halve_input};
pub use stub::StubInvocable;
pub use types::{CallResponse, HEADER_LIMIT_REQUESTS, HEADER_LIMIT_TOKENS, HeaderLimits, Params, Usage};
