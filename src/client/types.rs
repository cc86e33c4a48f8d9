//! Response types for calls against the remote completion service.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Keyword parameters passed to an operation, in JSON form.
pub type Params = serde_json::Map<String, Value>;

/// Header carrying the account's requests-per-minute limit.
pub const HEADER_LIMIT_REQUESTS: &str = "x-ratelimit-limit-requests";

/// Header carrying the account's tokens-per-minute limit.
pub const HEADER_LIMIT_TOKENS: &str = "x-ratelimit-limit-tokens";

/// Token usage reported in a response body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl Usage {
    /// Create new usage stats; the total is the sum of both sides.
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Rate limits as reported by the service's response headers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeaderLimits {
    pub requests_per_minute: Option<u32>,
    pub tokens_per_minute: Option<u32>,
}

impl HeaderLimits {
    pub fn is_empty(&self) -> bool {
        self.requests_per_minute.is_none() && self.tokens_per_minute.is_none()
    }
}

/// A successful response: lower-cased headers plus the parsed JSON body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallResponse {
    pub headers: HashMap<String, String>,
    pub body: Value,
}

impl CallResponse {
    /// Create a response with no headers.
    pub fn new(body: Value) -> Self {
        Self {
            headers: HashMap::new(),
            body,
        }
    }

    /// Add a header (name is lower-cased).
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers.insert(name.as_ref().to_lowercase(), value.into());
        self
    }

    /// Look up a header by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }

    /// Usage block of the body, defaulting to zero when absent or malformed.
    pub fn usage(&self) -> Usage {
        self.body
            .get("usage")
            .and_then(|u| serde_json::from_value(u.clone()).ok())
            .unwrap_or_default()
    }

    /// Total tokens charged for this call.
    pub fn total_tokens(&self) -> u64 {
        self.usage().total_tokens
    }

    /// Limits advertised by the service, if any.
    pub fn rate_limits(&self) -> HeaderLimits {
        let parse = |name| self.header(name).and_then(|v| v.trim().parse::<u32>().ok());
        HeaderLimits {
            requests_per_minute: parse(HEADER_LIMIT_REQUESTS),
            tokens_per_minute: parse(HEADER_LIMIT_TOKENS),
        }
    }
}
