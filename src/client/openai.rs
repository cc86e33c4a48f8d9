//! OpenAI / Azure OpenAI client implementation.
//!
//! Exposes `chat.completions.create` and `embeddings.create` as `Invocable`
//! operations. Parameters are forwarded verbatim as the JSON request body.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::client::invocable::{Invocable, OperationRegistry};
use crate::client::types::{CallResponse, Params};
use crate::error::{BatchError, Result};

/// OpenAI API base URL.
pub const OPENAI_API_URL: &str = "https://api.openai.com/v1";

/// Environment variable holding the OpenAI key.
pub const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Transport-level timeout; the engine enforces its own per-call deadline.
const HTTP_TIMEOUT: Duration = Duration::from_secs(600);

/// The remote endpoints this client knows how to call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    ChatCompletions,
    Embeddings,
}

impl EndpointKind {
    pub const ALL: [EndpointKind; 2] = [EndpointKind::ChatCompletions, EndpointKind::Embeddings];

    /// Operation name used when enqueueing work.
    pub fn operation_name(&self) -> &'static str {
        match self {
            EndpointKind::ChatCompletions => "chat.completions.create",
            EndpointKind::Embeddings => "embeddings.create",
        }
    }

    /// URL path relative to the API base.
    pub fn path(&self) -> &'static str {
        match self {
            EndpointKind::ChatCompletions => "chat/completions",
            EndpointKind::Embeddings => "embeddings",
        }
    }
}

/// Azure OpenAI credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AzureConfig {
    pub azure_endpoint: Option<String>,
    pub api_version: Option<String>,
    pub api_key: Option<String>,
}

impl AzureConfig {
    /// Read `AZURE_OPENAI_ENDPOINT`, `AZURE_OPENAI_VERSION` and `AZURE_OPENAI_API_KEY`.
    pub fn from_env() -> Self {
        Self {
            azure_endpoint: std::env::var("AZURE_OPENAI_ENDPOINT").ok(),
            api_version: std::env::var("AZURE_OPENAI_VERSION").ok(),
            api_key: std::env::var("AZURE_OPENAI_API_KEY").ok(),
        }
    }

    /// Fill unset fields from the environment.
    pub fn or_env(self) -> Self {
        let env = Self::from_env();
        Self {
            azure_endpoint: self.azure_endpoint.or(env.azure_endpoint),
            api_version: self.api_version.or(env.api_version),
            api_key: self.api_key.or(env.api_key),
        }
    }

    /// All of endpoint, version and key are present and non-empty.
    pub fn is_configured(&self) -> bool {
        [&self.azure_endpoint, &self.api_version, &self.api_key]
            .iter()
            .all(|v| v.as_deref().is_some_and(|s| !s.is_empty()))
    }
}

impl fmt::Display for AzureConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Endpoint: {}", self.azure_endpoint.as_deref().unwrap_or("<unset>"))
    }
}

#[derive(Clone)]
enum Backend {
    OpenAi {
        base_url: String,
        api_key: String,
    },
    Azure {
        endpoint: String,
        api_version: String,
        api_key: String,
    },
}

/// HTTP client for the OpenAI-compatible REST API.
#[derive(Clone)]
pub struct OpenAiClient {
    http: Client,
    backend: Backend,
}

impl OpenAiClient {
    /// Create a client reading the key from `OPENAI_API_KEY`.
    pub fn from_env() -> Result<Self> {
        Self::from_env_var(OPENAI_API_KEY_ENV, OPENAI_API_URL)
    }

    /// Create a client reading the key from an arbitrary variable.
    pub fn from_env_var(env_var: &str, base_url: &str) -> Result<Self> {
        let api_key = std::env::var(env_var).unwrap_or_default();
        if api_key.is_empty() {
            return Err(BatchError::Configuration(format!(
                "No OpenAI API key found. Provide an api key or set the {} environment variable",
                env_var
            )));
        }
        Self::with_api_key(api_key, base_url)
    }

    /// Create a client with an explicit API key.
    pub fn with_api_key(api_key: impl Into<String>, base_url: &str) -> Result<Self> {
        Ok(Self {
            http: build_http()?,
            backend: Backend::OpenAi {
                base_url: base_url.trim_end_matches('/').to_string(),
                api_key: api_key.into(),
            },
        })
    }

    /// Create a client for an Azure OpenAI resource.
    pub fn azure(config: &AzureConfig) -> Result<Self> {
        if !config.is_configured() {
            return Err(BatchError::Configuration(
                "Azure OpenAI requires azure_endpoint, api_version and api_key".to_string(),
            ));
        }
        Ok(Self {
            http: build_http()?,
            backend: Backend::Azure {
                endpoint: config.azure_endpoint.clone().unwrap_or_default().trim_end_matches('/').to_string(),
                api_version: config.api_version.clone().unwrap_or_default(),
                api_key: config.api_key.clone().unwrap_or_default(),
            },
        })
    }

    /// Register every endpoint of this client under its operation name.
    pub fn into_registry(self) -> OperationRegistry {
        let client = Arc::new(self);
        EndpointKind::ALL.iter().fold(OperationRegistry::new(), |registry, kind| {
            registry.with(
                kind.operation_name(),
                Arc::new(Endpoint {
                    client: client.clone(),
                    kind: *kind,
                }),
            )
        })
    }

    /// Build the request URL for an endpoint.
    fn url(&self, kind: EndpointKind, params: &Params) -> Result<String> {
        match &self.backend {
            Backend::OpenAi { base_url, .. } => Ok(format!("{}/{}", base_url, kind.path())),
            Backend::Azure {
                endpoint, api_version, ..
            } => {
                let deployment = params.get("model").and_then(Value::as_str).ok_or_else(|| {
                    BatchError::RemoteCall {
                        status: None,
                        message: "Azure requests need a `model` parameter naming the deployment".to_string(),
                    }
                })?;
                Ok(format!(
                    "{}/openai/deployments/{}/{}?api-version={}",
                    endpoint,
                    deployment,
                    kind.path(),
                    api_version
                ))
            }
        }
    }

    /// Send a request and keep the raw headers alongside the parsed body.
    pub async fn send(&self, kind: EndpointKind, params: &Params) -> Result<CallResponse> {
        let url = self.url(kind, params)?;
        let request = self.http.post(&url).json(params);
        let request = match &self.backend {
            Backend::OpenAi { api_key, .. } => request.bearer_auth(api_key),
            Backend::Azure { api_key, .. } => request.header("api-key", api_key),
        };

        let response = request.send().await?;
        let status = response.status();

        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_lowercase(), v.to_string()))
            })
            .collect();

        if !status.is_success() {
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(BatchError::remote(status.as_u16(), error_body));
        }

        let body: Value = response.json().await?;
        Ok(CallResponse { headers, body })
    }
}

impl fmt::Debug for OpenAiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target = match &self.backend {
            Backend::OpenAi { base_url, .. } => base_url.as_str(),
            Backend::Azure { endpoint, .. } => endpoint.as_str(),
        };
        f.debug_struct("OpenAiClient").field("target", &target).finish()
    }
}

fn build_http() -> Result<Client> {
    Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(|e| BatchError::Configuration(format!("Failed to create HTTP client: {}", e)))
}

/// One endpoint of an `OpenAiClient`, bound as an operation.
struct Endpoint {
    client: Arc<OpenAiClient>,
    kind: EndpointKind,
}

#[async_trait]
impl Invocable for Endpoint {
    async fn invoke(&self, params: &Params) -> Result<CallResponse> {
        self.client.send(self.kind, params).await
    }
}
