//! The collaborator boundary: named operations the engine can call.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::client::types::{CallResponse, Params};
use crate::error::{BatchError, Result};

/// Operation used when a job does not name one.
pub const DEFAULT_OPERATION: &str = "chat.completions.create";

/// One remote operation. Each call is independent; implementations must be
/// safe to invoke from many workers at once.
#[async_trait]
pub trait Invocable: Send + Sync {
    /// Execute the operation with the given keyword parameters.
    async fn invoke(&self, params: &Params) -> Result<CallResponse>;
}

/// Explicit map from operation name (e.g. `embeddings.create`) to the
/// function that implements it. Names are resolved once, at enqueue time.
#[derive(Clone, Default)]
pub struct OperationRegistry {
    operations: HashMap<String, Arc<dyn Invocable>>,
}

impl OperationRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operation, replacing any previous one with the same name.
    pub fn register(&mut self, name: impl Into<String>, operation: Arc<dyn Invocable>) {
        self.operations.insert(name.into(), operation);
    }

    /// Builder form of `register`.
    pub fn with(mut self, name: impl Into<String>, operation: Arc<dyn Invocable>) -> Self {
        self.register(name, operation);
        self
    }

    /// Resolve an operation by name.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Invocable>> {
        self.operations
            .get(name)
            .cloned()
            .ok_or_else(|| BatchError::UnknownOperation(name.to_string()))
    }

    /// Registered operation names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.operations.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

impl fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationRegistry").field("operations", &self.names()).finish()
    }
}
