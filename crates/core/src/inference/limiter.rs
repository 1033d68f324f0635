//! Process-wide bound on simultaneous in-flight inference calls.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Semaphore;

use super::{InferenceClient, InferenceParams, SchemaHint};
use crate::error::ProviderError;

/// Wraps a client with a counting semaphore shared across all jobs.
///
/// A permit is held for the whole call and released when the call resolves
/// or its future is dropped (stage or job timeout).
pub struct LimitedClient {
    inner: Arc<dyn InferenceClient>,
    permits: Arc<Semaphore>,
    limit: usize,
}

impl LimitedClient {
    pub fn new(inner: Arc<dyn InferenceClient>, limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            inner,
            permits: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Calls currently holding a permit
    pub fn in_flight(&self) -> usize {
        self.limit - self.permits.available_permits()
    }
}

#[async_trait]
impl InferenceClient for LimitedClient {
    async fn complete(
        &self,
        prompt: &str,
        schema: &SchemaHint,
        params: &InferenceParams,
    ) -> Result<Value, ProviderError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ProviderError::Transport("inference limiter closed".to_string()))?;
        tracing::trace!(schema = %schema.name, in_flight = self.in_flight(), "inference permit acquired");
        self.inner.complete(prompt, schema, params).await
    }
}
