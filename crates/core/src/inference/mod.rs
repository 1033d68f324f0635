//! # Inference Client
//!
//! Uniform interface to a remote LLM backend: submit a prompt plus a target
//! output schema, get back structured JSON or a [`ProviderError`].
//!
//! ```text
//! StageTask ──▶ LimitedClient (semaphore, K permits) ──▶ HttpInferenceClient
//!                                                   └──▶ CannedClient (offline)
//! ```

pub mod canned;
pub mod http;
pub mod limiter;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProviderError;

pub use canned::{CannedBehavior, CannedClient};
pub use http::HttpInferenceClient;
pub use limiter::LimitedClient;

/// Target output schema for a completion
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchemaHint {
    /// Schema name (the stage name)
    pub name: String,
    /// JSON schema document
    pub schema: Value,
}

impl SchemaHint {
    pub fn new(name: impl Into<String>, schema: Value) -> Self {
        Self {
            name: name.into(),
            schema,
        }
    }
}

/// Sampling parameters for a completion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceParams {
    /// Model override; the backend default is used when absent
    #[serde(default)]
    pub model: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for InferenceParams {
    fn default() -> Self {
        Self {
            model: None,
            temperature: 0.2,
            max_tokens: 4096,
        }
    }
}

/// A backend able to produce structured completions
#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// Complete `prompt`, asking for output shaped like `schema`.
    ///
    /// Returns whatever JSON the model produced; validating it against the
    /// schema is the caller's job. Text that is not JSON comes back as a
    /// `Value::String`.
    async fn complete(
        &self,
        prompt: &str,
        schema: &SchemaHint,
        params: &InferenceParams,
    ) -> Result<Value, ProviderError>;
}

/// Extract a JSON document from model text, tolerating markdown code fences
pub fn parse_model_text(text: &str) -> Value {
    let trimmed = text.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed);

    if let Ok(value) = serde_json::from_str(unfenced) {
        return value;
    }

    // Fall back to the outermost object embedded in prose
    if let (Some(start), Some(end)) = (unfenced.find('{'), unfenced.rfind('}')) {
        if start < end {
            if let Ok(value) = serde_json::from_str(&unfenced[start..=end]) {
                return value;
            }
        }
    }

    Value::String(text.to_string())
}
