//! # HTTP Inference Backend
//!
//! Talks to hosted LLM providers over HTTPS. Anthropic uses the Messages API;
//! every other provider speaks the OpenAI-compatible chat-completions
//! protocol with JSON output mode.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::time::Duration;

use super::{parse_model_text, InferenceClient, InferenceParams, SchemaHint};
use crate::error::ProviderError;
use crate::models::{ModelConfig, WireProtocol};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_ERROR_BODY: usize = 512;

/// Provider-backed inference client
pub struct HttpInferenceClient {
    http: reqwest::Client,
    config: ModelConfig,
    endpoint: String,
}

impl HttpInferenceClient {
    pub fn new(config: ModelConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        let endpoint = config.endpoint();
        tracing::info!(
            provider = config.provider.display_name(),
            model = %config.model,
            %endpoint,
            "HTTP inference backend configured"
        );
        Ok(Self {
            http,
            config,
            endpoint,
        })
    }

    /// Read the API key at call time so keys loaded after startup are seen
    fn api_key(&self) -> Result<String, ProviderError> {
        let var = self.config.provider.api_key_env();
        std::env::var(var)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| ProviderError::Auth(format!("{} is not set", var)))
    }

    fn request_body(&self, prompt: &str, schema: &SchemaHint, params: &InferenceParams) -> Value {
        let model = params.model.as_deref().unwrap_or(&self.config.model);
        build_request_body(self.config.provider.protocol(), model, prompt, schema, params)
    }
}

/// System instructions pinning the output to the requested schema
fn schema_instructions(schema: &SchemaHint) -> String {
    format!(
        "You are a structured-output generator. Reply with exactly one JSON object named \
         `{}` that validates against this JSON schema, and nothing else:\n{}",
        schema.name, schema.schema
    )
}

fn build_request_body(
    protocol: WireProtocol,
    model: &str,
    prompt: &str,
    schema: &SchemaHint,
    params: &InferenceParams,
) -> Value {
    match protocol {
        WireProtocol::AnthropicMessages => json!({
            "model": model,
            "max_tokens": params.max_tokens,
            "temperature": params.temperature,
            "system": schema_instructions(schema),
            "messages": [{ "role": "user", "content": prompt }],
        }),
        WireProtocol::ChatCompletions => json!({
            "model": model,
            "max_tokens": params.max_tokens,
            "temperature": params.temperature,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": schema_instructions(schema) },
                { "role": "user", "content": prompt },
            ],
        }),
    }
}

/// Pull the model's text out of a provider response body
fn extract_text(protocol: WireProtocol, body: &Value) -> Result<String, ProviderError> {
    let text = match protocol {
        WireProtocol::AnthropicMessages => body["content"].as_array().map(|blocks| {
            blocks
                .iter()
                .filter(|b| b["type"] == "text")
                .filter_map(|b| b["text"].as_str())
                .collect::<Vec<_>>()
                .join("")
        }),
        WireProtocol::ChatCompletions => body["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string),
    };

    text.filter(|t| !t.trim().is_empty())
        .ok_or_else(|| ProviderError::InvalidResponse("response contained no text".to_string()))
}

fn map_status(status: StatusCode, body: String) -> ProviderError {
    let body: String = body.chars().take(MAX_ERROR_BODY).collect();
    match status {
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Auth(body),
        _ => ProviderError::Http {
            status: status.as_u16(),
            body,
        },
    }
}

fn map_transport(error: reqwest::Error) -> ProviderError {
    if error.is_timeout() {
        ProviderError::Transport("request timed out".to_string())
    } else {
        ProviderError::Transport(error.to_string())
    }
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    async fn complete(
        &self,
        prompt: &str,
        schema: &SchemaHint,
        params: &InferenceParams,
    ) -> Result<Value, ProviderError> {
        let api_key = self.api_key()?;
        let protocol = self.config.provider.protocol();

        let request = self.http.post(&self.endpoint).json(&self.request_body(prompt, schema, params));
        let request = match protocol {
            WireProtocol::AnthropicMessages => request
                .header("x-api-key", api_key)
                .header("anthropic-version", ANTHROPIC_VERSION),
            WireProtocol::ChatCompletions => request.bearer_auth(api_key),
        };

        tracing::debug!(schema = %schema.name, endpoint = %self.endpoint, "sending inference request");
        let response = request.send().await.map_err(map_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status, body));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        let text = extract_text(protocol, &body)?;
        Ok(parse_model_text(&text))
    }
}
