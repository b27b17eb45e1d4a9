//! Inference capability boundary
//!
//! The third-party inference backend is opaque: invoked by model name with a
//! JSON (or binary) payload, returning JSON or binary. `InferenceBackend`
//! is that boundary as a trait; `HttpInference` is the REST-backed
//! implementation. Raw outputs leave this module as the closed `RawOutput`
//! union; nothing here interprets response shapes beyond transport
//! concerns.

use std::pin::Pin;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::Stream;
use futures_util::StreamExt;
use serde_json::Value;
use tracing::debug;

use crate::error::{PlaygroundError, classify_upstream_error};
use crate::registry::{self, InvocationStrategy};
use crate::types::RawOutput;

/// One incremental token update from a streaming chat call.
#[derive(Debug, Clone, Default)]
pub struct TokenDelta {
    pub text: Option<String>,
    pub reasoning: Option<String>,
}

/// Ordered stream of token deltas from the inference capability.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<TokenDelta, PlaygroundError>> + Send>>;

/// The opaque inference capability.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Single-shot invocation; the whole response arrives at once.
    async fn invoke(&self, model: &str, payload: Value) -> Result<RawOutput, PlaygroundError>;

    /// Token-streaming invocation, for models driven with the streaming
    /// strategy.
    async fn invoke_stream(
        &self,
        model: &str,
        payload: Value,
    ) -> Result<TokenStream, PlaygroundError>;
}

/// Invocation strategy for a model id: catalog entry when known, otherwise
/// a static prefix rule. No runtime capability probing.
pub fn strategy_for(model_id: &str) -> InvocationStrategy {
    match registry::descriptor(model_id) {
        Ok(descriptor) => descriptor.strategy,
        Err(_) => {
            if model_id.starts_with("@cf/openai/") {
                InvocationStrategy::Batch
            } else {
                InvocationStrategy::Stream
            }
        }
    }
}

/// REST-backed inference client. Built once per process; the inner
/// `reqwest::Client` pools connections across requests.
pub struct HttpInference {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpInference {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn run_url(&self, model: &str) -> String {
        format!("{}/{}", self.base_url, model)
    }

    async fn bail_on_error(response: reqwest::Response) -> Result<reqwest::Response, PlaygroundError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        debug!(%status, "inference capability returned an error body");
        Err(classify_upstream_error(&body))
    }

    /// Unwrap the `{"success": ..., "result": ...}` REST envelope when
    /// present; direct payloads pass through.
    fn unwrap_envelope(value: Value) -> Value {
        match value {
            Value::Object(mut map) if map.contains_key("result") => {
                map.remove("result").unwrap_or(Value::Null)
            }
            other => other,
        }
    }
}

#[async_trait]
impl InferenceBackend for HttpInference {
    async fn invoke(&self, model: &str, payload: Value) -> Result<RawOutput, PlaygroundError> {
        let response = self
            .http
            .post(self.run_url(model))
            .bearer_auth(&self.token)
            .json(&payload)
            .send()
            .await?;
        let response = Self::bail_on_error(response).await?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.starts_with("application/json") {
            let value: Value = response.json().await?;
            return Ok(match Self::unwrap_envelope(value) {
                // A bare string result is a base64 body by contract.
                Value::String(s) => RawOutput::Base64(s),
                other => RawOutput::Structured(other),
            });
        }

        // Binary-media responses (images, synthesized audio) arrive as a
        // byte stream; the normalizer drains it.
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(PlaygroundError::from));
        Ok(RawOutput::ByteStream(Box::pin(stream)))
    }

    async fn invoke_stream(
        &self,
        model: &str,
        mut payload: Value,
    ) -> Result<TokenStream, PlaygroundError> {
        if let Value::Object(map) = &mut payload {
            map.insert("stream".to_string(), Value::Bool(true));
        }
        let response = self
            .http
            .post(self.run_url(model))
            .bearer_auth(&self.token)
            .json(&payload)
            .send()
            .await?;
        let response = Self::bail_on_error(response).await?;

        let mut events = response.bytes_stream().eventsource();
        let s = async_stream::try_stream! {
            while let Some(event) = events.next().await {
                let event = event
                    .map_err(|e| PlaygroundError::HttpError(format!("event stream: {e}")))?;
                if event.data.trim() == "[DONE]" {
                    break;
                }
                let value: Value = serde_json::from_str(&event.data).map_err(|_| {
                    PlaygroundError::MalformedResponse(format!(
                        "unparseable stream frame: {}",
                        event.data
                    ))
                })?;
                let delta = TokenDelta {
                    text: value
                        .get("response")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    reasoning: value
                        .get("reasoning")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                };
                if delta.text.is_some() || delta.reasoning.is_some() {
                    yield delta;
                }
            }
        };
        Ok(Box::pin(s))
    }
}
