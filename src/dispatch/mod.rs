//! Dispatcher
//!
//! Per-route orchestration: validate input, build the model-specific
//! payload, consult the rate limiter, invoke the inference capability with
//! the statically selected strategy, and hand the raw result to the
//! normalizer. Each request is a single attempt; failures surface
//! immediately through the stable error taxonomy and retry policy stays
//! with the client.
//!
//! Ordering is deliberate: validation happens before the rate-limit check
//! (no quota wasted on requests that cannot succeed), and the rate-limit
//! check happens before the expensive inference call.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Map, Value, json};
use tracing::{info, warn};

use crate::error::PlaygroundError;
use crate::inference::{InferenceBackend, strategy_for};
use crate::normalize;
use crate::payload;
use crate::rate_limit::{RateDecision, RateLimiter};
use crate::registry::{self, InvocationStrategy, ModelFamily};
use crate::streaming::TextStream;
use crate::types::{
    AudioOutput, Capability, ImageOutput, RequestEnvelope, ResponseMetadata, Transcription,
};

/// Orchestrates one capability invocation end to end.
pub struct Dispatcher {
    limiter: RateLimiter,
    backend: Option<Arc<dyn InferenceBackend>>,
}

impl Dispatcher {
    pub fn new(limiter: RateLimiter, backend: Option<Arc<dyn InferenceBackend>>) -> Self {
        Self { limiter, backend }
    }

    /// Read-only rate status for introspection endpoints. Never increments.
    pub async fn rate_status(
        &self,
        identity: &str,
        capability: Capability,
    ) -> Result<RateDecision, PlaygroundError> {
        self.limiter.status(identity, capability).await
    }

    fn backend(&self) -> Result<&Arc<dyn InferenceBackend>, PlaygroundError> {
        self.backend.as_ref().ok_or_else(|| {
            PlaygroundError::UnconfiguredDependency("inference capability binding".to_string())
        })
    }

    async fn admit(
        &self,
        identity: &str,
        capability: Capability,
    ) -> Result<RateDecision, PlaygroundError> {
        let decision = self.limiter.check(identity, capability).await?;
        if !decision.allowed {
            return Err(PlaygroundError::RateLimited {
                capability,
                remaining: 0,
                reset_at: decision.reset_at,
            });
        }
        if let Some(warning) = &decision.warning {
            warn!(capability = %capability, warning, "admitting without quota enforcement");
        }
        Ok(decision)
    }

    /// Chat: token stream out, regardless of the underlying protocol.
    pub async fn chat(&self, envelope: RequestEnvelope) -> Result<TextStream, PlaygroundError> {
        let model = registry::descriptor_or_fallback(&envelope.model_id, ModelFamily::Text);
        let invocation = payload::build_chat(&model, &envelope.messages, &envelope.raw_params)?;
        let backend = self.backend()?;
        self.admit(&envelope.client_identity, Capability::Chat).await?;

        let metadata = ResponseMetadata::new(&model.id);
        info!(model = %model.id, messages = envelope.messages.len(), "dispatching chat request");
        match strategy_for(&model.id) {
            InvocationStrategy::Stream => {
                let tokens = backend
                    .invoke_stream(&model.id, Value::Object(invocation))
                    .await?;
                Ok(normalize::wrap_token_stream(metadata, tokens))
            }
            InvocationStrategy::Batch => {
                let raw = backend.invoke(&model.id, Value::Object(invocation)).await?;
                let text = normalize::batch_text(raw)?;
                Ok(crate::streaming::emulated_stream(metadata, text))
            }
        }
    }

    /// Image generation: always a unary `{base64, mediaType, byteLength}`.
    pub async fn generate_image(
        &self,
        envelope: RequestEnvelope,
        prompt: &str,
    ) -> Result<(ImageOutput, ResponseMetadata), PlaygroundError> {
        let model = registry::descriptor_or_fallback(&envelope.model_id, ModelFamily::Image);
        let invocation = payload::build_image(&model, prompt, &envelope.raw_params)?;
        let backend = self.backend()?;
        self.admit(&envelope.client_identity, Capability::Image).await?;

        info!(model = %model.id, "dispatching image request");
        let raw = backend.invoke(&model.id, Value::Object(invocation)).await?;
        let image = normalize::normalize_image(&model.id, raw).await?;
        let metadata = ResponseMetadata::new(&model.id)
            .with_extra("byteLength", json!(image.byte_length));
        Ok((image, metadata))
    }

    /// Speech-to-text: audio bytes in, structured transcription out.
    pub async fn transcribe(
        &self,
        envelope: RequestEnvelope,
        audio: Vec<u8>,
        media_type: &str,
    ) -> Result<(Transcription, ResponseMetadata), PlaygroundError> {
        if audio.is_empty() {
            return Err(PlaygroundError::invalid_input("audio file is empty"));
        }
        let model =
            registry::descriptor_or_fallback(&envelope.model_id, ModelFamily::SpeechToText);
        let mut invocation = payload::build_stt(&model, &envelope.raw_params)?;
        let audio_len = audio.len();
        invocation.insert("audio".to_string(), json!(BASE64.encode(&audio)));
        invocation.insert("content_type".to_string(), json!(media_type));
        let backend = self.backend()?;
        self.admit(&envelope.client_identity, Capability::SpeechToText)
            .await?;

        info!(model = %model.id, bytes = audio_len, "dispatching transcription request");
        let raw = backend.invoke(&model.id, Value::Object(invocation)).await?;
        let transcription = normalize::normalize_transcription(raw)?;
        let metadata = ResponseMetadata::new(&model.id)
            .with_extra("audioBytes", json!(audio_len))
            .with_extra("contentType", json!(media_type));
        Ok((transcription, metadata))
    }

    /// Text-to-speech: text in, `{base64, contentType}` out.
    pub async fn synthesize(
        &self,
        envelope: RequestEnvelope,
        text: &str,
    ) -> Result<(AudioOutput, ResponseMetadata), PlaygroundError> {
        let model =
            registry::descriptor_or_fallback(&envelope.model_id, ModelFamily::TextToSpeech);
        let invocation = payload::build_tts(&model, text, &envelope.raw_params)?;
        let encoding = invocation
            .get("encoding")
            .and_then(Value::as_str)
            .unwrap_or("mp3")
            .to_string();
        let backend = self.backend()?;
        self.admit(&envelope.client_identity, Capability::TextToSpeech)
            .await?;

        info!(model = %model.id, chars = text.chars().count(), "dispatching synthesis request");
        let raw = backend.invoke(&model.id, Value::Object(invocation)).await?;
        let audio = normalize::normalize_audio(&model.id, &encoding, raw).await?;
        let metadata = ResponseMetadata::new(&model.id)
            .with_extra("characterCount", json!(text.chars().count()))
            .with_extra("encoding", json!(encoding));
        Ok((audio, metadata))
    }
}

/// Assemble a request envelope from route-level pieces, defaulting the
/// model id per capability when the caller names none.
pub fn envelope(
    capability: Capability,
    client_identity: String,
    model_id: Option<String>,
    raw_params: Map<String, Value>,
    messages: Vec<crate::types::Message>,
) -> RequestEnvelope {
    RequestEnvelope {
        capability,
        client_identity,
        model_id: model_id.unwrap_or_else(|| registry::default_model(capability).to_string()),
        raw_params,
        messages,
    }
}
