//! Core data model for the dispatch layer
//!
//! Request-side types (`RequestEnvelope`, `Message`), the closed union of
//! raw upstream output shapes (`RawOutput`), and the stable normalized
//! output contracts (`ImageOutput`, `Transcription`, `AudioOutput`).
//!
//! `RawOutput` is the only place heterogeneous upstream shapes are allowed
//! to exist; everything downstream of the normalizer works with the stable
//! contracts.

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;

use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::PlaygroundError;

/// Capability class: the unit the rate limiter and the schema registry key
/// on. One route per capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    Chat,
    Image,
    SpeechToText,
    TextToSpeech,
}

impl Capability {
    /// Stable wire name, used in rate-limit keys and 429 bodies.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Image => "image",
            Self::SpeechToText => "speech-to-text",
            Self::TextToSpeech => "text-to-speech",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message role in a chat conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// One chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

/// One user-initiated call, assembled by the server surface and consumed by
/// the dispatcher. Created per HTTP request, never persisted.
#[derive(Debug, Clone)]
pub struct RequestEnvelope {
    pub capability: Capability,
    /// Derived from network-layer metadata, never user-supplied.
    pub client_identity: String,
    pub model_id: String,
    /// Untyped caller overrides; validated and clamped by the payload
    /// builder.
    pub raw_params: serde_json::Map<String, serde_json::Value>,
    /// Ordered conversation, chat only.
    pub messages: Vec<Message>,
}

/// Byte stream as delivered by the inference capability.
pub type RawByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, PlaygroundError>> + Send>>;

/// Raw upstream output, modeled as a closed union of the four shapes the
/// inference capability is known to produce. Shape-sniffing beyond this
/// boundary lives exclusively in the normalizer.
pub enum RawOutput {
    /// Incrementally delivered bytes (binary image/audio responses).
    ByteStream(RawByteStream),
    /// A bare base64 string.
    Base64(String),
    /// A fully buffered binary body.
    Binary(Vec<u8>),
    /// A structured JSON object (transcriptions, base64-bearing envelopes).
    Structured(serde_json::Value),
}

impl fmt::Debug for RawOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ByteStream(_) => f.write_str("RawOutput::ByteStream(..)"),
            Self::Base64(s) => write!(f, "RawOutput::Base64({} chars)", s.len()),
            Self::Binary(b) => write!(f, "RawOutput::Binary({} bytes)", b.len()),
            Self::Structured(v) => write!(f, "RawOutput::Structured({v})"),
        }
    }
}

/// Normalized image result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageOutput {
    pub base64: String,
    #[serde(rename = "mediaType")]
    pub media_type: String,
    #[serde(rename = "byteLength")]
    pub byte_length: usize,
}

/// Word-level timing extracted from a transcription alternative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WordTiming {
    pub word: String,
    #[serde(rename = "start")]
    pub start_seconds: f64,
    #[serde(rename = "end")]
    pub end_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// Normalized speech-to-text result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcription {
    pub transcript: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub words: Option<Vec<WordTiming>>,
}

/// Normalized text-to-speech result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioOutput {
    pub base64: String,
    #[serde(rename = "contentType")]
    pub content_type: String,
}

/// Per-request metadata echoed in unary responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMetadata {
    pub model: String,
    #[serde(rename = "requestId")]
    pub request_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl ResponseMetadata {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            request_id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now(),
            extra: HashMap::new(),
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}
