//! Text streaming contract
//!
//! `TextStream` is the single output shape for chat, regardless of whether
//! the underlying call was a true token stream or a single batched string.
//! The batch case is emitted as one delta between synthetic start/end
//! markers, so downstream consumers cannot tell streaming from emulated
//! streaming except by latency.
//!
//! `sse_lines` converts a `TextStream` into Server-Sent-Events formatted
//! lines the HTTP layer writes through unchanged.

use std::pin::Pin;

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::error::PlaygroundError;
use crate::types::ResponseMetadata;

/// One event in a normalized text stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TextStreamEvent {
    /// Stream opened; carries per-request metadata.
    Start { metadata: ResponseMetadata },
    /// Incremental text content.
    Delta { delta: String },
    /// Incremental reasoning content, for models that expose it.
    Reasoning { delta: String },
    /// Explicit end marker; always the last event of a successful stream.
    End,
    /// Error surfaced mid-stream.
    Error { error: String },
}

/// Ordered sequence of text deltas with explicit start/end markers.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<TextStreamEvent, PlaygroundError>> + Send>>;

/// Wrap a single complete string as an emulated stream: synthetic start,
/// exactly one delta, synthetic end.
pub fn emulated_stream(metadata: ResponseMetadata, text: String) -> TextStream {
    let s = async_stream::stream! {
        yield Ok(TextStreamEvent::Start { metadata });
        yield Ok(TextStreamEvent::Delta { delta: text });
        yield Ok(TextStreamEvent::End);
    };
    Box::pin(s)
}

/// Options for SSE encoding.
#[derive(Debug, Clone)]
pub struct SseOptions {
    /// Whether to include the initial `start` event with metadata.
    pub include_start: bool,
    /// Whether to mask error messages instead of leaking detail.
    pub mask_errors: bool,
}

impl Default for SseOptions {
    fn default() -> Self {
        Self {
            include_start: true,
            mask_errors: true,
        }
    }
}

/// Convert a `TextStream` into SSE lines (`event: X\ndata: ...\n\n`).
///
/// Events: `start` (optional), `delta`, `reasoning`, `end`, `error`.
pub fn sse_lines(
    stream: TextStream,
    opts: SseOptions,
) -> Pin<Box<dyn Stream<Item = Result<String, PlaygroundError>> + Send>> {
    let s = async_stream::try_stream! {
        futures::pin_mut!(stream);
        let mut buffer = String::with_capacity(256);

        while let Some(item) = stream.next().await {
            buffer.clear();

            match item? {
                TextStreamEvent::Start { metadata } => {
                    if opts.include_start {
                        let data = serde_json::to_string(&metadata).unwrap_or("{}".into());
                        buffer.push_str("event: start\ndata: ");
                        buffer.push_str(&data);
                        buffer.push_str("\n\n");
                        yield buffer.clone();
                    }
                }
                TextStreamEvent::Delta { delta } => {
                    let data = serde_json::json!({"response": delta});
                    buffer.push_str("event: delta\ndata: ");
                    buffer.push_str(&data.to_string());
                    buffer.push_str("\n\n");
                    yield buffer.clone();
                }
                TextStreamEvent::Reasoning { delta } => {
                    let data = serde_json::json!({"reasoning": delta});
                    buffer.push_str("event: reasoning\ndata: ");
                    buffer.push_str(&data.to_string());
                    buffer.push_str("\n\n");
                    yield buffer.clone();
                }
                TextStreamEvent::End => {
                    buffer.push_str("event: end\ndata: [DONE]\n\n");
                    yield buffer.clone();
                }
                TextStreamEvent::Error { error } => {
                    let msg = if opts.mask_errors {
                        "stream error".to_string()
                    } else {
                        error
                    };
                    buffer.push_str("event: error\ndata: ");
                    buffer.push_str(&serde_json::json!({"error": msg}).to_string());
                    buffer.push_str("\n\n");
                    yield buffer.clone();
                    Err::<(), PlaygroundError>(PlaygroundError::internal(msg))?;
                }
            }
        }
    };
    Box::pin(s)
}
