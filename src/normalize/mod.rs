//! Response Normalizer
//!
//! Converts the heterogeneous raw outputs of the inference capability into
//! the small set of stable output contracts. All shape-sniffing lives here;
//! no other component inspects `RawOutput`.
//!
//! Per family:
//! - text: token streams wrapped with start/delta/end markers; batched
//!   strings emitted as one delta between synthetic markers
//! - image: byte streams drained into one buffer and base64-encoded;
//!   embedded base64 used directly; media type from a per-model table with
//!   a heuristic fallback
//! - speech-to-text: first channel, first alternative of the nested shape,
//!   ties broken by source order; degraded top-level transcript fallback
//! - text-to-speech: byte stream, bare base64 string, binary buffer, or
//!   base64-bearing object, always emitted as `{base64, contentType}`

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::StreamExt;
use serde_json::Value;

use crate::error::PlaygroundError;
use crate::inference::TokenStream;
use crate::payload::encoding_content_type;
use crate::streaming::{TextStream, TextStreamEvent};
use crate::types::{
    AudioOutput, ImageOutput, RawByteStream, RawOutput, ResponseMetadata, Transcription,
    WordTiming,
};

/// Documented output media type per image model. Models outside the table
/// fall back to the shape heuristic (binary → PNG, base64 field → JPEG).
const IMAGE_MEDIA_TYPES: &[(&str, &str)] = &[
    ("@cf/black-forest-labs/flux-1-schnell", "image/jpeg"),
    ("@cf/stabilityai/stable-diffusion-xl-base-1.0", "image/png"),
    ("@cf/bytedance/stable-diffusion-xl-lightning", "image/png"),
    ("@cf/runwayml/stable-diffusion-v1-5-inpainting", "image/png"),
    ("@cf/lykon/dreamshaper-8-lcm", "image/png"),
];

/// Fixed output content type for synthesis models that return a structured
/// base64 envelope instead of honoring the requested encoding.
const AUDIO_CONTENT_TYPES: &[(&str, &str)] = &[("@cf/myshell-ai/melotts", "audio/mpeg")];

fn table_lookup(table: &'static [(&'static str, &'static str)], model_id: &str) -> Option<&'static str> {
    table
        .iter()
        .find(|(id, _)| *id == model_id)
        .map(|(_, v)| *v)
}

/// Drain a byte stream fully into one buffer. Chunk sizes are whatever the
/// transport delivers; no fixed-size assumption.
async fn drain(mut stream: RawByteStream) -> Result<Vec<u8>, PlaygroundError> {
    let mut buffer = Vec::new();
    while let Some(chunk) = stream.next().await {
        buffer.extend_from_slice(&chunk?);
    }
    Ok(buffer)
}

/// Wrap a live token stream with start/delta/end markers. Reasoning deltas
/// are forwarded as their own event kind. A mid-stream failure becomes an
/// explicit error event followed by termination.
pub fn wrap_token_stream(metadata: ResponseMetadata, mut tokens: TokenStream) -> TextStream {
    let s = async_stream::stream! {
        yield Ok(TextStreamEvent::Start { metadata });
        while let Some(item) = tokens.next().await {
            match item {
                Ok(delta) => {
                    if let Some(reasoning) = delta.reasoning {
                        yield Ok(TextStreamEvent::Reasoning { delta: reasoning });
                    }
                    if let Some(text) = delta.text {
                        yield Ok(TextStreamEvent::Delta { delta: text });
                    }
                }
                Err(err) => {
                    yield Ok(TextStreamEvent::Error { error: err.to_string() });
                    return;
                }
            }
        }
        yield Ok(TextStreamEvent::End);
    };
    Box::pin(s)
}

/// Extract the complete text of a batched chat response.
pub fn batch_text(raw: RawOutput) -> Result<String, PlaygroundError> {
    match raw {
        RawOutput::Structured(Value::String(text)) => Ok(text),
        RawOutput::Structured(value) => value
            .get("response")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                PlaygroundError::MalformedResponse(
                    "batched chat response carries no response text".to_string(),
                )
            }),
        RawOutput::Base64(text) => Ok(text),
        RawOutput::ByteStream(_) | RawOutput::Binary(_) => Err(PlaygroundError::MalformedResponse(
            "batched chat response was binary".to_string(),
        )),
    }
}

/// Normalize an image response into `{base64, mediaType, byteLength}`.
pub async fn normalize_image(
    model_id: &str,
    raw: RawOutput,
) -> Result<ImageOutput, PlaygroundError> {
    match raw {
        RawOutput::ByteStream(stream) => {
            let bytes = drain(stream).await?;
            encode_image_bytes(model_id, bytes)
        }
        RawOutput::Binary(bytes) => encode_image_bytes(model_id, bytes),
        RawOutput::Base64(base64) => from_embedded_base64(model_id, base64),
        RawOutput::Structured(value) => {
            let embedded = value
                .get("image")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    PlaygroundError::MalformedResponse(
                        "image response carries no image field".to_string(),
                    )
                })?;
            from_embedded_base64(model_id, embedded.to_string())
        }
    }
}

fn encode_image_bytes(model_id: &str, bytes: Vec<u8>) -> Result<ImageOutput, PlaygroundError> {
    if bytes.is_empty() {
        return Err(PlaygroundError::MalformedResponse(
            "image response was empty".to_string(),
        ));
    }
    let media_type = table_lookup(IMAGE_MEDIA_TYPES, model_id).unwrap_or("image/png");
    Ok(ImageOutput {
        base64: BASE64.encode(&bytes),
        media_type: media_type.to_string(),
        byte_length: bytes.len(),
    })
}

fn from_embedded_base64(model_id: &str, base64: String) -> Result<ImageOutput, PlaygroundError> {
    let decoded = BASE64.decode(base64.as_bytes()).map_err(|_| {
        PlaygroundError::MalformedResponse("image field is not valid base64".to_string())
    })?;
    let media_type = table_lookup(IMAGE_MEDIA_TYPES, model_id).unwrap_or("image/jpeg");
    Ok(ImageOutput {
        base64,
        media_type: media_type.to_string(),
        byte_length: decoded.len(),
    })
}

/// Normalize a transcription response. The expected shape nests
/// channels → alternatives → transcript/words; the first channel and first
/// alternative are selected deterministically. A top-level transcript (or
/// text) string is accepted as a degraded fallback.
pub fn normalize_transcription(raw: RawOutput) -> Result<Transcription, PlaygroundError> {
    let value = match raw {
        RawOutput::Structured(value) => value,
        other => {
            return Err(PlaygroundError::MalformedResponse(format!(
                "transcription response was not structured: {other:?}"
            )));
        }
    };

    if let Some(alternative) = value
        .get("results")
        .and_then(|r| r.get("channels"))
        .and_then(|c| c.get(0))
        .and_then(|ch| ch.get("alternatives"))
        .and_then(|a| a.get(0))
    {
        let transcript = alternative
            .get("transcript")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                PlaygroundError::MalformedResponse(
                    "transcription alternative carries no transcript".to_string(),
                )
            })?;
        let language = value
            .get("results")
            .and_then(|r| r.get("channels"))
            .and_then(|c| c.get(0))
            .and_then(|ch| ch.get("detected_language"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let duration = value
            .get("metadata")
            .and_then(|m| m.get("duration"))
            .and_then(Value::as_f64);
        return Ok(Transcription {
            transcript: transcript.to_string(),
            confidence: alternative.get("confidence").and_then(Value::as_f64),
            duration,
            language,
            words: extract_words(alternative.get("words")),
        });
    }

    // Degraded fallback: flat transcript with optional top-level words.
    let flat = value
        .get("transcript")
        .or_else(|| value.get("text"))
        .and_then(Value::as_str);
    if let Some(transcript) = flat {
        return Ok(Transcription {
            transcript: transcript.to_string(),
            confidence: value.get("confidence").and_then(Value::as_f64),
            duration: value.get("duration").and_then(Value::as_f64),
            language: value
                .get("language")
                .and_then(Value::as_str)
                .map(str::to_string),
            words: extract_words(value.get("words")),
        });
    }

    Err(PlaygroundError::MalformedResponse(
        "transcription response matched no recognized shape".to_string(),
    ))
}

fn extract_words(words: Option<&Value>) -> Option<Vec<WordTiming>> {
    let list = words?.as_array()?;
    let timings: Vec<WordTiming> = list
        .iter()
        .filter_map(|w| {
            Some(WordTiming {
                word: w.get("word")?.as_str()?.to_string(),
                start_seconds: w.get("start")?.as_f64()?,
                end_seconds: w.get("end")?.as_f64()?,
                confidence: w.get("confidence").and_then(Value::as_f64),
            })
        })
        .collect();
    if timings.is_empty() { None } else { Some(timings) }
}

/// Normalize a synthesis response into `{base64, contentType}`. All four
/// source shapes are supported; content type follows the requested encoding
/// except for structured envelopes, which are model-fixed.
pub async fn normalize_audio(
    model_id: &str,
    requested_encoding: &str,
    raw: RawOutput,
) -> Result<AudioOutput, PlaygroundError> {
    let requested_type = encoding_content_type(requested_encoding)
        .unwrap_or("audio/mpeg")
        .to_string();
    match raw {
        RawOutput::ByteStream(stream) => {
            let bytes = drain(stream).await?;
            Ok(AudioOutput {
                base64: BASE64.encode(&bytes),
                content_type: requested_type,
            })
        }
        RawOutput::Binary(bytes) => Ok(AudioOutput {
            base64: BASE64.encode(&bytes),
            content_type: requested_type,
        }),
        RawOutput::Base64(base64) => Ok(AudioOutput {
            base64,
            content_type: requested_type,
        }),
        RawOutput::Structured(value) => {
            let base64 = value
                .get("audio")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| value.as_str().map(str::to_string))
                .ok_or_else(|| {
                    PlaygroundError::MalformedResponse(
                        "audio response carries no audio field".to_string(),
                    )
                })?;
            let content_type = table_lookup(AUDIO_CONTENT_TYPES, model_id)
                .unwrap_or("audio/mpeg")
                .to_string();
            Ok(AudioOutput {
                base64,
                content_type,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use serde_json::json;

    fn byte_stream(chunks: Vec<&'static [u8]>) -> RawOutput {
        let stream = futures::stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok::<_, PlaygroundError>(Bytes::from_static(c))),
        );
        RawOutput::ByteStream(Box::pin(stream))
    }

    #[tokio::test]
    async fn image_byte_stream_round_trips() {
        let raw = byte_stream(vec![b"\x89PNG", b"\r\n\x1a\n", b"payload"]);
        let out = normalize_image("@cf/stabilityai/stable-diffusion-xl-base-1.0", raw)
            .await
            .unwrap();
        let decoded = BASE64.decode(out.base64.as_bytes()).unwrap();
        assert_eq!(decoded, b"\x89PNG\r\n\x1a\npayload");
        assert_eq!(out.byte_length, decoded.len());
        assert_eq!(out.media_type, "image/png");
    }

    #[tokio::test]
    async fn image_embedded_base64_used_directly() {
        let encoded = BASE64.encode(b"jpeg-bytes");
        let raw = RawOutput::Structured(json!({ "image": encoded }));
        let out = normalize_image("@cf/black-forest-labs/flux-1-schnell", raw)
            .await
            .unwrap();
        assert_eq!(out.base64, encoded);
        assert_eq!(out.media_type, "image/jpeg");
        assert_eq!(out.byte_length, b"jpeg-bytes".len());
    }

    #[tokio::test]
    async fn image_media_type_heuristic_for_unknown_models() {
        let raw = RawOutput::Binary(b"raw".to_vec());
        let out = normalize_image("@cf/unknown/painter", raw).await.unwrap();
        assert_eq!(out.media_type, "image/png");

        let raw = RawOutput::Base64(BASE64.encode(b"raw"));
        let out = normalize_image("@cf/unknown/painter", raw).await.unwrap();
        assert_eq!(out.media_type, "image/jpeg");
    }

    #[tokio::test]
    async fn image_invalid_base64_is_malformed() {
        let raw = RawOutput::Structured(json!({ "image": "not base64!!!" }));
        let err = normalize_image("@cf/black-forest-labs/flux-1-schnell", raw)
            .await
            .unwrap_err();
        assert!(matches!(err, PlaygroundError::MalformedResponse(_)));
    }

    #[test]
    fn transcription_nested_shape() {
        let raw = RawOutput::Structured(json!({
            "results": {
                "channels": [{
                    "alternatives": [{
                        "transcript": "hello world",
                        "confidence": 0.95,
                        "words": [
                            { "word": "hello", "start": 0.0, "end": 0.4, "confidence": 0.97 },
                            { "word": "world", "start": 0.5, "end": 0.9 }
                        ]
                    }]
                }]
            },
            "metadata": { "duration": 1.2 }
        }));
        let t = normalize_transcription(raw).unwrap();
        assert_eq!(t.transcript, "hello world");
        assert_eq!(t.confidence, Some(0.95));
        assert_eq!(t.duration, Some(1.2));
        let words = t.words.unwrap();
        assert_eq!(words.len(), 2);
        assert_eq!(words[0].word, "hello");
        assert_eq!(words[1].confidence, None);
    }

    #[test]
    fn transcription_first_channel_first_alternative_wins() {
        let raw = RawOutput::Structured(json!({
            "results": {
                "channels": [
                    { "alternatives": [ { "transcript": "first" }, { "transcript": "second" } ] },
                    { "alternatives": [ { "transcript": "other channel" } ] }
                ]
            }
        }));
        assert_eq!(normalize_transcription(raw).unwrap().transcript, "first");
    }

    #[test]
    fn transcription_degraded_flat_fallback() {
        let raw = RawOutput::Structured(json!({ "text": "flat transcript", "duration": 2.0 }));
        let t = normalize_transcription(raw).unwrap();
        assert_eq!(t.transcript, "flat transcript");
        assert_eq!(t.duration, Some(2.0));
    }

    #[test]
    fn transcription_unrecognized_shape_is_malformed() {
        let raw = RawOutput::Structured(json!({ "noise": true }));
        assert!(matches!(
            normalize_transcription(raw),
            Err(PlaygroundError::MalformedResponse(_))
        ));
    }

    #[tokio::test]
    async fn audio_plain_base64_with_requested_encoding() {
        let raw = RawOutput::Base64("QUJD".to_string());
        let out = normalize_audio("@cf/deepgram/aura-1", "mp3", raw).await.unwrap();
        assert_eq!(out.base64, "QUJD");
        assert_eq!(out.content_type, "audio/mpeg");
    }

    #[tokio::test]
    async fn audio_byte_stream_and_binary_follow_requested_encoding() {
        let raw = byte_stream(vec![b"AB", b"C"]);
        let out = normalize_audio("@cf/deepgram/aura-1", "linear16", raw).await.unwrap();
        assert_eq!(out.base64, BASE64.encode(b"ABC"));
        assert_eq!(out.content_type, "audio/wav");

        let raw = RawOutput::Binary(b"ABC".to_vec());
        let out = normalize_audio("@cf/deepgram/aura-1", "flac", raw).await.unwrap();
        assert_eq!(out.content_type, "audio/flac");
    }

    #[tokio::test]
    async fn audio_structured_envelope_is_model_fixed() {
        let raw = RawOutput::Structured(json!({ "audio": "QUJD" }));
        let out = normalize_audio("@cf/myshell-ai/melotts", "linear16", raw).await.unwrap();
        assert_eq!(out.base64, "QUJD");
        // melotts always emits mp3 regardless of the requested encoding
        assert_eq!(out.content_type, "audio/mpeg");
    }

    #[tokio::test]
    async fn audio_empty_envelope_is_malformed() {
        let raw = RawOutput::Structured(json!({ "something": "else" }));
        assert!(matches!(
            normalize_audio("@cf/myshell-ai/melotts", "mp3", raw).await,
            Err(PlaygroundError::MalformedResponse(_))
        ));
    }

    #[test]
    fn batch_text_extraction() {
        assert_eq!(
            batch_text(RawOutput::Structured(json!({ "response": "done" }))).unwrap(),
            "done"
        );
        assert_eq!(
            batch_text(RawOutput::Structured(json!("plain"))).unwrap(),
            "plain"
        );
        assert!(batch_text(RawOutput::Structured(json!({ "other": 1 }))).is_err());
    }

    #[tokio::test]
    async fn token_stream_wrapped_with_markers() {
        use crate::inference::TokenDelta;
        use futures::StreamExt;

        let tokens = futures::stream::iter(vec![
            Ok(TokenDelta { text: Some("a".into()), reasoning: None }),
            Ok(TokenDelta { text: None, reasoning: Some("thinking".into()) }),
            Ok(TokenDelta { text: Some("b".into()), reasoning: None }),
        ]);
        let stream = wrap_token_stream(ResponseMetadata::new("m"), Box::pin(tokens));
        let events: Vec<_> = stream.map(|e| e.unwrap()).collect().await;
        assert!(matches!(events.first(), Some(TextStreamEvent::Start { .. })));
        assert!(matches!(events.last(), Some(TextStreamEvent::End)));
        let deltas: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                TextStreamEvent::Delta { delta } => Some(delta.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(deltas, vec!["a", "b"]);
        assert!(events.iter().any(|e| matches!(e, TextStreamEvent::Reasoning { .. })));
    }
}
