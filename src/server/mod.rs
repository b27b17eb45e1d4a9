//! HTTP surface
//!
//! Axum routes wrapping the dispatcher: one POST route per capability plus
//! a side-effect-free GET introspection endpoint on each path. This layer
//! owns request parsing, client identity extraction, and the mapping from
//! the error taxonomy onto HTTP responses; everything semantic lives in the
//! dispatcher and below.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{DefaultBodyLimit, Multipart, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::error;

use crate::dispatch::{Dispatcher, envelope};
use crate::error::PlaygroundError;
use crate::payload::{ENCODINGS, MAX_TTS_TEXT_CHARS, SPEAKERS, TTS_LANGUAGES};
use crate::rate_limit::daily_max;
use crate::registry::{self, ModelFamily};
use crate::streaming::{SseOptions, sse_lines};
use crate::types::{Capability, Message};

/// Maximum accepted audio upload.
pub const MAX_AUDIO_BYTES: usize = 25 * 1024 * 1024;

/// Audio MIME types accepted for transcription.
const AUDIO_MIME_TYPES: &[&str] = &[
    "audio/mpeg",
    "audio/mp3",
    "audio/wav",
    "audio/x-wav",
    "audio/mp4",
    "audio/m4a",
    "audio/x-m4a",
    "audio/ogg",
    "audio/flac",
    "audio/webm",
    "audio/aac",
    "audio/opus",
];

/// Accepted audio file extensions, for uploads with a generic MIME type.
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "m4a", "mp4", "ogg", "flac", "webm", "aac", "opus"];

/// Shared server state: the dispatcher behind one handle.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
}

impl IntoResponse for PlaygroundError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            // Full detail stays server-side; the body carries generic text.
            error!(error = %self, "request failed");
        }
        let body = match &self {
            PlaygroundError::RateLimited {
                capability,
                remaining,
                reset_at,
            } => json!({
                "error": self.user_message(),
                "rateLimit": {
                    "type": capability.as_str(),
                    "remaining": remaining,
                    "resetTime": reset_at.to_rfc3339(),
                },
            }),
            _ => json!({ "error": self.user_message() }),
        };
        (status, Json(body)).into_response()
    }
}

/// Client identity from network-layer metadata. Never user-supplied fields.
fn client_identity(headers: &HeaderMap) -> String {
    if let Some(ip) = headers.get("cf-connecting-ip").and_then(|v| v.to_str().ok()) {
        return ip.trim().to_string();
    }
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    "unknown".to_string()
}

fn insert_opt(params: &mut Map<String, Value>, key: &str, value: Option<Value>) {
    if let Some(value) = value {
        params.insert(key.to_string(), value);
    }
}

#[derive(Deserialize)]
struct ChatBody {
    messages: Vec<Message>,
    model: Option<String>,
    #[serde(rename = "webSearch")]
    web_search: Option<bool>,
}

async fn chat_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ChatBody>,
) -> Result<Response, PlaygroundError> {
    let mut params = Map::new();
    if body.web_search == Some(true) {
        params.insert("web_search".to_string(), json!(true));
    }
    let envelope = envelope(
        Capability::Chat,
        client_identity(&headers),
        body.model,
        params,
        body.messages,
    );
    let stream = state.dispatcher.chat(envelope).await?;
    let sse = sse_lines(stream, SseOptions::default());
    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(sse))
        .map_err(|e| PlaygroundError::internal(e.to_string()))
}

async fn chat_info(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, PlaygroundError> {
    let status = state
        .dispatcher
        .rate_status(&client_identity(&headers), Capability::Chat)
        .await?;
    let models: Vec<_> = registry::list_by_family(ModelFamily::Text)
        .iter()
        .map(|d| json!({ "id": d.id, "capabilities": d.capabilities }))
        .collect();
    Ok(Json(json!({
        "models": models,
        "limits": { "daily": daily_max(Capability::Chat) },
        "rateLimit": status,
    })))
}

#[derive(Deserialize)]
struct ImageBody {
    prompt: String,
    model: Option<String>,
    steps: Option<u32>,
    seed: Option<i64>,
    width: Option<u32>,
    height: Option<u32>,
    guidance: Option<f64>,
    negative_prompt: Option<String>,
    image_b64: Option<String>,
    mask_b64: Option<String>,
    strength: Option<f64>,
}

async fn image_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ImageBody>,
) -> Result<Json<Value>, PlaygroundError> {
    let mut params = Map::new();
    insert_opt(&mut params, "steps", body.steps.map(|v| json!(v)));
    insert_opt(&mut params, "seed", body.seed.map(|v| json!(v)));
    insert_opt(&mut params, "width", body.width.map(|v| json!(v)));
    insert_opt(&mut params, "height", body.height.map(|v| json!(v)));
    insert_opt(&mut params, "guidance", body.guidance.map(|v| json!(v)));
    insert_opt(
        &mut params,
        "negative_prompt",
        body.negative_prompt.map(|v| json!(v)),
    );
    insert_opt(&mut params, "image", body.image_b64.map(|v| json!(v)));
    insert_opt(&mut params, "mask", body.mask_b64.map(|v| json!(v)));
    insert_opt(&mut params, "strength", body.strength.map(|v| json!(v)));

    let envelope = envelope(
        Capability::Image,
        client_identity(&headers),
        body.model,
        params,
        vec![],
    );
    let (image, metadata) = state.dispatcher.generate_image(envelope, &body.prompt).await?;
    Ok(Json(json!({
        "base64": image.base64,
        "mediaType": image.media_type,
        "byteLength": image.byte_length,
        "metadata": metadata,
    })))
}

async fn image_info(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, PlaygroundError> {
    let status = state
        .dispatcher
        .rate_status(&client_identity(&headers), Capability::Image)
        .await?;
    let models: Vec<_> = registry::list_by_family(ModelFamily::Image)
        .iter()
        .map(|d| {
            json!({
                "id": d.id,
                "capabilities": d.capabilities,
                "ranges": d.ranges,
                "defaults": d.defaults,
            })
        })
        .collect();
    Ok(Json(json!({
        "models": models,
        "limits": { "daily": daily_max(Capability::Image), "maxPromptChars": crate::payload::MAX_IMAGE_PROMPT_CHARS },
        "rateLimit": status,
    })))
}

fn audio_upload_accepted(content_type: Option<&str>, filename: Option<&str>) -> bool {
    if let Some(ct) = content_type {
        let ct = ct.split(';').next().unwrap_or(ct).trim();
        if AUDIO_MIME_TYPES.contains(&ct) {
            return true;
        }
    }
    if let Some(name) = filename {
        if let Some(ext) = name.rsplit('.').next() {
            return AUDIO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str());
        }
    }
    false
}

async fn stt_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<Value>, PlaygroundError> {
    let mut audio: Option<(Vec<u8>, String)> = None;
    let mut model: Option<String> = None;
    let mut params = Map::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| PlaygroundError::invalid_input(format!("malformed form data: {e}")))?
    {
        let field_name = field.name().unwrap_or("").to_string();
        match field_name.as_str() {
            "audio" => {
                let content_type = field.content_type().map(str::to_string);
                let filename = field.file_name().map(str::to_string);
                if !audio_upload_accepted(content_type.as_deref(), filename.as_deref()) {
                    return Err(PlaygroundError::invalid_input(
                        "audio must be a recognized audio file type",
                    ));
                }
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| PlaygroundError::invalid_input(format!("audio upload failed: {e}")))?;
                if bytes.len() > MAX_AUDIO_BYTES {
                    return Err(PlaygroundError::invalid_input(
                        "audio exceeds the 25MB limit",
                    ));
                }
                let media_type = content_type.unwrap_or_else(|| "audio/mpeg".to_string());
                audio = Some((bytes.to_vec(), media_type));
            }
            "model" => {
                model = field.text().await.ok().filter(|s| !s.is_empty());
            }
            "detect_language" | "punctuate" | "smart_format" => {
                if let Ok(text) = field.text().await {
                    params.insert(field_name, json!(text == "true" || text == "1"));
                }
            }
            _ => {}
        }
    }

    let (audio, media_type) =
        audio.ok_or_else(|| PlaygroundError::invalid_input("missing audio field"))?;
    let envelope = envelope(
        Capability::SpeechToText,
        client_identity(&headers),
        model,
        params,
        vec![],
    );
    let (transcription, metadata) = state
        .dispatcher
        .transcribe(envelope, audio, &media_type)
        .await?;
    Ok(Json(json!({
        "success": true,
        "transcription": transcription,
        "metadata": metadata,
    })))
}

async fn stt_info(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, PlaygroundError> {
    let status = state
        .dispatcher
        .rate_status(&client_identity(&headers), Capability::SpeechToText)
        .await?;
    let models: Vec<_> = registry::list_by_family(ModelFamily::SpeechToText)
        .iter()
        .map(|d| json!({ "id": d.id, "capabilities": d.capabilities }))
        .collect();
    Ok(Json(json!({
        "models": models,
        "limits": { "daily": daily_max(Capability::SpeechToText), "maxBytes": MAX_AUDIO_BYTES },
        "supportedTypes": AUDIO_MIME_TYPES,
        "rateLimit": status,
    })))
}

#[derive(Deserialize)]
struct TtsBody {
    text: String,
    model: Option<String>,
    speaker: Option<String>,
    encoding: Option<String>,
    sample_rate: Option<u32>,
    language: Option<String>,
}

fn filename_for_encoding(encoding: &str) -> String {
    let ext = match encoding {
        "linear16" => "wav",
        "opus" => "ogg",
        other => other,
    };
    format!("speech.{ext}")
}

async fn tts_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<TtsBody>,
) -> Result<Json<Value>, PlaygroundError> {
    let mut params = Map::new();
    insert_opt(&mut params, "speaker", body.speaker.map(|v| json!(v)));
    insert_opt(&mut params, "encoding", body.encoding.clone().map(|v| json!(v)));
    insert_opt(&mut params, "sample_rate", body.sample_rate.map(|v| json!(v)));
    insert_opt(&mut params, "lang", body.language.map(|v| json!(v)));

    let envelope = envelope(
        Capability::TextToSpeech,
        client_identity(&headers),
        body.model,
        params,
        vec![],
    );
    let (audio, metadata) = state.dispatcher.synthesize(envelope, &body.text).await?;
    let filename = filename_for_encoding(body.encoding.as_deref().unwrap_or("mp3"));
    Ok(Json(json!({
        "success": true,
        "audio": {
            "base64": audio.base64,
            "contentType": audio.content_type,
            "filename": filename,
        },
        "metadata": metadata,
    })))
}

async fn tts_info(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, PlaygroundError> {
    let status = state
        .dispatcher
        .rate_status(&client_identity(&headers), Capability::TextToSpeech)
        .await?;
    let models: Vec<_> = registry::list_by_family(ModelFamily::TextToSpeech)
        .iter()
        .map(|d| json!({ "id": d.id }))
        .collect();
    let encodings: Vec<_> = ENCODINGS.iter().map(|(name, _)| *name).collect();
    Ok(Json(json!({
        "models": models,
        "limits": { "daily": daily_max(Capability::TextToSpeech), "maxTextChars": MAX_TTS_TEXT_CHARS },
        "speakers": SPEAKERS,
        "encodings": encodings,
        "languages": TTS_LANGUAGES,
        "rateLimit": status,
    })))
}

/// Build the playground router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/chat", get(chat_info).post(chat_post))
        .route("/image", get(image_info).post(image_post))
        .route("/speech-to-text", get(stt_info).post(stt_post))
        .route("/text-to-speech", get(tts_info).post(tts_post))
        .layer(DefaultBodyLimit::max(MAX_AUDIO_BYTES + 1024 * 1024))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_prefers_connecting_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("cf-connecting-ip", "198.51.100.4".parse().unwrap());
        headers.insert("x-forwarded-for", "10.0.0.1, 10.0.0.2".parse().unwrap());
        assert_eq!(client_identity(&headers), "198.51.100.4");
    }

    #[test]
    fn identity_falls_back_to_forwarded_for_then_unknown() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "10.0.0.1, 10.0.0.2".parse().unwrap());
        assert_eq!(client_identity(&headers), "10.0.0.1");
        assert_eq!(client_identity(&HeaderMap::new()), "unknown");
    }

    #[test]
    fn audio_uploads_matched_by_mime_or_extension() {
        assert!(audio_upload_accepted(Some("audio/wav"), None));
        assert!(audio_upload_accepted(Some("audio/mpeg; rate=44100"), None));
        assert!(audio_upload_accepted(None, Some("clip.MP3")));
        assert!(!audio_upload_accepted(Some("video/mp4"), Some("clip.mov")));
        assert!(!audio_upload_accepted(None, None));
    }

    #[test]
    fn synthesis_filenames_follow_encoding() {
        assert_eq!(filename_for_encoding("mp3"), "speech.mp3");
        assert_eq!(filename_for_encoding("linear16"), "speech.wav");
        assert_eq!(filename_for_encoding("opus"), "speech.ogg");
    }
}
