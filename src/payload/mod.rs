//! Payload Builder
//!
//! Converts a generic user request (prompt/text/messages plus untyped
//! overrides) into a validated, model-specific invocation payload.
//!
//! The validation policy is deliberately asymmetric: numeric fields present
//! in the model's declared ranges are silently clamped into range, while
//! enums and text lengths reject loudly with `InvalidInput`. Sliders clamp;
//! free text fails.

use rand::Rng;
use serde_json::{Map, Value, json};

use crate::error::PlaygroundError;
use crate::registry::{CapabilityTag, ModelDescriptor};
use crate::types::Message;

/// Hard cap on image prompts.
pub const MAX_IMAGE_PROMPT_CHARS: usize = 2048;
/// Hard cap on speech synthesis text.
pub const MAX_TTS_TEXT_CHARS: usize = 10_000;

/// Voices accepted by the speech synthesis models.
pub const SPEAKERS: &[&str] = &[
    "asteria", "luna", "stella", "athena", "hera", "orion", "arcas", "perseus", "angus",
    "orpheus", "helios", "zeus",
];

/// Audio encodings accepted for synthesis, with their MIME types.
pub const ENCODINGS: &[(&str, &str)] = &[
    ("mp3", "audio/mpeg"),
    ("linear16", "audio/wav"),
    ("flac", "audio/flac"),
    ("aac", "audio/aac"),
    ("opus", "audio/ogg"),
];

/// Languages accepted by the multilingual synthesis models.
pub const TTS_LANGUAGES: &[&str] = &["en", "es", "fr", "zh", "ja", "ko"];

/// MIME type for a requested audio encoding, if supported.
pub fn encoding_content_type(encoding: &str) -> Option<&'static str> {
    ENCODINGS
        .iter()
        .find(|(name, _)| *name == encoding)
        .map(|(_, mime)| *mime)
}

/// Merge defaults with overrides, then clamp every numeric field that has a
/// declared range. Out-of-range values are corrected, never rejected.
fn merge_and_clamp(model: &ModelDescriptor, overrides: &Map<String, Value>) -> Map<String, Value> {
    let mut payload = model.defaults.clone();
    for (key, value) in overrides {
        if value.is_null() {
            continue;
        }
        payload.insert(key.clone(), value.clone());
    }
    for (name, range) in &model.ranges {
        if let Some(value) = payload.get(name) {
            if let Some(clamped) = range.clamp(value) {
                payload.insert(name.clone(), clamped);
            }
        }
    }
    payload
}

/// Seed policy: a positive caller-supplied seed is kept for
/// reproducibility; otherwise a uniform random 32-bit value is generated.
fn ensure_seed(payload: &mut Map<String, Value>) {
    let supplied = payload
        .get("seed")
        .and_then(Value::as_i64)
        .filter(|s| *s > 0);
    if supplied.is_none() {
        let seed: u32 = rand::thread_rng().r#gen();
        payload.insert("seed".to_string(), json!(seed));
    }
}

/// Drop payload fields the target model's capability set does not permit.
/// Callers may supply them freely; unsupported fields never reach the
/// inference capability.
fn apply_capability_gates(model: &ModelDescriptor, payload: &mut Map<String, Value>) {
    let gates: &[(&str, &[CapabilityTag])] = &[
        ("image", &[CapabilityTag::ImageToImage]),
        ("strength", &[CapabilityTag::ImageToImage]),
        ("mask", &[CapabilityTag::Inpainting]),
        (
            "negative_prompt",
            &[CapabilityTag::ImageToImage, CapabilityTag::Inpainting],
        ),
    ];
    for (field, tags) in gates {
        let permitted = tags.iter().any(|tag| model.has_capability(*tag));
        if !permitted {
            payload.remove(*field);
        }
    }
}

fn validate_prompt(prompt: &str, max_chars: usize, field: &str) -> Result<(), PlaygroundError> {
    if prompt.trim().is_empty() {
        return Err(PlaygroundError::invalid_input(format!(
            "{field} must not be empty"
        )));
    }
    if prompt.chars().count() > max_chars {
        return Err(PlaygroundError::invalid_input(format!(
            "{field} exceeds the {max_chars} character limit"
        )));
    }
    Ok(())
}

/// Build a chat invocation payload: conversation plus clamped sampling
/// parameters. The streaming flag is the dispatcher's concern.
pub fn build_chat(
    model: &ModelDescriptor,
    messages: &[Message],
    overrides: &Map<String, Value>,
) -> Result<Map<String, Value>, PlaygroundError> {
    if messages.is_empty() {
        return Err(PlaygroundError::invalid_input("messages must not be empty"));
    }
    if messages.iter().all(|m| m.content.trim().is_empty()) {
        return Err(PlaygroundError::invalid_input(
            "messages must contain non-empty content",
        ));
    }
    let mut payload = merge_and_clamp(model, overrides);
    payload.insert("messages".to_string(), serde_json::to_value(messages)?);
    Ok(payload)
}

/// Build an image generation payload: validated prompt, clamped parameters,
/// seed policy, capability-gated extras, and the image/dimension mutual
/// exclusion.
pub fn build_image(
    model: &ModelDescriptor,
    prompt: &str,
    overrides: &Map<String, Value>,
) -> Result<Map<String, Value>, PlaygroundError> {
    validate_prompt(prompt, MAX_IMAGE_PROMPT_CHARS, "prompt")?;
    let mut payload = merge_and_clamp(model, overrides);
    payload.insert("prompt".to_string(), json!(prompt));
    ensure_seed(&mut payload);
    apply_capability_gates(model, &mut payload);
    // With a source image present the backend infers dimensions from it;
    // default width/height would fight that.
    if payload.contains_key("image") {
        payload.remove("width");
        payload.remove("height");
    }
    Ok(payload)
}

/// Build a speech synthesis payload. Text length and the
/// speaker/encoding/language enumerations reject eagerly; nothing here is
/// clamped.
pub fn build_tts(
    model: &ModelDescriptor,
    text: &str,
    overrides: &Map<String, Value>,
) -> Result<Map<String, Value>, PlaygroundError> {
    validate_prompt(text, MAX_TTS_TEXT_CHARS, "text")?;
    if let Some(speaker) = overrides.get("speaker").and_then(Value::as_str) {
        if !SPEAKERS.contains(&speaker) {
            return Err(PlaygroundError::invalid_input(format!(
                "unsupported speaker: {speaker}"
            )));
        }
    }
    if let Some(encoding) = overrides.get("encoding").and_then(Value::as_str) {
        if encoding_content_type(encoding).is_none() {
            return Err(PlaygroundError::invalid_input(format!(
                "unsupported encoding: {encoding}"
            )));
        }
    }
    if let Some(lang) = overrides.get("lang").and_then(Value::as_str) {
        if !TTS_LANGUAGES.contains(&lang) {
            return Err(PlaygroundError::invalid_input(format!(
                "unsupported language: {lang}"
            )));
        }
    }
    let mut payload = merge_and_clamp(model, overrides);
    payload.insert("text".to_string(), json!(text));
    Ok(payload)
}

/// Build a transcription payload from caller options. The dispatcher
/// attaches the audio itself; only recognized toggles pass through here, and
/// language detection is gated on the model actually supporting it.
pub fn build_stt(
    model: &ModelDescriptor,
    overrides: &Map<String, Value>,
) -> Result<Map<String, Value>, PlaygroundError> {
    let mut payload = merge_and_clamp(model, overrides);
    if !model.has_capability(CapabilityTag::LanguageDetection) {
        payload.remove("detect_language");
    }
    if !model.has_capability(CapabilityTag::SmartFormatting) {
        payload.remove("punctuate");
        payload.remove("smart_format");
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::descriptor;

    fn overrides(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn flux_steps_clamped_to_declared_max() {
        let model = descriptor("@cf/black-forest-labs/flux-1-schnell").unwrap();
        let payload =
            build_image(model, "a red fox", &overrides(json!({ "steps": 999 }))).unwrap();
        assert_eq!(payload["steps"], json!(8));
    }

    #[test]
    fn numeric_fields_never_leave_declared_ranges() {
        let model = descriptor("@cf/stabilityai/stable-diffusion-xl-base-1.0").unwrap();
        let payload = build_image(
            model,
            "a lighthouse",
            &overrides(json!({
                "steps": -5,
                "guidance": 1000,
                "width": 10,
                "height": 99999,
            })),
        )
        .unwrap();
        for (name, range) in &model.ranges {
            if let Some(value) = payload.get(name).and_then(Value::as_f64) {
                if let crate::registry::ParamRange::Numeric { min, max } = range {
                    assert!(value >= *min && value <= *max, "{name} out of range");
                }
            }
        }
        assert_eq!(payload["steps"], json!(1));
        assert_eq!(payload["guidance"], json!(20));
    }

    #[test]
    fn empty_prompt_rejected() {
        let model = descriptor("@cf/black-forest-labs/flux-1-schnell").unwrap();
        let err = build_image(model, "   ", &Map::new()).unwrap_err();
        assert!(matches!(err, PlaygroundError::InvalidInput(_)));
    }

    #[test]
    fn oversized_prompt_rejected_not_clamped() {
        let model = descriptor("@cf/black-forest-labs/flux-1-schnell").unwrap();
        let long = "x".repeat(3000);
        let err = build_image(model, &long, &Map::new()).unwrap_err();
        assert!(matches!(err, PlaygroundError::InvalidInput(_)));
    }

    #[test]
    fn positive_seed_kept_absent_seed_generated() {
        let model = descriptor("@cf/black-forest-labs/flux-1-schnell").unwrap();
        let payload =
            build_image(model, "a fox", &overrides(json!({ "seed": 42 }))).unwrap();
        assert_eq!(payload["seed"], json!(42));

        let payload = build_image(model, "a fox", &Map::new()).unwrap();
        let seed = payload["seed"].as_i64().unwrap();
        assert!(seed >= 0);
    }

    #[test]
    fn non_positive_seed_replaced() {
        let model = descriptor("@cf/black-forest-labs/flux-1-schnell").unwrap();
        let payload = build_image(model, "a fox", &overrides(json!({ "seed": -1 }))).unwrap();
        assert!(payload["seed"].as_i64().unwrap() >= 0);
    }

    #[test]
    fn unsupported_fields_stripped_for_text_to_image_model() {
        let model = descriptor("@cf/black-forest-labs/flux-1-schnell").unwrap();
        let payload = build_image(
            model,
            "a fox",
            &overrides(json!({
                "image": "aGVsbG8=",
                "mask": "aGVsbG8=",
                "strength": 0.5,
                "negative_prompt": "blurry",
            })),
        )
        .unwrap();
        assert!(!payload.contains_key("image"));
        assert!(!payload.contains_key("mask"));
        assert!(!payload.contains_key("strength"));
        assert!(!payload.contains_key("negative_prompt"));
    }

    #[test]
    fn gated_fields_kept_when_capability_present() {
        let model = descriptor("@cf/stabilityai/stable-diffusion-xl-base-1.0").unwrap();
        let payload = build_image(
            model,
            "a fox",
            &overrides(json!({
                "image": "aGVsbG8=",
                "mask": "aGVsbG8=",
                "strength": 0.5,
                "negative_prompt": "blurry",
            })),
        )
        .unwrap();
        assert!(payload.contains_key("image"));
        assert!(payload.contains_key("mask"));
        assert!(payload.contains_key("strength"));
        assert!(payload.contains_key("negative_prompt"));
    }

    #[test]
    fn input_image_suppresses_dimensions() {
        let model = descriptor("@cf/stabilityai/stable-diffusion-xl-base-1.0").unwrap();
        let payload = build_image(
            model,
            "a fox",
            &overrides(json!({ "image": "aGVsbG8=", "width": 512, "height": 512 })),
        )
        .unwrap();
        assert!(!payload.contains_key("width"));
        assert!(!payload.contains_key("height"));

        let payload = build_image(model, "a fox", &Map::new()).unwrap();
        assert!(payload.contains_key("width"));
        assert!(payload.contains_key("height"));
    }

    #[test]
    fn chat_requires_content() {
        let model = descriptor("@cf/meta/llama-3.1-8b-instruct").unwrap();
        assert!(build_chat(model, &[], &Map::new()).is_err());

        let messages = vec![Message {
            role: crate::types::MessageRole::User,
            content: "  ".to_string(),
        }];
        assert!(build_chat(model, &messages, &Map::new()).is_err());
    }

    #[test]
    fn chat_clamps_sampling_parameters() {
        let model = descriptor("@cf/meta/llama-3.1-8b-instruct").unwrap();
        let messages = vec![Message {
            role: crate::types::MessageRole::User,
            content: "hi".to_string(),
        }];
        let payload = build_chat(
            model,
            &messages,
            &overrides(json!({ "temperature": 50, "max_tokens": 1_000_000 })),
        )
        .unwrap();
        assert_eq!(payload["temperature"], json!(5));
        assert_eq!(payload["max_tokens"], json!(4096));
        assert!(payload["messages"].is_array());
    }

    #[test]
    fn tts_text_cap_and_enums_reject() {
        let model = descriptor("@cf/deepgram/aura-1").unwrap();
        let long = "y".repeat(10_001);
        assert!(build_tts(model, &long, &Map::new()).is_err());
        assert!(
            build_tts(model, "hello", &overrides(json!({ "speaker": "gandalf" }))).is_err()
        );
        assert!(
            build_tts(model, "hello", &overrides(json!({ "encoding": "wavpack" }))).is_err()
        );
        let ok = build_tts(
            model,
            "hello",
            &overrides(json!({ "speaker": "luna", "encoding": "mp3" })),
        )
        .unwrap();
        assert_eq!(ok["speaker"], json!("luna"));
        assert_eq!(ok["text"], json!("hello"));
    }

    #[test]
    fn stt_language_detection_gated() {
        let plain = descriptor("@cf/openai/whisper").unwrap();
        let payload =
            build_stt(plain, &overrides(json!({ "detect_language": true }))).unwrap();
        assert!(!payload.contains_key("detect_language"));

        let detecting = descriptor("@cf/deepgram/nova-3").unwrap();
        let payload =
            build_stt(detecting, &overrides(json!({ "detect_language": true }))).unwrap();
        assert_eq!(payload["detect_language"], json!(true));
    }

    #[test]
    fn stt_formatting_toggles_gated() {
        let plain = descriptor("@cf/openai/whisper").unwrap();
        let payload = build_stt(
            plain,
            &overrides(json!({ "punctuate": true, "smart_format": true })),
        )
        .unwrap();
        assert!(!payload.contains_key("punctuate"));
        assert!(!payload.contains_key("smart_format"));

        let formatting = descriptor("@cf/deepgram/nova-3").unwrap();
        let payload = build_stt(
            formatting,
            &overrides(json!({ "punctuate": false, "smart_format": true })),
        )
        .unwrap();
        assert_eq!(payload["punctuate"], json!(false));
        assert_eq!(payload["smart_format"], json!(true));
    }

    #[test]
    fn encoding_table_resolves_mime_types() {
        assert_eq!(encoding_content_type("mp3"), Some("audio/mpeg"));
        assert_eq!(encoding_content_type("linear16"), Some("audio/wav"));
        assert_eq!(encoding_content_type("vorbis"), None);
    }
}
