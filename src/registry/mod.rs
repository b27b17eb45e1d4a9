//! Model Schema Registry
//!
//! Static catalog of per-model parameter ranges, defaults, capability tags,
//! invocation strategy and output format, plus the lookup/merge utilities
//! the payload builder and dispatcher run on. Loaded once at process start
//! and never mutated; every request flow reads the same descriptors.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::PlaygroundError;
use crate::types::Capability;

/// Model family, one per capability class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelFamily {
    Text,
    Image,
    SpeechToText,
    TextToSpeech,
}

impl ModelFamily {
    pub fn capability(&self) -> Capability {
        match self {
            Self::Text => Capability::Chat,
            Self::Image => Capability::Image,
            Self::SpeechToText => Capability::SpeechToText,
            Self::TextToSpeech => Capability::TextToSpeech,
        }
    }
}

/// How a model call is driven: an incremental token stream or a single
/// batched call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationStrategy {
    Stream,
    Batch,
}

/// Documented output shape for a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputFormat {
    TokenStream,
    Base64,
    Binary,
    Structured,
}

/// Capability tag gating which payload fields a model accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CapabilityTag {
    ImageToImage,
    Inpainting,
    FastGeneration,
    Reasoning,
    WordTimings,
    LanguageDetection,
    SmartFormatting,
}

/// Declared range for one parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ParamRange {
    Numeric { min: f64, max: f64 },
    Length { min: usize, max: usize },
}

impl ParamRange {
    /// Clamp a JSON value into this range. Returns `None` when the value is
    /// not of the expected shape (left untouched by the caller).
    pub fn clamp(&self, value: &Value) -> Option<Value> {
        match self {
            Self::Numeric { min, max } => {
                let n = value.as_f64()?;
                let clamped = n.clamp(*min, *max);
                if clamped.fract() == 0.0 && n.fract() == 0.0 {
                    Some(json!(clamped as i64))
                } else {
                    Some(json!(clamped))
                }
            }
            Self::Length { .. } => None,
        }
    }
}

/// One inference model: identity, protocol selection, parameter schema.
/// Immutable once the catalog is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub family: ModelFamily,
    pub strategy: InvocationStrategy,
    pub output: OutputFormat,
    pub capabilities: Vec<CapabilityTag>,
    pub ranges: Vec<(String, ParamRange)>,
    pub defaults: Map<String, Value>,
}

impl ModelDescriptor {
    pub fn has_capability(&self, tag: CapabilityTag) -> bool {
        self.capabilities.contains(&tag)
    }

    pub fn range_for(&self, name: &str) -> Option<&ParamRange> {
        self.ranges.iter().find(|(n, _)| n == name).map(|(_, r)| r)
    }
}

fn obj(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn num(name: &str, min: f64, max: f64) -> (String, ParamRange) {
    (name.to_string(), ParamRange::Numeric { min, max })
}

fn chat_model(id: &str, strategy: InvocationStrategy, tags: &[CapabilityTag]) -> ModelDescriptor {
    ModelDescriptor {
        id: id.to_string(),
        family: ModelFamily::Text,
        strategy,
        output: match strategy {
            InvocationStrategy::Stream => OutputFormat::TokenStream,
            InvocationStrategy::Batch => OutputFormat::Structured,
        },
        capabilities: tags.to_vec(),
        ranges: vec![
            num("temperature", 0.0, 5.0),
            num("top_p", 0.0, 2.0),
            num("max_tokens", 1.0, 4096.0),
        ],
        defaults: obj(json!({
            "temperature": 0.6,
            "max_tokens": 2048,
        })),
    }
}

/// The compiled model catalog. Built once, shared by reference everywhere.
static CATALOG: Lazy<Vec<ModelDescriptor>> = Lazy::new(|| {
    vec![
        // Text models. The "@cf/openai/" prefix selects the batched
        // invocation protocol; everything else token-streams.
        chat_model("@cf/meta/llama-3.1-8b-instruct", InvocationStrategy::Stream, &[]),
        chat_model(
            "@cf/meta/llama-3.3-70b-instruct-fp8-fast",
            InvocationStrategy::Stream,
            &[CapabilityTag::FastGeneration],
        ),
        chat_model(
            "@cf/deepseek-ai/deepseek-r1-distill-qwen-32b",
            InvocationStrategy::Stream,
            &[CapabilityTag::Reasoning],
        ),
        chat_model(
            "@cf/mistralai/mistral-small-3.1-24b-instruct",
            InvocationStrategy::Stream,
            &[],
        ),
        chat_model(
            "@cf/qwen/qwen2.5-coder-32b-instruct",
            InvocationStrategy::Stream,
            &[],
        ),
        chat_model(
            "@cf/openai/gpt-oss-120b",
            InvocationStrategy::Batch,
            &[CapabilityTag::Reasoning],
        ),
        // Image models.
        ModelDescriptor {
            id: "@cf/black-forest-labs/flux-1-schnell".to_string(),
            family: ModelFamily::Image,
            strategy: InvocationStrategy::Batch,
            output: OutputFormat::Base64,
            capabilities: vec![CapabilityTag::FastGeneration],
            ranges: vec![num("steps", 1.0, 8.0)],
            defaults: obj(json!({ "steps": 4 })),
        },
        ModelDescriptor {
            id: "@cf/stabilityai/stable-diffusion-xl-base-1.0".to_string(),
            family: ModelFamily::Image,
            strategy: InvocationStrategy::Batch,
            output: OutputFormat::Binary,
            capabilities: vec![CapabilityTag::ImageToImage, CapabilityTag::Inpainting],
            ranges: vec![
                num("steps", 1.0, 20.0),
                num("guidance", 1.0, 20.0),
                num("width", 256.0, 2048.0),
                num("height", 256.0, 2048.0),
                num("strength", 0.0, 1.0),
            ],
            defaults: obj(json!({
                "steps": 20,
                "guidance": 7.5,
                "width": 1024,
                "height": 1024,
            })),
        },
        ModelDescriptor {
            id: "@cf/bytedance/stable-diffusion-xl-lightning".to_string(),
            family: ModelFamily::Image,
            strategy: InvocationStrategy::Batch,
            output: OutputFormat::Binary,
            capabilities: vec![CapabilityTag::FastGeneration],
            ranges: vec![
                num("steps", 1.0, 20.0),
                num("guidance", 1.0, 20.0),
                num("width", 256.0, 2048.0),
                num("height", 256.0, 2048.0),
            ],
            defaults: obj(json!({
                "steps": 20,
                "guidance": 7.5,
                "width": 1024,
                "height": 1024,
            })),
        },
        ModelDescriptor {
            id: "@cf/runwayml/stable-diffusion-v1-5-inpainting".to_string(),
            family: ModelFamily::Image,
            strategy: InvocationStrategy::Batch,
            output: OutputFormat::Binary,
            capabilities: vec![CapabilityTag::Inpainting, CapabilityTag::ImageToImage],
            ranges: vec![
                num("steps", 1.0, 20.0),
                num("guidance", 1.0, 20.0),
                num("width", 256.0, 2048.0),
                num("height", 256.0, 2048.0),
                num("strength", 0.0, 1.0),
            ],
            defaults: obj(json!({
                "steps": 20,
                "guidance": 7.5,
                "width": 512,
                "height": 512,
            })),
        },
        ModelDescriptor {
            id: "@cf/lykon/dreamshaper-8-lcm".to_string(),
            family: ModelFamily::Image,
            strategy: InvocationStrategy::Batch,
            output: OutputFormat::Binary,
            capabilities: vec![CapabilityTag::ImageToImage],
            ranges: vec![
                num("steps", 1.0, 20.0),
                num("guidance", 1.0, 20.0),
                num("width", 256.0, 2048.0),
                num("height", 256.0, 2048.0),
                num("strength", 0.0, 1.0),
            ],
            defaults: obj(json!({
                "steps": 8,
                "guidance": 7.5,
                "width": 1024,
                "height": 1024,
            })),
        },
        // Speech-to-text models.
        ModelDescriptor {
            id: "@cf/openai/whisper".to_string(),
            family: ModelFamily::SpeechToText,
            strategy: InvocationStrategy::Batch,
            output: OutputFormat::Structured,
            capabilities: vec![CapabilityTag::WordTimings],
            ranges: vec![],
            defaults: Map::new(),
        },
        ModelDescriptor {
            id: "@cf/openai/whisper-large-v3-turbo".to_string(),
            family: ModelFamily::SpeechToText,
            strategy: InvocationStrategy::Batch,
            output: OutputFormat::Structured,
            capabilities: vec![CapabilityTag::WordTimings, CapabilityTag::LanguageDetection],
            ranges: vec![],
            defaults: Map::new(),
        },
        ModelDescriptor {
            id: "@cf/deepgram/nova-3".to_string(),
            family: ModelFamily::SpeechToText,
            strategy: InvocationStrategy::Batch,
            output: OutputFormat::Structured,
            capabilities: vec![
                CapabilityTag::WordTimings,
                CapabilityTag::LanguageDetection,
                CapabilityTag::SmartFormatting,
            ],
            ranges: vec![],
            defaults: obj(json!({ "punctuate": true })),
        },
        // Text-to-speech models.
        ModelDescriptor {
            id: "@cf/deepgram/aura-1".to_string(),
            family: ModelFamily::TextToSpeech,
            strategy: InvocationStrategy::Batch,
            output: OutputFormat::Binary,
            capabilities: vec![],
            ranges: vec![num("sample_rate", 8000.0, 48000.0)],
            defaults: obj(json!({
                "speaker": "asteria",
                "encoding": "mp3",
            })),
        },
        ModelDescriptor {
            id: "@cf/myshell-ai/melotts".to_string(),
            family: ModelFamily::TextToSpeech,
            strategy: InvocationStrategy::Batch,
            output: OutputFormat::Structured,
            capabilities: vec![],
            ranges: vec![],
            defaults: obj(json!({ "lang": "en" })),
        },
    ]
});

/// Look up a descriptor by model id.
pub fn descriptor(model_id: &str) -> Result<&'static ModelDescriptor, PlaygroundError> {
    CATALOG
        .iter()
        .find(|d| d.id == model_id)
        .ok_or_else(|| PlaygroundError::UnknownModel(model_id.to_string()))
}

/// Look up a descriptor, falling back to a minimal hard-coded one for ids
/// outside the compiled catalog. Out-of-catalog models get conservative
/// ranges and no capability tags, so unsupported fields are stripped.
pub fn descriptor_or_fallback(model_id: &str, family: ModelFamily) -> ModelDescriptor {
    match descriptor(model_id) {
        Ok(d) => d.clone(),
        Err(_) => fallback_descriptor(model_id, family),
    }
}

/// Minimal descriptor for models missing from the catalog.
pub fn fallback_descriptor(model_id: &str, family: ModelFamily) -> ModelDescriptor {
    let (strategy, output, ranges, defaults) = match family {
        ModelFamily::Text => {
            // Same prefix rule as strategy selection: "@cf/openai/" chat
            // models are batched, everything else token-streams.
            let (strategy, output) = if model_id.starts_with("@cf/openai/") {
                (InvocationStrategy::Batch, OutputFormat::Structured)
            } else {
                (InvocationStrategy::Stream, OutputFormat::TokenStream)
            };
            (
                strategy,
                output,
                vec![
                    num("temperature", 0.0, 5.0),
                    num("top_p", 0.0, 2.0),
                    num("max_tokens", 1.0, 4096.0),
                ],
                obj(json!({ "max_tokens": 2048 })),
            )
        }
        ModelFamily::Image => (
            InvocationStrategy::Batch,
            OutputFormat::Binary,
            vec![
                num("steps", 1.0, 20.0),
                num("guidance", 1.0, 20.0),
                num("width", 256.0, 2048.0),
                num("height", 256.0, 2048.0),
            ],
            obj(json!({ "steps": 20 })),
        ),
        ModelFamily::SpeechToText => (
            InvocationStrategy::Batch,
            OutputFormat::Structured,
            vec![],
            Map::new(),
        ),
        ModelFamily::TextToSpeech => (
            InvocationStrategy::Batch,
            OutputFormat::Binary,
            vec![],
            Map::new(),
        ),
    };
    ModelDescriptor {
        id: model_id.to_string(),
        family,
        strategy,
        output,
        capabilities: vec![],
        ranges,
        defaults,
    }
}

/// `{...defaults, ...overrides}` without range validation; clamping is the
/// payload builder's job.
pub fn merge_defaults(
    model_id: &str,
    overrides: &Map<String, Value>,
) -> Result<Map<String, Value>, PlaygroundError> {
    let descriptor = descriptor(model_id)?;
    let mut merged = descriptor.defaults.clone();
    for (key, value) in overrides {
        merged.insert(key.clone(), value.clone());
    }
    Ok(merged)
}

/// All catalog models carrying a capability tag.
pub fn list_by_capability(tag: CapabilityTag) -> Vec<&'static ModelDescriptor> {
    CATALOG.iter().filter(|d| d.has_capability(tag)).collect()
}

/// All catalog models driven with the given invocation strategy.
pub fn list_by_strategy(strategy: InvocationStrategy) -> Vec<&'static ModelDescriptor> {
    CATALOG.iter().filter(|d| d.strategy == strategy).collect()
}

/// All catalog models in one family, for route introspection endpoints.
pub fn list_by_family(family: ModelFamily) -> Vec<&'static ModelDescriptor> {
    CATALOG.iter().filter(|d| d.family == family).collect()
}

/// Default model id per capability, used when the caller names none.
pub fn default_model(capability: Capability) -> &'static str {
    match capability {
        Capability::Chat => "@cf/meta/llama-3.1-8b-instruct",
        Capability::Image => "@cf/black-forest-labs/flux-1-schnell",
        Capability::SpeechToText => "@cf/openai/whisper-large-v3-turbo",
        Capability::TextToSpeech => "@cf/deepgram/aura-1",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_model_errors() {
        let err = descriptor("@cf/nonexistent/model").unwrap_err();
        assert!(matches!(err, PlaygroundError::UnknownModel(_)));
    }

    #[test]
    fn fallback_descriptor_is_conservative() {
        let d = descriptor_or_fallback("@cf/nonexistent/model", ModelFamily::Image);
        assert!(d.capabilities.is_empty());
        assert!(d.range_for("steps").is_some());
    }

    #[test]
    fn fallback_text_descriptor_follows_the_prefix_rule() {
        let batched = descriptor_or_fallback("@cf/openai/some-future-model", ModelFamily::Text);
        assert_eq!(batched.strategy, InvocationStrategy::Batch);
        assert_eq!(batched.output, OutputFormat::Structured);

        let streaming = descriptor_or_fallback("@cf/meta/some-future-model", ModelFamily::Text);
        assert_eq!(streaming.strategy, InvocationStrategy::Stream);
        assert_eq!(streaming.output, OutputFormat::TokenStream);
    }

    #[test]
    fn merge_defaults_overrides_win() {
        let overrides = obj(json!({ "steps": 2 }));
        let merged = merge_defaults("@cf/black-forest-labs/flux-1-schnell", &overrides).unwrap();
        assert_eq!(merged["steps"], json!(2));
    }

    #[test]
    fn merge_defaults_is_idempotent() {
        let overrides = obj(json!({ "temperature": 0.9 }));
        let a = merge_defaults("@cf/meta/llama-3.1-8b-instruct", &overrides).unwrap();
        let b = merge_defaults("@cf/meta/llama-3.1-8b-instruct", &overrides).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn strategy_listing_splits_catalog() {
        let streaming = list_by_strategy(InvocationStrategy::Stream);
        assert!(streaming.iter().all(|d| d.family == ModelFamily::Text));
        assert!(
            streaming
                .iter()
                .all(|d| !d.id.starts_with("@cf/openai/"))
        );
        let batch_chat: Vec<_> = list_by_strategy(InvocationStrategy::Batch)
            .into_iter()
            .filter(|d| d.family == ModelFamily::Text)
            .collect();
        assert!(batch_chat.iter().all(|d| d.id.starts_with("@cf/openai/")));
    }

    #[test]
    fn capability_listing() {
        let inpainting = list_by_capability(CapabilityTag::Inpainting);
        assert!(!inpainting.is_empty());
        assert!(inpainting.iter().all(|d| d.family == ModelFamily::Image));
    }

    #[test]
    fn numeric_clamp_preserves_integers() {
        let range = ParamRange::Numeric { min: 1.0, max: 8.0 };
        assert_eq!(range.clamp(&json!(999)), Some(json!(8)));
        assert_eq!(range.clamp(&json!(0.5)), Some(json!(1.0)));
        assert_eq!(range.clamp(&json!("nope")), None);
    }
}
