//! Environment configuration
//!
//! Deployment bindings are read once at startup. A missing inference
//! binding is not a crash: the dispatcher surfaces it per request as
//! `UnconfiguredDependency`. A missing fast-counter pair simply puts the
//! rate limiter in durable-only mode.

use std::env;

/// Fast counter service binding (optional tier).
#[derive(Debug, Clone)]
pub struct FastCounterConfig {
    pub url: String,
    pub token: String,
}

/// Inference capability binding.
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    pub url: String,
    pub token: String,
}

/// Process-wide configuration, read-only after startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub fast_counter: Option<FastCounterConfig>,
    pub inference: Option<InferenceConfig>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let fast_counter = match (env::var("FAST_COUNTER_URL"), env::var("FAST_COUNTER_TOKEN")) {
            (Ok(url), Ok(token)) if !url.is_empty() => Some(FastCounterConfig { url, token }),
            _ => None,
        };
        let inference = match (env::var("INFERENCE_API_URL"), env::var("INFERENCE_API_TOKEN")) {
            (Ok(url), Ok(token)) if !url.is_empty() => Some(InferenceConfig { url, token }),
            _ => None,
        };
        Self {
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8787".to_string()),
            fast_counter,
            inference,
        }
    }
}
