//! Error Handling Module
//!
//! Defines the stable error taxonomy for the playground dispatch layer
//! (`PlaygroundError`), coarse-grained categories for presentation, and the
//! HTTP status mapping used by the server surface.
//!
//! Validation errors are produced before any external call is made; upstream
//! failures are pattern-matched into `UpstreamTimeout` / `UpstreamRejected`
//! at the single dispatch call site per route.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::Capability;

/// Error type covering every failure the dispatch layer can surface.
#[derive(Debug, Error)]
pub enum PlaygroundError {
    /// Malformed or out-of-contract caller input. The message names the
    /// offending field.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The model id is absent from the compiled catalog. Callers are
    /// expected to fall back to a minimal descriptor rather than surface
    /// this directly.
    #[error("Unknown model: {0}")]
    UnknownModel(String),

    /// Daily quota exhausted for one capability class.
    #[error("Rate limit exceeded for {capability}")]
    RateLimited {
        capability: Capability,
        remaining: u32,
        reset_at: DateTime<Utc>,
    },

    /// A required deployment binding (inference capability, storage) is
    /// missing. Surfaced per request with a generic message; detail stays in
    /// the server log.
    #[error("Dependency not configured: {0}")]
    UnconfiguredDependency(String),

    /// Upstream inference call exceeded its time budget.
    #[error("Upstream timeout: {0}")]
    UpstreamTimeout(String),

    /// Upstream rejected the invocation payload.
    #[error("Upstream rejected request: {0}")]
    UpstreamRejected(String),

    /// The raw upstream output matched none of the recognized shapes for
    /// the model family.
    #[error("Malformed upstream response: {0}")]
    MalformedResponse(String),

    /// Transport-level failure talking to an external service.
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// JSON serialization/deserialization failure.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Anything else; kept generic on purpose.
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Coarse error category for logging and presentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    RateLimit,
    Configuration,
    Upstream,
    Parsing,
    Network,
    Internal,
}

impl PlaygroundError {
    /// Convenience constructor for validation failures.
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Convenience constructor for internal failures.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::InternalError(msg.into())
    }

    /// Coarse category for this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidInput(_) | Self::UnknownModel(_) => ErrorCategory::Validation,
            Self::RateLimited { .. } => ErrorCategory::RateLimit,
            Self::UnconfiguredDependency(_) => ErrorCategory::Configuration,
            Self::UpstreamTimeout(_) | Self::UpstreamRejected(_) => ErrorCategory::Upstream,
            Self::MalformedResponse(_) | Self::JsonError(_) => ErrorCategory::Parsing,
            Self::HttpError(_) => ErrorCategory::Network,
            Self::InternalError(_) => ErrorCategory::Internal,
        }
    }

    /// HTTP status this error surfaces as.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidInput(_) | Self::UpstreamRejected(_) => 400,
            Self::RateLimited { .. } => 429,
            Self::UpstreamTimeout(_) => 504,
            Self::UnknownModel(_)
            | Self::UnconfiguredDependency(_)
            | Self::MalformedResponse(_)
            | Self::HttpError(_)
            | Self::JsonError(_)
            | Self::InternalError(_) => 500,
        }
    }

    /// Message safe to return to the caller. Upstream internals and
    /// configuration detail are replaced with generic text; validation and
    /// rate-limit messages pass through.
    pub fn user_message(&self) -> String {
        match self {
            Self::InvalidInput(msg) => msg.clone(),
            Self::RateLimited { capability, .. } => {
                format!("Daily {capability} limit reached. Try again tomorrow.")
            }
            Self::UpstreamTimeout(_) => {
                "The model took too long to respond. Try a smaller request or fewer steps."
                    .to_string()
            }
            Self::UpstreamRejected(_) => "The model rejected the request parameters.".to_string(),
            Self::UnknownModel(model) => format!("Unknown model: {model}"),
            _ => "Something went wrong processing the request.".to_string(),
        }
    }
}

impl From<reqwest::Error> for PlaygroundError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::UpstreamTimeout(err.to_string())
        } else {
            Self::HttpError(err.to_string())
        }
    }
}

/// Classify raw upstream error text into the stable taxonomy.
///
/// The inference capability reports failures as loosely formatted strings;
/// timeout-flavored and rejection-flavored messages get dedicated kinds so
/// the caller sees a stable status instead of leaked upstream internals.
pub fn classify_upstream_error(message: &str) -> PlaygroundError {
    let lowered = message.to_lowercase();
    if lowered.contains("timeout") || lowered.contains("timed out") {
        PlaygroundError::UpstreamTimeout(message.to_string())
    } else if lowered.contains("invalid") || lowered.contains("model_error") {
        PlaygroundError::UpstreamRejected(message.to_string())
    } else {
        PlaygroundError::InternalError(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(PlaygroundError::invalid_input("bad prompt").status_code(), 400);
        assert_eq!(
            PlaygroundError::RateLimited {
                capability: Capability::Chat,
                remaining: 0,
                reset_at: Utc::now(),
            }
            .status_code(),
            429
        );
        assert_eq!(PlaygroundError::UpstreamTimeout("slow".into()).status_code(), 504);
        assert_eq!(PlaygroundError::UpstreamRejected("invalid".into()).status_code(), 400);
        assert_eq!(PlaygroundError::MalformedResponse("?".into()).status_code(), 500);
    }

    #[test]
    fn upstream_classification() {
        assert!(matches!(
            classify_upstream_error("request timed out after 30s"),
            PlaygroundError::UpstreamTimeout(_)
        ));
        assert!(matches!(
            classify_upstream_error("model_error: invalid steps"),
            PlaygroundError::UpstreamRejected(_)
        ));
        assert!(matches!(
            classify_upstream_error("connection reset"),
            PlaygroundError::InternalError(_)
        ));
    }

    #[test]
    fn upstream_internals_not_leaked() {
        let err = PlaygroundError::UpstreamRejected("internal tensor shape mismatch".into());
        assert!(!err.user_message().contains("tensor"));
    }
}
