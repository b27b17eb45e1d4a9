//! atelier
//!
//! Request normalization and dispatch layer for a hosted AI playground:
//! picks the invocation protocol per model family, builds validated
//! model-specific payloads from generic requests, normalizes heterogeneous
//! upstream outputs into a few stable contracts, and enforces a hybrid
//! two-tier daily rate limit per client identity and capability class.
#![deny(unsafe_code)]

pub mod config;
pub mod dispatch;
pub mod error;
pub mod inference;
pub mod normalize;
pub mod payload;
pub mod rate_limit;
pub mod registry;
pub mod server;
pub mod streaming;
pub mod types;

pub use error::PlaygroundError;
