//! Playground server binary.

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use atelier::config::AppConfig;
use atelier::dispatch::Dispatcher;
use atelier::inference::{HttpInference, InferenceBackend};
use atelier::rate_limit::{FastCounterClient, MemoryStore, RateLimiter};
use atelier::server::{AppState, router};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env();

    let fast = config.fast_counter.as_ref().map(|fc| {
        info!(url = %fc.url, "fast counter tier configured");
        Arc::new(FastCounterClient::new(&fc.url, &fc.token))
    });
    if fast.is_none() {
        info!("no fast counter tier configured, rate limiting runs on the durable store only");
    }
    let limiter = RateLimiter::new(fast, Arc::new(MemoryStore::new()));

    let backend: Option<Arc<dyn InferenceBackend>> = match config.inference.as_ref() {
        Some(inference) => {
            info!(url = %inference.url, "inference capability configured");
            Some(Arc::new(HttpInference::new(&inference.url, &inference.token)))
        }
        None => {
            warn!("inference capability binding missing, requests will be rejected");
            None
        }
    };

    let state = AppState {
        dispatcher: Arc::new(Dispatcher::new(limiter, backend)),
    };

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, "playground server listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
