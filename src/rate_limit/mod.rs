//! Hybrid two-tier daily rate limiter
//!
//! Counters are keyed by (capability, client identity, UTC day) and live in
//! external storage: a fast REST counter service when configured, with a
//! durable key-value store as per-call fallback. The check is
//! count-then-allow; the read-then-increment pair is not atomic across
//! requests, so a concurrent burst from one identity can overshoot the
//! maximum by a small amount. That race is accepted; this is advisory abuse
//! mitigation keyed on network identity, not a billing or security boundary.
//!
//! When both tiers are unreachable the limiter fails open with a warning
//! instead of blocking all traffic.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::PlaygroundError;
use crate::types::Capability;

/// Daily maximum for one capability class. Compiled configuration.
pub fn daily_max(capability: Capability) -> u32 {
    match capability {
        Capability::Chat => 20,
        Capability::Image => 5,
        Capability::SpeechToText => 10,
        Capability::TextToSpeech => 10,
    }
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u32,
    #[serde(rename = "resetTime")]
    pub reset_at: DateTime<Utc>,
    /// Set when the limiter failed open because no backend was reachable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// Counter storage contract shared by both tiers. `incr` is a single
/// increment-and-read at the storage layer; `ttl_secs` bounds the record to
/// the current UTC day.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<u32, PlaygroundError>;
    async fn incr(&self, key: &str, ttl_secs: u64) -> Result<u32, PlaygroundError>;
}

/// Fast counter tier: a Redis-compatible REST counter service
/// (`GET {base}/get/{key}`, `POST {base}/incr/{key}`,
/// `POST {base}/expire/{key}/{secs}`), bearer-token authenticated.
///
/// Constructed once per process and shared behind an `Arc`; the connection
/// pool inside the HTTP client is reused across requests.
pub struct FastCounterClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

#[derive(Deserialize)]
struct CounterReply {
    result: serde_json::Value,
}

impl FastCounterClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    async fn command(&self, method: reqwest::Method, path: &str) -> Result<serde_json::Value, PlaygroundError> {
        let url = format!("{}/{}", self.base_url, path);
        let response = self
            .http
            .request(method, &url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(PlaygroundError::HttpError(format!(
                "counter service returned {}",
                response.status()
            )));
        }
        let reply: CounterReply = response.json().await?;
        Ok(reply.result)
    }

    fn parse_count(value: &serde_json::Value) -> u32 {
        match value {
            serde_json::Value::Number(n) => n.as_u64().unwrap_or(0) as u32,
            serde_json::Value::String(s) => s.parse().unwrap_or(0),
            _ => 0,
        }
    }
}

#[async_trait]
impl CounterStore for FastCounterClient {
    async fn get(&self, key: &str) -> Result<u32, PlaygroundError> {
        let result = self.command(reqwest::Method::GET, &format!("get/{key}")).await?;
        Ok(Self::parse_count(&result))
    }

    async fn incr(&self, key: &str, ttl_secs: u64) -> Result<u32, PlaygroundError> {
        let result = self.command(reqwest::Method::POST, &format!("incr/{key}")).await?;
        let count = Self::parse_count(&result);
        // First increment of the day sets the expiry window. Best effort:
        // an expire failure leaves a counter that the day-scoped key
        // orphans anyway.
        if count <= 1 {
            let _ = self
                .command(reqwest::Method::POST, &format!("expire/{key}/{ttl_secs}"))
                .await;
        }
        Ok(count)
    }
}

/// Durable tier stand-in: an in-process TTL-expiring map implementing the
/// same contract. Production deployments bind an external key-value store
/// through the same trait.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, (u32, DateTime<Utc>)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<u32, PlaygroundError> {
        let entries = self.entries.read().await;
        Ok(match entries.get(key) {
            Some((count, expires_at)) if *expires_at > Utc::now() => *count,
            _ => 0,
        })
    }

    async fn incr(&self, key: &str, ttl_secs: u64) -> Result<u32, PlaygroundError> {
        let mut entries = self.entries.write().await;
        let now = Utc::now();
        let entry = entries.entry(key.to_string()).or_insert_with(|| {
            (0, now + chrono::Duration::seconds(ttl_secs as i64))
        });
        if entry.1 <= now {
            *entry = (0, now + chrono::Duration::seconds(ttl_secs as i64));
        }
        entry.0 += 1;
        Ok(entry.0)
    }
}

/// UTC calendar day component of the counter key.
pub(crate) fn day_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d").to_string()
}

/// Start of the next UTC day; counters reset here.
pub(crate) fn next_utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = now.date_naive() + Days::new(1);
    tomorrow.and_time(NaiveTime::MIN).and_utc()
}

fn counter_key(capability: Capability, identity: &str, day: &str) -> String {
    format!("rl:{}:{}:{}", capability.as_str(), identity, day)
}

/// The hybrid limiter. Fast tier preferred per call; durable tier used when
/// the fast tier errors (the failure is never cached); fail-open when both
/// are down.
pub struct RateLimiter {
    fast: Option<Arc<FastCounterClient>>,
    durable: Arc<dyn CounterStore>,
}

impl RateLimiter {
    pub fn new(fast: Option<Arc<FastCounterClient>>, durable: Arc<dyn CounterStore>) -> Self {
        Self { fast, durable }
    }

    /// Count-then-allow check. Increments the counter for the current UTC
    /// day before returning `allowed = true`, biasing races toward
    /// under-counting rather than over-admitting.
    pub async fn check(
        &self,
        identity: &str,
        capability: Capability,
    ) -> Result<RateDecision, PlaygroundError> {
        self.run(identity, capability, true).await
    }

    /// Read-only variant for UI pre-flight display. Never increments.
    pub async fn status(
        &self,
        identity: &str,
        capability: Capability,
    ) -> Result<RateDecision, PlaygroundError> {
        self.run(identity, capability, false).await
    }

    async fn run(
        &self,
        identity: &str,
        capability: Capability,
        consume: bool,
    ) -> Result<RateDecision, PlaygroundError> {
        let now = Utc::now();
        let reset_at = next_utc_midnight(now);
        let key = counter_key(capability, identity, &day_key(now));
        let ttl_secs = (reset_at - now).num_seconds().max(1) as u64;
        let max = daily_max(capability);

        if let Some(fast) = &self.fast {
            match self
                .check_backend(fast.as_ref(), &key, max, ttl_secs, reset_at, consume)
                .await
            {
                Ok(decision) => return Ok(decision),
                Err(err) => {
                    warn!(capability = %capability, error = %err, "fast counter tier failed, falling back to durable store");
                }
            }
        }

        match self
            .check_backend(self.durable.as_ref(), &key, max, ttl_secs, reset_at, consume)
            .await
        {
            Ok(decision) => Ok(decision),
            Err(err) => {
                // Both tiers down: availability over strict quota
                // enforcement. Allow with a warning state.
                warn!(capability = %capability, error = %err, "all rate-limit backends unreachable, failing open");
                Ok(RateDecision {
                    allowed: true,
                    remaining: max,
                    reset_at,
                    warning: Some("rate limiting temporarily unavailable".to_string()),
                })
            }
        }
    }

    async fn check_backend(
        &self,
        store: &dyn CounterStore,
        key: &str,
        max: u32,
        ttl_secs: u64,
        reset_at: DateTime<Utc>,
        consume: bool,
    ) -> Result<RateDecision, PlaygroundError> {
        let count = store.get(key).await?;
        if count >= max {
            return Ok(RateDecision {
                allowed: false,
                remaining: 0,
                reset_at,
                warning: None,
            });
        }
        if !consume {
            return Ok(RateDecision {
                allowed: true,
                remaining: max - count,
                reset_at,
                warning: None,
            });
        }
        let after = store.incr(key, ttl_secs).await?;
        Ok(RateDecision {
            allowed: true,
            remaining: max.saturating_sub(after),
            reset_at,
            warning: None,
        })
    }
}
