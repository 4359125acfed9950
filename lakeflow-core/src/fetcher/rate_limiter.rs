//! Client-side token bucket rate limiter for upstream API requests.
//!
//! Proactively throttles requests to stay within a connection's hourly budget
//! instead of relying on 429 backpressure. After the initial burst, requests
//! are spread evenly across the hour.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::FetchError;
use crate::types::Connection;

/// Configuration for a connection's request budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Requests per hour (0 = unlimited).
    pub requests_per_hour: u32,
    /// Requests allowed back-to-back before the hourly rate applies.
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_hour: 0,
            burst: 1,
        }
    }
}

/// A token bucket refilled continuously at `requests_per_hour / 3600` per second.
#[derive(Debug)]
pub struct TokenBucketLimiter {
    config: RateLimitConfig,
    tokens: f64,
    last_refill: Instant,
    issued: u64,
}

impl TokenBucketLimiter {
    /// Create a new limiter with a full bucket.
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            tokens: config.burst.max(1) as f64,
            last_refill: Instant::now(),
            issued: 0,
        }
    }

    fn capacity(&self) -> f64 {
        self.config.burst.max(1) as f64
    }

    fn per_second(&self) -> f64 {
        self.config.requests_per_hour as f64 / 3600.0
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.per_second()).min(self.capacity());
        self.last_refill = now;
    }

    /// Check if a request can proceed now.
    ///
    /// Returns `None` if the request can proceed immediately, or `Some(delay)`
    /// indicating how long to wait before checking again.
    pub fn check(&mut self) -> Option<Duration> {
        if !self.has_limits() {
            return None;
        }
        self.refill(Instant::now());
        if self.tokens >= 1.0 {
            None
        } else {
            let missing = 1.0 - self.tokens;
            Some(Duration::from_secs_f64(missing / self.per_second()))
        }
    }

    /// Consume one token for a request that is about to be sent.
    pub fn record(&mut self) {
        self.issued += 1;
        if self.has_limits() {
            self.refill(Instant::now());
            self.tokens -= 1.0;
        }
    }

    /// Adopt a server-advertised hourly budget when it is tighter than the
    /// current one. Returns whether the limit changed.
    pub fn update_limit(&mut self, requests_per_hour: u32) -> bool {
        if requests_per_hour == 0
            || (self.has_limits() && requests_per_hour >= self.config.requests_per_hour)
        {
            return false;
        }
        self.refill(Instant::now());
        self.config.requests_per_hour = requests_per_hour;
        true
    }

    pub fn requests_per_hour(&self) -> u32 {
        self.config.requests_per_hour
    }

    /// Check if any limit is configured.
    pub fn has_limits(&self) -> bool {
        self.config.requests_per_hour > 0
    }

    /// Total requests recorded since creation.
    pub fn issued(&self) -> u64 {
        self.issued
    }
}

/// Async, shareable wrapper around a [`TokenBucketLimiter`].
#[derive(Debug)]
pub struct RateLimiter {
    inner: tokio::sync::Mutex<TokenBucketLimiter>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            inner: tokio::sync::Mutex::new(TokenBucketLimiter::new(config)),
        }
    }

    /// A limiter that never waits.
    pub fn unlimited() -> Self {
        Self::new(RateLimitConfig::default())
    }

    /// Wait until a token is available and consume it.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), FetchError> {
        loop {
            let wait = {
                let mut limiter = self.inner.lock().await;
                match limiter.check() {
                    None => {
                        limiter.record();
                        return Ok(());
                    }
                    Some(wait) => wait,
                }
            };
            tracing::trace!(wait_ms = wait.as_millis() as u64, "Rate limit reached, waiting");
            tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    pub async fn update_limit(&self, requests_per_hour: u32) -> bool {
        self.inner.lock().await.update_limit(requests_per_hour)
    }

    pub async fn requests_per_hour(&self) -> u32 {
        self.inner.lock().await.requests_per_hour()
    }

    pub async fn issued(&self) -> u64 {
        self.inner.lock().await.issued()
    }
}

/// Process-wide limiters, one per connection id.
#[derive(Debug)]
pub struct RateLimiterPool {
    default_per_hour: u32,
    burst: u32,
    limiters: Mutex<HashMap<u64, Arc<RateLimiter>>>,
}

impl RateLimiterPool {
    pub fn new(default_per_hour: u32, burst: u32) -> Self {
        Self {
            default_per_hour,
            burst,
            limiters: Mutex::new(HashMap::new()),
        }
    }

    /// The shared limiter for a connection, created on first use.
    pub fn for_connection(&self, connection: &Connection) -> Arc<RateLimiter> {
        let mut limiters = self.limiters.lock().unwrap_or_else(|e| e.into_inner());
        limiters
            .entry(connection.id)
            .or_insert_with(|| {
                Arc::new(RateLimiter::new(RateLimitConfig {
                    requests_per_hour: connection
                        .rate_limit_per_hour
                        .unwrap_or(self.default_per_hour),
                    burst: self.burst,
                }))
            })
            .clone()
    }
}

/// Parse a `Retry-After` header (seconds or fractional seconds).
///
/// Falls back to a conservative 5 second delay for unparseable values such as
/// HTTP dates. Header names are expected in lowercase.
pub fn parse_retry_after(headers: &HashMap<String, String>) -> Option<Duration> {
    let value = headers
        .get("retry-after")
        .or_else(|| headers.get("x-ratelimit-reset-after"))?;

    if let Ok(secs) = value.trim().parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    if let Some(stripped) = value.trim().strip_suffix('s') {
        if let Ok(secs) = stripped.parse::<f64>() {
            return Some(Duration::from_secs_f64(secs));
        }
    }
    Some(Duration::from_secs(5))
}

/// Parse a server-advertised hourly request limit (`x-ratelimit-limit`).
pub fn parse_rate_limit_header(headers: &HashMap<String, String>) -> Option<u32> {
    headers
        .get("x-ratelimit-limit")
        .and_then(|v| v.trim().parse().ok())
}
