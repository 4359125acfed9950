//! Rate-limited, bounded-concurrency HTTP fetching.
//!
//! Collectors never talk to an [`ApiClient`] directly: every request goes
//! through a [`RateLimitedFetcher`], which holds a worker permit, waits on the
//! connection's shared token bucket, classifies the response status, and
//! retries transient failures with backoff.

pub mod http;
pub mod rate_limiter;
pub mod retry;

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::error::FetchError;

pub use http::{ApiAuth, HttpApiClient};
pub use rate_limiter::{RateLimitConfig, RateLimiter, RateLimiterPool, TokenBucketLimiter};
pub use retry::{RetryConfig, with_retry};

/// Ordered query parameters.
pub type Query = Vec<(String, String)>;

/// Request headers, names lowercased.
pub type Headers = HashMap<String, String>;

/// A buffered HTTP response.
#[derive(Debug, Clone, Default)]
pub struct ApiResponse {
    pub status: u16,
    /// Final request URL including the encoded query.
    pub url: String,
    /// Response headers with lowercased names.
    pub headers: Headers,
    pub body: Bytes,
}

impl ApiResponse {
    /// Build a 200 response with a JSON body.
    pub fn json_ok(url: impl Into<String>, body: &serde_json::Value) -> Self {
        Self {
            status: 200,
            url: url.into(),
            headers: HashMap::new(),
            body: Bytes::from(body.to_string()),
        }
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Minimal HTTP surface a connector needs.
#[async_trait]
pub trait ApiClient: Send + Sync {
    /// Issue a GET for `path` relative to the client's endpoint.
    ///
    /// Returns the response for any HTTP status; only transport failures are errors.
    async fn get(
        &self,
        path: &str,
        query: &[(String, String)],
        headers: &Headers,
    ) -> Result<ApiResponse, FetchError>;
}

/// Turn non-success statuses into typed errors.
pub fn classify_response(response: ApiResponse) -> Result<ApiResponse, FetchError> {
    if response.is_success() {
        return Ok(response);
    }
    if response.status == 429 {
        let retry_after_secs = rate_limiter::parse_retry_after(&response.headers)
            .map(|d| d.as_secs().max(1))
            .unwrap_or(5);
        return Err(FetchError::RateLimited {
            url: response.url,
            retry_after_secs,
        });
    }
    let mut body = response.text();
    body.truncate(512);
    Err(FetchError::Status {
        url: response.url,
        status: response.status,
        body,
    })
}

/// Shared request executor for one connection.
///
/// Cloning is cheap; clones share the worker semaphore, the limiter and the
/// cancellation token.
#[derive(Clone)]
pub struct RateLimitedFetcher {
    client: Arc<dyn ApiClient>,
    limiter: Arc<RateLimiter>,
    workers: Arc<Semaphore>,
    max_workers: usize,
    retry: RetryConfig,
    cancel: CancellationToken,
}

impl std::fmt::Debug for RateLimitedFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitedFetcher")
            .field("max_workers", &self.max_workers)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl RateLimitedFetcher {
    pub fn new(
        client: Arc<dyn ApiClient>,
        limiter: Arc<RateLimiter>,
        max_workers: usize,
        retry: RetryConfig,
        cancel: CancellationToken,
    ) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            client,
            limiter,
            workers: Arc::new(Semaphore::new(max_workers)),
            max_workers,
            retry,
            cancel,
        }
    }

    /// A fetcher with no rate limit, for tests and local sources.
    pub fn unlimited(client: Arc<dyn ApiClient>, max_workers: usize) -> Self {
        Self::new(
            client,
            Arc::new(RateLimiter::unlimited()),
            max_workers,
            RetryConfig {
                max_retries: 0,
                ..RetryConfig::default()
            },
            CancellationToken::new(),
        )
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// A clone whose requests stop when `token` (or this fetcher's token) is cancelled.
    pub fn with_cancellation(&self, token: CancellationToken) -> Self {
        Self {
            cancel: token,
            ..self.clone()
        }
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// GET with worker permit, rate limiting, status classification and retry.
    pub async fn get(
        &self,
        path: &str,
        query: &[(String, String)],
        headers: &Headers,
    ) -> Result<ApiResponse, FetchError> {
        let client = &self.client;
        let limiter = &self.limiter;
        let workers = &self.workers;
        let cancel = &self.cancel;
        with_retry(&self.retry, cancel, || async move {
            let _permit = tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                permit = workers.acquire() => permit.map_err(|_| FetchError::Cancelled)?,
            };
            limiter.acquire(cancel).await?;
            let response = tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                response = client.get(path, query, headers) => response?,
            };
            tracing::debug!(url = %response.url, status = response.status, "Fetched page");
            if let Some(limit) = rate_limiter::parse_rate_limit_header(&response.headers) {
                if limiter.update_limit(limit).await {
                    tracing::info!(requests_per_hour = limit, "Adopted server rate limit");
                }
            }
            classify_response(response)
        })
        .await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted in-memory API client.

    use super::*;
    use std::sync::Mutex;

    type Handler = Box<dyn Fn(&str, &[(String, String)]) -> ApiResponse + Send + Sync>;

    /// Records every request and answers through a handler.
    pub struct MockApiClient {
        handler: Handler,
        pub requests: Mutex<Vec<(String, Query)>>,
    }

    impl MockApiClient {
        pub fn new(
            handler: impl Fn(&str, &[(String, String)]) -> ApiResponse + Send + Sync + 'static,
        ) -> Self {
            Self {
                handler: Box::new(handler),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        pub fn paths(&self) -> Vec<String> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .map(|(p, _)| p.clone())
                .collect()
        }
    }

    #[async_trait]
    impl ApiClient for MockApiClient {
        async fn get(
            &self,
            path: &str,
            query: &[(String, String)],
            _headers: &Headers,
        ) -> Result<ApiResponse, FetchError> {
            self.requests
                .lock()
                .unwrap()
                .push((path.to_string(), query.to_vec()));
            let mut response = (self.handler)(path, query);
            if response.url.is_empty() {
                response.url = format!("mock://{path}");
            }
            Ok(response)
        }
    }

    pub fn query_value<'a>(query: &'a [(String, String)], key: &str) -> Option<&'a str> {
        query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}
