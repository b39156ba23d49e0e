//! HTTP JSON fetch seam: reqwest-backed client with retry/backoff plus a
//! memoizing decorator keyed by exact request arguments.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

pub const CRATE_NAME: &str = "regfinn-client";

pub use reqwest::StatusCode;

/// One HTTP response seen through the JSON seam. Non-2xx responses are
/// returned as values, not errors; callers decide whether that is fatal.
#[derive(Debug, Clone)]
pub struct JsonResponse {
    pub status: StatusCode,
    pub content_type: String,
    /// Parsed body, present only when the response declared JSON and the
    /// payload actually parsed.
    pub body: Option<JsonValue>,
}

impl JsonResponse {
    pub fn is_json_success(&self) -> bool {
        self.status.is_success() && self.content_type.starts_with("application/json")
    }
}

/// Transport-level failure: the request never produced an HTTP response.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
}

/// Injected fetch capability: `get(url, params) -> response | transport error`.
#[async_trait]
pub trait JsonFetch: Send + Sync {
    async fn get_json(
        &self,
        url: &str,
        params: &[(String, String)],
    ) -> Result<JsonResponse, FetchError>;
}

fn retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Sequential reqwest-backed implementation of [`JsonFetch`]. One request in
/// flight at a time; retryable statuses and transport errors are retried
/// with capped exponential backoff before the last outcome is surfaced.
#[derive(Debug)]
pub struct HttpClient {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    async fn into_json_response(resp: reqwest::Response) -> Result<JsonResponse, FetchError> {
        let status = resp.status();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let bytes = resp.bytes().await?;
        let body = if content_type.starts_with("application/json") {
            match serde_json::from_slice(&bytes) {
                Ok(value) => Some(value),
                Err(err) => {
                    debug!(%status, %err, "response declared JSON but did not parse");
                    None
                }
            }
        } else {
            None
        };
        Ok(JsonResponse {
            status,
            content_type,
            body,
        })
    }
}

#[async_trait]
impl JsonFetch for HttpClient {
    async fn get_json(
        &self,
        url: &str,
        params: &[(String, String)],
    ) -> Result<JsonResponse, FetchError> {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let result = self.client.get(url).query(params).send().await;
            match result {
                Ok(resp) => {
                    let status = resp.status();
                    if retryable_status(status) && attempt < self.backoff.max_retries {
                        debug!(%status, url, attempt, "retrying after retryable status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Self::into_json_response(resp).await;
                }
                Err(err) => {
                    if retryable_error(&err) && attempt < self.backoff.max_retries {
                        debug!(%err, url, attempt, "retrying after transport error");
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop captures a request error"),
        ))
    }
}

/// Memoizing decorator over any [`JsonFetch`]: identical (url, params)
/// requests within a process lifetime are served from cache. Only responses
/// (including non-2xx ones) are cached; transport errors are not.
pub struct MemoFetch<F> {
    inner: F,
    cache: Mutex<HashMap<String, JsonResponse>>,
}

impl<F> MemoFetch<F> {
    pub fn new(inner: F) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn cache_key(url: &str, params: &[(String, String)]) -> String {
        let mut key = String::from(url);
        for (name, value) in params {
            key.push('\u{1f}');
            key.push_str(name);
            key.push('=');
            key.push_str(value);
        }
        key
    }
}

#[async_trait]
impl<F: JsonFetch> JsonFetch for MemoFetch<F> {
    async fn get_json(
        &self,
        url: &str,
        params: &[(String, String)],
    ) -> Result<JsonResponse, FetchError> {
        let key = Self::cache_key(url, params);
        {
            let cache = self.cache.lock().await;
            if let Some(hit) = cache.get(&key) {
                return Ok(hit.clone());
            }
        }
        let response = self.inner.get_json(url, params).await?;
        self.cache.lock().await.insert(key, response.clone());
        Ok(response)
    }
}
