//! HTTP implementations of the consumed capabilities.
//!
//! Every client shares [`HttpClient`]:
//! - Connection pooling via reqwest
//! - Transport retry middleware with exponential backoff
//! - Response caching for idempotent GETs
//!
//! Concurrency and request-rate ceilings are applied by the pipeline's
//! [`crate::throttle::Throttle`], not here.

mod chat;
mod openalex;
mod semantic_scholar;
mod unpaywall;

use std::time::Duration;

use moka::future::Cache;
use reqwest::Client;
use reqwest::header::HeaderMap;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};
use serde_json::Value;

pub use chat::ChatClient;
pub use openalex::{OpenAlexClient, reconstruct_abstract, sanitize_query};
pub use semantic_scholar::SemanticScholarClient;
pub use unpaywall::{UnpaywallResolver, strip_markup};

use crate::config::{Config, api};
use crate::error::{ClientError, ClientResult, ServiceError};

/// Pooled HTTP client with retry middleware and a response cache.
#[derive(Clone)]
pub struct HttpClient {
    /// HTTP client with middleware.
    client: ClientWithMiddleware,

    /// Response cache.
    cache: Cache<String, Value>,

    /// Per-request timeout, reported in [`ClientError::Timeout`].
    timeout: Duration,
}

impl HttpClient {
    /// Create a client sending `headers` on every request.
    ///
    /// # Errors
    ///
    /// Returns error if HTTP client initialization fails.
    pub fn new(config: &Config, mut headers: HeaderMap) -> anyhow::Result<Self> {
        headers.insert(reqwest::header::USER_AGENT, "corpus-curator/0.1".parse()?);

        let client = Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(api::MAX_KEEPALIVE)
            .pool_idle_timeout(api::KEEPALIVE_EXPIRY)
            .gzip(true)
            .build()?;

        let retry_policy = ExponentialBackoff::builder()
            .retry_bounds(Duration::from_secs(1), Duration::from_secs(30))
            .build_with_max_retries(config.http_retries);

        let client = ClientBuilder::new(client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        let cache = Cache::builder()
            .max_capacity(config.cache_max_size)
            .time_to_live(config.cache_ttl)
            .build();

        Ok(Self { client, cache, timeout: config.request_timeout })
    }

    /// GET returning JSON, served from the cache when possible.
    pub async fn get_json(&self, url: &str, params: &[(String, String)]) -> ClientResult<Value> {
        let cache_key = cache_key("GET", url, params);
        if let Some(cached) = self.cache.get(&cache_key).await {
            return Ok(cached);
        }

        let response = self
            .client
            .get(url)
            .query(params)
            .send()
            .await
            .map_err(|e| ClientError::transport(e, self.timeout))?;
        let response = handle_response(response).await?;
        let value: Value =
            response.json().await.map_err(|e| ClientError::transport(e, self.timeout))?;

        self.cache.insert(cache_key, value.clone()).await;
        Ok(value)
    }

    /// POST a JSON body, returning JSON. Never cached.
    pub async fn post_json(
        &self,
        url: &str,
        params: &[(String, String)],
        body: &Value,
    ) -> ClientResult<Value> {
        let body_str = serde_json::to_string(body)?;

        let response = self
            .client
            .post(url)
            .query(params)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body_str)
            .send()
            .await
            .map_err(|e| ClientError::transport(e, self.timeout))?;

        let response = handle_response(response).await?;
        response.json().await.map_err(|e| ClientError::transport(e, self.timeout))
    }

    /// GET a document, returning its content type and body text.
    pub async fn get_text(&self, url: &str) -> ClientResult<(Option<String>, String)> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ClientError::transport(e, self.timeout))?;
        let response = handle_response(response).await?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_ascii_lowercase);
        let body = response.text().await.map_err(|e| ClientError::transport(e, self.timeout))?;
        Ok((content_type, body))
    }
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient").field("cached", &self.cache.entry_count()).finish()
    }
}

/// Map API status codes to [`ClientError`].
async fn handle_response(response: reqwest::Response) -> ClientResult<reqwest::Response> {
    let status = response.status();

    if status.is_success() {
        return Ok(response);
    }

    match status.as_u16() {
        429 => {
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(60);

            Err(ClientError::rate_limited(retry_after))
        }
        404 => {
            let text = response.text().await.unwrap_or_default();
            Err(ClientError::not_found(text))
        }
        400 => {
            let text = response.text().await.unwrap_or_default();
            Err(ClientError::bad_request(text))
        }
        500..=599 => {
            let text = response.text().await.unwrap_or_default();
            Err(ClientError::server(status.as_u16(), text))
        }
        _ => {
            let text = response.text().await.unwrap_or_default();
            Err(ClientError::UnexpectedStatus { status: status.as_u16(), message: text })
        }
    }
}

/// Generate cache key.
fn cache_key(method: &str, url: &str, params: &[(String, String)]) -> String {
    use md5::{Digest, Md5};

    let mut hasher = Md5::new();
    hasher.update(method.as_bytes());
    hasher.update(b"|");
    hasher.update(url.as_bytes());
    hasher.update(b"|");

    for (k, v) in params {
        hasher.update(k.as_bytes());
        hasher.update(b"=");
        hasher.update(v.as_bytes());
        hasher.update(b"&");
    }

    format!("{:x}", hasher.finalize())
}

/// Shorthand for `(key, value)` query pairs.
fn param(key: &str, value: impl ToString) -> (String, String) {
    (key.to_string(), value.to_string())
}

/// Convert a client error, marking an unreachable search source as unavailable.
fn source_error(source: &'static str, err: ClientError) -> ServiceError {
    match ServiceError::from_client(source, err) {
        ServiceError::Permanent { message, .. } => ServiceError::unavailable(source, message),
        other => other,
    }
}
