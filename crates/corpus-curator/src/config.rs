//! Configuration for the curation pipeline's external services.
//!
//! Per-review thresholds live in [`crate::models::ReviewConfig`]; this module
//! covers endpoints, credentials, rate ceilings and retry behaviour.

use std::time::Duration;

use crate::retry::RetryPolicy;

/// API configuration constants.
pub mod api {
    use std::time::Duration;

    /// Semantic Scholar Graph API endpoint.
    pub const SEMANTIC_SCHOLAR_API: &str = "https://api.semanticscholar.org/graph/v1";

    /// OpenAlex API endpoint.
    pub const OPENALEX_API: &str = "https://api.openalex.org";

    /// OpenAI-compatible chat/embeddings endpoint.
    pub const CHAT_API: &str = "https://api.openai.com/v1";

    /// Unpaywall endpoint for open-access resolution.
    pub const UNPAYWALL_API: &str = "https://api.unpaywall.org/v2";

    /// Model used for screening, quality and narrative calls.
    pub const CHAT_MODEL: &str = "gpt-4o-mini";

    /// Embedding model.
    pub const EMBEDDING_MODEL: &str = "text-embedding-3-small";

    /// Request timeout (classification batches can be slow).
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(90);

    /// Connection timeout.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Semantic Scholar requests per second without API key.
    pub const SEMANTIC_SCHOLAR_RATE: u32 = 1;

    /// Semantic Scholar requests per second with API key.
    pub const SEMANTIC_SCHOLAR_RATE_WITH_KEY: u32 = 10;

    /// OpenAlex polite-pool requests per second.
    pub const OPENALEX_RATE: u32 = 10;

    /// Cache TTL for citation graph lookups (5 minutes).
    pub const CACHE_TTL: Duration = Duration::from_secs(300);

    /// Maximum cache size.
    pub const CACHE_MAX_SIZE: u64 = 1000;

    /// Maximum keepalive connections.
    pub const MAX_KEEPALIVE: usize = 10;

    /// Keepalive expiry.
    pub const KEEPALIVE_EXPIRY: Duration = Duration::from_secs(30);
}

/// Pipeline defaults.
pub mod pipeline {
    /// Target number of included papers.
    pub const TARGET_CORPUS_SIZE: usize = 50;

    /// Maximum snowball rounds.
    pub const MAX_SNOWBALL_ROUNDS: u32 = 3;

    /// Snowball stops when a round's yield drops below this.
    pub const YIELD_FLOOR: f64 = 0.02;

    /// Hard cap on candidates screened in a single snowball round.
    pub const MAX_CANDIDATES_PER_ROUND: usize = 5000;

    /// Default screening strictness (1 = inclusive, 5 = very selective).
    pub const STRICTNESS: u8 = 3;

    /// Papers per classification call.
    pub const BATCH_SIZE: usize = 8;

    /// Largest batch the classification capability accepts.
    pub const MAX_BATCH_SIZE: usize = 10;

    /// Title similarity at which DOI-less records are merged.
    pub const SIMILARITY_THRESHOLD: f64 = 0.90;

    /// Abstract characters sent to the classifier in pass 1.
    pub const PASS1_ABSTRACT_CHARS: usize = 600;

    /// Full-text characters sent to the classifier in pass 2.
    pub const PASS2_TEXT_CHARS: usize = 6000;

    /// Ids per citation graph hydration request.
    pub const HYDRATION_CHUNK: usize = 100;

    /// Abstract characters included in embedding text.
    pub const EMBEDDING_ABSTRACT_CHARS: usize = 400;

    /// Member papers sent when labelling a cluster.
    pub const CLUSTER_SAMPLE: usize = 15;

    /// Abstract characters per paper when labelling a cluster.
    pub const CLUSTER_ABSTRACT_CHARS: usize = 300;

    /// Abstract characters sent for quality scoring.
    pub const QUALITY_ABSTRACT_CHARS: usize = 800;

    /// Below this many embedded papers everything is one cluster.
    pub const MIN_CLUSTER_PAPERS: usize = 4;
}

/// Concurrency ceiling and request rate for one external service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceLimits {
    /// In-flight calls.
    pub max_concurrent: usize,

    /// Calls per second (`None` = unthrottled).
    pub per_second: Option<u32>,
}

impl ServiceLimits {
    /// Create service limits.
    #[must_use]
    pub const fn new(max_concurrent: usize, per_second: Option<u32>) -> Self {
        Self { max_concurrent, per_second }
    }
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Semantic Scholar API key (optional).
    pub semantic_scholar_api_key: Option<String>,

    /// OpenAI-compatible API key.
    pub chat_api_key: Option<String>,

    /// Contact email for the OpenAlex polite pool.
    pub openalex_email: Option<String>,

    /// Contact email required by Unpaywall.
    pub unpaywall_email: Option<String>,

    /// Base URL for Semantic Scholar (for testing with mock servers).
    pub semantic_scholar_url: String,

    /// Base URL for OpenAlex.
    pub openalex_url: String,

    /// Base URL for chat completions / embeddings.
    pub chat_url: String,

    /// Base URL for Unpaywall.
    pub unpaywall_url: String,

    /// Chat model name.
    pub chat_model: String,

    /// Embedding model name.
    pub embedding_model: String,

    /// Request timeout.
    pub request_timeout: Duration,

    /// Connection timeout.
    pub connect_timeout: Duration,

    /// Limits for search sources and citation lookups.
    pub search_limits: ServiceLimits,

    /// Limits for classification, quality and narrative calls.
    pub classifier_limits: ServiceLimits,

    /// Limits for full-text resolution.
    pub full_text_limits: ServiceLimits,

    /// Item-level retry policy for transient failures.
    pub retry: RetryPolicy,

    /// Transport-level retries inside the HTTP middleware.
    pub http_retries: u32,

    /// Cache TTL.
    pub cache_ttl: Duration,

    /// Maximum cache size.
    pub cache_max_size: u64,
}

impl Config {
    /// Create a new configuration.
    ///
    /// The search rate ceiling follows the Semantic Scholar tier:
    /// - Without key: 1 req/s
    /// - With key: 10 req/s
    #[must_use]
    pub fn new(semantic_scholar_api_key: Option<String>, chat_api_key: Option<String>) -> Self {
        let search_rate = if semantic_scholar_api_key.is_some() {
            api::SEMANTIC_SCHOLAR_RATE_WITH_KEY
        } else {
            api::SEMANTIC_SCHOLAR_RATE
        };
        Self {
            semantic_scholar_api_key,
            chat_api_key,
            openalex_email: None,
            unpaywall_email: None,
            semantic_scholar_url: api::SEMANTIC_SCHOLAR_API.to_string(),
            openalex_url: api::OPENALEX_API.to_string(),
            chat_url: api::CHAT_API.to_string(),
            unpaywall_url: api::UNPAYWALL_API.to_string(),
            chat_model: api::CHAT_MODEL.to_string(),
            embedding_model: api::EMBEDDING_MODEL.to_string(),
            request_timeout: api::REQUEST_TIMEOUT,
            connect_timeout: api::CONNECT_TIMEOUT,
            search_limits: ServiceLimits::new(4, Some(search_rate)),
            classifier_limits: ServiceLimits::new(12, None),
            full_text_limits: ServiceLimits::new(6, Some(api::OPENALEX_RATE)),
            retry: RetryPolicy::default(),
            http_retries: 3,
            cache_ttl: api::CACHE_TTL,
            cache_max_size: api::CACHE_MAX_SIZE,
        }
    }

    /// Create a test configuration with custom URLs for mock servers.
    #[must_use]
    pub fn for_testing(base_url: &str) -> Self {
        Self {
            semantic_scholar_api_key: None,
            chat_api_key: Some("test-key".to_string()),
            openalex_email: Some("test@example.org".to_string()),
            unpaywall_email: Some("test@example.org".to_string()),
            semantic_scholar_url: format!("{base_url}/graph/v1"),
            openalex_url: format!("{base_url}/openalex"),
            chat_url: format!("{base_url}/v1"),
            unpaywall_url: format!("{base_url}/unpaywall"),
            chat_model: "test-model".to_string(),
            embedding_model: "test-embedding".to_string(),
            request_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(2),
            search_limits: ServiceLimits::new(4, None), // No rate ceiling in tests
            classifier_limits: ServiceLimits::new(4, None),
            full_text_limits: ServiceLimits::new(4, None),
            retry: RetryPolicy::immediate(2),
            http_retries: 0,
            cache_ttl: Duration::from_secs(0), // No caching in tests
            cache_max_size: 0,
        }
    }

    /// Create configuration from environment variables (and `.env` if present).
    ///
    /// # Errors
    ///
    /// Returns error if environment variables are invalid.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let mut config = Self::new(
            std::env::var("SEMANTIC_SCHOLAR_API_KEY").ok(),
            std::env::var("OPENAI_API_KEY").ok(),
        );
        config.openalex_email = std::env::var("OPENALEX_EMAIL").ok();
        config.unpaywall_email =
            std::env::var("UNPAYWALL_EMAIL").ok().or_else(|| config.openalex_email.clone());

        if let Ok(url) = std::env::var("OPENAI_BASE_URL") {
            url::Url::parse(&url)?;
            config.chat_url = url.trim_end_matches('/').to_string();
        }
        if let Ok(model) = std::env::var("CURATOR_CHAT_MODEL") {
            config.chat_model = model;
        }
        if let Ok(model) = std::env::var("CURATOR_EMBEDDING_MODEL") {
            config.embedding_model = model;
        }
        Ok(config)
    }

    /// Check if a Semantic Scholar API key is configured.
    #[must_use]
    pub const fn has_semantic_scholar_key(&self) -> bool {
        self.semantic_scholar_api_key.is_some()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(None, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert!(config.semantic_scholar_api_key.is_none());
        assert!(!config.has_semantic_scholar_key());
        assert_eq!(config.search_limits.per_second, Some(api::SEMANTIC_SCHOLAR_RATE));
    }

    #[test]
    fn test_config_with_api_key() {
        let config = Config::new(Some("test-key".to_string()), None);
        assert!(config.has_semantic_scholar_key());
        assert_eq!(config.search_limits.per_second, Some(api::SEMANTIC_SCHOLAR_RATE_WITH_KEY));
    }

    #[test]
    fn test_for_testing_urls() {
        let config = Config::for_testing("http://localhost:1234");
        assert_eq!(config.semantic_scholar_url, "http://localhost:1234/graph/v1");
        assert_eq!(config.chat_url, "http://localhost:1234/v1");
        assert_eq!(config.cache_max_size, 0);
    }

    #[test]
    fn test_limits_are_distinct_per_service() {
        let config = Config::default();
        assert_ne!(config.search_limits, config.classifier_limits);
        assert_ne!(config.classifier_limits, config.full_text_limits);
    }
}
