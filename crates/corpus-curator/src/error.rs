//! Error types for the curation pipeline.
//!
//! Uses `thiserror` for structured error handling with automatic `From` implementations.
//! Three layers: [`ClientError`] for HTTP transport, [`ServiceError`] for the
//! consumed capabilities (search, classification, full text, ...) and
//! [`PipelineError`] / [`StateError`] for the orchestrator.

use std::time::Duration;

use crate::orchestrator::{Event, Stage};

/// Errors from the HTTP client layer.
#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    /// HTTP transport error (connection, DNS, TLS, etc.)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Middleware error
    #[error("Middleware error: {0}")]
    Middleware(#[from] reqwest_middleware::Error),

    /// Rate limited by the remote API (429 response)
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited {
        /// Suggested wait time before retry
        retry_after: Duration,
    },

    /// Resource not found (404 response)
    #[error("Resource not found: {resource}")]
    NotFound {
        /// Description of the missing resource
        resource: String,
    },

    /// Invalid request parameters (400 response)
    #[error("Bad request: {message}")]
    BadRequest {
        /// Error message from API
        message: String,
    },

    /// Request timeout
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// JSON parsing error
    #[error("Failed to parse response: {0}")]
    Parse(#[from] serde_json::Error),

    /// Server error (5xx response)
    #[error("Server error ({status}): {message}")]
    Server {
        /// HTTP status code
        status: u16,
        /// Error message
        message: String,
    },

    /// Unexpected HTTP status
    #[error("Unexpected status {status}: {message}")]
    UnexpectedStatus {
        /// HTTP status code
        status: u16,
        /// Response body or message
        message: String,
    },
}

impl ClientError {
    /// Create a rate limited error with retry-after duration.
    #[must_use]
    pub fn rate_limited(seconds: u64) -> Self {
        Self::RateLimited { retry_after: Duration::from_secs(seconds) }
    }

    /// Create a not found error.
    #[must_use]
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound { resource: resource.into() }
    }

    /// Create a bad request error.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest { message: message.into() }
    }

    /// Create a server error.
    #[must_use]
    pub fn server(status: u16, message: impl Into<String>) -> Self {
        Self::Server { status, message: message.into() }
    }

    /// Wrap a transport failure, naming the configured timeout when it fired.
    #[must_use]
    pub fn transport(err: impl Into<Self>, timeout: Duration) -> Self {
        let err = err.into();
        if err.reqwest_source().is_some_and(reqwest::Error::is_timeout) {
            Self::Timeout(timeout)
        } else {
            err
        }
    }

    /// The underlying reqwest error, whether raised directly or by the middleware stack.
    fn reqwest_source(&self) -> Option<&reqwest::Error> {
        match self {
            Self::Http(e) | Self::Middleware(reqwest_middleware::Error::Reqwest(e)) => Some(e),
            _ => None,
        }
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Timeout(_) | Self::Server { .. } => true,
            _ => self.reqwest_source().is_some_and(|e| e.is_timeout() || e.is_connect()),
        }
    }

    /// Returns true if the server answered but the body could not be decoded.
    #[must_use]
    pub fn is_malformed(&self) -> bool {
        match self {
            Self::Parse(_) => true,
            _ => self.reqwest_source().is_some_and(reqwest::Error::is_decode),
        }
    }

    /// Get the retry-after duration if this is a rate limit error.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

/// Failures of an external capability.
///
/// `Transient` is retried with backoff, `MalformedResponse` triggers a solo
/// reclassification, `SourceUnavailable` degrades the search stage.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// Rate limit, timeout or 5xx from a remote service.
    #[error("{service}: transient failure: {message}")]
    Transient {
        /// Service that failed.
        service: String,
        /// Failure detail.
        message: String,
        /// Server-suggested delay before retrying.
        retry_after: Option<Duration>,
    },

    /// The service answered, but the structured payload failed validation.
    #[error("{service}: malformed response: {message}")]
    MalformedResponse {
        /// Service that answered.
        service: String,
        /// What failed validation.
        message: String,
    },

    /// An entire source is down.
    #[error("source unavailable: {source_name}: {message}")]
    SourceUnavailable {
        /// Source name.
        source_name: String,
        /// Failure detail.
        message: String,
    },

    /// Non-retryable failure (bad request, missing credentials, ...).
    #[error("{service}: {message}")]
    Permanent {
        /// Service that failed.
        service: String,
        /// Failure detail.
        message: String,
    },
}

impl ServiceError {
    /// Create a transient error.
    #[must_use]
    pub fn transient(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient { service: service.into(), message: message.into(), retry_after: None }
    }

    /// Create a malformed response error.
    #[must_use]
    pub fn malformed(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MalformedResponse { service: service.into(), message: message.into() }
    }

    /// Create a source unavailable error.
    #[must_use]
    pub fn unavailable(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SourceUnavailable { source_name: source_name.into(), message: message.into() }
    }

    /// Create a permanent error.
    #[must_use]
    pub fn permanent(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Permanent { service: service.into(), message: message.into() }
    }

    /// Classify a client error raised while talking to `service`.
    #[must_use]
    pub fn from_client(service: impl Into<String>, err: ClientError) -> Self {
        let service = service.into();
        match err {
            e if e.is_malformed() => Self::malformed(service, e.to_string()),
            e if e.is_retryable() => Self::Transient {
                service,
                retry_after: e.retry_after(),
                message: e.to_string(),
            },
            e => Self::permanent(service, e.to_string()),
        }
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Server-suggested delay, if any.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Transient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Invalid stage transition or an operation requested in the wrong stage.
///
/// Fatal to the requested operation only; the pipeline state is unchanged.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    /// No transition exists for this event from the current stage.
    #[error("invalid transition: {event:?} from {from}")]
    InvalidTransition {
        /// Current stage.
        from: Stage,
        /// Rejected event.
        event: Event,
    },

    /// The transition exists but its guard condition does not hold.
    #[error("guard failed for {event:?} in {stage}: {reason}")]
    GuardFailed {
        /// Current stage.
        stage: Stage,
        /// Rejected event.
        event: Event,
        /// Why the guard rejected the event.
        reason: String,
    },

    /// A stage operation was invoked outside its stage.
    #[error("operation requires stage {expected}, pipeline is in {actual}")]
    WrongStage {
        /// Stage the operation belongs to.
        expected: Stage,
        /// Current stage.
        actual: Stage,
    },
}

/// Top-level pipeline errors.
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    /// Stage machine rejected the operation.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// An external capability failed and the stage cannot proceed.
    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    /// Input validation failed
    #[error("Validation error: {message}")]
    Validation {
        /// Field that failed validation
        field: String,
        /// Validation error message
        message: String,
    },

    /// Paper id not present in the corpus.
    #[error("Unknown paper: {0}")]
    UnknownPaper(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipelineError {
    /// Create a validation error.
    #[must_use]
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation { field: field.into(), message: message.into() }
    }

    /// Convert to a user-friendly error message for CLI output.
    #[must_use]
    pub fn to_user_message(&self) -> String {
        match self {
            Self::Service(ServiceError::Transient { service, retry_after: Some(wait), .. }) => {
                format!("{service} is rate limiting requests. Please wait {wait:?} before retrying.")
            }
            Self::Validation { field, message } => {
                format!("Invalid input for '{field}': {message}")
            }
            Self::State(StateError::WrongStage { expected, actual }) => {
                format!("The review is in {actual}; this step belongs to {expected}.")
            }
            _ => self.to_string(),
        }
    }
}

/// Result type alias for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Result type alias for service calls.
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Result type alias for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_error_retryable() {
        assert!(ClientError::rate_limited(60).is_retryable());
        assert!(ClientError::Timeout(Duration::from_secs(30)).is_retryable());
        assert!(ClientError::server(500, "Internal error").is_retryable());

        assert!(!ClientError::not_found("paper123").is_retryable());
        assert!(!ClientError::bad_request("invalid query").is_retryable());
    }

    #[test]
    fn test_client_error_retry_after() {
        let err = ClientError::rate_limited(60);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(60)));

        let err = ClientError::not_found("paper");
        assert_eq!(err.retry_after(), None);
    }

    #[test]
    fn test_service_error_classification() {
        let err = ServiceError::from_client("openalex", ClientError::rate_limited(5));
        assert!(err.is_transient());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(5)));

        let err = ServiceError::from_client("openalex", ClientError::bad_request("nope"));
        assert!(matches!(err, ServiceError::Permanent { .. }));

        let parse = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = ServiceError::from_client("classifier", ClientError::Parse(parse));
        assert!(matches!(err, ServiceError::MalformedResponse { .. }));
    }

    #[test]
    fn test_pipeline_error_user_message() {
        let err = PipelineError::validation("researchQuestion", "cannot be empty");
        assert!(err.to_user_message().contains("researchQuestion"));
        assert!(err.to_user_message().contains("cannot be empty"));

        let err = PipelineError::from(StateError::WrongStage {
            expected: Stage::Searching,
            actual: Stage::Idle,
        });
        assert!(err.to_user_message().contains("SEARCHING"));
    }
}
