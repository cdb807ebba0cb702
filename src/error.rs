use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable, provider-independent classification of every failure the crate reports.
///
/// Adapters map their native failures into exactly one kind; callers and middleware
/// branch on the kind instead of on provider-specific payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The request is malformed or violates a provider limit.
    InvalidRequest,
    /// Credentials are missing, invalid, or lack permission.
    AuthenticationFailed,
    /// The provider throttled the caller.
    RateLimited,
    /// A network-level or per-call deadline elapsed.
    Timeout,
    /// The caller cancelled the call or its own deadline elapsed.
    Cancelled,
    /// The provider could not be reached or reported an outage.
    ProviderUnavailable,
    /// The provider refused to produce content on policy grounds.
    ContentFiltered,
    /// The bound provider cannot serve the requested capability.
    UnsupportedFeature,
    /// Anything that could not be classified.
    Internal,
}

impl ErrorKind {
    /// Whether middleware may transparently re-issue a call that failed with this kind.
    ///
    /// # Examples
    ///
    /// ```
    /// use llm_switchboard::error::ErrorKind;
    ///
    /// assert!(ErrorKind::RateLimited.is_retryable());
    /// assert!(!ErrorKind::Cancelled.is_retryable());
    /// ```
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::ProviderUnavailable | Self::Timeout
        )
    }

    /// Short snake_case label, suitable for log fields and metric keys.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::AuthenticationFailed => "authentication_failed",
            Self::RateLimited => "rate_limited",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::ProviderUnavailable => "provider_unavailable",
            Self::ContentFiltered => "content_filtered",
            Self::UnsupportedFeature => "unsupported_feature",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw provider failure kept alongside the normalized error for diagnostics.
pub type SourceError = Arc<dyn StdError + Send + Sync + 'static>;

/// The single error type surfaced by providers, middleware, and the client.
///
/// Every value carries one [`ErrorKind`], a human-readable message, the name of the
/// provider that produced it when known, an optional back-off hint, and the raw
/// underlying error wrapped for diagnostics. The type is cheap to clone so it can
/// travel inside terminal stream chunks.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct LLMError {
    kind: ErrorKind,
    message: String,
    provider: Option<String>,
    retry_after: Option<Duration>,
    #[source]
    source: Option<SourceError>,
}

impl LLMError {
    /// Creates an error of the given kind.
    ///
    /// # Examples
    ///
    /// ```
    /// use llm_switchboard::error::{ErrorKind, LLMError};
    ///
    /// let err = LLMError::new(ErrorKind::Internal, "boom");
    /// assert_eq!(err.kind(), ErrorKind::Internal);
    /// assert_eq!(err.to_string(), "internal: boom");
    /// ```
    pub fn new<T: Into<String>>(kind: ErrorKind, message: T) -> Self {
        Self {
            kind,
            message: message.into(),
            provider: None,
            retry_after: None,
            source: None,
        }
    }

    pub fn invalid_request<T: Into<String>>(message: T) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    pub fn authentication<T: Into<String>>(message: T) -> Self {
        Self::new(ErrorKind::AuthenticationFailed, message)
    }

    /// Throttling error with an optional provider-suggested wait.
    pub fn rate_limited<T: Into<String>>(message: T, retry_after: Option<Duration>) -> Self {
        Self {
            retry_after,
            ..Self::new(ErrorKind::RateLimited, message)
        }
    }

    pub fn timeout<T: Into<String>>(message: T) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn cancelled<T: Into<String>>(message: T) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub fn unavailable<T: Into<String>>(message: T) -> Self {
        Self::new(ErrorKind::ProviderUnavailable, message)
    }

    pub fn content_filtered<T: Into<String>>(message: T) -> Self {
        Self::new(ErrorKind::ContentFiltered, message)
    }

    /// Declares that a capability is not offered by the bound provider.
    pub fn unsupported(feature: &str) -> Self {
        Self::new(
            ErrorKind::UnsupportedFeature,
            format!("feature unsupported: {feature}"),
        )
    }

    pub fn internal<T: Into<String>>(message: T) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Tags the error with the provider that produced it.
    pub fn with_provider<T: Into<String>>(mut self, provider: T) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Wraps the raw provider failure so it stays reachable through
    /// [`std::error::Error::source`].
    ///
    /// # Examples
    ///
    /// ```
    /// use std::error::Error;
    /// use llm_switchboard::error::LLMError;
    ///
    /// let raw = std::io::Error::other("socket closed");
    /// let err = LLMError::unavailable("upstream went away").with_source(raw);
    /// assert_eq!(err.source().unwrap().to_string(), "socket closed");
    /// ```
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        self.source = Some(Arc::new(source));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn provider(&self) -> Option<&str> {
        self.provider.as_deref()
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl From<io::Error> for LLMError {
    fn from(err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::TimedOut => ErrorKind::Timeout,
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => ErrorKind::ProviderUnavailable,
            _ => ErrorKind::Internal,
        };
        Self::new(kind, format!("transport error: {err}")).with_source(err)
    }
}

impl From<serde_json::Error> for LLMError {
    fn from(err: serde_json::Error) -> Self {
        Self::internal(format!("failed to decode provider payload: {err}")).with_source(err)
    }
}

/// Maps an HTTP-style status code and provider message into a taxonomy kind.
///
/// Message hints win over the status code for context-window overflows (reported as
/// [`ErrorKind::InvalidRequest`]) and policy refusals ([`ErrorKind::ContentFiltered`]),
/// since vendors report both under assorted 4xx codes.
///
/// # Examples
///
/// ```
/// use llm_switchboard::error::{classify_status, ErrorKind};
///
/// assert_eq!(classify_status(429, "slow down").kind(), ErrorKind::RateLimited);
/// assert_eq!(classify_status(503, "overloaded").kind(), ErrorKind::ProviderUnavailable);
/// assert_eq!(
///     classify_status(400, "prompt is too long").kind(),
///     ErrorKind::InvalidRequest
/// );
/// ```
pub fn classify_status(status: u16, message: &str) -> LLMError {
    if looks_like_content_filter(message) {
        return LLMError::content_filtered(message.to_string());
    }
    if looks_like_token_limit_error(message) {
        return LLMError::invalid_request(message.to_string());
    }

    let kind = match status {
        400 | 404 | 409 | 413 | 415 | 422 => ErrorKind::InvalidRequest,
        401 | 403 => ErrorKind::AuthenticationFailed,
        408 | 504 => ErrorKind::Timeout,
        429 => ErrorKind::RateLimited,
        500..=599 => ErrorKind::ProviderUnavailable,
        _ => ErrorKind::Internal,
    };
    LLMError::new(kind, format!("status {status}: {message}"))
}

/// Extracts the `Retry-After` header (in seconds) if present.
///
/// HTTP-date values are ignored because vendors primarily use the numeric form.
pub fn retry_after_from_headers(headers: &HashMap<String, String>) -> Option<Duration> {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("retry-after"))
        .and_then(|(_, value)| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn looks_like_token_limit_error(message: &str) -> bool {
    const HINTS: [&str; 6] = [
        "context length",
        "context window",
        "token limit",
        "maximum output tokens",
        "max output tokens",
        "prompt is too long",
    ];
    let lower = message.to_ascii_lowercase();
    HINTS.iter().any(|needle| lower.contains(needle))
}

fn looks_like_content_filter(message: &str) -> bool {
    const HINTS: [&str; 4] = [
        "content filter",
        "content_filter",
        "content policy",
        "safety system",
    ];
    let lower = message.to_ascii_lowercase();
    HINTS.iter().any(|needle| lower.contains(needle))
}
