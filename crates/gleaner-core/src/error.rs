use thiserror::Error;
use uuid::Uuid;

/// Application-wide error types for Gleaner.
#[derive(Error, Debug)]
pub enum AppError {
    /// The scrape configuration is invalid; the job never starts.
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// A fetch failed in a way that may succeed on another attempt
    /// (timeout, connection reset, 5xx, 429, proxy failure).
    #[error("Transient fetch error for {url}{}: {message}", status_suffix(.status))]
    TransientFetch {
        url: String,
        status: Option<u16>,
        message: String,
    },

    /// A fetch failed in a way retrying will not fix
    /// (malformed URL, DNS failure, non-retryable 4xx).
    #[error("Fatal fetch error for {url}{}: {message}", status_suffix(.status))]
    FatalFetch {
        url: String,
        status: Option<u16>,
        message: String,
    },

    /// A CSS or XPath expression could not be parsed.
    #[error("Invalid selector '{expression}': {message}")]
    InvalidSelector { expression: String, message: String },

    /// Every proxy in the pool is banned.
    #[error("No proxy available: all {proxies} proxies are banned (consider disabling proxy rotation)")]
    NoProxyAvailable { proxies: usize },

    /// The owning job was cancelled.
    #[error("Job cancelled")]
    Cancelled,

    /// No job with this identifier is known.
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    /// A job state transition that would move backwards or re-enter a state.
    #[error("Invalid job transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Process configuration (environment, flags) is invalid.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

impl AppError {
    /// Classify a non-success HTTP status for `url`.
    ///
    /// 408, 429 and 5xx are transient; every other status is fatal.
    pub fn from_status(url: &str, status: u16) -> Self {
        let message = format!("server responded with status {status}");
        if matches!(status, 407 | 408 | 429) || status >= 500 {
            AppError::TransientFetch {
                url: url.to_string(),
                status: Some(status),
                message,
            }
        } else {
            AppError::FatalFetch {
                url: url.to_string(),
                status: Some(status),
                message,
            }
        }
    }

    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::TransientFetch { .. } | AppError::NoProxyAvailable { .. }
        )
    }

    /// Returns true if the request ran out of time rather than being refused.
    pub fn is_timeout(&self) -> bool {
        match self {
            AppError::TransientFetch {
                status, message, ..
            } => matches!(status, Some(408) | Some(504)) || message.contains("timed out"),
            _ => false,
        }
    }

    /// Returns true if the failure should count against the proxy that
    /// carried the request: transport failures, proxy auth, and 429s.
    pub fn implicates_proxy(&self) -> bool {
        match self {
            AppError::TransientFetch { status, .. } => {
                matches!(status, None | Some(407) | Some(429))
            }
            _ => false,
        }
    }

    /// The HTTP status attached to a fetch error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            AppError::TransientFetch { status, .. } | AppError::FatalFetch { status, .. } => {
                *status
            }
            _ => None,
        }
    }

    /// Returns true for fetch errors where no HTTP response was received.
    pub fn is_unreachable(&self) -> bool {
        match self {
            AppError::TransientFetch { status, .. } | AppError::FatalFetch { status, .. } => {
                status.is_none()
            }
            AppError::NoProxyAvailable { .. } => true,
            _ => false,
        }
    }
}
