use std::time::Duration;

/// Failure of a query or mutation.
///
/// Errors are `Clone` so a single failed request can be handed to every
/// deduplicated awaiter and kept in the cache entry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    /// The request was aborted through its [`AbortSignal`](crate::AbortSignal).
    #[error("request was cancelled")]
    Cancelled,
    /// The request did not settle within the allotted time.
    #[error("request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    /// The server answered with a non-success status.
    #[error("HTTP {status}: {message}")]
    Http {
        /// Status code.
        status: u16,
        /// Server provided message or reason phrase.
        message: String,
    },
    /// Transport level failure (DNS, connection, TLS, offline, ...).
    #[error("network error: {0}")]
    Network(String),
    /// The response body could not be decoded.
    #[error("failed to parse response: {0}")]
    Parse(String),
    /// Any other failure raised by a fetcher.
    #[error("{0}")]
    Other(String),
}

const NETWORK_PATTERNS: &[&str] = &[
    "network",
    "failed to fetch",
    "fetch failed",
    "load failed",
    "timeout",
    "timed out",
    "connection",
    "econnrefused",
    "econnreset",
    "econnaborted",
    "enotfound",
    "eai_again",
    "dns",
    "unreachable",
    "offline",
    "tls",
    "ssl",
    "certificate",
    "socket",
];

impl QueryError {
    /// Classifies a transport failure message.
    ///
    /// Transports rarely provide structured codes, so the message text decides
    /// whether the failure is network-class. Never yields [`QueryError::Cancelled`]:
    /// only an [`AbortSignal`](crate::AbortSignal) decides that.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lowered = message.to_lowercase();
        if NETWORK_PATTERNS.iter().any(|p| lowered.contains(p)) {
            QueryError::Network(message)
        } else {
            QueryError::Other(message)
        }
    }

    /// Returns true for aborted requests.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, QueryError::Cancelled)
    }

    /// Returns true for authentication or authorization failures.
    pub fn is_auth(&self) -> bool {
        matches!(self, QueryError::Http { status: 401 | 403, .. })
    }

    /// Returns true if a retry has a chance to succeed.
    ///
    /// Client errors are never retried, except request timeout (408) and rate limiting (429).
    pub fn is_retryable(&self) -> bool {
        match self {
            QueryError::Cancelled => false,
            QueryError::Http { status, .. } => {
                !(400..500).contains(status) || matches!(status, 408 | 429)
            }
            QueryError::Timeout(_)
            | QueryError::Network(_)
            | QueryError::Parse(_)
            | QueryError::Other(_) => true,
        }
    }

    /// The HTTP status carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            QueryError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for QueryError {
    fn from(err: serde_json::Error) -> Self {
        QueryError::Parse(err.to_string())
    }
}
