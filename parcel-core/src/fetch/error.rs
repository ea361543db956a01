use std::time::Duration;

/// How a failed request affects the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Worth another attempt after a backoff.
    Retryable,
    /// This item will not succeed; other items continue.
    FatalItem,
    /// No item will succeed; the run stops.
    FatalGlobal,
}

/// Failure of a single request attempt.
#[non_exhaustive]
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No response within the request timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The connection could not be established or was reset.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The service answered with an unsuccessful HTTP status.
    #[error("unexpected HTTP status {0}")]
    Status(u16),

    /// The response arrived but could not be understood.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// The request could not be built, e.g. an invalid URL.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl TransportError {
    /// Classifies the failure.
    ///
    /// Timeouts, connection problems, `408`, `429` and `5xx` are transient. `401` and `403`
    /// mean the credentials are wrong for every request. Anything else only dooms this item.
    #[must_use]
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Timeout(_) | Self::Connection(_) => FailureClass::Retryable,
            Self::Status(401 | 403) => FailureClass::FatalGlobal,
            Self::Status(408 | 429 | 500..=599) => FailureClass::Retryable,
            Self::Status(_) | Self::Malformed(_) | Self::InvalidRequest(_) => FailureClass::FatalItem,
        }
    }
}
