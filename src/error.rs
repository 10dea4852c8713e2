//! Error types and HTTP status classification for pixrelay

use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Error types that can occur while serving an image request
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// The stage declines to handle the request; the next stage should be tried.
    #[error("pass")]
    Pass,

    /// No stage could resolve the resource.
    #[error("not found")]
    NotFound,

    #[error("hash mismatch")]
    HashMismatch,

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("timeout")]
    Timeout,

    #[error("cancelled")]
    Cancelled,

    #[error("upstream returned {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => RelayError::NotFound,
            std::io::ErrorKind::TimedOut => RelayError::Timeout,
            _ => RelayError::IoError(err.to_string()),
        }
    }
}

impl From<tokio::time::error::Elapsed> for RelayError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        RelayError::Timeout
    }
}

impl RelayError {
    /// Short machine-readable name of the error class
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::Pass => "pass",
            RelayError::NotFound => "not_found",
            RelayError::HashMismatch => "hash_mismatch",
            RelayError::InvalidParams(_) => "invalid_params",
            RelayError::UnsupportedFormat(_) => "unsupported_format",
            RelayError::Timeout => "timeout",
            RelayError::Cancelled => "cancelled",
            RelayError::Upstream { .. } => "upstream",
            RelayError::ConfigError(_)
            | RelayError::IoError(_)
            | RelayError::InternalError(_) => "internal",
        }
    }

    /// Convert error to HTTP status code
    ///
    /// `Pass` keeps its own 400 here; callers at the outermost boundary should go
    /// through [`RelayError::into_visible`] first so it shows up as 404.
    pub fn to_http_status(&self) -> u16 {
        match self {
            RelayError::Pass => 400,
            RelayError::NotFound => 404,
            RelayError::HashMismatch => 403,
            RelayError::InvalidParams(_) => 400,
            RelayError::UnsupportedFormat(_) => 406,
            RelayError::Timeout => 408,
            // nginx's "client closed request"
            RelayError::Cancelled => 499,
            RelayError::Upstream { status, .. } if (400..500).contains(status) => *status,
            RelayError::Upstream { .. } => 502,
            RelayError::ConfigError(_) => 500,
            RelayError::IoError(_) => 500,
            RelayError::InternalError(_) => 500,
        }
    }

    /// Whether this error means the caller went away or ran out of time.
    ///
    /// These are expected outcomes and are never logged as hard failures.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, RelayError::Cancelled | RelayError::Timeout)
    }

    /// A `Pass` that reached the caller means nothing wanted the request,
    /// which is indistinguishable from the resource not existing.
    pub fn into_visible(self) -> Self {
        match self {
            RelayError::Pass => RelayError::NotFound,
            other => other,
        }
    }

    /// Create an error from an upstream HTTP status code
    pub fn from_http_status(status: u16, message: impl Into<String>) -> Self {
        if status == 404 {
            RelayError::NotFound
        } else {
            RelayError::Upstream {
                status,
                message: message.into(),
            }
        }
    }
}

/// An error that may still carry usable bytes.
///
/// Loaders can hand back a partial body together with their failure and
/// processors can pass a normalized buffer along with `Pass`. Chains keep
/// non-empty buffers as fallback and the response writer still emits them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialError {
    pub error: RelayError,
    pub buf: Bytes,
}

impl PartialError {
    pub fn new(error: RelayError, buf: Bytes) -> Self {
        Self { error, buf }
    }

    pub fn pass_with(buf: Bytes) -> Self {
        Self::new(RelayError::Pass, buf)
    }
}

impl From<RelayError> for PartialError {
    fn from(error: RelayError) -> Self {
        Self {
            error,
            buf: Bytes::new(),
        }
    }
}

impl From<std::io::Error> for PartialError {
    fn from(err: std::io::Error) -> Self {
        RelayError::from(err).into()
    }
}

impl std::fmt::Display for PartialError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.buf.is_empty() {
            write!(f, "{}", self.error)
        } else {
            write!(f, "{} ({} fallback bytes)", self.error, self.buf.len())
        }
    }
}

impl std::error::Error for PartialError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Error shape exposed to HTTP clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassifiedError {
    #[serde(skip)]
    pub kind: &'static str,
    pub message: String,
    pub status: u16,
}

/// Map an error to its client-visible classification
pub fn classify(err: &RelayError) -> ClassifiedError {
    let err = err.clone().into_visible();
    ClassifiedError {
        kind: err.kind(),
        message: err.to_string(),
        status: err.to_http_status(),
    }
}

/// Classify an arbitrary failure.
///
/// Known error types are recognized through downcasting; anything else is an
/// internal error.
pub fn classify_any(err: &anyhow::Error) -> ClassifiedError {
    classify(&relay_error_from_any(err))
}

pub(crate) fn relay_error_from_any(err: &anyhow::Error) -> RelayError {
    if let Some(e) = err.downcast_ref::<RelayError>() {
        return e.clone();
    }
    if let Some(e) = err.downcast_ref::<PartialError>() {
        return e.error.clone();
    }
    if let Some(e) = err.downcast_ref::<std::io::Error>() {
        return RelayError::from(std::io::Error::new(e.kind(), e.to_string()));
    }
    if err.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
        return RelayError::Timeout;
    }
    RelayError::InternalError(err.to_string())
}
