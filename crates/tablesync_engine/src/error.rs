//! Error types for the sync engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tablesync_protocol::{ProtocolError, RowId};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Result type for endpoint client calls.
pub type EndpointResult<T> = Result<T, EndpointError>;

/// Classification attached to every error that reaches a run report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Reading from an endpoint failed.
    Fetch,
    /// Mapping or normalizing a row failed.
    Transform,
    /// Writing to an endpoint failed.
    Write,
    /// A conflict could not be resolved.
    Conflict,
    /// A value or configuration was rejected.
    Validation,
    /// Checkpoint corruption or mismatch.
    State,
    /// The endpoint's quota was exceeded.
    RateLimit,
    /// Credentials were rejected.
    Auth,
    /// Connection failure or timeout.
    Network,
    /// Anything else.
    Unknown,
}

impl ErrorKind {
    /// Returns the kind name used in reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Fetch => "fetch",
            ErrorKind::Transform => "transform",
            ErrorKind::Write => "write",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Validation => "validation",
            ErrorKind::State => "state",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Auth => "auth",
            ErrorKind::Network => "network",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by endpoint clients.
///
/// Clients translate their transport failures into these variants; the retry
/// executor's classification depends on it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EndpointError {
    /// HTTP 429 or equivalent.
    #[error("rate limited by endpoint")]
    RateLimited {
        /// Server-suggested wait before retrying.
        retry_after: Option<Duration>,
    },

    /// A 4xx response other than 429.
    #[error("client error {status}: {message}")]
    Client {
        /// HTTP status code.
        status: u16,
        /// Error message from the endpoint.
        message: String,
    },

    /// The endpoint rejected a value.
    #[error("validation failed: {message}")]
    Validation {
        /// Offending row, when the endpoint names one.
        row_id: Option<RowId>,
        /// Error message from the endpoint.
        message: String,
    },

    /// Credentials were rejected or expired.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// A 5xx response.
    #[error("server error {status}: {message}")]
    Server {
        /// HTTP status code.
        status: u16,
        /// Error message from the endpoint.
        message: String,
    },

    /// Connection-level failure.
    #[error("network error: {0}")]
    Network(String),

    /// The call timed out.
    #[error("request timed out")]
    Timeout,
}

impl EndpointError {
    /// Classifies an HTTP status code.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            429 => EndpointError::RateLimited { retry_after: None },
            401 | 403 => EndpointError::Auth(message),
            422 => EndpointError::Validation {
                row_id: None,
                message,
            },
            400..=499 => EndpointError::Client { status, message },
            _ => EndpointError::Server { status, message },
        }
    }

    /// Creates a validation error naming a row.
    pub fn validation(row_id: impl Into<RowId>, message: impl Into<String>) -> Self {
        EndpointError::Validation {
            row_id: Some(row_id.into()),
            message: message.into(),
        }
    }

    /// Returns true if the call may succeed when repeated.
    ///
    /// Auth failures are retried because the credential owner may refresh
    /// the token between attempts.
    pub fn is_retryable(&self) -> bool {
        match self {
            EndpointError::RateLimited { .. }
            | EndpointError::Auth(_)
            | EndpointError::Server { .. }
            | EndpointError::Network(_)
            | EndpointError::Timeout => true,
            EndpointError::Client { .. } | EndpointError::Validation { .. } => false,
        }
    }

    /// Kind of this error, if it has one regardless of the calling phase.
    pub fn specific_kind(&self) -> Option<ErrorKind> {
        match self {
            EndpointError::RateLimited { .. } => Some(ErrorKind::RateLimit),
            EndpointError::Validation { .. } => Some(ErrorKind::Validation),
            EndpointError::Auth(_) => Some(ErrorKind::Auth),
            EndpointError::Network(_) | EndpointError::Timeout => Some(ErrorKind::Network),
            EndpointError::Client { .. } | EndpointError::Server { .. } => None,
        }
    }

    /// Server-suggested retry delay.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            EndpointError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// An endpoint call failed.
    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    /// A row could not be mapped.
    #[error("transform error: {0}")]
    Transform(String),

    /// A conflict violated resolver invariants.
    #[error("conflict error: {0}")]
    Conflict(String),

    /// Configuration or value rejected.
    #[error("validation error: {0}")]
    Validation(String),

    /// Checkpoint corrupt or mismatched.
    #[error("state error: {0}")]
    State(String),

    /// A guarded call gave up.
    #[error("{operation} failed after {attempts} attempt(s) [{kind}]: {source}")]
    OperationFailed {
        /// Name of the operation.
        operation: String,
        /// Attempts made.
        attempts: u32,
        /// Classification of the final error.
        kind: ErrorKind,
        /// The last error.
        #[source]
        source: Box<SyncError>,
    },

    /// Protocol value error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error while persisting state.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Another process holds the configuration lock.
    #[error("configuration {0} is locked by another run")]
    Locked(String),

    /// The run was cancelled.
    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Endpoint(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Kind carried by the error itself, independent of the calling phase.
    pub fn specific_kind(&self) -> Option<ErrorKind> {
        match self {
            SyncError::Endpoint(e) => e.specific_kind(),
            SyncError::Transform(_) => Some(ErrorKind::Transform),
            SyncError::Conflict(_) => Some(ErrorKind::Conflict),
            SyncError::Validation(_) => Some(ErrorKind::Validation),
            SyncError::State(_) | SyncError::Locked(_) => Some(ErrorKind::State),
            SyncError::OperationFailed { kind, .. } => Some(*kind),
            SyncError::Protocol(ProtocolError::InvalidMapping(_)) => Some(ErrorKind::Validation),
            SyncError::Protocol(_) => Some(ErrorKind::State),
            SyncError::Io(_) | SyncError::Cancelled => None,
        }
    }

    /// Kind of this error, falling back to the kind of the failing phase.
    pub fn kind_or(&self, phase_kind: ErrorKind) -> ErrorKind {
        self.specific_kind().unwrap_or(phase_kind)
    }

    /// Kind of this error, or `Unknown`.
    pub fn kind(&self) -> ErrorKind {
        self.kind_or(ErrorKind::Unknown)
    }

    /// The innermost error, looking through `OperationFailed`.
    pub fn root_cause(&self) -> &SyncError {
        match self {
            SyncError::OperationFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Row named by the underlying endpoint error, if any.
    pub fn row_id(&self) -> Option<&RowId> {
        match self.root_cause() {
            SyncError::Endpoint(EndpointError::Validation { row_id, .. }) => row_id.as_ref(),
            _ => None,
        }
    }
}
