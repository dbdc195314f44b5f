//! Error types for docket.
//!
//! Every error maps onto one of the pipeline's failure classes via
//! [`Error::kind`], which is what the stage runner uses to decide between
//! retrying, failing the document, or rejecting the attempt outright.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Result type alias using docket's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure classes the orchestration layer reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network timeout, rate limit, connection reset. Retried with backoff.
    Transient,
    /// Missing field, empty text, malformed input. Never retried.
    Validation,
    /// Input too large for the normal path.
    ResourceExhausted,
    /// Too many recent failures for this document; no work attempted.
    CircuitOpen,
    /// Anything else. Recorded and not retried.
    Fatal,
}

impl ErrorKind {
    /// Whether an error of this kind is eligible for a local retry.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Validation => "validation",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Fatal => "fatal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Core error type for docket operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Document not found
    #[error("Document not found: {0}")]
    DocumentNotFound(Uuid),

    /// Batch not found
    #[error("Batch not found: {0}")]
    BatchNotFound(Uuid),

    /// Input failed a precondition (empty text, missing chunks, bad location)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Recoverable failure of a dependency
    #[error("Transient error: {0}")]
    Transient(String),

    /// A call exceeded its deadline
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The document's circuit breaker is open
    #[error("Circuit open for document {0}")]
    CircuitOpen(Uuid),

    /// Input exceeds a hard resource limit and no fallback strategy applies
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// External service reported a permanent failure
    #[error("Service error: {0}")]
    Service(String),

    /// Task queue error
    #[error("Queue error: {0}")]
    Queue(String),

    /// Cache backend error (never surfaced past the cache layer)
    #[error("Cache error: {0}")]
    Cache(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP request failed in a non-retryable way
    #[error("Request error: {0}")]
    Request(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Classify this error into the pipeline's failure taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transient(_) | Error::Timeout(_) | Error::Cache(_) => ErrorKind::Transient,
            Error::Database(e) => match e {
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                    ErrorKind::Transient
                }
                _ => ErrorKind::Fatal,
            },
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::Interrupted => ErrorKind::Transient,
                _ => ErrorKind::Fatal,
            },
            Error::Validation(_)
            | Error::NotFound(_)
            | Error::DocumentNotFound(_)
            | Error::BatchNotFound(_)
            | Error::Serialization(_) => ErrorKind::Validation,
            Error::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Error::CircuitOpen(_) => ErrorKind::CircuitOpen,
            Error::Service(_)
            | Error::Queue(_)
            | Error::Config(_)
            | Error::Request(_)
            | Error::Internal(_) => ErrorKind::Fatal,
        }
    }

    /// Shorthand for `self.kind().is_retryable()`.
    pub fn is_transient(&self) -> bool {
        self.kind().is_retryable()
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return Error::Timeout(e.to_string());
        }
        if e.is_connect() {
            return Error::Transient(e.to_string());
        }
        match e.status() {
            Some(status) if status.as_u16() == 429 || status.is_server_error() => {
                Error::Transient(e.to_string())
            }
            _ => Error::Request(e.to_string()),
        }
    }
}
