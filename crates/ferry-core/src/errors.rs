//! Error taxonomy for the transfer pipeline.
//!
//! Every failure the pipeline can observe is mapped onto [`TransferError`] so the
//! orchestrator can decide between retrying, pausing, skipping and failing:
//! - Retryable: provider quota exhaustion and sink rate limits
//! - Fatal: store failures, archive failures, lookup failures
//! - NoRetry: user input problems and cancellation

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Category of transfer error for retry decision-making.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Transient error, a later attempt may succeed.
    Retryable,
    /// Permanent error for the current request or file.
    Fatal,
    /// Not a fault of the pipeline; never retried.
    NoRetry,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("store record could not be encoded: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("store is corrupt: {0}")]
    Corrupt(String),
    #[error("store worker failed: {0}")]
    Worker(String),
}

impl StoreError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransferError {
    /// Bad user input such as a malformed folder link.
    #[error("{0}")]
    Validation(String),
    /// The source provider refused service because a transfer quota is spent.
    #[error("source quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("{}", format_retrieval(.path.as_deref(), .message))]
    Retrieval {
        path: Option<String>,
        message: String,
    },
    /// The sink asked us to slow down for `retry_after`.
    #[error("sink rate limited, retry after {retry_after:?}: {message}")]
    RateLimited {
        retry_after: Duration,
        message: String,
    },
    #[error("delivery failed: {0}")]
    Delivery(String),
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("archive failed: {0:#}")]
    Archive(eyre::Report),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("worker failed: {0}")]
    Worker(String),
}

fn format_retrieval(path: Option<&str>, message: &str) -> String {
    match path {
        Some(path) => format!("{path}: {message}"),
        None => message.to_string(),
    }
}

impl TransferError {
    pub fn retrieval(message: impl Into<String>, path: Option<String>) -> Self {
        TransferError::Retrieval {
            path,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        TransferError::Validation(message.into())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            TransferError::QuotaExceeded(_) | TransferError::RateLimited { .. } => {
                ErrorCategory::Retryable
            }
            TransferError::Validation(_) | TransferError::Cancelled => ErrorCategory::NoRetry,
            TransferError::Io(err) => categorize_io_error(err),
            TransferError::Retrieval { .. }
            | TransferError::Delivery(_)
            | TransferError::Store(_)
            | TransferError::Archive(_)
            | TransferError::Worker(_) => ErrorCategory::Fatal,
        }
    }

    pub fn is_quota(&self) -> bool {
        matches!(self, TransferError::QuotaExceeded(_))
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, TransferError::RateLimited { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransferError::Cancelled)
    }

    /// Provider-dictated wait before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            TransferError::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

/// Categorize an IO error for retry decisions.
pub fn categorize_io_error(err: &io::Error) -> ErrorCategory {
    match err.kind() {
        io::ErrorKind::TimedOut
        | io::ErrorKind::Interrupted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::WouldBlock => ErrorCategory::Retryable,
        _ => ErrorCategory::Fatal,
    }
}

/// Result type for pipeline operations.
pub type TransferResult<T> = std::result::Result<T, TransferError>;
