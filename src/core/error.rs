//! Error taxonomy for validation, transfers and queue operations.

use serde::Serialize;
use thiserror::Error;

use super::models::{TaskFailure, TaskId};

/// Machine-checkable reason a file was refused at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectCode {
    EmptyFile,
    FileTooLarge,
    BlockedExtension,
    UnsupportedType,
}

impl RejectCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectCode::EmptyFile => "empty_file",
            RejectCode::FileTooLarge => "file_too_large",
            RejectCode::BlockedExtension => "blocked_extension",
            RejectCode::UnsupportedType => "unsupported_type",
        }
    }
}

/// A file refused by the validator. Never enters the queue.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{file_name}: {message}")]
pub struct Rejection {
    pub file_name: String,
    pub code: RejectCode,
    pub message: String,
}

/// Failure of a single transfer attempt or of a whole strategy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    /// 401/403 from the remote. Handed to the auth collaborator, never retried.
    #[error("authorization failed (HTTP {status})")]
    Unauthorized { status: u16 },

    /// Non-2xx response other than 401/403.
    #[error("remote returned HTTP {status}: {message}")]
    Remote { status: u16, message: String },

    /// Connection-level failure before a response arrived.
    #[error("network error: {0}")]
    Network(String),

    /// A network call exceeded the per-call timeout.
    #[error("request timed out after {secs}s")]
    Timeout { secs: u64 },

    /// The remote answered with something this client cannot use.
    #[error("unexpected response: {0}")]
    Protocol(String),

    /// The local content could not be read.
    #[error("cannot read file content: {0}")]
    Content(String),

    #[error("transfer cancelled")]
    Cancelled,
}

impl TransferError {
    /// Transient failures worth another attempt: network errors, timeouts,
    /// 408, 429 and 5xx.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransferError::Network(_) | TransferError::Timeout { .. } => true,
            TransferError::Remote { status, .. } => {
                matches!(status, 408 | 429) || (500..600).contains(status)
            }
            TransferError::Unauthorized { .. }
            | TransferError::Protocol(_)
            | TransferError::Content(_)
            | TransferError::Cancelled => false,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            TransferError::Unauthorized { .. } => "unauthorized",
            TransferError::Remote { status, .. } => match status {
                408 | 429 => "rate_limited_or_timeout",
                413 => "payload_too_large",
                415 => "unsupported_media",
                500..=599 => "server_error",
                _ => "rejected_by_remote",
            },
            TransferError::Network(_) => "network",
            TransferError::Timeout { .. } => "timeout",
            TransferError::Protocol(_) => "protocol",
            TransferError::Content(_) => "content_unreadable",
            TransferError::Cancelled => "cancelled",
        }
    }

    pub(crate) fn to_failure(&self) -> TaskFailure {
        TaskFailure {
            code: self.code().to_string(),
            message: self.to_string(),
        }
    }
}

impl From<std::io::Error> for TransferError {
    fn from(err: std::io::Error) -> Self {
        TransferError::Content(err.to_string())
    }
}

/// Errors from the orchestrator handle itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("no task with id {0}")]
    NotFound(TaskId),

    #[error("scheduler has shut down")]
    Closed,
}
