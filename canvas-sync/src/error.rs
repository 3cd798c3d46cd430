//! Error taxonomy for the sync core.
//!
//! Every handler failure maps onto one [`ErrorKind`]. The kind decides what
//! the originating connection is told; peers never see a failed operation.

use thiserror::Error;

use crate::storage::StoreError;

/// Coarse classification used for client-facing error reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or malformed required fields.
    Validation,
    /// Too many events inside the current rate window.
    RateLimited,
    /// Advisory lock held by somebody else.
    LockConflict,
    /// Ephemeral or durable store failed.
    Adapter,
    /// A staged payload could not be parsed.
    DataCorruption,
    /// The service is shutting down or the pipeline is closed.
    Unavailable,
}

impl ErrorKind {
    /// Wire tag carried in `error` events.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::RateLimited => "rate-limited",
            ErrorKind::LockConflict => "lock-conflict",
            ErrorKind::Adapter => "internal",
            ErrorKind::DataCorruption => "data-corruption",
            ErrorKind::Unavailable => "unavailable",
        }
    }
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("object already locked by {holder}")]
    ObjectAlreadyLocked { holder: String },
    #[error("object is locked by {holder}")]
    NotLockOwner { holder: String },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("corrupt staged payload under {key}: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("server is shutting down")]
    ShuttingDown,
    #[error("write-behind pipeline is closed")]
    PipelineClosed,
}

impl SyncError {
    pub fn validation(msg: impl Into<String>) -> Self {
        SyncError::Validation(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Validation(_) => ErrorKind::Validation,
            SyncError::RateLimited => ErrorKind::RateLimited,
            SyncError::ObjectAlreadyLocked { .. } | SyncError::NotLockOwner { .. } => {
                ErrorKind::LockConflict
            }
            SyncError::Store(_) => ErrorKind::Adapter,
            SyncError::Corrupt { .. } => ErrorKind::DataCorruption,
            SyncError::ShuttingDown | SyncError::PipelineClosed => ErrorKind::Unavailable,
        }
    }

    /// Current lock holder, for lock conflicts.
    pub fn holder(&self) -> Option<&str> {
        match self {
            SyncError::ObjectAlreadyLocked { holder } | SyncError::NotLockOwner { holder } => {
                Some(holder)
            }
            _ => None,
        }
    }

    /// The single explanatory message sent back to the origin.
    ///
    /// Adapter failures are reported generically; their details only go to
    /// the log.
    pub fn client_message(&self) -> String {
        match self {
            SyncError::Store(_) => "Internal error, please retry".to_string(),
            SyncError::RateLimited => "Rate limit exceeded, please slow down".to_string(),
            other => other.to_string(),
        }
    }
}
