//! Error types for the sync layer.

use feedsync_model::ModelError;
use feedsync_types::CorrelationToken;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Result type for remote store calls.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Errors that can occur in sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// No pending mutation carries this token.
    #[error("unknown correlation token: {0}")]
    UnknownToken(CorrelationToken),

    /// The intent was rejected before anything was queued.
    #[error("invalid intent: {0}")]
    InvalidIntent(String),

    /// A remote change could not be normalized.
    #[error("malformed change: {0}")]
    MalformedChange(String),

    /// Remote store error.
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// Payload decoding error.
    #[error("model error: {0}")]
    Model(#[from] ModelError),

    /// Channel closed.
    #[error("channel closed")]
    ChannelClosed,
}

/// Failures reported by the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// Transport failure.
    #[error("network error: {0}")]
    Network(String),

    /// A creation collided with an existing identity.
    #[error("record already exists")]
    Conflict,

    /// The target record does not exist.
    #[error("record not found")]
    NotFound,

    /// The record changed since the write's base version.
    #[error("stale write")]
    StaleWrite,

    /// The remote refused the write for another reason.
    #[error("rejected: {0}")]
    Rejected(String),
}

impl RemoteError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Network(_))
    }
}

/// Why an optimistic mutation was reverted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RollbackReason {
    #[error("network error: {0}")]
    Network(String),

    #[error("already exists")]
    AlreadyExists,

    /// The target changed remotely; retry against fresh state.
    #[error("the record changed before the edit was sent")]
    StaleWrite,

    #[error("no response before the mutation timeout")]
    TimedOut,

    /// The record the mutation depends on no longer exists.
    #[error("target no longer exists")]
    TargetMissing,

    #[error("rejected: {0}")]
    Rejected(String),
}

impl From<RemoteError> for RollbackReason {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Network(msg) => RollbackReason::Network(msg),
            RemoteError::Conflict => RollbackReason::AlreadyExists,
            RemoteError::NotFound => RollbackReason::TargetMissing,
            RemoteError::StaleWrite => RollbackReason::StaleWrite,
            RemoteError::Rejected(msg) => RollbackReason::Rejected(msg),
        }
    }
}
