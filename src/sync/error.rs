use thiserror::Error;

use crate::providers::GatewayError;
use crate::services::store::StoreError;

/// Every failure a caller of the synchronizer can observe.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The conversation does not exist or belongs to someone else.
    #[error("Conversation not found")]
    NotFound,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("A message is already being sent")]
    Busy,

    #[error("No conversation is open")]
    NotOpen,

    /// The conversation was closed or replaced while the operation ran.
    #[error("Conversation was closed before the operation finished")]
    Cancelled,

    #[error("Store error: {0}")]
    Store(#[source] StoreError),
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => SyncError::NotFound,
            other => SyncError::Store(other),
        }
    }
}

/// How a non-empty `send_message` ended. Responder failures end up here
/// instead of in `SyncError`: the apology is already part of the history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Blank input, nothing happened.
    Ignored,
    Replied,
    Degraded(GatewayError),
}
