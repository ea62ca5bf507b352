//! Error types for the node layer.

use thiserror::Error;

use weft_core::{AddError, CoId};
use weft_perms::PermError;
use weft_sync::SyncError;

/// Errors surfaced by [`crate::LocalNode`] operations.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Every peer was asked and none could provide the covalue. This is
    /// a final answer for this call; retry policy belongs to the caller.
    #[error("covalue {0} is unavailable from all peers")]
    Unavailable(CoId),

    /// The covalue is not resident (and no load was attempted).
    #[error("covalue {0} is not loaded")]
    NotLoaded(CoId),

    /// The operation needs a kind of covalue this is not.
    #[error("covalue {0} has the wrong kind for this operation")]
    WrongKind(CoId),

    #[error("malformed invite link: {0}")]
    BadInviteLink(String),

    #[error("account {0} does not match the provided credentials")]
    CredentialMismatch(CoId),

    #[error(transparent)]
    Perm(#[from] PermError),

    #[error(transparent)]
    Core(#[from] AddError),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;
