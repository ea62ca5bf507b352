//! Error types for the sync module.

use thiserror::Error;

use weft_core::AddError;

use crate::peer::PeerId;

/// Errors that can occur during sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The peer's outgoing channel is gone.
    #[error("peer {0} is no longer reachable")]
    PeerGone(PeerId),

    /// A message referenced a peer we do not track.
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),

    /// Transaction verification failed while applying content.
    #[error(transparent)]
    Core(#[from] AddError),
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
