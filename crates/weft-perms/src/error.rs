//! Error types for the permission layer.

use thiserror::Error;

use weft_core::{AddError, CoId, KeyId, PrincipalId};

use crate::role::Role;

/// Errors from group operations.
#[derive(Debug, Error)]
pub enum PermError {
    #[error("{0} is not a group")]
    NotAGroup(CoId),

    #[error("{0} is not an admin of this group")]
    NotAdmin(PrincipalId),

    #[error("{0} holds no invite in this group")]
    NotAnInvite(PrincipalId),

    #[error("role {0} cannot be granted directly")]
    InvalidRole(Role),

    #[error("group has no current read key")]
    NoReadKey,

    #[error("read key {0} cannot be resolved")]
    KeyUnavailable(KeyId),

    #[error("no sealing key known for {0}")]
    UnknownSealer(PrincipalId),

    #[error(transparent)]
    Core(#[from] AddError),
}

/// Result type for permission operations.
pub type Result<T> = std::result::Result<T, PermError>;
