//! Error types for the weft core.

use thiserror::Error;

use crate::crypto::Blake3Hash;
use crate::id::{CoId, KeyId, PrincipalId, SessionId};

/// Errors from the crypto provider.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("decryption error: {0}")]
    Decryption(String),
}

/// Rejection reasons from the transaction gate.
///
/// A rejected batch never mutates session state; these variants describe
/// why it was turned away.
#[derive(Debug, Error)]
pub enum AddError {
    #[error("hash mismatch for session {session}: expected {expected:?}, got {actual:?}")]
    HashMismatch {
        session: SessionId,
        expected: Blake3Hash,
        actual: Blake3Hash,
    },

    #[error("invalid signature for session {session}")]
    InvalidSignature { session: SessionId },

    #[error("no signing key known for {0}")]
    UnknownSigner(PrincipalId),

    #[error("content for session {session} starts at {after} but only {have} transactions are known")]
    InvalidAssumptions {
        session: SessionId,
        after: u64,
        have: u64,
    },

    #[error("read key {0} is not available")]
    KeyUnavailable(KeyId),

    #[error("content for {0} has no header and none is known locally")]
    MissingHeader(CoId),

    #[error("content for {expected} carries a header hashing to {actual}")]
    HeaderMismatch { expected: CoId, actual: CoId },

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// General core errors outside the add gate.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("malformed identifier: {0}")]
    MalformedId(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for AddError {
    fn from(e: serde_json::Error) -> Self {
        AddError::Serialization(e.to_string())
    }
}
