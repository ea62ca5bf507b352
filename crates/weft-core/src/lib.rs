//! # weft-core
//!
//! Pure primitives for the weft synchronization engine: covalue headers,
//! per-session transaction logs, the crypto provider, and content folds.
//!
//! This crate contains no I/O, no storage, no networking. It is pure
//! computation over cryptographic data structures.
//!
//! ## Key Types
//!
//! - [`CoValueCore`] - One covalue: header plus per-session logs
//! - [`CoId`] - Content-addressed identifier (Blake3 of the header)
//! - [`SessionLog`] - Hash-chained, signature-checkpointed append log
//! - [`KnownState`] / [`NewContent`] - The currency of synchronization
//!
//! ## Validation
//!
//! [`CoValueCore::try_add_transactions`] is the single gate through which
//! every transaction passes, whatever its source.

pub mod base58;
pub mod content;
pub mod core;
pub mod crypto;
pub mod error;
pub mod header;
pub mod id;
pub mod known;
pub mod session;
pub mod transaction;

pub use content::{CoList, CoMap, CoStream, ListOp, MapOp, StreamOp, LIST_START};
pub use core::{
    AgentsOnly, AllowAll, ApplyOutcome, CoValueCore, SignerResolver, TxValidator,
    ValidTransaction, WritePrivacy,
};
pub use crypto::{
    AgentSecret, Blake3Hash, Encrypted, KeySecret, Sealed, SealerPub, SealerSecret, Signature,
    SignerPub, SignerSecret, StreamingHash,
};
pub use error::{AddError, CoreError, CryptoError};
pub use header::{CoValueHeader, CoValueKind, Ruleset, Uniqueness};
pub use id::{AgentId, CoId, KeyId, PrincipalId, SessionId};
pub use known::{KnownState, NewContent, SessionNewContent};
pub use session::{SessionLog, SessionSlice, SIGNATURE_CHECKPOINT_BYTES};
pub use transaction::{KeyProvider, NoKeys, Privacy, Transaction};
