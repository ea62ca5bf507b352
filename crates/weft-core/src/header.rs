//! The immutable covalue header.
//!
//! A covalue's identity is the hash of its header; the header is fixed at
//! creation and never rewritten. Everything mutable lives in session logs.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::base58;
use crate::crypto::Blake3Hash;
use crate::id::CoId;

/// The shape of a covalue's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoValueKind {
    /// Keyed map, last writer wins per key.
    Map,
    /// Ordered list with insert-after addressing.
    List,
    /// Per-session append streams.
    Stream,
    /// Immutable after creation; content is the header meta.
    Static,
}

/// Who may read and write this covalue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Ruleset {
    /// No permission checks; integrity via signatures only.
    UnsafeAllowAll,
    /// This covalue is itself a group: its own content defines roles.
    Group,
    /// Reads and writes are governed by the named group.
    #[serde(rename_all = "camelCase")]
    OwnedByGroup { group: CoId },
}

impl Ruleset {
    /// The owning group, if any.
    pub fn owner(&self) -> Option<&CoId> {
        match self {
            Ruleset::OwnedByGroup { group } => Some(group),
            _ => None,
        }
    }

    /// Is this covalue a group?
    pub fn is_group(&self) -> bool {
        matches!(self, Ruleset::Group)
    }
}

/// Random nonce distinguishing otherwise-identical headers.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Uniqueness(pub [u8; 16]);

impl Uniqueness {
    /// Mint a fresh nonce.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }
}

impl fmt::Debug for Uniqueness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uniqueness({})", hex::encode(self.0))
    }
}

impl Serialize for Uniqueness {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("z{}", base58::encode(&self.0)))
    }
}

impl<'de> Deserialize<'de> for Uniqueness {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let rest = s
            .strip_prefix('z')
            .ok_or_else(|| serde::de::Error::custom("uniqueness must start with z"))?;
        let bytes = base58::decode(rest).map_err(serde::de::Error::custom)?;
        let arr: [u8; 16] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("uniqueness must be 16 bytes"))?;
        Ok(Self(arr))
    }
}

/// The immutable header of a covalue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoValueHeader {
    /// Content shape.
    #[serde(rename = "type")]
    pub kind: CoValueKind,

    /// Permission ruleset.
    pub ruleset: Ruleset,

    /// Opaque application metadata, hashed into the id.
    pub meta: Option<serde_json::Value>,

    /// Creation time claimed by the creator (Unix milliseconds).
    pub created_at: i64,

    /// Random nonce so identical headers still get distinct ids.
    pub uniqueness: Uniqueness,
}

impl CoValueHeader {
    /// Create a header with a fresh uniqueness nonce.
    pub fn new(
        kind: CoValueKind,
        ruleset: Ruleset,
        meta: Option<serde_json::Value>,
        created_at: i64,
    ) -> Self {
        Self {
            kind,
            ruleset,
            meta,
            created_at,
            uniqueness: Uniqueness::generate(),
        }
    }

    /// The canonical encoding hashed into the id.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("header serialization is infallible")
    }

    /// Derive the content-addressed id of this header.
    pub fn id(&self) -> CoId {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"weft-covalue-v0:");
        hasher.update(&self.canonical_bytes());
        CoId(Blake3Hash(*hasher.finalize().as_bytes()).0)
    }
}
