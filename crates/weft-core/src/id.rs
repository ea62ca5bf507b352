//! Strong identifier types.
//!
//! All identifiers are newtypes to prevent misuse at compile time. String
//! forms are `z`-prefixed base58 and round-trip through Display/FromStr,
//! which is also how they appear on the JSON wire.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::base58;
use crate::crypto::{AgentSecret, SealerPub, SignerPub};
use crate::error::CoreError;

/// A 32-byte content-addressed covalue identifier.
///
/// Computed as Blake3 over the canonical header encoding; two headers with
/// the same content produce the same id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoId(pub [u8; 32]);

impl CoId {
    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for CoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CoId({})", &hex::encode(self.0)[..16])
    }
}

impl fmt::Display for CoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", base58::encode_z("co", &self.0))
    }
}

impl FromStr for CoId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        base58::decode_z_array("co", s)
            .map(Self)
            .map_err(|e| CoreError::MalformedId(e.to_string()))
    }
}

/// Identifier of a symmetric read key within a group.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId(pub [u8; 16]);

impl KeyId {
    /// Mint a fresh random key id.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({})", hex::encode(self.0))
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", base58::encode_z("key", &self.0))
    }
}

impl FromStr for KeyId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        base58::decode_z_array("key", s)
            .map(Self)
            .map_err(|e| CoreError::MalformedId(e.to_string()))
    }
}

/// An agent identity: the public halves of a signing and a sealing key.
///
/// Encoded as one base58 blob of the concatenated keys so it can serve as
/// a member key inside group content.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AgentId {
    pub signer: SignerPub,
    pub sealer: SealerPub,
}

impl AgentId {
    /// The public identity of an agent secret.
    pub fn of(secret: &AgentSecret) -> Self {
        Self {
            signer: secret.signer().public(),
            sealer: secret.sealer().public(),
        }
    }
}

impl fmt::Debug for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AgentId({})", &hex::encode(self.signer.0)[..16])
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut bytes = [0u8; 64];
        bytes[..32].copy_from_slice(&self.signer.0);
        bytes[32..].copy_from_slice(&self.sealer.0);
        write!(f, "{}", base58::encode_z("agent", &bytes))
    }
}

impl FromStr for AgentId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes: [u8; 64] = base58::decode_z_array("agent", s)
            .map_err(|e| CoreError::MalformedId(e.to_string()))?;
        let mut signer = [0u8; 32];
        let mut sealer = [0u8; 32];
        signer.copy_from_slice(&bytes[..32]);
        sealer.copy_from_slice(&bytes[32..]);
        Ok(Self {
            signer: SignerPub(signer),
            sealer: SealerPub(sealer),
        })
    }
}

/// Something that can own sessions and hold group roles: an account
/// (itself a covalue) or a bare agent (used by invites).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PrincipalId {
    Account(CoId),
    Agent(AgentId),
}

impl PrincipalId {
    /// Is this a bare agent principal?
    pub fn is_agent(&self) -> bool {
        matches!(self, PrincipalId::Agent(_))
    }

    /// The account id, if this principal is one.
    pub fn account(&self) -> Option<&CoId> {
        match self {
            PrincipalId::Account(id) => Some(id),
            PrincipalId::Agent(_) => None,
        }
    }
}

impl fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrincipalId::Account(id) => write!(f, "{}", id),
            PrincipalId::Agent(id) => write!(f, "{}", id),
        }
    }
}

impl FromStr for PrincipalId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with("co_z") {
            Ok(PrincipalId::Account(s.parse()?))
        } else if s.starts_with("agent_z") {
            Ok(PrincipalId::Agent(s.parse()?))
        } else {
            Err(CoreError::MalformedId(format!(
                "not an account or agent id: {s}"
            )))
        }
    }
}

impl From<CoId> for PrincipalId {
    fn from(id: CoId) -> Self {
        PrincipalId::Account(id)
    }
}

impl From<AgentId> for PrincipalId {
    fn from(id: AgentId) -> Self {
        PrincipalId::Agent(id)
    }
}

/// The unit of append ownership: one `(principal, nonce)` pair.
///
/// Only the principal's node ever appends to its own sessions, so no
/// locking is needed on the append path. The derived ordering gives the
/// deterministic total order used by the content fold.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId {
    pub owner: PrincipalId,
    pub nonce: [u8; 8],
}

impl SessionId {
    /// Start a fresh session for a principal.
    pub fn generate(owner: impl Into<PrincipalId>) -> Self {
        use rand::RngCore;
        let mut nonce = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut nonce);
        Self {
            owner: owner.into(),
            nonce,
        }
    }

    /// Construct with an explicit nonce (deterministic tests).
    pub fn with_nonce(owner: impl Into<PrincipalId>, nonce: [u8; 8]) -> Self {
        Self {
            owner: owner.into(),
            nonce,
        }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_session_z{}", self.owner, base58::encode(&self.nonce))
    }
}

impl FromStr for SessionId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (owner_str, nonce_str) = s
            .rsplit_once("_session_z")
            .ok_or_else(|| CoreError::MalformedId(format!("not a session id: {s}")))?;
        let owner: PrincipalId = owner_str.parse()?;
        let nonce_bytes = base58::decode(nonce_str)
            .map_err(|e| CoreError::MalformedId(e.to_string()))?;
        let nonce: [u8; 8] = nonce_bytes
            .try_into()
            .map_err(|_| CoreError::MalformedId("session nonce must be 8 bytes".into()))?;
        Ok(Self { owner, nonce })
    }
}

macro_rules! serde_via_string {
    ($type:ty) => {
        impl Serialize for $type {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $type {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

serde_via_string!(CoId);
serde_via_string!(KeyId);
serde_via_string!(AgentId);
serde_via_string!(PrincipalId);
serde_via_string!(SessionId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_co_id_roundtrip() {
        let id = CoId::from_bytes([0x42; 32]);
        let s = id.to_string();
        assert!(s.starts_with("co_z"));
        assert_eq!(s.parse::<CoId>().unwrap(), id);
    }

    #[test]
    fn test_agent_id_roundtrip() {
        let secret = AgentSecret::from_seed(&[1; 32]);
        let id = AgentId::of(&secret);
        let s = id.to_string();
        assert!(s.starts_with("agent_z"));
        assert_eq!(s.parse::<AgentId>().unwrap(), id);
    }

    #[test]
    fn test_principal_parse_dispatch() {
        let account = PrincipalId::Account(CoId::from_bytes([1; 32]));
        let agent = PrincipalId::Agent(AgentId::of(&AgentSecret::from_seed(&[2; 32])));

        assert_eq!(account.to_string().parse::<PrincipalId>().unwrap(), account);
        assert_eq!(agent.to_string().parse::<PrincipalId>().unwrap(), agent);
        assert!("bogus".parse::<PrincipalId>().is_err());
    }

    #[test]
    fn test_session_id_roundtrip() {
        let owner = PrincipalId::Account(CoId::from_bytes([3; 32]));
        let session = SessionId::with_nonce(owner, [9, 8, 7, 6, 5, 4, 3, 2]);
        let s = session.to_string();
        assert!(s.contains("_session_z"));
        assert_eq!(s.parse::<SessionId>().unwrap(), session);
    }

    #[test]
    fn test_session_ordering_deterministic() {
        let a = SessionId::with_nonce(CoId::from_bytes([1; 32]), [0; 8]);
        let b = SessionId::with_nonce(CoId::from_bytes([2; 32]), [0; 8]);
        assert!(a < b);
        // Same owner, nonce breaks the tie.
        let c = SessionId::with_nonce(CoId::from_bytes([1; 32]), [1; 8]);
        assert!(a < c);
    }

    #[test]
    fn test_key_id_json() {
        let key = KeyId::from_bytes([5; 16]);
        let json = serde_json::to_string(&key).unwrap();
        let back: KeyId = serde_json::from_str(&json).unwrap();
        assert_eq!(key, back);
    }
}
