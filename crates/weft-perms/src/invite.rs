//! Invite secrets: one seed that reconstitutes a throwaway invite agent.

use std::fmt;
use std::str::FromStr;

use weft_core::base58;
use weft_core::{AgentId, AgentSecret};

/// The secret seed handed out in an invite link.
///
/// Rendered as `inviteSecret_z<base58>`; whoever holds it can re-derive
/// the invite agent's keys and accept the invite.
#[derive(Clone, PartialEq, Eq)]
pub struct InviteSecret([u8; 32]);

impl InviteSecret {
    /// Mint a fresh invite seed.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        Self(seed)
    }

    /// Create from raw seed bytes.
    pub const fn from_seed(seed: [u8; 32]) -> Self {
        Self(seed)
    }

    /// Re-derive the invite agent's secret keys.
    pub fn agent_secret(&self) -> AgentSecret {
        AgentSecret::from_seed(&self.0)
    }

    /// The invite agent's public identity.
    pub fn agent_id(&self) -> AgentId {
        AgentId::of(&self.agent_secret())
    }
}

impl fmt::Debug for InviteSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InviteSecret({:?})", self.agent_id())
    }
}

impl fmt::Display for InviteSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", base58::encode_z("inviteSecret", &self.0))
    }
}

impl FromStr for InviteSecret {
    type Err = base58::Base58Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(base58::decode_z_array("inviteSecret", s)?))
    }
}
