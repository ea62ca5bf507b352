//! Known states and content diffs: the currency of synchronization.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::crypto::Signature;
use crate::header::CoValueHeader;
use crate::id::{CoId, SessionId};
use crate::transaction::Transaction;

/// What a peer already has of one covalue: whether it holds the header,
/// and how many transactions it knows per session.
///
/// Known states are recomputed each sync round, never mutated in place by
/// the protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnownState {
    pub id: CoId,
    pub header: bool,
    pub sessions: BTreeMap<SessionId, u64>,
}

impl KnownState {
    /// A state that knows nothing about `id`.
    pub fn empty(id: CoId) -> Self {
        Self {
            id,
            header: false,
            sessions: BTreeMap::new(),
        }
    }

    /// Transactions known for one session.
    pub fn session_count(&self, session: &SessionId) -> u64 {
        self.sessions.get(session).copied().unwrap_or(0)
    }

    /// Does this state cover everything `other` has?
    pub fn covers(&self, other: &KnownState) -> bool {
        if other.header && !self.header {
            return false;
        }
        other
            .sessions
            .iter()
            .all(|(session, count)| self.session_count(session) >= *count)
    }

    /// Merge another sighting of the same covalue into this state.
    pub fn combine(&mut self, other: &KnownState) {
        self.header |= other.header;
        for (session, count) in &other.sessions {
            let entry = self.sessions.entry(session.clone()).or_insert(0);
            if *count > *entry {
                *entry = *count;
            }
        }
    }
}

/// New transactions for one session: everything after `after`, with the
/// signature valid as of the end of the batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionNewContent {
    pub after: u64,
    pub last_signature: Signature,
    pub new_transactions: Vec<Transaction>,
}

/// One content message: optionally the header, plus per-session batches.
///
/// A single diff can split into several of these when sessions cross
/// signature checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewContent {
    pub id: CoId,
    pub header: Option<CoValueHeader>,
    pub new: BTreeMap<SessionId, SessionNewContent>,
}

impl NewContent {
    /// A content message carrying nothing but the header.
    pub fn header_only(id: CoId, header: CoValueHeader) -> Self {
        Self {
            id,
            header: Some(header),
            new: BTreeMap::new(),
        }
    }

    /// Is there anything in this message at all?
    pub fn is_empty(&self) -> bool {
        self.header.is_none() && self.new.is_empty()
    }
}
