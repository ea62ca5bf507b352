//! Chunks: the storage engines' unit of merge.
//!
//! A chunk is a partial picture of one covalue: optionally its header,
//! plus per-session runs of transactions. Two chunks merge only when
//! their runs are contiguous; anything else fails explicitly rather than
//! silently reordering history.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use weft_core::{
    CoId, CoValueHeader, KnownState, NewContent, SessionId, SessionNewContent, Signature,
    Transaction,
};

use crate::error::NonContiguous;

/// One run of transactions within a session: everything after `after`,
/// with the signature valid at the end of the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    pub after: u64,
    pub last_signature: Signature,
    pub transactions: Vec<Transaction>,
}

impl SessionEntry {
    /// Index one past the last transaction of this run.
    pub fn end(&self) -> u64 {
        self.after + self.transactions.len() as u64
    }
}

/// A partial representation of one covalue's header and session runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoValueChunk {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header: Option<CoValueHeader>,
    pub session_entries: BTreeMap<SessionId, Vec<SessionEntry>>,
}

impl CoValueChunk {
    /// Convert an incoming content message into chunk form.
    pub fn from_content(content: &NewContent) -> Self {
        let mut session_entries = BTreeMap::new();
        for (session, entry) in &content.new {
            session_entries.insert(
                session.clone(),
                vec![SessionEntry {
                    after: entry.after,
                    last_signature: entry.last_signature,
                    transactions: entry.new_transactions.clone(),
                }],
            );
        }
        Self {
            header: content.header.clone(),
            session_entries,
        }
    }

    /// Replay this chunk as content messages, in applicable order.
    ///
    /// The i-th message carries the i-th run of each session, so runs
    /// within a session arrive in append order.
    pub fn to_contents(&self, id: CoId) -> Vec<NewContent> {
        let rounds = self
            .session_entries
            .values()
            .map(Vec::len)
            .max()
            .unwrap_or(0);

        let mut contents: Vec<NewContent> = (0..rounds.max(1))
            .map(|i| NewContent {
                id,
                header: (i == 0).then(|| self.header.clone()).flatten(),
                new: BTreeMap::new(),
            })
            .collect();

        for (session, entries) in &self.session_entries {
            for (i, entry) in entries.iter().enumerate() {
                contents[i].new.insert(
                    session.clone(),
                    SessionNewContent {
                        after: entry.after,
                        last_signature: entry.last_signature,
                        new_transactions: entry.transactions.clone(),
                    },
                );
            }
        }

        contents.retain(|c| !c.is_empty());
        contents
    }

    /// What this chunk covers, in sync-protocol terms.
    ///
    /// Only the contiguous-from-zero prefix counts: a run starting past
    /// what earlier runs cover is held but not yet usable.
    pub fn known_state(&self, id: CoId) -> KnownState {
        let mut state = KnownState::empty(id);
        state.header = self.header.is_some();
        for (session, entries) in &self.session_entries {
            let mut covered = 0;
            for entry in entries {
                if entry.after > covered {
                    break;
                }
                covered = covered.max(entry.end());
            }
            if covered > 0 {
                state.sessions.insert(session.clone(), covered);
            }
        }
        state
    }

    /// Total transactions held, across all runs.
    pub fn transaction_count(&self) -> usize {
        self.session_entries
            .values()
            .flat_map(|entries| entries.iter())
            .map(|e| e.transactions.len())
            .sum()
    }

    /// Merge `addition` on top of this chunk.
    ///
    /// Succeeds only when every added run lines up with what we already
    /// hold: a run may overlap (the overlap is dropped) or extend, but a
    /// gap is a [`NonContiguous`] error and nothing is modified.
    pub fn merge(&self, addition: &CoValueChunk, id: &CoId) -> Result<CoValueChunk, NonContiguous> {
        let mut merged = self.clone();
        if merged.header.is_none() {
            merged.header = addition.header.clone();
        }

        for (session, added_entries) in &addition.session_entries {
            for added in added_entries {
                let runs = merged.session_entries.entry(session.clone()).or_default();

                let Some(last) = runs.last_mut() else {
                    runs.push(added.clone());
                    continue;
                };

                let have = last.end();
                if added.after > have {
                    return Err(NonContiguous {
                        id: *id,
                        session: session.clone(),
                        have,
                        after: added.after,
                    });
                }

                let skip = (have - added.after) as usize;
                if skip >= added.transactions.len() {
                    // Entirely overlapping; nothing new.
                    continue;
                }
                last.transactions
                    .extend_from_slice(&added.transactions[skip..]);
                last.last_signature = added.last_signature;
            }
        }

        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::{PrincipalId, Signature};

    fn sid(n: u8) -> SessionId {
        SessionId::with_nonce(PrincipalId::Account(CoId::from_bytes([n; 32])), [0; 8])
    }

    fn sig(n: u8) -> Signature {
        Signature::from_bytes([n; 64])
    }

    fn tx(n: i64) -> Transaction {
        Transaction::trusting(n, vec![serde_json::json!(n)])
    }

    fn chunk_with(session: SessionId, after: u64, txs: Vec<Transaction>, s: u8) -> CoValueChunk {
        let mut session_entries = BTreeMap::new();
        session_entries.insert(
            session,
            vec![SessionEntry {
                after,
                last_signature: sig(s),
                transactions: txs,
            }],
        );
        CoValueChunk {
            header: None,
            session_entries,
        }
    }

    #[test]
    fn test_merge_contiguous() {
        let id = CoId::from_bytes([9; 32]);
        let a = chunk_with(sid(1), 0, vec![tx(0), tx(1)], 1);
        let b = chunk_with(sid(1), 2, vec![tx(2)], 2);

        let merged = a.merge(&b, &id).unwrap();
        let runs = &merged.session_entries[&sid(1)];
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].transactions.len(), 3);
        assert_eq!(runs[0].last_signature, sig(2));
    }

    #[test]
    fn test_merge_gap_fails_without_mutation() {
        let id = CoId::from_bytes([9; 32]);
        let a = chunk_with(sid(1), 0, vec![tx(0)], 1);
        let b = chunk_with(sid(1), 5, vec![tx(5)], 2);

        let err = a.merge(&b, &id).unwrap_err();
        assert_eq!(err.have, 1);
        assert_eq!(err.after, 5);
        // The base is untouched.
        assert_eq!(a.session_entries[&sid(1)][0].transactions.len(), 1);
    }

    #[test]
    fn test_merge_overlap_dropped() {
        let id = CoId::from_bytes([9; 32]);
        let a = chunk_with(sid(1), 0, vec![tx(0), tx(1)], 1);
        let b = chunk_with(sid(1), 1, vec![tx(1), tx(2)], 2);

        let merged = a.merge(&b, &id).unwrap();
        let runs = &merged.session_entries[&sid(1)];
        assert_eq!(runs[0].transactions.len(), 3);
    }

    #[test]
    fn test_merge_succeeds_iff_contiguous_property() {
        // Merge succeeds iff the addition lines up, over a small range
        // of offsets.
        let id = CoId::from_bytes([9; 32]);
        let base = chunk_with(sid(1), 0, vec![tx(0), tx(1), tx(2)], 1);
        for after in 0..6u64 {
            let addition = chunk_with(sid(1), after, vec![tx(after as i64)], 2);
            let result = base.merge(&addition, &id);
            if after <= 3 {
                assert!(result.is_ok(), "after={after} should merge");
            } else {
                assert!(result.is_err(), "after={after} should fail");
            }
        }
    }

    #[test]
    fn test_known_state_counts_contiguous_prefix_only() {
        let id = CoId::from_bytes([9; 32]);
        let mut chunk = chunk_with(sid(1), 0, vec![tx(0), tx(1)], 1);
        // A floating run that does not connect yet.
        chunk
            .session_entries
            .get_mut(&sid(1))
            .unwrap()
            .push(SessionEntry {
                after: 5,
                last_signature: sig(3),
                transactions: vec![tx(5)],
            });

        let state = chunk.known_state(id);
        assert_eq!(state.session_count(&sid(1)), 2);
    }

    #[test]
    fn test_content_roundtrip() {
        let id = CoId::from_bytes([9; 32]);
        let chunk = chunk_with(sid(1), 0, vec![tx(0), tx(1)], 1);
        let contents = chunk.to_contents(id);
        assert_eq!(contents.len(), 1);

        let back = CoValueChunk::from_content(&contents[0]);
        assert_eq!(back.session_entries, chunk.session_entries);
    }

    proptest::proptest! {
        // Merge succeeds exactly when the addition starts at or before
        // our end, and the merged run never reorders or drops middle
        // transactions.
        #[test]
        fn prop_merge_contiguity(base_len in 0u64..8, after in 0u64..12, add_len in 1u64..6) {
            let id = CoId::from_bytes([9; 32]);
            let base = chunk_with(
                sid(1),
                0,
                (0..base_len as i64).map(tx).collect(),
                1,
            );
            let addition = chunk_with(
                sid(1),
                after,
                (after as i64..(after + add_len) as i64).map(tx).collect(),
                2,
            );

            match base.merge(&addition, &id) {
                Ok(merged) => {
                    proptest::prop_assert!(after <= base_len);
                    let runs = &merged.session_entries[&sid(1)];
                    proptest::prop_assert_eq!(runs.len(), 1);
                    let expected = base_len.max(after + add_len);
                    proptest::prop_assert_eq!(runs[0].transactions.len() as u64, expected);
                    for (i, t) in runs[0].transactions.iter().enumerate() {
                        proptest::prop_assert_eq!(t.made_at(), i as i64);
                    }
                }
                Err(e) => {
                    proptest::prop_assert!(after > base_len);
                    proptest::prop_assert_eq!(e.have, base_len);
                }
            }
        }
    }
}
