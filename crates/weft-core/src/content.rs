//! Typed content views: map, list and stream folds.
//!
//! Views are adapter layers over [`crate::core::CoValueCore::valid_sorted_transactions`];
//! the core itself is agnostic to them. Each view is a pure fold, so two
//! nodes folding the same valid transactions always materialize the same
//! content.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use tracing::debug;

use crate::core::ValidTransaction;
use crate::id::SessionId;

/// A change operation on a map covalue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum MapOp {
    Set {
        key: String,
        value: serde_json::Value,
    },
    Del {
        key: String,
    },
}

impl MapOp {
    /// Convenience constructor for a set operation as a raw change.
    pub fn set(key: impl Into<String>, value: serde_json::Value) -> serde_json::Value {
        serde_json::to_value(MapOp::Set {
            key: key.into(),
            value,
        })
        .expect("op serialization is infallible")
    }

    /// Convenience constructor for a delete operation as a raw change.
    pub fn del(key: impl Into<String>) -> serde_json::Value {
        serde_json::to_value(MapOp::Del { key: key.into() }).expect("op serialization is infallible")
    }
}

/// Render the op reference of change `change_index` in a transaction.
pub fn op_ref(session: &SessionId, tx_index: u64, change_index: u64) -> String {
    format!("{session}:{tx_index}:{change_index}")
}

/// The anchor naming the list start.
pub const LIST_START: &str = "start";

/// A change operation on a list covalue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ListOp {
    Ins {
        /// `"start"` or the op reference of the element to insert after.
        after: String,
        value: serde_json::Value,
    },
    Del {
        /// Op reference of the element to delete.
        target: String,
    },
}

impl ListOp {
    /// Insert after an anchor, as a raw change.
    pub fn ins(after: impl Into<String>, value: serde_json::Value) -> serde_json::Value {
        serde_json::to_value(ListOp::Ins {
            after: after.into(),
            value,
        })
        .expect("op serialization is infallible")
    }

    /// Delete a target element, as a raw change.
    pub fn del(target: impl Into<String>) -> serde_json::Value {
        serde_json::to_value(ListOp::Del {
            target: target.into(),
        })
        .expect("op serialization is infallible")
    }
}

/// A change operation on a stream covalue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum StreamOp {
    Push { value: serde_json::Value },
}

impl StreamOp {
    /// Append a value, as a raw change.
    pub fn push(value: serde_json::Value) -> serde_json::Value {
        serde_json::to_value(StreamOp::Push { value }).expect("op serialization is infallible")
    }
}

/// Materialized map content: last writer wins per key under the fold order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoMap {
    entries: BTreeMap<String, serde_json::Value>,
}

impl CoMap {
    /// Fold valid transactions into map content.
    pub fn from_transactions(txs: &[ValidTransaction]) -> Self {
        let mut map = CoMap::default();
        for tx in txs {
            for change in &tx.changes {
                match serde_json::from_value::<MapOp>(change.clone()) {
                    Ok(MapOp::Set { key, value }) => {
                        map.entries.insert(key, value);
                    }
                    Ok(MapOp::Del { key }) => {
                        map.entries.remove(&key);
                    }
                    Err(_) => {
                        debug!(session = %tx.session, tx.tx_index, "unrecognized map op, skipping");
                    }
                }
            }
        }
        map
    }

    /// Look up a key.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.entries.get(key)
    }

    /// All entries in key order.
    pub fn entries(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.entries.iter()
    }

    /// Keys in order.
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Is the map empty?
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One slot of a list: its op reference, current value, and tombstone.
///
/// Deleted slots stay in place so later inserts can still anchor on them.
#[derive(Debug, Clone, PartialEq)]
pub struct ListEntry {
    pub op_ref: String,
    pub value: serde_json::Value,
    pub deleted: bool,
}

/// Materialized list content with insert-after addressing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoList {
    slots: Vec<ListEntry>,
}

impl CoList {
    /// Fold valid transactions into list content.
    pub fn from_transactions(txs: &[ValidTransaction]) -> Self {
        let mut list = CoList::default();
        for tx in txs {
            for (change_index, change) in tx.changes.iter().enumerate() {
                match serde_json::from_value::<ListOp>(change.clone()) {
                    Ok(ListOp::Ins { after, value }) => {
                        let slot = ListEntry {
                            op_ref: op_ref(&tx.session, tx.tx_index, change_index as u64),
                            value,
                            deleted: false,
                        };
                        let pos = if after == LIST_START {
                            0
                        } else {
                            match list.slots.iter().position(|s| s.op_ref == after) {
                                Some(anchor) => anchor + 1,
                                None => {
                                    debug!(session = %tx.session, tx.tx_index, "list anchor not found, skipping insert");
                                    continue;
                                }
                            }
                        };
                        list.slots.insert(pos, slot);
                    }
                    Ok(ListOp::Del { target }) => {
                        if let Some(slot) = list.slots.iter_mut().find(|s| s.op_ref == target) {
                            slot.deleted = true;
                        }
                    }
                    Err(_) => {
                        debug!(session = %tx.session, tx.tx_index, "unrecognized list op, skipping");
                    }
                }
            }
        }
        list
    }

    /// Live values in list order.
    pub fn to_vec(&self) -> Vec<&serde_json::Value> {
        self.slots
            .iter()
            .filter(|s| !s.deleted)
            .map(|s| &s.value)
            .collect()
    }

    /// All slots, tombstones included.
    pub fn slots(&self) -> &[ListEntry] {
        &self.slots
    }

    /// The op reference of the `index`-th live element.
    pub fn ref_at(&self, index: usize) -> Option<&str> {
        self.slots
            .iter()
            .filter(|s| !s.deleted)
            .nth(index)
            .map(|s| s.op_ref.as_str())
    }

    /// Number of live elements.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| !s.deleted).count()
    }

    /// Is the list empty?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One appended stream item.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamItem {
    pub made_at: i64,
    pub value: serde_json::Value,
}

/// Materialized stream content: per-session append-only item lists.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoStream {
    streams: BTreeMap<SessionId, Vec<StreamItem>>,
}

impl CoStream {
    /// Fold valid transactions into stream content.
    pub fn from_transactions(txs: &[ValidTransaction]) -> Self {
        let mut stream = CoStream::default();
        for tx in txs {
            for change in &tx.changes {
                match serde_json::from_value::<StreamOp>(change.clone()) {
                    Ok(StreamOp::Push { value }) => {
                        stream
                            .streams
                            .entry(tx.session.clone())
                            .or_default()
                            .push(StreamItem {
                                made_at: tx.made_at,
                                value,
                            });
                    }
                    Err(_) => {
                        debug!(session = %tx.session, tx.tx_index, "unrecognized stream op, skipping");
                    }
                }
            }
        }
        stream
    }

    /// Items of one session's stream.
    pub fn session_items(&self, session: &SessionId) -> &[StreamItem] {
        self.streams.get(session).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All sessions with items.
    pub fn sessions(&self) -> impl Iterator<Item = (&SessionId, &Vec<StreamItem>)> {
        self.streams.iter()
    }

    /// Total item count across sessions.
    pub fn len(&self) -> usize {
        self.streams.values().map(Vec::len).sum()
    }

    /// Is the stream empty?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{CoId, PrincipalId};
    use crate::transaction::Privacy;
    use serde_json::json;

    fn sid(n: u8) -> SessionId {
        SessionId::with_nonce(PrincipalId::Account(CoId::from_bytes([n; 32])), [0; 8])
    }

    fn vtx(session: SessionId, tx_index: u64, made_at: i64, changes: Vec<serde_json::Value>) -> ValidTransaction {
        ValidTransaction {
            author: session.owner.clone(),
            session,
            tx_index,
            made_at,
            privacy: Privacy::Trusting,
            changes,
        }
    }

    #[test]
    fn test_map_last_writer_wins() {
        let txs = vec![
            vtx(sid(1), 0, 1, vec![MapOp::set("name", json!("a"))]),
            vtx(sid(2), 0, 2, vec![MapOp::set("name", json!("b"))]),
        ];
        let map = CoMap::from_transactions(&txs);
        assert_eq!(map.get("name"), Some(&json!("b")));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_map_delete() {
        let txs = vec![
            vtx(sid(1), 0, 1, vec![MapOp::set("a", json!(1)), MapOp::set("b", json!(2))]),
            vtx(sid(1), 1, 2, vec![MapOp::del("a")]),
        ];
        let map = CoMap::from_transactions(&txs);
        assert_eq!(map.get("a"), None);
        assert_eq!(map.get("b"), Some(&json!(2)));
    }

    #[test]
    fn test_list_insert_after() {
        let s = sid(1);
        let first = op_ref(&s, 0, 0);
        let txs = vec![
            vtx(s.clone(), 0, 1, vec![ListOp::ins(LIST_START, json!("a"))]),
            vtx(s.clone(), 1, 2, vec![ListOp::ins(&first, json!("b"))]),
            vtx(s.clone(), 2, 3, vec![ListOp::ins(&first, json!("c"))]),
        ];
        let list = CoList::from_transactions(&txs);
        // "c" lands directly after "a", pushing "b" right.
        assert_eq!(list.to_vec(), vec![&json!("a"), &json!("c"), &json!("b")]);
    }

    #[test]
    fn test_list_delete_keeps_anchor() {
        let s = sid(1);
        let first = op_ref(&s, 0, 0);
        let txs = vec![
            vtx(s.clone(), 0, 1, vec![ListOp::ins(LIST_START, json!("a"))]),
            vtx(s.clone(), 1, 2, vec![ListOp::del(&first)]),
            vtx(s.clone(), 2, 3, vec![ListOp::ins(&first, json!("b"))]),
        ];
        let list = CoList::from_transactions(&txs);
        // The tombstoned "a" still anchors the insert of "b".
        assert_eq!(list.to_vec(), vec![&json!("b")]);
        assert_eq!(list.slots().len(), 2);
    }

    #[test]
    fn test_stream_per_session() {
        let txs = vec![
            vtx(sid(1), 0, 1, vec![StreamOp::push(json!("x"))]),
            vtx(sid(2), 0, 2, vec![StreamOp::push(json!("y"))]),
            vtx(sid(1), 1, 3, vec![StreamOp::push(json!("z"))]),
        ];
        let stream = CoStream::from_transactions(&txs);
        assert_eq!(stream.len(), 3);
        assert_eq!(stream.session_items(&sid(1)).len(), 2);
        assert_eq!(stream.session_items(&sid(1))[1].value, json!("z"));
        assert_eq!(stream.session_items(&sid(2))[0].made_at, 2);
    }

    #[test]
    fn test_unknown_ops_skipped() {
        let txs = vec![vtx(sid(1), 0, 1, vec![json!({"op": "frobnicate"})])];
        assert!(CoMap::from_transactions(&txs).is_empty());
        assert!(CoList::from_transactions(&txs).is_empty());
        assert!(CoStream::from_transactions(&txs).is_empty());
    }
}
