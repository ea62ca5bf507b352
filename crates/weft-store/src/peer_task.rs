//! The storage peer: a task speaking the sync protocol over a backend.
//!
//! Storage is just another peer. It answers `load` with its chunk (as
//! content messages plus a `known` state), persists incoming `content`,
//! and corrects misaligned pushes the same way a network peer would.
//! Backend failures are logged and reported as state, never panicked
//! across the sync boundary.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use weft_core::{CoId, KnownState, NewContent};
use weft_sync::{PeerEvent, SyncMessage};

use crate::traits::StorageBackend;

/// Spawn the storage peer loop over a backend.
///
/// `incoming` carries the node's messages to storage; replies go out on
/// `outgoing`. A terminal signal or closed channel ends the loop.
pub fn spawn_storage_peer<B: StorageBackend + 'static>(
    backend: Arc<B>,
    mut incoming: mpsc::Receiver<PeerEvent>,
    outgoing: mpsc::Sender<PeerEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = incoming.recv().await {
            let message = match event {
                PeerEvent::Signal(signal) => {
                    debug!(?signal, "storage peer stream terminated");
                    return;
                }
                PeerEvent::Message(message) => message,
            };

            match handle_message(backend.as_ref(), message).await {
                Ok(replies) => {
                    for reply in replies {
                        if outgoing.send(reply.into()).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    // Storage degrades without taking the node down.
                    warn!(error = %e, "storage peer operation failed");
                }
            }
        }
    })
}

async fn handle_message<B: StorageBackend>(
    backend: &B,
    message: SyncMessage,
) -> crate::error::Result<Vec<SyncMessage>> {
    match message {
        SyncMessage::Load(known) => handle_load(backend, known).await,
        SyncMessage::Content(content) => handle_content(backend, content).await,
        // The node acknowledges what we send; nothing to do.
        SyncMessage::Known { .. } | SyncMessage::Done { .. } => Ok(Vec::new()),
    }
}

async fn handle_load<B: StorageBackend>(
    backend: &B,
    known: KnownState,
) -> crate::error::Result<Vec<SyncMessage>> {
    let mut replies = Vec::new();
    let mut visited = std::collections::BTreeSet::new();
    push_with_deps(backend, known.id, Some(&known), &mut visited, &mut replies).await?;
    Ok(replies)
}

/// Append one covalue's messages, its dependency closure first, so the
/// requester holds decryption keys and role data before the ciphertext.
async fn push_with_deps<B: StorageBackend>(
    backend: &B,
    id: CoId,
    known: Option<&KnownState>,
    visited: &mut std::collections::BTreeSet<CoId>,
    replies: &mut Vec<SyncMessage>,
) -> crate::error::Result<()> {
    if !visited.insert(id) {
        return Ok(());
    }

    let Some(chunk) = backend.load(&id).await? else {
        if known.is_some() {
            // Only the explicitly requested id warrants a "we have
            // nothing" answer.
            replies.push(SyncMessage::Known {
                known: KnownState::empty(id),
                is_correction: false,
            });
        }
        return Ok(());
    };

    for dep in chunk_dependencies(&chunk) {
        Box::pin(push_with_deps(backend, dep, None, visited, replies)).await?;
    }

    let state = chunk.known_state(id);
    replies.push(SyncMessage::Known {
        known: state,
        is_correction: false,
    });
    for mut content in chunk.to_contents(id) {
        if let Some(known) = known {
            trim_known(&mut content, known);
        }
        if !content.is_empty() {
            replies.push(SyncMessage::Content(content));
        }
    }
    Ok(())
}

/// Dependency ids of a stored chunk: the owning group, and for groups
/// every covalue referenced from their trusting transactions.
fn chunk_dependencies(chunk: &crate::chunk::CoValueChunk) -> Vec<CoId> {
    use weft_core::{MapOp, Ruleset};

    match chunk.header.as_ref().map(|h| &h.ruleset) {
        Some(Ruleset::OwnedByGroup { group }) => vec![*group],
        Some(Ruleset::Group) => {
            let mut deps = std::collections::BTreeSet::new();
            for entries in chunk.session_entries.values() {
                for entry in entries {
                    for tx in &entry.transactions {
                        let Some(changes) = tx.trusting_changes() else {
                            continue;
                        };
                        for change in changes {
                            let Ok(MapOp::Set { key, .. }) =
                                serde_json::from_value::<MapOp>(change.clone())
                            else {
                                continue;
                            };
                            let candidate = key
                                .strip_prefix("parent_")
                                .or_else(|| key.strip_prefix("child_"))
                                .unwrap_or(&key);
                            if let Ok(dep) = candidate.parse::<CoId>() {
                                deps.insert(dep);
                            }
                        }
                    }
                }
            }
            deps.into_iter().collect()
        }
        _ => Vec::new(),
    }
}

async fn handle_content<B: StorageBackend>(
    backend: &B,
    content: NewContent,
) -> crate::error::Result<Vec<SyncMessage>> {
    let id = content.id;
    let outcome = backend.store(&content).await?;

    let state = backend
        .known_state(&id)
        .await?
        .unwrap_or_else(|| KnownState::empty(id));
    Ok(vec![SyncMessage::Known {
        known: state,
        is_correction: outcome.invalid_assumptions,
    }])
}

/// Drop what the requester already declared from a content message.
fn trim_known(content: &mut NewContent, known: &KnownState) {
    if known.header {
        content.header = None;
    }
    content.new.retain(|session, entry| {
        let have = known.session_count(session);
        if have <= entry.after {
            return true;
        }
        let skip = (have - entry.after) as usize;
        if skip >= entry.new_transactions.len() {
            return false;
        }
        entry.new_transactions.drain(..skip);
        entry.after = have;
        true
    });
}
