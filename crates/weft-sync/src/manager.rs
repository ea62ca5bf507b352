//! The sync engine: known-state bookkeeping and minimal content diffs.
//!
//! One [`SyncManager`] serves all peers of a node. Each peer's incoming
//! stream is drained by its own task ([`run_peer_loop`]); handlers run to
//! completion under the manager lock, so state mutation is serialized
//! while I/O suspends between messages.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use weft_core::{
    AddError, ApplyOutcome, CoId, CoValueCore, KnownState, MapOp, NewContent, Ruleset,
};

use crate::error::{Result, SyncError};
use crate::messages::{PeerEvent, SyncMessage};
use crate::peer::{PeerId, PeerRole};

/// Access to the local collection of covalue cores.
///
/// Implemented by the node (and by test fixtures); the manager itself
/// never owns cores.
pub trait CoValueSource {
    /// Our known state for a covalue, if we hold it.
    fn known_state(&self, id: &CoId) -> Option<KnownState>;

    /// Content a peer with `known` still needs.
    fn new_content_since(&self, id: &CoId, known: Option<&KnownState>) -> Vec<NewContent>;

    /// Merge incoming content, creating the covalue if the header is new.
    fn apply_content(&mut self, content: &NewContent) -> std::result::Result<ApplyOutcome, AddError>;

    /// Covalues that must reach a peer before this one.
    fn dependencies(&self, id: &CoId) -> Vec<CoId>;
}

/// Extract the dependency ids of a core: the owning group for
/// group-owned values, and for groups every covalue referenced from
/// their trusting transactions (member accounts, parent and child
/// groups), so receivers can resolve roles before content arrives.
pub fn dependencies_of(core: &CoValueCore) -> Vec<CoId> {
    match &core.header().ruleset {
        Ruleset::OwnedByGroup { group } => vec![*group],
        Ruleset::Group => {
            let mut deps = BTreeSet::new();
            for (_, log) in core.sessions() {
                for tx in log.transactions() {
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
                        if let Ok(id) = candidate.parse::<CoId>() {
                            deps.insert(id);
                        }
                    }
                }
            }
            deps.into_iter().collect()
        }
        Ruleset::UnsafeAllowAll => Vec::new(),
    }
}

/// Whether a peer loop should keep running after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    Stop,
}

/// Per-peer bookkeeping: the outgoing queue and our (optimistic) picture
/// of what the peer holds.
pub struct PeerState {
    pub id: PeerId,
    pub role: PeerRole,
    pub priority: u8,
    outgoing: mpsc::Sender<PeerEvent>,
    known: HashMap<CoId, KnownState>,
    /// Covalues the peer declared `done` for; nothing is sent for these
    /// until the peer renews interest with a `load` or `known`.
    done: BTreeSet<CoId>,
}

impl PeerState {
    fn known_for(&self, id: &CoId) -> Option<&KnownState> {
        self.known.get(id)
    }

    fn set_known(&mut self, state: KnownState) {
        self.known.insert(state.id, state);
    }

    fn combine_known(&mut self, state: &KnownState) {
        self.known
            .entry(state.id)
            .or_insert_with(|| KnownState::empty(state.id))
            .combine(state);
    }
}

/// The wire protocol engine for one node.
pub struct SyncManager<S> {
    source: S,
    peers: HashMap<PeerId, PeerState>,
}

impl<S: CoValueSource> SyncManager<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            peers: HashMap::new(),
        }
    }

    /// The underlying covalue source.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Mutable access to the source (local edits go through here).
    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Register a peer's outgoing queue.
    pub fn add_peer(
        &mut self,
        id: PeerId,
        role: PeerRole,
        priority: u8,
        outgoing: mpsc::Sender<PeerEvent>,
    ) {
        self.peers.insert(
            id.clone(),
            PeerState {
                id,
                role,
                priority,
                outgoing,
                known: HashMap::new(),
                done: BTreeSet::new(),
            },
        );
    }

    /// Forget a peer entirely.
    pub fn remove_peer(&mut self, id: &PeerId) {
        self.peers.remove(id);
    }

    /// Peer ids ordered by descending priority.
    pub fn peers_by_priority(&self) -> Vec<PeerId> {
        let mut ids: Vec<(u8, PeerId)> = self
            .peers
            .values()
            .map(|p| (p.priority, p.id.clone()))
            .collect();
        ids.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// Ids of peers with a given role, by descending priority.
    pub fn peers_with_role(&self, role: PeerRole) -> Vec<PeerId> {
        self.peers_by_priority()
            .into_iter()
            .filter(|id| self.peers.get(id).is_some_and(|p| p.role == role))
            .collect()
    }

    /// The role of a registered peer.
    pub fn peer_role(&self, id: &PeerId) -> Option<PeerRole> {
        self.peers.get(id).map(|p| p.role)
    }

    async fn send_to(&mut self, peer_id: &PeerId, msg: SyncMessage) -> Result<()> {
        let peer = self
            .peers
            .get(peer_id)
            .ok_or_else(|| SyncError::UnknownPeer(peer_id.clone()))?;
        peer.outgoing
            .send(msg.into())
            .await
            .map_err(|_| SyncError::PeerGone(peer_id.clone()))
    }

    /// Process one event from a peer's incoming stream.
    pub async fn handle_event(&mut self, from: &PeerId, event: PeerEvent) -> Result<LoopControl> {
        match event {
            PeerEvent::Signal(signal) => {
                debug!(peer = %from, ?signal, "peer stream terminated");
                self.remove_peer(from);
                Ok(LoopControl::Stop)
            }
            PeerEvent::Message(msg) => {
                debug!(peer = %from, id = %msg.co_id(), "handling sync message");
                match msg {
                    SyncMessage::Load(known) => self.handle_load(from, known).await?,
                    SyncMessage::Known {
                        known,
                        is_correction,
                    } => self.handle_known(from, known, is_correction).await?,
                    SyncMessage::Content(content) => {
                        self.handle_content(from, content).await?
                    }
                    SyncMessage::Done { id } => self.handle_done(from, &id),
                }
                Ok(LoopControl::Continue)
            }
        }
    }

    /// A peer asks for a covalue, declaring its state.
    async fn handle_load(&mut self, from: &PeerId, known: KnownState) -> Result<()> {
        let id = known.id;
        if let Some(peer) = self.peers.get_mut(from) {
            peer.done.remove(&id);
            peer.set_known(known);
        }
        self.send_covalue(&id, from, &mut BTreeSet::new()).await
    }

    /// A peer declares (or corrects) its state.
    async fn handle_known(
        &mut self,
        from: &PeerId,
        known: KnownState,
        is_correction: bool,
    ) -> Result<()> {
        let id = known.id;
        if let Some(peer) = self.peers.get_mut(from) {
            peer.done.remove(&id);
            if is_correction {
                // Our optimism was wrong; take the peer's word verbatim.
                peer.set_known(known);
            } else {
                peer.combine_known(&known);
            }
        }

        if is_correction {
            self.send_covalue(&id, from, &mut BTreeSet::new()).await?;
        } else {
            self.send_content_diff(&id, from).await?;
        }
        Ok(())
    }

    /// A peer pushes content at us.
    async fn handle_content(&mut self, from: &PeerId, content: NewContent) -> Result<()> {
        let id = content.id;

        let outcome = match self.source.apply_content(&content) {
            Ok(outcome) => outcome,
            Err(e) => {
                // Cryptographic integrity failure: reject outright and
                // tell the peer where we actually stand.
                warn!(peer = %from, id = %id, error = %e, "rejected incoming content");
                if let Some(state) = self.source.known_state(&id) {
                    self.send_to(
                        from,
                        SyncMessage::Known {
                            known: state,
                            is_correction: false,
                        },
                    )
                    .await?;
                }
                return Ok(());
            }
        };

        if outcome.invalid_assumptions {
            let state = self
                .source
                .known_state(&id)
                .unwrap_or_else(|| KnownState::empty(id));
            self.send_to(
                from,
                SyncMessage::Known {
                    known: state,
                    is_correction: true,
                },
            )
            .await?;
            return Ok(());
        }

        // The sender evidently holds what it sent.
        if let Some(sent_state) = content_implied_state(&content) {
            if let Some(peer) = self.peers.get_mut(from) {
                peer.combine_known(&sent_state);
            }
        }

        // Acknowledge our new state.
        if let Some(state) = self.source.known_state(&id) {
            self.send_to(
                from,
                SyncMessage::Known {
                    known: state,
                    is_correction: false,
                },
            )
            .await?;
        }

        // Fan the news out to everyone else.
        if outcome.applied_any {
            self.broadcast(&id, Some(from)).await?;
        }
        Ok(())
    }

    fn handle_done(&mut self, from: &PeerId, id: &CoId) {
        if let Some(peer) = self.peers.get_mut(from) {
            peer.done.insert(*id);
        }
    }

    /// Tell every peer we need no further messages for this covalue.
    pub async fn announce_done(&mut self, id: &CoId) {
        for peer_id in self.peers_by_priority() {
            if let Err(e) = self.send_to(&peer_id, SyncMessage::Done { id: *id }).await {
                warn!(peer = %peer_id, id = %id, error = %e, "done announcement failed");
            }
        }
    }

    /// Declare our state for a covalue to every peer, undoing an earlier
    /// `done` and prompting anyone ahead of us to send the difference.
    pub async fn announce_interest(&mut self, id: &CoId) {
        let state = self
            .source
            .known_state(id)
            .unwrap_or_else(|| KnownState::empty(*id));
        for peer_id in self.peers_by_priority() {
            let known = SyncMessage::Known {
                known: state.clone(),
                is_correction: false,
            };
            if let Err(e) = self.send_to(&peer_id, known).await {
                warn!(peer = %peer_id, id = %id, error = %e, "interest announcement failed");
            }
        }
    }

    /// Ask a peer for a covalue, declaring what we already hold.
    pub async fn request_load(&mut self, id: &CoId, from: &PeerId) -> Result<()> {
        let known = self
            .source
            .known_state(id)
            .unwrap_or_else(|| KnownState::empty(*id));
        self.send_to(from, SyncMessage::Load(known)).await
    }

    /// Push a covalue (dependencies first) to every peer.
    pub async fn broadcast(&mut self, id: &CoId, except: Option<&PeerId>) -> Result<()> {
        for peer_id in self.peers_by_priority() {
            if Some(&peer_id) == except {
                continue;
            }
            if let Err(e) = self.send_covalue(id, &peer_id, &mut BTreeSet::new()).await {
                warn!(peer = %peer_id, id = %id, error = %e, "broadcast failed, dropping peer");
                self.remove_peer(&peer_id);
            }
        }
        Ok(())
    }

    /// Send one covalue to one peer, syncing its dependency closure
    /// first so decryption keys and role information always precede the
    /// ciphertext that needs them.
    async fn send_covalue(
        &mut self,
        id: &CoId,
        to: &PeerId,
        visiting: &mut BTreeSet<CoId>,
    ) -> Result<()> {
        if !visiting.insert(*id) {
            return Ok(());
        }
        if self
            .peers
            .get(to)
            .is_some_and(|peer| peer.done.contains(id))
        {
            return Ok(());
        }

        for dep in self.source.dependencies(id) {
            Box::pin(self.send_covalue(&dep, to, visiting)).await?;
        }

        let Some(our_state) = self.source.known_state(id) else {
            // We hold nothing; say so, so the peer can try elsewhere.
            self.send_to(
                to,
                SyncMessage::Known {
                    known: KnownState::empty(*id),
                    is_correction: false,
                },
            )
            .await?;
            return Ok(());
        };

        self.send_to(
            to,
            SyncMessage::Known {
                known: our_state,
                is_correction: false,
            },
        )
        .await?;
        self.send_content_diff(id, to).await
    }

    /// Send just the missing content pieces for one covalue.
    async fn send_content_diff(&mut self, id: &CoId, to: &PeerId) -> Result<()> {
        let peer_known = self
            .peers
            .get(to)
            .and_then(|p| p.known_for(id))
            .cloned();
        let pieces = self.source.new_content_since(id, peer_known.as_ref());

        if pieces.is_empty() {
            return Ok(());
        }

        for piece in pieces {
            if !piece.is_empty() {
                self.send_to(to, SyncMessage::Content(piece)).await?;
            }
            // Let other peer loops make progress between pieces.
            tokio::task::yield_now().await;
        }

        // Optimistically assume the peer now has everything we do.
        if let Some(state) = self.source.known_state(id) {
            if let Some(peer) = self.peers.get_mut(to) {
                peer.combine_known(&state);
            }
        }
        Ok(())
    }
}

/// The state a peer provably holds after sending this content.
fn content_implied_state(content: &NewContent) -> Option<KnownState> {
    let mut state = KnownState::empty(content.id);
    state.header = content.header.is_some();
    for (session, entry) in &content.new {
        state.sessions.insert(
            session.clone(),
            entry.after + entry.new_transactions.len() as u64,
        );
    }
    (state.header || !state.sessions.is_empty()).then_some(state)
}

/// Drain one peer's incoming stream until it ends or signals.
///
/// Each peer gets its own task; a disconnect stops only this loop.
pub async fn run_peer_loop<S: CoValueSource + Send + 'static>(
    manager: Arc<Mutex<SyncManager<S>>>,
    peer_id: PeerId,
    mut incoming: mpsc::Receiver<PeerEvent>,
) {
    while let Some(event) = incoming.recv().await {
        let mut mgr = manager.lock().await;
        match mgr.handle_event(&peer_id, event).await {
            Ok(LoopControl::Continue) => {}
            Ok(LoopControl::Stop) => return,
            Err(e) => {
                warn!(peer = %peer_id, error = %e, "peer loop error, stopping");
                mgr.remove_peer(&peer_id);
                return;
            }
        }
    }
    manager.lock().await.remove_peer(&peer_id);
}
