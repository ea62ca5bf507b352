//! LocalNode: the per-account runtime.
//!
//! Owns the covalue store, the controlled account's keys, and the peer
//! connections. All state mutation runs to completion under one lock;
//! network and storage I/O suspends between messages, so one peer's
//! traffic never blocks another's.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};
use tracing::warn;

use weft_core::{
    AgentId, AgentSecret, AllowAll, CoId, CoList, CoMap, CoStream, CoValueCore, CoValueHeader,
    CoValueKind, NoKeys, PrincipalId, Ruleset, SessionId, ValidTransaction, WritePrivacy,
};
use weft_perms::{
    GroupKeys, GroupMutator, GroupView, InviteSecret, OwnedByGroupValidator, PermError, Role,
};
use weft_sync::{run_peer_loop, Peer, PeerId, PeerRole, SyncManager};

use crate::error::{NodeError, Result};
use crate::store::{agent_from_header, Listener, NodeStore};

/// How long to wait on each peer during a load before trying the next.
pub const DEFAULT_LOAD_TIMEOUT: Duration = Duration::from_secs(2);

/// An account id plus the agent secret controlling it.
#[derive(Clone)]
pub struct AccountCredentials {
    pub id: CoId,
    pub secret: AgentSecret,
}

/// The process-wide context for one account.
pub struct LocalNode {
    account: CoId,
    me: PrincipalId,
    secret: AgentSecret,
    /// This node's single writing session, used for every covalue.
    session: SessionId,
    manager: Arc<Mutex<SyncManager<NodeStore>>>,
    load_timeout: Duration,
}

fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time went backwards")
        .as_millis() as i64
}

impl LocalNode {
    /// Bare construction from credentials: no peers, nothing loaded.
    /// Most callers want [`LocalNode::with_new_account`] or
    /// [`LocalNode::with_loaded_account`] instead.
    pub fn new(credentials: AccountCredentials) -> Self {
        let me = PrincipalId::Account(credentials.id);
        let mut store = NodeStore::new();
        store.register_account(credentials.id, AgentId::of(&credentials.secret));
        Self {
            account: credentials.id,
            me: me.clone(),
            secret: credentials.secret,
            session: SessionId::generate(me),
            manager: Arc::new(Mutex::new(SyncManager::new(store))),
            load_timeout: DEFAULT_LOAD_TIMEOUT,
        }
    }

    /// Create a brand new account: the account group (carrying the agent
    /// in its header meta), plus a profile group and profile map.
    ///
    /// The profile is created before the account is wired to any peers,
    /// so callers must run [`LocalNode::resync_all`] once peers are
    /// attached; the first sync pass alone does not cover it.
    pub async fn with_new_account(name: &str) -> Result<(Self, AccountCredentials)> {
        let secret = AgentSecret::generate();
        let agent = AgentId::of(&secret);
        let now = now_millis();

        let header = CoValueHeader::new(
            CoValueKind::Map,
            Ruleset::Group,
            Some(json!({ "agent": agent.to_string(), "name": name })),
            now,
        );
        let account_id = header.id();
        let credentials = AccountCredentials {
            id: account_id,
            secret,
        };
        let node = Self::new(credentials.clone());

        {
            let mut mgr = node.manager.lock().await;
            let mut core = CoValueCore::new(header);
            {
                let mut mutator = GroupMutator::new(
                    &mut core,
                    node.session.clone(),
                    node.secret.signer(),
                    node.secret.sealer(),
                    node.me.clone(),
                )?;
                mutator.initialize(now)?;
            }
            mgr.source_mut().insert_core(core);
        }

        let profile_group = node.create_group().await?;
        let profile = node
            .create_covalue(CoValueKind::Map, Some(&profile_group))
            .await?;

        {
            let mut mgr = node.manager.lock().await;
            let session = node.session.clone();
            let signer = node.secret.signer().clone();
            let sealer = node.secret.sealer().clone();
            let me = node.me.clone();
            mgr.source_mut().with_core_mut(&account_id, |core, _| {
                let mut mutator = GroupMutator::new(core, session, &signer, &sealer, me)?;
                mutator.set_extra("profile", json!(profile.to_string()), now_millis())?;
                Ok(())
            })?;
            mgr.broadcast(&account_id, None).await?;
        }

        Ok((node, credentials))
    }

    /// Load an existing account through the given peers.
    pub async fn with_loaded_account(
        credentials: AccountCredentials,
        peers: Vec<Peer>,
    ) -> Result<Self> {
        let node = Self::new(credentials.clone());
        for peer in peers {
            node.add_peer(peer).await;
        }
        node.load(&credentials.id).await?;

        {
            let mgr = node.manager.lock().await;
            let core = mgr
                .source()
                .core(&credentials.id)
                .ok_or(NodeError::Unavailable(credentials.id))?;
            let header_agent = agent_from_header(core.header())
                .ok_or(NodeError::CredentialMismatch(credentials.id))?;
            if header_agent != AgentId::of(&credentials.secret) {
                return Err(NodeError::CredentialMismatch(credentials.id));
            }
        }

        // Account wiring completes only after this second pass; the
        // profile group exists before the account knows its peers.
        node.resync_all().await?;
        Ok(node)
    }

    /// This node's account id.
    pub fn account(&self) -> &CoId {
        &self.account
    }

    /// This node's principal.
    pub fn principal(&self) -> &PrincipalId {
        &self.me
    }

    /// This node's writing session.
    pub fn session(&self) -> &SessionId {
        &self.session
    }

    /// Override the per-peer load timeout.
    pub fn set_load_timeout(&mut self, timeout: Duration) {
        self.load_timeout = timeout;
    }

    /// Attach a peer: register its outgoing queue and spawn the loop
    /// draining its incoming stream.
    pub async fn add_peer(&self, peer: Peer) {
        let mut mgr = self.manager.lock().await;
        mgr.add_peer(peer.id.clone(), peer.role, peer.priority, peer.outgoing);
        tokio::spawn(run_peer_loop(
            Arc::clone(&self.manager),
            peer.id,
            peer.incoming,
        ));
    }

    /// Create a fresh group with this account as its sole admin.
    pub async fn create_group(&self) -> Result<CoId> {
        let mut mgr = self.manager.lock().await;
        let now = now_millis();
        let header = CoValueHeader::new(CoValueKind::Map, Ruleset::Group, None, now);
        let id = header.id();
        let mut core = CoValueCore::new(header);
        {
            let mut mutator = GroupMutator::new(
                &mut core,
                self.session.clone(),
                self.secret.signer(),
                self.secret.sealer(),
                self.me.clone(),
            )?;
            mutator.initialize(now)?;
        }
        mgr.source_mut().insert_core(core);
        mgr.broadcast(&id, None).await?;
        Ok(id)
    }

    /// Create a covalue, optionally owned by a group.
    pub async fn create_covalue(&self, kind: CoValueKind, group: Option<&CoId>) -> Result<CoId> {
        let mut mgr = self.manager.lock().await;
        let ruleset = match group {
            Some(group) => Ruleset::OwnedByGroup { group: *group },
            None => Ruleset::UnsafeAllowAll,
        };
        let header = CoValueHeader::new(kind, ruleset, None, now_millis());
        let id = header.id();
        mgr.source_mut().insert_core(CoValueCore::new(header));
        mgr.broadcast(&id, None).await?;
        Ok(id)
    }

    /// Is this covalue resident?
    pub async fn is_available(&self, id: &CoId) -> bool {
        let mgr = self.manager.lock().await;
        mgr.source().core(id).is_some()
    }

    /// Load a covalue, asking server and storage peers in priority
    /// order. Resolves `Unavailable` only after every peer has been
    /// exhausted; retrying is the caller's decision.
    pub async fn load(&self, id: &CoId) -> Result<()> {
        let (peers, changed) = {
            let mut mgr = self.manager.lock().await;
            if mgr.source().core(id).is_some() {
                return Ok(());
            }
            mgr.source_mut().mark_loading(*id);
            // Clients never serve loads; storage and server peers do,
            // best first.
            let peers: Vec<PeerId> = mgr
                .peers_by_priority()
                .into_iter()
                .filter(|peer| mgr.peer_role(peer) != Some(PeerRole::Client))
                .collect();
            (peers, mgr.source().changed.clone())
        };

        for peer in peers {
            {
                let mut mgr = self.manager.lock().await;
                if mgr.source().core(id).is_some() {
                    return Ok(());
                }
                if let Err(e) = mgr.request_load(id, &peer).await {
                    warn!(peer = %peer, id = %id, error = %e, "load request failed");
                    continue;
                }
            }

            let deadline = Instant::now() + self.load_timeout;
            loop {
                let notified = changed.notified();
                {
                    let mgr = self.manager.lock().await;
                    if mgr.source().core(id).is_some() {
                        return Ok(());
                    }
                }
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() || timeout(remaining, notified).await.is_err() {
                    break;
                }
            }
        }

        let mut mgr = self.manager.lock().await;
        if mgr.source().core(id).is_some() {
            return Ok(());
        }
        mgr.source_mut().mark_unavailable(*id);
        Err(NodeError::Unavailable(*id))
    }

    /// Load (if needed) and register a change listener. The listener
    /// fires synchronously on the current state before this returns, so
    /// no initial state is missed.
    pub async fn subscribe(
        &self,
        id: &CoId,
        listener: impl FnMut(&CoValueCore) + Send + 'static,
    ) -> Result<u64> {
        self.load(id).await?;
        let mut mgr = self.manager.lock().await;
        let mut listener: Listener = Box::new(listener);
        {
            let core = mgr.source().core(id).ok_or(NodeError::NotLoaded(*id))?;
            listener(core);
        }
        let token = mgr.source_mut().add_listener(*id, listener);
        // Peers may have been told `done` by an earlier unsubscribe.
        mgr.announce_interest(id).await;
        Ok(token)
    }

    /// Remove a listener registered by [`LocalNode::subscribe`]. When the
    /// last listener for a covalue goes away, peers are told `done` so
    /// they stop pushing it until interest renews.
    pub async fn unsubscribe(&self, id: &CoId, token: u64) {
        let mut mgr = self.manager.lock().await;
        mgr.source_mut().remove_listener(id, token);
        if !mgr.source().has_listeners(id) {
            mgr.announce_done(id).await;
        }
    }

    /// Append changes to a covalue and push them to all peers.
    ///
    /// Group-owned covalues write privately under the group's current
    /// read key; a member without the key fails here, before anything is
    /// written.
    pub async fn edit(&self, id: &CoId, changes: Vec<serde_json::Value>) -> Result<()> {
        let mut mgr = self.manager.lock().await;
        let now = now_millis();
        let session = self.session.clone();
        let signer = self.secret.signer().clone();
        let sealer = self.secret.sealer().clone();
        let me = self.me.clone();

        mgr.source_mut().with_core_mut(id, |core, store| {
            let privacy = match &core.header().ruleset {
                Ruleset::OwnedByGroup { group } => {
                    let view = store.group(group)?;
                    let key_id = view.current_read_key().ok_or(PermError::NoReadKey)?;
                    let key = view
                        .resolve_key(&key_id, &me, &sealer)
                        .ok_or(PermError::KeyUnavailable(key_id))?;
                    WritePrivacy::Private { key_id, key }
                }
                _ => WritePrivacy::Trusting,
            };
            core.make_transaction(&session, &signer, now, changes, privacy)
                .map_err(NodeError::from)?;
            Ok(())
        })?;

        mgr.broadcast(id, None).await?;
        Ok(())
    }

    fn valid_transactions(
        &self,
        store: &NodeStore,
        core: &CoValueCore,
    ) -> Result<Vec<ValidTransaction>> {
        match &core.header().ruleset {
            Ruleset::OwnedByGroup { group } => {
                let view = store.group(group)?;
                let keys = GroupKeys {
                    view: &view,
                    me: self.me.clone(),
                    sealer: self.secret.sealer(),
                };
                let validator = OwnedByGroupValidator {
                    group: &view,
                    groups: store,
                };
                Ok(core.valid_sorted_transactions(&keys, &validator))
            }
            _ => Ok(core.valid_sorted_transactions(&NoKeys, &AllowAll)),
        }
    }

    /// Materialize a map covalue.
    pub async fn map_of(&self, id: &CoId) -> Result<CoMap> {
        let mgr = self.manager.lock().await;
        let store = mgr.source();
        let core = store.core(id).ok_or(NodeError::NotLoaded(*id))?;
        if core.header().kind != CoValueKind::Map {
            return Err(NodeError::WrongKind(*id));
        }
        Ok(CoMap::from_transactions(&self.valid_transactions(store, core)?))
    }

    /// Materialize a list covalue.
    pub async fn list_of(&self, id: &CoId) -> Result<CoList> {
        let mgr = self.manager.lock().await;
        let store = mgr.source();
        let core = store.core(id).ok_or(NodeError::NotLoaded(*id))?;
        if core.header().kind != CoValueKind::List {
            return Err(NodeError::WrongKind(*id));
        }
        Ok(CoList::from_transactions(&self.valid_transactions(store, core)?))
    }

    /// Materialize a stream covalue.
    pub async fn stream_of(&self, id: &CoId) -> Result<CoStream> {
        let mgr = self.manager.lock().await;
        let store = mgr.source();
        let core = store.core(id).ok_or(NodeError::NotLoaded(*id))?;
        if core.header().kind != CoValueKind::Stream {
            return Err(NodeError::WrongKind(*id));
        }
        Ok(CoStream::from_transactions(
            &self.valid_transactions(store, core)?,
        ))
    }

    /// Fold a group's current permission state.
    pub async fn group_view(&self, id: &CoId) -> Result<GroupView> {
        let mgr = self.manager.lock().await;
        mgr.source().group(id)
    }

    /// Grant a role in a group we administer.
    pub async fn add_member(
        &self,
        group: &CoId,
        member: PrincipalId,
        role: Role,
    ) -> Result<()> {
        let mut mgr = self.manager.lock().await;
        let now = now_millis();
        let session = self.session.clone();
        let signer = self.secret.signer().clone();
        let sealer = self.secret.sealer().clone();
        let me = self.me.clone();
        mgr.source_mut().with_core_mut(group, |core, store| {
            let mut mutator = GroupMutator::new(core, session, &signer, &sealer, me)?;
            mutator.add_member(member, role, store, now)?;
            Ok(())
        })?;
        mgr.broadcast(group, None).await?;
        Ok(())
    }

    /// Revoke a member, rotate the read key, and recursively rotate
    /// every resident child group we administer.
    pub async fn remove_member(&self, group: &CoId, member: &PrincipalId) -> Result<()> {
        let mut mgr = self.manager.lock().await;
        let now = now_millis();
        let session = self.session.clone();
        let signer = self.secret.signer().clone();
        let sealer = self.secret.sealer().clone();
        let me = self.me.clone();

        let mut pending: Vec<CoId> = Vec::new();
        {
            let member = member.clone();
            let (session, signer, sealer, me) =
                (session.clone(), signer.clone(), sealer.clone(), me.clone());
            mgr.source_mut().with_core_mut(group, |core, store| {
                let mut mutator = GroupMutator::new(core, session, &signer, &sealer, me)?;
                let rotation = mutator.remove_member(&member, store, now)?;
                pending = rotation.children;
                Ok(())
            })?;
        }
        mgr.broadcast(group, None).await?;

        let mut visited: BTreeSet<CoId> = BTreeSet::new();
        visited.insert(*group);
        while let Some(child) = pending.pop() {
            if !visited.insert(child) {
                continue;
            }
            let (session, signer, sealer, me) =
                (session.clone(), signer.clone(), sealer.clone(), me.clone());
            let rotated = mgr.source_mut().with_core_mut(&child, |core, store| {
                let mut mutator = GroupMutator::new(core, session, &signer, &sealer, me)?;
                Ok(mutator.rotate_read_key(store, now)?)
            });
            match rotated {
                Ok(rotation) => {
                    pending.extend(rotation.children);
                    mgr.broadcast(&child, None).await?;
                }
                Err(e) => {
                    warn!(group = %child, error = %e, "cannot rotate child group");
                }
            }
        }
        Ok(())
    }

    /// Mint an invite for a group we administer.
    pub async fn create_invite(&self, group: &CoId, role: Role) -> Result<InviteSecret> {
        let mut mgr = self.manager.lock().await;
        let now = now_millis();
        let session = self.session.clone();
        let signer = self.secret.signer().clone();
        let sealer = self.secret.sealer().clone();
        let me = self.me.clone();
        let invite = mgr.source_mut().with_core_mut(group, |core, _| {
            let mut mutator = GroupMutator::new(core, session, &signer, &sealer, me)?;
            Ok(mutator.create_invite(role, now)?)
        })?;
        mgr.broadcast(group, None).await?;
        Ok(invite)
    }

    /// Accept an invite: re-derive the invite agent from the secret,
    /// write the acceptance with its identity, and take the concrete
    /// role for this account. An existing better role stays.
    pub async fn accept_invite(&self, group: &CoId, secret: &InviteSecret) -> Result<Role> {
        self.load(group).await?;
        let mut mgr = self.manager.lock().await;
        let now = now_millis();

        let invite_agent = secret.agent_secret();
        let invite_principal = PrincipalId::Agent(secret.agent_id());
        let invite_session = SessionId::generate(invite_principal.clone());
        let me = self.me.clone();
        let my_sealer = self.secret.sealer().public();

        let role = mgr.source_mut().with_core_mut(group, |core, _| {
            let mut mutator = GroupMutator::new(
                core,
                invite_session,
                invite_agent.signer(),
                invite_agent.sealer(),
                invite_principal,
            )?;
            Ok(mutator.accept_invite(me, my_sealer, now)?)
        })?;
        mgr.broadcast(group, None).await?;
        Ok(role)
    }

    /// Push every resident covalue to all peers again.
    pub async fn resync_all(&self) -> Result<()> {
        let ids: Vec<CoId> = {
            let mgr = self.manager.lock().await;
            mgr.source().available_ids()
        };
        for id in ids {
            let mut mgr = self.manager.lock().await;
            mgr.broadcast(&id, None).await?;
        }
        Ok(())
    }

    /// Direct access to the sync manager (tests, advanced wiring).
    pub fn manager(&self) -> &Arc<Mutex<SyncManager<NodeStore>>> {
        &self.manager
    }

    /// Attach a storage backend as a peer and return its join handle.
    pub async fn add_storage<B: weft_store::StorageBackend + 'static>(
        &self,
        name: &str,
        backend: Arc<B>,
    ) -> tokio::task::JoinHandle<()> {
        let (node_side, storage_side) = weft_sync::connected_peer_pair(
            PeerId::new(format!("{name}-node")),
            PeerRole::Client,
            PeerId::new(name),
            PeerRole::Storage,
        );
        let handle =
            weft_store::spawn_storage_peer(backend, storage_side.incoming, storage_side.outgoing);
        self.add_peer(node_side).await;
        handle
    }
}
