//! The in-memory covalue store behind a node.
//!
//! Each covalue id maps to a slot state machine: `Loading` while a fetch
//! is in flight, `Available` with the core, or `Unavailable` once every
//! peer has been exhausted. The store also resolves signing and sealing
//! keys for account principals and notifies subscribers on change.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::debug;

use weft_core::{
    AddError, AgentId, ApplyOutcome, CoId, CoValueCore, CoValueHeader, KnownState, NewContent,
    PrincipalId, SealerPub, SignerPub, SignerResolver,
};
use weft_perms::{GroupResolver, GroupView, MemberResolver};
use weft_sync::{dependencies_of, CoValueSource};

use crate::error::{NodeError, Result};

/// Lifecycle of one covalue slot.
pub enum CoValueEntry {
    /// A load is in flight; content may arrive from any peer.
    Loading,
    /// The core is resident.
    Available(CoValueCore),
    /// All peers were exhausted without an answer.
    Unavailable,
}

/// Callback invoked on every change to a subscribed covalue.
pub type Listener = Box<dyn FnMut(&CoValueCore) + Send>;

/// The node's covalue collection plus identity registry.
pub struct NodeStore {
    entries: HashMap<CoId, CoValueEntry>,
    /// Agents of known accounts, learned from account headers.
    accounts: HashMap<CoId, AgentId>,
    listeners: HashMap<CoId, Vec<(u64, Listener)>>,
    next_listener: u64,
    /// Woken whenever any slot changes; load() waits on this.
    pub changed: Arc<Notify>,
}

/// Read the embedded agent out of an account covalue header.
pub fn agent_from_header(header: &CoValueHeader) -> Option<AgentId> {
    header
        .meta
        .as_ref()?
        .get("agent")?
        .as_str()?
        .parse()
        .ok()
}

impl NodeStore {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            accounts: HashMap::new(),
            listeners: HashMap::new(),
            next_listener: 0,
            changed: Arc::new(Notify::new()),
        }
    }

    /// Register an account's agent keys.
    pub fn register_account(&mut self, account: CoId, agent: AgentId) {
        self.accounts.insert(account, agent);
    }

    /// The agent behind an account, if known.
    pub fn agent_for(&self, account: &CoId) -> Option<&AgentId> {
        self.accounts.get(account)
    }

    /// Current slot state, if any.
    pub fn entry(&self, id: &CoId) -> Option<&CoValueEntry> {
        self.entries.get(id)
    }

    /// The resident core, if available.
    pub fn core(&self, id: &CoId) -> Option<&CoValueCore> {
        match self.entries.get(id) {
            Some(CoValueEntry::Available(core)) => Some(core),
            _ => None,
        }
    }

    /// Insert a locally created core.
    pub fn insert_core(&mut self, core: CoValueCore) {
        let id = *core.id();
        if let Some(agent) = agent_from_header(core.header()) {
            self.accounts.insert(id, agent);
        }
        self.entries.insert(id, CoValueEntry::Available(core));
        self.notify(&id);
    }

    /// Mark a slot as loading (no-op if already resident).
    pub fn mark_loading(&mut self, id: CoId) {
        self.entries.entry(id).or_insert(CoValueEntry::Loading);
    }

    /// Mark a slot as unavailable after exhausting all peers.
    pub fn mark_unavailable(&mut self, id: CoId) {
        match self.entries.get(&id) {
            Some(CoValueEntry::Available(_)) => {}
            _ => {
                self.entries.insert(id, CoValueEntry::Unavailable);
                self.changed.notify_waiters();
            }
        }
    }

    /// Run `f` with mutable access to a resident core and shared access
    /// to the rest of the store (for key and role resolution).
    pub fn with_core_mut<T>(
        &mut self,
        id: &CoId,
        f: impl FnOnce(&mut CoValueCore, &NodeStore) -> Result<T>,
    ) -> Result<T> {
        let mut core = match self.entries.remove(id) {
            Some(CoValueEntry::Available(core)) => core,
            Some(other) => {
                self.entries.insert(*id, other);
                return Err(NodeError::NotLoaded(*id));
            }
            None => return Err(NodeError::NotLoaded(*id)),
        };
        let result = f(&mut core, self);
        self.entries.insert(*id, CoValueEntry::Available(core));
        if result.is_ok() {
            self.notify(id);
        }
        result
    }

    /// Register a change listener; fires on every applied change.
    pub fn add_listener(&mut self, id: CoId, listener: Listener) -> u64 {
        let token = self.next_listener;
        self.next_listener += 1;
        self.listeners.entry(id).or_default().push((token, listener));
        token
    }

    /// Remove a listener by token.
    pub fn remove_listener(&mut self, id: &CoId, token: u64) {
        if let Some(list) = self.listeners.get_mut(id) {
            list.retain(|(t, _)| *t != token);
            if list.is_empty() {
                self.listeners.remove(id);
            }
        }
    }

    /// Is anyone still listening to this covalue?
    pub fn has_listeners(&self, id: &CoId) -> bool {
        self.listeners.contains_key(id)
    }

    fn notify(&mut self, id: &CoId) {
        if let Some(CoValueEntry::Available(core)) = self.entries.get(id) {
            if let Some(listeners) = self.listeners.get_mut(id) {
                for (_, listener) in listeners.iter_mut() {
                    listener(core);
                }
            }
        }
        self.changed.notify_waiters();
    }

    /// Fold the group view of a resident group core.
    pub fn group(&self, id: &CoId) -> Result<GroupView> {
        let core = self.core(id).ok_or(NodeError::NotLoaded(*id))?;
        Ok(GroupView::from_core(core)?)
    }

    /// Ids of all resident covalues.
    pub fn available_ids(&self) -> Vec<CoId> {
        self.entries
            .iter()
            .filter_map(|(id, entry)| match entry {
                CoValueEntry::Available(_) => Some(*id),
                _ => None,
            })
            .collect()
    }
}

impl Default for NodeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SignerResolver for NodeStore {
    fn signer_for(&self, principal: &PrincipalId) -> Option<SignerPub> {
        match principal {
            PrincipalId::Agent(agent) => Some(agent.signer),
            PrincipalId::Account(id) => self.accounts.get(id).map(|a| a.signer),
        }
    }
}

impl MemberResolver for NodeStore {
    fn sealer_for(&self, principal: &PrincipalId) -> Option<SealerPub> {
        match principal {
            PrincipalId::Agent(agent) => Some(agent.sealer),
            PrincipalId::Account(id) => self.accounts.get(id).map(|a| a.sealer),
        }
    }
}

impl GroupResolver for NodeStore {
    fn group_view(&self, id: &CoId) -> Option<GroupView> {
        self.core(id).and_then(|core| GroupView::from_core(core).ok())
    }
}

impl CoValueSource for NodeStore {
    fn known_state(&self, id: &CoId) -> Option<KnownState> {
        self.core(id).map(|core| core.known_state())
    }

    fn new_content_since(&self, id: &CoId, known: Option<&KnownState>) -> Vec<NewContent> {
        self.core(id)
            .map(|core| core.new_content_since(known))
            .unwrap_or_default()
    }

    fn apply_content(&mut self, content: &NewContent) -> std::result::Result<ApplyOutcome, AddError> {
        // Learn the account agent before verification needs it.
        if let Some(header) = &content.header {
            if let Some(agent) = agent_from_header(header) {
                self.accounts.insert(content.id, agent);
            }
        }

        let existing = self.entries.remove(&content.id);
        let (entry, outcome) = match existing {
            Some(CoValueEntry::Available(mut core)) => {
                match core.apply_content(content, self) {
                    Ok(outcome) => (CoValueEntry::Available(core), outcome),
                    Err(e) => {
                        self.entries
                            .insert(content.id, CoValueEntry::Available(core));
                        return Err(e);
                    }
                }
            }
            other => match CoValueCore::from_content(content, self) {
                Ok((core, outcome)) => {
                    debug!(id = %content.id, "covalue became available");
                    (CoValueEntry::Available(core), outcome)
                }
                Err(e) => {
                    if let Some(slot) = other {
                        self.entries.insert(content.id, slot);
                    }
                    return Err(e);
                }
            },
        };

        self.entries.insert(content.id, entry);
        self.notify(&content.id);
        Ok(outcome)
    }

    fn dependencies(&self, id: &CoId) -> Vec<CoId> {
        self.core(id).map(dependencies_of).unwrap_or_default()
    }
}
