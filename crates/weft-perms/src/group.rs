//! Groups: membership roles and encrypted read keys as CRDT state.
//!
//! A group is a map-shaped covalue whose own content encodes who may do
//! what. Reserved keys:
//!
//! - `<principal>` → role string
//! - `readKey` → current read key id
//! - `<keyId>_for_<principal>` → that key sealed to the member
//! - `<oldKeyId>_for_<newKeyId>` → old key encrypted under the new one,
//!   so holders of the newest key can still read history (never the
//!   reverse direction)
//! - `writeKey_<principal>` → a writeOnly member's dedicated key id
//! - `parent_<coId>` / `child_<coId>` → group extension edges

use std::collections::{BTreeMap, BTreeSet};

use tracing::warn;

use weft_core::{
    AddError, AllowAll, CoId, CoValueCore, Encrypted, KeyId, KeyProvider, KeySecret, MapOp,
    NoKeys, PrincipalId, Sealed, SealerPub, SealerSecret, SessionId, SignerSecret, WritePrivacy,
};

use crate::error::{PermError, Result};
use crate::invite::InviteSecret;
use crate::role::Role;

/// Map key for the current read key id.
pub const READ_KEY: &str = "readKey";

fn reveal_entry_key(key: &KeyId, member: &PrincipalId) -> String {
    format!("{key}_for_{member}")
}

fn edge_entry_key(old: &KeyId, new: &KeyId) -> String {
    format!("{old}_for_{new}")
}

fn write_key_entry_key(member: &PrincipalId) -> String {
    format!("writeKey_{member}")
}

fn parent_entry_key(id: &CoId) -> String {
    format!("parent_{id}")
}

fn child_entry_key(id: &CoId) -> String {
    format!("child_{id}")
}

/// One parsed group map entry.
enum GroupEntry {
    Role(PrincipalId, Role),
    ReadKey(KeyId),
    Reveal(KeyId, PrincipalId, Sealed),
    Edge(KeyId, KeyId, Encrypted),
    WriteKeyMarker(PrincipalId, KeyId),
    Parent(CoId),
    Child(CoId),
    /// Any other key (e.g. an account's `profile` pointer); admin-only
    /// application data riding in the group map.
    Other(String, serde_json::Value),
}

impl GroupEntry {
    fn parse(key: &str, value: &serde_json::Value) -> Option<Self> {
        if key == READ_KEY {
            let id: KeyId = value.as_str()?.parse().ok()?;
            return Some(GroupEntry::ReadKey(id));
        }
        if let Some(rest) = key.strip_prefix("writeKey_") {
            let member: PrincipalId = rest.parse().ok()?;
            let id: KeyId = value.as_str()?.parse().ok()?;
            return Some(GroupEntry::WriteKeyMarker(member, id));
        }
        if let Some(rest) = key.strip_prefix("parent_") {
            return rest.parse().ok().map(GroupEntry::Parent);
        }
        if let Some(rest) = key.strip_prefix("child_") {
            return rest.parse().ok().map(GroupEntry::Child);
        }
        if key.starts_with("key_z") {
            let (left, right) = key.split_once("_for_")?;
            let from: KeyId = left.parse().ok()?;
            if right.starts_with("key_z") {
                let to: KeyId = right.parse().ok()?;
                let ct: Encrypted = serde_json::from_value(value.clone()).ok()?;
                return Some(GroupEntry::Edge(from, to, ct));
            }
            let member: PrincipalId = right.parse().ok()?;
            let sealed: Sealed = serde_json::from_value(value.clone()).ok()?;
            return Some(GroupEntry::Reveal(from, member, sealed));
        }
        if let Ok(member) = key.parse::<PrincipalId>() {
            let role: Role = value.as_str()?.parse().ok()?;
            return Some(GroupEntry::Role(member, role));
        }
        Some(GroupEntry::Other(key.to_string(), value.clone()))
    }
}

/// Resolves sealing keys for account principals (agents carry theirs).
pub trait MemberResolver {
    fn sealer_for(&self, principal: &PrincipalId) -> Option<SealerPub>;
}

impl MemberResolver for BTreeMap<PrincipalId, SealerPub> {
    fn sealer_for(&self, principal: &PrincipalId) -> Option<SealerPub> {
        self.get(principal).copied()
    }
}

fn sealer_of(resolver: &dyn MemberResolver, principal: &PrincipalId) -> Option<SealerPub> {
    match principal {
        PrincipalId::Agent(agent) => Some(agent.sealer),
        PrincipalId::Account(_) => resolver.sealer_for(principal),
    }
}

/// Resolves other groups for extension traversal.
pub trait GroupResolver {
    fn group_view(&self, id: &CoId) -> Option<GroupView>;
}

/// Resolver that knows no other groups.
pub struct NoGroups;

impl GroupResolver for NoGroups {
    fn group_view(&self, _id: &CoId) -> Option<GroupView> {
        None
    }
}

/// The folded permission state of one group.
///
/// Built by replaying the group's own valid transactions in fold order;
/// each entry is checked against its author's role at that point, so a
/// non-admin cannot smuggle role changes in.
#[derive(Debug, Clone)]
pub struct GroupView {
    id: CoId,
    members: BTreeMap<PrincipalId, Vec<(i64, Role)>>,
    read_keys: Vec<KeyId>,
    reveals: BTreeMap<(KeyId, PrincipalId), Sealed>,
    edges: BTreeMap<KeyId, Vec<(KeyId, Encrypted)>>,
    write_keys: BTreeMap<PrincipalId, KeyId>,
    parents: Vec<CoId>,
    children: Vec<CoId>,
    extra: BTreeMap<String, serde_json::Value>,
}

impl GroupView {
    /// Fold a group core into its permission state.
    pub fn from_core(core: &CoValueCore) -> Result<Self> {
        if !core.header().ruleset.is_group() {
            return Err(PermError::NotAGroup(*core.id()));
        }

        let mut view = GroupView {
            id: *core.id(),
            members: BTreeMap::new(),
            read_keys: Vec::new(),
            reveals: BTreeMap::new(),
            edges: BTreeMap::new(),
            write_keys: BTreeMap::new(),
            parents: Vec::new(),
            children: Vec::new(),
            extra: BTreeMap::new(),
        };

        for tx in core.valid_sorted_transactions(&NoKeys, &AllowAll) {
            for change in &tx.changes {
                let Ok(MapOp::Set { key, value }) = serde_json::from_value(change.clone())
                else {
                    warn!(group = %view.id, "non-set change in group content, skipping");
                    continue;
                };
                let Some(entry) = GroupEntry::parse(&key, &value) else {
                    warn!(group = %view.id, key, "unparseable group entry, skipping");
                    continue;
                };
                if view.authorized(&tx.author, &entry) {
                    view.apply(entry, tx.made_at);
                } else {
                    warn!(group = %view.id, author = %tx.author, key, "unauthorized group change, dropping");
                }
            }
        }

        Ok(view)
    }

    /// The group's covalue id.
    pub fn id(&self) -> &CoId {
        &self.id
    }

    fn authorized(&self, author: &PrincipalId, entry: &GroupEntry) -> bool {
        let author_role = self.role_direct(author);

        if author_role == Some(Role::Admin) {
            return true;
        }

        // Bootstrap: the creator appoints themselves admin in the first
        // membership entry.
        if self.members.is_empty() {
            if let GroupEntry::Role(member, Role::Admin) = entry {
                return member == author;
            }
        }

        // Invite agents may convert their invite into the concrete role
        // for an accepting principal, and reveal keys to it.
        if let Some(invite_role) = author_role.as_ref().and_then(Role::invite_grants) {
            match entry {
                GroupEntry::Role(member, granted) => {
                    let existing = self.role_direct(member).map_or(0, |r| r.strength());
                    return *granted == invite_role && granted.strength() > existing;
                }
                GroupEntry::Reveal(..) => return true,
                _ => return false,
            }
        }

        false
    }

    fn apply(&mut self, entry: GroupEntry, made_at: i64) {
        match entry {
            GroupEntry::Role(member, role) => {
                self.members.entry(member).or_default().push((made_at, role));
            }
            GroupEntry::ReadKey(id) => self.read_keys.push(id),
            GroupEntry::Reveal(key, member, sealed) => {
                self.reveals.insert((key, member), sealed);
            }
            GroupEntry::Edge(old, new, ct) => {
                self.edges.entry(old).or_default().push((new, ct));
            }
            GroupEntry::WriteKeyMarker(member, key) => {
                self.write_keys.insert(member, key);
            }
            GroupEntry::Parent(id) => {
                if !self.parents.contains(&id) {
                    self.parents.push(id);
                }
            }
            GroupEntry::Child(id) => {
                if !self.children.contains(&id) {
                    self.children.push(id);
                }
            }
            GroupEntry::Other(key, value) => {
                self.extra.insert(key, value);
            }
        }
    }

    /// Application data entry riding in the group map.
    pub fn extra(&self, key: &str) -> Option<&serde_json::Value> {
        self.extra.get(key)
    }

    /// The member's role from this group alone, ignoring parents.
    pub fn role_direct(&self, member: &PrincipalId) -> Option<Role> {
        self.members
            .get(member)
            .and_then(|history| history.last())
            .map(|(_, role)| *role)
    }

    /// The member's direct role as of a point in time.
    pub fn role_direct_at(&self, member: &PrincipalId, at: i64) -> Option<Role> {
        self.members.get(member).and_then(|history| {
            history
                .iter()
                .rev()
                .find(|(t, _)| *t <= at)
                .map(|(_, role)| *role)
        })
    }

    /// Effective role, recursing into parent groups.
    pub fn role_of(&self, member: &PrincipalId, groups: &dyn GroupResolver) -> Option<Role> {
        let mut visited = BTreeSet::new();
        visited.insert(self.id);
        self.role_of_inner(member, groups, &mut visited, None)
    }

    /// Effective role as of a point in time.
    pub fn role_of_at(
        &self,
        member: &PrincipalId,
        at: i64,
        groups: &dyn GroupResolver,
    ) -> Option<Role> {
        let mut visited = BTreeSet::new();
        visited.insert(self.id);
        self.role_of_inner(member, groups, &mut visited, Some(at))
    }

    fn role_of_inner(
        &self,
        member: &PrincipalId,
        groups: &dyn GroupResolver,
        visited: &mut BTreeSet<CoId>,
        at: Option<i64>,
    ) -> Option<Role> {
        let mut role = match at {
            Some(t) => self.role_direct_at(member, t),
            None => self.role_direct(member),
        };
        for parent_id in &self.parents {
            if !visited.insert(*parent_id) {
                continue;
            }
            let Some(parent) = groups.group_view(parent_id) else {
                continue;
            };
            let parent_role = parent.role_of_inner(member, groups, visited, at);
            role = Role::inherit(role, parent_role);
        }
        role
    }

    /// All principals with a current direct role.
    pub fn members(&self) -> impl Iterator<Item = (&PrincipalId, Role)> {
        self.members.iter().filter_map(|(member, history)| {
            history.last().map(|(_, role)| (member, *role))
        })
    }

    /// The current read key id.
    pub fn current_read_key(&self) -> Option<KeyId> {
        self.read_keys.last().copied()
    }

    /// All read key ids ever used, oldest first.
    pub fn read_key_history(&self) -> &[KeyId] {
        &self.read_keys
    }

    /// A writeOnly member's dedicated key id.
    pub fn write_key_for(&self, member: &PrincipalId) -> Option<KeyId> {
        self.write_keys.get(member).copied()
    }

    /// Parent group ids.
    pub fn parents(&self) -> &[CoId] {
        &self.parents
    }

    /// Child group ids.
    pub fn children(&self) -> &[CoId] {
        &self.children
    }

    /// Context bytes binding seals to this group and key.
    pub fn seal_context(&self, key: &KeyId) -> Vec<u8> {
        format!("{}/{}", self.id, key).into_bytes()
    }

    /// Resolve a key secret for `me`: direct sealed revelation first,
    /// else through the chain of old-key-under-new-key edges.
    pub fn resolve_key(
        &self,
        key: &KeyId,
        me: &PrincipalId,
        sealer: &SealerSecret,
    ) -> Option<KeySecret> {
        let mut visited = BTreeSet::new();
        visited.insert(*key);
        self.resolve_key_inner(key, me, sealer, &mut visited)
    }

    fn resolve_key_inner(
        &self,
        key: &KeyId,
        me: &PrincipalId,
        sealer: &SealerSecret,
        visited: &mut BTreeSet<KeyId>,
    ) -> Option<KeySecret> {
        if let Some(sealed) = self.reveals.get(&(*key, me.clone())) {
            if let Ok(bytes) = sealed.unseal(sealer, &self.seal_context(key)) {
                if let Ok(arr) = <[u8; 32]>::try_from(bytes.as_slice()) {
                    return Some(KeySecret::from_bytes(arr));
                }
            }
        }

        if let Some(edges) = self.edges.get(key) {
            for (via, ct) in edges {
                if !visited.insert(*via) {
                    continue;
                }
                if let Some(via_secret) = self.resolve_key_inner(via, me, sealer, visited) {
                    if let Ok(bytes) = via_secret.decrypt(ct) {
                        if let Ok(arr) = <[u8; 32]>::try_from(bytes.as_slice()) {
                            return Some(KeySecret::from_bytes(arr));
                        }
                    }
                }
            }
        }

        None
    }
}

/// [`KeyProvider`] backed by a group view and one member's sealing key.
pub struct GroupKeys<'a> {
    pub view: &'a GroupView,
    pub me: PrincipalId,
    pub sealer: &'a SealerSecret,
}

impl KeyProvider for GroupKeys<'_> {
    fn key(&self, id: &KeyId) -> Option<KeySecret> {
        self.view.resolve_key(id, &self.me, self.sealer)
    }
}

/// Outcome of a key rotation: the fresh key and the child groups that
/// must rotate next (the caller owns those cores and recurses).
#[derive(Debug)]
pub struct Rotation {
    pub new_key: KeyId,
    pub children: Vec<CoId>,
}

/// Mutation handle for one group, bound to the acting principal.
pub struct GroupMutator<'a> {
    core: &'a mut CoValueCore,
    session: SessionId,
    signer: &'a SignerSecret,
    sealer: &'a SealerSecret,
    me: PrincipalId,
}

impl<'a> GroupMutator<'a> {
    /// Bind a mutation handle to a group core.
    pub fn new(
        core: &'a mut CoValueCore,
        session: SessionId,
        signer: &'a SignerSecret,
        sealer: &'a SealerSecret,
        me: PrincipalId,
    ) -> Result<Self> {
        if !core.header().ruleset.is_group() {
            return Err(PermError::NotAGroup(*core.id()));
        }
        Ok(Self {
            core,
            session,
            signer,
            sealer,
            me,
        })
    }

    /// Fold the current view.
    pub fn view(&self) -> Result<GroupView> {
        GroupView::from_core(self.core)
    }

    fn append(&mut self, changes: Vec<serde_json::Value>, now: i64) -> Result<()> {
        self.core
            .make_transaction(&self.session, self.signer, now, changes, WritePrivacy::Trusting)
            .map_err(AddError::from)?;
        Ok(())
    }

    fn require_admin(&self, view: &GroupView) -> Result<()> {
        if view.role_direct(&self.me) == Some(Role::Admin) {
            Ok(())
        } else {
            Err(PermError::NotAdmin(self.me.clone()))
        }
    }

    fn current_key(&self, view: &GroupView) -> Result<(KeyId, KeySecret)> {
        let id = view.current_read_key().ok_or(PermError::NoReadKey)?;
        let secret = view
            .resolve_key(&id, &self.me, self.sealer)
            .ok_or(PermError::KeyUnavailable(id))?;
        Ok((id, secret))
    }

    /// First write of a fresh group: self-appointed admin plus the
    /// initial read key, sealed to the creator.
    pub fn initialize(&mut self, now: i64) -> Result<KeyId> {
        let view = self.view()?;
        let key_id = KeyId::generate();
        let key = KeySecret::generate();
        let my_sealer = self.sealer.public();
        let sealed = Sealed::seal(key.as_bytes(), &my_sealer, &view.seal_context(&key_id))
            .map_err(AddError::from)?;

        self.append(
            vec![
                MapOp::set(self.me.to_string(), serde_json::json!(Role::Admin.to_string())),
                MapOp::set(READ_KEY, serde_json::json!(key_id.to_string())),
                MapOp::set(
                    reveal_entry_key(&key_id, &self.me),
                    serde_json::to_value(&sealed).expect("sealed serialization is infallible"),
                ),
            ],
            now,
        )?;
        Ok(key_id)
    }

    /// Grant a role, sealing the current read key to the new member.
    ///
    /// `writeOnly` members instead get a dedicated key they alone hold,
    /// wrapped under the group read key so readers can decrypt their
    /// writes; they never learn the shared read key itself.
    pub fn add_member(
        &mut self,
        member: PrincipalId,
        role: Role,
        resolver: &dyn MemberResolver,
        now: i64,
    ) -> Result<()> {
        if role.is_invite() || role == Role::Revoked {
            return Err(PermError::InvalidRole(role));
        }
        let view = self.view()?;
        self.require_admin(&view)?;
        let member_sealer =
            sealer_of(resolver, &member).ok_or_else(|| PermError::UnknownSealer(member.clone()))?;

        let mut changes = vec![MapOp::set(
            member.to_string(),
            serde_json::json!(role.to_string()),
        )];

        if role == Role::WriteOnly {
            let (read_id, read_secret) = self.current_key(&view)?;
            let write_id = KeyId::generate();
            let write_secret = KeySecret::generate();

            let sealed = Sealed::seal(
                write_secret.as_bytes(),
                &member_sealer,
                &view.seal_context(&write_id),
            )
            .map_err(AddError::from)?;
            // Readers reach the dedicated key through the edge; the
            // member reaches it through the seal. Neither path leads
            // back to the read key.
            let wrapped = read_secret
                .encrypt(write_secret.as_bytes())
                .map_err(AddError::from)?;

            changes.push(MapOp::set(
                write_key_entry_key(&member),
                serde_json::json!(write_id.to_string()),
            ));
            changes.push(MapOp::set(
                reveal_entry_key(&write_id, &member),
                serde_json::to_value(&sealed).expect("sealed serialization is infallible"),
            ));
            changes.push(MapOp::set(
                edge_entry_key(&write_id, &read_id),
                serde_json::to_value(&wrapped).expect("envelope serialization is infallible"),
            ));
        } else {
            let (key_id, key) = self.current_key(&view)?;
            let sealed = Sealed::seal(key.as_bytes(), &member_sealer, &view.seal_context(&key_id))
                .map_err(AddError::from)?;
            changes.push(MapOp::set(
                reveal_entry_key(&key_id, &member),
                serde_json::to_value(&sealed).expect("sealed serialization is infallible"),
            ));
        }

        self.append(changes, now)
    }

    /// Revoke a member and rotate the read key.
    ///
    /// Rotation runs for every removal, whatever the removed role, so a
    /// stale write key can never keep leaking through dependency fan-out.
    pub fn remove_member(
        &mut self,
        member: &PrincipalId,
        resolver: &dyn MemberResolver,
        now: i64,
    ) -> Result<Rotation> {
        let view = self.view()?;
        self.require_admin(&view)?;

        self.append(
            vec![MapOp::set(
                member.to_string(),
                serde_json::json!(Role::Revoked.to_string()),
            )],
            now,
        )?;

        self.rotate_read_key(resolver, now)
    }

    /// Generate a new read key, re-seal it to every currently-permitted
    /// member, re-wrap writeOnly dedicated keys, and record the edge that
    /// makes the old key derivable from the new one (never the reverse).
    ///
    /// Child groups inherit access from this one and must rotate too; the
    /// caller recurses over `Rotation::children`.
    pub fn rotate_read_key(
        &mut self,
        resolver: &dyn MemberResolver,
        now: i64,
    ) -> Result<Rotation> {
        let view = self.view()?;
        self.require_admin(&view)?;

        let old = self.current_key(&view).ok();
        let new_id = KeyId::generate();
        let new_secret = KeySecret::generate();

        let mut changes = vec![MapOp::set(READ_KEY, serde_json::json!(new_id.to_string()))];

        for (member, role) in view.members() {
            if !(role.can_read() || role.is_invite()) {
                continue;
            }
            let Some(member_sealer) = sealer_of(resolver, member) else {
                warn!(group = %view.id, member = %member, "no sealing key known, skipping reveal");
                continue;
            };
            let sealed = Sealed::seal(
                new_secret.as_bytes(),
                &member_sealer,
                &view.seal_context(&new_id),
            )
            .map_err(AddError::from)?;
            changes.push(MapOp::set(
                reveal_entry_key(&new_id, member),
                serde_json::to_value(&sealed).expect("sealed serialization is infallible"),
            ));
        }

        // Old content stays readable through the one-directional edge.
        if let Some((old_id, old_secret)) = old {
            let wrapped = new_secret
                .encrypt(old_secret.as_bytes())
                .map_err(AddError::from)?;
            changes.push(MapOp::set(
                edge_entry_key(&old_id, &new_id),
                serde_json::to_value(&wrapped).expect("envelope serialization is infallible"),
            ));
        }

        // Re-wrap surviving writeOnly members' dedicated keys under the
        // new read key.
        for (member, role) in view.members() {
            if role != Role::WriteOnly {
                continue;
            }
            let Some(write_id) = view.write_key_for(member) else {
                continue;
            };
            let Some(write_secret) = view.resolve_key(&write_id, &self.me, self.sealer) else {
                warn!(group = %view.id, member = %member, "dedicated write key unresolvable, skipping re-wrap");
                continue;
            };
            let wrapped = new_secret
                .encrypt(write_secret.as_bytes())
                .map_err(AddError::from)?;
            changes.push(MapOp::set(
                edge_entry_key(&write_id, &new_id),
                serde_json::to_value(&wrapped).expect("envelope serialization is infallible"),
            ));
        }

        self.append(changes, now)?;

        Ok(Rotation {
            new_key: new_id,
            children: view.children().to_vec(),
        })
    }

    /// Mint an invite: a fresh agent holding `{role}Invite` plus the
    /// current read key.
    pub fn create_invite(&mut self, role: Role, now: i64) -> Result<InviteSecret> {
        let invite_role = role.invite_variant().ok_or(PermError::InvalidRole(role))?;
        let view = self.view()?;
        self.require_admin(&view)?;
        let (key_id, key) = self.current_key(&view)?;

        let secret = InviteSecret::generate();
        let agent = PrincipalId::Agent(secret.agent_id());
        let sealed = Sealed::seal(
            key.as_bytes(),
            &secret.agent_id().sealer,
            &view.seal_context(&key_id),
        )
        .map_err(AddError::from)?;

        self.append(
            vec![
                MapOp::set(agent.to_string(), serde_json::json!(invite_role.to_string())),
                MapOp::set(
                    reveal_entry_key(&key_id, &agent),
                    serde_json::to_value(&sealed).expect("sealed serialization is infallible"),
                ),
            ],
            now,
        )?;
        Ok(secret)
    }

    /// Acceptance path, written with the invite agent's own session: the
    /// accepting principal gets the invite's concrete role and the
    /// current read key. An existing better role is left alone.
    pub fn accept_invite(
        &mut self,
        accepting: PrincipalId,
        accepting_sealer: SealerPub,
        now: i64,
    ) -> Result<Role> {
        let view = self.view()?;
        let invite_role = view
            .role_direct(&self.me)
            .and_then(|r| r.invite_grants())
            .ok_or_else(|| PermError::NotAnInvite(self.me.clone()))?;

        let existing = view.role_direct(&accepting);
        if existing.map_or(0, |r| r.strength()) >= invite_role.strength() {
            return Ok(existing.unwrap_or(invite_role));
        }

        let (key_id, key) = self.current_key(&view)?;
        let sealed = Sealed::seal(
            key.as_bytes(),
            &accepting_sealer,
            &view.seal_context(&key_id),
        )
        .map_err(AddError::from)?;

        self.append(
            vec![
                MapOp::set(
                    accepting.to_string(),
                    serde_json::json!(invite_role.to_string()),
                ),
                MapOp::set(
                    reveal_entry_key(&key_id, &accepting),
                    serde_json::to_value(&sealed).expect("sealed serialization is infallible"),
                ),
            ],
            now,
        )?;
        Ok(invite_role)
    }

    /// Record an extension edge to a parent group on this side.
    pub fn add_parent(&mut self, parent: CoId, now: i64) -> Result<()> {
        let view = self.view()?;
        self.require_admin(&view)?;
        self.append(
            vec![MapOp::set(parent_entry_key(&parent), serde_json::json!("extend"))],
            now,
        )
    }

    /// Record an extension edge to a child group on this side.
    pub fn add_child(&mut self, child: CoId, now: i64) -> Result<()> {
        let view = self.view()?;
        self.require_admin(&view)?;
        self.append(
            vec![MapOp::set(child_entry_key(&child), serde_json::json!("extend"))],
            now,
        )
    }

    /// Set an application data entry (e.g. an account's profile pointer).
    pub fn set_extra(&mut self, key: &str, value: serde_json::Value, now: i64) -> Result<()> {
        let view = self.view()?;
        self.require_admin(&view)?;
        self.append(vec![MapOp::set(key, value)], now)
    }
}
