//! CoValueCore: the transaction-log data structure for one covalue.
//!
//! A core is an immutable header plus one append-only log per session.
//! Every incoming transaction, whatever its source (local edit, peer
//! sync, storage replay), passes through [`CoValueCore::try_add_transactions`],
//! the single gate against forged or corrupted history.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::crypto::{Blake3Hash, KeySecret, Signature, SignerPub, SignerSecret};
use crate::error::AddError;
use crate::header::CoValueHeader;
use crate::id::{CoId, KeyId, PrincipalId, SessionId};
use crate::known::{KnownState, NewContent, SessionNewContent};
use crate::session::SessionLog;
use crate::transaction::{KeyProvider, Privacy, Transaction};

/// Lookup from principal to signing key.
///
/// Agent principals carry their key inline; account principals resolve
/// through whoever implements this (the node, a fixture map).
pub trait SignerResolver {
    fn signer_for(&self, principal: &PrincipalId) -> Option<SignerPub>;
}

impl SignerResolver for BTreeMap<PrincipalId, SignerPub> {
    fn signer_for(&self, principal: &PrincipalId) -> Option<SignerPub> {
        self.get(principal).copied()
    }
}

/// Resolver that only knows bare agents; enough for agent-owned sessions.
pub struct AgentsOnly;

impl SignerResolver for AgentsOnly {
    fn signer_for(&self, _principal: &PrincipalId) -> Option<SignerPub> {
        None
    }
}

fn resolve_signer(
    resolver: &dyn SignerResolver,
    principal: &PrincipalId,
) -> Option<SignerPub> {
    match principal {
        PrincipalId::Agent(agent) => Some(agent.signer),
        PrincipalId::Account(_) => resolver.signer_for(principal),
    }
}

/// Decides whether a decrypted transaction may contribute to content.
///
/// Called in fold order, so stateful validators (group role tracking) see
/// transactions in the same deterministic sequence on every node.
pub trait TxValidator {
    fn allows(&self, header: &CoValueHeader, tx: &ValidTransaction) -> bool;
}

/// Validator for `unsafeAllowAll` covalues and raw folds.
pub struct AllowAll;

impl TxValidator for AllowAll {
    fn allows(&self, _header: &CoValueHeader, _tx: &ValidTransaction) -> bool {
        true
    }
}

/// A decrypted, globally ordered transaction ready for folding.
#[derive(Debug, Clone)]
pub struct ValidTransaction {
    pub session: SessionId,
    pub tx_index: u64,
    pub made_at: i64,
    pub privacy: Privacy,
    pub author: PrincipalId,
    pub changes: Vec<serde_json::Value>,
}

/// How a locally made transaction should be written.
pub enum WritePrivacy {
    Trusting,
    Private { key_id: KeyId, key: KeySecret },
}

/// Result of applying a content message.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyOutcome {
    /// At least one session entry started beyond our local log; the
    /// sender needs a correction `known` message.
    pub invalid_assumptions: bool,
    /// At least one new transaction was appended.
    pub applied_any: bool,
}

/// The transaction-log core of one covalue.
pub struct CoValueCore {
    id: CoId,
    header: CoValueHeader,
    sessions: BTreeMap<SessionId, SessionLog>,
}

impl CoValueCore {
    /// Create a core for a freshly minted header.
    pub fn new(header: CoValueHeader) -> Self {
        Self {
            id: header.id(),
            header,
            sessions: BTreeMap::new(),
        }
    }

    /// Build a core from an incoming content message carrying a header.
    pub fn from_content(
        content: &NewContent,
        resolver: &dyn SignerResolver,
    ) -> Result<(Self, ApplyOutcome), AddError> {
        let header = content
            .header
            .clone()
            .ok_or(AddError::MissingHeader(content.id))?;
        let actual = header.id();
        if actual != content.id {
            return Err(AddError::HeaderMismatch {
                expected: content.id,
                actual,
            });
        }
        let mut core = Self::new(header);
        let outcome = core.apply_content(content, resolver)?;
        Ok((core, outcome))
    }

    /// The content-addressed id.
    pub fn id(&self) -> &CoId {
        &self.id
    }

    /// The immutable header.
    pub fn header(&self) -> &CoValueHeader {
        &self.header
    }

    /// One session's log, if present.
    pub fn session(&self, id: &SessionId) -> Option<&SessionLog> {
        self.sessions.get(id)
    }

    /// All sessions with their logs.
    pub fn sessions(&self) -> impl Iterator<Item = (&SessionId, &SessionLog)> {
        self.sessions.iter()
    }

    /// What this core knows, in sync-protocol terms.
    pub fn known_state(&self) -> KnownState {
        let mut state = KnownState::empty(self.id);
        state.header = true;
        for (session, log) in &self.sessions {
            if !log.is_empty() {
                state.sessions.insert(session.clone(), log.len());
            }
        }
        state
    }

    /// Verify and append transactions to one session.
    ///
    /// Recomputes the rolling hash, checks it against `expected_hash` when
    /// given, verifies the signature with the session owner's signing key,
    /// and only then appends. Rejections leave the core untouched.
    pub fn try_add_transactions(
        &mut self,
        session_id: &SessionId,
        txs: Vec<Transaction>,
        expected_hash: Option<Blake3Hash>,
        signature: Signature,
        resolver: &dyn SignerResolver,
    ) -> Result<(), AddError> {
        let signer = resolve_signer(resolver, &session_id.owner)
            .ok_or_else(|| AddError::UnknownSigner(session_id.owner.clone()))?;

        let log = self.sessions.entry(session_id.clone()).or_default();
        let result = log.try_append(session_id, txs, expected_hash, signature, &signer);

        if result.is_err() {
            if let Some(log) = self.sessions.get(session_id) {
                if log.is_empty() {
                    self.sessions.remove(session_id);
                }
            }
            if let Err(e) = &result {
                warn!(covalue = %self.id, session = %session_id, error = %e, "rejected transactions");
            }
        }
        result
    }

    /// Author and append a transaction in one of our own sessions.
    ///
    /// For `Private`, the caller supplies the current group read key; a
    /// member without access fails before anything is written.
    pub fn make_transaction(
        &mut self,
        session_id: &SessionId,
        signer: &SignerSecret,
        made_at: i64,
        changes: Vec<serde_json::Value>,
        privacy: WritePrivacy,
    ) -> Result<Signature, AddError> {
        let tx = match privacy {
            WritePrivacy::Trusting => Transaction::trusting(made_at, changes),
            WritePrivacy::Private { key_id, key } => {
                Transaction::private(made_at, &changes, key_id, &key)?
            }
        };

        let log = self.sessions.entry(session_id.clone()).or_default();
        Ok(log.append_signed(vec![tx], signer))
    }

    /// Decrypt, filter and order all transactions for content folding.
    ///
    /// Transactions whose read key is unavailable are absent from the
    /// result, not an error: partial visibility is expected for members
    /// who lost and regained access. Ordering is `(made_at, session,
    /// tx_index)`, identical on every node.
    pub fn valid_sorted_transactions(
        &self,
        keys: &dyn KeyProvider,
        validator: &dyn TxValidator,
    ) -> Vec<ValidTransaction> {
        let mut entries: Vec<(&SessionId, u64, &Transaction)> = Vec::new();
        for (session, log) in &self.sessions {
            for (idx, tx) in log.transactions().iter().enumerate() {
                entries.push((session, idx as u64, tx));
            }
        }
        entries.sort_by(|a, b| {
            (a.2.made_at(), a.0, a.1).cmp(&(b.2.made_at(), b.0, b.1))
        });

        let mut valid = Vec::with_capacity(entries.len());
        for (session, tx_index, tx) in entries {
            let Some(changes) = tx.decrypt_changes(keys) else {
                debug!(covalue = %self.id, session = %session, tx_index, "transaction undecryptable, skipping");
                continue;
            };
            let candidate = ValidTransaction {
                session: session.clone(),
                tx_index,
                made_at: tx.made_at(),
                privacy: match tx {
                    Transaction::Trusting { .. } => Privacy::Trusting,
                    Transaction::Private { .. } => Privacy::Private,
                },
                author: session.owner.clone(),
                changes,
            };
            if validator.allows(&self.header, &candidate) {
                valid.push(candidate);
            } else {
                debug!(covalue = %self.id, session = %session, tx_index, "transaction rejected by ruleset");
            }
        }
        valid
    }

    /// Everything a peer with `known` still needs, split into one or more
    /// content messages at signature checkpoints.
    ///
    /// Returns an empty vector when the peer is fully caught up.
    pub fn new_content_since(&self, known: Option<&KnownState>) -> Vec<NewContent> {
        let include_header = known.map_or(true, |k| !k.header);

        let mut piece_count = 0;
        let mut per_session = Vec::new();
        for (session, log) in &self.sessions {
            let after = known.map_or(0, |k| k.session_count(session));
            let slices = log.content_since(after);
            piece_count = piece_count.max(slices.len());
            if !slices.is_empty() {
                per_session.push((session.clone(), slices));
            }
        }

        let mut pieces: Vec<NewContent> = (0..piece_count)
            .map(|i| NewContent {
                id: self.id,
                header: (i == 0 && include_header).then(|| self.header.clone()),
                new: BTreeMap::new(),
            })
            .collect();

        for (session, slices) in per_session {
            for (i, slice) in slices.into_iter().enumerate() {
                pieces[i].new.insert(
                    session.clone(),
                    SessionNewContent {
                        after: slice.after,
                        last_signature: slice.signature,
                        new_transactions: slice.transactions.to_vec(),
                    },
                );
            }
        }

        if pieces.is_empty() && include_header {
            pieces.push(NewContent::header_only(self.id, self.header.clone()));
        }

        pieces
    }

    /// Merge an incoming content message into this core.
    ///
    /// Sessions whose batch starts beyond our local log are not applied;
    /// the outcome flags them so the caller can answer with a correction
    /// `known` instead. Overlap with already-known transactions is
    /// dropped, never re-verified against a different history.
    pub fn apply_content(
        &mut self,
        content: &NewContent,
        resolver: &dyn SignerResolver,
    ) -> Result<ApplyOutcome, AddError> {
        let mut outcome = ApplyOutcome::default();

        for (session, entry) in &content.new {
            let have = self
                .sessions
                .get(session)
                .map(|log| log.len())
                .unwrap_or(0);

            if entry.after > have {
                warn!(
                    covalue = %self.id,
                    session = %session,
                    after = entry.after,
                    have,
                    "content assumes more than we know"
                );
                outcome.invalid_assumptions = true;
                continue;
            }

            let skip = (have - entry.after) as usize;
            if skip >= entry.new_transactions.len() {
                continue;
            }

            let remaining = entry.new_transactions[skip..].to_vec();
            self.try_add_transactions(
                session,
                remaining,
                None,
                entry.last_signature,
                resolver,
            )?;
            outcome.applied_any = true;
        }

        Ok(outcome)
    }
}

impl std::fmt::Debug for CoValueCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoValueCore")
            .field("id", &self.id)
            .field("kind", &self.header.kind)
            .field("sessions", &self.sessions.len())
            .finish()
    }
}
