//! Per-session transaction logs with incremental hashing and signature
//! checkpoints.
//!
//! A session is owned by exactly one writer, so appends are strictly
//! ordered and the running hash makes any reordering or tampering
//! detectable. Signatures cover the hash of the whole log so far; for
//! large sessions a checkpoint signature is recorded every
//! [`SIGNATURE_CHECKPOINT_BYTES`] of transaction data, bounding how much
//! must be re-verified or resent per chunk.

use std::collections::BTreeMap;

use crate::crypto::{Blake3Hash, Signature, SignerPub, SignerSecret, StreamingHash};
use crate::error::AddError;
use crate::id::SessionId;
use crate::transaction::Transaction;

/// Accumulated transaction bytes that trigger an inline signature
/// checkpoint.
pub const SIGNATURE_CHECKPOINT_BYTES: usize = 100 * 1024;

/// The append-only log of one session.
#[derive(Clone)]
pub struct SessionLog {
    transactions: Vec<Transaction>,
    streaming_hash: StreamingHash,
    last_signature: Option<Signature>,
    signature_after: BTreeMap<u64, Signature>,
    bytes_since_last_signature: usize,
}

impl SessionLog {
    /// An empty log.
    pub fn new() -> Self {
        Self {
            transactions: Vec::new(),
            streaming_hash: StreamingHash::new(),
            last_signature: None,
            signature_after: BTreeMap::new(),
            bytes_since_last_signature: 0,
        }
    }

    /// Number of transactions in the log.
    pub fn len(&self) -> u64 {
        self.transactions.len() as u64
    }

    /// Is the log empty?
    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// All transactions, in append order.
    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    /// Signature over the current full log.
    pub fn last_signature(&self) -> Option<&Signature> {
        self.last_signature.as_ref()
    }

    /// Checkpoint signature recorded after the given transaction index.
    pub fn signature_after(&self, idx: u64) -> Option<&Signature> {
        self.signature_after.get(&idx)
    }

    /// All checkpoint indices and signatures.
    pub fn checkpoints(&self) -> impl Iterator<Item = (u64, &Signature)> {
        self.signature_after.iter().map(|(idx, sig)| (*idx, sig))
    }

    /// Hash of the log as it stands.
    pub fn current_hash(&self) -> Blake3Hash {
        self.streaming_hash.current()
    }

    /// What the hash would be after appending `txs`, plus the advanced
    /// hasher state so a successful verify can commit without re-hashing.
    fn hash_after(&self, txs: &[Transaction]) -> (Blake3Hash, StreamingHash) {
        let mut advanced = self.streaming_hash.clone();
        for tx in txs {
            advanced.update(&tx.canonical_bytes());
        }
        (advanced.current(), advanced)
    }

    /// Verify and append a batch of transactions.
    ///
    /// The signature must cover the hash of the log *after* the batch.
    /// On any failure the log is left untouched.
    pub fn try_append(
        &mut self,
        session: &SessionId,
        txs: Vec<Transaction>,
        expected_hash: Option<Blake3Hash>,
        signature: Signature,
        signer: &SignerPub,
    ) -> Result<(), AddError> {
        let (new_hash, advanced) = self.hash_after(&txs);

        if let Some(expected) = expected_hash {
            if expected != new_hash {
                return Err(AddError::HashMismatch {
                    session: session.clone(),
                    expected,
                    actual: new_hash,
                });
            }
        }

        signer
            .verify(new_hash.as_bytes(), &signature)
            .map_err(|_| AddError::InvalidSignature {
                session: session.clone(),
            })?;

        self.commit(txs, advanced, signature);
        Ok(())
    }

    /// Append locally authored transactions, producing the signature.
    pub fn append_signed(
        &mut self,
        txs: Vec<Transaction>,
        signer: &SignerSecret,
    ) -> Signature {
        let (new_hash, advanced) = self.hash_after(&txs);
        let signature = signer.sign(new_hash.as_bytes());
        self.commit(txs, advanced, signature);
        signature
    }

    fn commit(&mut self, txs: Vec<Transaction>, advanced: StreamingHash, signature: Signature) {
        let added_bytes: usize = txs.iter().map(Transaction::byte_size).sum();
        self.transactions.extend(txs);
        self.streaming_hash = advanced;
        self.last_signature = Some(signature);

        self.bytes_since_last_signature += added_bytes;
        if self.bytes_since_last_signature >= SIGNATURE_CHECKPOINT_BYTES {
            self.signature_after.insert(self.len() - 1, signature);
            self.bytes_since_last_signature = 0;
        }
    }

    /// Transactions after index `after`, split at checkpoint boundaries.
    ///
    /// Each piece carries the signature valid as of its end, so a
    /// receiver can verify chunks without waiting for the tail.
    pub fn content_since(&self, after: u64) -> Vec<SessionSlice<'_>> {
        let len = self.len();
        if after >= len {
            return Vec::new();
        }

        // Checkpoint indices strictly inside (after, len - 1).
        let boundaries: Vec<u64> = self
            .signature_after
            .range(after..len.saturating_sub(1))
            .map(|(idx, _)| *idx)
            .filter(|idx| *idx >= after)
            .collect();

        let mut slices = Vec::with_capacity(boundaries.len() + 1);
        let mut start = after;
        for boundary in boundaries {
            let signature = self.signature_after[&boundary];
            slices.push(SessionSlice {
                after: start,
                signature,
                transactions: &self.transactions[start as usize..=boundary as usize],
            });
            start = boundary + 1;
        }

        if start < len {
            // Tail piece, covered by the latest signature.
            let signature = *self
                .last_signature
                .as_ref()
                .expect("non-empty log always has a signature");
            slices.push(SessionSlice {
                after: start,
                signature,
                transactions: &self.transactions[start as usize..],
            });
        }

        slices
    }
}

impl Default for SessionLog {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SessionLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLog")
            .field("len", &self.len())
            .field("checkpoints", &self.signature_after.len())
            .finish()
    }
}

/// A contiguous run of transactions with the signature covering its end.
#[derive(Debug, Clone)]
pub struct SessionSlice<'a> {
    /// Number of transactions preceding this slice.
    pub after: u64,
    /// Signature valid as of the last transaction of the slice.
    pub signature: Signature,
    /// The transactions themselves.
    pub transactions: &'a [Transaction],
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{CoId, PrincipalId};
    use serde_json::json;

    fn session_id() -> SessionId {
        SessionId::with_nonce(PrincipalId::Account(CoId::from_bytes([1; 32])), [0; 8])
    }

    fn tx(n: i64) -> Transaction {
        Transaction::trusting(n, vec![json!({"op": "set", "key": "n", "value": n})])
    }

    #[test]
    fn test_append_signed_then_verify_path() {
        let signer = SignerSecret::from_seed(&[1; 32]);
        let mut local = SessionLog::new();
        let sig1 = local.append_signed(vec![tx(1)], &signer);
        let sig2 = local.append_signed(vec![tx(2)], &signer);
        assert_ne!(sig1.as_bytes(), sig2.as_bytes());

        // A second log replays the same batches through the verify gate.
        let mut replica = SessionLog::new();
        replica
            .try_append(&session_id(), vec![tx(1)], None, sig1, &signer.public())
            .unwrap();
        replica
            .try_append(&session_id(), vec![tx(2)], None, sig2, &signer.public())
            .unwrap();
        assert_eq!(replica.current_hash(), local.current_hash());
    }

    #[test]
    fn test_forged_signature_rejected_without_mutation() {
        let signer = SignerSecret::from_seed(&[1; 32]);
        let mut log = SessionLog::new();
        let forged = Signature::from_bytes([0xff; 64]);

        let before = log.current_hash();
        let result = log.try_append(&session_id(), vec![tx(1)], None, forged, &signer.public());
        assert!(matches!(result, Err(AddError::InvalidSignature { .. })));
        assert_eq!(log.len(), 0);
        assert_eq!(log.current_hash(), before);
    }

    #[test]
    fn test_wrong_expected_hash_rejected() {
        let signer = SignerSecret::from_seed(&[1; 32]);
        let mut log = SessionLog::new();
        let signature = signer.sign(&[0; 32]);

        let result = log.try_append(
            &session_id(),
            vec![tx(1)],
            Some(Blake3Hash::from_bytes([0; 32])),
            signature,
            &signer.public(),
        );
        assert!(matches!(result, Err(AddError::HashMismatch { .. })));
        assert_eq!(log.len(), 0);
    }

    #[test]
    fn test_wrong_signer_rejected() {
        let signer = SignerSecret::from_seed(&[1; 32]);
        let imposter = SignerSecret::from_seed(&[2; 32]);
        let mut log = SessionLog::new();

        // Sign with the imposter's key; verify against the real signer.
        let mut scratch = SessionLog::new();
        let signature = scratch.append_signed(vec![tx(1)], &imposter);

        let result = log.try_append(&session_id(), vec![tx(1)], None, signature, &signer.public());
        assert!(matches!(result, Err(AddError::InvalidSignature { .. })));
    }

    fn big_tx(n: i64, bytes: usize) -> Transaction {
        Transaction::trusting(n, vec![json!("x".repeat(bytes))])
    }

    #[test]
    fn test_checkpoints_at_threshold_crossings() {
        let signer = SignerSecret::from_seed(&[1; 32]);
        let mut log = SessionLog::new();

        // Each transaction is just over half the threshold: a checkpoint
        // lands exactly on every second append.
        let size = SIGNATURE_CHECKPOINT_BYTES / 2 + 64;
        for n in 0..6 {
            log.append_signed(vec![big_tx(n, size)], &signer);
        }

        let checkpoints: Vec<u64> = log.checkpoints().map(|(idx, _)| idx).collect();
        assert_eq!(checkpoints, vec![1, 3, 5]);
    }

    #[test]
    fn test_content_since_splits_at_checkpoints() {
        let signer = SignerSecret::from_seed(&[1; 32]);
        let mut log = SessionLog::new();

        let size = SIGNATURE_CHECKPOINT_BYTES / 2 + 64;
        for n in 0..5 {
            log.append_signed(vec![big_tx(n, size)], &signer);
        }
        // Checkpoints after idx 1 and 3; tail is idx 4.
        let slices = log.content_since(0);
        assert_eq!(slices.len(), 3);
        assert_eq!(slices[0].after, 0);
        assert_eq!(slices[0].transactions.len(), 2);
        assert_eq!(slices[1].after, 2);
        assert_eq!(slices[1].transactions.len(), 2);
        assert_eq!(slices[2].after, 4);
        assert_eq!(slices[2].transactions.len(), 1);

        // Every slice's signature verifies over the hash at its end.
        let mut replica = SessionLog::new();
        for slice in &slices {
            replica
                .try_append(
                    &session_id(),
                    slice.transactions.to_vec(),
                    None,
                    slice.signature,
                    &signer.public(),
                )
                .unwrap();
        }
        assert_eq!(replica.current_hash(), log.current_hash());
    }

    #[test]
    fn test_content_since_partial() {
        let signer = SignerSecret::from_seed(&[1; 32]);
        let mut log = SessionLog::new();
        for n in 0..4 {
            log.append_signed(vec![tx(n)], &signer);
        }

        let slices = log.content_since(2);
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].after, 2);
        assert_eq!(slices[0].transactions.len(), 2);

        assert!(log.content_since(4).is_empty());
        assert!(log.content_since(9).is_empty());
    }
}
