//! Transactions: the signed units appended to session logs.

use serde::{Deserialize, Serialize};

use crate::crypto::{Encrypted, KeySecret};
use crate::error::AddError;
use crate::id::KeyId;

/// One appended unit of change.
///
/// `Trusting` carries plaintext changes and relies on the session
/// signature for integrity. `Private` additionally encrypts the changes
/// under a group read key named by `key_used`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "privacy", rename_all = "camelCase")]
pub enum Transaction {
    #[serde(rename_all = "camelCase")]
    Trusting {
        made_at: i64,
        changes: Vec<serde_json::Value>,
    },
    #[serde(rename_all = "camelCase")]
    Private {
        made_at: i64,
        key_used: KeyId,
        encrypted_changes: Encrypted,
    },
}

impl Transaction {
    /// Build a trusting transaction.
    pub fn trusting(made_at: i64, changes: Vec<serde_json::Value>) -> Self {
        Transaction::Trusting { made_at, changes }
    }

    /// Build a private transaction by encrypting the changes now.
    pub fn private(
        made_at: i64,
        changes: &[serde_json::Value],
        key_id: KeyId,
        key: &KeySecret,
    ) -> Result<Self, AddError> {
        let plaintext = serde_json::to_vec(changes)?;
        let encrypted_changes = key.encrypt(&plaintext)?;
        Ok(Transaction::Private {
            made_at,
            key_used: key_id,
            encrypted_changes,
        })
    }

    /// Author-claimed timestamp.
    pub fn made_at(&self) -> i64 {
        match self {
            Transaction::Trusting { made_at, .. } => *made_at,
            Transaction::Private { made_at, .. } => *made_at,
        }
    }

    /// The read key a private transaction was encrypted under.
    pub fn key_used(&self) -> Option<&KeyId> {
        match self {
            Transaction::Trusting { .. } => None,
            Transaction::Private { key_used, .. } => Some(key_used),
        }
    }

    /// Plaintext changes of a trusting transaction.
    pub fn trusting_changes(&self) -> Option<&[serde_json::Value]> {
        match self {
            Transaction::Trusting { changes, .. } => Some(changes),
            Transaction::Private { .. } => None,
        }
    }

    /// Decrypt the changes, given a lookup for read keys.
    ///
    /// Returns `None` when the needed key is unavailable; that is partial
    /// visibility, not an error.
    pub fn decrypt_changes(
        &self,
        keys: &dyn KeyProvider,
    ) -> Option<Vec<serde_json::Value>> {
        match self {
            Transaction::Trusting { changes, .. } => Some(changes.clone()),
            Transaction::Private {
                key_used,
                encrypted_changes,
                ..
            } => {
                let key = keys.key(key_used)?;
                let plaintext = key.decrypt(encrypted_changes).ok()?;
                serde_json::from_slice(&plaintext).ok()
            }
        }
    }

    /// The canonical encoding absorbed into the session hash.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("transaction serialization is infallible")
    }

    /// Encoded size, used for signature checkpoint accounting.
    pub fn byte_size(&self) -> usize {
        self.canonical_bytes().len()
    }
}

/// Whether a new transaction should be written in the clear or encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privacy {
    Trusting,
    Private,
}

/// Lookup for symmetric read keys by id.
pub trait KeyProvider {
    /// The key secret for `id`, if this party holds it.
    fn key(&self, id: &KeyId) -> Option<KeySecret>;
}

/// A provider that holds no keys; trusting-only contexts.
pub struct NoKeys;

impl KeyProvider for NoKeys {
    fn key(&self, _id: &KeyId) -> Option<KeySecret> {
        None
    }
}

impl KeyProvider for std::collections::BTreeMap<KeyId, KeySecret> {
    fn key(&self, id: &KeyId) -> Option<KeySecret> {
        self.get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_trusting_wire_shape() {
        let tx = Transaction::trusting(7, vec![json!({"op": "set", "key": "a", "value": 1})]);
        let json = serde_json::to_value(&tx).unwrap();
        assert_eq!(json["privacy"], "trusting");
        assert_eq!(json["madeAt"], 7);
        let back: Transaction = serde_json::from_value(json).unwrap();
        assert_eq!(back, tx);
    }

    #[test]
    fn test_private_decrypts_with_key() {
        let key = KeySecret::generate();
        let key_id = KeyId::generate();
        let changes = vec![json!({"op": "set", "key": "name", "value": "room"})];
        let tx = Transaction::private(1, &changes, key_id, &key).unwrap();

        let mut keys = std::collections::BTreeMap::new();
        keys.insert(key_id, key);
        assert_eq!(tx.decrypt_changes(&keys).unwrap(), changes);
    }

    #[test]
    fn test_private_without_key_is_absent_not_error() {
        let key = KeySecret::generate();
        let key_id = KeyId::generate();
        let tx = Transaction::private(1, &[json!(1)], key_id, &key).unwrap();

        assert!(tx.decrypt_changes(&NoKeys).is_none());
    }

    #[test]
    fn test_canonical_bytes_stable() {
        let tx = Transaction::trusting(3, vec![json!("x")]);
        assert_eq!(tx.canonical_bytes(), tx.canonical_bytes());
        assert_eq!(tx.byte_size(), tx.canonical_bytes().len());
    }
}
