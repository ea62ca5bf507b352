//! The crypto provider: signing, sealing, symmetric encryption, hashing.
//!
//! Wraps Ed25519 signatures, X25519 sealed boxes, ChaCha20-Poly1305
//! symmetric encryption and Blake3 hashing with strong types. Everything
//! here is pure computation; key lookup and policy live in higher layers.

use bytes::Bytes;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::base58;
use crate::error::CryptoError;

/// A 32-byte Blake3 hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Blake3Hash(pub [u8; 32]);

impl Blake3Hash {
    /// Compute the Blake3 hash of the given data.
    pub fn hash(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for Blake3Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Blake3({})", &hex::encode(self.0)[..16])
    }
}

impl fmt::Display for Blake3Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", base58::encode_z("hash", &self.0))
    }
}

impl std::str::FromStr for Blake3Hash {
    type Err = base58::Base58Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(base58::decode_z_array("hash", s)?))
    }
}

/// An incrementally updatable hash over a session's transaction log.
///
/// Cloning is cheap and captures the state at the current position, which
/// is how speculative "what would the hash be after these transactions"
/// checks are done without re-hashing the whole log.
#[derive(Clone)]
pub struct StreamingHash {
    hasher: blake3::Hasher,
}

impl StreamingHash {
    /// Start a new streaming hash with domain separation.
    pub fn new() -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"weft-session-v0:");
        Self { hasher }
    }

    /// Absorb one length-prefixed chunk.
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(&(data.len() as u64).to_le_bytes());
        self.hasher.update(data);
    }

    /// Hash state at the current position.
    pub fn current(&self) -> Blake3Hash {
        Blake3Hash(*self.hasher.finalize().as_bytes())
    }
}

impl Default for StreamingHash {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StreamingHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamingHash({:?})", self.current())
    }
}

/// A 32-byte Ed25519 public signing key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SignerPub(pub [u8; 32]);

impl SignerPub {
    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Verify a signature over a message.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), CryptoError> {
        let verifying_key =
            VerifyingKey::from_bytes(&self.0).map_err(|_| CryptoError::InvalidPublicKey)?;
        let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
        verifying_key
            .verify(message, &sig)
            .map_err(|_| CryptoError::InvalidSignature)
    }
}

impl fmt::Debug for SignerPub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signer({})", &hex::encode(self.0)[..16])
    }
}

impl fmt::Display for SignerPub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", base58::encode_z("signer", &self.0))
    }
}

impl std::str::FromStr for SignerPub {
    type Err = base58::Base58Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(base58::decode_z_array("signer", s)?))
    }
}

/// A 64-byte Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(pub [u8; 64]);

impl Signature {
    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}...)", &hex::encode(self.0)[..16])
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", base58::encode_z("signature", &self.0))
    }
}

impl std::str::FromStr for Signature {
    type Err = base58::Base58Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(base58::decode_z_array("signature", s)?))
    }
}

/// An Ed25519 signing keypair.
#[derive(Clone)]
pub struct SignerSecret {
    signing_key: SigningKey,
}

impl SignerSecret {
    /// Generate a new random signing key.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            signing_key: SigningKey::generate(&mut rng),
        }
    }

    /// Create from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Derive the public key.
    pub fn public(&self) -> SignerPub {
        SignerPub(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign a message.
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing_key.sign(message).to_bytes())
    }

    /// Get the raw seed bytes.
    pub fn seed(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }
}

impl fmt::Debug for SignerSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignerSecret({:?})", self.public())
    }
}

/// A 32-byte X25519 public sealing key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SealerPub(pub [u8; 32]);

impl SealerPub {
    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    fn to_dalek(self) -> PublicKey {
        PublicKey::from(self.0)
    }
}

impl fmt::Debug for SealerPub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sealer({})", &hex::encode(self.0)[..16])
    }
}

impl fmt::Display for SealerPub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", base58::encode_z("sealer", &self.0))
    }
}

impl std::str::FromStr for SealerPub {
    type Err = base58::Base58Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(base58::decode_z_array("sealer", s)?))
    }
}

/// An X25519 static secret used to unseal key material sealed to us.
#[derive(Clone)]
pub struct SealerSecret(StaticSecret);

impl SealerSecret {
    /// Generate a new random sealing secret.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut bytes = [0u8; 32];
        rng.fill_bytes(&mut bytes);
        Self(StaticSecret::from(bytes))
    }

    /// Create from seed bytes.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self(StaticSecret::from(*seed))
    }

    /// Derive the public key.
    pub fn public(&self) -> SealerPub {
        SealerPub(*PublicKey::from(&self.0).as_bytes())
    }

    /// Get the raw seed bytes.
    pub fn seed(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    fn shared_wrap_key(&self, peer: &SealerPub, context: &[u8]) -> KeySecret {
        let shared = self.0.diffie_hellman(&peer.to_dalek());
        derive_wrap_key(shared.as_bytes(), context)
    }
}

impl fmt::Debug for SealerSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SealerSecret({:?})", self.public())
    }
}

fn derive_wrap_key(shared: &[u8; 32], context: &[u8]) -> KeySecret {
    let mut hasher = blake3::Hasher::new_derive_key("weft-seal-v0-wrap");
    hasher.update(shared);
    hasher.update(context);
    KeySecret(*hasher.finalize().as_bytes())
}

/// A 256-bit symmetric key for ChaCha20-Poly1305.
#[derive(Clone, PartialEq, Eq)]
pub struct KeySecret(pub [u8; 32]);

impl KeySecret {
    /// Generate a new random key.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut bytes = [0u8; 32];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Encrypt plaintext under this key with a fresh nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Encrypted, CryptoError> {
        let cipher = ChaCha20Poly1305::new_from_slice(&self.0)
            .map_err(|e| CryptoError::Encryption(e.to_string()))?;

        let mut nonce = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| CryptoError::Encryption(e.to_string()))?;

        Ok(Encrypted {
            nonce,
            ciphertext: Bytes::from(ciphertext),
        })
    }

    /// Decrypt an envelope with this key.
    pub fn decrypt(&self, encrypted: &Encrypted) -> Result<Vec<u8>, CryptoError> {
        let cipher = ChaCha20Poly1305::new_from_slice(&self.0)
            .map_err(|e| CryptoError::Decryption(e.to_string()))?;

        cipher
            .decrypt(Nonce::from_slice(&encrypted.nonce), encrypted.ciphertext.as_ref())
            .map_err(|e| CryptoError::Decryption(e.to_string()))
    }
}

impl fmt::Debug for KeySecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeySecret(..)")
    }
}

impl fmt::Display for KeySecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", base58::encode_z("keySecret", &self.0))
    }
}

impl std::str::FromStr for KeySecret {
    type Err = base58::Base58Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(base58::decode_z_array("keySecret", s)?))
    }
}

/// A symmetric ciphertext envelope: nonce plus ChaCha20-Poly1305 output.
#[derive(Clone, PartialEq, Eq)]
pub struct Encrypted {
    /// The nonce used for this encryption (unique per envelope).
    pub nonce: [u8; 12],
    /// The ciphertext, including the authentication tag.
    pub ciphertext: Bytes,
}

impl Encrypted {
    fn to_wire(&self) -> String {
        let mut bytes = Vec::with_capacity(12 + self.ciphertext.len());
        bytes.extend_from_slice(&self.nonce);
        bytes.extend_from_slice(&self.ciphertext);
        base58::encode_z("encrypted", &bytes)
    }

    fn from_wire(s: &str) -> Result<Self, base58::Base58Error> {
        let bytes = base58::decode_z("encrypted", s)?;
        if bytes.len() < 12 {
            return Err(base58::Base58Error::WrongLength {
                expected: 12,
                got: bytes.len(),
            });
        }
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&bytes[..12]);
        Ok(Self {
            nonce,
            ciphertext: Bytes::from(bytes[12..].to_vec()),
        })
    }
}

impl fmt::Debug for Encrypted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Encrypted({} bytes)", self.ciphertext.len())
    }
}

/// A sealed box: key material encrypted to a recipient's sealing key.
///
/// Built from an ephemeral X25519 key agreement, so only the holder of the
/// recipient's sealing secret can open it.
#[derive(Clone, PartialEq, Eq)]
pub struct Sealed {
    /// Ephemeral public key, the sender's side of the agreement.
    pub ephemeral: SealerPub,
    /// Nonce for the wrapping encryption.
    pub nonce: [u8; 12],
    /// The wrapped plaintext.
    pub ciphertext: Vec<u8>,
}

impl Sealed {
    /// Seal plaintext to a recipient. `context` separates uses of the
    /// same key pair (for example, the key id being revealed).
    pub fn seal(
        plaintext: &[u8],
        recipient: &SealerPub,
        context: &[u8],
    ) -> Result<Self, CryptoError> {
        let mut rng = rand::thread_rng();
        let mut seed = [0u8; 32];
        rng.fill_bytes(&mut seed);
        let ephemeral_secret = StaticSecret::from(seed);
        let ephemeral = SealerPub(*PublicKey::from(&ephemeral_secret).as_bytes());

        let shared = ephemeral_secret.diffie_hellman(&recipient.to_dalek());
        let wrap_key = derive_wrap_key(shared.as_bytes(), context);

        let env = wrap_key.encrypt(plaintext)?;
        Ok(Self {
            ephemeral,
            nonce: env.nonce,
            ciphertext: env.ciphertext.to_vec(),
        })
    }

    /// Open a sealed box with the recipient's sealing secret.
    pub fn unseal(
        &self,
        recipient: &SealerSecret,
        context: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let wrap_key = recipient.shared_wrap_key(&self.ephemeral, context);
        wrap_key.decrypt(&Encrypted {
            nonce: self.nonce,
            ciphertext: Bytes::from(self.ciphertext.clone()),
        })
    }

    fn to_wire(&self) -> String {
        let mut bytes = Vec::with_capacity(32 + 12 + self.ciphertext.len());
        bytes.extend_from_slice(&self.ephemeral.0);
        bytes.extend_from_slice(&self.nonce);
        bytes.extend_from_slice(&self.ciphertext);
        base58::encode_z("sealed", &bytes)
    }

    fn from_wire(s: &str) -> Result<Self, base58::Base58Error> {
        let bytes = base58::decode_z("sealed", s)?;
        if bytes.len() < 44 {
            return Err(base58::Base58Error::WrongLength {
                expected: 44,
                got: bytes.len(),
            });
        }
        let mut ephemeral = [0u8; 32];
        ephemeral.copy_from_slice(&bytes[..32]);
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&bytes[32..44]);
        Ok(Self {
            ephemeral: SealerPub(ephemeral),
            nonce,
            ciphertext: bytes[44..].to_vec(),
        })
    }
}

impl fmt::Debug for Sealed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sealed({} bytes)", self.ciphertext.len())
    }
}

/// The full secret identity of an agent: one seed, two derived keys.
#[derive(Clone)]
pub struct AgentSecret {
    signer: SignerSecret,
    sealer: SealerSecret,
}

impl AgentSecret {
    /// Generate a fresh agent secret.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut seed = [0u8; 32];
        rng.fill_bytes(&mut seed);
        Self::from_seed(&seed)
    }

    /// Derive both keys from one 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let mut signer_hasher = blake3::Hasher::new_derive_key("weft-agent-v0-signer");
        signer_hasher.update(seed);
        let signer_seed = *signer_hasher.finalize().as_bytes();

        let mut sealer_hasher = blake3::Hasher::new_derive_key("weft-agent-v0-sealer");
        sealer_hasher.update(seed);
        let sealer_seed = *sealer_hasher.finalize().as_bytes();

        Self {
            signer: SignerSecret::from_seed(&signer_seed),
            sealer: SealerSecret::from_seed(&sealer_seed),
        }
    }

    /// The signing half.
    pub fn signer(&self) -> &SignerSecret {
        &self.signer
    }

    /// The sealing half.
    pub fn sealer(&self) -> &SealerSecret {
        &self.sealer
    }
}

impl fmt::Debug for AgentSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AgentSecret({:?})", self.signer.public())
    }
}

macro_rules! serde_via_string {
    ($type:ty) => {
        impl Serialize for $type {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $type {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

serde_via_string!(Blake3Hash);
serde_via_string!(SignerPub);
serde_via_string!(SealerPub);
serde_via_string!(Signature);
serde_via_string!(KeySecret);

impl Serialize for Encrypted {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_wire())
    }
}

impl<'de> Deserialize<'de> for Encrypted {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_wire(&s).map_err(serde::de::Error::custom)
    }
}

impl Serialize for Sealed {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_wire())
    }
}

impl<'de> Deserialize<'de> for Sealed {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_wire(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let secret = SignerSecret::generate();
        let message = b"append-only history";
        let signature = secret.sign(message);

        secret
            .public()
            .verify(message, &signature)
            .expect("valid signature should verify");

        assert!(secret.public().verify(b"tampered", &signature).is_err());
    }

    #[test]
    fn test_signer_deterministic_from_seed() {
        let seed = [0x42u8; 32];
        let a = SignerSecret::from_seed(&seed);
        let b = SignerSecret::from_seed(&seed);
        assert_eq!(a.public(), b.public());
    }

    #[test]
    fn test_streaming_hash_incremental_matches_whole() {
        let mut h1 = StreamingHash::new();
        h1.update(b"one");
        h1.update(b"two");

        let mut h2 = StreamingHash::new();
        h2.update(b"one");
        let mid = h2.current();
        h2.update(b"two");

        assert_eq!(h1.current(), h2.current());
        assert_ne!(mid, h2.current());
    }

    #[test]
    fn test_streaming_hash_length_prefixed() {
        // "ab" + "c" must differ from "a" + "bc".
        let mut h1 = StreamingHash::new();
        h1.update(b"ab");
        h1.update(b"c");

        let mut h2 = StreamingHash::new();
        h2.update(b"a");
        h2.update(b"bc");

        assert_ne!(h1.current(), h2.current());
    }

    #[test]
    fn test_symmetric_roundtrip() {
        let key = KeySecret::generate();
        let envelope = key.encrypt(b"secret changes").unwrap();
        assert_eq!(key.decrypt(&envelope).unwrap(), b"secret changes");

        let other = KeySecret::generate();
        assert!(other.decrypt(&envelope).is_err());
    }

    #[test]
    fn test_seal_unseal() {
        let recipient = SealerSecret::generate();
        let sealed = Sealed::seal(b"read key", &recipient.public(), b"ctx").unwrap();

        assert_eq!(sealed.unseal(&recipient, b"ctx").unwrap(), b"read key");

        // Wrong recipient fails.
        let other = SealerSecret::generate();
        assert!(sealed.unseal(&other, b"ctx").is_err());

        // Wrong context fails.
        assert!(sealed.unseal(&recipient, b"other").is_err());
    }

    #[test]
    fn test_agent_secret_derivation() {
        let seed = [7u8; 32];
        let a = AgentSecret::from_seed(&seed);
        let b = AgentSecret::from_seed(&seed);
        assert_eq!(a.signer().public(), b.signer().public());
        assert_eq!(a.sealer().public(), b.sealer().public());
        // Signer and sealer seeds are independent.
        assert_ne!(a.signer().seed(), a.sealer().seed());
    }

    #[test]
    fn test_envelope_wire_roundtrip() {
        let key = KeySecret::generate();
        let envelope = key.encrypt(b"payload").unwrap();
        let json = serde_json::to_string(&envelope).unwrap();
        let back: Encrypted = serde_json::from_str(&json).unwrap();
        assert_eq!(envelope, back);
    }

    #[test]
    fn test_sealed_wire_roundtrip() {
        let recipient = SealerSecret::generate();
        let sealed = Sealed::seal(b"k", &recipient.public(), b"ctx").unwrap();
        let json = serde_json::to_string(&sealed).unwrap();
        let back: Sealed = serde_json::from_str(&json).unwrap();
        assert_eq!(sealed, back);
        assert_eq!(back.unseal(&recipient, b"ctx").unwrap(), b"k");
    }
}
