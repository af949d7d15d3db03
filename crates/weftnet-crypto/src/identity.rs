//! Peer Identity Management
//!
//! Provides Ed25519-based identity for peers.
//! Each peer has:
//! - A signing keypair (Ed25519) for authentication
//! - An encryption keypair (X25519) for key exchange
//! - A 64-bit PeerId derived from the signing public key
//!
//! A running instance additionally carries a ClientId, a 16-bit
//! sub-identity distinguishing multiple instances of the same peer.

use ed25519_dalek::{Signature as Ed25519Sig, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;
use zeroize::ZeroizeOnDrop;

use crate::constants::{ED25519_PUBKEY_SIZE, SIGNATURE_SIZE};
use crate::error::{CryptoError, CryptoResult};
use crate::keys::{KeyPair, PublicKey};

/// A 64-bit peer identifier (truncated BLAKE3 hash of the signing key).
///
/// Distance between two identifiers is XOR, giving the symmetric metric
/// the routing table is built on.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(u64);

/// A 16-bit per-running-instance sub-identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(u16);

/// Ed25519 signature
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Signature {
    #[serde(with = "BigArray")]
    bytes: [u8; SIGNATURE_SIZE],
}

/// A peer's complete identity (signing + encryption keys)
#[derive(ZeroizeOnDrop)]
pub struct NodeIdentity {
    /// Ed25519 signing key
    #[zeroize(skip)]
    signing_key: SigningKey,

    /// X25519 encryption keypair
    #[zeroize(skip)]
    encryption_keypair: KeyPair,

    /// Cached peer ID
    #[zeroize(skip)]
    peer_id: PeerId,

    /// Per-instance sub-identity
    #[zeroize(skip)]
    client_id: ClientId,
}

/// Public identity information (shareable)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublicNodeInfo {
    /// Peer's unique identifier
    pub peer_id: PeerId,

    /// Ed25519 public key for verifying signatures
    pub signing_pubkey: [u8; ED25519_PUBKEY_SIZE],

    /// X25519 public key for encryption
    pub encryption_pubkey: PublicKey,
}

impl PeerId {
    /// The invalid all-zero identifier
    pub const ZERO: PeerId = PeerId(0);

    /// Create a PeerId from a raw value
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Derive a PeerId from a public signing key
    pub fn from_pubkey(pubkey: &[u8; ED25519_PUBKEY_SIZE]) -> Self {
        let hash = blake3::hash(pubkey);
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&hash.as_bytes()[..8]);
        Self(u64::from_be_bytes(bytes))
    }

    /// Raw value
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Big-endian wire bytes
    pub fn to_be_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// XOR distance to another identifier
    pub fn distance(&self, other: &PeerId) -> u64 {
        self.0 ^ other.0
    }

    /// Whether this is the invalid zero identifier
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Hex form, fixed 16 digits
    pub fn to_hex(&self) -> String {
        format!("{:016x}", self.0)
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", &self.to_hex()[..8])
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl ClientId {
    /// The invalid zero sub-identity
    pub const ZERO: ClientId = ClientId(0);

    /// Create a ClientId from a raw value
    pub fn new(raw: u16) -> Self {
        Self(raw)
    }

    /// Generate a random non-zero ClientId
    pub fn random() -> Self {
        loop {
            let raw = (OsRng.next_u32() & 0xFFFF) as u16;
            if raw != 0 {
                return Self(raw);
            }
        }
    }

    /// Raw value
    pub fn as_u16(&self) -> u16 {
        self.0
    }

    /// Whether this is the invalid zero sub-identity
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Debug for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ClientId({:04x})", self.0)
    }
}

impl Signature {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; SIGNATURE_SIZE]) -> Self {
        Self { bytes }
    }

    /// Try to create from slice
    pub fn try_from_slice(slice: &[u8]) -> CryptoResult<Self> {
        if slice.len() != SIGNATURE_SIZE {
            return Err(CryptoError::InvalidSignature);
        }
        let mut bytes = [0u8; SIGNATURE_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self { bytes })
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.bytes
    }
}

impl NodeIdentity {
    /// Generate a new random identity with a random ClientId
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let encryption_keypair = KeyPair::generate();
        let peer_id = PeerId::from_pubkey(&signing_key.verifying_key().to_bytes());

        Self {
            signing_key,
            encryption_keypair,
            peer_id,
            client_id: ClientId::random(),
        }
    }

    /// Create from existing keys (for loading from storage)
    pub fn from_keys(
        signing_key_bytes: [u8; 32],
        encryption_key_bytes: [u8; 32],
    ) -> CryptoResult<Self> {
        let signing_key = SigningKey::from_bytes(&signing_key_bytes);
        let encryption_keypair = KeyPair::from_bytes(encryption_key_bytes);
        let peer_id = PeerId::from_pubkey(&signing_key.verifying_key().to_bytes());

        Ok(Self {
            signing_key,
            encryption_keypair,
            peer_id,
            client_id: ClientId::random(),
        })
    }

    /// Get the peer's unique identifier
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Get this instance's sub-identity
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Get the X25519 public key for encryption
    pub fn public_key(&self) -> PublicKey {
        self.encryption_keypair.public
    }

    /// Get the X25519 keypair for encryption
    pub fn encryption_keypair(&self) -> &KeyPair {
        &self.encryption_keypair
    }

    /// Get the Ed25519 verifying (public) key
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> Signature {
        let sig = self.signing_key.sign(message);
        Signature {
            bytes: sig.to_bytes(),
        }
    }

    /// Export public information
    pub fn public_info(&self) -> PublicNodeInfo {
        PublicNodeInfo {
            peer_id: self.peer_id,
            signing_pubkey: self.signing_key.verifying_key().to_bytes(),
            encryption_pubkey: self.encryption_keypair.public,
        }
    }

    /// Export secret keys for secure storage
    pub fn export_secrets(&self) -> ([u8; 32], [u8; 32]) {
        (
            self.signing_key.to_bytes(),
            self.encryption_keypair.secret.to_bytes(),
        )
    }
}

impl Clone for NodeIdentity {
    fn clone(&self) -> Self {
        let (signing_bytes, encryption_bytes) = self.export_secrets();
        let mut cloned = Self::from_keys(signing_bytes, encryption_bytes)
            .expect("Clone of valid identity should not fail");
        cloned.client_id = self.client_id;
        cloned
    }
}

impl PublicNodeInfo {
    /// Verify a signature from this peer
    pub fn verify(&self, message: &[u8], signature: &Signature) -> CryptoResult<()> {
        let verifying_key = VerifyingKey::from_bytes(&self.signing_pubkey)
            .map_err(|_| CryptoError::InvalidPublicKey)?;

        let sig = Ed25519Sig::from_bytes(&signature.bytes);

        verifying_key
            .verify(message, &sig)
            .map_err(|_| CryptoError::SignatureVerificationFailed)
    }

    /// Get the encryption public key
    pub fn encryption_pubkey(&self) -> &PublicKey {
        &self.encryption_pubkey
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_generation() {
        let identity = NodeIdentity::generate();

        assert!(!identity.peer_id().is_zero());
        assert!(!identity.client_id().is_zero());
    }

    #[test]
    fn test_sign_verify() {
        let identity = NodeIdentity::generate();
        let public_info = identity.public_info();

        let message = b"hello overlay";
        let signature = identity.sign(message);

        assert!(public_info.verify(message, &signature).is_ok());

        let wrong_message = b"hello underlay";
        assert!(public_info.verify(wrong_message, &signature).is_err());
    }

    #[test]
    fn test_export_import() {
        let identity = NodeIdentity::generate();
        let (signing_bytes, encryption_bytes) = identity.export_secrets();

        let restored = NodeIdentity::from_keys(signing_bytes, encryption_bytes).unwrap();

        assert_eq!(identity.peer_id(), restored.peer_id());
        assert_eq!(identity.public_key(), restored.public_key());
    }

    #[test]
    fn test_peer_id_distance_symmetry() {
        let a = PeerId::new(0xDEAD_BEEF_0000_1111);
        let b = PeerId::new(0x1234_5678_9ABC_DEF0);

        assert_eq!(a.distance(&b), b.distance(&a));
        assert_eq!(a.distance(&a), 0);
    }

    #[test]
    fn test_peer_id_hex() {
        let id = PeerId::new(0x0102_0304_0506_0708);
        assert_eq!(id.to_hex(), "0102030405060708");
    }
}
