//! Weftnet Cryptographic Primitives
//!
//! This crate provides all cryptographic operations for the Weftnet overlay:
//! - Peer identity and digital signatures (Ed25519)
//! - Key exchange (X25519) and key derivation (HKDF-SHA256)
//! - Sealed symmetric-key transport (ephemeral X25519 + ChaCha20-Poly1305)
//! - Block-aligned session stream encryption (AES-256-CBC)

pub mod block;
pub mod error;
pub mod identity;
pub mod keys;

pub use block::{tunnel_key, BlockDecryptor, BlockEncryptor, SessionKey};
pub use error::{CryptoError, CryptoResult};
pub use identity::{ClientId, NodeIdentity, PeerId, PublicNodeInfo, Signature};
pub use keys::{DerivedKeys, KeyPair, PublicKey, SealedKey, SecretKey, SharedSecret};

/// Protocol constants
pub mod constants {
    /// X25519 key size in bytes
    pub const X25519_KEY_SIZE: usize = 32;

    /// AES-256 session key size
    pub const SESSION_KEY_SIZE: usize = 32;

    /// AES cipher block size; the session stream pads to this boundary
    pub const BLOCK_SIZE: usize = 16;

    /// ChaCha20-Poly1305 nonce size used by the sealed-key construction
    pub const SEAL_NONCE_SIZE: usize = 12;

    /// Ed25519 signature size
    pub const SIGNATURE_SIZE: usize = 64;

    /// Ed25519 public key size
    pub const ED25519_PUBKEY_SIZE: usize = 32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_key_transport_flow() {
        // Initiator seals a fresh session key to the responder's
        // long-term key; both ends derive matching cipher streams.
        let responder = NodeIdentity::generate();

        let key = SessionKey::generate();
        let sealed = SealedKey::seal(&responder.public_key(), &key).unwrap();
        let opened = sealed.open(&responder.encryption_keypair().secret).unwrap();

        let mut enc = BlockEncryptor::new(&key);
        let mut dec = BlockDecryptor::new(&opened);

        let original = vec![0x5A; 48];
        let mut data = original.clone();
        enc.encrypt_blocks(&mut data).unwrap();
        dec.decrypt_blocks(&mut data).unwrap();

        assert_eq!(data, original);
    }
}
