//! X25519 Key Exchange
//!
//! Provides Diffie-Hellman key exchange using Curve25519, HKDF-based
//! session key derivation, and the sealed-key construction used to
//! transport fresh symmetric keys to a recipient's long-term key.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce as ChaNonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::block::SessionKey;
use crate::constants::{SEAL_NONCE_SIZE, SESSION_KEY_SIZE, X25519_KEY_SIZE};
use crate::error::{CryptoError, CryptoResult};

/// A static X25519 secret key (for long-term peer identity)
#[derive(ZeroizeOnDrop)]
pub struct SecretKey {
    inner: StaticSecret,
}

/// A X25519 public key
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey {
    bytes: [u8; X25519_KEY_SIZE],
}

/// A keypair containing both secret and public keys
pub struct KeyPair {
    pub secret: SecretKey,
    pub public: PublicKey,
}

/// Shared secret derived from X25519 key exchange
#[derive(ZeroizeOnDrop)]
pub struct SharedSecret {
    bytes: [u8; SESSION_KEY_SIZE],
}

impl SecretKey {
    /// Generate a new random secret key
    pub fn generate() -> Self {
        Self {
            inner: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; X25519_KEY_SIZE]) -> Self {
        Self {
            inner: StaticSecret::from(bytes),
        }
    }

    /// Perform Diffie-Hellman key exchange
    pub fn diffie_hellman(&self, their_public: &PublicKey) -> SharedSecret {
        let their_public = X25519Public::from(their_public.bytes);
        let shared = self.inner.diffie_hellman(&their_public);
        SharedSecret {
            bytes: shared.to_bytes(),
        }
    }

    /// Get the corresponding public key
    pub fn public_key(&self) -> PublicKey {
        let public = X25519Public::from(&self.inner);
        PublicKey {
            bytes: public.to_bytes(),
        }
    }

    /// Export raw bytes (use with caution!)
    pub fn to_bytes(&self) -> [u8; X25519_KEY_SIZE] {
        self.inner.to_bytes()
    }
}

impl Clone for SecretKey {
    fn clone(&self) -> Self {
        Self::from_bytes(self.to_bytes())
    }
}

impl PublicKey {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; X25519_KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Try to create from a slice
    pub fn try_from_slice(slice: &[u8]) -> CryptoResult<Self> {
        if slice.len() != X25519_KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: X25519_KEY_SIZE,
                actual: slice.len(),
            });
        }
        let mut bytes = [0u8; X25519_KEY_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self { bytes })
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; X25519_KEY_SIZE] {
        &self.bytes
    }

    /// Convert to bytes
    pub fn to_bytes(&self) -> [u8; X25519_KEY_SIZE] {
        self.bytes
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({:?}...)", &self.bytes[..4])
    }
}

impl KeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let secret = SecretKey::generate();
        let public = secret.public_key();
        Self { secret, public }
    }

    /// Create from raw secret bytes
    pub fn from_bytes(bytes: [u8; X25519_KEY_SIZE]) -> Self {
        let secret = SecretKey::from_bytes(bytes);
        let public = secret.public_key();
        Self { secret, public }
    }
}

impl Clone for KeyPair {
    fn clone(&self) -> Self {
        Self {
            secret: self.secret.clone(),
            public: self.public,
        }
    }
}

impl SharedSecret {
    /// Get the shared secret bytes
    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_SIZE] {
        &self.bytes
    }

    /// Derive a directional key pair from this secret using HKDF-SHA256
    pub fn derive_keys(&self, info: &[u8]) -> DerivedKeys {
        use hkdf::Hkdf;
        use sha2::Sha256;

        let hkdf = Hkdf::<Sha256>::new(None, &self.bytes);

        let mut forward_key = [0u8; SESSION_KEY_SIZE];
        let mut backward_key = [0u8; SESSION_KEY_SIZE];

        let mut forward_info = info.to_vec();
        forward_info.extend_from_slice(b":forward");
        hkdf.expand(&forward_info, &mut forward_key)
            .expect("HKDF expand failed");

        let mut backward_info = info.to_vec();
        backward_info.extend_from_slice(b":backward");
        hkdf.expand(&backward_info, &mut backward_key)
            .expect("HKDF expand failed");

        DerivedKeys {
            forward_key,
            backward_key,
        }
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; SESSION_KEY_SIZE]) -> Self {
        Self { bytes }
    }
}

/// Keys derived from a shared secret for bidirectional communication
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DerivedKeys {
    /// Key for the initiator-to-responder direction
    pub forward_key: [u8; SESSION_KEY_SIZE],
    /// Key for the responder-to-initiator direction
    pub backward_key: [u8; SESSION_KEY_SIZE],
}

/// A fresh symmetric key sealed to a recipient's long-term X25519 key.
///
/// Sealing generates an ephemeral X25519 keypair, computes the shared
/// secret against the recipient's public key, and wraps the payload key
/// under ChaCha20-Poly1305. The ephemeral symmetric key only ever exists
/// inside the seal, so a seal cannot be replayed against a different
/// recipient.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SealedKey {
    /// Ephemeral X25519 public key
    pub ephemeral: [u8; X25519_KEY_SIZE],
    /// AEAD nonce
    pub nonce: [u8; SEAL_NONCE_SIZE],
    /// Wrapped key material (payload key + tag)
    pub ciphertext: Vec<u8>,
}

impl SealedKey {
    /// Seal a session key to the recipient's long-term public key
    pub fn seal(recipient: &PublicKey, key: &SessionKey) -> CryptoResult<Self> {
        let ephemeral_secret = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_public = X25519Public::from(&ephemeral_secret);

        let shared = ephemeral_secret.diffie_hellman(&X25519Public::from(recipient.bytes));
        let wrap = SharedSecret::from_bytes(shared.to_bytes()).derive_keys(b"weftnet:seal");

        let cipher = ChaCha20Poly1305::new_from_slice(&wrap.forward_key)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let mut nonce = [0u8; SEAL_NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(ChaNonce::from_slice(&nonce), key.as_bytes().as_slice())
            .map_err(|_| CryptoError::EncryptionFailed("key wrap failed".into()))?;

        Ok(Self {
            ephemeral: ephemeral_public.to_bytes(),
            nonce,
            ciphertext,
        })
    }

    /// Open a seal with the recipient's long-term secret key
    pub fn open(&self, recipient_secret: &SecretKey) -> CryptoResult<SessionKey> {
        let ephemeral = PublicKey::from_bytes(self.ephemeral);
        let shared = recipient_secret.diffie_hellman(&ephemeral);
        let wrap = shared.derive_keys(b"weftnet:seal");

        let cipher = ChaCha20Poly1305::new_from_slice(&wrap.forward_key)
            .map_err(|_| CryptoError::DecryptionFailed)?;

        let plaintext = cipher
            .decrypt(ChaNonce::from_slice(&self.nonce), self.ciphertext.as_slice())
            .map_err(|_| CryptoError::DecryptionFailed)?;

        SessionKey::try_from_slice(&plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_exchange() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();

        let alice_shared = alice.secret.diffie_hellman(&bob.public);
        let bob_shared = bob.secret.diffie_hellman(&alice.public);

        assert_eq!(alice_shared.as_bytes(), bob_shared.as_bytes());
    }

    #[test]
    fn test_key_derivation_directions_differ() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();

        let shared = alice.secret.diffie_hellman(&bob.public);
        let keys = shared.derive_keys(b"weftnet:session");

        assert_ne!(keys.forward_key, keys.backward_key);
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let recipient = KeyPair::generate();
        let key = SessionKey::generate();

        let sealed = SealedKey::seal(&recipient.public, &key).unwrap();
        let opened = sealed.open(&recipient.secret).unwrap();

        assert_eq!(opened.as_bytes(), key.as_bytes());
    }

    #[test]
    fn test_seal_wrong_recipient_fails() {
        let recipient = KeyPair::generate();
        let other = KeyPair::generate();
        let key = SessionKey::generate();

        let sealed = SealedKey::seal(&recipient.public, &key).unwrap();
        assert!(sealed.open(&other.secret).is_err());
    }

    #[test]
    fn test_public_key_serialization() {
        let keypair = KeyPair::generate();
        let bytes = keypair.public.to_bytes();
        let restored = PublicKey::from_bytes(bytes);

        assert_eq!(keypair.public, restored);
    }
}
