//! Block-Aligned Session Encryption (AES-256-CBC)
//!
//! The session protocol encrypts its byte stream in whole cipher blocks:
//! the send buffer is padded to a block boundary before encryption, and
//! the receive side decrypts complete blocks as they arrive. That calls
//! for a raw block mode with chaining state that survives across calls,
//! which is what this module provides. Authenticity comes from the
//! signed handshake, not from a per-record tag.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes256;
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::{BLOCK_SIZE, SESSION_KEY_SIZE};
use crate::error::{CryptoError, CryptoResult};
use crate::identity::PeerId;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// A 256-bit symmetric session key
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey {
    bytes: [u8; SESSION_KEY_SIZE],
}

impl SessionKey {
    /// Create a key from raw bytes
    pub fn from_bytes(bytes: [u8; SESSION_KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Try to create from a slice
    pub fn try_from_slice(slice: &[u8]) -> CryptoResult<Self> {
        if slice.len() != SESSION_KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: SESSION_KEY_SIZE,
                actual: slice.len(),
            });
        }
        let mut bytes = [0u8; SESSION_KEY_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self { bytes })
    }

    /// Generate a random key
    pub fn generate() -> Self {
        let mut bytes = [0u8; SESSION_KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_SIZE] {
        &self.bytes
    }

    /// Derive the deterministic CBC initialization vector for this key.
    ///
    /// Both directions of a session use a distinct key, so deriving the
    /// IV from the key keeps the two ends in sync without transmitting it.
    fn derive_iv(&self) -> [u8; BLOCK_SIZE] {
        let derived = blake3::derive_key("weftnet session iv", &self.bytes);
        let mut iv = [0u8; BLOCK_SIZE];
        iv.copy_from_slice(&derived[..BLOCK_SIZE]);
        iv
    }
}

/// Derive the per-recipient tunnel key: the operation key with its low
/// 8 bytes XORed against the recipient identifier. The shared lookup
/// overlay never holds the operation key, so it cannot recover the
/// recipient key either.
pub fn tunnel_key(operation_key: &SessionKey, recipient: PeerId) -> SessionKey {
    let mut bytes = *operation_key.as_bytes();
    let id = recipient.to_be_bytes();
    for (i, b) in id.iter().enumerate() {
        bytes[SESSION_KEY_SIZE - 8 + i] ^= b;
    }
    SessionKey::from_bytes(bytes)
}

/// Incremental block encryptor for one direction of a session.
///
/// Chaining state persists between calls: encrypting two buffers in
/// sequence is identical to encrypting their concatenation.
pub struct BlockEncryptor {
    inner: Aes256CbcEnc,
}

/// Incremental block decryptor, the mirror of [`BlockEncryptor`].
pub struct BlockDecryptor {
    inner: Aes256CbcDec,
}

impl BlockEncryptor {
    /// Create an encryptor for the given session key
    pub fn new(key: &SessionKey) -> Self {
        let iv = key.derive_iv();
        let inner = Aes256CbcEnc::new_from_slices(key.as_bytes(), &iv)
            .expect("key and IV sizes are fixed");
        Self { inner }
    }

    /// Encrypt a block-aligned buffer in place
    pub fn encrypt_blocks(&mut self, data: &mut [u8]) -> CryptoResult<()> {
        if data.len() % BLOCK_SIZE != 0 {
            return Err(CryptoError::UnalignedInput {
                len: data.len(),
                block: BLOCK_SIZE,
            });
        }
        for chunk in data.chunks_exact_mut(BLOCK_SIZE) {
            self.inner
                .encrypt_block_mut(GenericArray::from_mut_slice(chunk));
        }
        Ok(())
    }
}

impl BlockDecryptor {
    /// Create a decryptor for the given session key
    pub fn new(key: &SessionKey) -> Self {
        let iv = key.derive_iv();
        let inner = Aes256CbcDec::new_from_slices(key.as_bytes(), &iv)
            .expect("key and IV sizes are fixed");
        Self { inner }
    }

    /// Decrypt a block-aligned buffer in place
    pub fn decrypt_blocks(&mut self, data: &mut [u8]) -> CryptoResult<()> {
        if data.len() % BLOCK_SIZE != 0 {
            return Err(CryptoError::UnalignedInput {
                len: data.len(),
                block: BLOCK_SIZE,
            });
        }
        for chunk in data.chunks_exact_mut(BLOCK_SIZE) {
            self.inner
                .decrypt_block_mut(GenericArray::from_mut_slice(chunk));
        }
        Ok(())
    }
}
