//! Session handshake payloads
//!
//! Four packet kinds drive session establishment. KeyRequest/KeyAck
//! exchange long-term public keys when a side does not know its peer
//! yet. SessionRequest transports a fresh per-direction session key,
//! sealed to the recipient's long-term X25519 key and signed with the
//! sender's long-term Ed25519 key; SessionAck confirms it and carries
//! the sender's display name. Authentication is mutual: each side
//! checks that the claimed peer identifier is derived from the signing
//! key presented, verifies the signature, and compares against any
//! previously known keys.

use serde::{Deserialize, Serialize};
use weftnet_crypto::{
    ClientId, NodeIdentity, PeerId, PublicKey, PublicNodeInfo, SealedKey, SessionKey, Signature,
};

use crate::error::{CoreError, CoreResult};

/// Long-term public keys of one side, sent as KeyRequest or KeyAck
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyExchangePayload {
    /// Sender's peer identifier
    pub peer_id: PeerId,

    /// Sender's instance sub-identity
    pub client_id: ClientId,

    /// Sender's Ed25519 public key
    pub signing_pubkey: [u8; 32],

    /// Sender's X25519 public key
    pub encryption_pubkey: PublicKey,
}

impl KeyExchangePayload {
    /// Build from the local identity
    pub fn from_identity(identity: &NodeIdentity) -> Self {
        let info = identity.public_info();
        Self {
            peer_id: info.peer_id,
            client_id: identity.client_id(),
            signing_pubkey: info.signing_pubkey,
            encryption_pubkey: info.encryption_pubkey,
        }
    }

    /// Validate the identifier derivation and convert to peer info
    pub fn into_info(self) -> CoreResult<PublicNodeInfo> {
        if self.peer_id != PeerId::from_pubkey(&self.signing_pubkey) {
            return Err(CoreError::HandshakeFailed(
                "peer identifier does not match signing key".into(),
            ));
        }
        Ok(PublicNodeInfo {
            peer_id: self.peer_id,
            signing_pubkey: self.signing_pubkey,
            encryption_pubkey: self.encryption_pubkey,
        })
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> CoreResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> CoreResult<Self> {
        bincode::deserialize(bytes).map_err(|e| CoreError::Serialization(e.to_string()))
    }
}

/// SessionRequest: a sealed per-direction session key plus the sender's
/// long-term keys and a signature binding it all to both identities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRequestPayload {
    /// Sender's peer identifier
    pub peer_id: PeerId,

    /// Sender's instance sub-identity
    pub client_id: ClientId,

    /// Sender's Ed25519 public key
    pub signing_pubkey: [u8; 32],

    /// Sender's X25519 public key
    pub encryption_pubkey: PublicKey,

    /// The sender's outbound session key, sealed to the recipient
    pub sealed_key: SealedKey,

    /// Signature over identities and sealed key
    pub signature: Signature,
}

fn session_request_signed_bytes(
    sender: PeerId,
    recipient: PeerId,
    sealed: &SealedKey,
) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(96 + sealed.ciphertext.len());
    bytes.extend_from_slice(b"weftnet:session-request");
    bytes.extend_from_slice(&sender.to_be_bytes());
    bytes.extend_from_slice(&recipient.to_be_bytes());
    bytes.extend_from_slice(&sealed.ephemeral);
    bytes.extend_from_slice(&sealed.nonce);
    bytes.extend_from_slice(&sealed.ciphertext);
    bytes
}

impl SessionRequestPayload {
    /// Seal the session key to the recipient and sign the request
    pub fn build(
        identity: &NodeIdentity,
        recipient: &PublicNodeInfo,
        session_key: &SessionKey,
    ) -> CoreResult<Self> {
        let sealed_key = SealedKey::seal(&recipient.encryption_pubkey, session_key)?;
        let signature = identity.sign(&session_request_signed_bytes(
            identity.peer_id(),
            recipient.peer_id,
            &sealed_key,
        ));
        let info = identity.public_info();
        Ok(Self {
            peer_id: info.peer_id,
            client_id: identity.client_id(),
            signing_pubkey: info.signing_pubkey,
            encryption_pubkey: info.encryption_pubkey,
            sealed_key,
            signature,
        })
    }

    /// Verify the request as the recipient and return the sender's
    /// authenticated public info. When the sender was already known,
    /// the presented keys must match the known ones.
    pub fn verify(
        &self,
        recipient: PeerId,
        known: Option<&PublicNodeInfo>,
    ) -> CoreResult<PublicNodeInfo> {
        let info = KeyExchangePayload {
            peer_id: self.peer_id,
            client_id: self.client_id,
            signing_pubkey: self.signing_pubkey,
            encryption_pubkey: self.encryption_pubkey,
        }
        .into_info()?;

        if let Some(known) = known {
            if known.signing_pubkey != info.signing_pubkey
                || known.encryption_pubkey != info.encryption_pubkey
            {
                return Err(CoreError::HandshakeFailed(
                    "presented keys differ from known identity".into(),
                ));
            }
        }

        info.verify(
            &session_request_signed_bytes(self.peer_id, recipient, &self.sealed_key),
            &self.signature,
        )
        .map_err(|_| CoreError::HandshakeFailed("session request signature invalid".into()))?;

        Ok(info)
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> CoreResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> CoreResult<Self> {
        bincode::deserialize(bytes).map_err(|e| CoreError::Serialization(e.to_string()))
    }
}

/// SessionAck: signed confirmation carrying the display name
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionAckPayload {
    /// Sender's peer identifier
    pub peer_id: PeerId,

    /// Sender's instance sub-identity
    pub client_id: ClientId,

    /// Human-readable name shown to the collaboration platform
    pub display_name: String,

    /// Signature over identities and name
    pub signature: Signature,
}

fn session_ack_signed_bytes(sender: PeerId, recipient: PeerId, name: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(40 + name.len());
    bytes.extend_from_slice(b"weftnet:session-ack");
    bytes.extend_from_slice(&sender.to_be_bytes());
    bytes.extend_from_slice(&recipient.to_be_bytes());
    bytes.extend_from_slice(name.as_bytes());
    bytes
}

impl SessionAckPayload {
    /// Sign an acknowledgment for the recipient
    pub fn build(identity: &NodeIdentity, recipient: PeerId, display_name: &str) -> Self {
        let signature = identity.sign(&session_ack_signed_bytes(
            identity.peer_id(),
            recipient,
            display_name,
        ));
        Self {
            peer_id: identity.peer_id(),
            client_id: identity.client_id(),
            display_name: display_name.to_string(),
            signature,
        }
    }

    /// Verify against the sender's authenticated keys
    pub fn verify(&self, recipient: PeerId, signer: &PublicNodeInfo) -> CoreResult<()> {
        if signer.peer_id != self.peer_id {
            return Err(CoreError::HandshakeFailed(
                "acknowledgment claims a different peer".into(),
            ));
        }
        signer
            .verify(
                &session_ack_signed_bytes(self.peer_id, recipient, &self.display_name),
                &self.signature,
            )
            .map_err(|_| CoreError::HandshakeFailed("session ack signature invalid".into()))
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> CoreResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> CoreResult<Self> {
        bincode::deserialize(bytes).map_err(|e| CoreError::Serialization(e.to_string()))
    }
}
