//! Core protocol error types

use thiserror::Error;
use weftnet_crypto::{ClientId, PeerId};

/// Errors of the session protocol and dispatcher
#[derive(Debug, Error)]
pub enum CoreError {
    /// Handshake step failed; fatal to this session only
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// A packet arrived that the current session state does not allow
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    /// A second claimant for an already active (peer, client) pairing
    #[error("Duplicate session for peer {peer} client {client:?}")]
    DuplicateSession { peer: PeerId, client: ClientId },

    /// Frame could not be parsed from the session stream; fatal
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// The plaintext send buffer cannot take the packet
    #[error("Send buffer full: need {needed}, {available} available")]
    SendBufferFull { needed: usize, available: usize },

    /// The encrypt buffer cannot take the staged plaintext
    #[error("Encrypt buffer full: need {needed}, {available} available")]
    EncryptBufferFull { needed: usize, available: usize },

    /// The receive buffer cannot take more raw bytes
    #[error("Receive buffer full")]
    RecvBufferFull,

    /// No session exists for the pairing
    #[error("No session for peer {peer} client {client:?}")]
    NoSession { peer: PeerId, client: ClientId },

    /// The session is not active yet or anymore
    #[error("Session not active: {0}")]
    NotActive(String),

    /// Payload (de)serialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Crypto error
    #[error("Crypto error: {0}")]
    Crypto(#[from] weftnet_crypto::CryptoError),

    /// Network error
    #[error("Network error: {0}")]
    Net(#[from] weftnet_net::NetError),

    /// Routing error
    #[error("Routing error: {0}")]
    Routing(#[from] weftnet_routing::RoutingError),

    /// The dispatcher task is gone
    #[error("Dispatcher unavailable")]
    DispatcherGone,
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;
