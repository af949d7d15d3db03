//! Network error types

use thiserror::Error;
use weftnet_crypto::PeerId;

/// Network layer errors
#[derive(Debug, Error)]
pub enum NetError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Address already in use
    #[error("Address already in use: {0}")]
    AddressInUse(std::net::SocketAddr),

    /// Invalid packet
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    /// Outbound buffer is full; the caller must back off
    #[error("Send buffer full towards {0}")]
    BufferFull(PeerId),

    /// OS socket send buffer is full; the caller must back off
    #[error("Socket send buffer full")]
    SocketFull,

    /// Too many outbound proxy connection attempts in flight
    #[error("Too many concurrent connection attempts")]
    TooManyAttempts,

    /// No transport handle for the peer
    #[error("No route to peer {0}")]
    NoRoute(PeerId),

    /// The operation declares restricted access; tunneling is refused
    #[error("Tunneling refused for restricted operation")]
    TunnelRestricted,

    /// Tunnel payload failed to decrypt
    #[error("Tunnel payload rejected")]
    TunnelRejected,

    /// Crypto error
    #[error("Crypto error: {0}")]
    Crypto(#[from] weftnet_crypto::CryptoError),

    /// Routing error
    #[error("Routing error: {0}")]
    Routing(#[from] weftnet_routing::RoutingError),

    /// Receive queue or peer channel closed
    #[error("Channel closed")]
    ChannelClosed,
}

/// Result type for network operations
pub type NetResult<T> = Result<T, NetError>;
