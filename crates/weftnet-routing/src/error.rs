//! Routing error types

use thiserror::Error;

/// Routing table errors
#[derive(Debug, Error)]
pub enum RoutingError {
    /// Contact carries an invalid (zero) identifier
    #[error("Invalid contact: zero peer or client identifier")]
    InvalidIdentifier,

    /// Contact refers to the local identity
    #[error("Contact refers to the local identity")]
    SelfContact,

    /// Wire record could not be decoded
    #[error("Malformed contact record: {0}")]
    MalformedRecord(String),

    /// Unknown firewall state byte on the wire
    #[error("Unknown firewall state: 0x{0:02x}")]
    UnknownFirewallState(u8),
}

/// Result type for routing operations
pub type RoutingResult<T> = Result<T, RoutingError>;
