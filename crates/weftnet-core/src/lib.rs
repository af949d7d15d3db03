//! Weftnet Core Protocol
//!
//! The network core of the collaboration overlay:
//! - Encrypted reliable sessions (handshake, buffered block
//!   encryption, framing)
//! - The dispatcher task owning routing, connectivity, proxy and
//!   tunnel state for one overlay instance
//! - Configuration and the command handle external services use

pub mod buffers;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handshake;
pub mod session;

pub use buffers::{RecvChannel, SendChannel};
pub use config::CoreConfig;
pub use dispatcher::{
    Command, Dispatcher, DispatcherHandle, OverlayEvent, ProxyUpdatePayload,
};
pub use error::{CoreError, CoreResult};
pub use handshake::{KeyExchangePayload, SessionAckPayload, SessionRequestPayload};
pub use session::{Outbound, Session, SessionEvent, SessionManager, SessionState};

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;
