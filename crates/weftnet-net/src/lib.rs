//! Weftnet Network Layer
//!
//! Transports and reachability machinery beneath the overlay core:
//! - Overlay packet wire format
//! - Local connectivity classification (Blocked / NAT / Open)
//! - TCP proxy relaying for firewalled peers
//! - Tunneling across the secondary lookup overlay
//! - UDP transport with a bounded inbound queue

pub mod error;
pub mod firewall;
pub mod proxy;
pub mod transport;
pub mod tunnel;
pub mod wire;

pub use error::{NetError, NetResult};
pub use firewall::{is_lan, ConnectivityClassifier};
pub use proxy::{
    spawn_link, LinkId, ProxyAdmission, ProxyInbound, ProxyRelay, ProxyRole, ProxySet,
    MAX_CONNECT_ATTEMPTS,
};
pub use transport::{
    spawn_tcp_acceptor, TransportMessage, UdpTransport, UdpTransportBuilder, INBOUND_QUEUE_DEPTH,
};
pub use tunnel::TunnelRelay;
pub use wire::{Packet, PacketKind, TunnelEnvelope, HEADER_SIZE, MAX_PACKET_SIZE};
