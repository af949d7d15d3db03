//! Local connectivity classification
//!
//! The local firewall state is inferred purely from observed evidence:
//! any inbound UDP from a non-LAN source implies at least NAT, an
//! unsolicited inbound TCP connection implies Open. The state never
//! improves spontaneously and only degrades on an explicit disconnect.

use std::net::{IpAddr, SocketAddr};

use tracing::info;
use weftnet_routing::FirewallState;

/// Tracks the local node's reachability classification
#[derive(Debug)]
pub struct ConnectivityClassifier {
    state: FirewallState,
}

impl ConnectivityClassifier {
    /// Start pessimistic: no evidence means Blocked
    pub fn new() -> Self {
        Self {
            state: FirewallState::Blocked,
        }
    }

    /// Current classification
    pub fn state(&self) -> FirewallState {
        self.state
    }

    /// Whether the local node can expect replies to outbound traffic
    pub fn is_reachable(&self) -> bool {
        self.state != FirewallState::Blocked
    }

    /// Record an inbound UDP datagram. Returns true when the state
    /// changed.
    pub fn observe_inbound_udp(&mut self, from: SocketAddr) -> bool {
        if is_lan(from.ip()) {
            return false;
        }
        if self.state < FirewallState::Nat {
            info!(from = %from, "inbound UDP observed, firewall state Blocked -> NAT");
            self.state = FirewallState::Nat;
            return true;
        }
        false
    }

    /// Record an unsolicited inbound TCP connection. Returns true when
    /// the state changed.
    pub fn observe_inbound_tcp(&mut self, from: SocketAddr) -> bool {
        if is_lan(from.ip()) {
            return false;
        }
        if self.state < FirewallState::Open {
            info!(from = %from, prior = ?self.state, "unsolicited inbound TCP, firewall state -> Open");
            self.state = FirewallState::Open;
            return true;
        }
        false
    }

    /// Record an explicit disconnect; the classification degrades one
    /// step toward Blocked.
    pub fn on_disconnect(&mut self) {
        let next = match self.state {
            FirewallState::Open => FirewallState::Nat,
            FirewallState::Nat | FirewallState::Blocked => FirewallState::Blocked,
        };
        if next != self.state {
            info!(prior = ?self.state, now = ?next, "disconnect observed, firewall state degraded");
            self.state = next;
        }
    }
}

impl Default for ConnectivityClassifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether an address is LAN-local and therefore excluded as
/// reachability evidence.
pub fn is_lan(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}
