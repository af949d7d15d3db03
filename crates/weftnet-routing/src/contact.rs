//! Contacts and their wire records
//!
//! A contact is created the first time a packet carrying source info is
//! observed, refreshed on every sighting, and evicted by the maintenance
//! loop after repeated failed liveness probes.
//!
//! Wire format (19 bytes, big-endian):
//! [PeerId: 8][ClientId: 2][IPv4: 4][TcpPort: 2][UdpPort: 2][FirewallState: 1]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut};
use weftnet_crypto::{ClientId, PeerId};

use crate::error::{RoutingError, RoutingResult};
use crate::PROBE_RETRY_DELAY;

/// Locally inferred reachability classification of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum FirewallState {
    /// No inbound traffic observed; reachable only via proxy or tunnel
    Blocked = 0,
    /// Inbound UDP observed; reachable after outbound contact
    Nat = 1,
    /// Unsolicited inbound TCP observed; directly reachable
    Open = 2,
}

impl TryFrom<u8> for FirewallState {
    type Error = RoutingError;

    fn try_from(value: u8) -> Result<Self, RoutingError> {
        match value {
            0 => Ok(Self::Blocked),
            1 => Ok(Self::Nat),
            2 => Ok(Self::Open),
            other => Err(RoutingError::UnknownFirewallState(other)),
        }
    }
}

/// A tracked peer endpoint with liveness bookkeeping
#[derive(Debug, Clone)]
pub struct Contact {
    /// Peer identifier
    pub peer_id: PeerId,

    /// Per-running-instance sub-identity
    pub client_id: ClientId,

    /// IPv4 address
    pub ip: Ipv4Addr,

    /// TCP port (proxy relationships)
    pub tcp_port: u16,

    /// UDP port (overlay datagrams)
    pub udp_port: u16,

    /// Last reported firewall state
    pub firewall: FirewallState,

    /// Last time any packet from this peer was observed
    pub last_seen: Instant,

    /// Failed liveness probes since the last sighting
    pub attempts: u8,

    /// Earliest time the next liveness probe may be sent
    pub next_try: Instant,
}

/// Encoded size of a contact record
pub const CONTACT_WIRE_SIZE: usize = 19;

/// Encoded size of a replication patch entry
pub const PATCH_ENTRY_WIRE_SIZE: usize = 12;

impl Contact {
    /// Create a fresh contact from observed endpoint info
    pub fn new(
        peer_id: PeerId,
        client_id: ClientId,
        ip: Ipv4Addr,
        tcp_port: u16,
        udp_port: u16,
        firewall: FirewallState,
    ) -> Self {
        let now = Instant::now();
        Self {
            peer_id,
            client_id,
            ip,
            tcp_port,
            udp_port,
            firewall,
            last_seen: now,
            attempts: 0,
            next_try: now + PROBE_RETRY_DELAY,
        }
    }

    /// Refresh liveness and endpoint info on a sighting
    pub fn touch(&mut self, other: &Contact) {
        self.client_id = other.client_id;
        self.ip = other.ip;
        self.tcp_port = other.tcp_port;
        self.udp_port = other.udp_port;
        self.firewall = other.firewall;
        self.last_seen = Instant::now();
        self.attempts = 0;
        self.next_try = self.last_seen + PROBE_RETRY_DELAY;
    }

    /// Record an issued liveness probe and push back the retry deadline
    pub fn record_probe(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
        self.next_try = Instant::now() + PROBE_RETRY_DELAY;
    }

    /// Whether the retry deadline for the next probe has elapsed
    pub fn retriable(&self, now: Instant) -> bool {
        now >= self.next_try
    }

    /// Time since this peer was last observed
    pub fn age(&self) -> Duration {
        self.last_seen.elapsed()
    }

    /// UDP endpoint
    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.ip), self.udp_port)
    }

    /// TCP endpoint
    pub fn tcp_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.ip), self.tcp_port)
    }

    /// Encode the 19-byte wire record
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64(self.peer_id.as_u64());
        buf.put_u16(self.client_id.as_u16());
        buf.put_slice(&self.ip.octets());
        buf.put_u16(self.tcp_port);
        buf.put_u16(self.udp_port);
        buf.put_u8(self.firewall as u8);
    }

    /// Decode a 19-byte wire record; liveness fields start fresh
    pub fn decode<B: Buf>(buf: &mut B) -> RoutingResult<Self> {
        if buf.remaining() < CONTACT_WIRE_SIZE {
            return Err(RoutingError::MalformedRecord(format!(
                "contact record too short: {} bytes",
                buf.remaining()
            )));
        }

        let peer_id = PeerId::new(buf.get_u64());
        let client_id = ClientId::new(buf.get_u16());
        let mut octets = [0u8; 4];
        buf.copy_to_slice(&mut octets);
        let ip = Ipv4Addr::from(octets);
        let tcp_port = buf.get_u16();
        let udp_port = buf.get_u16();
        let firewall = FirewallState::try_from(buf.get_u8())?;

        Ok(Self::new(peer_id, client_id, ip, tcp_port, udp_port, firewall))
    }
}

/// One entry of a cache-area replication patch: the peer owning the
/// record and the version it carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchEntry {
    pub peer_id: PeerId,
    pub version: u32,
}

impl PatchEntry {
    /// Encode the 12-byte wire entry
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64(self.peer_id.as_u64());
        buf.put_u32(self.version);
    }

    /// Decode a 12-byte wire entry
    pub fn decode<B: Buf>(buf: &mut B) -> RoutingResult<Self> {
        if buf.remaining() < PATCH_ENTRY_WIRE_SIZE {
            return Err(RoutingError::MalformedRecord(format!(
                "patch entry too short: {} bytes",
                buf.remaining()
            )));
        }
        Ok(Self {
            peer_id: PeerId::new(buf.get_u64()),
            version: buf.get_u32(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn sample_contact() -> Contact {
        Contact::new(
            PeerId::new(0x0102_0304_0506_0708),
            ClientId::new(0x0A0B),
            Ipv4Addr::new(203, 0, 113, 7),
            4242,
            4243,
            FirewallState::Nat,
        )
    }

    #[test]
    fn test_contact_wire_roundtrip() {
        let contact = sample_contact();

        let mut buf = BytesMut::new();
        contact.encode(&mut buf);
        assert_eq!(buf.len(), CONTACT_WIRE_SIZE);

        let decoded = Contact::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded.peer_id, contact.peer_id);
        assert_eq!(decoded.client_id, contact.client_id);
        assert_eq!(decoded.ip, contact.ip);
        assert_eq!(decoded.tcp_port, contact.tcp_port);
        assert_eq!(decoded.udp_port, contact.udp_port);
        assert_eq!(decoded.firewall, contact.firewall);
    }

    #[test]
    fn test_contact_wire_layout() {
        let contact = sample_contact();

        let mut buf = BytesMut::new();
        contact.encode(&mut buf);

        assert_eq!(
            &buf[..],
            &[
                0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, // peer id
                0x0A, 0x0B, // client id
                203, 0, 113, 7, // ip
                0x10, 0x92, // tcp 4242
                0x10, 0x93, // udp 4243
                0x01, // NAT
            ]
        );
    }

    #[test]
    fn test_short_record_rejected() {
        let mut buf = BytesMut::new();
        buf.put_slice(&[0u8; 10]);
        assert!(Contact::decode(&mut buf.freeze()).is_err());
    }

    #[test]
    fn test_unknown_firewall_byte_rejected() {
        let mut buf = BytesMut::new();
        sample_contact().encode(&mut buf);
        let last = buf.len() - 1;
        buf[last] = 9;
        assert!(matches!(
            Contact::decode(&mut buf.freeze()),
            Err(RoutingError::UnknownFirewallState(9))
        ));
    }

    #[test]
    fn test_patch_entry_roundtrip() {
        let entry = PatchEntry {
            peer_id: PeerId::new(42),
            version: 7,
        };

        let mut buf = BytesMut::new();
        entry.encode(&mut buf);
        assert_eq!(buf.len(), PATCH_ENTRY_WIRE_SIZE);

        let decoded = PatchEntry::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_probe_bookkeeping() {
        let mut contact = sample_contact();
        assert_eq!(contact.attempts, 0);

        contact.record_probe();
        contact.record_probe();
        assert_eq!(contact.attempts, 2);

        let refreshed = sample_contact();
        contact.touch(&refreshed);
        assert_eq!(contact.attempts, 0);
    }
}
