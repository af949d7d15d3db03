//! Overlay packet definitions
//!
//! Wire format:
//! [Kind: 1 byte][Length: 2 bytes BE][Payload: variable]
//!
//! Packets are self-delimiting, so the same framing serves single-packet
//! UDP datagrams and the byte streams flowing over TCP proxy links and
//! encrypted sessions. The session handshake kinds occupy the reserved
//! 0x50..=0x5F tag range.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use weftnet_crypto::PeerId;
use weftnet_routing::Contact;

use crate::error::{NetError, NetResult};

/// Packet type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    /// Application payload carried over an active session
    Data = 0x10,

    /// A chunk of a session's (possibly encrypted) byte stream,
    /// prefixed with the sender's peer and client identifiers
    SessionStream = 0x11,

    /// Liveness probe
    Ping = 0x30,

    /// Liveness reply
    Pong = 0x31,

    /// Discovery search request
    Discover = 0x40,

    /// Discovery search reply (contact records)
    DiscoverReply = 0x41,

    /// Handshake: request the peer's long-term public keys
    KeyRequest = 0x50,

    /// Handshake: long-term public keys reply
    KeyAck = 0x51,

    /// Handshake: sealed per-direction session key
    SessionRequest = 0x52,

    /// Handshake: session confirmation with display name
    SessionAck = 0x53,

    /// Marker: all following bytes from the sender are ciphertext
    EncryptionStart = 0x54,

    /// Session teardown with a reason string
    Close = 0x55,

    /// Proxy relationship change notification
    ProxyUpdate = 0x56,

    /// Zero-cost padding to the cipher block boundary
    Padding = 0x57,

    /// Payload tunneled across the lookup overlay
    Tunnel = 0x60,
}

impl PacketKind {
    /// Whether this kind belongs to the reserved handshake tag range
    pub fn is_handshake(&self) -> bool {
        (*self as u8) & 0xF0 == 0x50
    }
}

impl TryFrom<u8> for PacketKind {
    type Error = NetError;

    fn try_from(value: u8) -> Result<Self, NetError> {
        match value {
            0x10 => Ok(Self::Data),
            0x11 => Ok(Self::SessionStream),
            0x30 => Ok(Self::Ping),
            0x31 => Ok(Self::Pong),
            0x40 => Ok(Self::Discover),
            0x41 => Ok(Self::DiscoverReply),
            0x50 => Ok(Self::KeyRequest),
            0x51 => Ok(Self::KeyAck),
            0x52 => Ok(Self::SessionRequest),
            0x53 => Ok(Self::SessionAck),
            0x54 => Ok(Self::EncryptionStart),
            0x55 => Ok(Self::Close),
            0x56 => Ok(Self::ProxyUpdate),
            0x57 => Ok(Self::Padding),
            0x60 => Ok(Self::Tunnel),
            _ => Err(NetError::InvalidPacket(format!(
                "Unknown packet kind: 0x{:02x}",
                value
            ))),
        }
    }
}

/// Packet header size (kind + length)
pub const HEADER_SIZE: usize = 3;

/// Maximum total packet size
pub const MAX_PACKET_SIZE: usize = 65535;

/// Maximum payload size
pub const MAX_PAYLOAD_SIZE: usize = MAX_PACKET_SIZE - HEADER_SIZE;

/// An overlay protocol packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet kind
    pub kind: PacketKind,

    /// Packet payload
    pub payload: Bytes,
}

impl Packet {
    /// Create a new packet
    pub fn new(kind: PacketKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// Create a ping packet carrying the sender's contact record
    pub fn ping(contact: &Contact) -> Self {
        let mut buf = BytesMut::new();
        contact.encode(&mut buf);
        Self::new(PacketKind::Ping, buf.freeze())
    }

    /// Create a pong packet carrying the sender's contact record
    pub fn pong(contact: &Contact) -> Self {
        let mut buf = BytesMut::new();
        contact.encode(&mut buf);
        Self::new(PacketKind::Pong, buf.freeze())
    }

    /// Create a close packet with a reason string
    pub fn close(reason: &str) -> Self {
        Self::new(PacketKind::Close, reason.as_bytes().to_vec())
    }

    /// Create a padding packet whose total encoded size is `total`.
    /// Callers must pass at least the header size.
    pub fn padding(total: usize) -> Self {
        debug_assert!(total >= HEADER_SIZE);
        Self::new(PacketKind::Padding, vec![0u8; total - HEADER_SIZE])
    }

    /// Create a discovery request for an identifier
    pub fn discover(target: PeerId) -> Self {
        Self::new(PacketKind::Discover, target.to_be_bytes().to_vec())
    }

    /// Create a discovery reply from found contacts
    pub fn discover_reply(contacts: &[Contact]) -> Self {
        let mut buf = BytesMut::with_capacity(1 + contacts.len() * 19);
        buf.put_u8(contacts.len() as u8);
        for contact in contacts {
            contact.encode(&mut buf);
        }
        Self::new(PacketKind::DiscoverReply, buf.freeze())
    }

    /// Total encoded size
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Serialize packet to bytes
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.size());
        self.write_to(&mut buf);
        buf.freeze()
    }

    /// Append the encoded packet to a buffer
    pub fn write_to<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.kind as u8);
        buf.put_u16(self.payload.len() as u16);
        buf.put_slice(&self.payload);
    }

    /// Deserialize a packet occupying an entire datagram
    pub fn from_datagram(bytes: Bytes) -> NetResult<Self> {
        match Self::parse(&bytes)? {
            Some((packet, consumed)) if consumed == bytes.len() => Ok(packet),
            Some((_, consumed)) => Err(NetError::InvalidPacket(format!(
                "trailing bytes after packet: {} of {}",
                consumed,
                bytes.len()
            ))),
            None => Err(NetError::InvalidPacket("truncated packet".into())),
        }
    }

    /// Try to parse one packet from the front of a byte stream.
    ///
    /// Returns the packet and the number of bytes consumed, or `None`
    /// when the buffer does not yet hold a complete packet.
    pub fn parse(buf: &[u8]) -> NetResult<Option<(Self, usize)>> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }
        let kind = PacketKind::try_from(buf[0])?;
        let len = u16::from_be_bytes([buf[1], buf[2]]) as usize;
        let total = HEADER_SIZE + len;
        if buf.len() < total {
            return Ok(None);
        }
        Ok(Some((
            Self::new(kind, buf[HEADER_SIZE..total].to_vec()),
            total,
        )))
    }

    /// Parse the contact record out of a ping/pong payload
    pub fn sender_contact(&self) -> NetResult<Contact> {
        let mut buf = self.payload.clone();
        Ok(Contact::decode(&mut buf)?)
    }

    /// Parse a discovery reply payload into contacts
    pub fn contact_list(&self) -> NetResult<Vec<Contact>> {
        let mut buf = self.payload.clone();
        if buf.remaining() < 1 {
            return Err(NetError::InvalidPacket("empty contact list".into()));
        }
        let count = buf.get_u8() as usize;
        let mut contacts = Vec::with_capacity(count);
        for _ in 0..count {
            contacts.push(Contact::decode(&mut buf)?);
        }
        Ok(contacts)
    }
}

/// Routing envelope for packets tunneled across the lookup overlay.
///
/// Wire layout: [target: 8][source proxy: 6][target proxy: 6]
/// [nonce: 12][ciphertext: rest]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelEnvelope {
    /// Final recipient of the tunneled payload
    pub target: PeerId,

    /// Proxy server address on the sender's side
    pub source_proxy: SocketAddr,

    /// Proxy server address on the recipient's side
    pub target_proxy: SocketAddr,

    /// AEAD nonce for the payload encryption
    pub nonce: [u8; 12],

    /// Payload encrypted under the per-recipient tunnel key
    pub ciphertext: Bytes,
}

fn put_addr<B: BufMut>(buf: &mut B, addr: SocketAddr) {
    let ip = match addr.ip() {
        IpAddr::V4(ip) => ip,
        IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
    };
    buf.put_slice(&ip.octets());
    buf.put_u16(addr.port());
}

fn get_addr<B: Buf>(buf: &mut B) -> SocketAddr {
    let mut octets = [0u8; 4];
    buf.copy_to_slice(&mut octets);
    let port = buf.get_u16();
    SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port)
}

impl TunnelEnvelope {
    /// Minimum encoded size (empty ciphertext)
    pub const MIN_SIZE: usize = 8 + 6 + 6 + 12;

    /// Encode into a Tunnel packet payload
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::MIN_SIZE + self.ciphertext.len());
        buf.put_u64(self.target.as_u64());
        put_addr(&mut buf, self.source_proxy);
        put_addr(&mut buf, self.target_proxy);
        buf.put_slice(&self.nonce);
        buf.put_slice(&self.ciphertext);
        buf.freeze()
    }

    /// Decode from a Tunnel packet payload
    pub fn decode(payload: &Bytes) -> NetResult<Self> {
        if payload.len() < Self::MIN_SIZE {
            return Err(NetError::InvalidPacket(format!(
                "tunnel envelope too short: {} bytes",
                payload.len()
            )));
        }
        let mut buf = payload.clone();
        let target = PeerId::new(buf.get_u64());
        let source_proxy = get_addr(&mut buf);
        let target_proxy = get_addr(&mut buf);
        let mut nonce = [0u8; 12];
        buf.copy_to_slice(&mut nonce);
        Ok(Self {
            target,
            source_proxy,
            target_proxy,
            nonce,
            ciphertext: buf,
        })
    }
}
