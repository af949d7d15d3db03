//! Encrypted reliable sessions
//!
//! One session exists per (peer, client) pairing, created on outbound
//! connect or on the first inbound handshake frame. The handshake runs
//! inside the session byte stream: KeyRequest/KeyAck exchange long-term
//! keys when needed, SessionRequest transports each side's sealed
//! outbound session key, the EncryptionStart marker pins down exactly
//! which bytes are ciphertext, and SessionAck completes activation.
//! A second claimant of an active pairing is rejected with a close.
//!
//! Session stream chunks travel as SessionStream datagrams prefixed
//! with the sender's identifiers; an unreliable fast path ships
//! individually sealed Data datagrams outside the stream.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, info, trace, warn};
use weftnet_crypto::{ClientId, NodeIdentity, PeerId, PublicNodeInfo, SessionKey};
use weftnet_net::wire::{Packet, PacketKind};
use weftnet_routing::Contact;

use crate::buffers::{RecvChannel, SendChannel};
use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::handshake::{KeyExchangePayload, SessionAckPayload, SessionRequestPayload};

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Handshake in progress
    Connecting,
    /// Both acknowledgments exchanged; data may flow
    Active,
    /// Torn down; kept only transiently
    Closed,
}

/// What the session layer reports to the application
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Session reached Active
    Established {
        peer: PeerId,
        client: ClientId,
        display_name: String,
    },
    /// Application payload arrived
    Data {
        peer: PeerId,
        client: ClientId,
        service_id: u16,
        payload: Bytes,
    },
    /// Session ended, with the close reason
    Closed {
        peer: PeerId,
        client: ClientId,
        reason: String,
    },
}

/// A datagram ready for the transport
#[derive(Debug, Clone)]
pub struct Outbound {
    pub addr: SocketAddr,
    pub packet: Packet,
}

/// One end of an encrypted session
pub struct Session {
    pub peer_id: PeerId,
    pub client_id: ClientId,
    pub state: SessionState,
    pub addr: SocketAddr,

    /// Peer's authenticated long-term keys, once learned
    remote: Option<PublicNodeInfo>,

    /// Peer's announced display name, once acknowledged
    pub display_name: Option<String>,

    /// Our outbound stream key, generated at session creation
    outbound_key: SessionKey,

    /// Peer's stream key, from its SessionRequest
    inbound_key: Option<SessionKey>,

    send: SendChannel,
    recv: RecvChannel,

    request_sent: bool,
    ack_sent: bool,
    ack_received: bool,

    created_at: Instant,
}

impl Session {
    fn new(peer_id: PeerId, client_id: ClientId, addr: SocketAddr, config: &CoreConfig) -> Self {
        Self {
            peer_id,
            client_id,
            state: SessionState::Connecting,
            addr,
            remote: None,
            display_name: None,
            outbound_key: SessionKey::generate(),
            inbound_key: None,
            send: SendChannel::new(config.send_buffer_size, config.encrypt_buffer_size),
            recv: RecvChannel::new(config.recv_buffer_size),
            request_sent: false,
            ack_sent: false,
            ack_received: false,
            created_at: Instant::now(),
        }
    }

    fn key(&self) -> (PeerId, ClientId) {
        (self.peer_id, self.client_id)
    }

    /// Queue our SessionRequest followed by the encryption-start
    /// marker, flush the plaintext phase, and switch the outbound
    /// channel to ciphertext. Returns the plaintext chunk to transmit.
    fn start_session_request(&mut self, identity: &NodeIdentity) -> CoreResult<Option<Bytes>> {
        let remote = self
            .remote
            .as_ref()
            .ok_or_else(|| CoreError::HandshakeFailed("peer keys unknown".into()))?;

        let payload = SessionRequestPayload::build(identity, remote, &self.outbound_key)?;
        self.send
            .queue(&Packet::new(PacketKind::SessionRequest, payload.to_bytes()?))?;
        self.send
            .queue(&Packet::new(PacketKind::EncryptionStart, Vec::new()))?;

        let prelude = self.send.take_flush()?;
        let key = self.outbound_key.clone();
        self.send.activate_encryption(&key);
        self.request_sent = true;
        trace!(peer = %self.peer_id, "session request sent, outbound encryption active");
        Ok(prelude)
    }

    fn queue_ack(&mut self, identity: &NodeIdentity, display_name: &str) -> CoreResult<()> {
        let ack = SessionAckPayload::build(identity, self.peer_id, display_name);
        self.send
            .queue(&Packet::new(PacketKind::SessionAck, ack.to_bytes()?))?;
        self.ack_sent = true;
        Ok(())
    }

    fn handshake_expired(&self, timeout: std::time::Duration) -> bool {
        self.state == SessionState::Connecting && self.created_at.elapsed() > timeout
    }
}

/// Owns all sessions of one overlay instance
pub struct SessionManager {
    identity: NodeIdentity,
    config: CoreConfig,
    sessions: HashMap<(PeerId, ClientId), Session>,
    known_peers: HashMap<PeerId, PublicNodeInfo>,
}

impl SessionManager {
    pub fn new(identity: NodeIdentity, config: CoreConfig) -> Self {
        Self {
            identity,
            config,
            sessions: HashMap::new(),
            known_peers: HashMap::new(),
        }
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn state_of(&self, peer: PeerId, client: ClientId) -> Option<SessionState> {
        self.sessions.get(&(peer, client)).map(|s| s.state)
    }

    pub fn display_name_of(&self, peer: PeerId, client: ClientId) -> Option<String> {
        self.sessions
            .get(&(peer, client))
            .and_then(|s| s.display_name.clone())
    }

    /// Record a peer's authenticated long-term keys
    pub fn learn_peer(&mut self, info: PublicNodeInfo) {
        self.known_peers.insert(info.peer_id, info);
    }

    /// Wrap a stream chunk into a SessionStream datagram
    fn stream_packet(&self, chunk: &[u8]) -> Packet {
        let mut payload = BytesMut::with_capacity(10 + chunk.len());
        payload.put_u64(self.identity.peer_id().as_u64());
        payload.put_u16(self.identity.client_id().as_u16());
        payload.put_slice(chunk);
        Packet::new(PacketKind::SessionStream, payload.freeze())
    }

    /// Start an outbound session towards a contact
    pub fn connect(&mut self, contact: &Contact) -> CoreResult<Vec<Outbound>> {
        let key = (contact.peer_id, contact.client_id);
        if self.sessions.contains_key(&key) {
            return Ok(Vec::new());
        }

        let mut session = Session::new(
            contact.peer_id,
            contact.client_id,
            contact.udp_addr(),
            &self.config,
        );
        info!(peer = %contact.peer_id, addr = %session.addr, "opening session");

        let mut outbound = Vec::new();
        if let Some(info) = self.known_peers.get(&contact.peer_id).cloned() {
            session.remote = Some(info);
            if let Some(prelude) = session.start_session_request(&self.identity)? {
                outbound.push(Outbound {
                    addr: session.addr,
                    packet: self.stream_packet(&prelude),
                });
            }
        } else {
            let hello = KeyExchangePayload::from_identity(&self.identity);
            session
                .send
                .queue(&Packet::new(PacketKind::KeyRequest, hello.to_bytes()?))?;
            if let Some(chunk) = session.send.take_flush()? {
                outbound.push(Outbound {
                    addr: session.addr,
                    packet: self.stream_packet(&chunk),
                });
            }
        }

        self.sessions.insert(key, session);
        Ok(outbound)
    }

    /// Ingest a SessionStream datagram payload
    pub fn handle_stream(
        &mut self,
        payload: &Bytes,
        from: SocketAddr,
    ) -> CoreResult<(Vec<Outbound>, Vec<SessionEvent>)> {
        if payload.len() < 10 {
            return Err(CoreError::MalformedFrame("stream header too short".into()));
        }
        let mut header = payload.clone();
        let peer = PeerId::new(header.get_u64());
        let client = ClientId::new(header.get_u16());
        let chunk = header;

        if peer.is_zero() || client.is_zero() {
            return Err(CoreError::MalformedFrame("zero identifiers".into()));
        }

        let mut outbound = Vec::new();
        let mut events = Vec::new();

        let key = (peer, client);

        // A stream for an active pairing arriving from a different
        // endpoint is a second claimant. It must not touch the
        // established session's stream state: if it opens a handshake
        // it is rejected with a close, anything else is dropped.
        if let Some(session) = self.sessions.get(&key) {
            if session.state == SessionState::Active && session.addr != from {
                if let Ok(Some((packet, _))) = Packet::parse(&chunk) {
                    if matches!(
                        packet.kind,
                        PacketKind::KeyRequest | PacketKind::SessionRequest
                    ) {
                        info!(peer = %peer, claimant = %from, "duplicate session claim rejected");
                        let mut refusal = BytesMut::new();
                        Packet::close("duplicate session").write_to(&mut refusal);
                        outbound.push(Outbound {
                            addr: from,
                            packet: self.stream_packet(&refusal),
                        });
                    }
                }
                return Ok((outbound, events));
            }
        }

        let session = self.sessions.entry(key).or_insert_with(|| {
            debug!(peer = %peer, addr = %from, "session created on inbound handshake");
            Session::new(peer, client, from, &self.config)
        });

        // NAT rebinding is honored while the handshake is in flight.
        session.addr = from;

        if session.recv.ingest(&chunk).is_err() {
            warn!(peer = %peer, "receive buffer full, dropping chunk");
            return Ok((outbound, events));
        }

        loop {
            let packet = {
                let session = self.sessions.get_mut(&key).expect("session exists");
                match session.recv.next_packet() {
                    Ok(Some(packet)) => packet,
                    Ok(None) => break,
                    Err(e) => {
                        // A malformed frame is fatal to this session.
                        let (mut closes, event) =
                            self.close_session(key, &format!("malformed frame: {}", e));
                        outbound.append(&mut closes);
                        events.extend(event);
                        return Ok((outbound, events));
                    }
                }
            };

            match self.handle_frame(key, packet, from) {
                Ok((mut frame_out, mut frame_events)) => {
                    outbound.append(&mut frame_out);
                    events.append(&mut frame_events);
                }
                Err(e) => {
                    let (mut closes, event) = self.close_session(key, &e.to_string());
                    outbound.append(&mut closes);
                    events.extend(event);
                    return Ok((outbound, events));
                }
            }
            if !self.sessions.contains_key(&key) {
                break;
            }
        }

        // Transmit whatever the frame handling staged.
        let flushed = match self.sessions.get_mut(&key) {
            Some(session) => match session.send.take_flush() {
                Ok(Some(chunk)) => Some((session.addr, chunk)),
                Ok(None) => None,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "flush deferred");
                    None
                }
            },
            None => None,
        };
        if let Some((addr, chunk)) = flushed {
            outbound.push(Outbound {
                addr,
                packet: self.stream_packet(&chunk),
            });
        }

        Ok((outbound, events))
    }

    /// Process one frame from a session's stream
    fn handle_frame(
        &mut self,
        key: (PeerId, ClientId),
        packet: Packet,
        from: SocketAddr,
    ) -> CoreResult<(Vec<Outbound>, Vec<SessionEvent>)> {
        let mut outbound = Vec::new();
        let mut events = Vec::new();
        let display_name = self.config.display_name.clone();

        // Chunks staged while the session is mutably borrowed; wrapped
        // into datagrams after the borrow ends.
        let mut staged: Vec<(SocketAddr, Bytes)> = Vec::new();

        match packet.kind {
            PacketKind::KeyRequest => {
                let info = KeyExchangePayload::from_bytes(&packet.payload)?.into_info()?;
                self.known_peers.insert(info.peer_id, info.clone());
                let reply = KeyExchangePayload::from_identity(&self.identity);
                let session = self.sessions.get_mut(&key).expect("session exists");
                session.remote = Some(info);
                session
                    .send
                    .queue(&Packet::new(PacketKind::KeyAck, reply.to_bytes()?))?;
                if !session.request_sent {
                    if let Some(prelude) = session.start_session_request(&self.identity)? {
                        staged.push((session.addr, prelude));
                    }
                }
            }

            PacketKind::KeyAck => {
                let info = KeyExchangePayload::from_bytes(&packet.payload)?.into_info()?;
                self.known_peers.insert(info.peer_id, info.clone());
                let session = self.sessions.get_mut(&key).expect("session exists");
                session.remote = Some(info);
                if !session.request_sent {
                    if let Some(prelude) = session.start_session_request(&self.identity)? {
                        staged.push((session.addr, prelude));
                    }
                }
            }

            PacketKind::SessionRequest => {
                if self.sessions.get(&key).expect("session exists").state
                    == SessionState::Active
                {
                    // Re-request on an established stream: reject the
                    // claim without disturbing the session.
                    info!(peer = %key.0, claimant = %from, "duplicate session claim rejected");
                    let mut refusal = BytesMut::new();
                    Packet::close("duplicate session").write_to(&mut refusal);
                    outbound.push(Outbound {
                        addr: from,
                        packet: self.stream_packet(&refusal),
                    });
                    return Ok((outbound, events));
                }

                let request = SessionRequestPayload::from_bytes(&packet.payload)?;
                let known = self.known_peers.get(&key.0);
                let info = request.verify(self.identity.peer_id(), known)?;
                let inbound_key = request
                    .sealed_key
                    .open(&self.identity.encryption_keypair().secret)?;

                self.known_peers.insert(info.peer_id, info.clone());
                let session = self.sessions.get_mut(&key).expect("session exists");
                session.remote = Some(info);
                session.inbound_key = Some(inbound_key);

                if !session.request_sent {
                    if let Some(prelude) = session.start_session_request(&self.identity)? {
                        staged.push((session.addr, prelude));
                    }
                }
                session.queue_ack(&self.identity, &display_name)?;
            }

            PacketKind::EncryptionStart => {
                let session = self.sessions.get_mut(&key).expect("session exists");
                let key_material = session.inbound_key.as_ref().cloned().ok_or_else(|| {
                    CoreError::HandshakeFailed("encryption start before session key".into())
                })?;
                session.recv.activate_decryption(&key_material);
                trace!(peer = %key.0, "inbound decryption active");
            }

            PacketKind::SessionAck => {
                let ack = SessionAckPayload::from_bytes(&packet.payload)?;
                let session = self.sessions.get_mut(&key).expect("session exists");
                let remote = session.remote.clone().ok_or_else(|| {
                    CoreError::HandshakeFailed("acknowledgment before key exchange".into())
                })?;
                ack.verify(self.identity.peer_id(), &remote)?;
                session.display_name = Some(ack.display_name.clone());
                session.ack_received = true;
            }

            PacketKind::Close => {
                let reason = String::from_utf8_lossy(&packet.payload).into_owned();
                let session = self.sessions.get_mut(&key).expect("session exists");
                session.state = SessionState::Closed;
                info!(peer = %key.0, reason = %reason, "session closed by peer");
                events.push(SessionEvent::Closed {
                    peer: key.0,
                    client: key.1,
                    reason,
                });
                self.sessions.remove(&key);
                return Ok((outbound, events));
            }

            PacketKind::Data => {
                let session = self.sessions.get(&key).expect("session exists");
                if session.state != SessionState::Active {
                    return Err(CoreError::NotActive("data before activation".into()));
                }
                if packet.payload.len() < 2 {
                    return Err(CoreError::MalformedFrame("data frame too short".into()));
                }
                let mut payload = packet.payload.clone();
                let service_id = payload.get_u16();
                events.push(SessionEvent::Data {
                    peer: key.0,
                    client: key.1,
                    service_id,
                    payload,
                });
            }

            PacketKind::Ping => {
                let session = self.sessions.get_mut(&key).expect("session exists");
                session.send.queue(&Packet::new(PacketKind::Pong, Vec::new()))?;
            }

            PacketKind::Pong => {}

            other => {
                return Err(CoreError::MalformedFrame(format!(
                    "unexpected {:?} frame in session stream",
                    other
                )));
            }
        }

        for (addr, chunk) in staged {
            outbound.push(Outbound {
                addr,
                packet: self.stream_packet(&chunk),
            });
        }

        // Activation gate: both acknowledgments, exactly one session
        // for the pairing (the map key enforces uniqueness).
        let session = match self.sessions.get_mut(&key) {
            Some(session) => session,
            None => return Ok((outbound, events)),
        };
        if session.state == SessionState::Connecting && session.ack_sent && session.ack_received {
            session.state = SessionState::Active;
            let name = session.display_name.clone().unwrap_or_default();
            info!(peer = %key.0, name = %name, "session active");
            events.push(SessionEvent::Established {
                peer: key.0,
                client: key.1,
                display_name: name,
            });
        }

        Ok((outbound, events))
    }

    /// Queue application payload onto the reliable encrypted stream
    pub fn send_reliable(
        &mut self,
        peer: PeerId,
        client: ClientId,
        service_id: u16,
        payload: &[u8],
    ) -> CoreResult<()> {
        let session = self
            .sessions
            .get_mut(&(peer, client))
            .ok_or(CoreError::NoSession { peer, client })?;
        if session.state != SessionState::Active {
            return Err(CoreError::NotActive("send on inactive session".into()));
        }

        let mut frame = BytesMut::with_capacity(2 + payload.len());
        frame.put_u16(service_id);
        frame.put_slice(payload);
        session.send.queue(&Packet::new(PacketKind::Data, frame.freeze()))
    }

    /// Latency-sensitive fast path: an individually sealed datagram
    /// outside the reliable stream.
    pub fn send_unreliable(
        &mut self,
        peer: PeerId,
        client: ClientId,
        service_id: u16,
        payload: &[u8],
    ) -> CoreResult<Outbound> {
        let session = self
            .sessions
            .get(&(peer, client))
            .ok_or(CoreError::NoSession { peer, client })?;
        if session.state != SessionState::Active {
            return Err(CoreError::NotActive("send on inactive session".into()));
        }

        let cipher = ChaCha20Poly1305::new_from_slice(session.outbound_key.as_bytes())
            .map_err(|e| CoreError::HandshakeFailed(e.to_string()))?;
        let mut nonce = [0u8; 12];
        OsRng.fill_bytes(&mut nonce);

        let mut plaintext = BytesMut::with_capacity(2 + payload.len());
        plaintext.put_u16(service_id);
        plaintext.put_slice(payload);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.freeze().as_ref())
            .map_err(|_| CoreError::HandshakeFailed("unreliable seal failed".into()))?;

        let mut datagram = BytesMut::with_capacity(22 + ciphertext.len());
        datagram.put_u64(self.identity.peer_id().as_u64());
        datagram.put_u16(self.identity.client_id().as_u16());
        datagram.put_slice(&nonce);
        datagram.put_slice(&ciphertext);

        Ok(Outbound {
            addr: session.addr,
            packet: Packet::new(PacketKind::Data, datagram.freeze()),
        })
    }

    /// Ingest an unreliable Data datagram
    pub fn handle_unreliable(&mut self, payload: &Bytes) -> CoreResult<Option<SessionEvent>> {
        if payload.len() < 22 {
            return Err(CoreError::MalformedFrame("unreliable datagram too short".into()));
        }
        let mut buf = payload.clone();
        let peer = PeerId::new(buf.get_u64());
        let client = ClientId::new(buf.get_u16());
        let mut nonce = [0u8; 12];
        buf.copy_to_slice(&mut nonce);

        let session = match self.sessions.get(&(peer, client)) {
            Some(session) if session.state == SessionState::Active => session,
            // Unreliable traffic for unknown or inactive sessions is
            // dropped, never fatal.
            _ => return Ok(None),
        };
        let key = session
            .inbound_key
            .as_ref()
            .ok_or_else(|| CoreError::NotActive("no inbound key".into()))?;

        let cipher = ChaCha20Poly1305::new_from_slice(key.as_bytes())
            .map_err(|e| CoreError::HandshakeFailed(e.to_string()))?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce), buf.as_ref())
            .map_err(|_| CoreError::MalformedFrame("unreliable datagram rejected".into()))?;

        if plaintext.len() < 2 {
            return Err(CoreError::MalformedFrame("unreliable payload too short".into()));
        }
        let service_id = u16::from_be_bytes([plaintext[0], plaintext[1]]);
        Ok(Some(SessionEvent::Data {
            peer,
            client,
            service_id,
            payload: Bytes::from(plaintext[2..].to_vec()),
        }))
    }

    /// Close a session with a reason, notifying the peer
    pub fn close(
        &mut self,
        peer: PeerId,
        client: ClientId,
        reason: &str,
    ) -> (Vec<Outbound>, Option<SessionEvent>) {
        self.close_session((peer, client), reason)
    }

    fn close_session(
        &mut self,
        key: (PeerId, ClientId),
        reason: &str,
    ) -> (Vec<Outbound>, Option<SessionEvent>) {
        let mut outbound = Vec::new();
        let Some(mut session) = self.sessions.remove(&key) else {
            return (outbound, None);
        };

        info!(peer = %key.0, reason = %reason, "closing session");
        let _ = session.send.queue(&Packet::close(reason));
        if let Ok(Some(chunk)) = session.send.take_flush() {
            outbound.push(Outbound {
                addr: session.addr,
                packet: self.stream_packet(&chunk),
            });
        }

        (
            outbound,
            Some(SessionEvent::Closed {
                peer: key.0,
                client: key.1,
                reason: reason.to_string(),
            }),
        )
    }

    /// Per-second tick: flush stalled encrypted data and enforce the
    /// handshake timeout on connecting sessions.
    pub fn tick(&mut self) -> (Vec<Outbound>, Vec<SessionEvent>) {
        let mut outbound = Vec::new();
        let mut events = Vec::new();

        let expired: Vec<(PeerId, ClientId)> = self
            .sessions
            .values()
            .filter(|s| s.handshake_expired(self.config.handshake_timeout))
            .map(|s| s.key())
            .collect();
        for key in expired {
            let (mut closes, event) = self.close_session(key, "handshake timeout");
            outbound.append(&mut closes);
            events.extend(event);
        }

        outbound.append(&mut self.flush_all());
        (outbound, events)
    }

    /// Flush every session's pending stream data
    pub fn flush_all(&mut self) -> Vec<Outbound> {
        let mut outbound = Vec::new();
        let mut chunks = Vec::new();
        for session in self.sessions.values_mut() {
            match session.send.take_flush() {
                Ok(Some(chunk)) => chunks.push((session.addr, chunk)),
                Ok(None) => {}
                Err(e) => {
                    warn!(peer = %session.peer_id, error = %e, "flush deferred");
                }
            }
        }
        for (addr, chunk) in chunks {
            outbound.push(Outbound {
                addr,
                packet: self.stream_packet(&chunk),
            });
        }
        outbound
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use weftnet_routing::FirewallState;

    fn manager(name: &str) -> SessionManager {
        let config = CoreConfig {
            display_name: name.to_string(),
            ..Default::default()
        };
        SessionManager::new(NodeIdentity::generate(), config)
    }

    fn contact_for(manager: &SessionManager, port: u16) -> Contact {
        Contact::new(
            manager.identity.peer_id(),
            manager.identity.client_id(),
            Ipv4Addr::new(127, 0, 0, 1),
            port,
            port,
            FirewallState::Open,
        )
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(Ipv4Addr::new(127, 0, 0, 1).into(), port)
    }

    /// Deliver datagrams to the other side until both queues drain.
    fn run_to_quiescence(
        alice: &mut SessionManager,
        bob: &mut SessionManager,
        mut to_bob: Vec<Outbound>,
        alice_port: u16,
        bob_port: u16,
    ) -> Vec<SessionEvent> {
        let mut all_events = Vec::new();
        let mut to_alice: Vec<Outbound> = Vec::new();

        for _ in 0..32 {
            if to_bob.is_empty() && to_alice.is_empty() {
                break;
            }

            let mut next_to_alice = Vec::new();
            for out in to_bob.drain(..) {
                assert_eq!(out.packet.kind, PacketKind::SessionStream);
                let (replies, events) = bob
                    .handle_stream(&out.packet.payload, addr(alice_port))
                    .unwrap();
                next_to_alice.extend(replies);
                all_events.extend(events);
            }
            to_alice.append(&mut next_to_alice);

            let mut next_to_bob = Vec::new();
            for out in to_alice.drain(..) {
                assert_eq!(out.packet.kind, PacketKind::SessionStream);
                let (replies, events) = alice
                    .handle_stream(&out.packet.payload, addr(bob_port))
                    .unwrap();
                next_to_bob.extend(replies);
                all_events.extend(events);
            }
            to_bob.append(&mut next_to_bob);

            to_bob.append(&mut alice.flush_all());
            to_alice.append(&mut bob.flush_all());
        }

        all_events
    }

    #[test]
    fn test_full_handshake_unknown_keys() {
        let mut alice = manager("alice");
        let mut bob = manager("bob");

        let bob_contact = contact_for(&bob, 4001);
        let initial = alice.connect(&bob_contact).unwrap();
        assert!(!initial.is_empty());

        let events = run_to_quiescence(&mut alice, &mut bob, initial, 4000, 4001);

        // Both sides reached Active.
        assert_eq!(
            alice
                .state_of(bob.identity.peer_id(), bob.identity.client_id())
                .unwrap(),
            SessionState::Active
        );
        assert_eq!(
            bob.state_of(alice.identity.peer_id(), alice.identity.client_id())
                .unwrap(),
            SessionState::Active
        );

        // Display names traveled with the acknowledgments.
        let established: Vec<&SessionEvent> = events
            .iter()
            .filter(|e| matches!(e, SessionEvent::Established { .. }))
            .collect();
        assert_eq!(established.len(), 2);
        assert_eq!(
            alice
                .display_name_of(bob.identity.peer_id(), bob.identity.client_id())
                .unwrap(),
            "bob"
        );
    }

    #[test]
    fn test_handshake_with_known_keys_skips_key_exchange() {
        let mut alice = manager("alice");
        let mut bob = manager("bob");

        alice.learn_peer(bob.identity.public_info());

        let initial = alice.connect(&contact_for(&bob, 4001)).unwrap();
        // First datagram already carries the session request.
        assert_eq!(initial.len(), 1);

        let events = run_to_quiescence(&mut alice, &mut bob, initial, 4000, 4001);
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::Established { .. })));
        assert_eq!(
            alice
                .state_of(bob.identity.peer_id(), bob.identity.client_id())
                .unwrap(),
            SessionState::Active
        );
    }

    #[test]
    fn test_reliable_data_roundtrip() {
        let mut alice = manager("alice");
        let mut bob = manager("bob");

        let initial = alice.connect(&contact_for(&bob, 4001)).unwrap();
        run_to_quiescence(&mut alice, &mut bob, initial, 4000, 4001);

        alice
            .send_reliable(
                bob.identity.peer_id(),
                bob.identity.client_id(),
                42,
                b"hello collaboration",
            )
            .unwrap();

        let out = alice.flush_all();
        assert_eq!(out.len(), 1);
        let (_, events) = bob
            .handle_stream(&out[0].packet.payload, addr(4000))
            .unwrap();

        match &events[..] {
            [SessionEvent::Data {
                service_id,
                payload,
                ..
            }] => {
                assert_eq!(*service_id, 42);
                assert_eq!(payload.as_ref(), b"hello collaboration");
            }
            other => panic!("expected one data event, got {:?}", other),
        }
    }

    #[test]
    fn test_unreliable_data_roundtrip() {
        let mut alice = manager("alice");
        let mut bob = manager("bob");

        let initial = alice.connect(&contact_for(&bob, 4001)).unwrap();
        run_to_quiescence(&mut alice, &mut bob, initial, 4000, 4001);

        let out = alice
            .send_unreliable(
                bob.identity.peer_id(),
                bob.identity.client_id(),
                7,
                b"voice frame",
            )
            .unwrap();
        assert_eq!(out.packet.kind, PacketKind::Data);

        let event = bob.handle_unreliable(&out.packet.payload).unwrap().unwrap();
        match event {
            SessionEvent::Data {
                service_id,
                payload,
                ..
            } => {
                assert_eq!(service_id, 7);
                assert_eq!(payload.as_ref(), b"voice frame");
            }
            other => panic!("expected data event, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_claimant_rejected() {
        let mut alice = manager("alice");
        let mut bob = manager("bob");

        let initial = alice.connect(&contact_for(&bob, 4001)).unwrap();
        run_to_quiescence(&mut alice, &mut bob, initial, 4000, 4001);

        // A third party claims alice's (peer, client) pairing with its
        // own session request from a different address.
        let mallory = NodeIdentity::generate();
        let sealed = SessionRequestPayload::build(
            &mallory,
            &bob.identity.public_info(),
            &SessionKey::generate(),
        )
        .unwrap();
        let mut forged = sealed;
        forged.peer_id = alice.identity.peer_id();
        forged.client_id = alice.identity.client_id();

        let mut chunk = BytesMut::new();
        Packet::new(PacketKind::SessionRequest, forged.to_bytes().unwrap())
            .write_to(&mut chunk);

        let mut stream = BytesMut::new();
        stream.put_u64(alice.identity.peer_id().as_u64());
        stream.put_u16(alice.identity.client_id().as_u16());
        stream.put_slice(&chunk);

        let claimant = addr(5999);
        let (replies, events) = bob
            .handle_stream(&stream.freeze(), claimant)
            .unwrap();

        // The claimant got a close, the real session is untouched.
        assert!(events.is_empty());
        assert!(replies.iter().any(|o| o.addr == claimant));
        assert_eq!(
            bob.state_of(alice.identity.peer_id(), alice.identity.client_id())
                .unwrap(),
            SessionState::Active
        );
    }

    #[test]
    fn test_handshake_timeout_closes_connecting() {
        let mut alice = manager("alice");

        let mut bob_contact = contact_for(&manager("bob"), 4001);
        bob_contact.peer_id = PeerId::new(0x4242);
        alice.connect(&bob_contact).unwrap();

        // Backdate the session start past the timeout.
        let key = (bob_contact.peer_id, bob_contact.client_id);
        alice.sessions.get_mut(&key).unwrap().created_at =
            Instant::now() - alice.config.handshake_timeout - std::time::Duration::from_secs(1);

        let (outbound, events) = alice.tick();
        assert!(outbound
            .iter()
            .any(|o| o.packet.kind == PacketKind::SessionStream));
        assert!(matches!(
            &events[..],
            [SessionEvent::Closed { reason, .. }] if reason == "handshake timeout"
        ));
        assert!(alice.state_of(key.0, key.1).is_none());
    }

    #[test]
    fn test_malformed_frame_closes_session() {
        let mut alice = manager("alice");
        let mut bob = manager("bob");

        let initial = alice.connect(&contact_for(&bob, 4001)).unwrap();
        run_to_quiescence(&mut alice, &mut bob, initial, 4000, 4001);

        // Garbage that parses as an unknown frame kind, sent on the
        // established stream: fatal close, not a silent drop.
        // (The stream is encrypted now, so inject at the peer that has
        // not activated decryption: a fresh session.)
        let carol = manager("carol");
        let mut stream = BytesMut::new();
        stream.put_u64(carol.identity.peer_id().as_u64());
        stream.put_u16(carol.identity.client_id().as_u16());
        stream.put_slice(&[0xFF, 0x00, 0x00]);

        let (_, events) = bob.handle_stream(&stream.freeze(), addr(6000)).unwrap();
        assert!(matches!(
            &events[..],
            [SessionEvent::Closed { reason, .. }] if reason.contains("malformed")
        ));
        assert!(bob
            .state_of(carol.identity.peer_id(), carol.identity.client_id())
            .is_none());
    }

    #[test]
    fn test_send_on_inactive_session_fails() {
        let mut alice = manager("alice");
        let err = alice.send_reliable(PeerId::new(5), ClientId::new(5), 1, b"x");
        assert!(matches!(err, Err(CoreError::NoSession { .. })));
    }
}
