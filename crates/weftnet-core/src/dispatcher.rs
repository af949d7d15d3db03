//! The overlay dispatcher
//!
//! One dispatcher task owns all mutable overlay state of an instance:
//! routing table, connectivity classifier, proxy and tunnel relays,
//! and the session manager. External callers marshal into the task
//! through a command queue with oneshot replies; socket readers feed
//! bounded packet queues. The run loop interleaves one command, the
//! 1 Hz timer, and one inbound packet per turn, so a packet flood
//! cannot starve maintenance. Nothing here blocks on network I/O:
//! sends go through non-blocking socket calls or per-link channels,
//! with back-pressure surfaced as explicit faults.
//!
//! Two dispatcher instances form the full node: the primary overlay
//! and the lookup overlay used for tunneling around blocked paths.
//! They communicate only through each other's command queues.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};
use weftnet_crypto::{ClientId, NodeIdentity, PeerId, SessionKey};
use weftnet_net::{
    spawn_link, spawn_tcp_acceptor, ConnectivityClassifier, LinkId, NetError, NetResult, Packet,
    PacketKind, ProxyAdmission, ProxyInbound, ProxyRelay, ProxyRole, TransportMessage,
    TunnelEnvelope, TunnelRelay, UdpTransport, INBOUND_QUEUE_DEPTH,
};
use weftnet_routing::{
    Contact, FirewallState, MaintenanceAction, RoutingEvent, RoutingTable, K,
};

use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::session::{Outbound, SessionEvent, SessionManager};

/// Peers queried per discovery search
const DISCOVER_FANOUT: usize = 3;

/// Requests the core task serves for external callers
pub enum Command {
    /// Transparent send: UDP, proxy relay, or overlay tunnel
    Send {
        addr: SocketAddr,
        packet: Packet,
        reply: oneshot::Sender<NetResult<usize>>,
    },
    /// Open a session towards a contact
    Connect {
        contact: Contact,
        reply: oneshot::Sender<CoreResult<()>>,
    },
    /// Queue payload on the reliable encrypted stream
    SendReliable {
        peer: PeerId,
        client: ClientId,
        service_id: u16,
        payload: Bytes,
        reply: oneshot::Sender<CoreResult<()>>,
    },
    /// Latency-sensitive sealed datagram outside the stream
    SendUnreliable {
        peer: PeerId,
        client: ClientId,
        service_id: u16,
        payload: Bytes,
        reply: oneshot::Sender<CoreResult<()>>,
    },
    /// Offer a contact to the routing table
    AddContact { contact: Contact },
    /// Nearest tracked contacts to a target
    Find {
        target: PeerId,
        max_results: usize,
        reply: oneshot::Sender<Vec<Contact>>,
    },
    /// Whether an identifier falls in the local cache area
    InCacheArea {
        id: PeerId,
        reply: oneshot::Sender<bool>,
    },
    /// Current local connectivity classification
    LocalState {
        reply: oneshot::Sender<FirewallState>,
    },
    /// The bound UDP endpoint of this overlay instance
    LocalAddr {
        reply: oneshot::Sender<SocketAddr>,
    },
    /// Stop the dispatcher task
    Shutdown,
}

/// What the overlay reports to the application services
#[derive(Debug, Clone)]
pub enum OverlayEvent {
    /// Session protocol event
    Session(SessionEvent),
    /// A peer entered the cache-area neighborhood; push it a
    /// replication patch
    Replication { target: Contact },
    /// The freshest contact aged past the disconnect-detection bound
    Unresponsive,
}

/// Proxy relationship control message, exchanged over proxy links and
/// gossiped over UDP so peers learn each other's proxy servers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyUpdatePayload {
    pub peer_id: PeerId,
    pub client_id: ClientId,
    /// Sender's firewall state, as a contact wire byte
    pub firewall: u8,
    /// Tear the relationship down instead of establishing it
    pub disconnect: bool,
    /// The sender's proxy server, for peers that must tunnel to it
    pub proxy_server: Option<SocketAddr>,
}

impl ProxyUpdatePayload {
    pub fn to_bytes(&self) -> CoreResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> CoreResult<Self> {
        bincode::deserialize(bytes).map_err(|e| CoreError::Serialization(e.to_string()))
    }
}

/// Clonable handle marshalling calls into the dispatcher task
#[derive(Clone)]
pub struct DispatcherHandle {
    tx: mpsc::Sender<Command>,
}

impl DispatcherHandle {
    /// Send a packet, transparently choosing the path
    pub async fn send(&self, addr: SocketAddr, packet: Packet) -> CoreResult<usize> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Send {
                addr,
                packet,
                reply,
            })
            .await
            .map_err(|_| CoreError::DispatcherGone)?;
        Ok(rx.await.map_err(|_| CoreError::DispatcherGone)??)
    }

    /// Open a session towards a contact
    pub async fn connect(&self, contact: Contact) -> CoreResult<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Connect { contact, reply })
            .await
            .map_err(|_| CoreError::DispatcherGone)?;
        rx.await.map_err(|_| CoreError::DispatcherGone)?
    }

    /// Queue payload on the reliable encrypted stream
    pub async fn send_reliable(
        &self,
        peer: PeerId,
        client: ClientId,
        service_id: u16,
        payload: Bytes,
    ) -> CoreResult<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::SendReliable {
                peer,
                client,
                service_id,
                payload,
                reply,
            })
            .await
            .map_err(|_| CoreError::DispatcherGone)?;
        rx.await.map_err(|_| CoreError::DispatcherGone)?
    }

    /// Send a sealed datagram outside the stream
    pub async fn send_unreliable(
        &self,
        peer: PeerId,
        client: ClientId,
        service_id: u16,
        payload: Bytes,
    ) -> CoreResult<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::SendUnreliable {
                peer,
                client,
                service_id,
                payload,
                reply,
            })
            .await
            .map_err(|_| CoreError::DispatcherGone)?;
        rx.await.map_err(|_| CoreError::DispatcherGone)?
    }

    /// Offer a contact to the routing table, fire-and-forget
    pub fn add_contact(&self, contact: Contact) {
        let _ = self.tx.try_send(Command::AddContact { contact });
    }

    /// Nearest tracked contacts to a target
    pub async fn find(&self, target: PeerId, max_results: usize) -> CoreResult<Vec<Contact>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Find {
                target,
                max_results,
                reply,
            })
            .await
            .map_err(|_| CoreError::DispatcherGone)?;
        rx.await.map_err(|_| CoreError::DispatcherGone)
    }

    /// Whether an identifier falls in the local cache area
    pub async fn in_cache_area(&self, id: PeerId) -> CoreResult<bool> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::InCacheArea { id, reply })
            .await
            .map_err(|_| CoreError::DispatcherGone)?;
        rx.await.map_err(|_| CoreError::DispatcherGone)
    }

    /// Current local connectivity classification
    pub async fn local_state(&self) -> CoreResult<FirewallState> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::LocalState { reply })
            .await
            .map_err(|_| CoreError::DispatcherGone)?;
        rx.await.map_err(|_| CoreError::DispatcherGone)
    }

    /// The bound UDP endpoint of this overlay instance
    pub async fn local_addr(&self) -> CoreResult<SocketAddr> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::LocalAddr { reply })
            .await
            .map_err(|_| CoreError::DispatcherGone)?;
        rx.await.map_err(|_| CoreError::DispatcherGone)
    }

    /// Stop the dispatcher task
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
    }
}

struct PendingLink {
    handle: mpsc::Sender<Bytes>,
    addr: SocketAddr,
    peer: Option<PeerId>,
}

/// One overlay instance's single-threaded core
pub struct Dispatcher {
    identity: NodeIdentity,
    config: CoreConfig,

    table: RoutingTable,
    classifier: ConnectivityClassifier,
    proxies: ProxyRelay,
    tunnels: TunnelRelay,
    sessions: SessionManager,

    transport: Arc<UdpTransport>,
    tcp_port: u16,
    operation_key: SessionKey,

    command_rx: mpsc::Receiver<Command>,
    udp_rx: mpsc::Receiver<TransportMessage>,
    tcp_rx: mpsc::Receiver<(TcpStream, SocketAddr)>,
    proxy_rx: mpsc::Receiver<ProxyInbound>,
    proxy_tx: mpsc::Sender<ProxyInbound>,
    connected_rx: mpsc::Receiver<(TcpStream, Contact)>,
    connected_tx: mpsc::Sender<(TcpStream, Contact)>,
    routing_rx: mpsc::UnboundedReceiver<RoutingEvent>,
    events_tx: mpsc::UnboundedSender<OverlayEvent>,

    links: HashMap<LinkId, PendingLink>,
    next_link: LinkId,

    /// Known proxy servers of remote peers, learned from gossip
    proxy_servers: HashMap<PeerId, SocketAddr>,

    /// The secondary lookup overlay, absent on the lookup instance
    lookup: Option<DispatcherHandle>,

    was_responsive: bool,
}

impl Dispatcher {
    /// Bind sockets, spawn the I/O tasks and the core task. Returns
    /// the command handle and the application event stream.
    pub async fn spawn(
        identity: NodeIdentity,
        config: CoreConfig,
        udp_bind: SocketAddr,
        tcp_bind: SocketAddr,
        operation_key: SessionKey,
        lookup: Option<DispatcherHandle>,
    ) -> CoreResult<(DispatcherHandle, mpsc::UnboundedReceiver<OverlayEvent>)> {
        config.validate().map_err(CoreError::HandshakeFailed)?;

        let transport = Arc::new(UdpTransport::bind(udp_bind).await?);
        let listener = TcpListener::bind(tcp_bind).await.map_err(NetError::Io)?;
        let tcp_port = listener.local_addr().map_err(NetError::Io)?.port();

        let (command_tx, command_rx) = mpsc::channel(64);
        let (udp_tx, udp_rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        let (tcp_tx, tcp_rx) = mpsc::channel(16);
        let (proxy_tx, proxy_rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        let (connected_tx, connected_rx) = mpsc::channel(16);
        let (routing_tx, routing_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        transport.clone().spawn_receiver(udp_tx);
        spawn_tcp_acceptor(listener, tcp_tx);

        let local_id = identity.peer_id();
        let mut table = RoutingTable::new(local_id);
        table.set_event_sink(routing_tx);

        let dispatcher = Dispatcher {
            sessions: SessionManager::new(identity.clone(), config.clone()),
            identity,
            config,
            table,
            classifier: ConnectivityClassifier::new(),
            proxies: ProxyRelay::new(local_id),
            tunnels: TunnelRelay::new(local_id),
            transport,
            tcp_port,
            operation_key,
            command_rx,
            udp_rx,
            tcp_rx,
            proxy_rx,
            proxy_tx,
            connected_rx,
            connected_tx,
            routing_rx,
            events_tx,
            links: HashMap::new(),
            next_link: 1,
            proxy_servers: HashMap::new(),
            lookup,
            was_responsive: false,
        };

        info!(peer = %local_id, udp = %dispatcher.transport.local_addr(), tcp_port, "dispatcher starting");
        tokio::spawn(dispatcher.run());

        Ok((DispatcherHandle { tx: command_tx }, events_rx))
    }

    /// The core loop: one command, the timer when due, one inbound
    /// packet, in that priority order.
    async fn run(mut self) {
        let mut timer = tokio::time::interval(Duration::from_secs(1));
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                cmd = self.command_rx.recv() => match cmd {
                    None | Some(Command::Shutdown) => {
                        info!(peer = %self.identity.peer_id(), "dispatcher stopping");
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd),
                },

                _ = timer.tick() => self.on_tick(),

                Some((stream, from)) = self.tcp_rx.recv() => self.on_inbound_tcp(stream, from),

                Some((stream, contact)) = self.connected_rx.recv() => {
                    self.on_outbound_proxy_connected(stream, contact)
                }

                Some(inbound) = self.proxy_rx.recv() => self.on_proxy_packet(inbound),

                Some(msg) = self.udp_rx.recv() => {
                    self.classifier.observe_inbound_udp(msg.from);
                    self.handle_packet(msg.from, msg.packet);
                }
            }
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Send {
                addr,
                packet,
                reply,
            } => {
                let _ = reply.send(self.send_packet(addr, &packet));
            }
            Command::Connect { contact, reply } => {
                let result = self.sessions.connect(&contact).map(|outbound| {
                    self.send_outbound(outbound);
                });
                let _ = self.table.add(contact);
                let _ = reply.send(result);
            }
            Command::SendReliable {
                peer,
                client,
                service_id,
                payload,
                reply,
            } => {
                let _ = reply.send(
                    self.sessions
                        .send_reliable(peer, client, service_id, &payload),
                );
            }
            Command::SendUnreliable {
                peer,
                client,
                service_id,
                payload,
                reply,
            } => {
                let result = self
                    .sessions
                    .send_unreliable(peer, client, service_id, &payload)
                    .map(|out| {
                        if let Err(e) = self.send_packet(out.addr, &out.packet) {
                            debug!(error = %e, "unreliable send dropped");
                        }
                    });
                let _ = reply.send(result);
            }
            Command::AddContact { contact } => {
                self.add_contact(contact);
            }
            Command::Find {
                target,
                max_results,
                reply,
            } => {
                let _ = reply.send(self.table.find(target, max_results));
            }
            Command::InCacheArea { id, reply } => {
                let _ = reply.send(self.table.in_cache_area(id));
            }
            Command::LocalState { reply } => {
                let _ = reply.send(self.classifier.state());
            }
            Command::LocalAddr { reply } => {
                let _ = reply.send(self.transport.local_addr());
            }
            Command::Shutdown => unreachable!("handled in run loop"),
        }
    }

    /// Classify and handle one inbound packet, wherever it arrived
    fn handle_packet(&mut self, from: SocketAddr, packet: Packet) {
        trace!(from = %from, kind = ?packet.kind, "inbound packet");
        match packet.kind {
            PacketKind::Ping => {
                self.note_sender(&packet, from);
                let pong = Packet::pong(&self.local_contact());
                if let Err(e) = self.transport.try_send_to(&pong, from) {
                    debug!(to = %from, error = %e, "pong dropped");
                }
            }

            PacketKind::Pong => {
                self.note_sender(&packet, from);
            }

            PacketKind::Discover => {
                if packet.payload.len() != 8 {
                    debug!(from = %from, "malformed discovery request");
                    return;
                }
                let target = PeerId::new(packet.payload.clone().get_u64());
                let found = self.table.find(target, K);
                let reply = Packet::discover_reply(&found);
                if let Err(e) = self.transport.try_send_to(&reply, from) {
                    debug!(to = %from, error = %e, "discovery reply dropped");
                }
            }

            PacketKind::DiscoverReply => match packet.contact_list() {
                Ok(contacts) => {
                    for contact in contacts {
                        self.add_contact(contact);
                    }
                }
                Err(e) => debug!(from = %from, error = %e, "malformed discovery reply"),
            },

            PacketKind::SessionStream => {
                match self.sessions.handle_stream(&packet.payload, from) {
                    Ok((outbound, events)) => {
                        self.send_outbound(outbound);
                        for event in events {
                            let _ = self.events_tx.send(OverlayEvent::Session(event));
                        }
                    }
                    Err(e) => debug!(from = %from, error = %e, "session stream rejected"),
                }
            }

            PacketKind::Data => match self.sessions.handle_unreliable(&packet.payload) {
                Ok(Some(event)) => {
                    let _ = self.events_tx.send(OverlayEvent::Session(event));
                }
                Ok(None) => {}
                Err(e) => debug!(from = %from, error = %e, "unreliable datagram rejected"),
            },

            PacketKind::Tunnel => self.on_tunnel(from, &packet),

            PacketKind::ProxyUpdate => match ProxyUpdatePayload::from_bytes(&packet.payload) {
                Ok(update) => self.on_proxy_update(None, from, update),
                Err(e) => debug!(from = %from, error = %e, "malformed proxy update"),
            },

            other => {
                debug!(from = %from, kind = ?other, "unexpected bare packet dropped");
            }
        }
    }

    /// Refresh the routing table from a liveness packet's contact
    /// record, trusting the observed source endpoint over the claimed
    /// one.
    fn note_sender(&mut self, packet: &Packet, from: SocketAddr) {
        match packet.sender_contact() {
            Ok(mut contact) => {
                if let std::net::IpAddr::V4(ip) = from.ip() {
                    contact.ip = ip;
                    contact.udp_port = from.port();
                }
                self.add_contact(contact);
            }
            Err(e) => debug!(from = %from, error = %e, "malformed liveness contact"),
        }
    }

    fn add_contact(&mut self, contact: Contact) {
        match self.table.add(contact) {
            Ok(outcome) => trace!(?outcome, "contact offered"),
            Err(e) => debug!(error = %e, "contact rejected"),
        }
    }

    /// Our own contact record as peers should see it
    fn local_contact(&self) -> Contact {
        let local = self.transport.local_addr();
        let ip = match local.ip() {
            std::net::IpAddr::V4(ip) => ip,
            _ => std::net::Ipv4Addr::UNSPECIFIED,
        };
        Contact::new(
            self.identity.peer_id(),
            self.identity.client_id(),
            ip,
            self.tcp_port,
            local.port(),
            self.classifier.state(),
        )
    }

    /// Transparent send: direct UDP, TCP proxy relay towards hosted
    /// peers, or the overlay tunnel for blocked peers we cannot reach.
    fn send_packet(&mut self, addr: SocketAddr, packet: &Packet) -> NetResult<usize> {
        let blocked_peer = self
            .table
            .contacts()
            .find(|c| c.udp_addr() == addr)
            .filter(|c| c.firewall == FirewallState::Blocked)
            .map(|c| c.peer_id);

        match blocked_peer {
            Some(peer) if self.proxies.has_link(peer) => {
                trace!(peer = %peer, "sending via proxy link");
                self.proxies.forward(peer, packet.to_bytes())
            }
            Some(peer) => self.send_via_tunnel(peer, packet),
            None => self.transport.try_send_to(packet, addr),
        }
    }

    /// Route a packet for a blocked peer across the lookup overlay
    fn send_via_tunnel(&mut self, target: PeerId, packet: &Packet) -> NetResult<usize> {
        let lookup = match &self.lookup {
            Some(lookup) => lookup.clone(),
            None => return Err(NetError::NoRoute(target)),
        };
        let target_proxy = match self.proxy_servers.get(&target) {
            Some(addr) => *addr,
            None => return Err(NetError::NoRoute(target)),
        };
        let source_proxy = self
            .proxies
            .best_proxy_for_us()
            .and_then(|id| self.table.get(id).map(|c| c.tcp_addr()))
            .unwrap_or_else(|| SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), 0));

        let wrapped = self.tunnels.wrap(
            target,
            source_proxy,
            target_proxy,
            packet,
            &self.operation_key,
            self.config.restricted_operations,
        )?;
        let sent = wrapped.size();

        trace!(peer = %target, via = %target_proxy, "sending via lookup tunnel");
        // Hand off to the lookup overlay's own core task.
        tokio::spawn(async move {
            if let Err(e) = lookup.send(target_proxy, wrapped).await {
                debug!(error = %e, "tunnel hand-off failed");
            }
        });
        Ok(sent)
    }

    /// A tunnel packet: terminate it here or forward it along
    fn on_tunnel(&mut self, from: SocketAddr, packet: &Packet) {
        let envelope = match TunnelEnvelope::decode(&packet.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(from = %from, error = %e, "malformed tunnel envelope");
                return;
            }
        };

        if self.tunnels.is_local_target(&envelope) {
            match self.tunnels.unwrap(&envelope, &self.operation_key) {
                Ok(inner) => {
                    // Re-enters classification as if it arrived directly.
                    self.handle_packet(envelope.source_proxy, inner);
                }
                Err(e) => debug!(from = %from, error = %e, "tunnel payload rejected"),
            }
            return;
        }

        // Intermediate hop: hand to the hosted peer or onward by UDP.
        if self.proxies.has_link(envelope.target) {
            if let Err(e) = self.proxies.forward(envelope.target, packet.to_bytes()) {
                debug!(peer = %envelope.target, error = %e, "tunnel forward dropped");
            }
        } else if let Err(e) = self.transport.try_send_to(packet, envelope.target_proxy) {
            debug!(to = %envelope.target_proxy, error = %e, "tunnel relay dropped");
        }
    }

    /// Unsolicited inbound TCP: strong evidence we are Open, and the
    /// start of a possible proxy-client relationship.
    fn on_inbound_tcp(&mut self, stream: TcpStream, from: SocketAddr) {
        self.classifier.observe_inbound_tcp(from);

        let link = self.next_link;
        self.next_link += 1;
        let handle = spawn_link(stream, link, self.proxy_tx.clone());
        self.links.insert(
            link,
            PendingLink {
                handle,
                addr: from,
                peer: None,
            },
        );
        debug!(from = %from, link, "inbound proxy link pending identification");
    }

    /// An outbound proxy connection we initiated completed
    fn on_outbound_proxy_connected(&mut self, stream: TcpStream, contact: Contact) {
        let link = self.next_link;
        self.next_link += 1;
        let handle = spawn_link(stream, link, self.proxy_tx.clone());

        let admission = self.proxies.accept(
            contact.peer_id,
            ProxyRole::ProxyingUs,
            self.classifier.state(),
            handle.clone(),
        );
        if admission == ProxyAdmission::Rejected {
            debug!(peer = %contact.peer_id, "outbound proxy no longer wanted");
            return;
        }

        self.links.insert(
            link,
            PendingLink {
                handle: handle.clone(),
                addr: contact.tcp_addr(),
                peer: Some(contact.peer_id),
            },
        );

        // Introduce ourselves and request hosting.
        let update = ProxyUpdatePayload {
            peer_id: self.identity.peer_id(),
            client_id: self.identity.client_id(),
            firewall: self.classifier.state() as u8,
            disconnect: false,
            proxy_server: None,
        };
        match update.to_bytes() {
            Ok(bytes) => {
                let packet = Packet::new(PacketKind::ProxyUpdate, bytes);
                if handle.try_send(packet.to_bytes()).is_err() {
                    warn!(peer = %contact.peer_id, "proxy introduction dropped");
                }
                info!(peer = %contact.peer_id, "proxy relationship requested");
            }
            Err(e) => warn!(error = %e, "proxy introduction failed to encode"),
        }
    }

    /// A packet arriving over a proxy TCP link
    fn on_proxy_packet(&mut self, inbound: ProxyInbound) {
        let Some(link_info) = self.links.get(&inbound.link) else {
            trace!(link = inbound.link, "packet on unknown link dropped");
            return;
        };
        let addr = link_info.addr;
        let peer = link_info.peer;

        match inbound.packet.kind {
            PacketKind::ProxyUpdate => {
                match ProxyUpdatePayload::from_bytes(&inbound.packet.payload) {
                    Ok(update) => self.on_proxy_update(Some(inbound.link), addr, update),
                    Err(e) => debug!(link = inbound.link, error = %e, "malformed proxy update"),
                }
            }
            _ => {
                if peer.is_none() {
                    debug!(link = inbound.link, "packet before identification dropped");
                    return;
                }
                self.handle_packet(addr, inbound.packet);
            }
        }
    }

    /// Process a proxy relationship change
    fn on_proxy_update(
        &mut self,
        link: Option<LinkId>,
        from: SocketAddr,
        update: ProxyUpdatePayload,
    ) {
        if let Some(server) = update.proxy_server {
            self.proxy_servers.insert(update.peer_id, server);
        }

        if update.disconnect {
            let was_ours =
                self.proxies.set().role_of(update.peer_id) == Some(ProxyRole::ProxyingUs);
            self.proxies.disconnect(update.peer_id);
            if was_ours {
                self.classifier.on_disconnect();
            }
            info!(peer = %update.peer_id, "proxy relationship torn down");
            return;
        }

        // A request to host the sender arrives over its own link.
        let Some(link) = link else {
            return;
        };
        let Some(link_info) = self.links.get_mut(&link) else {
            return;
        };
        link_info.peer = Some(update.peer_id);
        let handle = link_info.handle.clone();

        let state = FirewallState::try_from(update.firewall).unwrap_or(FirewallState::Blocked);
        let admission =
            self.proxies
                .accept(update.peer_id, ProxyRole::ProxiedByUs, state, handle);
        match admission {
            ProxyAdmission::Rejected => {
                debug!(peer = %update.peer_id, "proxy request rejected at quota");
                self.links.remove(&link);
            }
            admission => {
                info!(peer = %update.peer_id, ?admission, from = %from, "hosting proxy client");
            }
        }
    }

    /// The 1 Hz timer: routing maintenance, session liveness, proxy
    /// quota enforcement, proxy acquisition, event forwarding.
    fn on_tick(&mut self) {
        let reachable = self.classifier.is_reachable();
        let report = self.table.tick(reachable);

        for action in report.actions {
            match action {
                MaintenanceAction::Probe(contact) => {
                    let ping = Packet::ping(&self.local_contact());
                    if let Err(e) = self.transport.try_send_to(&ping, contact.udp_addr()) {
                        debug!(peer = %contact.peer_id, error = %e, "probe dropped");
                    }
                }
                MaintenanceAction::Discover(target) => {
                    let packet = Packet::discover(target);
                    for contact in self.table.find(target, DISCOVER_FANOUT) {
                        if let Err(e) = self.transport.try_send_to(&packet, contact.udp_addr()) {
                            debug!(peer = %contact.peer_id, error = %e, "discovery dropped");
                        }
                    }
                }
            }
        }

        if report.responsive != self.was_responsive {
            self.was_responsive = report.responsive;
            if !report.responsive {
                warn!("routing table unresponsive, overlay may be disconnected");
                let _ = self.events_tx.send(OverlayEvent::Unresponsive);
            }
        }

        let (outbound, events) = self.sessions.tick();
        self.send_outbound(outbound);
        for event in events {
            let _ = self.events_tx.send(OverlayEvent::Session(event));
        }

        for victim in self.proxies.check_proxies() {
            debug!(peer = %victim, "proxy quota enforced");
        }

        self.maintain_proxies();

        while let Ok(event) = self.routing_rx.try_recv() {
            match event {
                RoutingEvent::ReplicationPush { target } => {
                    let _ = self.events_tx.send(OverlayEvent::Replication { target });
                }
            }
        }
    }

    /// While firewalled, keep enough open peers proxying us
    fn maintain_proxies(&mut self) {
        if self.classifier.state() == FirewallState::Open {
            return;
        }
        let have = self
            .proxies
            .set()
            .members_in_role(ProxyRole::ProxyingUs)
            .len();
        if have >= self.config.wanted_proxies {
            return;
        }

        let candidate = self
            .table
            .contacts()
            .filter(|c| c.firewall == FirewallState::Open)
            .filter(|c| !self.proxies.set().contains(c.peer_id))
            .min_by_key(|c| self.identity.peer_id().distance(&c.peer_id))
            .cloned();

        if let Some(contact) = candidate {
            let permits = self.proxies.connect_permits();
            let tx = self.connected_tx.clone();
            let addr = contact.tcp_addr();
            debug!(peer = %contact.peer_id, addr = %addr, "attempting proxy connection");
            tokio::spawn(async move {
                match ProxyRelay::make_outbound(permits, addr).await {
                    Ok(stream) => {
                        let _ = tx.send((stream, contact)).await;
                    }
                    Err(e) => debug!(addr = %addr, error = %e, "proxy connection failed"),
                }
            });
        }
    }

    /// Transmit session-layer datagrams through the path selector
    fn send_outbound(&mut self, outbound: Vec<Outbound>) {
        for out in outbound {
            if let Err(e) = self.send_packet(out.addr, &out.packet) {
                debug!(to = %out.addr, error = %e, "session datagram dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn any_addr() -> SocketAddr {
        SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0)
    }

    async fn spawn_node() -> (DispatcherHandle, mpsc::UnboundedReceiver<OverlayEvent>) {
        Dispatcher::spawn(
            NodeIdentity::generate(),
            CoreConfig::default(),
            any_addr(),
            any_addr(),
            SessionKey::generate(),
            None,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_spawn_and_shutdown() {
        let (handle, _events) = spawn_node().await;
        assert_eq!(
            handle.local_state().await.unwrap(),
            FirewallState::Blocked
        );
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_add_and_find_roundtrip() {
        let (handle, _events) = spawn_node().await;

        let contact = Contact::new(
            PeerId::new(0x1234),
            ClientId::new(1),
            Ipv4Addr::new(203, 0, 113, 5),
            4000,
            4001,
            FirewallState::Open,
        );
        handle.add_contact(contact.clone());

        let found = handle.find(PeerId::new(0x1234), 4).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].peer_id, contact.peer_id);

        // A sparse table covers everything.
        assert!(handle.in_cache_area(PeerId::new(0xFFFF)).await.unwrap());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_send_reliable_without_session_fails() {
        let (handle, _events) = spawn_node().await;
        let err = handle
            .send_reliable(PeerId::new(9), ClientId::new(9), 1, Bytes::from_static(b"x"))
            .await;
        assert!(matches!(err, Err(CoreError::NoSession { .. })));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_liveness_reply_registers_sender() {
        let (handle, _events) = spawn_node().await;
        let node_addr = handle.local_addr().await.unwrap();

        // A reply packet arrives whose embedded record claims an Open
        // sender; the observed source registers in the routing table.
        let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sender = Contact::new(
            PeerId::new(0xBEEF),
            ClientId::new(3),
            Ipv4Addr::new(198, 51, 100, 20),
            7000,
            7001,
            FirewallState::Open,
        );
        socket
            .send_to(&Packet::pong(&sender).to_bytes(), node_addr)
            .await
            .unwrap();

        // Give the core task a moment to drain its inbound queue.
        let mut found = Vec::new();
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            found = handle.find(PeerId::new(0xBEEF), 1).await.unwrap();
            if !found.is_empty() {
                break;
            }
        }
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].peer_id, PeerId::new(0xBEEF));
        // The observed source endpoint overrides the claimed one.
        assert_eq!(found[0].udp_addr(), socket.local_addr().unwrap());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_send_command_reports_bytes_sent() {
        let (handle, _events) = spawn_node().await;

        // No contact marks this address blocked, so the path selector
        // falls through to direct UDP into the OS socket buffer.
        let packet = Packet::new(PacketKind::Data, vec![0u8; 32]);
        let sent = handle
            .send("127.0.0.1:9".parse().unwrap(), packet.clone())
            .await
            .unwrap();
        assert_eq!(sent, packet.size());

        handle.shutdown().await;
    }
}
