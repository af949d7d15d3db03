//! TCP proxy relaying
//!
//! Firewalled peers keep a small set of reachable peers relaying for
//! them over long-lived TCP links; open peers serve a larger set of
//! such clients. Both sets trend toward the topologically nearest
//! peers: at quota, a requester XOR-closer than the worst hosted peer
//! of its class evicts it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, trace, warn};
use weftnet_crypto::PeerId;
use weftnet_routing::FirewallState;

use crate::error::{NetError, NetResult};
use crate::wire::Packet;

/// Role of the remote peer in a proxy relationship
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyRole {
    /// The peer relays for us; we are its firewalled client
    ProxyingUs,
    /// We relay for the peer; it is our firewalled client
    ProxiedByUs,
}

/// Outcome of a proxy admission request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyAdmission {
    /// Admitted into free quota
    Accepted,
    /// Admitted by displacing the XOR-furthest member of the class
    AcceptedEvicting(PeerId),
    /// At quota and no improvement over the hosted peers
    Rejected,
}

/// Maximum concurrent outbound connection attempts
pub const MAX_CONNECT_ATTEMPTS: usize = 6;

/// Peers we keep relaying for us
pub const MAX_PROXYING_US: usize = 2;

/// Blocked clients we relay for
pub const MAX_BLOCKED_CLIENTS: usize = 6;

/// NAT clients we relay for
pub const MAX_NAT_CLIENTS: usize = 12;

/// Per-link outbound channel depth
pub const PROXY_CHANNEL_DEPTH: usize = 64;

fn quota(role: ProxyRole, state: FirewallState) -> usize {
    match role {
        ProxyRole::ProxyingUs => MAX_PROXYING_US,
        ProxyRole::ProxiedByUs => match state {
            FirewallState::Blocked => MAX_BLOCKED_CLIENTS,
            FirewallState::Nat => MAX_NAT_CLIENTS,
            // An open peer does not need a relay.
            FirewallState::Open => 0,
        },
    }
}

/// Pure bookkeeping for proxy relationships: who is hosted in which
/// role, bounded per class, eviction by XOR improvement.
#[derive(Debug)]
pub struct ProxySet {
    local_id: PeerId,
    members: HashMap<PeerId, (ProxyRole, FirewallState)>,
}

impl ProxySet {
    pub fn new(local_id: PeerId) -> Self {
        Self {
            local_id,
            members: HashMap::new(),
        }
    }

    fn class_members(&self, role: ProxyRole, state: FirewallState) -> Vec<PeerId> {
        self.members
            .iter()
            .filter(|(_, (r, s))| {
                *r == role && (role == ProxyRole::ProxyingUs || *s == state)
            })
            .map(|(id, _)| *id)
            .collect()
    }

    /// Request admission for a peer in the given role
    pub fn accept(
        &mut self,
        peer: PeerId,
        role: ProxyRole,
        state: FirewallState,
    ) -> ProxyAdmission {
        if self.members.contains_key(&peer) {
            self.members.insert(peer, (role, state));
            return ProxyAdmission::Accepted;
        }

        let class = self.class_members(role, state);
        if class.len() < quota(role, state) {
            self.members.insert(peer, (role, state));
            return ProxyAdmission::Accepted;
        }

        let worst = class
            .into_iter()
            .max_by_key(|id| self.local_id.distance(id));
        match worst {
            Some(worst) if self.local_id.distance(&peer) < self.local_id.distance(&worst) => {
                self.members.remove(&worst);
                self.members.insert(peer, (role, state));
                ProxyAdmission::AcceptedEvicting(worst)
            }
            _ => ProxyAdmission::Rejected,
        }
    }

    /// Drop a relationship
    pub fn remove(&mut self, peer: PeerId) -> bool {
        self.members.remove(&peer).is_some()
    }

    /// Whether the peer is hosted in any role
    pub fn contains(&self, peer: PeerId) -> bool {
        self.members.contains_key(&peer)
    }

    /// Role the peer is hosted in, if any
    pub fn role_of(&self, peer: PeerId) -> Option<ProxyRole> {
        self.members.get(&peer).map(|(role, _)| *role)
    }

    /// Members hosted in a role
    pub fn members_in_role(&self, role: ProxyRole) -> Vec<PeerId> {
        self.members
            .iter()
            .filter(|(_, (r, _))| *r == role)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Peers to disconnect because a class exceeds its quota: the
    /// XOR-furthest member of each over-quota class.
    pub fn over_quota(&self) -> Vec<PeerId> {
        let mut victims = Vec::new();
        let classes: [(ProxyRole, FirewallState); 3] = [
            (ProxyRole::ProxyingUs, FirewallState::Blocked),
            (ProxyRole::ProxiedByUs, FirewallState::Blocked),
            (ProxyRole::ProxiedByUs, FirewallState::Nat),
        ];
        for (role, state) in classes {
            let mut class = self.class_members(role, state);
            let limit = quota(role, state);
            while class.len() > limit {
                let furthest = class
                    .iter()
                    .copied()
                    .max_by_key(|id| self.local_id.distance(id))
                    .expect("non-empty class");
                class.retain(|id| *id != furthest);
                victims.push(furthest);
            }
        }
        victims
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Identifier of one TCP link, assigned by the dispatcher before the
/// remote peer has authenticated itself.
pub type LinkId = u64;

/// A packet received over a proxy link
#[derive(Debug)]
pub struct ProxyInbound {
    pub link: LinkId,
    pub packet: Packet,
}

/// Manages proxy relationships and their TCP links
pub struct ProxyRelay {
    set: ProxySet,
    handles: HashMap<PeerId, mpsc::Sender<Bytes>>,
    attempt_permits: Arc<Semaphore>,
}

impl ProxyRelay {
    pub fn new(local_id: PeerId) -> Self {
        Self {
            set: ProxySet::new(local_id),
            handles: HashMap::new(),
            attempt_permits: Arc::new(Semaphore::new(MAX_CONNECT_ATTEMPTS)),
        }
    }

    /// Bookkeeping view
    pub fn set(&self) -> &ProxySet {
        &self.set
    }

    /// The shared cap on concurrent outbound connection attempts
    pub fn connect_permits(&self) -> Arc<Semaphore> {
        self.attempt_permits.clone()
    }

    /// Open an outbound TCP connection, holding a permit from the
    /// shared in-flight attempt cap for the duration of the attempt.
    /// Callable off the core task; pass `connect_permits()`.
    pub async fn make_outbound(
        permits: Arc<Semaphore>,
        addr: SocketAddr,
    ) -> NetResult<TcpStream> {
        let _permit = permits
            .try_acquire_owned()
            .map_err(|_| NetError::TooManyAttempts)?;
        let stream = TcpStream::connect(addr).await?;
        debug!(peer_addr = %addr, "outbound proxy connection established");
        Ok(stream)
    }

    /// Admit a peer and take ownership of its link
    pub fn accept(
        &mut self,
        peer: PeerId,
        role: ProxyRole,
        state: FirewallState,
        handle: mpsc::Sender<Bytes>,
    ) -> ProxyAdmission {
        let admission = self.set.accept(peer, role, state);
        match admission {
            ProxyAdmission::Accepted => {
                self.handles.insert(peer, handle);
            }
            ProxyAdmission::AcceptedEvicting(evicted) => {
                self.handles.remove(&evicted);
                self.handles.insert(peer, handle);
                debug!(peer = %peer, evicted = %evicted, "proxy slot reassigned to closer peer");
            }
            ProxyAdmission::Rejected => {}
        }
        admission
    }

    /// Forward raw bytes to a hosted peer. Back-pressure surfaces as an
    /// explicit buffer-full fault, never as blocking.
    pub fn forward(&self, to: PeerId, bytes: Bytes) -> NetResult<usize> {
        let handle = self.handles.get(&to).ok_or(NetError::NoRoute(to))?;
        let len = bytes.len();
        match handle.try_send(bytes) {
            Ok(()) => Ok(len),
            Err(mpsc::error::TrySendError::Full(_)) => Err(NetError::BufferFull(to)),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(NetError::NoRoute(to)),
        }
    }

    /// A peer we can currently relay through or to
    pub fn has_link(&self, peer: PeerId) -> bool {
        self.handles.contains_key(&peer)
    }

    /// Any peer currently proxying us, preferring the XOR-closest
    pub fn best_proxy_for_us(&self) -> Option<PeerId> {
        self.set
            .members_in_role(ProxyRole::ProxyingUs)
            .into_iter()
            .filter(|id| self.handles.contains_key(id))
            .min_by_key(|id| self.set.local_id.distance(id))
    }

    /// Tear down a relationship and its link
    pub fn disconnect(&mut self, peer: PeerId) {
        self.set.remove(peer);
        self.handles.remove(&peer);
    }

    /// Periodic quota enforcement; returns the peers that were
    /// disconnected.
    pub fn check_proxies(&mut self) -> Vec<PeerId> {
        let victims = self.set.over_quota();
        for victim in &victims {
            debug!(peer = %victim, "disconnecting furthest over-quota proxy peer");
            self.set.remove(*victim);
            self.handles.remove(victim);
        }
        victims
    }
}

/// Spawn the reader/writer tasks for a proxy TCP link.
///
/// Returns the outbound handle; packets arriving on the link are
/// parsed and pushed into `inbound_tx`. Either half closing tears the
/// link down.
pub fn spawn_link(
    stream: TcpStream,
    link: LinkId,
    inbound_tx: mpsc::Sender<ProxyInbound>,
) -> mpsc::Sender<Bytes> {
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Bytes>(PROXY_CHANNEL_DEPTH);
    let (mut read_half, mut write_half) = stream.into_split();

    tokio::spawn(async move {
        while let Some(bytes) = outbound_rx.recv().await {
            if let Err(e) = write_half.write_all(&bytes).await {
                debug!(link, error = %e, "proxy link write failed");
                break;
            }
        }
    });

    tokio::spawn(async move {
        let mut buf = BytesMut::with_capacity(8 * 1024);
        loop {
            match read_half.read_buf(&mut buf).await {
                Ok(0) => {
                    trace!(link, "proxy link closed by remote");
                    break;
                }
                Ok(_) => loop {
                    match Packet::parse(&buf) {
                        Ok(Some((packet, consumed))) => {
                            let _ = buf.split_to(consumed);
                            if inbound_tx
                                .send(ProxyInbound { link, packet })
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(link, error = %e, "malformed packet on proxy link");
                            return;
                        }
                    }
                },
                Err(e) => {
                    debug!(link, error = %e, "proxy link read failed");
                    break;
                }
            }
        }
    });

    outbound_tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn id(raw: u64) -> PeerId {
        PeerId::new(raw)
    }

    #[test]
    fn test_quota_admission_and_rejection() {
        let mut set = ProxySet::new(id(0));

        assert_eq!(
            set.accept(id(0x10), ProxyRole::ProxyingUs, FirewallState::Open),
            ProxyAdmission::Accepted
        );
        assert_eq!(
            set.accept(id(0x20), ProxyRole::ProxyingUs, FirewallState::Open),
            ProxyAdmission::Accepted
        );

        // At quota: a farther peer is rejected.
        assert_eq!(
            set.accept(id(0x80), ProxyRole::ProxyingUs, FirewallState::Open),
            ProxyAdmission::Rejected
        );
    }

    #[test]
    fn test_eviction_by_improvement() {
        let mut set = ProxySet::new(id(0));
        set.accept(id(0x10), ProxyRole::ProxyingUs, FirewallState::Open);
        set.accept(id(0x20), ProxyRole::ProxyingUs, FirewallState::Open);

        // Closer than the worst member (0x20): admitted, 0x20 evicted.
        assert_eq!(
            set.accept(id(0x01), ProxyRole::ProxyingUs, FirewallState::Open),
            ProxyAdmission::AcceptedEvicting(id(0x20))
        );
        assert!(set.contains(id(0x01)));
        assert!(!set.contains(id(0x20)));
    }

    #[test]
    fn test_client_classes_have_separate_quotas() {
        let mut set = ProxySet::new(id(0));

        for i in 0..MAX_BLOCKED_CLIENTS as u64 {
            assert_eq!(
                set.accept(id(0x100 + i), ProxyRole::ProxiedByUs, FirewallState::Blocked),
                ProxyAdmission::Accepted
            );
        }
        // Blocked class is full; NAT clients still fit.
        assert_eq!(
            set.accept(id(0xF00), ProxyRole::ProxiedByUs, FirewallState::Blocked),
            ProxyAdmission::Rejected
        );
        assert_eq!(
            set.accept(id(0x200), ProxyRole::ProxiedByUs, FirewallState::Nat),
            ProxyAdmission::Accepted
        );
    }

    #[test]
    fn test_over_quota_picks_furthest() {
        let mut set = ProxySet::new(id(0));
        set.accept(id(0x10), ProxyRole::ProxyingUs, FirewallState::Open);
        set.accept(id(0x20), ProxyRole::ProxyingUs, FirewallState::Open);
        assert!(set.over_quota().is_empty());

        // Force a third member in by hand to simulate a quota shrink.
        set.members
            .insert(id(0x40), (ProxyRole::ProxyingUs, FirewallState::Open));
        assert_eq!(set.over_quota(), vec![id(0x40)]);
    }

    #[tokio::test]
    async fn test_link_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let (inbound_tx, mut inbound_rx) = mpsc::channel(8);
        let client_handle = spawn_link(client, 1, inbound_tx.clone());
        let _server_handle = spawn_link(server, 2, inbound_tx);

        let packet = Packet::new(crate::wire::PacketKind::Data, vec![1, 2, 3]);
        client_handle.send(packet.to_bytes()).await.unwrap();

        let received = inbound_rx.recv().await.unwrap();
        assert_eq!(received.link, 2);
        assert_eq!(received.packet, packet);
    }

    #[tokio::test]
    async fn test_forward_without_link_fails() {
        let relay = ProxyRelay::new(id(1));
        assert!(matches!(
            relay.forward(id(9), Bytes::from_static(b"x")),
            Err(NetError::NoRoute(_))
        ));
    }
}
