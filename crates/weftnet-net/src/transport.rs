//! Datagram and listener transports
//!
//! Raw socket I/O runs on its own tasks and hands completed packets
//! into bounded queues; the dispatcher drains them one at a time. A
//! slow consumer therefore stalls the socket reader instead of growing
//! an unbounded backlog.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{NetError, NetResult};
use crate::wire::{Packet, MAX_PACKET_SIZE};

/// Depth of the inbound packet queue feeding the dispatcher
pub const INBOUND_QUEUE_DEPTH: usize = 256;

/// A message received from the transport
#[derive(Debug, Clone)]
pub struct TransportMessage {
    /// Source address
    pub from: SocketAddr,

    /// The packet
    pub packet: Packet,
}

/// UDP transport for overlay datagrams
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

impl UdpTransport {
    /// Create a new UDP transport bound to the specified address
    pub async fn bind(addr: SocketAddr) -> NetResult<Self> {
        let socket = UdpSocket::bind(addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                NetError::AddressInUse(addr)
            } else {
                NetError::Io(e)
            }
        })?;

        let local_addr = socket.local_addr()?;
        debug!("UDP transport bound to {}", local_addr);

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
        })
    }

    /// Get local address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Send a packet to the specified address; returns bytes sent
    pub async fn send_to(&self, packet: &Packet, addr: SocketAddr) -> NetResult<usize> {
        let bytes = packet.to_bytes();

        if bytes.len() > MAX_PACKET_SIZE {
            return Err(NetError::InvalidPacket(format!(
                "Packet too large: {} bytes",
                bytes.len()
            )));
        }

        trace!("Sending {} bytes to {}", bytes.len(), addr);
        let sent = self.socket.send_to(&bytes, addr).await?;
        Ok(sent)
    }

    /// Fire-and-forget send into the OS socket buffer. Never blocks
    /// the caller; back-pressure surfaces as an explicit fault.
    pub fn try_send_to(&self, packet: &Packet, addr: SocketAddr) -> NetResult<usize> {
        let bytes = packet.to_bytes();

        if bytes.len() > MAX_PACKET_SIZE {
            return Err(NetError::InvalidPacket(format!(
                "Packet too large: {} bytes",
                bytes.len()
            )));
        }

        match self.socket.try_send_to(&bytes, addr) {
            Ok(sent) => Ok(sent),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(NetError::SocketFull),
            Err(e) => Err(NetError::Io(e)),
        }
    }

    /// Receive a single packet
    pub async fn recv(&self) -> NetResult<TransportMessage> {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];

        let (len, from) = self.socket.recv_from(&mut buf).await?;
        buf.truncate(len);

        trace!("Received {} bytes from {}", len, from);

        let packet = Packet::from_datagram(Bytes::from(buf))?;
        Ok(TransportMessage { from, packet })
    }

    /// Run the receive loop, pushing packets into the bounded queue.
    /// Malformed datagrams are logged with their source and dropped;
    /// one misbehaving peer cannot take the loop down.
    pub fn spawn_receiver(
        self: Arc<Self>,
        tx: mpsc::Sender<TransportMessage>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.recv().await {
                    Ok(msg) => {
                        if tx.send(msg).await.is_err() {
                            debug!("Receiver channel closed, stopping");
                            break;
                        }
                    }
                    Err(NetError::InvalidPacket(reason)) => {
                        warn!("Dropping malformed datagram: {}", reason);
                    }
                    Err(NetError::Io(e)) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        continue;
                    }
                    Err(e) => {
                        warn!("Error receiving packet: {}", e);
                    }
                }
            }
        })
    }

    /// Clone the inner socket for sharing
    pub fn clone_socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }
}

/// Builder for UDP transport with custom socket options
pub struct UdpTransportBuilder {
    bind_addr: SocketAddr,
    recv_buffer_size: Option<usize>,
    send_buffer_size: Option<usize>,
}

impl UdpTransportBuilder {
    /// Create a new builder
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            recv_buffer_size: None,
            send_buffer_size: None,
        }
    }

    /// Set receive buffer size
    pub fn recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = Some(size);
        self
    }

    /// Set send buffer size
    pub fn send_buffer_size(mut self, size: usize) -> Self {
        self.send_buffer_size = Some(size);
        self
    }

    /// Build the transport
    pub async fn build(self) -> NetResult<UdpTransport> {
        use socket2::{Domain, Protocol, Socket, Type};

        let domain = if self.bind_addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

        if let Some(size) = self.recv_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }
        if let Some(size) = self.send_buffer_size {
            socket.set_send_buffer_size(size)?;
        }

        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&self.bind_addr.into())?;

        let std_socket: std::net::UdpSocket = socket.into();
        let tokio_socket = UdpSocket::from_std(std_socket)?;

        let local_addr = tokio_socket.local_addr()?;
        debug!("UDP transport bound to {} with custom options", local_addr);

        Ok(UdpTransport {
            socket: Arc::new(tokio_socket),
            local_addr,
        })
    }
}

/// Accept loop for inbound proxy TCP connections. Each accepted
/// connection is handed over the bounded queue together with its
/// source address; the dispatcher decides whether to host the peer.
pub fn spawn_tcp_acceptor(
    listener: TcpListener,
    tx: mpsc::Sender<(TcpStream, SocketAddr)>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, from)) => {
                    trace!("Inbound TCP connection from {}", from);
                    if tx.send((stream, from)).await.is_err() {
                        debug!("Acceptor channel closed, stopping");
                        break;
                    }
                }
                Err(e) => {
                    warn!("Error accepting TCP connection: {}", e);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::PacketKind;

    #[tokio::test]
    async fn test_transport_bind() {
        let transport = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        assert!(transport.local_addr().port() > 0);
    }

    #[tokio::test]
    async fn test_transport_send_recv() {
        let transport1 = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let transport2 = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        let packet = Packet::new(PacketKind::Data, vec![1, 2, 3]);

        let sent = transport1
            .send_to(&packet, transport2.local_addr())
            .await
            .unwrap();
        assert_eq!(sent, packet.size());

        let msg = transport2.recv().await.unwrap();
        assert_eq!(msg.from, transport1.local_addr());
        assert_eq!(msg.packet, packet);
    }

    #[tokio::test]
    async fn test_receiver_queue() {
        let transport1 = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let transport2 = Arc::new(
            UdpTransport::bind("127.0.0.1:0".parse().unwrap())
                .await
                .unwrap(),
        );

        let (tx, mut rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        transport2.clone().spawn_receiver(tx);

        for i in 0..5u8 {
            transport1
                .send_to(
                    &Packet::new(PacketKind::Data, vec![i]),
                    transport2.local_addr(),
                )
                .await
                .unwrap();
        }

        for i in 0..5u8 {
            let msg = rx.recv().await.unwrap();
            assert_eq!(msg.packet.payload.as_ref(), &[i]);
        }
    }

    #[tokio::test]
    async fn test_builder_options() {
        let transport = UdpTransportBuilder::new("127.0.0.1:0".parse().unwrap())
            .recv_buffer_size(1 << 18)
            .send_buffer_size(1 << 18)
            .build()
            .await
            .unwrap();

        assert!(transport.local_addr().port() > 0);
    }
}
