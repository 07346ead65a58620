//! Async UDP transport with local-network peer discovery.
//!
//! The transport binds one socket for protocol traffic and hands every
//! received datagram to a registered handler. A small discovery
//! sidechannel shares the socket: datagrams whose first byte is a
//! discovery opcode are consumed here and never reach the application
//! dispatcher (protocol frames always start with the `S` magic byte, which
//! is outside the opcode range).

use crate::transport::{Transport, TransportError, TransportResult, TransportStats};
use async_trait::async_trait;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Safe UDP payload size for IPv4 (1500 − 20 IP − 8 UDP)
pub const SAFE_MTU: usize = 1472;

/// UDP port used for LAN discovery broadcasts
pub const DISCOVERY_PORT: u16 = 9337;

/// Receive buffer size requested from the kernel
const SOCKET_BUFFER_SIZE: usize = 2 * 1024 * 1024;

/// Discovery announcement length: opcode(1) + node_id(32) + port(2)
const ANNOUNCE_LEN: usize = 35;

/// Discovery message opcodes (byte 0 of a discovery datagram)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DiscoveryOpcode {
    /// Node announcing its presence: `node_id(32) || port(2)`
    Announce = 0x01,
    /// Request for peer announcements (no body)
    Request = 0x02,
    /// Response to a request: `node_id(32) || port(2)`
    Response = 0x03,
}

impl DiscoveryOpcode {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Announce),
            0x02 => Some(Self::Request),
            0x03 => Some(Self::Response),
            _ => None,
        }
    }
}

/// Handler invoked with every non-discovery datagram
pub type RawHandler = Arc<dyn Fn(Vec<u8>, SocketAddr) + Send + Sync>;

/// Callback invoked when a peer announces itself: `(ip, port, node_id)`
pub type PeerDiscoveredCallback = Arc<dyn Fn(IpAddr, u16, [u8; 32]) + Send + Sync>;

struct DiscoveryState {
    enabled: AtomicBool,
    node_id: Mutex<Option<[u8; 32]>>,
    on_peer: Mutex<Option<PeerDiscoveredCallback>>,
    seen: Mutex<HashSet<(IpAddr, u16)>>,
}

/// Async UDP transport for STT frames.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    closed: Arc<AtomicBool>,
    started_at: Instant,

    bytes_sent: Arc<AtomicU64>,
    bytes_received: Arc<AtomicU64>,
    packets_sent: Arc<AtomicU64>,
    packets_received: Arc<AtomicU64>,
    send_errors: Arc<AtomicU64>,
    recv_errors: Arc<AtomicU64>,
    packets_dropped: Arc<AtomicU64>,

    discovery: Arc<DiscoveryState>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
    announce_task: Mutex<Option<JoinHandle<()>>>,
}

impl UdpTransport {
    /// Bind a transport to `addr`.
    ///
    /// The socket is created through `socket2` so buffer sizes and the
    /// broadcast flag can be set before binding.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::BindFailed` on any socket setup failure.
    pub async fn bind(addr: SocketAddr) -> TransportResult<Self> {
        let domain = if addr.is_ipv4() {
            socket2::Domain::IPV4
        } else {
            socket2::Domain::IPV6
        };
        let raw = socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        raw.set_recv_buffer_size(SOCKET_BUFFER_SIZE)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        raw.set_send_buffer_size(SOCKET_BUFFER_SIZE)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        if addr.is_ipv4() {
            raw.set_broadcast(true)
                .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        }
        raw.bind(&addr.into())
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        raw.set_nonblocking(true)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;

        let std_socket: std::net::UdpSocket = raw.into();
        let socket = UdpSocket::from_std(std_socket)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;

        tracing::info!(%local_addr, "UDP transport started");

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            closed: Arc::new(AtomicBool::new(false)),
            started_at: Instant::now(),
            bytes_sent: Arc::new(AtomicU64::new(0)),
            bytes_received: Arc::new(AtomicU64::new(0)),
            packets_sent: Arc::new(AtomicU64::new(0)),
            packets_received: Arc::new(AtomicU64::new(0)),
            send_errors: Arc::new(AtomicU64::new(0)),
            recv_errors: Arc::new(AtomicU64::new(0)),
            packets_dropped: Arc::new(AtomicU64::new(0)),
            discovery: Arc::new(DiscoveryState {
                enabled: AtomicBool::new(false),
                node_id: Mutex::new(None),
                on_peer: Mutex::new(None),
                seen: Mutex::new(HashSet::new()),
            }),
            recv_task: Mutex::new(None),
            announce_task: Mutex::new(None),
        })
    }

    /// Spawn the receive loop, dispatching non-discovery datagrams to
    /// `handler`.
    ///
    /// Calling this a second time replaces the previous loop.
    pub async fn start_dispatch(&self, handler: RawHandler) {
        let socket = Arc::clone(&self.socket);
        let closed = Arc::clone(&self.closed);
        let bytes_received = Arc::clone(&self.bytes_received);
        let packets_received = Arc::clone(&self.packets_received);
        let recv_errors = Arc::clone(&self.recv_errors);
        let packets_dropped = Arc::clone(&self.packets_dropped);
        let discovery = Arc::clone(&self.discovery);
        let local_port = self.local_addr.port();

        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                if closed.load(Ordering::Relaxed) {
                    break;
                }
                match socket.recv_from(&mut buf).await {
                    Ok((len, addr)) => {
                        bytes_received.fetch_add(len as u64, Ordering::Relaxed);
                        packets_received.fetch_add(1, Ordering::Relaxed);
                        let data = &buf[..len];
                        if Self::handle_discovery(
                            &discovery,
                            &socket,
                            local_port,
                            data,
                            addr,
                            &packets_dropped,
                        )
                        .await
                        {
                            continue;
                        }
                        handler(data.to_vec(), addr);
                    }
                    Err(e) => {
                        if closed.load(Ordering::Relaxed) {
                            break;
                        }
                        recv_errors.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(error = %e, "UDP receive error");
                    }
                }
            }
        });
        *self.recv_task.lock().await = Some(task);
    }

    /// Returns true when the datagram was consumed by the discovery layer.
    async fn handle_discovery(
        state: &DiscoveryState,
        socket: &UdpSocket,
        local_port: u16,
        data: &[u8],
        addr: SocketAddr,
        packets_dropped: &AtomicU64,
    ) -> bool {
        let Some(opcode) = data.first().copied().and_then(DiscoveryOpcode::from_u8) else {
            return false;
        };

        match opcode {
            DiscoveryOpcode::Announce | DiscoveryOpcode::Response => {
                if data.len() < ANNOUNCE_LEN {
                    packets_dropped.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
                let mut node_id = [0u8; 32];
                node_id.copy_from_slice(&data[1..33]);
                let port = u16::from_be_bytes([data[33], data[34]]);

                let fresh = state.seen.lock().await.insert((addr.ip(), port));
                if fresh {
                    tracing::info!(
                        ip = %addr.ip(),
                        port,
                        node = %hex::encode(&node_id[..8]),
                        "discovered peer"
                    );
                    if let Some(callback) = state.on_peer.lock().await.as_ref() {
                        callback(addr.ip(), port, node_id);
                    }
                }
                packets_dropped.fetch_add(1, Ordering::Relaxed);
                true
            }
            DiscoveryOpcode::Request => {
                if state.enabled.load(Ordering::Relaxed) {
                    if let Some(node_id) = *state.node_id.lock().await {
                        let mut msg = Vec::with_capacity(ANNOUNCE_LEN);
                        msg.push(DiscoveryOpcode::Response as u8);
                        msg.extend_from_slice(&node_id);
                        msg.extend_from_slice(&local_port.to_be_bytes());
                        if let Err(e) = socket.send_to(&msg, addr).await {
                            tracing::debug!(error = %e, "discovery response failed");
                        }
                    }
                }
                packets_dropped.fetch_add(1, Ordering::Relaxed);
                true
            }
        }
    }

    /// Enable periodic LAN announcements and peer-discovery callbacks.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Down` if the transport is stopped.
    pub async fn enable_discovery(
        &self,
        node_id: [u8; 32],
        announce_interval: Duration,
        on_peer_discovered: Option<PeerDiscoveredCallback>,
    ) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::Down);
        }
        *self.discovery.node_id.lock().await = Some(node_id);
        *self.discovery.on_peer.lock().await = on_peer_discovered;
        self.discovery.enabled.store(true, Ordering::Relaxed);

        let socket = Arc::clone(&self.socket);
        let closed = Arc::clone(&self.closed);
        let enabled = Arc::clone(&self.discovery);
        let port = self.local_addr.port();
        let task = tokio::spawn(async move {
            loop {
                if closed.load(Ordering::Relaxed) || !enabled.enabled.load(Ordering::Relaxed) {
                    break;
                }
                let mut msg = Vec::with_capacity(ANNOUNCE_LEN);
                msg.push(DiscoveryOpcode::Announce as u8);
                if let Some(id) = *enabled.node_id.lock().await {
                    msg.extend_from_slice(&id);
                } else {
                    break;
                }
                msg.extend_from_slice(&port.to_be_bytes());
                let broadcast: SocketAddr =
                    (std::net::Ipv4Addr::BROADCAST, DISCOVERY_PORT).into();
                if let Err(e) = socket.send_to(&msg, broadcast).await {
                    tracing::debug!(error = %e, "discovery broadcast failed");
                }
                tokio::time::sleep(announce_interval).await;
            }
        });
        *self.announce_task.lock().await = Some(task);
        tracing::info!("peer discovery enabled");
        Ok(())
    }

    /// Disable discovery and stop the announce loop.
    pub async fn disable_discovery(&self) {
        self.discovery.enabled.store(false, Ordering::Relaxed);
        if let Some(task) = self.announce_task.lock().await.take() {
            task.abort();
        }
        tracing::info!("peer discovery disabled");
    }

    /// Send pre-encoded frame bytes, warning when the datagram exceeds the
    /// safe MTU (it is still sent; the network may fragment it).
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Down` after stop, or an I/O error.
    pub async fn send_frame(&self, frame_bytes: &[u8], addr: SocketAddr) -> TransportResult<usize> {
        if frame_bytes.len() > SAFE_MTU {
            tracing::warn!(
                size = frame_bytes.len(),
                max = SAFE_MTU,
                "frame exceeds safe MTU, may fragment"
            );
        }
        self.send_to(frame_bytes, addr).await
    }

    /// Stop the transport: receive loop, announce loop, and socket use all
    /// cease.
    pub async fn stop(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.disable_discovery().await;
        if let Some(task) = self.recv_task.lock().await.take() {
            task.abort();
        }
        tracing::info!("UDP transport stopped");
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Down);
        }
        match self.socket.send_to(buf, addr).await {
            Ok(sent) => {
                self.bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);
                self.packets_sent.fetch_add(1, Ordering::Relaxed);
                Ok(sent)
            }
            Err(e) => {
                self.send_errors.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::Io(e))
            }
        }
    }

    async fn recv_from(&self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Down);
        }
        match self.socket.recv_from(buf).await {
            Ok((size, addr)) => {
                self.bytes_received.fetch_add(size as u64, Ordering::Relaxed);
                self.packets_received.fetch_add(1, Ordering::Relaxed);
                Ok((size, addr))
            }
            Err(e) => {
                self.recv_errors.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::Io(e))
            }
        }
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.local_addr)
    }

    async fn close(&self) -> TransportResult<()> {
        self.stop().await;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            recv_errors: self.recv_errors.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            uptime: Some(self.started_at.elapsed()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    async fn bound() -> UdpTransport {
        UdpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_bind_assigns_port() {
        let transport = bound().await;
        let addr = transport.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_send_recv() {
        let server = bound().await;
        let client = bound().await;
        let server_addr = server.local_addr().unwrap();

        client.send_to(b"hello transport", server_addr).await.unwrap();

        let mut buf = vec![0u8; 1500];
        let (len, from) = timeout(Duration::from_secs(1), server.recv_from(&mut buf))
            .await
            .expect("timeout")
            .unwrap();
        assert_eq!(&buf[..len], b"hello transport");
        assert_eq!(from, client.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_dispatch_delivers_frames() {
        let server = bound().await;
        let client = bound().await;
        let server_addr = server.local_addr().unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        server
            .start_dispatch(Arc::new(move |data, addr| {
                let _ = tx.send((data, addr));
            }))
            .await;

        // Starts with 'S': an application frame, not discovery.
        client.send_to(b"ST-frame-bytes", server_addr).await.unwrap();

        let (data, from) = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timeout")
            .unwrap();
        assert_eq!(data, b"ST-frame-bytes");
        assert_eq!(from, client.local_addr().unwrap());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_discovery_announce_invokes_callback() {
        let server = bound().await;
        let client = bound().await;
        let server_addr = server.local_addr().unwrap();

        let discovered: Arc<StdMutex<Vec<(IpAddr, u16, [u8; 32])>>> =
            Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&discovered);
        server
            .start_dispatch(Arc::new(|_, _| panic!("discovery must not reach the app")))
            .await;
        server
            .enable_discovery(
                [1u8; 32],
                Duration::from_secs(3600),
                Some(Arc::new(move |ip, port, node_id| {
                    sink.lock().unwrap().push((ip, port, node_id));
                })),
            )
            .await
            .unwrap();

        let mut announce = vec![DiscoveryOpcode::Announce as u8];
        announce.extend_from_slice(&[7u8; 32]);
        announce.extend_from_slice(&4242u16.to_be_bytes());
        client.send_to(&announce, server_addr).await.unwrap();

        timeout(Duration::from_secs(1), async {
            loop {
                if !discovered.lock().unwrap().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("callback never fired");

        let seen = discovered.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].1, 4242);
        assert_eq!(seen[0].2, [7u8; 32]);
        drop(seen);

        assert!(server.stats().packets_dropped >= 1);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_discovery_request_answered() {
        let server = bound().await;
        let client = bound().await;
        let server_addr = server.local_addr().unwrap();

        server.start_dispatch(Arc::new(|_, _| {})).await;
        server
            .enable_discovery([9u8; 32], Duration::from_secs(3600), None)
            .await
            .unwrap();

        client
            .send_to(&[DiscoveryOpcode::Request as u8], server_addr)
            .await
            .unwrap();

        let mut buf = vec![0u8; 64];
        let (len, _) = timeout(Duration::from_secs(1), client.recv_from(&mut buf))
            .await
            .expect("no discovery response")
            .unwrap();
        assert_eq!(len, 35);
        assert_eq!(buf[0], DiscoveryOpcode::Response as u8);
        assert_eq!(&buf[1..33], &[9u8; 32]);
        assert_eq!(
            u16::from_be_bytes([buf[33], buf[34]]),
            server_addr.port()
        );
        server.stop().await;
    }

    #[tokio::test]
    async fn test_malformed_discovery_counted_dropped() {
        let server = bound().await;
        let client = bound().await;
        let server_addr = server.local_addr().unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        server
            .start_dispatch(Arc::new(move |data, _| {
                let _ = tx.send(data);
            }))
            .await;

        // Truncated announce: opcode 1 but only 10 bytes.
        client.send_to(&[1u8; 10], server_addr).await.unwrap();
        // A real frame follows so we can synchronise on delivery.
        client.send_to(b"S-marker", server_addr).await.unwrap();

        let delivered = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timeout")
            .unwrap();
        assert_eq!(delivered, b"S-marker");
        assert_eq!(server.stats().packets_dropped, 1);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_stats_track_traffic() {
        let server = bound().await;
        let client = bound().await;
        let server_addr = server.local_addr().unwrap();

        client.send_to(b"1234", server_addr).await.unwrap();
        let stats = client.stats();
        assert_eq!(stats.packets_sent, 1);
        assert_eq!(stats.bytes_sent, 4);
        assert!(stats.uptime.is_some());
    }

    #[tokio::test]
    async fn test_operations_fail_after_stop() {
        let transport = bound().await;
        transport.stop().await;
        assert!(transport.is_closed());
        let result = transport
            .send_to(b"x", "127.0.0.1:9".parse().unwrap())
            .await;
        assert!(matches!(result, Err(TransportError::Down)));

        let mut buf = vec![0u8; 16];
        assert!(matches!(
            transport.recv_from(&mut buf).await,
            Err(TransportError::Down)
        ));
    }

    #[tokio::test]
    async fn test_send_frame_over_mtu_still_sends() {
        let server = bound().await;
        let client = bound().await;
        let server_addr = server.local_addr().unwrap();

        let big = vec![0x53u8; SAFE_MTU + 100];
        let sent = client.send_frame(&big, server_addr).await.unwrap();
        assert_eq!(sent, big.len());
    }
}
