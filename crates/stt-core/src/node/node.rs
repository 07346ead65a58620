//! The STT node: transport, handshake, and session wiring.

use crate::chamber::{Chamber, SessionRecord};
use crate::error::{HandshakeError, NodeError, SessionError};
use crate::frame::{Frame, FrameType, now_millis};
use crate::handshake::HandshakeManager;
use crate::node::config::NodeConfig;
use crate::node::session_manager::SessionManager;
use crate::session::Session;
use crate::{NodeId, SessionId};
use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use stt_crypto::{AdContext, CryptoProvider, SeedCrypto};
use stt_transport::{PeerDiscoveredCallback, Transport, TransportStats, UdpTransport};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;

/// Consecutive decrypt failures that close a session.
const MAX_DECRYPT_FAILURES: u64 = 8;

/// Housekeeping cadence (handshake GC, idle-session sweep).
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(2);

/// A decrypted application chunk delivered through the node's receive
/// queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedPacket {
    /// Session the chunk arrived on
    pub session_id: SessionId,
    /// Stream within the session
    pub stream_id: u32,
    /// Chunk bytes, in sender order per stream
    pub data: Vec<u8>,
}

/// Node statistics snapshot
#[derive(Debug, Clone)]
pub struct NodeStats {
    /// Node id, hex-encoded
    pub node_id: String,
    /// Whether the node is running
    pub running: bool,
    /// Active session count
    pub sessions: usize,
    /// Pending handshake count
    pub pending_handshakes: usize,
    /// Transport counters, when started
    pub transport: Option<TransportStats>,
}

struct NodeInner {
    config: NodeConfig,
    node_crypto: Arc<dyn CryptoProvider>,
    node_id: NodeId,
    chamber: std::sync::Mutex<Option<Chamber>>,
    transport: Mutex<Option<Arc<UdpTransport>>>,
    sessions: SessionManager,
    handshakes: Mutex<HandshakeManager>,
    pending_connects: Mutex<HashMap<SocketAddr, oneshot::Sender<SessionId>>>,
    recv_tx: std::sync::Mutex<Option<mpsc::Sender<ReceivedPacket>>>,
    recv_rx: Mutex<mpsc::Receiver<ReceivedPacket>>,
    running: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// An STT node: binds a UDP endpoint, answers handshakes, and multiplexes
/// encrypted streams over authenticated sessions.
pub struct SttNode {
    inner: Arc<NodeInner>,
}

impl SttNode {
    /// Create a node from its seed and the network's shared seed.
    ///
    /// The node id is derived from the node seed; the shared seed roots
    /// handshake authentication and is never transmitted.
    #[must_use]
    pub fn new(node_seed: &[u8], shared_seed: &[u8], config: NodeConfig) -> Self {
        let node_crypto: Arc<dyn CryptoProvider> = Arc::new(SeedCrypto::new(node_seed));
        let shared_crypto: Arc<dyn CryptoProvider> = Arc::new(SeedCrypto::new(shared_seed));
        let node_id = node_crypto.hash(b"stt_node_identity", &AdContext::purpose("node_id"));

        let (recv_tx, recv_rx) = mpsc::channel(config.recv_queue_capacity);
        let handshakes = HandshakeManager::new(Arc::clone(&shared_crypto), node_id);

        Self {
            inner: Arc::new(NodeInner {
                config,
                node_crypto,
                node_id,
                chamber: std::sync::Mutex::new(None),
                transport: Mutex::new(None),
                sessions: SessionManager::new(),
                handshakes: Mutex::new(handshakes),
                pending_connects: Mutex::new(HashMap::new()),
                recv_tx: std::sync::Mutex::new(Some(recv_tx)),
                recv_rx: Mutex::new(recv_rx),
                running: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// This node's identifier.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.inner.node_id
    }

    /// Whether the node is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Relaxed)
    }

    /// The bound address, once started.
    pub async fn local_addr(&self) -> Result<SocketAddr, NodeError> {
        let transport = self.transport().await?;
        Ok(transport.local_addr()?)
    }

    /// Start the node: open the chamber (if configured), bind the UDP
    /// transport, and begin dispatching inbound frames.
    ///
    /// # Errors
    ///
    /// Returns transport bind errors or chamber I/O errors.
    pub async fn start(&self) -> Result<SocketAddr, NodeError> {
        if self.is_running() {
            if let Ok(addr) = self.local_addr().await {
                tracing::warn!("node already running");
                return Ok(addr);
            }
        }

        if let Some(path) = &self.inner.config.chamber_path {
            let chamber = Chamber::open(
                path.clone(),
                self.inner.node_id,
                Arc::clone(&self.inner.node_crypto),
            )?;
            *self.inner.chamber.lock().expect("chamber lock poisoned") = Some(chamber);
        }

        let bind_addr: SocketAddr =
            format!("{}:{}", self.inner.config.host, self.inner.config.port)
                .parse()
                .map_err(|e| {
                    NodeError::Transport(stt_transport::TransportError::InvalidConfig(format!(
                        "bind address: {e}"
                    )))
                })?;
        let transport = Arc::new(UdpTransport::bind(bind_addr).await?);
        let local_addr = transport.local_addr()?;

        let dispatcher = Arc::clone(&self.inner);
        transport
            .start_dispatch(Arc::new(move |data, addr| {
                let inner = Arc::clone(&dispatcher);
                tokio::spawn(async move {
                    inner.dispatch(data, addr).await;
                });
            }))
            .await;

        if self.inner.config.enable_discovery {
            transport
                .enable_discovery(
                    self.inner.node_id,
                    self.inner.config.discovery_interval,
                    None,
                )
                .await?;
        }

        *self.inner.transport.lock().await = Some(transport);
        self.inner.running.store(true, Ordering::Relaxed);

        let housekeeper = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(HOUSEKEEPING_INTERVAL).await;
                if !housekeeper.running.load(Ordering::Relaxed) {
                    break;
                }
                housekeeper.housekeeping().await;
            }
        });
        self.inner.tasks.lock().await.push(task);

        tracing::info!(
            node = %hex::encode(&self.inner.node_id[..8]),
            %local_addr,
            "STT node started"
        );
        Ok(local_addr)
    }

    /// Stop the node: cancel background tasks, close all sessions (waking
    /// stream receivers), and shut the transport down.
    pub async fn stop(&self) {
        if !self.is_running() {
            return;
        }
        self.inner.running.store(false, Ordering::Relaxed);

        for task in self.inner.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.inner.sessions.close_all().await;
        self.inner.pending_connects.lock().await.clear();
        if let Some(transport) = self.inner.transport.lock().await.take() {
            transport.stop().await;
        }
        // Dropping the sender closes the receive queue, so `recv` returns
        // `None` to consumers.
        self.inner
            .recv_tx
            .lock()
            .expect("recv_tx lock poisoned")
            .take();
        tracing::info!("STT node stopped");
    }

    /// Enable LAN discovery with a peer callback after start.
    ///
    /// # Errors
    ///
    /// Returns `NodeError::NotStarted` before `start`.
    pub async fn enable_discovery(
        &self,
        on_peer_discovered: Option<PeerDiscoveredCallback>,
    ) -> Result<(), NodeError> {
        let transport = self.transport().await?;
        transport
            .enable_discovery(
                self.inner.node_id,
                self.inner.config.discovery_interval,
                on_peer_discovered,
            )
            .await?;
        Ok(())
    }

    /// Connect to a peer and drive the initiator side of the handshake.
    ///
    /// Resolves when the session is active on both sides.
    ///
    /// # Errors
    ///
    /// Returns `HandshakeError::Timeout` if the exchange does not complete
    /// within the configured window, or transport errors.
    pub async fn connect(
        &self,
        peer_host: &str,
        peer_port: u16,
    ) -> Result<Arc<Mutex<Session>>, NodeError> {
        let transport = self.transport().await?;
        let addr = resolve(peer_host, peer_port)?;

        let (tx, rx) = oneshot::channel();
        self.inner.pending_connects.lock().await.insert(addr, tx);

        let hello = {
            let mut manager = self.inner.handshakes.lock().await;
            manager.create(addr).initiate()?
        };
        let frame = Frame::new(FrameType::Handshake, [0u8; 8], 0, hello);
        transport.send_frame(&frame.encode()?, addr).await?;

        match tokio::time::timeout(self.inner.config.handshake_timeout, rx).await {
            Ok(Ok(session_id)) => self
                .inner
                .sessions
                .get(&session_id)
                .ok_or_else(|| NodeError::SessionNotFound(hex::encode(session_id))),
            _ => {
                self.inner.pending_connects.lock().await.remove(&addr);
                self.inner.handshakes.lock().await.remove(&addr);
                Err(NodeError::Handshake(HandshakeError::Timeout))
            }
        }
    }

    /// Send `data` on a stream of an established session. Byte sequences
    /// larger than a frame are fragmented into ordered chunks.
    ///
    /// # Errors
    ///
    /// Returns stream flow-control, session-state, or transport errors.
    pub async fn send(
        &self,
        session: &Arc<Mutex<Session>>,
        stream_id: u32,
        data: &[u8],
    ) -> Result<(), NodeError> {
        let transport = self.transport().await?;
        let (frames, peer_addr) = {
            let mut guard = session.lock().await;
            let frames = guard.encode_data_frames(stream_id, data)?;
            (frames, guard.peer_addr())
        };
        let addr = peer_addr.ok_or_else(|| {
            NodeError::Session(SessionError::InvalidState("peer address unknown"))
        })?;
        for bytes in frames {
            transport.send_frame(&bytes, addr).await?;
        }
        Ok(())
    }

    /// Session lookup by id.
    #[must_use]
    pub fn get_session(&self, session_id: &SessionId) -> Option<Arc<Mutex<Session>>> {
        self.inner.sessions.get(session_id)
    }

    /// Session lookup by peer node id.
    #[must_use]
    pub fn get_session_by_peer(&self, peer: &NodeId) -> Option<Arc<Mutex<Session>>> {
        self.inner.sessions.get_by_peer(peer)
    }

    /// Receive the next packet from any session or stream.
    ///
    /// Returns `None` once the node has stopped and the queue is drained.
    pub async fn recv(&self) -> Option<ReceivedPacket> {
        self.inner.recv_rx.lock().await.recv().await
    }

    /// Receive with a deadline.
    ///
    /// # Errors
    ///
    /// Returns `StreamError::Timeout` (wrapped) when the deadline expires.
    pub async fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Option<ReceivedPacket>, NodeError> {
        tokio::time::timeout(timeout, self.recv())
            .await
            .map_err(|_| NodeError::Stream(crate::error::StreamError::Timeout))
    }

    /// Statistics snapshot.
    pub async fn stats(&self) -> NodeStats {
        let transport = self.inner.transport.lock().await.as_ref().map(|t| t.stats());
        NodeStats {
            node_id: hex::encode(self.inner.node_id),
            running: self.is_running(),
            sessions: self.inner.sessions.len(),
            pending_handshakes: self.inner.handshakes.lock().await.len(),
            transport,
        }
    }

    async fn transport(&self) -> Result<Arc<UdpTransport>, NodeError> {
        self.inner
            .transport
            .lock()
            .await
            .as_ref()
            .map(Arc::clone)
            .ok_or(NodeError::NotStarted)
    }
}

impl NodeInner {
    /// Inbound frame dispatcher: parse, then route by type.
    async fn dispatch(self: Arc<Self>, data: Vec<u8>, addr: SocketAddr) {
        let frame = match Frame::decode(&data) {
            Ok((frame, _)) => frame,
            Err(e) => {
                tracing::debug!(from = %addr, error = %e, "dropping malformed datagram");
                return;
            }
        };
        match frame.frame_type {
            FrameType::Handshake => self.handle_handshake(&frame.payload, addr).await,
            FrameType::Data => self.handle_data(frame, addr).await,
            FrameType::Custom(value) => {
                tracing::warn!(from = %addr, frame_type = value, "unhandled frame type, dropping");
            }
        }
    }

    async fn handle_handshake(&self, payload: &[u8], addr: SocketAddr) {
        let (reply, completed) = {
            let mut manager = self.handshakes.lock().await;
            if !manager.contains(&addr) {
                manager.create(addr);
            }
            let engine = manager
                .get_mut(&addr)
                .expect("engine inserted in the line above");

            match engine.process(payload) {
                Ok(reply) => {
                    let completed = if engine.is_completed() {
                        let material = engine.session_key().ok().and_then(|key| {
                            Some((
                                key,
                                engine.session_id().ok()?,
                                engine.peer_node_id()?,
                                engine.peer_capabilities().to_vec(),
                            ))
                        });
                        manager.remove(&addr);
                        material
                    } else {
                        None
                    };
                    (reply, completed)
                }
                Err(e) => {
                    tracing::warn!(from = %addr, error = %e, "handshake failed");
                    manager.remove(&addr);
                    return;
                }
            }
        };

        // Register the session before any reply leaves, so a data frame
        // the peer fires immediately after completing cannot race the
        // session table.
        let established = if let Some((key, session_id, peer_node_id, capabilities)) = completed {
            let mut session = Session::new(
                session_id,
                self.node_id,
                peer_node_id,
                key.clone(),
                capabilities.clone(),
                self.config.session.clone(),
            );
            session.set_peer_addr(addr);
            session.activate();
            self.sessions.insert(session).await;
            self.persist_session(session_id, peer_node_id, &capabilities, key.as_bytes());
            tracing::info!(
                session = %hex::encode(session_id),
                peer = %hex::encode(&peer_node_id[..8]),
                "session established"
            );
            Some(session_id)
        } else {
            None
        };

        if let Some(reply) = reply {
            let frame = Frame::new(FrameType::Handshake, [0u8; 8], 0, reply);
            if let Err(e) = self.send_raw_frame(&frame, addr).await {
                tracing::warn!(to = %addr, error = %e, "failed to send handshake reply");
                return;
            }
        }

        if let Some(session_id) = established {
            if let Some(waiter) = self.pending_connects.lock().await.remove(&addr) {
                let _ = waiter.send(session_id);
            }
        }
    }

    async fn handle_data(&self, frame: Frame, addr: SocketAddr) {
        let Some(session) = self.sessions.get(&frame.session_id) else {
            tracing::warn!(
                from = %addr,
                session = %hex::encode(frame.session_id),
                "data frame for unknown session, dropping"
            );
            return;
        };

        let result = {
            let mut guard = session.lock().await;
            guard.ingest_data_frame(&frame)
        };

        match result {
            Ok((stream_id, chunks)) => {
                let sender = self
                    .recv_tx
                    .lock()
                    .expect("recv_tx lock poisoned")
                    .clone();
                if let Some(tx) = sender {
                    for data in chunks {
                        let packet = ReceivedPacket {
                            session_id: frame.session_id,
                            stream_id,
                            data,
                        };
                        if tx.try_send(packet).is_err() {
                            tracing::warn!("receive queue full, dropping packet");
                        }
                    }
                }
            }
            Err(SessionError::DecryptFailure) => {
                let failures = session.lock().await.decrypt_failures();
                tracing::debug!(
                    session = %hex::encode(frame.session_id),
                    failures,
                    "frame decrypt failure"
                );
                if failures >= MAX_DECRYPT_FAILURES {
                    tracing::warn!(
                        session = %hex::encode(frame.session_id),
                        "closing session after repeated decrypt failures"
                    );
                    self.sessions.remove(&frame.session_id).await;
                }
            }
            Err(SessionError::FlowControl { needed, available }) => {
                // The chunks stay parked in the stream's reorder buffer;
                // Session::grant_recv_credit releases them.
                tracing::warn!(
                    session = %hex::encode(frame.session_id),
                    needed,
                    available,
                    "receive window exhausted, chunks parked until credit grant"
                );
            }
            Err(e) => {
                tracing::debug!(error = %e, "dropping undeliverable data frame");
            }
        }
    }

    async fn send_raw_frame(
        &self,
        frame: &Frame,
        addr: SocketAddr,
    ) -> Result<(), NodeError> {
        let transport = self
            .transport
            .lock()
            .await
            .as_ref()
            .map(Arc::clone)
            .ok_or(NodeError::NotStarted)?;
        transport.send_frame(&frame.encode()?, addr).await?;
        Ok(())
    }

    async fn housekeeping(&self) {
        let evicted = self.handshakes.lock().await.gc();
        if evicted > 0 {
            tracing::debug!(evicted, "evicted stale handshakes");
        }

        for id in self.sessions.session_ids() {
            if let Some(session) = self.sessions.get(&id) {
                let idle = {
                    let guard = session.lock().await;
                    guard.is_active() && guard.is_idle()
                };
                if idle {
                    tracing::info!(session = %hex::encode(id), "closing idle session");
                    self.sessions.remove(&id).await;
                }
            }
        }
    }

    fn persist_session(
        &self,
        session_id: SessionId,
        peer_node_id: NodeId,
        capabilities: &[String],
        key: &[u8; 32],
    ) {
        let guard = self.chamber.lock().expect("chamber lock poisoned");
        let Some(chamber) = guard.as_ref() else {
            return;
        };
        let id = hex::encode(session_id);
        let record = SessionRecord {
            session_id,
            peer_node_id,
            capabilities: capabilities.to_vec(),
            key_version: 0,
            resumption_token: None,
            created_at_ms: now_millis(),
        };
        if let Err(e) = chamber.put_session(&id, &record) {
            tracing::warn!(error = %e, "failed to persist session record");
        }
        if let Err(e) = chamber.put_key(&id, key) {
            tracing::warn!(error = %e, "failed to persist session key");
        }
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, NodeError> {
    let mut addrs = format!("{host}:{port}")
        .to_socket_addrs()
        .map_err(|e| NodeError::Transport(stt_transport::TransportError::Io(e)))?;
    addrs.next().ok_or_else(|| {
        NodeError::Transport(stt_transport::TransportError::InvalidConfig(format!(
            "no address for {host}:{port}"
        )))
    })
}
