//! Relay-backed NAT coordination.
//!
//! The coordinator registers the local endpoint with a relay server and
//! resolves peers in preference order: peers pinned to relayed routing go
//! straight to the relay endpoint; memoised direct endpoints are reused;
//! an explicit hint is tried optimistically; otherwise the relay is asked
//! for the peer's last-known endpoint, falling back to the relay itself
//! as the forwarding path.

use crate::nat::{Endpoint, NatCoordinator, NatError};
use crate::relay::protocol::RelayMessage;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// How long to wait for a relay answer
const RELAY_RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Cadence of registration refreshes
const REFRESH_INTERVAL: Duration = Duration::from_secs(15);

/// Coordinator statistics snapshot
#[derive(Debug, Clone)]
pub struct RelayCoordinatorStats {
    /// Strategy name, for diagnostics
    pub strategy: &'static str,
    /// The relay endpoint in use
    pub relay_endpoint: Endpoint,
    /// Whether direct dialling is attempted before relaying
    pub fallback_to_direct: bool,
    /// Resolutions that produced a direct endpoint
    pub direct_attempts: u64,
    /// Resolutions that produced the relay endpoint
    pub relay_attempts: u64,
    /// All resolutions
    pub total_attempts: u64,
    /// Peers pinned to relayed routing
    pub relayed_peers: usize,
    /// Peers with a memoised direct endpoint
    pub direct_peers: usize,
    /// Confirmed direct connections ÷ direct attempts, percent
    pub direct_success_rate: f64,
}

/// NAT coordination through a relay rendezvous server.
pub struct RelayNatCoordinator {
    node_id: [u8; 32],
    relay: Endpoint,
    fallback_to_direct: bool,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    local: Mutex<Option<Endpoint>>,
    direct_peers: DashMap<[u8; 32], Endpoint>,
    relayed_peers: DashSet<[u8; 32]>,
    direct_attempts: AtomicU64,
    relay_attempts: AtomicU64,
    direct_successes: AtomicU64,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl RelayNatCoordinator {
    /// Create a coordinator pointed at a relay server.
    #[must_use]
    pub fn new(
        node_id: [u8; 32],
        relay_host: impl Into<String>,
        relay_port: u16,
        fallback_to_direct: bool,
    ) -> Self {
        Self {
            node_id,
            relay: Endpoint::new(relay_host, relay_port),
            fallback_to_direct,
            socket: Mutex::new(None),
            local: Mutex::new(None),
            direct_peers: DashMap::new(),
            relayed_peers: DashSet::new(),
            direct_attempts: AtomicU64::new(0),
            relay_attempts: AtomicU64::new(0),
            direct_successes: AtomicU64::new(0),
            refresh_task: Mutex::new(None),
        }
    }

    /// Pin a peer to relayed routing (a direct dial failed).
    pub fn mark_relay_required(&self, peer: [u8; 32]) {
        self.direct_peers.remove(&peer);
        self.relayed_peers.insert(peer);
        tracing::debug!(peer = %hex::encode(&peer[..8]), "peer pinned to relay");
    }

    /// Memoise a confirmed direct endpoint for a peer.
    pub fn mark_direct_success(&self, peer: [u8; 32], endpoint: Endpoint) {
        self.relayed_peers.remove(&peer);
        self.direct_peers.insert(peer, endpoint);
        self.direct_successes.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(peer = %hex::encode(&peer[..8]), "direct route confirmed");
    }

    /// Statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> RelayCoordinatorStats {
        let direct = self.direct_attempts.load(Ordering::Relaxed);
        let relayed = self.relay_attempts.load(Ordering::Relaxed);
        let successes = self.direct_successes.load(Ordering::Relaxed);
        let rate = if direct > 0 {
            (successes as f64 / direct as f64) * 100.0
        } else {
            0.0
        };
        RelayCoordinatorStats {
            strategy: "relay",
            relay_endpoint: self.relay.clone(),
            fallback_to_direct: self.fallback_to_direct,
            direct_attempts: direct,
            relay_attempts: relayed,
            total_attempts: direct + relayed,
            relayed_peers: self.relayed_peers.len(),
            direct_peers: self.direct_peers.len(),
            direct_success_rate: rate,
        }
    }

    /// One request/response exchange with the relay.
    async fn relay_exchange(&self, message: &RelayMessage) -> Result<RelayMessage, NatError> {
        let socket = self.socket().await?;
        socket
            .send_to(
                &message.to_bytes()?,
                (self.relay.host.as_str(), self.relay.port),
            )
            .await?;

        let mut buf = vec![0u8; 4096];
        let (len, _) = tokio::time::timeout(RELAY_RPC_TIMEOUT, socket.recv_from(&mut buf))
            .await
            .map_err(|_| NatError::Timeout)??;
        RelayMessage::from_bytes(&buf[..len])
    }

    /// Fire-and-forget message to the relay.
    async fn relay_send(&self, message: &RelayMessage) -> Result<(), NatError> {
        let socket = self.socket().await?;
        socket
            .send_to(
                &message.to_bytes()?,
                (self.relay.host.as_str(), self.relay.port),
            )
            .await?;
        Ok(())
    }

    async fn socket(&self) -> Result<Arc<UdpSocket>, NatError> {
        let mut guard = self.socket.lock().await;
        if let Some(socket) = guard.as_ref() {
            return Ok(Arc::clone(socket));
        }
        let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
        *guard = Some(Arc::clone(&socket));
        Ok(socket)
    }
}

#[async_trait]
impl NatCoordinator for RelayNatCoordinator {
    async fn register_local(&self, host: &str, port: u16) -> Result<(), NatError> {
        let reply = self
            .relay_exchange(&RelayMessage::Announce {
                node_id: self.node_id,
                host: host.to_owned(),
                port,
            })
            .await?;

        match reply {
            RelayMessage::AnnounceAck { success: true, .. } => {
                *self.local.lock().await = Some(Endpoint::new(host, port));

                // Keep the registration alive until unregister.
                let node_id = self.node_id;
                let relay = self.relay.clone();
                let socket = self.socket().await?;
                let task = tokio::spawn(async move {
                    loop {
                        tokio::time::sleep(REFRESH_INTERVAL).await;
                        let Ok(bytes) = (RelayMessage::Refresh { node_id }).to_bytes() else {
                            break;
                        };
                        if socket
                            .send_to(&bytes, (relay.host.as_str(), relay.port))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                });
                if let Some(old) = self.refresh_task.lock().await.replace(task) {
                    old.abort();
                }
                tracing::info!(relay = %self.relay, "registered with relay");
                Ok(())
            }
            RelayMessage::AnnounceAck {
                success: false,
                error,
            } => Err(NatError::RegistrationFailed(
                error.unwrap_or_else(|| "relay refused registration".into()),
            )),
            other => Err(NatError::Protocol(format!(
                "unexpected relay reply: {other:?}"
            ))),
        }
    }

    async fn resolve(
        &self,
        peer: &[u8; 32],
        hint: Option<Endpoint>,
    ) -> Result<Endpoint, NatError> {
        // Pinned peers route through the relay unconditionally.
        if self.relayed_peers.contains(peer) {
            self.relay_attempts.fetch_add(1, Ordering::Relaxed);
            return Ok(self.relay.clone());
        }

        if self.fallback_to_direct {
            if let Some(memoised) = self.direct_peers.get(peer) {
                self.direct_attempts.fetch_add(1, Ordering::Relaxed);
                return Ok(memoised.clone());
            }
            if let Some(hint) = hint {
                self.direct_attempts.fetch_add(1, Ordering::Relaxed);
                return Ok(hint);
            }
        }

        match self
            .relay_exchange(&RelayMessage::Lookup { node_id: *peer })
            .await
        {
            Ok(RelayMessage::LookupReply {
                endpoint: Some(endpoint),
            }) if self.fallback_to_direct => {
                self.direct_attempts.fetch_add(1, Ordering::Relaxed);
                Ok(endpoint)
            }
            Ok(RelayMessage::LookupReply { .. }) => {
                // Unknown to the relay (or direct dialling disabled):
                // route through the relay itself.
                self.relay_attempts.fetch_add(1, Ordering::Relaxed);
                Ok(self.relay.clone())
            }
            Ok(other) => Err(NatError::Protocol(format!(
                "unexpected relay reply: {other:?}"
            ))),
            Err(NatError::Timeout) => Err(NatError::Timeout),
            Err(e) => Err(e),
        }
    }

    async fn unregister(&self) -> Result<(), NatError> {
        if let Some(task) = self.refresh_task.lock().await.take() {
            task.abort();
        }
        self.relay_send(&RelayMessage::Unannounce {
            node_id: self.node_id,
        })
        .await?;
        *self.local.lock().await = None;
        tracing::info!(relay = %self.relay, "unregistered from relay");
        Ok(())
    }
}
