//! Relay rendezvous server.

use crate::nat::Endpoint;
use crate::relay::protocol::RelayMessage;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    /// Registrations without a refresh for this long are evicted
    pub registration_grace: Duration,
    /// Cadence of the eviction sweep
    pub eviction_interval: Duration,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            registration_grace: Duration::from_secs(60),
            eviction_interval: Duration::from_secs(10),
        }
    }
}

/// Relay server statistics snapshot
#[derive(Debug, Clone, Default)]
pub struct RelayServerStats {
    /// Announcements accepted
    pub announces: u64,
    /// Lookups answered
    pub lookups: u64,
    /// Registrations evicted for missing their refresh window
    pub evictions: u64,
    /// Currently registered nodes
    pub registered_nodes: usize,
}

#[derive(Debug, Clone)]
struct Registration {
    endpoint: Endpoint,
    last_refresh: Instant,
}

struct ServerInner {
    config: RelayServerConfig,
    registrations: DashMap<[u8; 32], Registration>,
    running: AtomicBool,
    announces: AtomicU64,
    lookups: AtomicU64,
    evictions: AtomicU64,
}

/// A rendezvous server tracking node-id → endpoint registrations.
pub struct RelayServer {
    inner: Arc<ServerInner>,
    bind_host: String,
    bind_port: u16,
    endpoint: Mutex<Option<SocketAddr>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RelayServer {
    /// Create a server that will bind `host:port`.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self::with_config(host, port, RelayServerConfig::default())
    }

    /// Create with explicit grace and sweep settings.
    #[must_use]
    pub fn with_config(host: impl Into<String>, port: u16, config: RelayServerConfig) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                config,
                registrations: DashMap::new(),
                running: AtomicBool::new(false),
                announces: AtomicU64::new(0),
                lookups: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
            }),
            bind_host: host.into(),
            bind_port: port,
            endpoint: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Bind and start serving.
    ///
    /// # Errors
    ///
    /// Returns socket bind errors.
    pub async fn start(&self) -> std::io::Result<SocketAddr> {
        let socket = Arc::new(
            UdpSocket::bind(format!("{}:{}", self.bind_host, self.bind_port)).await?,
        );
        let local_addr = socket.local_addr()?;
        *self.endpoint.lock().await = Some(local_addr);
        self.inner.running.store(true, Ordering::Relaxed);

        let inner = Arc::clone(&self.inner);
        let recv_socket = Arc::clone(&socket);
        let recv_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                if !inner.running.load(Ordering::Relaxed) {
                    break;
                }
                match recv_socket.recv_from(&mut buf).await {
                    Ok((len, addr)) => {
                        if let Some(reply) = inner.handle(&buf[..len], addr) {
                            match reply.to_bytes() {
                                Ok(bytes) => {
                                    if let Err(e) = recv_socket.send_to(&bytes, addr).await {
                                        tracing::debug!(error = %e, "relay reply send failed");
                                    }
                                }
                                Err(e) => tracing::warn!(error = %e, "relay reply encode failed"),
                            }
                        }
                    }
                    Err(e) => {
                        if inner.running.load(Ordering::Relaxed) {
                            tracing::warn!(error = %e, "relay receive error");
                        }
                        break;
                    }
                }
            }
        });

        let sweeper = Arc::clone(&self.inner);
        let sweep_task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(sweeper.config.eviction_interval).await;
                if !sweeper.running.load(Ordering::Relaxed) {
                    break;
                }
                sweeper.evict_expired();
            }
        });

        let mut tasks = self.tasks.lock().await;
        tasks.push(recv_task);
        tasks.push(sweep_task);

        tracing::info!(%local_addr, "relay server started");
        Ok(local_addr)
    }

    /// Stop serving.
    pub async fn stop(&self) {
        self.inner.running.store(false, Ordering::Relaxed);
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        *self.endpoint.lock().await = None;
        tracing::info!("relay server stopped");
    }

    /// The bound address, once started.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.endpoint.lock().await
    }

    /// Whether a node is currently registered.
    #[must_use]
    pub fn is_registered(&self, node_id: &[u8; 32]) -> bool {
        self.inner.registrations.contains_key(node_id)
    }

    /// Statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> RelayServerStats {
        RelayServerStats {
            announces: self.inner.announces.load(Ordering::Relaxed),
            lookups: self.inner.lookups.load(Ordering::Relaxed),
            evictions: self.inner.evictions.load(Ordering::Relaxed),
            registered_nodes: self.inner.registrations.len(),
        }
    }
}

impl ServerInner {
    fn handle(&self, data: &[u8], from: SocketAddr) -> Option<RelayMessage> {
        let message = match RelayMessage::from_bytes(data) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(%from, error = %e, "dropping malformed relay message");
                return None;
            }
        };

        match message {
            RelayMessage::Announce {
                node_id,
                host,
                port,
            } => {
                self.registrations.insert(
                    node_id,
                    Registration {
                        endpoint: Endpoint::new(host, port),
                        last_refresh: Instant::now(),
                    },
                );
                self.announces.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(node = %hex::encode(&node_id[..8]), "registered node");
                Some(RelayMessage::AnnounceAck {
                    success: true,
                    error: None,
                })
            }
            RelayMessage::Refresh { node_id } => {
                if let Some(mut reg) = self.registrations.get_mut(&node_id) {
                    reg.last_refresh = Instant::now();
                }
                None
            }
            RelayMessage::Unannounce { node_id } => {
                self.registrations.remove(&node_id);
                tracing::debug!(node = %hex::encode(&node_id[..8]), "unregistered node");
                None
            }
            RelayMessage::Lookup { node_id } => {
                self.lookups.fetch_add(1, Ordering::Relaxed);
                let endpoint = self
                    .registrations
                    .get(&node_id)
                    .map(|reg| reg.endpoint.clone());
                Some(RelayMessage::LookupReply { endpoint })
            }
            RelayMessage::AnnounceAck { .. } | RelayMessage::LookupReply { .. } => None,
        }
    }

    fn evict_expired(&self) {
        let grace = self.config.registration_grace;
        let before = self.registrations.len();
        self.registrations
            .retain(|_, reg| reg.last_refresh.elapsed() < grace);
        let evicted = before - self.registrations.len();
        if evicted > 0 {
            self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
            tracing::info!(evicted, "evicted expired registrations");
        }
    }
}
