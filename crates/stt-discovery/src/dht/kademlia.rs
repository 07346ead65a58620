//! Kademlia DHT node: RPCs, iterative lookups, and storage.
//!
//! Each RPC is one UDP datagram; responses echo the 8-byte request id and
//! complete the waiting future. Timeouts are not retried here — the
//! iterative loop compensates by querying further contacts. Dead contacts
//! accumulate and are evicted bucket-locally.

use crate::dht::messages::{
    ContactInfo, DhtPayload, FoundValueBody, MessageError, RequestId, StoreBody, decode_datagram,
    encode_datagram,
};
use crate::dht::node_id::NodeId;
use crate::dht::routing::{Contact, RoutingTable};
use crate::dht::{ALPHA, K};
use dashmap::DashMap;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;

/// DHT operation errors
#[derive(Debug, Error)]
pub enum OperationError {
    /// Socket failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The DHT has not been started
    #[error("DHT not started")]
    NotStarted,

    /// The peer did not answer within the RPC timeout
    #[error("RPC timeout")]
    Timeout,

    /// No node returned the requested value
    #[error("value not found")]
    ValueNotFound,

    /// Datagram codec failure
    #[error(transparent)]
    Message(#[from] MessageError),
}

/// DHT tuning parameters
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// Replication parameter
    pub k: usize,
    /// Lookup parallelism
    pub alpha: usize,
    /// Per-RPC timeout
    pub rpc_timeout: Duration,
    /// Upper bound on iterative lookup rounds
    pub max_iterations: usize,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: K,
            alpha: ALPHA,
            rpc_timeout: Duration::from_secs(5),
            max_iterations: 20,
        }
    }
}

/// DHT statistics snapshot
#[derive(Debug, Clone, Default)]
pub struct DhtStats {
    /// RPCs sent
    pub rpcs_sent: u64,
    /// RPCs that timed out
    pub rpcs_timed_out: u64,
    /// Inbound requests handled
    pub requests_handled: u64,
    /// Values held in local storage
    pub values_stored: usize,
    /// Content ids with known providers
    pub provider_records: usize,
    /// Contacts in the routing table
    pub contacts: usize,
}

struct DhtInner {
    node_id: NodeId,
    config: DhtConfig,
    routing: RoutingTable,
    storage: DashMap<NodeId, Vec<u8>>,
    providers: DashMap<NodeId, HashSet<Contact>>,
    pending: DashMap<RequestId, oneshot::Sender<DhtPayload>>,
    endpoint: Mutex<Option<(Arc<UdpSocket>, SocketAddr)>>,
    running: AtomicBool,
    recv_task: Mutex<Option<JoinHandle<()>>>,
    req_counter: AtomicU64,
    rpcs_sent: AtomicU64,
    rpcs_timed_out: AtomicU64,
    requests_handled: AtomicU64,
}

/// A Kademlia DHT node.
pub struct KademliaDht {
    inner: Arc<DhtInner>,
    bind_host: String,
    bind_port: u16,
}

impl KademliaDht {
    /// Create a DHT node that will bind `host:port` (`port` 0 picks a free
    /// one).
    #[must_use]
    pub fn new(node_id: NodeId, host: impl Into<String>, port: u16) -> Self {
        Self::with_config(node_id, host, port, DhtConfig::default())
    }

    /// Create with explicit tuning parameters.
    #[must_use]
    pub fn with_config(
        node_id: NodeId,
        host: impl Into<String>,
        port: u16,
        config: DhtConfig,
    ) -> Self {
        Self {
            inner: Arc::new(DhtInner {
                node_id,
                config,
                routing: RoutingTable::new(node_id),
                storage: DashMap::new(),
                providers: DashMap::new(),
                pending: DashMap::new(),
                endpoint: Mutex::new(None),
                running: AtomicBool::new(false),
                recv_task: Mutex::new(None),
                req_counter: AtomicU64::new(0),
                rpcs_sent: AtomicU64::new(0),
                rpcs_timed_out: AtomicU64::new(0),
                requests_handled: AtomicU64::new(0),
            }),
            bind_host: host.into(),
            bind_port: port,
        }
    }

    /// This node's id.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.inner.node_id
    }

    /// Routing table reference.
    #[must_use]
    pub fn routing(&self) -> &RoutingTable {
        &self.inner.routing
    }

    /// Bind the socket and start answering RPCs.
    ///
    /// # Errors
    ///
    /// Returns socket bind errors.
    pub async fn start(&self) -> Result<SocketAddr, OperationError> {
        if self.inner.running.load(Ordering::Relaxed) {
            if let Some((_, addr)) = self.inner.endpoint.lock().await.as_ref() {
                return Ok(*addr);
            }
        }
        let socket = Arc::new(
            UdpSocket::bind(format!("{}:{}", self.bind_host, self.bind_port)).await?,
        );
        let local_addr = socket.local_addr()?;
        *self.inner.endpoint.lock().await = Some((Arc::clone(&socket), local_addr));
        self.inner.running.store(true, Ordering::Relaxed);

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                if !inner.running.load(Ordering::Relaxed) {
                    break;
                }
                match socket.recv_from(&mut buf).await {
                    Ok((len, addr)) => {
                        let data = buf[..len].to_vec();
                        let handler = Arc::clone(&inner);
                        let socket = Arc::clone(&socket);
                        tokio::spawn(async move {
                            handler.handle_datagram(socket.as_ref(), &data, addr).await;
                        });
                    }
                    Err(e) => {
                        if inner.running.load(Ordering::Relaxed) {
                            tracing::warn!(error = %e, "DHT receive error");
                        }
                        break;
                    }
                }
            }
        });
        *self.inner.recv_task.lock().await = Some(task);
        tracing::info!(node = %self.inner.node_id, %local_addr, "DHT listening");
        Ok(local_addr)
    }

    /// Stop the node and cancel in-flight RPCs.
    pub async fn stop(&self) {
        self.inner.running.store(false, Ordering::Relaxed);
        if let Some(task) = self.inner.recv_task.lock().await.take() {
            task.abort();
        }
        *self.inner.endpoint.lock().await = None;
        self.inner.pending.clear();
        tracing::info!(node = %self.inner.node_id, "DHT stopped");
    }

    /// Join the network through known nodes: seed the routing table, then
    /// look our own id up to populate nearby buckets.
    pub async fn bootstrap(&self, nodes: Vec<Contact>) {
        for contact in nodes {
            let _ = self.inner.routing.add_contact(contact).await;
        }
        let own_id = self.inner.node_id;
        let _ = self.find_node(&own_id).await;
    }

    /// Liveness-check a contact. Refreshes its routing-table slot on
    /// success.
    pub async fn ping(&self, contact: &Contact) -> bool {
        let payload = DhtPayload::Ping {
            sender: self.inner.self_contact().await,
        };
        match self.inner.request(contact, payload).await {
            Ok(DhtPayload::Pong { .. }) => {
                self.inner.routing.update_last_seen(&contact.node_id).await;
                true
            }
            _ => false,
        }
    }

    /// Iterative FIND_NODE: the k closest live contacts to `target`.
    pub async fn find_node(&self, target: &NodeId) -> Vec<Contact> {
        self.inner
            .iterative_lookup(target, false)
            .await
            .into_contacts()
    }

    /// Store a value at the k closest nodes to its content id.
    ///
    /// Returns the number of nodes (including this one) that stored it.
    pub async fn store(&self, content_id: NodeId, value: Vec<u8>) -> usize {
        let closest = self.find_node(&content_id).await;
        self.inner.storage.insert(content_id, value.clone());
        let mut stored = 1usize;

        let mut handles = Vec::new();
        for contact in closest.into_iter().take(self.inner.config.k) {
            let inner = Arc::clone(&self.inner);
            let value = value.clone();
            handles.push(tokio::spawn(async move {
                let payload = DhtPayload::Store {
                    sender: inner.self_contact().await,
                    content_id,
                    body: StoreBody::Data(value),
                };
                matches!(
                    inner.request(&contact, payload).await,
                    Ok(DhtPayload::StoreAck { stored: true, .. })
                )
            }));
        }
        for handle in handles {
            if matches!(handle.await, Ok(true)) {
                stored += 1;
            }
        }
        tracing::info!(content = %content_id, stored, "value stored");
        stored
    }

    /// Iterative FIND_VALUE.
    ///
    /// # Errors
    ///
    /// Returns `OperationError::ValueNotFound` if no queried node holds
    /// the value.
    pub async fn find_value(&self, content_id: &NodeId) -> Result<Vec<u8>, OperationError> {
        if let Some(value) = self.inner.storage.get(content_id) {
            return Ok(value.clone());
        }
        match self.inner.iterative_lookup(content_id, true).await {
            LookupOutcome::Value(value) => {
                // Cache for subsequent local hits.
                self.inner.storage.insert(*content_id, value.clone());
                Ok(value)
            }
            LookupOutcome::Contacts(_) => Err(OperationError::ValueNotFound),
        }
    }

    /// Announce this node as a provider for `content_id` at the k closest
    /// nodes.
    pub async fn announce_provider(&self, content_id: NodeId) {
        let closest = self.find_node(&content_id).await;
        let me = self.inner.self_contact().await;
        for contact in closest.into_iter().take(self.inner.config.k) {
            let payload = DhtPayload::Store {
                sender: me.clone(),
                content_id,
                body: StoreBody::Provider(me.clone()),
            };
            let _ = self.inner.request(&contact, payload).await;
        }
    }

    /// Find contacts that can serve `content_id`.
    pub async fn find_providers(&self, content_id: &NodeId) -> Vec<Contact> {
        if let Some(local) = self.inner.providers.get(content_id) {
            return local.iter().cloned().collect();
        }

        let closest = self.find_node(content_id).await;
        let mut found: HashSet<Contact> = HashSet::new();
        for contact in closest {
            let payload = DhtPayload::FindValue {
                sender: self.inner.self_contact().await,
                content_id: *content_id,
            };
            if let Ok(DhtPayload::FoundValue {
                body: FoundValueBody::Providers(providers),
                ..
            }) = self.inner.request(&contact, payload).await
            {
                found.extend(providers.into_iter().map(Contact::from));
            }
        }
        found.into_iter().collect()
    }

    /// Statistics snapshot.
    pub async fn stats(&self) -> DhtStats {
        DhtStats {
            rpcs_sent: self.inner.rpcs_sent.load(Ordering::Relaxed),
            rpcs_timed_out: self.inner.rpcs_timed_out.load(Ordering::Relaxed),
            requests_handled: self.inner.requests_handled.load(Ordering::Relaxed),
            values_stored: self.inner.storage.len(),
            provider_records: self.inner.providers.len(),
            contacts: self.inner.routing.contact_count().await,
        }
    }
}

enum LookupOutcome {
    Value(Vec<u8>),
    Contacts(Vec<Contact>),
}

impl LookupOutcome {
    fn into_contacts(self) -> Vec<Contact> {
        match self {
            Self::Contacts(contacts) => contacts,
            Self::Value(_) => Vec::new(),
        }
    }
}

impl DhtInner {
    async fn self_contact(&self) -> ContactInfo {
        let (host, port) = match self.endpoint.lock().await.as_ref() {
            Some((_, addr)) => (addr.ip().to_string(), addr.port()),
            None => (String::from("0.0.0.0"), 0),
        };
        ContactInfo {
            node_id: self.node_id,
            host,
            port,
        }
    }

    fn next_request_id(&self) -> RequestId {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64;
        let count = self.req_counter.fetch_add(1, Ordering::Relaxed);
        RequestId(micros.wrapping_mul(65536).wrapping_add(count).to_be_bytes())
    }

    /// Send one RPC and await its response.
    async fn request(
        &self,
        contact: &Contact,
        payload: DhtPayload,
    ) -> Result<DhtPayload, OperationError> {
        let socket = match self.endpoint.lock().await.as_ref() {
            Some((socket, _)) => Arc::clone(socket),
            None => return Err(OperationError::NotStarted),
        };

        let request_id = self.next_request_id();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id, tx);

        let wire = encode_datagram(request_id, &payload)?;
        let result = async {
            socket
                .send_to(&wire, (contact.host.as_str(), contact.port))
                .await?;
            self.rpcs_sent.fetch_add(1, Ordering::Relaxed);
            tokio::time::timeout(self.config.rpc_timeout, rx)
                .await
                .map_err(|_| {
                    self.rpcs_timed_out.fetch_add(1, Ordering::Relaxed);
                    OperationError::Timeout
                })?
                .map_err(|_| OperationError::Timeout)
        }
        .await;
        self.pending.remove(&request_id);
        result
    }

    /// Core iterative lookup shared by FIND_NODE and FIND_VALUE.
    async fn iterative_lookup(self: &Arc<Self>, target: &NodeId, want_value: bool) -> LookupOutcome {
        let mut shortlist = self.routing.find_closest(target, self.config.k).await;
        let mut queried: HashSet<NodeId> = HashSet::new();

        for _round in 0..self.config.max_iterations {
            let to_query: Vec<Contact> = shortlist
                .iter()
                .filter(|c| !queried.contains(&c.node_id))
                .take(self.config.alpha)
                .cloned()
                .collect();
            if to_query.is_empty() {
                break;
            }

            let mut handles = Vec::with_capacity(to_query.len());
            for contact in to_query {
                queried.insert(contact.node_id);
                let inner = Arc::clone(self);
                let target = *target;
                handles.push(tokio::spawn(async move {
                    let sender = inner.self_contact().await;
                    let payload = if want_value {
                        DhtPayload::FindValue {
                            sender,
                            content_id: target,
                        }
                    } else {
                        DhtPayload::FindNode { sender, target }
                    };
                    inner.request(&contact, payload).await
                }));
            }

            for handle in handles {
                let response = match handle.await {
                    Ok(Ok(response)) => response,
                    _ => continue,
                };
                match response {
                    DhtPayload::FoundValue {
                        body: FoundValueBody::Value(value),
                        ..
                    } => return LookupOutcome::Value(value),
                    DhtPayload::FoundValue {
                        body: FoundValueBody::Contacts(contacts),
                        ..
                    }
                    | DhtPayload::FoundNode { contacts, .. } => {
                        for info in contacts {
                            if info.node_id == self.node_id {
                                continue;
                            }
                            let contact = Contact::from(info);
                            if !shortlist.iter().any(|c| c.node_id == contact.node_id) {
                                shortlist.push(contact.clone());
                            }
                            let _ = self.routing.add_contact(contact).await;
                        }
                    }
                    // Providers answer a FIND_VALUE without the value
                    // itself; the lookup keeps narrowing.
                    _ => {}
                }
            }

            shortlist.sort_by_key(|c| c.node_id.distance(target));
            shortlist.truncate(self.config.k);
        }

        LookupOutcome::Contacts(shortlist)
    }

    /// Dispatch one inbound datagram: response completion or request
    /// handling.
    async fn handle_datagram(&self, socket: &UdpSocket, data: &[u8], addr: SocketAddr) {
        let (request_id, payload) = match decode_datagram(data) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::debug!(from = %addr, error = %e, "dropping malformed DHT datagram");
                return;
            }
        };

        // Learn or refresh the sender in the routing table, with the
        // observed source IP (the advertised port is the peer's listener).
        let sender = payload.sender().clone();
        if sender.node_id != self.node_id {
            let contact = Contact::new(sender.node_id, addr.ip().to_string(), sender.port);
            let _ = self.routing.add_contact(contact).await;
        }

        if let Some((_, waiter)) = self.pending.remove(&request_id) {
            let _ = waiter.send(payload);
            return;
        }

        self.requests_handled.fetch_add(1, Ordering::Relaxed);
        let response = match payload {
            DhtPayload::Ping { .. } => Some(DhtPayload::Pong {
                sender: self.self_contact().await,
            }),
            DhtPayload::FindNode { target, .. } => {
                let contacts = self
                    .routing
                    .find_closest(&target, self.config.k)
                    .await
                    .iter()
                    .map(ContactInfo::from)
                    .collect();
                Some(DhtPayload::FoundNode {
                    sender: self.self_contact().await,
                    contacts,
                })
            }
            DhtPayload::Store {
                content_id, body, ..
            } => {
                match body {
                    StoreBody::Data(value) => {
                        // Duplicate stores are idempotent.
                        self.storage.insert(content_id, value);
                    }
                    StoreBody::Provider(provider) => {
                        self.providers
                            .entry(content_id)
                            .or_default()
                            .insert(Contact::from(provider));
                    }
                }
                Some(DhtPayload::StoreAck {
                    sender: self.self_contact().await,
                    stored: true,
                })
            }
            DhtPayload::FindValue { content_id, .. } => {
                let body = if let Some(value) = self.storage.get(&content_id) {
                    FoundValueBody::Value(value.clone())
                } else if let Some(providers) = self.providers.get(&content_id) {
                    FoundValueBody::Providers(providers.iter().map(|c| ContactInfo::from(c)).collect())
                } else {
                    FoundValueBody::Contacts(
                        self.routing
                            .find_closest(&content_id, self.config.k)
                            .await
                            .iter()
                            .map(ContactInfo::from)
                            .collect(),
                    )
                };
                Some(DhtPayload::FoundValue {
                    sender: self.self_contact().await,
                    body,
                })
            }
            // Responses without a waiting future are stale; drop them.
            DhtPayload::Pong { .. }
            | DhtPayload::FoundNode { .. }
            | DhtPayload::StoreAck { .. }
            | DhtPayload::FoundValue { .. } => None,
        };

        if let Some(response) = response {
            match encode_datagram(request_id, &response) {
                Ok(wire) => {
                    if let Err(e) = socket.send_to(&wire, addr).await {
                        tracing::debug!(to = %addr, error = %e, "DHT response send failed");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "DHT response encode failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn started(host: &str) -> (KademliaDht, SocketAddr) {
        let dht = KademliaDht::new(NodeId::random(), host, 0);
        let addr = dht.start().await.unwrap();
        (dht, addr)
    }

    fn contact_for(dht_id: NodeId, addr: SocketAddr) -> Contact {
        Contact::new(dht_id, addr.ip().to_string(), addr.port())
    }

    #[tokio::test]
    async fn test_start_stop() {
        let (dht, addr) = started("127.0.0.1").await;
        assert_ne!(addr.port(), 0);
        dht.stop().await;
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let (a, _a_addr) = started("127.0.0.1").await;
        let (b, b_addr) = started("127.0.0.1").await;

        assert!(a.ping(&contact_for(b.node_id(), b_addr)).await);
        // The ping taught B about A as well.
        assert!(b.routing().contact_count().await >= 1);

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_ping_dead_peer_times_out() {
        let dht = KademliaDht::with_config(
            NodeId::random(),
            "127.0.0.1",
            0,
            DhtConfig {
                rpc_timeout: Duration::from_millis(150),
                ..DhtConfig::default()
            },
        );
        dht.start().await.unwrap();
        let dead = Contact::new(NodeId::random(), "127.0.0.1", 1);
        assert!(!dht.ping(&dead).await);
        assert_eq!(dht.stats().await.rpcs_timed_out, 1);
        dht.stop().await;
    }

    #[tokio::test]
    async fn test_store_and_find_value_two_nodes() {
        let (a, a_addr) = started("127.0.0.1").await;
        let (b, b_addr) = started("127.0.0.1").await;

        b.bootstrap(vec![contact_for(a.node_id(), a_addr)]).await;

        let content_id = NodeId::from_bytes([0x42; 32]);
        let stored = b.store(content_id, b"hello world".to_vec()).await;
        assert!(stored >= 2, "value should land on both nodes");

        // A can serve it from local storage now.
        assert_eq!(a.find_value(&content_id).await.unwrap(), b"hello world");

        a.stop().await;
        b.stop().await;
        let _ = b_addr;
    }

    #[tokio::test]
    async fn test_find_value_miss() {
        let (a, _) = started("127.0.0.1").await;
        let missing = NodeId::from_bytes([0x99; 32]);
        assert!(matches!(
            a.find_value(&missing).await,
            Err(OperationError::ValueNotFound)
        ));
        a.stop().await;
    }

    #[tokio::test]
    async fn test_provider_records() {
        let (a, a_addr) = started("127.0.0.1").await;
        let (b, _b_addr) = started("127.0.0.1").await;

        b.bootstrap(vec![contact_for(a.node_id(), a_addr)]).await;

        let content_id = NodeId::from_bytes([0x33; 32]);
        b.announce_provider(content_id).await;

        let providers = a.find_providers(&content_id).await;
        assert!(
            providers.iter().any(|c| c.node_id == b.node_id()),
            "B should be recorded as a provider on A"
        );

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_find_node_returns_sorted_contacts() {
        let (a, a_addr) = started("127.0.0.1").await;
        let (b, _) = started("127.0.0.1").await;
        b.bootstrap(vec![contact_for(a.node_id(), a_addr)]).await;

        let target = NodeId::random();
        let contacts = b.find_node(&target).await;
        for pair in contacts.windows(2) {
            assert!(pair[0].node_id.distance(&target) <= pair[1].node_id.distance(&target));
        }
        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_request_before_start_fails() {
        let dht = KademliaDht::new(NodeId::random(), "127.0.0.1", 0);
        let contact = Contact::new(NodeId::random(), "127.0.0.1", 9);
        let payload = DhtPayload::Ping {
            sender: ContactInfo {
                node_id: dht.node_id(),
                host: "127.0.0.1".into(),
                port: 0,
            },
        };
        assert!(matches!(
            dht.inner.request(&contact, payload).await,
            Err(OperationError::NotStarted)
        ));
    }
}
