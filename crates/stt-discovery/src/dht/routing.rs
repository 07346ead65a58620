//! K-bucket routing table.
//!
//! Contacts are organised into 256 buckets by the bit-length of their XOR
//! distance to the local id. Each bucket is ordered least-recently-seen
//! first; refreshing a contact moves it to the recent end, and a full
//! bucket rejects newcomers (stability preference — long-lived nodes stay).

use crate::dht::node_id::NodeId;
use crate::dht::{K, NUM_BUCKETS};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Mutex;

/// Routing errors
#[derive(Debug, Error)]
pub enum DhtError {
    /// Bucket already holds `K` contacts
    #[error("bucket full")]
    BucketFull,

    /// Attempted to add the local node to its own table
    #[error("cannot add self to routing table")]
    SelfContact,
}

/// A known DHT peer. Equality and hashing are by node id only.
#[derive(Debug, Clone)]
pub struct Contact {
    /// Peer node id
    pub node_id: NodeId,
    /// Reachable host
    pub host: String,
    /// Reachable UDP port
    pub port: u16,
    /// When the contact was last heard from
    pub last_seen: Instant,
}

impl Contact {
    /// Create a contact seen now.
    #[must_use]
    pub fn new(node_id: NodeId, host: impl Into<String>, port: u16) -> Self {
        Self {
            node_id,
            host: host.into(),
            port,
            last_seen: Instant::now(),
        }
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.node_id == other.node_id
    }
}

impl Eq for Contact {}

impl std::hash::Hash for Contact {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.node_id.hash(state);
    }
}

/// One distance band of the routing table.
#[derive(Debug, Default)]
pub struct KBucket {
    contacts: Vec<Contact>,
}

impl KBucket {
    /// Create an empty bucket.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or refresh a contact.
    ///
    /// An existing contact moves to the most-recently-seen end. A new
    /// contact is appended if the bucket has room.
    ///
    /// # Errors
    ///
    /// Returns `DhtError::BucketFull` when the bucket already holds `K`
    /// strangers.
    pub fn add(&mut self, contact: Contact) -> Result<(), DhtError> {
        if let Some(pos) = self
            .contacts
            .iter()
            .position(|c| c.node_id == contact.node_id)
        {
            self.contacts.remove(pos);
            self.contacts.push(contact);
            return Ok(());
        }
        if self.contacts.len() >= K {
            return Err(DhtError::BucketFull);
        }
        self.contacts.push(contact);
        Ok(())
    }

    /// Remove a contact by id. Returns whether it was present.
    pub fn remove(&mut self, node_id: &NodeId) -> bool {
        match self.contacts.iter().position(|c| &c.node_id == node_id) {
            Some(pos) => {
                self.contacts.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Refresh the last-seen time of a contact, promoting it.
    pub fn touch(&mut self, node_id: &NodeId) -> bool {
        match self.contacts.iter().position(|c| &c.node_id == node_id) {
            Some(pos) => {
                let mut contact = self.contacts.remove(pos);
                contact.last_seen = Instant::now();
                self.contacts.push(contact);
                true
            }
            None => false,
        }
    }

    /// Contacts in least-recently-seen order.
    #[must_use]
    pub fn contacts(&self) -> &[Contact] {
        &self.contacts
    }

    /// Number of contacts held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    /// Whether the bucket is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }
}

/// The 256-bucket routing table. Mutations are serialised per bucket.
pub struct RoutingTable {
    local_id: NodeId,
    buckets: Vec<Mutex<KBucket>>,
}

impl RoutingTable {
    /// Create a table for the local node.
    #[must_use]
    pub fn new(local_id: NodeId) -> Self {
        Self {
            local_id,
            buckets: (0..NUM_BUCKETS).map(|_| Mutex::new(KBucket::new())).collect(),
        }
    }

    /// Local node id.
    #[must_use]
    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// Add or refresh a contact.
    ///
    /// # Errors
    ///
    /// Returns `DhtError::SelfContact` for the local id and
    /// `DhtError::BucketFull` when the band has no room.
    pub async fn add_contact(&self, contact: Contact) -> Result<(), DhtError> {
        let Some(index) = contact.node_id.bucket_index(&self.local_id) else {
            return Err(DhtError::SelfContact);
        };
        self.buckets[index].lock().await.add(contact)
    }

    /// Remove a contact. Returns whether it was present.
    pub async fn remove_contact(&self, node_id: &NodeId) -> bool {
        match node_id.bucket_index(&self.local_id) {
            Some(index) => self.buckets[index].lock().await.remove(node_id),
            None => false,
        }
    }

    /// Refresh a contact's last-seen time.
    pub async fn update_last_seen(&self, node_id: &NodeId) -> bool {
        match node_id.bucket_index(&self.local_id) {
            Some(index) => self.buckets[index].lock().await.touch(node_id),
            None => false,
        }
    }

    /// Up to `count` contacts globally closest to `target`, sorted by XOR
    /// distance.
    pub async fn find_closest(&self, target: &NodeId, count: usize) -> Vec<Contact> {
        let mut all = Vec::new();
        for bucket in &self.buckets {
            all.extend(bucket.lock().await.contacts().iter().cloned());
        }
        all.sort_by_key(|c| c.node_id.distance(target));
        all.truncate(count);
        all
    }

    /// All contacts in the table.
    pub async fn all_contacts(&self) -> Vec<Contact> {
        let mut all = Vec::new();
        for bucket in &self.buckets {
            all.extend(bucket.lock().await.contacts().iter().cloned());
        }
        all
    }

    /// Total number of contacts.
    pub async fn contact_count(&self) -> usize {
        let mut count = 0;
        for bucket in &self.buckets {
            count += bucket.lock().await.len();
        }
        count
    }
}
