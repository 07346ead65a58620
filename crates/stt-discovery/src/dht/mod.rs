//! Kademlia DHT.
//!
//! Node identifiers live in a 256-bit XOR keyspace. The routing table
//! keeps up to [`K`] contacts per distance band with a
//! least-recently-seen ordering, and lookups proceed iteratively with
//! [`ALPHA`]-way parallelism until no closer contact appears.

pub mod kademlia;
pub mod messages;
pub mod node_id;
pub mod routing;

pub use kademlia::{DhtConfig, DhtStats, KademliaDht, OperationError};
pub use messages::{
    ContactInfo, DhtPayload, FoundValueBody, MessageError, Opcode, RequestId, StoreBody,
};
pub use node_id::NodeId;
pub use routing::{Contact, DhtError, KBucket, RoutingTable};

/// Replication parameter: contacts per bucket and per lookup result
pub const K: usize = 20;

/// Number of k-buckets (one per bit of the keyspace)
pub const NUM_BUCKETS: usize = 256;

/// Parallelism of iterative lookups
pub const ALPHA: usize = 3;
