//! # STT Discovery
//!
//! Peer and content discovery for the STT protocol:
//! - **Kademlia DHT**: 256-bit XOR keyspace, k-bucket routing, iterative
//!   lookups, value storage, and provider records
//! - **NAT coordination**: a pluggable peer-address resolver with manual
//!   and relay-backed strategies
//! - **Relay**: a lightweight rendezvous server that tracks node
//!   endpoints and answers lookups

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dht;
pub mod nat;
pub mod relay;

pub use dht::{ALPHA, Contact, DhtError, K, KademliaDht, NUM_BUCKETS, NodeId, RoutingTable};
pub use nat::{Endpoint, ManualNatCoordinator, NatCoordinator, NatError, RelayNatCoordinator};
pub use relay::{RelayMessage, RelayServer};
