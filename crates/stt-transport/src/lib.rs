//! # STT Transport
//!
//! Network transport layer for the STT protocol.
//!
//! Provides the [`Transport`] trait abstraction and the async UDP
//! implementation with local-network peer discovery. Datagrams are
//! unreliable by design; ordering and retransmission live in the layers
//! above.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod transport;
pub mod udp;

pub use transport::{Transport, TransportError, TransportResult, TransportStats};
pub use udp::{
    DISCOVERY_PORT, DiscoveryOpcode, PeerDiscoveredCallback, RawHandler, SAFE_MTU, UdpTransport,
};
