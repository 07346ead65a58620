//! Relay rendezvous: wire protocol and server.
//!
//! The relay tracks which node id is reachable at which endpoint.
//! Clients announce themselves, refresh periodically, and look peers up;
//! registrations that miss their refresh window are evicted.

pub mod protocol;
pub mod server;

pub use protocol::RelayMessage;
pub use server::{RelayServer, RelayServerConfig, RelayServerStats};
