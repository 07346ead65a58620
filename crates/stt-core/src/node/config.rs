//! Node configuration.

use crate::session::SessionConfig;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for an [`super::SttNode`].
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Bind address (default all interfaces)
    pub host: String,
    /// Bind port (0 picks a random free port)
    pub port: u16,
    /// Chamber directory; `None` disables persistence
    pub chamber_path: Option<PathBuf>,
    /// Announce on the LAN discovery channel
    pub enable_discovery: bool,
    /// Interval between discovery announcements
    pub discovery_interval: Duration,
    /// Bounded receive-queue capacity
    pub recv_queue_capacity: usize,
    /// How long `connect` waits for the handshake to complete
    pub handshake_timeout: Duration,
    /// Configuration applied to every new session
    pub session: SessionConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 0,
            chamber_path: None,
            enable_discovery: false,
            discovery_interval: Duration::from_secs(5),
            recv_queue_capacity: 1024,
            handshake_timeout: Duration::from_secs(10),
            session: SessionConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Config bound to localhost with an ephemeral port, for tests and
    /// examples.
    #[must_use]
    pub fn localhost() -> Self {
        Self {
            host: "127.0.0.1".into(),
            ..Self::default()
        }
    }
}
