//! Transport trait abstraction.
//!
//! Abstracts over datagram transport backends so the protocol layers never
//! touch sockets directly and tests can substitute loopback transports.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from the underlying socket
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport has been stopped
    #[error("transport is down")]
    Down,

    /// Address binding failed
    #[error("failed to bind to address: {0}")]
    BindFailed(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Async datagram transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a datagram to a remote address. Returns bytes sent.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Down` after close, or an I/O error.
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize>;

    /// Receive one datagram. Returns `(bytes_received, sender)`.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Down` after close, or an I/O error.
    async fn recv_from(&self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)>;

    /// Local bound address.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the address cannot be determined.
    fn local_addr(&self) -> TransportResult<SocketAddr>;

    /// Stop the transport. Subsequent operations fail with
    /// `TransportError::Down`.
    ///
    /// # Errors
    ///
    /// Returns an error if shutdown fails.
    async fn close(&self) -> TransportResult<()>;

    /// Whether the transport has been stopped.
    fn is_closed(&self) -> bool;

    /// Transport statistics.
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

/// Transport statistics
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Total packets sent
    pub packets_sent: u64,
    /// Total packets received
    pub packets_received: u64,
    /// Send errors
    pub send_errors: u64,
    /// Receive errors
    pub recv_errors: u64,
    /// Packets consumed or rejected by the discovery layer
    pub packets_dropped: u64,
    /// Time since the transport started
    pub uptime: Option<Duration>,
}
