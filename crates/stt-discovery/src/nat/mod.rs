//! Pluggable NAT coordination.
//!
//! A [`NatCoordinator`] answers one question for the node: given a peer's
//! id, what `(host, port)` should be dialled? The manual strategy is an
//! operator-populated map; the relay strategy registers with a rendezvous
//! server and falls back to relayed routing when direct dialling fails.

mod relay_coordinator;

pub use relay_coordinator::{RelayCoordinatorStats, RelayNatCoordinator};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio::sync::Mutex;

/// NAT coordination errors
#[derive(Debug, Error)]
pub enum NatError {
    /// The peer could not be resolved to an endpoint
    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),

    /// Registration with the relay failed
    #[error("registration failed: {0}")]
    RegistrationFailed(String),

    /// The relay did not answer in time
    #[error("coordination timeout")]
    Timeout,

    /// Socket failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected or malformed relay message
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// A dialable peer endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Host or IP
    pub host: String,
    /// UDP port
    pub port: u16,
}

impl Endpoint {
    /// Create an endpoint.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Resolves peer node ids to dialable endpoints.
#[async_trait]
pub trait NatCoordinator: Send + Sync {
    /// Advertise the local endpoint to whatever backs this strategy.
    ///
    /// # Errors
    ///
    /// Returns `NatError::RegistrationFailed` or transport errors.
    async fn register_local(&self, host: &str, port: u16) -> Result<(), NatError>;

    /// Resolve a peer id to an endpoint, optionally with a direct hint.
    ///
    /// # Errors
    ///
    /// Returns `NatError::PeerUnreachable` when the strategy has no
    /// answer.
    async fn resolve(&self, peer: &[u8; 32], hint: Option<Endpoint>)
    -> Result<Endpoint, NatError>;

    /// Withdraw the local registration.
    ///
    /// # Errors
    ///
    /// Returns transport errors from the withdrawal message.
    async fn unregister(&self) -> Result<(), NatError>;
}

/// Operator-populated coordination: every peer endpoint is configured
/// explicitly, out of band.
#[derive(Default)]
pub struct ManualNatCoordinator {
    peers: DashMap<[u8; 32], Endpoint>,
    local: Mutex<Option<Endpoint>>,
}

impl ManualNatCoordinator {
    /// Create an empty coordinator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure a peer's endpoint.
    pub fn configure_peer(&self, peer: [u8; 32], host: impl Into<String>, port: u16) {
        self.peers.insert(peer, Endpoint::new(host, port));
    }

    /// Remove a configured peer.
    pub fn remove_peer(&self, peer: &[u8; 32]) {
        self.peers.remove(peer);
    }

    /// Number of configured peers.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// The registered local endpoint, if any.
    pub async fn local_endpoint(&self) -> Option<Endpoint> {
        self.local.lock().await.clone()
    }
}

#[async_trait]
impl NatCoordinator for ManualNatCoordinator {
    async fn register_local(&self, host: &str, port: u16) -> Result<(), NatError> {
        *self.local.lock().await = Some(Endpoint::new(host, port));
        Ok(())
    }

    async fn resolve(
        &self,
        peer: &[u8; 32],
        hint: Option<Endpoint>,
    ) -> Result<Endpoint, NatError> {
        if let Some(endpoint) = self.peers.get(peer) {
            return Ok(endpoint.clone());
        }
        if let Some(hint) = hint {
            return Ok(hint);
        }
        Err(NatError::PeerUnreachable(hex::encode(peer)))
    }

    async fn unregister(&self) -> Result<(), NatError> {
        *self.local.lock().await = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_manual_resolve_configured() {
        let coordinator = ManualNatCoordinator::new();
        coordinator.configure_peer([1u8; 32], "10.0.0.2", 8002);

        let endpoint = coordinator.resolve(&[1u8; 32], None).await.unwrap();
        assert_eq!(endpoint, Endpoint::new("10.0.0.2", 8002));
    }

    #[tokio::test]
    async fn test_manual_resolve_miss_fails_connect() {
        let coordinator = ManualNatCoordinator::new();
        assert!(matches!(
            coordinator.resolve(&[9u8; 32], None).await,
            Err(NatError::PeerUnreachable(_))
        ));
    }

    #[tokio::test]
    async fn test_manual_hint_fallback() {
        let coordinator = ManualNatCoordinator::new();
        let hint = Endpoint::new("192.168.1.5", 9999);
        let endpoint = coordinator
            .resolve(&[9u8; 32], Some(hint.clone()))
            .await
            .unwrap();
        assert_eq!(endpoint, hint);
    }

    #[tokio::test]
    async fn test_manual_register_unregister() {
        let coordinator = ManualNatCoordinator::new();
        coordinator.register_local("127.0.0.1", 8001).await.unwrap();
        assert_eq!(
            coordinator.local_endpoint().await,
            Some(Endpoint::new("127.0.0.1", 8001))
        );
        coordinator.unregister().await.unwrap();
        assert_eq!(coordinator.local_endpoint().await, None);
    }

    #[tokio::test]
    async fn test_manual_remove_peer() {
        let coordinator = ManualNatCoordinator::new();
        coordinator.configure_peer([1u8; 32], "h", 1);
        assert_eq!(coordinator.peer_count(), 1);
        coordinator.remove_peer(&[1u8; 32]);
        assert!(coordinator.resolve(&[1u8; 32], None).await.is_err());
    }
}
