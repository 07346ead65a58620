//! Relay protocol message definitions.

use crate::nat::{Endpoint, NatError};
use serde::{Deserialize, Serialize};

/// Relay protocol messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayMessage {
    /// Client registers its endpoint under its node id
    Announce {
        /// Registering node
        node_id: [u8; 32],
        /// Claimed reachable host
        host: String,
        /// Claimed reachable port
        port: u16,
    },

    /// Relay acknowledges (or refuses) a registration
    AnnounceAck {
        /// Whether registration succeeded
        success: bool,
        /// Refusal reason, if any
        error: Option<String>,
    },

    /// Client keeps its registration alive
    Refresh {
        /// Registered node
        node_id: [u8; 32],
    },

    /// Client withdraws its registration
    Unannounce {
        /// Registered node
        node_id: [u8; 32],
    },

    /// Client asks for a peer's last-known endpoint
    Lookup {
        /// Peer being sought
        node_id: [u8; 32],
    },

    /// Relay answers a lookup
    LookupReply {
        /// The peer's endpoint, or `None` if unregistered
        endpoint: Option<Endpoint>,
    },
}

impl RelayMessage {
    /// Serialize to wire bytes.
    ///
    /// # Errors
    ///
    /// Returns `NatError::Protocol` if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, NatError> {
        bincode::serialize(self).map_err(|e| NatError::Protocol(e.to_string()))
    }

    /// Deserialize from wire bytes.
    ///
    /// # Errors
    ///
    /// Returns `NatError::Protocol` if the bytes do not parse.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, NatError> {
        bincode::deserialize(bytes).map_err(|e| NatError::Protocol(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_all_variants() {
        let messages = vec![
            RelayMessage::Announce {
                node_id: [1u8; 32],
                host: "10.0.1.100".into(),
                port: 8001,
            },
            RelayMessage::AnnounceAck {
                success: true,
                error: None,
            },
            RelayMessage::AnnounceAck {
                success: false,
                error: Some("at capacity".into()),
            },
            RelayMessage::Refresh { node_id: [2u8; 32] },
            RelayMessage::Unannounce { node_id: [3u8; 32] },
            RelayMessage::Lookup { node_id: [4u8; 32] },
            RelayMessage::LookupReply {
                endpoint: Some(Endpoint::new("203.0.113.50", 8003)),
            },
            RelayMessage::LookupReply { endpoint: None },
        ];
        for msg in messages {
            let bytes = msg.to_bytes().unwrap();
            assert_eq!(RelayMessage::from_bytes(&bytes).unwrap(), msg);
        }
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(RelayMessage::from_bytes(&[0xFE; 12]).is_err());
    }
}
