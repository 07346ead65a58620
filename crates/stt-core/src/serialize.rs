//! Wire serialization for handshake payloads.
//!
//! Handshake messages are tagged records with fixed-type fields, encoded
//! with bincode. The enum tag identifies the message; unknown or truncated
//! bytes surface as `HandshakeError::Malformed` at the call site.

use crate::error::HandshakeError;
use crate::{NodeId, SessionId};
use serde::{Deserialize, Serialize};

/// Handshake exchange messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeMessage {
    /// Initiator → responder: opening commitment
    Hello {
        /// Initiator's node id
        node_id: NodeId,
        /// Fresh 32-byte nonce
        nonce: [u8; 32],
        /// Sender clock, milliseconds since the Unix epoch
        timestamp: u64,
        /// Capability strings offered by the initiator
        capabilities: Vec<String>,
        /// Proof of knowing the shared seed
        commitment: [u8; 32],
    },

    /// Responder → initiator: counter-nonce and challenge
    Response {
        /// Responder's node id
        node_id: NodeId,
        /// Fresh 32-byte nonce
        nonce: [u8; 32],
        /// Challenge proving the responder derived the session key
        challenge: [u8; 32],
    },

    /// Initiator → responder: session id and proof
    AuthProof {
        /// Derived session identifier
        session_id: SessionId,
        /// Proof over the responder's challenge
        proof: [u8; 32],
    },

    /// Responder → initiator: completion acknowledgement
    Final {
        /// Whether the responder accepted the proof
        acknowledged: bool,
    },
}

impl HandshakeMessage {
    /// Serialize to wire bytes.
    ///
    /// # Errors
    ///
    /// Returns `HandshakeError::Malformed` if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, HandshakeError> {
        bincode::serialize(self).map_err(|e| HandshakeError::Malformed(e.to_string()))
    }

    /// Deserialize from wire bytes.
    ///
    /// # Errors
    ///
    /// Returns `HandshakeError::Malformed` if the bytes do not parse.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HandshakeError> {
        bincode::deserialize(bytes).map_err(|e| HandshakeError::Malformed(e.to_string()))
    }

    /// Short name of the message kind, for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "HELLO",
            Self::Response { .. } => "RESPONSE",
            Self::AuthProof { .. } => "AUTH_PROOF",
            Self::Final { .. } => "FINAL",
        }
    }
}
