//! Four-message pre-shared-seed handshake.
//!
//! Trust is symmetric: both peers hold the same shared seed and prove
//! knowledge of it without ever transmitting it. The exchange is
//!
//! 1. `HELLO` (initiator): node id, fresh nonce, timestamp, capability
//!    list, and a commitment hash over nonce and id.
//! 2. `RESPONSE` (responder): node id, fresh nonce, and a challenge proving
//!    the responder derived the session key.
//! 3. `AUTH_PROOF` (initiator): the derived session id and a proof over the
//!    challenge.
//! 4. `FINAL` (responder): acknowledgement.
//!
//! Every derived value feeds through the shared-seed crypto provider, so a
//! flipped byte anywhere fails verification and moves the engine to
//! `Failed`. Nonces are fresh per handshake, which defeats replay.

use crate::error::HandshakeError;
use crate::serialize::HandshakeMessage;
use crate::{NodeId, SessionId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use stt_crypto::{AdContext, CryptoProvider, SessionKey, random};

/// Pending handshakes older than this are garbage-collected.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Capabilities this implementation offers by default.
pub const DEFAULT_CAPABILITIES: [&str; 3] = ["udp", "streaming", "dht"];

/// Handshake state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Nothing exchanged yet
    Init,
    /// Initiator: HELLO sent, awaiting RESPONSE
    HelloSent,
    /// Responder: RESPONSE sent, awaiting AUTH_PROOF
    ResponseSent,
    /// Initiator: AUTH_PROOF sent, awaiting FINAL
    AuthSent,
    /// Both sides hold the session key and id
    Completed,
    /// Verification failed; the engine is dead
    Failed,
}

impl HandshakeState {
    fn name(self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::HelloSent => "HELLO_SENT",
            Self::ResponseSent => "RESPONSE_SENT",
            Self::AuthSent => "AUTH_SENT",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

/// One handshake exchange with a single peer.
pub struct Handshake {
    crypto: Arc<dyn CryptoProvider>,
    local_node_id: NodeId,
    capabilities: Vec<String>,
    state: HandshakeState,
    our_nonce: Option<[u8; 32]>,
    peer_nonce: Option<[u8; 32]>,
    peer_node_id: Option<NodeId>,
    peer_capabilities: Vec<String>,
    session_key: Option<SessionKey>,
    session_id: Option<SessionId>,
    challenge: Option<[u8; 32]>,
    created_at: Instant,
}

impl Handshake {
    /// Create an engine bound to the shared-seed crypto provider.
    #[must_use]
    pub fn new(crypto: Arc<dyn CryptoProvider>, local_node_id: NodeId) -> Self {
        Self {
            crypto,
            local_node_id,
            capabilities: DEFAULT_CAPABILITIES.iter().map(|s| (*s).into()).collect(),
            state: HandshakeState::Init,
            our_nonce: None,
            peer_nonce: None,
            peer_node_id: None,
            peer_capabilities: Vec::new(),
            session_key: None,
            session_id: None,
            challenge: None,
            created_at: Instant::now(),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Whether the exchange completed successfully.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.state == HandshakeState::Completed
    }

    /// Age of this engine, for garbage collection.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Peer node id, once learned.
    #[must_use]
    pub fn peer_node_id(&self) -> Option<NodeId> {
        self.peer_node_id
    }

    /// Capabilities announced by the peer.
    #[must_use]
    pub fn peer_capabilities(&self) -> &[String] {
        &self.peer_capabilities
    }

    /// Derived session key.
    ///
    /// # Errors
    ///
    /// Returns `HandshakeError::NotCompleted` before completion.
    pub fn session_key(&self) -> Result<SessionKey, HandshakeError> {
        if self.state != HandshakeState::Completed {
            return Err(HandshakeError::NotCompleted);
        }
        self.session_key
            .clone()
            .ok_or(HandshakeError::NotCompleted)
    }

    /// Derived session id.
    ///
    /// # Errors
    ///
    /// Returns `HandshakeError::NotCompleted` before completion.
    pub fn session_id(&self) -> Result<SessionId, HandshakeError> {
        if self.state != HandshakeState::Completed {
            return Err(HandshakeError::NotCompleted);
        }
        self.session_id.ok_or(HandshakeError::NotCompleted)
    }

    /// Initiate: produce the HELLO message.
    ///
    /// # Errors
    ///
    /// Returns `HandshakeError::WrongState` unless the engine is fresh.
    pub fn initiate(&mut self) -> Result<Vec<u8>, HandshakeError> {
        if self.state != HandshakeState::Init {
            return Err(HandshakeError::WrongState {
                message: "initiate",
                state: self.state.name(),
            });
        }

        let nonce = random::handshake_nonce();
        let timestamp = crate::frame::now_millis();
        let commitment = self.commitment(&nonce, &self.local_node_id, timestamp);
        self.our_nonce = Some(nonce);
        self.state = HandshakeState::HelloSent;

        HandshakeMessage::Hello {
            node_id: self.local_node_id,
            nonce,
            timestamp,
            capabilities: self.capabilities.clone(),
            commitment,
        }
        .to_bytes()
    }

    /// Responder: verify a HELLO and produce the RESPONSE.
    ///
    /// # Errors
    ///
    /// Returns `HandshakeError::Rejected` (engine moves to FAILED) if the
    /// commitment does not verify.
    pub fn handle_hello(&mut self, bytes: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        if self.state != HandshakeState::Init {
            return Err(HandshakeError::WrongState {
                message: "HELLO",
                state: self.state.name(),
            });
        }
        let msg = self.parse(bytes)?;
        let HandshakeMessage::Hello {
            node_id,
            nonce,
            timestamp,
            capabilities,
            commitment,
        } = msg
        else {
            return self.fail("expected HELLO");
        };

        let expected = self.commitment(&nonce, &node_id, timestamp);
        if expected != commitment {
            return self.fail("commitment mismatch");
        }

        self.peer_nonce = Some(nonce);
        self.peer_node_id = Some(node_id);
        self.peer_capabilities = capabilities;
        let our_nonce = random::handshake_nonce();
        self.our_nonce = Some(our_nonce);

        // The peer initiated, so their nonce and id come first.
        let key = self.derive_session_key(&nonce, &our_nonce, &node_id, &self.local_node_id);
        let challenge = self.crypto.hash(
            &[key.as_bytes().as_slice(), nonce.as_slice()].concat(),
            &AdContext::purpose("auth_challenge"),
        );
        self.session_id = Some(derive_session_id(self.crypto.as_ref(), &key));
        self.session_key = Some(key);
        self.challenge = Some(challenge);
        self.state = HandshakeState::ResponseSent;

        HandshakeMessage::Response {
            node_id: self.local_node_id,
            nonce: our_nonce,
            challenge,
        }
        .to_bytes()
    }

    /// Initiator: verify a RESPONSE and produce the AUTH_PROOF.
    ///
    /// # Errors
    ///
    /// Returns `HandshakeError::Rejected` (engine moves to FAILED) if the
    /// challenge does not verify.
    pub fn handle_response(&mut self, bytes: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        if self.state != HandshakeState::HelloSent {
            return Err(HandshakeError::WrongState {
                message: "RESPONSE",
                state: self.state.name(),
            });
        }
        let msg = self.parse(bytes)?;
        let HandshakeMessage::Response {
            node_id,
            nonce,
            challenge,
        } = msg
        else {
            return self.fail("expected RESPONSE");
        };

        let our_nonce = self.our_nonce.ok_or(HandshakeError::NotCompleted)?;
        // We initiated, so our nonce and id come first.
        let key = self.derive_session_key(&our_nonce, &nonce, &self.local_node_id, &node_id);
        let expected_challenge = self.crypto.hash(
            &[key.as_bytes().as_slice(), our_nonce.as_slice()].concat(),
            &AdContext::purpose("auth_challenge"),
        );
        if expected_challenge != challenge {
            return self.fail("challenge mismatch");
        }

        let session_id = derive_session_id(self.crypto.as_ref(), &key);
        let proof = self.crypto.hash(
            &[key.as_bytes().as_slice(), challenge.as_slice()].concat(),
            &AdContext::purpose("auth_proof"),
        );

        self.peer_nonce = Some(nonce);
        self.peer_node_id = Some(node_id);
        self.session_id = Some(session_id);
        self.session_key = Some(key);
        self.challenge = Some(challenge);
        self.state = HandshakeState::AuthSent;

        HandshakeMessage::AuthProof { session_id, proof }.to_bytes()
    }

    /// Responder: verify the AUTH_PROOF and produce the FINAL message.
    ///
    /// On success the engine is COMPLETED.
    ///
    /// # Errors
    ///
    /// Returns `HandshakeError::Rejected` (engine moves to FAILED) if the
    /// session id or proof do not verify.
    pub fn handle_auth_proof(&mut self, bytes: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        if self.state != HandshakeState::ResponseSent {
            return Err(HandshakeError::WrongState {
                message: "AUTH_PROOF",
                state: self.state.name(),
            });
        }
        let msg = self.parse(bytes)?;
        let HandshakeMessage::AuthProof { session_id, proof } = msg else {
            return self.fail("expected AUTH_PROOF");
        };

        if Some(session_id) != self.session_id {
            return self.fail("session id mismatch");
        }
        let (Some(key), Some(challenge)) = (&self.session_key, &self.challenge) else {
            return self.fail("missing derived material");
        };
        let expected_proof = self.crypto.hash(
            &[key.as_bytes().as_slice(), challenge.as_slice()].concat(),
            &AdContext::purpose("auth_proof"),
        );
        if expected_proof != proof {
            return self.fail("proof mismatch");
        }

        self.state = HandshakeState::Completed;
        tracing::debug!(session = %hex::encode(session_id), "handshake completed (responder)");
        HandshakeMessage::Final { acknowledged: true }.to_bytes()
    }

    /// Initiator: process the FINAL acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns `HandshakeError::Rejected` if the responder refused.
    pub fn handle_final(&mut self, bytes: &[u8]) -> Result<(), HandshakeError> {
        if self.state != HandshakeState::AuthSent {
            return Err(HandshakeError::WrongState {
                message: "FINAL",
                state: self.state.name(),
            });
        }
        let msg = self.parse(bytes)?;
        let HandshakeMessage::Final { acknowledged } = msg else {
            return self.fail("expected FINAL");
        };
        if !acknowledged {
            self.state = HandshakeState::Failed;
            return Err(HandshakeError::Rejected("responder refused"));
        }
        self.state = HandshakeState::Completed;
        if let Some(id) = self.session_id {
            tracing::debug!(session = %hex::encode(id), "handshake completed (initiator)");
        }
        Ok(())
    }

    /// Dispatch an incoming handshake message by kind.
    ///
    /// Returns the reply to send, if any (FINAL produces none).
    ///
    /// # Errors
    ///
    /// Propagates the per-message errors; parse failures also move the
    /// engine to FAILED.
    pub fn process(&mut self, bytes: &[u8]) -> Result<Option<Vec<u8>>, HandshakeError> {
        let kind = HandshakeMessage::from_bytes(bytes)
            .map(|m| m.kind())
            .map_err(|e| {
                self.state = HandshakeState::Failed;
                e
            })?;
        match kind {
            "HELLO" => self.handle_hello(bytes).map(Some),
            "RESPONSE" => self.handle_response(bytes).map(Some),
            "AUTH_PROOF" => self.handle_auth_proof(bytes).map(Some),
            "FINAL" => self.handle_final(bytes).map(|()| None),
            _ => unreachable!("kind() is exhaustive"),
        }
    }

    fn parse(&mut self, bytes: &[u8]) -> Result<HandshakeMessage, HandshakeError> {
        HandshakeMessage::from_bytes(bytes).map_err(|e| {
            self.state = HandshakeState::Failed;
            e
        })
    }

    fn fail<T>(&mut self, reason: &'static str) -> Result<T, HandshakeError> {
        self.state = HandshakeState::Failed;
        tracing::warn!(reason, "handshake rejected");
        Err(HandshakeError::Rejected(reason))
    }

    fn commitment(&self, nonce: &[u8; 32], node_id: &NodeId, timestamp: u64) -> [u8; 32] {
        self.crypto.hash(
            &[nonce.as_slice(), node_id.as_slice()].concat(),
            &AdContext::purpose("hello_commitment").with_u64("timestamp", timestamp),
        )
    }

    fn derive_session_key(
        &self,
        initiator_nonce: &[u8; 32],
        responder_nonce: &[u8; 32],
        initiator_id: &NodeId,
        responder_id: &NodeId,
    ) -> SessionKey {
        let ctx = AdContext::purpose("session_key")
            .with_bytes("initiator_nonce", initiator_nonce.to_vec())
            .with_bytes("responder_nonce", responder_nonce.to_vec())
            .with_bytes("initiator_id", initiator_id.to_vec())
            .with_bytes("responder_id", responder_id.to_vec());
        let bytes = self
            .crypto
            .derive_key(32, &ctx)
            .expect("32 is a valid key length");
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        SessionKey::new(key)
    }
}

/// Derive the 8-byte session id from the session key. Both peers compute
/// the same value.
#[must_use]
pub fn derive_session_id(crypto: &dyn CryptoProvider, key: &SessionKey) -> SessionId {
    let hash = crypto.hash(key.as_bytes(), &AdContext::purpose("session_id"));
    let mut id = [0u8; 8];
    id.copy_from_slice(&hash[..8]);
    id
}

/// Tracks concurrent handshakes keyed by peer address.
pub struct HandshakeManager {
    crypto: Arc<dyn CryptoProvider>,
    node_id: NodeId,
    timeout: Duration,
    handshakes: HashMap<SocketAddr, Handshake>,
}

impl HandshakeManager {
    /// Create a manager bound to the shared-seed provider.
    #[must_use]
    pub fn new(crypto: Arc<dyn CryptoProvider>, node_id: NodeId) -> Self {
        Self {
            crypto,
            node_id,
            timeout: HANDSHAKE_TIMEOUT,
            handshakes: HashMap::new(),
        }
    }

    /// Create (or replace) the handshake for a peer address.
    pub fn create(&mut self, peer: SocketAddr) -> &mut Handshake {
        let handshake = Handshake::new(Arc::clone(&self.crypto), self.node_id);
        self.handshakes.insert(peer, handshake);
        self.handshakes
            .get_mut(&peer)
            .expect("inserted in the line above")
    }

    /// Existing handshake for a peer address.
    pub fn get_mut(&mut self, peer: &SocketAddr) -> Option<&mut Handshake> {
        self.handshakes.get_mut(peer)
    }

    /// Whether a handshake exists for this peer address.
    #[must_use]
    pub fn contains(&self, peer: &SocketAddr) -> bool {
        self.handshakes.contains_key(peer)
    }

    /// Remove a completed or failed handshake.
    pub fn remove(&mut self, peer: &SocketAddr) -> Option<Handshake> {
        self.handshakes.remove(peer)
    }

    /// Evict failed and timed-out handshakes. Returns the eviction count.
    pub fn gc(&mut self) -> usize {
        let timeout = self.timeout;
        let before = self.handshakes.len();
        self.handshakes
            .retain(|_, hs| hs.state() != HandshakeState::Failed && hs.age() < timeout);
        let evicted = before - self.handshakes.len();
        if evicted > 0 {
            tracing::debug!(evicted, "garbage-collected handshakes");
        }
        evicted
    }

    /// Number of pending handshakes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handshakes.len()
    }

    /// Whether the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handshakes.is_empty()
    }
}
