//! Session state machine and key-rotation accounting.
//!
//! A session is the authenticated context between two nodes: it owns the
//! stream table, the rotating frame-layer key, and the traffic counters
//! that drive rotation. Frame payloads are encrypted under the current
//! session key with the frame header as associated data; per-stream chunk
//! encryption roots in the session's base key, so rotation re-keys the
//! frame layer without disturbing in-flight stream contexts.

use crate::error::SessionError;
use crate::frame::{Frame, FrameType};
use crate::stream::{Stream, StreamHandle};
use crate::{NodeId, SessionId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use stt_crypto::{AdContext, CryptoProvider, SeedCrypto, SessionKey, XCHACHA_NONCE_SIZE};

/// First stream id handed out; id 0 is reserved for control.
const FIRST_STREAM_ID: u32 = 1;

/// Largest plaintext chunk carried in one data frame, leaving headroom
/// for segment and AEAD framing under the frame size cap.
pub const MAX_CHUNK_SIZE: usize = 1024;

/// Session configuration parameters
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bytes transmitted before a rotation is required (default 1 GiB)
    pub rotation_data_threshold: u64,
    /// Wall time between rotations (default 1 hour)
    pub rotation_time_threshold: Duration,
    /// Messages transmitted before a rotation is required (default 2^20)
    pub rotation_message_threshold: u64,
    /// Received frames for which the previous key may still be tried
    pub rotation_grace_frames: u32,
    /// Peer silence beyond this closes the session
    pub idle_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            rotation_data_threshold: 1024 * 1024 * 1024, // 1 GiB
            rotation_time_threshold: Duration::from_secs(3600),
            rotation_message_threshold: 1 << 20,
            rotation_grace_frames: 8,
            idle_timeout: Duration::from_secs(60),
        }
    }
}

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, handshake not yet confirmed
    Init,
    /// Handshake in progress
    Handshake,
    /// Established, carrying traffic
    Active,
    /// Key rotation in progress
    KeyRotating,
    /// Draining before close
    Closing,
    /// Closed; key material zeroized
    Closed,
}

/// Session statistics snapshot
#[derive(Debug, Clone)]
pub struct SessionStats {
    /// Current state
    pub state: SessionState,
    /// Total plaintext bytes sent
    pub bytes_sent: u64,
    /// Total plaintext bytes received
    pub bytes_received: u64,
    /// Frames sent
    pub frames_sent: u64,
    /// Frames received
    pub frames_received: u64,
    /// Messages since the last rotation
    pub messages_since_rotation: u64,
    /// Current key version
    pub key_version: u64,
    /// Active stream count
    pub stream_count: usize,
    /// Session age
    pub uptime: Duration,
    /// Time since the last key rotation (or establishment)
    pub time_since_rotation: Duration,
}

/// An authenticated session with a remote peer.
pub struct Session {
    session_id: SessionId,
    local_node_id: NodeId,
    peer_node_id: NodeId,
    peer_addr: Option<SocketAddr>,
    capabilities: Vec<String>,
    state: SessionState,
    config: SessionConfig,

    /// Base key agreed during the handshake; per-stream contexts derive
    /// from it and it never rotates.
    base_key: SessionKey,
    /// Current frame-layer key (version `key_version`).
    key: SessionKey,
    key_version: u64,
    frame_crypto: SeedCrypto,
    prev_frame_crypto: Option<SeedCrypto>,
    grace_remaining: u32,

    send_sequence: u64,
    recv_sequence: u64,

    bytes_sent: u64,
    bytes_received: u64,
    frames_sent: u64,
    frames_received: u64,
    bytes_since_rotation: u64,
    messages_since_rotation: u64,
    decrypt_failures: u64,

    started_at: Instant,
    last_rotation: Instant,
    last_activity: Instant,

    streams: HashMap<u32, Stream>,
    next_stream_id: u32,
    resumption_token: Option<Vec<u8>>,
}

impl Session {
    /// Create a session from completed-handshake material.
    ///
    /// The session starts in `Handshake` state; call [`Self::activate`]
    /// once the final confirmation message is processed.
    #[must_use]
    pub fn new(
        session_id: SessionId,
        local_node_id: NodeId,
        peer_node_id: NodeId,
        key: SessionKey,
        capabilities: Vec<String>,
        config: SessionConfig,
    ) -> Self {
        let frame_crypto = SeedCrypto::new(key.as_bytes());
        let now = Instant::now();
        Self {
            session_id,
            local_node_id,
            peer_node_id,
            peer_addr: None,
            capabilities,
            state: SessionState::Handshake,
            config,
            base_key: key.clone(),
            key,
            key_version: 0,
            frame_crypto,
            prev_frame_crypto: None,
            grace_remaining: 0,
            send_sequence: 0,
            recv_sequence: 0,
            bytes_sent: 0,
            bytes_received: 0,
            frames_sent: 0,
            frames_received: 0,
            bytes_since_rotation: 0,
            messages_since_rotation: 0,
            decrypt_failures: 0,
            started_at: now,
            last_rotation: now,
            last_activity: now,
            streams: HashMap::new(),
            next_stream_id: FIRST_STREAM_ID,
            resumption_token: None,
        }
    }

    /// Session identifier.
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Peer node identifier.
    #[must_use]
    pub fn peer_node_id(&self) -> NodeId {
        self.peer_node_id
    }

    /// Local node identifier.
    #[must_use]
    pub fn local_node_id(&self) -> NodeId {
        self.local_node_id
    }

    /// Negotiated capability strings.
    #[must_use]
    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Current key version.
    #[must_use]
    pub fn key_version(&self) -> u64 {
        self.key_version
    }

    /// Peer's network address, once known.
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Record the peer's network address.
    pub fn set_peer_addr(&mut self, addr: SocketAddr) {
        self.peer_addr = Some(addr);
    }

    /// Opaque resumption token, if one was issued.
    #[must_use]
    pub fn resumption_token(&self) -> Option<&[u8]> {
        self.resumption_token.as_deref()
    }

    /// Attach a resumption token.
    pub fn set_resumption_token(&mut self, token: Vec<u8>) {
        self.resumption_token = Some(token);
    }

    /// Confirm the handshake: the session becomes active.
    pub fn activate(&mut self) {
        if matches!(self.state, SessionState::Init | SessionState::Handshake) {
            self.state = SessionState::Active;
            tracing::debug!(session = %hex::encode(self.session_id), "session active");
        }
    }

    /// Whether the session is active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    /// Whether the session is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// Whether the peer has been silent past the idle timeout.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.last_activity.elapsed() >= self.config.idle_timeout
    }

    /// Consecutive decrypt failures observed on this session.
    #[must_use]
    pub fn decrypt_failures(&self) -> u64 {
        self.decrypt_failures
    }

    // ---- streams ------------------------------------------------------

    /// Open a new stream and return its consumer handle.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::InvalidState` unless the session is active.
    pub fn open_stream(&mut self) -> Result<StreamHandle, SessionError> {
        if self.state != SessionState::Active {
            return Err(SessionError::InvalidState("open_stream requires active"));
        }
        let id = self.next_stream_id;
        self.next_stream_id += 1;
        let stream = Stream::new(id, self.session_id, &self.base_key);
        let handle = stream.handle();
        self.streams.insert(id, stream);
        tracing::debug!(session = %hex::encode(self.session_id), stream = id, "stream opened");
        Ok(handle)
    }

    /// Look up a stream.
    #[must_use]
    pub fn get_stream(&self, id: u32) -> Option<&Stream> {
        self.streams.get(&id)
    }

    /// Look up a stream mutably.
    pub fn get_stream_mut(&mut self, id: u32) -> Option<&mut Stream> {
        self.streams.get_mut(&id)
    }

    /// Consumer handle for an existing stream.
    #[must_use]
    pub fn stream_handle(&self, id: u32) -> Option<StreamHandle> {
        self.streams.get(&id).map(Stream::handle)
    }

    /// Close one stream, waking its receivers.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::UnknownStream` if the id is not present.
    pub fn close_stream(&mut self, id: u32) -> Result<(), SessionError> {
        match self.streams.get_mut(&id) {
            Some(stream) => {
                stream.close();
                Ok(())
            }
            None => Err(SessionError::UnknownStream(id)),
        }
    }

    /// Number of streams in the table.
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Close the session: close every stream, zeroize key material.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closing;
        for stream in self.streams.values_mut() {
            stream.close();
        }
        // Dropping the old keys zeroizes them.
        self.key = SessionKey::new([0u8; 32]);
        self.base_key = SessionKey::new([0u8; 32]);
        self.prev_frame_crypto = None;
        self.resumption_token = None;
        self.state = SessionState::Closed;
        tracing::info!(session = %hex::encode(self.session_id), "session closed");
    }

    // ---- key rotation -------------------------------------------------

    /// Whether any rotation threshold has been crossed.
    #[must_use]
    pub fn should_rotate(&self) -> bool {
        if self.state != SessionState::Active {
            return false;
        }
        if self.bytes_since_rotation >= self.config.rotation_data_threshold {
            tracing::info!("key rotation needed: data threshold reached");
            return true;
        }
        if self.last_rotation.elapsed() >= self.config.rotation_time_threshold {
            tracing::info!("key rotation needed: time threshold reached");
            return true;
        }
        if self.messages_since_rotation >= self.config.rotation_message_threshold {
            tracing::info!("key rotation needed: message threshold reached");
            return true;
        }
        false
    }

    /// Derive the key for the next version from the current key.
    ///
    /// Both peers compute the same value: the rotation nonce is the
    /// ever-increasing key version.
    #[must_use]
    pub fn derive_next_key(&self) -> SessionKey {
        derive_rotated_key(&self.key, self.key_version + 1)
    }

    /// Install a new session key.
    ///
    /// Atomic with respect to sends: after return, every outbound frame
    /// uses the new key. The previous key stays usable for inbound frames
    /// only during the configured grace window.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::InvalidState` unless the session is active.
    pub fn rotate_keys(&mut self, new_key: SessionKey) -> Result<(), SessionError> {
        if self.state != SessionState::Active {
            return Err(SessionError::InvalidState("rotate_keys requires active"));
        }
        self.state = SessionState::KeyRotating;

        let old_crypto = std::mem::replace(&mut self.frame_crypto, SeedCrypto::new(new_key.as_bytes()));
        self.prev_frame_crypto = Some(old_crypto);
        self.grace_remaining = self.config.rotation_grace_frames;
        self.key = new_key;
        self.key_version += 1;
        self.bytes_since_rotation = 0;
        self.messages_since_rotation = 0;
        self.last_rotation = Instant::now();

        self.state = SessionState::Active;
        tracing::info!(
            session = %hex::encode(self.session_id),
            version = self.key_version,
            "key rotation completed"
        );
        Ok(())
    }

    // ---- sequence and counters ----------------------------------------

    /// Allocate the next outbound sequence number.
    pub fn next_send_sequence(&mut self) -> u64 {
        let seq = self.send_sequence;
        self.send_sequence += 1;
        seq
    }

    /// Note an inbound sequence number. Gaps are tolerated; the cursor
    /// tracks the highest contiguous point for diagnostics only.
    pub fn note_recv_sequence(&mut self, sequence: u64) {
        if sequence == self.recv_sequence {
            self.recv_sequence += 1;
        } else {
            tracing::trace!(
                expected = self.recv_sequence,
                got = sequence,
                "out-of-order session sequence"
            );
        }
    }

    /// Record outbound traffic.
    pub fn record_sent(&mut self, bytes: u64) {
        self.bytes_sent += bytes;
        self.frames_sent += 1;
        self.bytes_since_rotation += bytes;
        self.messages_since_rotation += 1;
        self.last_activity = Instant::now();
    }

    /// Record inbound traffic.
    pub fn record_received(&mut self, bytes: u64) {
        self.bytes_received += bytes;
        self.frames_received += 1;
        self.last_activity = Instant::now();
    }

    // ---- data path ----------------------------------------------------

    /// Encrypt `data` for `stream_id` and produce wire-ready frame bytes.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::UnknownStream` for unopened streams, stream
    /// flow-control errors, or frame encode errors wrapped as
    /// `SessionError::MalformedPayload`.
    pub fn encode_data_frame(
        &mut self,
        stream_id: u32,
        data: &[u8],
    ) -> Result<Vec<u8>, SessionError> {
        if self.state != SessionState::Active {
            return Err(SessionError::InvalidState("send requires active session"));
        }
        let stream = self
            .streams
            .get_mut(&stream_id)
            .ok_or(SessionError::UnknownStream(stream_id))?;
        let (_, segment) = stream
            .prepare_send(data)
            .map_err(|e| SessionError::MalformedPayload(e.to_string()))?;

        let mut plaintext = Vec::with_capacity(4 + segment.len());
        plaintext.extend_from_slice(&stream_id.to_be_bytes());
        plaintext.extend_from_slice(&segment);

        let sequence = self.next_send_sequence();
        let mut frame = Frame::new(FrameType::Data, self.session_id, sequence, Vec::new());
        let ad = frame_ad_context(&frame);
        let (ciphertext, metadata) = self
            .frame_crypto
            .encrypt(&plaintext, &ad)
            .map_err(|_| SessionError::DecryptFailure)?;

        let mut payload = Vec::with_capacity(metadata.len() + ciphertext.len());
        payload.extend_from_slice(&metadata);
        payload.extend_from_slice(&ciphertext);
        frame.payload = payload;

        let bytes = frame
            .encode()
            .map_err(|e| SessionError::MalformedPayload(e.to_string()))?;
        self.record_sent(data.len() as u64);
        Ok(bytes)
    }

    /// Grant receive credit on a stream and deliver any chunks that were
    /// parked waiting for it, in sender order.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::UnknownStream` for unopened streams, or
    /// `SessionError::FlowControl` if the grant still does not cover the
    /// parked batch (nothing is consumed).
    pub fn grant_recv_credit(
        &mut self,
        stream_id: u32,
        amount: u64,
    ) -> Result<Vec<Vec<u8>>, SessionError> {
        let stream = self
            .streams
            .get_mut(&stream_id)
            .ok_or(SessionError::UnknownStream(stream_id))?;
        stream.add_recv_credit(amount);
        let chunks = stream.flush_ready().map_err(stream_delivery_error)?;
        let received: u64 = chunks.iter().map(|c| c.len() as u64).sum();
        if received > 0 {
            self.record_received(received);
        }
        Ok(chunks)
    }

    /// Fragment `data` into as many data frames as the frame size cap
    /// requires, in stream order.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Self::encode_data_frame`].
    pub fn encode_data_frames(
        &mut self,
        stream_id: u32,
        data: &[u8],
    ) -> Result<Vec<Vec<u8>>, SessionError> {
        if data.is_empty() {
            return Ok(vec![self.encode_data_frame(stream_id, data)?]);
        }
        data.chunks(MAX_CHUNK_SIZE)
            .map(|chunk| self.encode_data_frame(stream_id, chunk))
            .collect()
    }

    /// Decrypt a data frame and deliver its chunks to the target stream.
    ///
    /// Returns `(stream_id, chunks)` for everything that became
    /// deliverable in order. Streams are opened implicitly on first
    /// receive. During the rotation grace window the previous key is tried
    /// once after a failure with the current key.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::DecryptFailure` when no key opens the
    /// payload, `SessionError::FlowControl` when the stream's receive
    /// window cannot take the ready batch (the chunks stay parked until
    /// [`Self::grant_recv_credit`]), or `SessionError::MalformedPayload`
    /// for structural problems after decryption.
    pub fn ingest_data_frame(
        &mut self,
        frame: &Frame,
    ) -> Result<(u32, Vec<Vec<u8>>), SessionError> {
        if matches!(self.state, SessionState::Closing | SessionState::Closed) {
            return Err(SessionError::InvalidState("session is closing"));
        }
        if frame.payload.len() < XCHACHA_NONCE_SIZE {
            return Err(SessionError::MalformedPayload(
                "payload shorter than nonce".into(),
            ));
        }
        let (metadata, ciphertext) = frame.payload.split_at(XCHACHA_NONCE_SIZE);
        let ad = frame_ad_context(frame);

        let plaintext = match self.frame_crypto.decrypt(ciphertext, metadata, &ad) {
            Ok(pt) => pt,
            Err(_) => {
                let retried = if self.grace_remaining > 0 {
                    self.prev_frame_crypto
                        .as_ref()
                        .and_then(|prev| prev.decrypt(ciphertext, metadata, &ad).ok())
                } else {
                    None
                };
                match retried {
                    Some(pt) => pt,
                    None => {
                        self.decrypt_failures += 1;
                        return Err(SessionError::DecryptFailure);
                    }
                }
            }
        };

        // The grace window is counted in received frames since rotation.
        if self.prev_frame_crypto.is_some() {
            self.grace_remaining = self.grace_remaining.saturating_sub(1);
            if self.grace_remaining == 0 {
                self.prev_frame_crypto = None;
            }
        }

        if plaintext.len() < 4 {
            return Err(SessionError::MalformedPayload(
                "missing stream id prefix".into(),
            ));
        }
        let stream_id = u32::from_be_bytes(
            plaintext[..4]
                .try_into()
                .map_err(|_| SessionError::MalformedPayload("stream id prefix".into()))?,
        );
        let segment = &plaintext[4..];
        if segment.len() < 9 {
            return Err(SessionError::MalformedPayload("truncated segment".into()));
        }
        let chunk_sequence = u64::from_be_bytes(
            segment[1..9]
                .try_into()
                .map_err(|_| SessionError::MalformedPayload("chunk header".into()))?,
        );

        let base_key = self.base_key.clone();
        let stream = self
            .streams
            .entry(stream_id)
            .or_insert_with(|| Stream::new(stream_id, frame.session_id, &base_key));
        let chunks = stream
            .deliver_segment(segment, chunk_sequence)
            .map_err(stream_delivery_error)?;

        self.note_recv_sequence(frame.sequence);
        let received: u64 = chunks.iter().map(|c| c.len() as u64).sum();
        self.record_received(received);
        self.decrypt_failures = 0;
        Ok((stream_id, chunks))
    }

    /// Statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            state: self.state,
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
            frames_sent: self.frames_sent,
            frames_received: self.frames_received,
            messages_since_rotation: self.messages_since_rotation,
            key_version: self.key_version,
            stream_count: self.streams.len(),
            uptime: self.started_at.elapsed(),
            time_since_rotation: self.last_rotation.elapsed(),
        }
    }
}

/// Associated-data context binding a payload to its frame header.
fn frame_ad_context(frame: &Frame) -> AdContext {
    AdContext::purpose("frame_payload").with_bytes("frame_ad", frame.associated_data().to_vec())
}

/// Map stream delivery errors to their session-level kinds.
fn stream_delivery_error(e: crate::error::StreamError) -> SessionError {
    match e {
        crate::error::StreamError::DecryptFailure => SessionError::DecryptFailure,
        crate::error::StreamError::FlowControl { needed, available } => {
            SessionError::FlowControl { needed, available }
        }
        other => SessionError::MalformedPayload(other.to_string()),
    }
}

/// Derive the rotated key for `version` from the current key.
#[must_use]
pub fn derive_rotated_key(current: &SessionKey, version: u64) -> SessionKey {
    let provider = SeedCrypto::new(current.as_bytes());
    let ctx = AdContext::purpose("key_rotation").with_u64("rotation_nonce", version);
    let bytes = provider
        .derive_key(32, &ctx)
        .expect("32 is a valid key length");
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    SessionKey::new(key)
}
