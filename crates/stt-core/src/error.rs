//! Error types for the STT core protocol.

use thiserror::Error;

/// Top-level core errors
#[derive(Debug, Error)]
pub enum Error {
    /// Frame codec error
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Stream-level error
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    /// Session-level error
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Handshake error
    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// Cryptographic error
    #[error("crypto error: {0}")]
    Crypto(#[from] stt_crypto::CryptoError),
}

/// Frame codec errors
#[derive(Debug, Error)]
pub enum FrameError {
    /// Magic prefix mismatch
    #[error("invalid magic bytes: expected 0x5354, got 0x{0:02X}{1:02X}")]
    InvalidMagic(u8, u8),

    /// Buffer does not hold the full frame
    #[error("short buffer: need {needed} bytes, have {have}")]
    ShortBuffer {
        /// Bytes required
        needed: usize,
        /// Bytes available
        have: usize,
    },

    /// Length varint is malformed or inconsistent
    #[error("bad length field: {0}")]
    BadLength(String),

    /// Fixed header fields could not be parsed
    #[error("header parse failure: {0}")]
    HeaderParse(String),

    /// Encoded frame would exceed the configured maximum
    #[error("frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Encoded size
        size: usize,
        /// Configured maximum
        max: usize,
    },
}

/// Stream and stream-codec errors
#[derive(Debug, Error)]
pub enum StreamError {
    /// Insufficient flow-control credit for the send
    #[error("flow control: need {needed} credit, have {available}")]
    FlowControl {
        /// Credit required
        needed: u64,
        /// Credit available
        available: u64,
    },

    /// Receive deadline expired
    #[error("receive timeout")]
    Timeout,

    /// Operation on a closed stream
    #[error("stream closed")]
    Closed,

    /// Segment bytes are structurally invalid
    #[error("invalid segment: {0}")]
    InvalidSegment(String),

    /// Segment failed decryption or authentication
    #[error("segment decrypt failure")]
    DecryptFailure,
}

impl From<stt_crypto::CryptoError> for StreamError {
    fn from(_: stt_crypto::CryptoError) -> Self {
        StreamError::DecryptFailure
    }
}

/// Session errors
#[derive(Debug, Error)]
pub enum SessionError {
    /// Invalid state for the requested operation
    #[error("invalid state for operation: {0}")]
    InvalidState(&'static str),

    /// Unknown stream id
    #[error("unknown stream: {0}")]
    UnknownStream(u32),

    /// Frame payload failed session-level decryption
    #[error("frame decrypt failure")]
    DecryptFailure,

    /// A stream's receive window is exhausted; its chunks stay parked in
    /// the reorder buffer until credit is granted
    #[error("receive flow control: need {needed} credit, have {available}")]
    FlowControl {
        /// Credit the ready batch requires
        needed: u64,
        /// Credit available on the stream
        available: u64,
    },

    /// Frame payload is structurally invalid after decryption
    #[error("malformed data payload: {0}")]
    MalformedPayload(String),

    /// Key rotation failed
    #[error("key rotation failed: {0}")]
    RotationFailed(String),
}

/// Handshake errors
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Message arrived in a state that cannot accept it
    #[error("cannot handle {message} in state {state}")]
    WrongState {
        /// Incoming message kind
        message: &'static str,
        /// Current engine state
        state: &'static str,
    },

    /// Peer failed verification; the engine has moved to FAILED
    #[error("handshake rejected: {0}")]
    Rejected(&'static str),

    /// Message bytes could not be parsed
    #[error("malformed handshake message: {0}")]
    Malformed(String),

    /// No completed key material is available
    #[error("handshake not completed")]
    NotCompleted,

    /// Peer did not answer in time
    #[error("handshake timeout")]
    Timeout,
}

/// Node-level errors surfaced through the public API
#[derive(Debug, Error)]
pub enum NodeError {
    /// Node has not been started
    #[error("node not started")]
    NotStarted,

    /// Data frame referenced an unknown session
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Transport failure
    #[error("transport error: {0}")]
    Transport(#[from] stt_transport::TransportError),

    /// Handshake failure while connecting
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// Session failure
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Stream failure
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// Frame codec failure
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// Chamber failure
    #[error(transparent)]
    Chamber(#[from] ChamberError),
}

/// Chamber (encrypted store) errors
#[derive(Debug, Error)]
pub enum ChamberError {
    /// Filesystem failure
    #[error("chamber I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Encryption or decryption failure
    #[error("chamber crypto error: {0}")]
    Crypto(#[from] stt_crypto::CryptoError),

    /// Stored blob is structurally invalid
    #[error("corrupt chamber entry: {0}")]
    Corrupt(String),
}
