//! # STT Core
//!
//! Core protocol implementation for STT (Secure Transit Transport).
//!
//! This crate provides:
//! - **Frame codec**: the STT wire frame with varint length and AEAD
//!   associated data
//! - **Stream codec**: fragmentation of byte sequences into encrypted,
//!   sequenced, reorderable segments
//! - **Streams**: ordered byte channels with credit-based flow control
//! - **Sessions**: authenticated contexts holding the session key, stream
//!   table, and key-rotation accounting
//! - **Handshake**: the four-message pre-shared-seed authentication protocol
//! - **Chamber**: encrypted on-disk storage for key material and session
//!   records
//! - **Node**: the orchestration layer wiring handshake, sessions, and the
//!   UDP transport together
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                  Node (orchestration)                  │
//! │   dispatcher, handshake driving, receive queue         │
//! ├────────────────────────────────────────────────────────┤
//! │                       Session                          │
//! │   (session key, key rotation, stream table)            │
//! ├────────────────────────────────────────────────────────┤
//! │                       Streams                          │
//! │   (ordered, credit-controlled, per-stream crypto)      │
//! ├────────────────────────────────────────────────────────┤
//! │                       Frames                           │
//! │   (magic ‖ varint length ‖ header ‖ payload)           │
//! └────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chamber;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod node;
pub mod serialize;
pub mod session;
pub mod stream;
pub mod stream_codec;
pub mod varint;

pub use chamber::{Chamber, SessionRecord};
pub use error::{
    ChamberError, Error, FrameError, HandshakeError, NodeError, SessionError, StreamError,
};
pub use frame::{Frame, FrameFlags, FrameType};
pub use handshake::{Handshake, HandshakeManager, HandshakeState};
pub use node::{NodeConfig, NodeStats, ReceivedPacket, SessionManager, SttNode};
pub use session::{Session, SessionConfig, SessionState, SessionStats};
pub use stream::{Stream, StreamHandle, StreamState, StreamStats};
pub use stream_codec::{StreamDecoder, StreamEncoder};

/// Protocol magic bytes: ASCII `S`, `T`
pub const STT_MAGIC: [u8; 2] = *b"ST";

/// Maximum frame size (header + payload), chosen as the safe IPv4 UDP MTU
pub const MAX_FRAME_SIZE: usize = 1472;

/// Fixed header length after the varint: type(1) + flags(1) + session_id(8)
/// + sequence(8) + timestamp(8) + reserved(2)
pub const FRAME_HEADER_SIZE: usize = 28;

/// Associated-data length: the header minus the reserved field
pub const FRAME_AD_SIZE: usize = 26;

/// Session identifier length (bytes)
pub const SESSION_ID_SIZE: usize = 8;

/// Node identifier length (bytes)
pub const NODE_ID_SIZE: usize = 32;

/// Initial flow-control credit per stream direction (64 KiB)
pub const INITIAL_STREAM_CREDIT: u64 = 64 * 1024;

/// Session identifier type
pub type SessionId = [u8; SESSION_ID_SIZE];

/// Node identifier type
pub type NodeId = [u8; NODE_ID_SIZE];
