//! DHT datagram codec.
//!
//! Wire layout: `request_id(8) || opcode(1) || payload`. Responses echo
//! the request id so the sender can match them to waiting futures. The
//! payload is a bincode-serialized tagged record; the opcode byte is
//! authoritative for dispatch and is validated against the payload tag on
//! decode.

use crate::dht::node_id::NodeId;
use crate::dht::routing::Contact;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Message codec errors
#[derive(Debug, Error)]
pub enum MessageError {
    /// Datagram shorter than the 9-byte envelope
    #[error("datagram too short: {0} bytes")]
    TooShort(usize),

    /// Unknown opcode byte
    #[error("unknown opcode: 0x{0:02X}")]
    UnknownOpcode(u8),

    /// Payload failed to (de)serialize
    #[error("payload codec error: {0}")]
    Codec(String),

    /// Opcode byte disagrees with the payload tag
    #[error("opcode {opcode:?} does not match payload {payload}")]
    OpcodeMismatch {
        /// Envelope opcode
        opcode: Opcode,
        /// Payload variant name
        payload: &'static str,
    },
}

/// Request identifier echoed by responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub [u8; 8]);

impl RequestId {
    /// Byte view.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

/// DHT RPC opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Liveness probe
    Ping = 1,
    /// Liveness answer
    Pong = 2,
    /// Request the k closest contacts to a target
    FindNode = 3,
    /// Closest-contacts answer
    FoundNode = 4,
    /// Store a value or provider record
    Store = 5,
    /// Store acknowledgement
    StoreAck = 6,
    /// Request a value by content id
    FindValue = 7,
    /// Value, providers, or closest-contacts answer
    FoundValue = 8,
}

impl Opcode {
    fn from_u8(value: u8) -> Result<Self, MessageError> {
        match value {
            1 => Ok(Self::Ping),
            2 => Ok(Self::Pong),
            3 => Ok(Self::FindNode),
            4 => Ok(Self::FoundNode),
            5 => Ok(Self::Store),
            6 => Ok(Self::StoreAck),
            7 => Ok(Self::FindValue),
            8 => Ok(Self::FoundValue),
            other => Err(MessageError::UnknownOpcode(other)),
        }
    }
}

/// Serializable contact record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactInfo {
    /// Peer node id
    pub node_id: NodeId,
    /// Reachable host
    pub host: String,
    /// Reachable port
    pub port: u16,
}

impl From<&Contact> for ContactInfo {
    fn from(c: &Contact) -> Self {
        Self {
            node_id: c.node_id,
            host: c.host.clone(),
            port: c.port,
        }
    }
}

impl From<ContactInfo> for Contact {
    fn from(info: ContactInfo) -> Self {
        Contact::new(info.node_id, info.host, info.port)
    }
}

/// Body of a STORE request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreBody {
    /// Store raw value bytes at the receiver
    Data(Vec<u8>),
    /// Record the given contact as a provider for the content id
    Provider(ContactInfo),
}

/// Body of a FOUND_VALUE response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FoundValueBody {
    /// The value itself
    Value(Vec<u8>),
    /// Known providers for the content
    Providers(Vec<ContactInfo>),
    /// Closest contacts to keep looking through
    Contacts(Vec<ContactInfo>),
}

/// Tagged DHT RPC payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DhtPayload {
    /// Liveness probe
    Ping {
        /// Sender id
        sender: ContactInfo,
    },
    /// Liveness answer
    Pong {
        /// Sender id
        sender: ContactInfo,
    },
    /// Closest-contact query
    FindNode {
        /// Sender id
        sender: ContactInfo,
        /// Lookup target
        target: NodeId,
    },
    /// Closest-contact answer
    FoundNode {
        /// Sender id
        sender: ContactInfo,
        /// Up to k closest contacts
        contacts: Vec<ContactInfo>,
    },
    /// Value or provider storage
    Store {
        /// Sender id
        sender: ContactInfo,
        /// Content id the body attaches to
        content_id: NodeId,
        /// What to store
        body: StoreBody,
    },
    /// Storage acknowledgement
    StoreAck {
        /// Sender id
        sender: ContactInfo,
        /// Whether the receiver stored it
        stored: bool,
    },
    /// Value query
    FindValue {
        /// Sender id
        sender: ContactInfo,
        /// Content id sought
        content_id: NodeId,
    },
    /// Value answer
    FoundValue {
        /// Sender id
        sender: ContactInfo,
        /// Value, providers, or contacts
        body: FoundValueBody,
    },
}

impl DhtPayload {
    /// The opcode this payload travels under.
    #[must_use]
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Ping { .. } => Opcode::Ping,
            Self::Pong { .. } => Opcode::Pong,
            Self::FindNode { .. } => Opcode::FindNode,
            Self::FoundNode { .. } => Opcode::FoundNode,
            Self::Store { .. } => Opcode::Store,
            Self::StoreAck { .. } => Opcode::StoreAck,
            Self::FindValue { .. } => Opcode::FindValue,
            Self::FoundValue { .. } => Opcode::FoundValue,
        }
    }

    /// Variant name, for diagnostics.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ping { .. } => "Ping",
            Self::Pong { .. } => "Pong",
            Self::FindNode { .. } => "FindNode",
            Self::FoundNode { .. } => "FoundNode",
            Self::Store { .. } => "Store",
            Self::StoreAck { .. } => "StoreAck",
            Self::FindValue { .. } => "FindValue",
            Self::FoundValue { .. } => "FoundValue",
        }
    }

    /// The sender contact embedded in any payload.
    #[must_use]
    pub fn sender(&self) -> &ContactInfo {
        match self {
            Self::Ping { sender }
            | Self::Pong { sender }
            | Self::FindNode { sender, .. }
            | Self::FoundNode { sender, .. }
            | Self::Store { sender, .. }
            | Self::StoreAck { sender, .. }
            | Self::FindValue { sender, .. }
            | Self::FoundValue { sender, .. } => sender,
        }
    }
}

/// Encode a datagram: `request_id || opcode || payload`.
///
/// # Errors
///
/// Returns `MessageError::Codec` on serialization failure.
pub fn encode_datagram(request_id: RequestId, payload: &DhtPayload) -> Result<Vec<u8>, MessageError> {
    let body = bincode::serialize(payload).map_err(|e| MessageError::Codec(e.to_string()))?;
    let mut out = Vec::with_capacity(9 + body.len());
    out.extend_from_slice(request_id.as_bytes());
    out.push(payload.opcode() as u8);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode a datagram, validating the opcode against the payload tag.
///
/// # Errors
///
/// Returns envelope or codec errors as appropriate.
pub fn decode_datagram(data: &[u8]) -> Result<(RequestId, DhtPayload), MessageError> {
    if data.len() < 9 {
        return Err(MessageError::TooShort(data.len()));
    }
    let mut id = [0u8; 8];
    id.copy_from_slice(&data[..8]);
    let opcode = Opcode::from_u8(data[8])?;
    let payload: DhtPayload =
        bincode::deserialize(&data[9..]).map_err(|e| MessageError::Codec(e.to_string()))?;
    if payload.opcode() != opcode {
        return Err(MessageError::OpcodeMismatch {
            opcode,
            payload: payload.name(),
        });
    }
    Ok((RequestId(id), payload))
}
