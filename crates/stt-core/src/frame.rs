//! Frame encoding and decoding for the STT wire protocol.
//!
//! Layout:
//! `magic(2) | length(varint) | type(1) | flags(1) | session_id(8) |
//! sequence(8) | timestamp(8) | reserved(2) | payload`.
//!
//! The length varint covers everything after itself (fixed header plus
//! payload). All multi-byte fields are big-endian. The associated data for
//! AEAD is the fixed header minus the reserved field: exactly 26 bytes.

use crate::error::FrameError;
use crate::varint::{decode_varint, encode_varint};
use crate::{FRAME_AD_SIZE, FRAME_HEADER_SIZE, MAX_FRAME_SIZE, STT_MAGIC, SessionId};
use std::time::{SystemTime, UNIX_EPOCH};

/// Frame types carried in the type byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// Handshake protocol message
    Handshake,
    /// Application data
    Data,
    /// Caller-defined type in the reserved range `0x80..=0xFF`
    Custom(u8),
}

impl FrameType {
    /// Wire value of the frame type.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Handshake => 0x00,
            Self::Data => 0x01,
            Self::Custom(v) => v,
        }
    }

    /// Parse a wire value.
    ///
    /// # Errors
    ///
    /// Returns `FrameError::HeaderParse` for values outside the defined set
    /// and the custom range.
    pub fn from_u8(value: u8) -> Result<Self, FrameError> {
        match value {
            0x00 => Ok(Self::Handshake),
            0x01 => Ok(Self::Data),
            0x80..=0xFF => Ok(Self::Custom(value)),
            other => Err(FrameError::HeaderParse(format!(
                "unknown frame type 0x{other:02X}"
            ))),
        }
    }
}

/// Frame flags bitmap
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(
    /// Raw bitmap value
    pub u8,
);

impl FrameFlags {
    /// First chunk of a stream
    pub const STREAM_INIT: u8 = 0b0000_0001;
    /// Intermediate stream chunk
    pub const STREAM_CHUNK: u8 = 0b0000_0010;
    /// Final chunk of a stream
    pub const STREAM_END: u8 = 0b0000_0100;

    /// Create empty flags.
    #[must_use]
    pub fn new() -> Self {
        Self(0)
    }

    /// Set the stream-init bit.
    #[must_use]
    pub fn with_stream_init(mut self) -> Self {
        self.0 |= Self::STREAM_INIT;
        self
    }

    /// Set the stream-end bit.
    #[must_use]
    pub fn with_stream_end(mut self) -> Self {
        self.0 |= Self::STREAM_END;
        self
    }

    /// Check the stream-init bit.
    #[must_use]
    pub fn is_stream_init(self) -> bool {
        self.0 & Self::STREAM_INIT != 0
    }

    /// Check the stream-end bit.
    #[must_use]
    pub fn is_stream_end(self) -> bool {
        self.0 & Self::STREAM_END != 0
    }

    /// Raw byte value.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self.0
    }
}

/// An STT protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type
    pub frame_type: FrameType,
    /// Flags bitmap
    pub flags: FrameFlags,
    /// Session identifier (all zeros before a session exists)
    pub session_id: SessionId,
    /// Session-scope sequence number
    pub sequence: u64,
    /// Sender timestamp, milliseconds since the Unix epoch
    pub timestamp: u64,
    /// Opaque payload
    pub payload: Vec<u8>,
}

impl Frame {
    /// Build a frame stamped with the current time.
    #[must_use]
    pub fn new(
        frame_type: FrameType,
        session_id: SessionId,
        sequence: u64,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            frame_type,
            flags: FrameFlags::new(),
            session_id,
            sequence,
            timestamp: now_millis(),
            payload,
        }
    }

    /// Encode to wire bytes.
    ///
    /// # Errors
    ///
    /// Returns `FrameError::FrameTooLarge` if header plus payload exceeds
    /// [`MAX_FRAME_SIZE`].
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let total_length = FRAME_HEADER_SIZE + self.payload.len();
        if total_length > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge {
                size: total_length,
                max: MAX_FRAME_SIZE,
            });
        }

        let length_bytes = encode_varint(total_length as u64);
        let mut out = Vec::with_capacity(2 + length_bytes.len() + total_length);
        out.extend_from_slice(&STT_MAGIC);
        out.extend_from_slice(&length_bytes);
        out.push(self.frame_type.as_u8());
        out.push(self.flags.as_u8());
        out.extend_from_slice(&self.session_id);
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&[0u8; 2]); // Reserved
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Decode a frame from the start of `data`.
    ///
    /// Returns the frame and the number of bytes consumed, so a caller can
    /// process concatenated frames.
    ///
    /// # Errors
    ///
    /// Returns `InvalidMagic`, `BadLength`, `ShortBuffer`, or `HeaderParse`
    /// depending on where parsing fails.
    pub fn decode(data: &[u8]) -> Result<(Self, usize), FrameError> {
        if data.len() < 2 {
            return Err(FrameError::ShortBuffer {
                needed: 2,
                have: data.len(),
            });
        }
        if data[..2] != STT_MAGIC {
            return Err(FrameError::InvalidMagic(data[0], data[1]));
        }

        let (total_length, varint_size) = decode_varint(&data[2..])?;
        let total_length = usize::try_from(total_length)
            .map_err(|_| FrameError::BadLength("length exceeds addressable size".into()))?;
        if total_length < FRAME_HEADER_SIZE {
            return Err(FrameError::BadLength(format!(
                "frame length {total_length} smaller than header {FRAME_HEADER_SIZE}"
            )));
        }
        if total_length > MAX_FRAME_SIZE {
            return Err(FrameError::BadLength(format!(
                "frame length {total_length} exceeds maximum {MAX_FRAME_SIZE}"
            )));
        }

        let header_offset = 2 + varint_size;
        let frame_end = header_offset + total_length;
        if data.len() < frame_end {
            return Err(FrameError::ShortBuffer {
                needed: frame_end,
                have: data.len(),
            });
        }

        let header = &data[header_offset..header_offset + FRAME_HEADER_SIZE];
        let frame_type = FrameType::from_u8(header[0])?;
        let flags = FrameFlags(header[1]);
        let mut session_id = [0u8; 8];
        session_id.copy_from_slice(&header[2..10]);
        let sequence = u64::from_be_bytes(
            header[10..18]
                .try_into()
                .map_err(|_| FrameError::HeaderParse("sequence field".into()))?,
        );
        let timestamp = u64::from_be_bytes(
            header[18..26]
                .try_into()
                .map_err(|_| FrameError::HeaderParse("timestamp field".into()))?,
        );

        let payload = data[header_offset + FRAME_HEADER_SIZE..frame_end].to_vec();

        Ok((
            Self {
                frame_type,
                flags,
                session_id,
                sequence,
                timestamp,
                payload,
            },
            frame_end,
        ))
    }

    /// Associated data bound to the payload ciphertext:
    /// `type | flags | session_id | sequence | timestamp`.
    #[must_use]
    pub fn associated_data(&self) -> [u8; FRAME_AD_SIZE] {
        let mut ad = [0u8; FRAME_AD_SIZE];
        ad[0] = self.frame_type.as_u8();
        ad[1] = self.flags.as_u8();
        ad[2..10].copy_from_slice(&self.session_id);
        ad[10..18].copy_from_slice(&self.sequence.to_be_bytes());
        ad[18..26].copy_from_slice(&self.timestamp.to_be_bytes());
        ad
    }
}

/// Milliseconds since the Unix epoch.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame() -> Frame {
        Frame {
            frame_type: FrameType::Data,
            flags: FrameFlags::new(),
            session_id: [1, 2, 3, 4, 5, 6, 7, 8],
            sequence: 42,
            timestamp: 1_700_000_000_000,
            payload: b"hello".to_vec(),
        }
    }

    #[test]
    fn test_encode_starts_with_magic() {
        let encoded = sample_frame().encode().unwrap();
        assert_eq!(encoded[0], 0x53);
        assert_eq!(encoded[1], 0x54);
    }

    #[test]
    fn test_roundtrip() {
        let frame = sample_frame();
        let encoded = frame.encode().unwrap();
        let (decoded, consumed) = Frame::decode(&encoded).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn test_roundtrip_handshake_type() {
        let mut frame = sample_frame();
        frame.frame_type = FrameType::Handshake;
        let encoded = frame.encode().unwrap();
        let (decoded, _) = Frame::decode(&encoded).unwrap();
        assert_eq!(decoded.frame_type, FrameType::Handshake);
    }

    #[test]
    fn test_custom_frame_types() {
        for value in [0x80u8, 0xAB, 0xFF] {
            let mut frame = sample_frame();
            frame.frame_type = FrameType::Custom(value);
            let encoded = frame.encode().unwrap();
            let (decoded, _) = Frame::decode(&encoded).unwrap();
            assert_eq!(decoded.frame_type, FrameType::Custom(value));
        }
    }

    #[test]
    fn test_unknown_frame_type_rejected() {
        let mut encoded = sample_frame().encode().unwrap();
        // Type byte sits right after magic + 2-byte varint boundary check:
        // payload is small, so the varint is 1 byte and type is at offset 3.
        encoded[3] = 0x42;
        assert!(matches!(
            Frame::decode(&encoded),
            Err(FrameError::HeaderParse(_))
        ));
    }

    #[test]
    fn test_invalid_magic() {
        let mut encoded = sample_frame().encode().unwrap();
        encoded[0] = b'X';
        assert!(matches!(
            Frame::decode(&encoded),
            Err(FrameError::InvalidMagic(b'X', b'T'))
        ));
    }

    #[test]
    fn test_short_buffer() {
        let encoded = sample_frame().encode().unwrap();
        assert!(matches!(
            Frame::decode(&encoded[..encoded.len() - 1]),
            Err(FrameError::ShortBuffer { .. })
        ));
        assert!(matches!(
            Frame::decode(&encoded[..1]),
            Err(FrameError::ShortBuffer { .. })
        ));
    }

    #[test]
    fn test_length_smaller_than_header() {
        let mut bytes = STT_MAGIC.to_vec();
        bytes.extend_from_slice(&encode_varint(10));
        bytes.extend_from_slice(&[0u8; 10]);
        assert!(matches!(
            Frame::decode(&bytes),
            Err(FrameError::BadLength(_))
        ));
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut bytes = STT_MAGIC.to_vec();
        bytes.extend_from_slice(&encode_varint(100_000));
        bytes.extend_from_slice(&[0u8; 64]);
        assert!(matches!(
            Frame::decode(&bytes),
            Err(FrameError::BadLength(_))
        ));
    }

    #[test]
    fn test_encode_too_large() {
        let mut frame = sample_frame();
        frame.payload = vec![0u8; MAX_FRAME_SIZE];
        assert!(matches!(
            frame.encode(),
            Err(FrameError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_max_payload_fits() {
        let mut frame = sample_frame();
        frame.payload = vec![0xAA; MAX_FRAME_SIZE - FRAME_HEADER_SIZE];
        let encoded = frame.encode().unwrap();
        let (decoded, _) = Frame::decode(&encoded).unwrap();
        assert_eq!(decoded.payload.len(), MAX_FRAME_SIZE - FRAME_HEADER_SIZE);
    }

    #[test]
    fn test_empty_payload() {
        let mut frame = sample_frame();
        frame.payload.clear();
        let encoded = frame.encode().unwrap();
        let (decoded, consumed) = Frame::decode(&encoded).unwrap();
        assert!(decoded.payload.is_empty());
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn test_associated_data_layout() {
        let frame = sample_frame();
        let ad = frame.associated_data();
        assert_eq!(ad.len(), FRAME_AD_SIZE);
        assert_eq!(ad[0], 0x01); // Data
        assert_eq!(ad[1], 0x00);
        assert_eq!(&ad[2..10], &frame.session_id);
        assert_eq!(&ad[10..18], &42u64.to_be_bytes());
        assert_eq!(&ad[18..26], &1_700_000_000_000u64.to_be_bytes());
    }

    #[test]
    fn test_associated_data_differs_on_sequence() {
        let frame = sample_frame();
        let mut other = frame.clone();
        other.sequence = 43;
        assert_ne!(frame.associated_data(), other.associated_data());
    }

    #[test]
    fn test_concatenated_frames() {
        let frame = sample_frame();
        let mut buffer = frame.encode().unwrap();
        let first_len = buffer.len();
        buffer.extend_from_slice(&frame.encode().unwrap());

        let (first, consumed) = Frame::decode(&buffer).unwrap();
        assert_eq!(consumed, first_len);
        let (second, _) = Frame::decode(&buffer[consumed..]).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_flags_roundtrip() {
        let mut frame = sample_frame();
        frame.flags = FrameFlags::new().with_stream_init().with_stream_end();
        let encoded = frame.encode().unwrap();
        let (decoded, _) = Frame::decode(&encoded).unwrap();
        assert!(decoded.flags.is_stream_init());
        assert!(decoded.flags.is_stream_end());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_decode_never_panics(data in prop::collection::vec(any::<u8>(), 0..2048)) {
                let _ = Frame::decode(&data);
            }

            #[test]
            fn prop_roundtrip(
                session_id in any::<[u8; 8]>(),
                sequence in any::<u64>(),
                timestamp in any::<u64>(),
                flags in any::<u8>(),
                payload in prop::collection::vec(any::<u8>(), 0..1024)
            ) {
                let frame = Frame {
                    frame_type: FrameType::Data,
                    flags: FrameFlags(flags),
                    session_id,
                    sequence,
                    timestamp,
                    payload,
                };
                let encoded = frame.encode().unwrap();
                let (decoded, consumed) = Frame::decode(&encoded).unwrap();
                prop_assert_eq!(decoded, frame);
                prop_assert_eq!(consumed, encoded.len());
            }
        }
    }
}
