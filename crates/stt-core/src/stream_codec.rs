//! Stream segment encoder and decoder.
//!
//! A segment is the unit a stream's bytes travel in:
//! `empty_flag(1) | chunk_header(16) | ciphertext`. The encoder owns the
//! per-stream crypto context, so sequence numbers (the context's chunk
//! indices) are consecutive from 0 and every chunk gets a distinct nonce.
//! Empty chunks are carried as an encrypted one-byte placeholder with the
//! flag set, and decode back to an empty byte string.
//!
//! The decoder can operate in two modes: immediate (no sequence given,
//! chunks surface in arrival order) or ordered (explicit sequences buffer
//! in a reorder map and drain contiguously).

use crate::error::StreamError;
use std::collections::BTreeMap;
use stt_crypto::{CHUNK_HEADER_SIZE, ChunkHeader, CryptoProvider, SessionKey, StreamingContext};

/// Minimum encoded segment size: flag byte plus header
const SEGMENT_MIN_SIZE: usize = 1 + CHUNK_HEADER_SIZE;

/// Derive the seed for a stream's crypto context.
///
/// Both directions of a stream derive the same key; the per-context random
/// nonce salt keeps encryptor nonces disjoint.
#[must_use]
pub fn stream_context_seed(session_id: &[u8; 8], stream_id: u32) -> Vec<u8> {
    let mut seed = Vec::with_capacity(12);
    seed.extend_from_slice(session_id);
    seed.extend_from_slice(&stream_id.to_be_bytes());
    seed
}

/// Build a streaming crypto context for one (session, stream) pair from the
/// session key.
#[must_use]
pub fn stream_context(
    session_key: &SessionKey,
    session_id: &[u8; 8],
    stream_id: u32,
) -> StreamingContext {
    let provider = stt_crypto::SeedCrypto::new(session_key.as_bytes());
    provider.streaming_context(&stream_context_seed(session_id, stream_id))
}

/// Encrypts and sequences outbound chunks for one stream.
pub struct StreamEncoder {
    context: StreamingContext,
    chunks_encoded: u64,
    bytes_encoded: u64,
}

impl StreamEncoder {
    /// Create an encoder around a per-stream crypto context.
    #[must_use]
    pub fn new(context: StreamingContext) -> Self {
        Self {
            context,
            chunks_encoded: 0,
            bytes_encoded: 0,
        }
    }

    /// Encode one chunk into a segment.
    ///
    /// Returns the per-stream sequence number and the segment bytes.
    ///
    /// # Errors
    ///
    /// Returns `StreamError::DecryptFailure` only on AEAD failure (shared
    /// error kind with the decrypt path).
    pub fn encode_segment(&mut self, chunk: &[u8]) -> Result<(u64, Vec<u8>), StreamError> {
        let empty = chunk.is_empty();
        // A zero-length plaintext still needs a ciphertext body to
        // authenticate, so empty chunks carry one placeholder byte.
        let plaintext: &[u8] = if empty { &[0u8] } else { chunk };
        let (header, ciphertext) = self.context.encrypt_chunk(plaintext)?;

        let mut segment = Vec::with_capacity(SEGMENT_MIN_SIZE + ciphertext.len());
        segment.push(u8::from(empty));
        segment.extend_from_slice(&header.to_bytes());
        segment.extend_from_slice(&ciphertext);

        self.chunks_encoded += 1;
        self.bytes_encoded += chunk.len() as u64;
        Ok((header.chunk_index, segment))
    }

    /// Sequence number the next segment will carry.
    #[must_use]
    pub fn next_sequence(&self) -> u64 {
        self.context.next_index()
    }

    /// Total chunks encoded so far.
    #[must_use]
    pub fn chunks_encoded(&self) -> u64 {
        self.chunks_encoded
    }

    /// Total plaintext bytes encoded so far.
    #[must_use]
    pub fn bytes_encoded(&self) -> u64 {
        self.bytes_encoded
    }
}

/// Decrypts inbound segments and restores sender order.
pub struct StreamDecoder {
    context: StreamingContext,
    reorder: BTreeMap<u64, Vec<u8>>,
    next_expected: u64,
    chunks_decoded: u64,
}

impl StreamDecoder {
    /// Create a decoder around a per-stream crypto context.
    #[must_use]
    pub fn new(context: StreamingContext) -> Self {
        Self {
            context,
            reorder: BTreeMap::new(),
            next_expected: 0,
            chunks_decoded: 0,
        }
    }

    /// Decode one segment.
    ///
    /// With `sequence: None` the chunk is returned immediately in arrival
    /// order. With an explicit sequence the chunk is buffered; duplicates
    /// and sequences below the delivery cursor are dropped silently, and
    /// ordered delivery happens through [`Self::get_ordered_chunks`].
    ///
    /// # Errors
    ///
    /// Returns `StreamError::InvalidSegment` for structural problems and
    /// `StreamError::DecryptFailure` if authentication fails.
    pub fn decode_segment(
        &mut self,
        segment: &[u8],
        sequence: Option<u64>,
    ) -> Result<Option<Vec<u8>>, StreamError> {
        if segment.len() < SEGMENT_MIN_SIZE {
            return Err(StreamError::InvalidSegment(format!(
                "segment of {} bytes is below the {SEGMENT_MIN_SIZE}-byte minimum",
                segment.len()
            )));
        }

        let empty = match segment[0] {
            0 => false,
            1 => true,
            other => {
                return Err(StreamError::InvalidSegment(format!(
                    "bad empty flag 0x{other:02X}"
                )));
            }
        };

        let header = ChunkHeader::from_bytes(&segment[1..1 + CHUNK_HEADER_SIZE])
            .map_err(|e| StreamError::InvalidSegment(e.to_string()))?;
        let ciphertext = &segment[SEGMENT_MIN_SIZE..];

        let decrypted = self.context.decrypt_chunk(&header, ciphertext)?;
        // Placeholder byte from an empty chunk is discarded.
        let chunk = if empty { Vec::new() } else { decrypted };
        self.chunks_decoded += 1;

        match sequence {
            None => Ok(Some(chunk)),
            Some(seq) => {
                if seq >= self.next_expected && !self.reorder.contains_key(&seq) {
                    self.reorder.insert(seq, chunk);
                }
                Ok(None)
            }
        }
    }

    /// Drain buffered chunks that are contiguous from the delivery cursor,
    /// in sender order.
    pub fn get_ordered_chunks(&mut self) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.reorder.remove(&self.next_expected) {
            out.push(chunk);
            self.next_expected += 1;
        }
        out
    }

    /// Total plaintext bytes in the contiguous run the next
    /// [`Self::get_ordered_chunks`] call would deliver. Does not consume
    /// anything.
    #[must_use]
    pub fn ready_bytes(&self) -> u64 {
        let mut next = self.next_expected;
        let mut total = 0u64;
        while let Some(chunk) = self.reorder.get(&next) {
            total += chunk.len() as u64;
            next += 1;
        }
        total
    }

    /// Sequence number the decoder will deliver next.
    #[must_use]
    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }

    /// Number of chunks currently parked in the reorder buffer.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.reorder.len()
    }

    /// Total chunks decoded (including still-buffered ones).
    #[must_use]
    pub fn chunks_decoded(&self) -> u64 {
        self.chunks_decoded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec_pair() -> (StreamEncoder, StreamDecoder) {
        let key = SessionKey::new([11u8; 32]);
        let session_id = [1u8; 8];
        (
            StreamEncoder::new(stream_context(&key, &session_id, 1)),
            StreamDecoder::new(stream_context(&key, &session_id, 1)),
        )
    }

    #[test]
    fn test_segment_roundtrip_immediate() {
        let (mut enc, mut dec) = codec_pair();
        let (seq, segment) = enc.encode_segment(b"hello stream").unwrap();
        assert_eq!(seq, 0);
        let chunk = dec.decode_segment(&segment, None).unwrap();
        assert_eq!(chunk, Some(b"hello stream".to_vec()));
    }

    #[test]
    fn test_sequences_consecutive_from_zero() {
        let (mut enc, _) = codec_pair();
        for expected in 0..4 {
            let (seq, _) = enc.encode_segment(b"x").unwrap();
            assert_eq!(seq, expected);
        }
        assert_eq!(enc.next_sequence(), 4);
    }

    #[test]
    fn test_reordered_delivery() {
        let (mut enc, mut dec) = codec_pair();
        let chunks: Vec<&[u8]> = vec![b"a", b"b", b"c", b"d"];
        let segments: Vec<(u64, Vec<u8>)> = chunks
            .iter()
            .map(|c| enc.encode_segment(c).unwrap())
            .collect();

        // Deliver in order 2, 0, 3, 1.
        for idx in [2usize, 0, 3, 1] {
            let (seq, segment) = &segments[idx];
            assert_eq!(dec.decode_segment(segment, Some(*seq)).unwrap(), None);
        }

        let ordered = dec.get_ordered_chunks();
        assert_eq!(ordered, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);
        assert_eq!(dec.buffered(), 0);
    }

    #[test]
    fn test_partial_drain_then_completion() {
        let (mut enc, mut dec) = codec_pair();
        let segments: Vec<(u64, Vec<u8>)> = (0..3)
            .map(|i| enc.encode_segment(format!("chunk{i}").as_bytes()).unwrap())
            .collect();

        // Sequence 1 arrives first; nothing is deliverable.
        dec.decode_segment(&segments[1].1, Some(1)).unwrap();
        assert!(dec.get_ordered_chunks().is_empty());

        // Sequence 0 unblocks 0 and 1.
        dec.decode_segment(&segments[0].1, Some(0)).unwrap();
        assert_eq!(
            dec.get_ordered_chunks(),
            vec![b"chunk0".to_vec(), b"chunk1".to_vec()]
        );

        dec.decode_segment(&segments[2].1, Some(2)).unwrap();
        assert_eq!(dec.get_ordered_chunks(), vec![b"chunk2".to_vec()]);
    }

    #[test]
    fn test_empty_chunk_identity() {
        let (mut enc, mut dec) = codec_pair();
        let (seq, segment) = enc.encode_segment(b"").unwrap();
        assert_eq!(segment[0], 1);
        let chunk = dec.decode_segment(&segment, None).unwrap();
        assert_eq!(chunk, Some(Vec::new()));
        assert_eq!(seq, 0);
    }

    #[test]
    fn test_empty_chunk_ordered() {
        let (mut enc, mut dec) = codec_pair();
        let (seq, segment) = enc.encode_segment(b"").unwrap();
        dec.decode_segment(&segment, Some(seq)).unwrap();
        assert_eq!(dec.get_ordered_chunks(), vec![Vec::<u8>::new()]);
    }

    #[test]
    fn test_ready_bytes_tracks_contiguous_run() {
        let (mut enc, mut dec) = codec_pair();
        let s0 = enc.encode_segment(b"12345").unwrap();
        let s1 = enc.encode_segment(b"678").unwrap();
        let s2 = enc.encode_segment(b"9").unwrap();

        // A gap at 0 keeps everything parked.
        dec.decode_segment(&s1.1, Some(s1.0)).unwrap();
        assert_eq!(dec.ready_bytes(), 0);

        dec.decode_segment(&s0.1, Some(s0.0)).unwrap();
        assert_eq!(dec.ready_bytes(), 8);

        dec.decode_segment(&s2.1, Some(s2.0)).unwrap();
        assert_eq!(dec.ready_bytes(), 9);

        dec.get_ordered_chunks();
        assert_eq!(dec.ready_bytes(), 0);
    }

    #[test]
    fn test_duplicate_sequence_dropped() {
        let (mut enc, mut dec) = codec_pair();
        let (seq, segment) = enc.encode_segment(b"once").unwrap();
        dec.decode_segment(&segment, Some(seq)).unwrap();
        dec.decode_segment(&segment, Some(seq)).unwrap();
        assert_eq!(dec.get_ordered_chunks(), vec![b"once".to_vec()]);
        // Stale replay after delivery is also dropped.
        dec.decode_segment(&segment, Some(seq)).unwrap();
        assert!(dec.get_ordered_chunks().is_empty());
    }

    #[test]
    fn test_short_segment_rejected() {
        let (_, mut dec) = codec_pair();
        assert!(matches!(
            dec.decode_segment(&[0u8; 5], None),
            Err(StreamError::InvalidSegment(_))
        ));
    }

    #[test]
    fn test_bad_empty_flag_rejected() {
        let (mut enc, mut dec) = codec_pair();
        let (_, mut segment) = enc.encode_segment(b"data").unwrap();
        segment[0] = 7;
        assert!(matches!(
            dec.decode_segment(&segment, None),
            Err(StreamError::InvalidSegment(_))
        ));
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let (mut enc, mut dec) = codec_pair();
        let (_, mut segment) = enc.encode_segment(b"data").unwrap();
        let last = segment.len() - 1;
        segment[last] ^= 0xFF;
        assert!(matches!(
            dec.decode_segment(&segment, None),
            Err(StreamError::DecryptFailure)
        ));
    }

    #[test]
    fn test_cross_stream_isolation() {
        let key = SessionKey::new([11u8; 32]);
        let session_id = [1u8; 8];
        let mut enc_a = StreamEncoder::new(stream_context(&key, &session_id, 1));
        let mut dec_b = StreamDecoder::new(stream_context(&key, &session_id, 2));

        let (_, segment) = enc_a.encode_segment(b"stream one").unwrap();
        assert!(matches!(
            dec_b.decode_segment(&segment, None),
            Err(StreamError::DecryptFailure)
        ));
    }

    #[test]
    fn test_encoder_stats() {
        let (mut enc, _) = codec_pair();
        enc.encode_segment(b"12345").unwrap();
        enc.encode_segment(b"").unwrap();
        assert_eq!(enc.chunks_encoded(), 2);
        assert_eq!(enc.bytes_encoded(), 5);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(32))]

            #[test]
            fn prop_any_permutation_restores_order(
                chunks in prop::collection::vec(
                    prop::collection::vec(any::<u8>(), 0..64), 1..8),
                seed in any::<u64>()
            ) {
                let (mut enc, mut dec) = codec_pair();
                let segments: Vec<(u64, Vec<u8>)> = chunks
                    .iter()
                    .map(|c| enc.encode_segment(c).unwrap())
                    .collect();

                // Deterministic shuffle from the seed.
                let mut order: Vec<usize> = (0..segments.len()).collect();
                let mut state = seed;
                for i in (1..order.len()).rev() {
                    state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
                    let j = (state % (i as u64 + 1)) as usize;
                    order.swap(i, j);
                }

                for idx in order {
                    let (seq, segment) = &segments[idx];
                    dec.decode_segment(segment, Some(*seq)).unwrap();
                }
                prop_assert_eq!(dec.get_ordered_chunks(), chunks);
            }
        }
    }
}
