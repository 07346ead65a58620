//! Stateful per-stream chunk encryption.
//!
//! Each stream owns one [`StreamingContext`]; the context assigns every
//! chunk a monotonically increasing index and derives a unique nonce from
//! that index plus a per-context random salt. The 16-byte [`ChunkHeader`]
//! travels with the ciphertext and is the AEAD associated data, so a
//! decryptor needs only the shared stream key and the header.

use crate::error::CryptoError;
use crate::{CHUNK_HEADER_SIZE, KEY_SIZE, XCHACHA_NONCE_SIZE};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand_core::{OsRng, RngCore};

/// Self-describing header prepended to every encrypted chunk.
///
/// Layout: `chunk_index(8, BE) || nonce_salt(8)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Position of the chunk in the stream, starting at 0
    pub chunk_index: u64,
    /// Random salt chosen by the encrypting context
    pub nonce_salt: [u8; 8],
}

impl ChunkHeader {
    /// Serialize to the fixed 16-byte wire form.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; CHUNK_HEADER_SIZE] {
        let mut out = [0u8; CHUNK_HEADER_SIZE];
        out[..8].copy_from_slice(&self.chunk_index.to_be_bytes());
        out[8..].copy_from_slice(&self.nonce_salt);
        out
    }

    /// Parse from wire bytes.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidChunkHeader` if `bytes` is not exactly
    /// 16 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != CHUNK_HEADER_SIZE {
            return Err(CryptoError::InvalidChunkHeader {
                expected: CHUNK_HEADER_SIZE,
                actual: bytes.len(),
            });
        }
        let mut index = [0u8; 8];
        index.copy_from_slice(&bytes[..8]);
        let mut salt = [0u8; 8];
        salt.copy_from_slice(&bytes[8..]);
        Ok(Self {
            chunk_index: u64::from_be_bytes(index),
            nonce_salt: salt,
        })
    }

    fn nonce(&self) -> [u8; XCHACHA_NONCE_SIZE] {
        let mut nonce = [0u8; XCHACHA_NONCE_SIZE];
        nonce[..8].copy_from_slice(&self.nonce_salt);
        nonce[8..16].copy_from_slice(&self.chunk_index.to_be_bytes());
        nonce
    }
}

/// Per-stream encryption state.
///
/// Encrypting advances the internal chunk index, so no two chunks from the
/// same context ever share a nonce. Decryption is stateless with respect to
/// ordering: the header carries everything needed.
pub struct StreamingContext {
    cipher: XChaCha20Poly1305,
    nonce_salt: [u8; 8],
    next_index: u64,
}

impl StreamingContext {
    /// Create a context from a derived stream key.
    #[must_use]
    pub fn new(key: [u8; KEY_SIZE]) -> Self {
        let mut nonce_salt = [0u8; 8];
        OsRng.fill_bytes(&mut nonce_salt);
        Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(&key)),
            nonce_salt,
            next_index: 0,
        }
    }

    /// Encrypt the next chunk in the stream.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::EncryptFailed` on AEAD failure.
    pub fn encrypt_chunk(
        &mut self,
        plaintext: &[u8],
    ) -> Result<(ChunkHeader, Vec<u8>), CryptoError> {
        let header = ChunkHeader {
            chunk_index: self.next_index,
            nonce_salt: self.nonce_salt,
        };
        let aad = header.to_bytes();
        let ciphertext = self
            .cipher
            .encrypt(
                XNonce::from_slice(&header.nonce()),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::EncryptFailed)?;
        self.next_index += 1;
        Ok((header, ciphertext))
    }

    /// Decrypt a chunk using its header.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::DecryptFailed` if authentication fails.
    pub fn decrypt_chunk(
        &self,
        header: &ChunkHeader,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let aad = header.to_bytes();
        self.cipher
            .decrypt(
                XNonce::from_slice(&header.nonce()),
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::DecryptFailed)
    }

    /// Index the next encrypted chunk will carry.
    #[must_use]
    pub fn next_index(&self) -> u64 {
        self.next_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (StreamingContext, StreamingContext) {
        let key = [9u8; KEY_SIZE];
        (StreamingContext::new(key), StreamingContext::new(key))
    }

    #[test]
    fn test_chunk_header_roundtrip() {
        let header = ChunkHeader {
            chunk_index: 0x0102_0304_0506_0708,
            nonce_salt: [1, 2, 3, 4, 5, 6, 7, 8],
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), CHUNK_HEADER_SIZE);
        assert_eq!(ChunkHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn test_chunk_header_bad_length() {
        assert!(matches!(
            ChunkHeader::from_bytes(&[0u8; 15]),
            Err(CryptoError::InvalidChunkHeader {
                expected: 16,
                actual: 15
            })
        ));
    }

    #[test]
    fn test_encrypt_decrypt_chunk() {
        let (mut enc, dec) = pair();
        let (header, ct) = enc.encrypt_chunk(b"stream data").unwrap();
        assert_eq!(header.chunk_index, 0);
        assert_eq!(dec.decrypt_chunk(&header, &ct).unwrap(), b"stream data");
    }

    #[test]
    fn test_indices_increment() {
        let (mut enc, _) = pair();
        for expected in 0..5 {
            let (header, _) = enc.encrypt_chunk(b"x").unwrap();
            assert_eq!(header.chunk_index, expected);
        }
        assert_eq!(enc.next_index(), 5);
    }

    #[test]
    fn test_tampered_header_rejected() {
        let (mut enc, dec) = pair();
        let (mut header, ct) = enc.encrypt_chunk(b"data").unwrap();
        header.chunk_index += 1;
        assert!(dec.decrypt_chunk(&header, &ct).is_err());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let mut enc = StreamingContext::new([1u8; KEY_SIZE]);
        let dec = StreamingContext::new([2u8; KEY_SIZE]);
        let (header, ct) = enc.encrypt_chunk(b"data").unwrap();
        assert!(dec.decrypt_chunk(&header, &ct).is_err());
    }

    #[test]
    fn test_empty_chunk() {
        let (mut enc, dec) = pair();
        let (header, ct) = enc.encrypt_chunk(b"").unwrap();
        assert_eq!(dec.decrypt_chunk(&header, &ct).unwrap(), b"");
    }

    #[test]
    fn test_distinct_nonces_distinct_ciphertexts() {
        let (mut enc, _) = pair();
        let (_, ct1) = enc.encrypt_chunk(b"same").unwrap();
        let (_, ct2) = enc.encrypt_chunk(b"same").unwrap();
        assert_ne!(ct1, ct2);
    }
}
