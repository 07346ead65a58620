//! Error types for the STT crypto facade.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// AEAD encryption failed
    #[error("encryption failed")]
    EncryptFailed,

    /// AEAD decryption or authentication failed
    #[error("decryption failed: ciphertext or associated data rejected")]
    DecryptFailed,

    /// Metadata blob is malformed (wrong length, bad nonce)
    #[error("invalid crypto metadata: {0}")]
    InvalidMetadata(String),

    /// Chunk header is malformed
    #[error("invalid chunk header: expected {expected} bytes, got {actual}")]
    InvalidChunkHeader {
        /// Expected header size
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// Requested key length is unsupported
    #[error("unsupported key length: {0}")]
    InvalidKeyLength(usize),
}
