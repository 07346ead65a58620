//! # STT Crypto
//!
//! Cryptographic facade for the STT (Secure Transit Transport) protocol.
//!
//! This crate provides:
//! - Context-bound hashing and key derivation (BLAKE3)
//! - AEAD encryption with canonical associated-data records (XChaCha20-Poly1305)
//! - Stateful per-stream encryption contexts with nonce management
//! - Secure random generation for nonces and seeds
//!
//! The rest of the workspace consumes cryptography exclusively through the
//! [`CryptoProvider`] trait; [`SeedCrypto`] is the default implementation,
//! and tests may substitute their own.
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm |
//! |----------|-----------|
//! | Hash | keyed BLAKE3 |
//! | KDF | BLAKE3 XOF |
//! | AEAD | XChaCha20-Poly1305 |
//!
//! There is intentionally no key agreement and no signature scheme: STT
//! trust is symmetric, rooted in a pre-shared seed.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod context;
pub mod error;
pub mod random;
pub mod streaming;

pub use context::{AdContext, AdValue, CryptoProvider, SeedCrypto};
pub use error::CryptoError;
pub use streaming::{ChunkHeader, StreamingContext};

/// Symmetric key size (bytes)
pub const KEY_SIZE: usize = 32;

/// BLAKE3 hash output size (bytes)
pub const HASH_SIZE: usize = 32;

/// XChaCha20-Poly1305 nonce size (bytes)
pub const XCHACHA_NONCE_SIZE: usize = 24;

/// Poly1305 authentication tag size (bytes)
pub const AUTH_TAG_SIZE: usize = 16;

/// Per-stream chunk header size (bytes)
pub const CHUNK_HEADER_SIZE: usize = 16;

/// Session key material, zeroized on drop.
#[derive(Clone, zeroize::Zeroize, zeroize::ZeroizeOnDrop)]
pub struct SessionKey([u8; KEY_SIZE]);

impl SessionKey {
    /// Wrap raw key bytes.
    #[must_use]
    pub const fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Borrow the key bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

impl From<[u8; KEY_SIZE]> for SessionKey {
    fn from(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }
}
