//! Crypto provider trait and the default seed-based implementation.
//!
//! All hashing, key derivation, and AEAD operations in STT are bound to an
//! [`AdContext`]: an ordered record of named values with a canonical byte
//! encoding. Two peers that build equal contexts derive equal hashes and
//! keys; a single flipped field makes every derived value diverge.

use crate::error::CryptoError;
use crate::random::random_array;
use crate::streaming::StreamingContext;
use crate::{HASH_SIZE, KEY_SIZE, XCHACHA_NONCE_SIZE};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};

/// A single typed value inside an [`AdContext`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdValue {
    /// Opaque byte string
    Bytes(Vec<u8>),
    /// Unsigned 64-bit integer
    U64(u64),
    /// UTF-8 string
    Str(String),
}

/// Ordered associated-data record with a canonical encoding.
///
/// Entries are encoded in insertion order; both peers must build the record
/// with the same fields in the same order. The encoding is
/// `key_len(2,BE) || key || tag(1) || value_len(4,BE) || value` per entry,
/// where tag is 0 for bytes, 1 for u64 (8 BE bytes), 2 for strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdContext {
    entries: Vec<(&'static str, AdValue)>,
}

impl AdContext {
    /// Create an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context with a single `purpose` field, the common case.
    #[must_use]
    pub fn purpose(purpose: &'static str) -> Self {
        Self::new().with_str("purpose", purpose)
    }

    /// Append a byte-string field.
    #[must_use]
    pub fn with_bytes(mut self, key: &'static str, value: impl Into<Vec<u8>>) -> Self {
        self.entries.push((key, AdValue::Bytes(value.into())));
        self
    }

    /// Append an integer field.
    #[must_use]
    pub fn with_u64(mut self, key: &'static str, value: u64) -> Self {
        self.entries.push((key, AdValue::U64(value)));
        self
    }

    /// Append a string field.
    #[must_use]
    pub fn with_str(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.entries.push((key, AdValue::Str(value.into())));
        self
    }

    /// Number of fields in the record.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the record is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Canonical byte encoding of the record.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.entries.len() * 24);
        for (key, value) in &self.entries {
            out.extend_from_slice(&(key.len() as u16).to_be_bytes());
            out.extend_from_slice(key.as_bytes());
            match value {
                AdValue::Bytes(b) => {
                    out.push(0);
                    out.extend_from_slice(&(b.len() as u32).to_be_bytes());
                    out.extend_from_slice(b);
                }
                AdValue::U64(n) => {
                    out.push(1);
                    out.extend_from_slice(&8u32.to_be_bytes());
                    out.extend_from_slice(&n.to_be_bytes());
                }
                AdValue::Str(s) => {
                    out.push(2);
                    out.extend_from_slice(&(s.len() as u32).to_be_bytes());
                    out.extend_from_slice(s.as_bytes());
                }
            }
        }
        out
    }
}

/// The narrow cryptographic interface the STT core consumes.
///
/// Implementations must be deterministic for `hash` and `derive_key`: equal
/// inputs and contexts produce equal outputs, on any node initialised from
/// the same seed. `encrypt`/`decrypt` carry their nonce in the returned
/// metadata blob, so decryption needs only ciphertext, metadata, and a
/// matching context.
pub trait CryptoProvider: Send + Sync {
    /// Context-bound hash of `data`.
    fn hash(&self, data: &[u8], ctx: &AdContext) -> [u8; HASH_SIZE];

    /// Derive `len` bytes of key material from the context.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKeyLength` if `len` is zero.
    fn derive_key(&self, len: usize, ctx: &AdContext) -> Result<Vec<u8>, CryptoError>;

    /// Encrypt `plaintext`, authenticating the context as associated data.
    ///
    /// Returns `(ciphertext, metadata)`; the metadata must be presented
    /// unmodified to `decrypt`.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::EncryptFailed` on AEAD failure.
    fn encrypt(
        &self,
        plaintext: &[u8],
        ctx: &AdContext,
    ) -> Result<(Vec<u8>, Vec<u8>), CryptoError>;

    /// Decrypt and authenticate; the context must match encryption exactly.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::DecryptFailed` if authentication fails and
    /// `CryptoError::InvalidMetadata` if the metadata blob is malformed.
    fn decrypt(
        &self,
        ciphertext: &[u8],
        metadata: &[u8],
        ctx: &AdContext,
    ) -> Result<Vec<u8>, CryptoError>;

    /// Create a stateful per-stream encryption context from a stream seed.
    ///
    /// The returned context manages its own nonces and must never be shared
    /// across streams.
    fn streaming_context(&self, seed: &[u8]) -> StreamingContext;
}

/// Default provider: keyed BLAKE3 + XChaCha20-Poly1305, rooted in a seed.
pub struct SeedCrypto {
    root_key: [u8; KEY_SIZE],
    aead_key: [u8; KEY_SIZE],
}

impl SeedCrypto {
    /// Initialise from an arbitrary-length seed.
    #[must_use]
    pub fn new(seed: &[u8]) -> Self {
        let root_key = *blake3::hash(seed).as_bytes();
        let mut hasher = blake3::Hasher::new_keyed(&root_key);
        hasher.update(b"stt-aead-key");
        let aead_key = *hasher.finalize().as_bytes();
        Self { root_key, aead_key }
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(Key::from_slice(&self.aead_key))
    }
}

impl CryptoProvider for SeedCrypto {
    fn hash(&self, data: &[u8], ctx: &AdContext) -> [u8; HASH_SIZE] {
        let mut hasher = blake3::Hasher::new_keyed(&self.root_key);
        hasher.update(data);
        hasher.update(&ctx.encode());
        *hasher.finalize().as_bytes()
    }

    fn derive_key(&self, len: usize, ctx: &AdContext) -> Result<Vec<u8>, CryptoError> {
        if len == 0 {
            return Err(CryptoError::InvalidKeyLength(len));
        }
        let mut hasher = blake3::Hasher::new_keyed(&self.root_key);
        hasher.update(b"stt-kdf");
        hasher.update(&ctx.encode());
        let mut out = vec![0u8; len];
        hasher.finalize_xof().fill(&mut out);
        Ok(out)
    }

    fn encrypt(
        &self,
        plaintext: &[u8],
        ctx: &AdContext,
    ) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
        let nonce = random_array::<XCHACHA_NONCE_SIZE>();
        let aad = ctx.encode();
        let ciphertext = self
            .cipher()
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::EncryptFailed)?;
        Ok((ciphertext, nonce.to_vec()))
    }

    fn decrypt(
        &self,
        ciphertext: &[u8],
        metadata: &[u8],
        ctx: &AdContext,
    ) -> Result<Vec<u8>, CryptoError> {
        if metadata.len() != XCHACHA_NONCE_SIZE {
            return Err(CryptoError::InvalidMetadata(format!(
                "nonce must be {XCHACHA_NONCE_SIZE} bytes, got {}",
                metadata.len()
            )));
        }
        let aad = ctx.encode();
        self.cipher()
            .decrypt(
                XNonce::from_slice(metadata),
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::DecryptFailed)
    }

    fn streaming_context(&self, seed: &[u8]) -> StreamingContext {
        let mut hasher = blake3::Hasher::new_keyed(&self.root_key);
        hasher.update(b"stt-stream-key");
        hasher.update(seed);
        StreamingContext::new(*hasher.finalize().as_bytes())
    }
}
