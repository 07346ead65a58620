//! Secure random generation helpers.

use rand_core::{OsRng, RngCore};

/// Generate a fixed-size array of random bytes from the OS CSPRNG.
///
/// # Panics
///
/// Panics if the CSPRNG fails (extremely unlikely).
#[must_use]
pub fn random_array<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Generate `len` random bytes from the OS CSPRNG.
#[must_use]
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Generate a 32-byte nonce for handshake exchanges.
#[must_use]
pub fn handshake_nonce() -> [u8; 32] {
    random_array::<32>()
}
