//! DHT node identity and the XOR distance metric.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// 256-bit identifier in the DHT keyspace.
///
/// Node ids and content ids share this keyspace: a content id is simply
/// the hash of the content interpreted as a key. The XOR metric gives
/// `d(x, x) = 0`, symmetry, and the triangle inequality, which is what
/// Kademlia routing relies on.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; 32]);

impl NodeId {
    /// Number of bits in an id
    pub const BITS: usize = 256;

    /// Wrap raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Borrow the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Generate a random id (testing and simulation).
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        use rand::RngCore;
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// XOR distance to another id.
    #[must_use]
    pub fn distance(&self, other: &NodeId) -> NodeId {
        let mut result = [0u8; 32];
        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        NodeId(result)
    }

    /// Leading zero bits of the id.
    #[must_use]
    pub fn leading_zeros(&self) -> usize {
        let mut count = 0;
        for byte in &self.0 {
            if *byte == 0 {
                count += 8;
            } else {
                count += byte.leading_zeros() as usize;
                break;
            }
        }
        count.min(Self::BITS)
    }

    /// Bucket index relative to a local id: `bitlen(distance) − 1`, or
    /// `None` for the local id itself.
    #[must_use]
    pub fn bucket_index(&self, local: &NodeId) -> Option<usize> {
        let distance = self.distance(local);
        let leading = distance.leading_zeros();
        if leading == Self::BITS {
            None
        } else {
            Some(Self::BITS - 1 - leading)
        }
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl PartialOrd for NodeId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}
