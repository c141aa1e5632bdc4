//! Domain-Separated Hashing
//!
//! Provides deterministic SHA-256 hashing for:
//! - Chain commitments between batches
//! - Statement digests bound into proofs
//! - Circuit parameter fingerprints

use sha2::{Sha256, Digest};
use super::id::PeerId;
use super::point::GridPoint;

/// Hash output type (256 bits / 32 bytes)
pub type Hash32 = [u8; 32];

/// Deterministic hasher with a domain separator.
///
/// Wraps SHA-256 with helpers for the types that appear in batches.
/// Order of updates is critical for determinism.
pub struct DomainHasher {
    hasher: Sha256,
}

impl DomainHasher {
    /// Create a new hasher with domain separator.
    pub fn new(domain: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(domain);
        Self { hasher }
    }

    /// Create hasher for chain commitments.
    pub fn for_chain() -> Self {
        Self::new(b"FOOTSTEPS_CHAIN_V1")
    }

    /// Create hasher for proof statements.
    pub fn for_statement() -> Self {
        Self::new(b"FOOTSTEPS_STATEMENT_V1")
    }

    /// Update with raw bytes.
    #[inline]
    pub fn update_bytes(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Update with a u8 value.
    #[inline]
    pub fn update_u8(&mut self, value: u8) {
        self.hasher.update([value]);
    }

    /// Update with a u32 value (little-endian).
    #[inline]
    pub fn update_u32(&mut self, value: u32) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Update with a u64 value (little-endian).
    #[inline]
    pub fn update_u64(&mut self, value: u64) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Update with an i32 value (little-endian).
    #[inline]
    pub fn update_i32(&mut self, value: i32) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Update with a grid point.
    #[inline]
    pub fn update_point(&mut self, point: GridPoint) {
        self.update_i32(point.x);
        self.update_i32(point.y);
    }

    /// Update with a peer identifier (16 bytes).
    #[inline]
    pub fn update_peer(&mut self, peer: &PeerId) {
        self.hasher.update(peer.as_bytes());
    }

    /// Finalize and return the hash.
    pub fn finalize(self) -> Hash32 {
        self.hasher.finalize().into()
    }
}

/// Compute hash with domain separator.
pub fn hash_with_domain(domain: &[u8], data: &[u8]) -> Hash32 {
    let mut hasher = Sha256::new();
    hasher.update(domain);
    hasher.update(data);
    hasher.finalize().into()
}
