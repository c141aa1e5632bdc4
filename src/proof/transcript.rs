//! Fiat–Shamir Transcript
//!
//! Derives non-interactive challenges for the sigma proofs. Every challenge
//! absorbs the batch statement digest, a label naming the sub-proof, its
//! position inside the batch and the group elements it talks about. A proof
//! produced for one slot or one batch therefore never verifies in another.

use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use sha2::{Digest, Sha512};
use crate::core::hash::Hash32;

/// Domain separator for challenge derivation.
const CHALLENGE_DOMAIN: &[u8] = b"FOOTSTEPS_FS_V1";

/// Challenge oracle bound to one batch statement.
#[derive(Clone, Debug)]
pub struct Transcript {
    statement: Hash32,
}

impl Transcript {
    /// Bind a transcript to a statement digest.
    pub fn new(statement: Hash32) -> Self {
        Self { statement }
    }

    /// Derive the challenge for one sub-proof.
    pub fn challenge(&self, label: &[u8], path: &[u64], points: &[RistrettoPoint]) -> Scalar {
        let mut hasher = Sha512::new();
        hasher.update(CHALLENGE_DOMAIN);
        hasher.update(self.statement);
        hasher.update((label.len() as u64).to_le_bytes());
        hasher.update(label);
        hasher.update((path.len() as u64).to_le_bytes());
        for step in path {
            hasher.update(step.to_le_bytes());
        }
        for point in points {
            hasher.update(point.compress().as_bytes());
        }
        Scalar::from_hash(hasher)
    }
}
