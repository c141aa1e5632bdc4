//! Movement batches.
//!
//! The immutable unit peers exchange: a proof plus the redacted public path.

use serde::{Serialize, Deserialize};
use crate::core::hash::{DomainHasher, Hash32};
use crate::core::id::PeerId;
use crate::core::point::GridPoint;

/// Public data a batch proof is checked against.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicInputs {
    /// Committed position the batch starts from.
    pub start_position: GridPoint,
    /// Disclosed path points, in path order.
    pub revealed_points: Vec<GridPoint>,
    /// Number of path points kept hidden.
    pub redacted_count: u32,
    /// Committed final position (opened in the proof).
    pub end_position: GridPoint,
    /// End commitment of the previous batch (genesis for batch 0).
    pub start_commitment: Hash32,
    /// Commitment closing this batch.
    pub end_commitment: Hash32,
}

/// A committed, partially redacted segment of one peer's movement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementBatch {
    /// Author.
    pub peer_id: PeerId,
    /// Position in the author's chain.
    pub batch_seq: u64,
    /// Encoded proof.
    pub proof: Vec<u8>,
    /// Public inputs.
    pub public_inputs: PublicInputs,
}

impl MovementBatch {
    /// Dedup key.
    #[inline]
    pub fn id(&self) -> (PeerId, u64) {
        (self.peer_id, self.batch_seq)
    }

    /// Number of moves (path points) in this batch.
    pub fn move_count(&self) -> usize {
        self.public_inputs.revealed_points.len() + self.public_inputs.redacted_count as usize
    }

    /// Digest of everything the proof is bound to.
    pub fn statement_digest(&self, params_hash: &Hash32) -> Hash32 {
        let inputs = &self.public_inputs;
        let mut hasher = DomainHasher::for_statement();
        hasher.update_bytes(params_hash);
        hasher.update_peer(&self.peer_id);
        hasher.update_u64(self.batch_seq);
        hasher.update_point(inputs.start_position);
        hasher.update_u64(inputs.revealed_points.len() as u64);
        for p in &inputs.revealed_points {
            hasher.update_point(*p);
        }
        hasher.update_u32(inputs.redacted_count);
        hasher.update_point(inputs.end_position);
        hasher.update_bytes(&inputs.start_commitment);
        hasher.update_bytes(&inputs.end_commitment);
        hasher.finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MovementBatch {
        MovementBatch {
            peer_id: PeerId::new([1; 16]),
            batch_seq: 4,
            proof: vec![1, 2, 3],
            public_inputs: PublicInputs {
                start_position: GridPoint::ORIGIN,
                revealed_points: vec![GridPoint::new(1, 0)],
                redacted_count: 1,
                end_position: GridPoint::new(2, 0),
                start_commitment: [5; 32],
                end_commitment: [6; 32],
            },
        }
    }

    #[test]
    fn test_move_count() {
        assert_eq!(sample().move_count(), 2);
        assert_eq!(sample().id(), (PeerId::new([1; 16]), 4));
    }

    #[test]
    fn test_statement_digest_covers_public_inputs() {
        let params_hash = [0; 32];
        let base = sample().statement_digest(&params_hash);

        let mut moved = sample();
        moved.public_inputs.revealed_points[0] = GridPoint::new(0, 1);
        assert_ne!(base, moved.statement_digest(&params_hash));

        let mut recount = sample();
        recount.public_inputs.redacted_count = 2;
        assert_ne!(base, recount.statement_digest(&params_hash));

        assert_ne!(base, sample().statement_digest(&[1; 32]));
    }

    #[test]
    fn test_statement_digest_ignores_proof_bytes() {
        let mut other = sample();
        other.proof = vec![9; 10];
        assert_eq!(sample().statement_digest(&[0; 32]), other.statement_digest(&[0; 32]));
    }
}
