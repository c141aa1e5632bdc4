//! Chain Commitments
//!
//! Each batch closes with an `end_commitment` that binds the previous link,
//! the hidden per-move commitments and the committed final position. The
//! next batch must start from exactly that value, so segments can be
//! neither skipped nor forged.

use serde::{Serialize, Deserialize};
use crate::core::hash::{DomainHasher, Hash32, hash_with_domain};
use crate::core::id::PeerId;
use crate::core::point::GridPoint;
use super::batch::MovementBatch;

/// Domain separator for the genesis link.
const GENESIS_DOMAIN: &[u8] = b"FOOTSTEPS_GENESIS_V1";

/// Fixed `start_commitment` of batch 0.
pub fn genesis_commitment() -> Hash32 {
    hash_with_domain(GENESIS_DOMAIN, &[])
}

/// Compute the `end_commitment` of a batch.
///
/// `step_commitments` are the compressed per-move Pedersen commitments,
/// `dx` then `dy` for each move in order.
pub fn chain_commitment(
    peer_id: &PeerId,
    batch_seq: u64,
    start_commitment: &Hash32,
    step_commitments: &[[u8; 32]],
    end_position: GridPoint,
) -> Hash32 {
    let mut hasher = DomainHasher::for_chain();
    hasher.update_peer(peer_id);
    hasher.update_u64(batch_seq);
    hasher.update_bytes(start_commitment);
    hasher.update_u64(step_commitments.len() as u64);
    for c in step_commitments {
        hasher.update_bytes(c);
    }
    hasher.update_point(end_position);
    hasher.finalize()
}

/// Where the local chain currently ends.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainCursor {
    /// Sequence number the next batch gets.
    pub next_seq: u64,
    /// `end_commitment` of the last batch (genesis before the first).
    pub end_commitment: Hash32,
    /// Committed position at the end of the chain.
    pub end_position: GridPoint,
}

impl ChainCursor {
    /// Cursor of an empty chain starting at `spawn`.
    pub fn genesis(spawn: GridPoint) -> Self {
        Self {
            next_seq: 0,
            end_commitment: genesis_commitment(),
            end_position: spawn,
        }
    }

    /// Move past a batch built from this cursor.
    pub fn advance(&mut self, batch: &MovementBatch) {
        self.next_seq = batch.batch_seq + 1;
        self.end_commitment = batch.public_inputs.end_commitment;
        self.end_position = batch.public_inputs.end_position;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_genesis_is_stable() {
        assert_eq!(genesis_commitment(), genesis_commitment());
        assert_ne!(genesis_commitment(), [0; 32]);
    }

    #[test]
    fn test_chain_commitment_binds_inputs() {
        let peer = PeerId::new([1; 16]);
        let start = genesis_commitment();
        let steps = [[2u8; 32], [3u8; 32]];
        let base = chain_commitment(&peer, 0, &start, &steps, GridPoint::new(1, 0));

        assert_ne!(base, chain_commitment(&peer, 1, &start, &steps, GridPoint::new(1, 0)));
        assert_ne!(base, chain_commitment(&peer, 0, &[0; 32], &steps, GridPoint::new(1, 0)));
        assert_ne!(base, chain_commitment(&peer, 0, &start, &steps[..1], GridPoint::new(1, 0)));
        assert_ne!(base, chain_commitment(&peer, 0, &start, &steps, GridPoint::new(0, 1)));
        assert_ne!(
            base,
            chain_commitment(&PeerId::new([9; 16]), 0, &start, &steps, GridPoint::new(1, 0))
        );
    }

    #[test]
    fn test_cursor_genesis() {
        let cursor = ChainCursor::genesis(GridPoint::new(2, 2));
        assert_eq!(cursor.next_seq, 0);
        assert_eq!(cursor.end_commitment, genesis_commitment());
        assert_eq!(cursor.end_position, GridPoint::new(2, 2));
    }
}
