//! Verification API
//!
//! Two layers:
//! - `ProofVerifier`: cryptographic check of a batch against its own public
//!   inputs and the circuit parameters
//! - `verify_batch`: ordering and chain continuity against the sender's
//!   trail, then the cryptographic check

use curve25519_dalek::ristretto::RistrettoPoint;
use thiserror::Error;
use crate::core::hash::Hash32;
use crate::core::id::PeerId;
use crate::core::point::GridPoint;
use super::batch::MovementBatch;
use super::commitment::{chain_commitment, genesis_commitment};
use super::params::CircuitParameters;
use super::prover::{
    MovementProof, AXIS_X, AXIS_Y, OPEN_LABEL, SIDE_HIGH, SIDE_LOW, STEP_LABEL,
};
use super::reveal::{hidden_indices, reveal_count, reveal_indices};
use super::sigma::{
    self, decode_point, scalar_from_i64, verify_membership, verify_opening, verify_range,
    SigmaError,
};
use super::transcript::Transcript;

/// Errors during proof verification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProofVerificationError {
    /// Proof bytes do not decode.
    #[error("invalid proof format: {0}")]
    InvalidProofFormat(String),

    /// Disclosure does not follow the reveal policy.
    #[error("expected {expected} revealed points, got {got}")]
    RevealCountMismatch {
        /// Policy count.
        expected: usize,
        /// Points in the batch.
        got: usize,
    },

    /// A public point is outside the game area.
    #[error("public point {0} outside game area")]
    OutOfBounds(GridPoint),

    /// Proof has the wrong number of components.
    #[error("proof shape mismatch: {0}")]
    Shape(String),

    /// Recomputed end commitment differs from the public one.
    #[error("end commitment mismatch")]
    CommitmentMismatch,

    /// A step proof failed.
    #[error("step {index} invalid: {source}")]
    Step {
        /// Move index.
        index: usize,
        /// Cause.
        source: SigmaError,
    },

    /// A point opening failed.
    #[error("opening {slot} invalid: {source}")]
    Opening {
        /// Opening slot.
        slot: usize,
        /// Cause.
        source: SigmaError,
    },

    /// A hidden position bounds proof failed.
    #[error("hidden position {index} invalid: {source}")]
    Range {
        /// Path index.
        index: usize,
        /// Cause.
        source: SigmaError,
    },
}

/// Interface for batch proof verification.
///
/// Alternative proof backends plug in here.
pub trait ProofVerifier: Send + Sync {
    /// Check `batch.proof` against `batch.public_inputs`.
    fn verify_proof(
        &self,
        params: &CircuitParameters,
        batch: &MovementBatch,
    ) -> Result<(), ProofVerificationError>;
}

/// Verifier for proofs produced by `prove_batch`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SigmaProofVerifier;

impl ProofVerifier for SigmaProofVerifier {
    fn verify_proof(
        &self,
        params: &CircuitParameters,
        batch: &MovementBatch,
    ) -> Result<(), ProofVerificationError> {
        let inputs = &batch.public_inputs;
        let n = batch.move_count();

        // 1. Disclosure policy
        let expected = reveal_count(n, params.reveal_ratio);
        if inputs.revealed_points.len() != expected {
            return Err(ProofVerificationError::RevealCountMismatch {
                expected,
                got: inputs.revealed_points.len(),
            });
        }

        // 2. Public points in bounds
        let bounds = params.bounds();
        let public = std::iter::once(&inputs.start_position)
            .chain(&inputs.revealed_points)
            .chain(std::iter::once(&inputs.end_position));
        for p in public {
            if !bounds.contains(*p) {
                return Err(ProofVerificationError::OutOfBounds(*p));
            }
        }
        if n == 0 && inputs.end_position != inputs.start_position {
            return Err(ProofVerificationError::Shape("empty batch moved".into()));
        }

        // 3. Decode and check shape
        let proof = MovementProof::decode(&batch.proof)
            .map_err(|e| ProofVerificationError::InvalidProofFormat(e.to_string()))?;
        let revealed = reveal_indices(n, params.reveal_ratio);
        let hidden = hidden_indices(n, &revealed);
        let openings = revealed.len() + usize::from(n > 0);
        if proof.steps.len() != n || proof.openings.len() != openings || proof.ranges.len() != hidden.len() {
            return Err(ProofVerificationError::Shape(format!(
                "{} steps, {} openings, {} ranges for {} moves",
                proof.steps.len(), proof.openings.len(), proof.ranges.len(), n
            )));
        }

        // 4. Chain link
        let mut step_bytes = Vec::with_capacity(2 * n);
        for step in &proof.steps {
            step_bytes.push(step.dx);
            step_bytes.push(step.dy);
        }
        let recomputed = chain_commitment(
            &batch.peer_id, batch.batch_seq, &inputs.start_commitment, &step_bytes,
            inputs.end_position,
        );
        if recomputed != inputs.end_commitment {
            return Err(ProofVerificationError::CommitmentMismatch);
        }

        // 5. Step proofs and position commitments
        let transcript = Transcript::new(batch.statement_digest(&params.params_hash()));
        let gens = sigma::generators();
        let values = params.step_values();
        let mut cx = scalar_from_i64(inputs.start_position.x as i64) * gens.g;
        let mut cy = scalar_from_i64(inputs.start_position.y as i64) * gens.g;
        let mut positions: Vec<(RistrettoPoint, RistrettoPoint)> = Vec::with_capacity(n);

        for (index, step) in proof.steps.iter().enumerate() {
            let step_err = |source| ProofVerificationError::Step { index, source };
            let dx = decode_point(&step.dx).map_err(step_err)?;
            let dy = decode_point(&step.dy).map_err(step_err)?;
            verify_membership(&transcript, STEP_LABEL, &[index as u64, AXIS_X], &dx, &values, &step.dx_proof)
                .map_err(step_err)?;
            verify_membership(&transcript, STEP_LABEL, &[index as u64, AXIS_Y], &dy, &values, &step.dy_proof)
                .map_err(step_err)?;
            cx += dx;
            cy += dy;
            positions.push((cx, cy));
        }

        // 6. Openings of revealed points and the end position
        let opened = revealed
            .iter()
            .copied()
            .zip(inputs.revealed_points.iter().copied())
            .chain((n > 0).then(|| (n - 1, inputs.end_position)));
        for (slot, ((index, point), opening)) in opened.zip(&proof.openings).enumerate() {
            let open_err = |source| ProofVerificationError::Opening { slot, source };
            let (px, py) = positions[index];
            let yx = px - scalar_from_i64(point.x as i64) * gens.g;
            let yy = py - scalar_from_i64(point.y as i64) * gens.g;
            verify_opening(&transcript, OPEN_LABEL, &[slot as u64, AXIS_X], &yx, &opening.x)
                .map_err(open_err)?;
            verify_opening(&transcript, OPEN_LABEL, &[slot as u64, AXIS_Y], &yy, &opening.y)
                .map_err(open_err)?;
        }

        // 7. Hidden positions within bounds
        let w = scalar_from_i64(params.half_width as i64) * gens.g;
        let h = scalar_from_i64(params.half_height as i64) * gens.g;
        let (xb, yb) = (params.x_bits(), params.y_bits());
        for (index, range) in hidden.iter().copied().zip(&proof.ranges) {
            let range_err = |source| ProofVerificationError::Range { index, source };
            let (px, py) = positions[index];
            let idx = index as u64;
            verify_range(&transcript, &[idx, AXIS_X, SIDE_LOW], &(px + w), xb, &range.x_low)
                .map_err(range_err)?;
            verify_range(&transcript, &[idx, AXIS_X, SIDE_HIGH], &(w - px), xb, &range.x_high)
                .map_err(range_err)?;
            verify_range(&transcript, &[idx, AXIS_Y, SIDE_LOW], &(py + h), yb, &range.y_low)
                .map_err(range_err)?;
            verify_range(&transcript, &[idx, AXIS_Y, SIDE_HIGH], &(h - py), yb, &range.y_high)
                .map_err(range_err)?;
        }

        Ok(())
    }
}

// =============================================================================
// CHAIN-AWARE VERIFICATION
// =============================================================================

/// What the verifier needs from the sender's trail.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrailView {
    /// Peer the trail belongs to.
    pub peer_id: PeerId,
    /// Last verified batch (None while pending).
    pub last_verified_seq: Option<u64>,
    /// End commitment of the last verified batch.
    pub end_commitment: Hash32,
    /// Position after the last verified batch.
    pub current_position: GridPoint,
}

/// Rejection of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationError {
    /// Malformed batch, or one that does not belong to the trail.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Protocol violation for a batch ahead of the verified chain. The
    /// missing batches can still arrive, so the sender is not suspect.
    #[error("protocol violation: expected batch {expected}, got {got}")]
    OutOfOrder {
        /// Next batch the trail can take.
        expected: u64,
        /// Batch received.
        got: u64,
    },

    /// Batch does not continue the verified chain.
    #[error("chain mismatch: {0}")]
    ChainMismatch(String),

    /// Cryptographic verification failed.
    #[error("proof invalid: {0}")]
    ProofInvalid(#[from] ProofVerificationError),
}

impl VerificationError {
    /// Chain and protocol rejections mark the sender suspect.
    pub fn marks_suspect(&self) -> bool {
        matches!(self, Self::ProtocolViolation(_) | Self::ChainMismatch(_))
    }
}

/// Accepted verification outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Batch extends the trail.
    Accept,
    /// Already applied; ignore without side effects.
    Duplicate,
}

/// Ordering policy for a peer's first batch and for gaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderingPolicy {
    /// Require `batch_seq == last + 1` and a genesis-anchored first batch.
    pub strict: bool,
}

/// Decide whether `batch` extends the trail described by `view`.
pub fn verify_batch(
    view: &TrailView,
    batch: &MovementBatch,
    params: &CircuitParameters,
    verifier: &dyn ProofVerifier,
    policy: OrderingPolicy,
) -> Result<Verdict, VerificationError> {
    if batch.peer_id != view.peer_id {
        return Err(VerificationError::ProtocolViolation(format!(
            "batch from {} checked against trail of {}", batch.peer_id, view.peer_id
        )));
    }

    let inputs = &batch.public_inputs;
    match view.last_verified_seq {
        Some(last) if batch.batch_seq <= last => return Ok(Verdict::Duplicate),
        Some(last) => {
            if policy.strict && batch.batch_seq != last + 1 {
                return Err(VerificationError::OutOfOrder { expected: last + 1, got: batch.batch_seq });
            }
            check_link(inputs.start_commitment, inputs.start_position, view.end_commitment, view.current_position)?;
        }
        None if batch.batch_seq == 0 => {
            check_link(inputs.start_commitment, inputs.start_position, genesis_commitment(), params.spawn)?;
        }
        None => {
            if policy.strict {
                return Err(VerificationError::OutOfOrder { expected: 0, got: batch.batch_seq });
            }
            // Late joiner: anchor the chain on this batch
        }
    }

    verifier.verify_proof(params, batch)?;
    Ok(Verdict::Accept)
}

fn check_link(
    start_commitment: Hash32,
    start_position: GridPoint,
    expected_commitment: Hash32,
    expected_position: GridPoint,
) -> Result<(), VerificationError> {
    if start_commitment != expected_commitment {
        return Err(VerificationError::ChainMismatch(format!(
            "start commitment {} does not match {}",
            hex::encode(&start_commitment[..4]),
            hex::encode(&expected_commitment[..4])
        )));
    }
    if start_position != expected_position {
        return Err(VerificationError::ChainMismatch(format!(
            "start position {} does not match {}", start_position, expected_position
        )));
    }
    Ok(())
}
