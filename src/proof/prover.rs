//! Batch Prover
//!
//! Turns a drained run of moves into a `MovementBatch`.
//!
//! ```text
//!   moves ──► path p_1..p_n ──► per-move commitments D_x, D_y
//!                                  │
//!            position commitments C_i = start·G + Σ D   (homomorphic)
//!                                  │
//!   ┌──────────────┬───────────────┴──────────┬─────────────────────┐
//!   │ step proofs  │ openings                 │ range proofs        │
//!   │ d ∈ [-m, m]  │ revealed points + end    │ hidden p_i in bounds│
//!   └──────────────┴──────────────────────────┴─────────────────────┘
//! ```
//!
//! Proving is CPU-bound; callers run it on a blocking worker.

use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use rand::rngs::OsRng;
use serde::{Serialize, Deserialize};
use thiserror::Error;
use tracing::debug;
use crate::core::hash::Hash32;
use crate::core::id::PeerId;
use crate::core::point::GridPoint;
use super::batch::{MovementBatch, PublicInputs};
use super::commitment::chain_commitment;
use super::params::CircuitParameters;
use super::reveal::{hidden_indices, reveal_indices};
use super::sigma::{
    self, OpeningProof, OrProof, RangeProof, commit, encode_point, prove_membership,
    prove_opening, prove_range, random_scalar,
};
use super::transcript::Transcript;

/// Sub-proof labels.
pub(crate) const STEP_LABEL: &[u8] = b"step";
pub(crate) const OPEN_LABEL: &[u8] = b"open";

/// Axis tags used in challenge paths.
pub(crate) const AXIS_X: u64 = 0;
pub(crate) const AXIS_Y: u64 = 1;

/// Range sides used in challenge paths.
pub(crate) const SIDE_LOW: u64 = 0;
pub(crate) const SIDE_HIGH: u64 = 1;

/// Failure to produce a batch.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProofGenerationError {
    /// A move can never be proven under the circuit rules.
    #[error("move {index} violates movement rules: {reason}")]
    ConstraintViolation {
        /// Zero-based move index.
        index: usize,
        /// Which rule.
        reason: String,
    },

    /// The proving worker failed or was cancelled.
    #[error("proof worker failed: {0}")]
    Worker(String),

    /// Proof could not be encoded.
    #[error("proof encoding failed: {0}")]
    Encoding(String),
}

impl ProofGenerationError {
    /// True when retrying with the same moves may succeed.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::ConstraintViolation { .. })
    }
}

/// Commitments and proofs for one move.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepProof {
    /// Commitment to dx.
    pub dx: [u8; 32],
    /// Commitment to dy.
    pub dy: [u8; 32],
    /// dx ∈ [-max_step, max_step].
    pub dx_proof: OrProof,
    /// dy ∈ [-max_step, max_step].
    pub dy_proof: OrProof,
}

/// Opening of one position commitment to a public point.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PointOpening {
    /// x opening.
    pub x: OpeningProof,
    /// y opening.
    pub y: OpeningProof,
}

/// Bounds proof for one hidden position.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HiddenPosition {
    /// x + half_width ≥ 0.
    pub x_low: RangeProof,
    /// half_width - x ≥ 0.
    pub x_high: RangeProof,
    /// y + half_height ≥ 0.
    pub y_low: RangeProof,
    /// half_height - y ≥ 0.
    pub y_high: RangeProof,
}

/// The proof carried in `MovementBatch::proof`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MovementProof {
    /// One entry per move.
    pub steps: Vec<StepProof>,
    /// Revealed points in order, then the end position (when n > 0).
    pub openings: Vec<PointOpening>,
    /// One entry per hidden non-final position, ascending.
    pub ranges: Vec<HiddenPosition>,
}

impl MovementProof {
    /// Encode for the wire.
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Decode from the wire.
    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// Secret witness for one axis of the path.
struct AxisWitness {
    deltas: Vec<i64>,
    step_blindings: Vec<Scalar>,
    /// Prefix sums of step blindings (blinding of each position commitment).
    position_blindings: Vec<Scalar>,
}

impl AxisWitness {
    fn new(deltas: Vec<i64>) -> Self {
        let step_blindings: Vec<Scalar> = deltas.iter().map(|_| random_scalar(&mut OsRng)).collect();
        let mut acc = Scalar::ZERO;
        let position_blindings = step_blindings
            .iter()
            .map(|r| {
                acc += r;
                acc
            })
            .collect();
        Self { deltas, step_blindings, position_blindings }
    }

    fn step_commitments(&self) -> Vec<RistrettoPoint> {
        self.deltas
            .iter()
            .zip(&self.step_blindings)
            .map(|(d, r)| commit(*d, r))
            .collect()
    }
}

/// Check every move against the circuit rules and return the path.
pub fn trace_path(
    params: &CircuitParameters,
    start: GridPoint,
    moves: &[(i32, i32)],
) -> Result<Vec<GridPoint>, ProofGenerationError> {
    let bounds = params.bounds();
    if !bounds.contains(start) {
        return Err(ProofGenerationError::ConstraintViolation {
            index: 0,
            reason: format!("start {} outside game area", start),
        });
    }

    let mut path = Vec::with_capacity(moves.len());
    let mut pos = start;
    for (index, (dx, dy)) in moves.iter().enumerate() {
        let delta = GridPoint::new(*dx, *dy);
        if delta.max_abs() > params.max_step {
            return Err(ProofGenerationError::ConstraintViolation {
                index,
                reason: format!("step {} exceeds max step {}", delta, params.max_step),
            });
        }
        pos = pos + delta;
        if !bounds.contains(pos) {
            return Err(ProofGenerationError::ConstraintViolation {
                index,
                reason: format!("position {} outside game area", pos),
            });
        }
        path.push(pos);
    }
    Ok(path)
}

/// Build and prove a batch.
pub fn prove_batch(
    params: &CircuitParameters,
    peer_id: PeerId,
    batch_seq: u64,
    start_commitment: Hash32,
    start_position: GridPoint,
    moves: &[(i32, i32)],
) -> Result<MovementBatch, ProofGenerationError> {
    let path = trace_path(params, start_position, moves)?;
    let n = path.len();
    let end_position = path.last().copied().unwrap_or(start_position);

    let revealed = reveal_indices(n, params.reveal_ratio);
    let hidden = hidden_indices(n, &revealed);

    let wx = AxisWitness::new(moves.iter().map(|(dx, _)| *dx as i64).collect());
    let wy = AxisWitness::new(moves.iter().map(|(_, dy)| *dy as i64).collect());
    let cx = wx.step_commitments();
    let cy = wy.step_commitments();

    let mut step_bytes = Vec::with_capacity(2 * n);
    for (x, y) in cx.iter().zip(&cy) {
        step_bytes.push(encode_point(x));
        step_bytes.push(encode_point(y));
    }

    let end_commitment = chain_commitment(
        &peer_id, batch_seq, &start_commitment, &step_bytes, end_position,
    );

    let mut batch = MovementBatch {
        peer_id,
        batch_seq,
        proof: Vec::new(),
        public_inputs: PublicInputs {
            start_position,
            revealed_points: revealed.iter().map(|i| path[*i]).collect(),
            redacted_count: (n - revealed.len()) as u32,
            end_position,
            start_commitment,
            end_commitment,
        },
    };

    let transcript = Transcript::new(batch.statement_digest(&params.params_hash()));
    let rng = &mut OsRng;

    // Step bounds
    let values = params.step_values();
    let offset = params.max_step as i64;
    let mut steps = Vec::with_capacity(n);
    for i in 0..n {
        let dx_proof = prove_membership(
            rng, &transcript, STEP_LABEL, &[i as u64, AXIS_X], &cx[i], &values,
            (wx.deltas[i] + offset) as usize, &wx.step_blindings[i],
        );
        let dy_proof = prove_membership(
            rng, &transcript, STEP_LABEL, &[i as u64, AXIS_Y], &cy[i], &values,
            (wy.deltas[i] + offset) as usize, &wy.step_blindings[i],
        );
        steps.push(StepProof {
            dx: step_bytes[2 * i],
            dy: step_bytes[2 * i + 1],
            dx_proof,
            dy_proof,
        });
    }

    // Openings: revealed points, then the end position
    let gens = sigma::generators();
    let opened = revealed.iter().copied().chain((n > 0).then(|| n - 1));
    let mut openings = Vec::with_capacity(revealed.len() + 1);
    for (slot, i) in opened.enumerate() {
        let rx = &wx.position_blindings[i];
        let ry = &wy.position_blindings[i];
        openings.push(PointOpening {
            x: prove_opening(rng, &transcript, OPEN_LABEL, &[slot as u64, AXIS_X], &(rx * gens.h), rx),
            y: prove_opening(rng, &transcript, OPEN_LABEL, &[slot as u64, AXIS_Y], &(ry * gens.h), ry),
        });
    }

    // Bounds of hidden positions
    let (w, h) = (params.half_width as i64, params.half_height as i64);
    let (xb, yb) = (params.x_bits(), params.y_bits());
    let mut ranges = Vec::with_capacity(hidden.len());
    for i in hidden {
        let p = path[i];
        let (x, y) = (p.x as i64, p.y as i64);
        let rx = wx.position_blindings[i];
        let ry = wy.position_blindings[i];
        let idx = i as u64;
        ranges.push(HiddenPosition {
            x_low: prove_range(rng, &transcript, &[idx, AXIS_X, SIDE_LOW], (x + w) as u64, &rx, xb),
            x_high: prove_range(rng, &transcript, &[idx, AXIS_X, SIDE_HIGH], (w - x) as u64, &-rx, xb),
            y_low: prove_range(rng, &transcript, &[idx, AXIS_Y, SIDE_LOW], (y + h) as u64, &ry, yb),
            y_high: prove_range(rng, &transcript, &[idx, AXIS_Y, SIDE_HIGH], (h - y) as u64, &-ry, yb),
        });
    }

    let proof = MovementProof { steps, openings, ranges };
    batch.proof = proof
        .encode()
        .map_err(|e| ProofGenerationError::Encoding(e.to_string()))?;

    debug!(
        "Proved batch {} for {}: {} moves, {} revealed, {} bytes",
        batch_seq, peer_id, n, batch.public_inputs.revealed_points.len(), batch.proof.len()
    );

    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proof::commitment::genesis_commitment;

    fn right(n: usize) -> Vec<(i32, i32)> {
        vec![(1, 0); n]
    }

    #[test]
    fn test_trace_path() {
        let params = CircuitParameters::default();
        let path = trace_path(&params, GridPoint::ORIGIN, &[(1, 0), (0, 1), (-1, -1)]).unwrap();
        assert_eq!(path, vec![GridPoint::new(1, 0), GridPoint::new(1, 1), GridPoint::new(0, 0)]);
    }

    #[test]
    fn test_trace_rejects_jump() {
        let params = CircuitParameters::default();
        let err = trace_path(&params, GridPoint::ORIGIN, &[(1, 0), (3, 0)]).unwrap_err();
        assert!(matches!(err, ProofGenerationError::ConstraintViolation { index: 1, .. }));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_trace_rejects_out_of_bounds() {
        let params = CircuitParameters { half_width: 2, ..Default::default() };
        let err = trace_path(&params, GridPoint::ORIGIN, &right(3)).unwrap_err();
        assert!(matches!(err, ProofGenerationError::ConstraintViolation { index: 2, .. }));
    }

    #[test]
    fn test_prove_ten_moves() {
        let params = CircuitParameters::default();
        let batch = prove_batch(
            &params, PeerId::new([1; 16]), 0, genesis_commitment(), GridPoint::ORIGIN, &right(10),
        ).unwrap();

        let inputs = &batch.public_inputs;
        assert_eq!(inputs.revealed_points.len(), 5);
        assert_eq!(inputs.redacted_count, 5);
        assert_eq!(inputs.end_position, GridPoint::new(10, 0));
        assert_eq!(inputs.revealed_points[0], GridPoint::new(1, 0));

        let proof = MovementProof::decode(&batch.proof).unwrap();
        assert_eq!(proof.steps.len(), 10);
        assert_eq!(proof.openings.len(), 6);
        assert_eq!(proof.ranges.len(), 4);
    }

    #[test]
    fn test_prove_empty_batch() {
        let params = CircuitParameters::default();
        let start = GridPoint::new(3, 3);
        let batch = prove_batch(
            &params, PeerId::new([1; 16]), 2, [7; 32], start, &[],
        ).unwrap();
        assert_eq!(batch.move_count(), 0);
        assert_eq!(batch.public_inputs.end_position, start);

        let proof = MovementProof::decode(&batch.proof).unwrap();
        assert!(proof.steps.is_empty() && proof.openings.is_empty() && proof.ranges.is_empty());
    }
}
