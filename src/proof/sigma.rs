//! Sigma Protocols over Pedersen Commitments
//!
//! Building blocks for movement proofs, all over Ristretto:
//! - Pedersen commitments `C = v·G + r·H`
//! - Disjunctive membership proofs (CDS OR) that a commitment opens to one
//!   of a small public set of values
//! - Schnorr proofs that `Y = r·H` (a commitment opens to a known value)
//! - Bit-decomposition range proofs that a committed value is in `[0, 2^k)`
//!
//! Scalars and points travel as 32-byte canonical encodings.

use std::sync::OnceLock;
use curve25519_dalek::constants::RISTRETTO_BASEPOINT_POINT;
use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use rand::{CryptoRng, RngCore};
use serde::{Serialize, Deserialize};
use sha2::{Digest, Sha512};
use thiserror::Error;
use super::transcript::Transcript;

/// Domain separator for the blinding generator.
const GENERATOR_H_DOMAIN: &[u8] = b"FOOTSTEPS_PEDERSEN_H_V1";

/// Failure of a single sigma proof.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SigmaError {
    /// Scalar or point encoding is not canonical.
    #[error("malformed encoding")]
    Malformed,

    /// Proof has the wrong number of components.
    #[error("expected {expected} components, got {got}")]
    Shape {
        /// Expected count.
        expected: usize,
        /// Actual count.
        got: usize,
    },

    /// Recomputed challenge disagrees with the proof.
    #[error("challenge mismatch")]
    ChallengeMismatch,

    /// Bit commitments do not sum to the target commitment.
    #[error("bit commitments do not sum to target")]
    RangeSum,
}

/// Pedersen generators.
pub struct Generators {
    /// Value generator (Ristretto basepoint).
    pub g: RistrettoPoint,
    /// Blinding generator (hash-to-group, unknown discrete log to G).
    pub h: RistrettoPoint,
}

/// Process-wide generators.
pub fn generators() -> &'static Generators {
    static GENERATORS: OnceLock<Generators> = OnceLock::new();
    GENERATORS.get_or_init(|| {
        let mut hasher = Sha512::new();
        hasher.update(GENERATOR_H_DOMAIN);
        Generators {
            g: RISTRETTO_BASEPOINT_POINT,
            h: RistrettoPoint::from_hash(hasher),
        }
    })
}

/// Map a signed integer into the scalar field.
#[inline]
pub fn scalar_from_i64(value: i64) -> Scalar {
    let magnitude = Scalar::from(value.unsigned_abs());
    if value < 0 { -magnitude } else { magnitude }
}

/// Pedersen commitment to `value` with `blinding`.
#[inline]
pub fn commit(value: i64, blinding: &Scalar) -> RistrettoPoint {
    let gens = generators();
    scalar_from_i64(value) * gens.g + blinding * gens.h
}

/// Fresh random blinding factor.
#[inline]
pub fn random_scalar<R: RngCore + CryptoRng>(rng: &mut R) -> Scalar {
    Scalar::random(rng)
}

/// Decode a canonical scalar.
pub fn decode_scalar(bytes: &[u8; 32]) -> Result<Scalar, SigmaError> {
    Option::<Scalar>::from(Scalar::from_canonical_bytes(*bytes)).ok_or(SigmaError::Malformed)
}

/// Decode a compressed Ristretto point.
pub fn decode_point(bytes: &[u8; 32]) -> Result<RistrettoPoint, SigmaError> {
    CompressedRistretto(*bytes).decompress().ok_or(SigmaError::Malformed)
}

/// Encode a point.
#[inline]
pub fn encode_point(point: &RistrettoPoint) -> [u8; 32] {
    point.compress().to_bytes()
}

// =============================================================================
// MEMBERSHIP (CDS OR)
// =============================================================================

/// Proof that a commitment opens to one of a public set of values.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrProof {
    /// Per-branch challenges (sum to the Fiat–Shamir challenge).
    pub challenges: Vec<[u8; 32]>,
    /// Per-branch responses.
    pub responses: Vec<[u8; 32]>,
}

/// Prove that `commitment = values[secret]·G + blinding·H`.
pub fn prove_membership<R: RngCore + CryptoRng>(
    rng: &mut R,
    transcript: &Transcript,
    label: &[u8],
    path: &[u64],
    commitment: &RistrettoPoint,
    values: &[i64],
    secret: usize,
    blinding: &Scalar,
) -> OrProof {
    let gens = generators();
    let mut announcements = Vec::with_capacity(values.len() + 1);
    announcements.push(*commitment);

    let mut challenges = vec![Scalar::ZERO; values.len()];
    let mut responses = vec![Scalar::ZERO; values.len()];
    let nonce = random_scalar(rng);

    for (j, value) in values.iter().enumerate() {
        if j == secret {
            announcements.push(nonce * gens.h);
        } else {
            // Simulated branch
            let c = random_scalar(rng);
            let z = random_scalar(rng);
            let y = commitment - scalar_from_i64(*value) * gens.g;
            announcements.push(z * gens.h - c * y);
            challenges[j] = c;
            responses[j] = z;
        }
    }

    let total = transcript.challenge(label, path, &announcements);
    let simulated: Scalar = challenges.iter().sum();
    challenges[secret] = total - simulated;
    responses[secret] = nonce + challenges[secret] * blinding;

    OrProof {
        challenges: challenges.iter().map(Scalar::to_bytes).collect(),
        responses: responses.iter().map(Scalar::to_bytes).collect(),
    }
}

/// Verify a membership proof.
pub fn verify_membership(
    transcript: &Transcript,
    label: &[u8],
    path: &[u64],
    commitment: &RistrettoPoint,
    values: &[i64],
    proof: &OrProof,
) -> Result<(), SigmaError> {
    if proof.challenges.len() != values.len() || proof.responses.len() != values.len() {
        return Err(SigmaError::Shape {
            expected: values.len(),
            got: proof.challenges.len().min(proof.responses.len()),
        });
    }

    let gens = generators();
    let mut announcements = Vec::with_capacity(values.len() + 1);
    announcements.push(*commitment);
    let mut sum = Scalar::ZERO;

    for (j, value) in values.iter().enumerate() {
        let c = decode_scalar(&proof.challenges[j])?;
        let z = decode_scalar(&proof.responses[j])?;
        let y = commitment - scalar_from_i64(*value) * gens.g;
        announcements.push(z * gens.h - c * y);
        sum += c;
    }

    if sum != transcript.challenge(label, path, &announcements) {
        return Err(SigmaError::ChallengeMismatch);
    }
    Ok(())
}

// =============================================================================
// OPENING (SCHNORR)
// =============================================================================

/// Proof of knowledge of `r` such that `Y = r·H`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpeningProof {
    /// Challenge.
    pub challenge: [u8; 32],
    /// Response.
    pub response: [u8; 32],
}

/// Prove knowledge of the blinding behind `y = blinding·H`.
pub fn prove_opening<R: RngCore + CryptoRng>(
    rng: &mut R,
    transcript: &Transcript,
    label: &[u8],
    path: &[u64],
    y: &RistrettoPoint,
    blinding: &Scalar,
) -> OpeningProof {
    let nonce = random_scalar(rng);
    let announcement = nonce * generators().h;
    let c = transcript.challenge(label, path, &[*y, announcement]);
    let z = nonce + c * blinding;
    OpeningProof {
        challenge: c.to_bytes(),
        response: z.to_bytes(),
    }
}

/// Verify an opening proof.
pub fn verify_opening(
    transcript: &Transcript,
    label: &[u8],
    path: &[u64],
    y: &RistrettoPoint,
    proof: &OpeningProof,
) -> Result<(), SigmaError> {
    let c = decode_scalar(&proof.challenge)?;
    let z = decode_scalar(&proof.response)?;
    let announcement = z * generators().h - c * y;
    if c != transcript.challenge(label, path, &[*y, announcement]) {
        return Err(SigmaError::ChallengeMismatch);
    }
    Ok(())
}

// =============================================================================
// RANGE (BIT DECOMPOSITION)
// =============================================================================

/// Values a single bit may take.
const BIT_VALUES: [i64; 2] = [0, 1];

/// Proof that a commitment opens to a value in `[0, 2^bits)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeProof {
    /// Commitments to each bit, least significant first.
    pub bits: Vec<[u8; 32]>,
    /// Per-bit membership proofs over {0, 1}.
    pub bit_proofs: Vec<OrProof>,
}

/// Prove `value·G + blinding·H` commits to a value in `[0, 2^bits)`.
///
/// Caller guarantees `value < 2^bits`.
pub fn prove_range<R: RngCore + CryptoRng>(
    rng: &mut R,
    transcript: &Transcript,
    path: &[u64],
    value: u64,
    blinding: &Scalar,
    bits: u32,
) -> RangeProof {
    // Bit blindings must recombine to the target blinding
    let mut blindings = vec![Scalar::ZERO; bits as usize];
    let mut rest = Scalar::ZERO;
    for (i, slot) in blindings.iter_mut().enumerate().skip(1) {
        *slot = random_scalar(rng);
        rest += Scalar::from(1u64 << i) * *slot;
    }
    if let Some(first) = blindings.first_mut() {
        *first = blinding - rest;
    }

    let mut commitments = Vec::with_capacity(bits as usize);
    let mut bit_proofs = Vec::with_capacity(bits as usize);
    let mut bit_path = path.to_vec();
    bit_path.push(0);

    for (i, s) in blindings.iter().enumerate() {
        let bit = ((value >> i) & 1) as i64;
        let c = commit(bit, s);
        if let Some(last) = bit_path.last_mut() {
            *last = i as u64;
        }
        bit_proofs.push(prove_membership(
            rng, transcript, b"bit", &bit_path, &c, &BIT_VALUES, bit as usize, s,
        ));
        commitments.push(encode_point(&c));
    }

    RangeProof { bits: commitments, bit_proofs }
}

/// Verify that `target` commits to a value in `[0, 2^bits)`.
pub fn verify_range(
    transcript: &Transcript,
    path: &[u64],
    target: &RistrettoPoint,
    bits: u32,
    proof: &RangeProof,
) -> Result<(), SigmaError> {
    let n = bits as usize;
    if proof.bits.len() != n || proof.bit_proofs.len() != n {
        return Err(SigmaError::Shape {
            expected: n,
            got: proof.bits.len().min(proof.bit_proofs.len()),
        });
    }

    let commitments = proof.bits
        .iter()
        .map(decode_point)
        .collect::<Result<Vec<_>, _>>()?;

    let recombined: RistrettoPoint = commitments
        .iter()
        .enumerate()
        .map(|(i, c)| Scalar::from(1u64 << i) * c)
        .sum();
    if recombined != *target {
        return Err(SigmaError::RangeSum);
    }

    let mut bit_path = path.to_vec();
    bit_path.push(0);
    for (i, (c, bit_proof)) in commitments.iter().zip(&proof.bit_proofs).enumerate() {
        if let Some(last) = bit_path.last_mut() {
            *last = i as u64;
        }
        verify_membership(transcript, b"bit", &bit_path, c, &BIT_VALUES, bit_proof)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn transcript() -> Transcript {
        Transcript::new([9; 32])
    }

    #[test]
    fn test_commit_homomorphic() {
        let r1 = random_scalar(&mut OsRng);
        let r2 = random_scalar(&mut OsRng);
        assert_eq!(commit(3, &r1) + commit(-5, &r2), commit(-2, &(r1 + r2)));
    }

    #[test]
    fn test_scalar_from_negative() {
        assert_eq!(scalar_from_i64(-4) + scalar_from_i64(4), Scalar::ZERO);
    }

    #[test]
    fn test_membership_valid() {
        let t = transcript();
        let values = [-1, 0, 1];
        for (secret, value) in values.iter().enumerate() {
            let r = random_scalar(&mut OsRng);
            let c = commit(*value, &r);
            let proof = prove_membership(&mut OsRng, &t, b"step", &[0], &c, &values, secret, &r);
            assert!(verify_membership(&t, b"step", &[0], &c, &values, &proof).is_ok());
        }
    }

    #[test]
    fn test_membership_wrong_value_fails() {
        let t = transcript();
        let r = random_scalar(&mut OsRng);
        // Commit to 2 but claim it is the "1" branch
        let c = commit(2, &r);
        let proof = prove_membership(&mut OsRng, &t, b"step", &[0], &c, &[-1, 0, 1], 2, &r);
        assert_eq!(
            verify_membership(&t, b"step", &[0], &c, &[-1, 0, 1], &proof),
            Err(SigmaError::ChallengeMismatch)
        );
    }

    #[test]
    fn test_membership_wrong_path_fails() {
        let t = transcript();
        let r = random_scalar(&mut OsRng);
        let c = commit(0, &r);
        let proof = prove_membership(&mut OsRng, &t, b"step", &[0], &c, &[0, 1], 0, &r);
        assert!(verify_membership(&t, b"step", &[1], &c, &[0, 1], &proof).is_err());
    }

    #[test]
    fn test_membership_shape() {
        let t = transcript();
        let r = random_scalar(&mut OsRng);
        let c = commit(0, &r);
        let proof = prove_membership(&mut OsRng, &t, b"step", &[0], &c, &[0, 1], 0, &r);
        assert!(matches!(
            verify_membership(&t, b"step", &[0], &c, &[-1, 0, 1], &proof),
            Err(SigmaError::Shape { expected: 3, .. })
        ));
    }

    #[test]
    fn test_opening() {
        let t = transcript();
        let r = random_scalar(&mut OsRng);
        let c = commit(7, &r);
        let y = c - scalar_from_i64(7) * generators().g;
        let proof = prove_opening(&mut OsRng, &t, b"open", &[1, 0], &y, &r);
        assert!(verify_opening(&t, b"open", &[1, 0], &y, &proof).is_ok());

        // Claiming a different value changes Y
        let wrong = c - scalar_from_i64(8) * generators().g;
        assert!(verify_opening(&t, b"open", &[1, 0], &wrong, &proof).is_err());
    }

    #[test]
    fn test_range_valid() {
        let t = transcript();
        for value in [0u64, 1, 37, 127] {
            let r = random_scalar(&mut OsRng);
            let target = commit(value as i64, &r);
            let proof = prove_range(&mut OsRng, &t, &[4], value, &r, 7);
            assert!(verify_range(&t, &[4], &target, 7, &proof).is_ok());
        }
    }

    #[test]
    fn test_range_negative_blinding() {
        let t = transcript();
        let r = random_scalar(&mut OsRng);
        let target = commit(5, &-r);
        let proof = prove_range(&mut OsRng, &t, &[0], 5, &-r, 4);
        assert!(verify_range(&t, &[0], &target, 4, &proof).is_ok());
    }

    #[test]
    fn test_range_wrong_target() {
        let t = transcript();
        let r = random_scalar(&mut OsRng);
        let proof = prove_range(&mut OsRng, &t, &[0], 5, &r, 4);
        let other = commit(6, &r);
        assert_eq!(verify_range(&t, &[0], &other, 4, &proof), Err(SigmaError::RangeSum));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_point(&[0xff; 32]).is_err());
        assert!(decode_scalar(&[0xff; 32]).is_err());
    }
}
