//! Movement Proof System
//!
//! Committed, partially redacted proofs that a run of moves obeys the
//! movement rules.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    PROOF SYSTEM                             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  params.rs      - Circuit parameters (verifying key)        │
//! │  reveal.rs      - Which path points are disclosed           │
//! │  sigma.rs       - Pedersen commitments, OR/Schnorr/range    │
//! │  transcript.rs  - Fiat–Shamir challenges                    │
//! │  commitment.rs  - Chain links between batches               │
//! │  batch.rs       - MovementBatch + public inputs             │
//! │  prover.rs      - Batch construction                        │
//! │  verify.rs      - Proof + chain verification                │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod params;
pub mod reveal;
pub mod sigma;
pub mod transcript;
pub mod commitment;
pub mod batch;
pub mod prover;
pub mod verify;

// Re-export key types
pub use params::CircuitParameters;
pub use reveal::{reveal_count, reveal_indices};
pub use commitment::{ChainCursor, chain_commitment, genesis_commitment};
pub use batch::{MovementBatch, PublicInputs};
pub use prover::{prove_batch, MovementProof, ProofGenerationError};
pub use verify::{
    verify_batch, OrderingPolicy, ProofVerifier, ProofVerificationError, SigmaProofVerifier,
    TrailView, Verdict, VerificationError,
};
