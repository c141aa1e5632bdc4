//! Local movement capture and batching.

pub mod buffer;
pub mod batcher;

pub use buffer::{Direction, Drained, MoveRecord, MovementBuffer, SharedBuffer};
pub use batcher::{BatcherHandle, BatcherOutput, ProofBatcher, ProverActivity};
