//! Proof Batcher
//!
//! Periodically cuts the movement buffer and proves the drained moves.
//!
//! ```text
//!   interval tick ─┐
//!   test command ──┼─► drain ─► spawn_blocking(prove_batch) ─► BatcherOutput
//!   shutdown ──────┘                   │
//!                       recoverable ◄──┴──► constraint violation
//!                       restore moves        rebase buffer
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use crate::core::id::PeerId;
use crate::proof::{prove_batch, ChainCursor, CircuitParameters, MovementBatch, ProofGenerationError};
use super::buffer::SharedBuffer;

/// What a cycle hands to the node.
#[derive(Clone, Debug)]
pub enum BatcherOutput {
    /// A freshly proven batch.
    Batch(MovementBatch),
    /// Nothing to prove; announce liveness instead.
    Idle {
        /// Last batch of the local chain.
        last_batch_seq: Option<u64>,
    },
}

/// Prover state exposed to the UI.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProverActivity {
    /// A proof is being generated.
    pub processing: bool,
    /// Moves in the last produced batch.
    pub last_batch_size: usize,
    /// The last cycle failed.
    pub last_failed: bool,
}

/// Handle for forcing an immediate cycle.
#[derive(Clone, Debug, Default)]
pub struct BatcherHandle {
    force: Arc<Notify>,
}

impl BatcherHandle {
    /// Run a cycle now, producing a batch even with no pending moves.
    pub fn request_test_batch(&self) {
        self.force.notify_one();
    }
}

/// Turns buffered moves into batches.
pub struct ProofBatcher {
    peer_id: PeerId,
    params: Arc<CircuitParameters>,
    buffer: SharedBuffer,
    cursor: ChainCursor,
    interval: Duration,
    handle: BatcherHandle,
    activity: watch::Sender<ProverActivity>,
    output: mpsc::Sender<BatcherOutput>,
}

impl ProofBatcher {
    /// Create a batcher for a fresh chain.
    pub fn new(
        peer_id: PeerId,
        params: Arc<CircuitParameters>,
        buffer: SharedBuffer,
        interval: Duration,
        output: mpsc::Sender<BatcherOutput>,
    ) -> Self {
        let cursor = ChainCursor::genesis(params.spawn);
        let (activity, _) = watch::channel(ProverActivity::default());
        Self {
            peer_id,
            params,
            buffer,
            cursor,
            interval,
            handle: BatcherHandle::default(),
            activity,
            output,
        }
    }

    /// Handle for the test command.
    pub fn handle(&self) -> BatcherHandle {
        self.handle.clone()
    }

    /// Subscribe to prover activity.
    pub fn activity(&self) -> watch::Receiver<ProverActivity> {
        self.activity.subscribe()
    }

    /// Where the local chain ends.
    pub fn cursor(&self) -> &ChainCursor {
        &self.cursor
    }

    /// Run one batching cycle.
    ///
    /// Returns `Idle` for an empty, non-forced cycle. On failure the
    /// buffer is restored (recoverable) or rebased (constraint violation).
    pub async fn cycle(&mut self, forced: bool) -> Result<BatcherOutput, ProofGenerationError> {
        let drained = self.buffer.lock().drain_since_last_cut();
        if drained.is_empty() && !forced {
            return Ok(BatcherOutput::Idle {
                last_batch_seq: self.cursor.next_seq.checked_sub(1),
            });
        }

        self.activity.send_modify(|a| a.processing = true);

        let params = Arc::clone(&self.params);
        let peer_id = self.peer_id;
        let seq = self.cursor.next_seq;
        let start_commitment = self.cursor.end_commitment;
        let start_position = self.cursor.end_position;
        let moves = drained.moves();
        debug!("Proving batch {} with {} moves", seq, moves.len());

        let result = tokio::task::spawn_blocking(move || {
            prove_batch(&params, peer_id, seq, start_commitment, start_position, &moves)
        })
        .await
        .map_err(|e| ProofGenerationError::Worker(e.to_string()))
        .and_then(|r| r);

        match result {
            Ok(batch) => {
                self.cursor.advance(&batch);
                let size = batch.move_count();
                self.activity.send_modify(|a| {
                    a.processing = false;
                    a.last_batch_size = size;
                    a.last_failed = false;
                });
                info!("Batch {} ready: {} moves", seq, size);
                Ok(BatcherOutput::Batch(batch))
            }
            Err(e) => {
                if e.is_recoverable() {
                    warn!("Proof generation failed, keeping moves for next cycle: {}", e);
                    self.buffer.lock().restore(drained);
                } else {
                    warn!("Discarding unprovable moves: {}", e);
                    self.buffer.lock().rebase(self.cursor.end_position);
                }
                self.activity.send_modify(|a| {
                    a.processing = false;
                    a.last_failed = true;
                });
                Err(e)
            }
        }
    }

    /// Run until shutdown. An in-flight proof is abandoned on shutdown.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        let force = Arc::clone(&self.handle.force);
        loop {
            let forced = tokio::select! {
                _ = ticker.tick() => false,
                _ = force.notified() => true,
                _ = shutdown.recv() => break,
            };

            let outcome = tokio::select! {
                outcome = self.cycle(forced) => outcome,
                _ = shutdown.recv() => {
                    info!("Shutdown during proof generation, abandoning batch");
                    break;
                }
            };

            match outcome {
                Ok(output) => {
                    if self.output.send(output).await.is_err() {
                        break;
                    }
                }
                Err(e) => debug!("Cycle skipped: {}", e),
            }
        }

        info!("Batcher stopped");
    }
}
