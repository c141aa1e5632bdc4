//! State Feed
//!
//! What the UI sees and the only way it acts on the node.
//!
//! ```text
//!   Reconciler events ──┐
//!   Remote verifying ───┤
//!   Prover activity ────┼──► StateFeed ──► changes (watch) ──► UI server
//!   Trail changes ──────┘        ▲
//!                                └── apply_command(key) ◄── UI server
//! ```
//!
//! Position is the tentative buffer position, so the UI moves on every key
//! press. Trails only ever contain verified points.
//!
//! The proof status follows both pipelines: our own prover and the
//! verification of peers' batches. `Verifying` shows while either is busy;
//! afterwards the status falls back to the last settled outcome.

use std::fmt;
use std::sync::Arc;
use parking_lot::Mutex;
use serde::{Serialize, Deserialize};
use tokio::sync::{broadcast, watch};
use tracing::debug;
use crate::core::point::GridPoint;
use crate::movement::{BatcherHandle, ProverActivity, SharedBuffer};
use crate::network::protocol::Key;
use crate::trail::{ReconcileOutcome, Reconciler, TrailSnapshot};

/// Local proof pipeline status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProofStatus {
    /// No local batch verified yet.
    #[serde(rename = "Connecting…")]
    Connecting,
    /// A batch is being proven or verified.
    Verifying,
    /// Last local batch verified.
    Verified,
    /// Last local batch failed.
    Rejected,
}

impl fmt::Display for ProofStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ProofStatus::Connecting => "Connecting…",
            ProofStatus::Verifying => "Verifying",
            ProofStatus::Verified => "Verified",
            ProofStatus::Rejected => "Rejected",
        };
        f.write_str(text)
    }
}

/// Everything the UI renders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    /// Tentative local position.
    pub position: GridPoint,
    /// Local proof status.
    pub proof_status: ProofStatus,
    /// A proof is in flight.
    pub processing: bool,
    /// Moves in the last local batch.
    pub last_batch_size: usize,
    /// Local verified trail as `[x, y]`.
    pub trail: Vec<[i32; 2]>,
    /// Visible remote peers.
    pub peers: Vec<TrailSnapshot>,
    /// Display name of this node.
    pub node_name: String,
}

#[derive(Debug, Clone, Copy)]
struct StatusState {
    shown: ProofStatus,
    /// Last verified or rejected outcome.
    settled: ProofStatus,
}

struct Inner {
    node_name: String,
    step: i32,
    buffer: SharedBuffer,
    reconciler: Reconciler,
    batcher: BatcherHandle,
    activity: watch::Receiver<ProverActivity>,
    status: Mutex<StatusState>,
    changed: watch::Sender<u64>,
    notices: broadcast::Sender<String>,
}

/// Shared handle to the feed.
#[derive(Clone)]
pub struct StateFeed {
    inner: Arc<Inner>,
}

impl StateFeed {
    /// Create a feed. `step` is the magnitude of one key press.
    pub fn new(
        node_name: impl Into<String>,
        step: i32,
        buffer: SharedBuffer,
        reconciler: Reconciler,
        batcher: BatcherHandle,
        activity: watch::Receiver<ProverActivity>,
    ) -> Self {
        let (changed, _) = watch::channel(0);
        let (notices, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                node_name: node_name.into(),
                step,
                buffer,
                reconciler,
                batcher,
                activity,
                status: Mutex::new(StatusState {
                    shown: ProofStatus::Connecting,
                    settled: ProofStatus::Connecting,
                }),
                changed,
                notices,
            }),
        }
    }

    /// Current state.
    pub async fn snapshot(&self) -> StateSnapshot {
        let inner = &self.inner;
        let activity = inner.activity.borrow().clone();
        let trail = inner
            .reconciler
            .local_trail()
            .await
            .map(|t| t.verified_points.iter().map(|p| p.to_pair()).collect())
            .unwrap_or_default();
        let peers = inner.reconciler.visible().await;
        let position = inner.buffer.lock().position();

        StateSnapshot {
            position,
            proof_status: self.status(),
            processing: activity.processing,
            last_batch_size: activity.last_batch_size,
            trail,
            peers,
            node_name: inner.node_name.clone(),
        }
    }

    /// Current proof status.
    pub fn status(&self) -> ProofStatus {
        self.inner.status.lock().shown
    }

    /// Apply a UI key press.
    pub fn apply_command(&self, key: Key) {
        match key.direction() {
            Some(direction) => {
                let (dx, dy) = direction.delta(self.inner.step);
                let record = self.inner.buffer.lock().record(dx, dy);
                debug!("Move {} recorded: ({}, {})", record.sequence_no, record.dx, record.dy);
            }
            None => {
                debug!("Test batch requested");
                self.inner.batcher.request_test_batch();
            }
        }
        self.bump();
    }

    /// Watch for snapshot changes.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.inner.changed.subscribe()
    }

    /// Subscribe to peer notices.
    pub fn notices(&self) -> broadcast::Receiver<String> {
        self.inner.notices.subscribe()
    }

    /// Publish a peer notice to UI clients.
    pub fn notify(&self, message: impl Into<String>) {
        let _ = self.inner.notices.send(message.into());
    }

    fn settle(&self, status: ProofStatus) {
        let mut state = self.inner.status.lock();
        state.shown = status;
        state.settled = status;
    }

    fn show(&self, status: ProofStatus) {
        self.inner.status.lock().shown = status;
    }

    fn bump(&self) {
        self.inner.changed.send_modify(|v| *v = v.wrapping_add(1));
    }

    fn fold_outcome(&self, outcome: &ReconcileOutcome) {
        match outcome {
            ReconcileOutcome::Applied => self.settle(ProofStatus::Verified),
            ReconcileOutcome::RolledBack { .. } => self.settle(ProofStatus::Rejected),
            ReconcileOutcome::Duplicate | ReconcileOutcome::Behind { .. } => return,
        }
        self.bump();
    }

    /// Fold one local reconcile outcome into the status.
    pub fn on_local_outcome(&self, outcome: &ReconcileOutcome) {
        self.fold_outcome(outcome);
    }

    /// Fold the outcome of verifying a peer's batch into the status.
    pub fn on_remote_outcome(&self, outcome: &ReconcileOutcome) {
        self.fold_outcome(outcome);
    }

    /// Track how many peer batches are being verified.
    pub fn on_remote_verifying(&self, in_flight: usize) {
        if in_flight > 0 {
            self.show(ProofStatus::Verifying);
        } else if !self.inner.activity.borrow().processing {
            let mut state = self.inner.status.lock();
            if state.shown == ProofStatus::Verifying {
                state.shown = state.settled;
            }
        }
        self.bump();
    }

    /// Fold prover activity into the status.
    pub fn on_activity(&self, activity: &ProverActivity) {
        if activity.processing {
            self.show(ProofStatus::Verifying);
        } else if activity.last_failed {
            self.settle(ProofStatus::Rejected);
        }
        self.bump();
    }

    /// Track reconciler and prover state until shutdown.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut events = self.inner.reconciler.subscribe();
        let mut trails = self.inner.reconciler.changes();
        let mut activity = self.inner.activity.clone();
        let mut verifying = self.inner.reconciler.verifying();
        let mut prover_alive = true;

        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Ok(event) if event.local => self.on_local_outcome(&event.outcome),
                        Ok(event) => self.on_remote_outcome(&event.outcome),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!("Feed lagged {} reconcile events", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                changed = trails.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.bump();
                }
                changed = verifying.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let in_flight = *verifying.borrow_and_update();
                    self.on_remote_verifying(in_flight);
                }
                changed = activity.changed(), if prover_alive => {
                    match changed {
                        Ok(()) => {
                            let current = activity.borrow_and_update().clone();
                            self.on_activity(&current);
                        }
                        Err(_) => prover_alive = false,
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use crate::core::id::PeerId;
    use crate::movement::{MovementBuffer, ProofBatcher};
    use crate::proof::{genesis_commitment, prove_batch, CircuitParameters, SigmaProofVerifier};
    use crate::trail::ReconcilePolicy;

    const LOCAL: PeerId = PeerId::new([7; 16]);

    fn feed() -> (StateFeed, ProofBatcher, Reconciler) {
        let params = Arc::new(CircuitParameters::default());
        let buffer = MovementBuffer::new(params.bounds(), params.spawn).shared();
        let reconciler = Reconciler::new(
            LOCAL,
            Arc::clone(&params),
            Arc::new(SigmaProofVerifier),
            ReconcilePolicy::default(),
        );
        let (tx, _rx) = mpsc::channel(8);
        let batcher = ProofBatcher::new(LOCAL, Arc::clone(&params), Arc::clone(&buffer), Duration::from_secs(5), tx);
        let feed = StateFeed::new("alice", 1, buffer, reconciler.clone(), batcher.handle(), batcher.activity());
        (feed, batcher, reconciler)
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(ProofStatus::Connecting.to_string(), "Connecting…");
        assert_eq!(serde_json::to_value(ProofStatus::Connecting).unwrap(), "Connecting…");
        assert_eq!(serde_json::to_value(ProofStatus::Rejected).unwrap(), "Rejected");
    }

    #[tokio::test]
    async fn test_initial_snapshot() {
        let (feed, _batcher, _) = feed();
        let snapshot = feed.snapshot().await;
        assert_eq!(snapshot.position, GridPoint::ORIGIN);
        assert_eq!(snapshot.proof_status, ProofStatus::Connecting);
        assert!(!snapshot.processing);
        assert!(snapshot.trail.is_empty());
        assert!(snapshot.peers.is_empty());

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["nodeName"], "alice");
        assert_eq!(json["proofStatus"], "Connecting…");
        assert_eq!(json["lastBatchSize"], 0);
        assert_eq!(json["position"]["y"], 0);
    }

    #[tokio::test]
    async fn test_commands_move_tentative_position() {
        let (feed, _batcher, _) = feed();
        let mut changes = feed.changes();
        feed.apply_command(Key::Up);
        feed.apply_command(Key::Up);
        feed.apply_command(Key::Left);
        assert!(changes.has_changed().unwrap());
        assert_eq!(feed.snapshot().await.position, GridPoint::new(-1, 2));
    }

    #[tokio::test]
    async fn test_local_batch_verified() {
        let (feed, mut batcher, reconciler) = feed();
        feed.apply_command(Key::Right);
        feed.apply_command(Key::Right);

        feed.on_activity(&ProverActivity { processing: true, ..Default::default() });
        assert_eq!(feed.status(), ProofStatus::Verifying);

        let batch = match batcher.cycle(false).await.unwrap() {
            crate::movement::BatcherOutput::Batch(b) => b,
            other => panic!("expected batch, got {:?}", other),
        };
        let outcome = reconciler.process(batch).await;
        feed.on_local_outcome(&outcome);

        let snapshot = feed.snapshot().await;
        assert_eq!(snapshot.proof_status, ProofStatus::Verified);
        assert_eq!(snapshot.last_batch_size, 2);
        assert_eq!(snapshot.trail, vec![[1, 0]]);
        assert_eq!(snapshot.position, GridPoint::new(2, 0));
    }

    async fn wait_status(feed: &StateFeed, expected: ProofStatus) {
        let mut changes = feed.changes();
        tokio::time::timeout(Duration::from_secs(10), async {
            while feed.status() != expected {
                changes.changed().await.unwrap();
            }
        })
        .await
        .unwrap_or_else(|_| panic!("status stuck at {}, wanted {}", feed.status(), expected));
    }

    #[tokio::test]
    async fn test_remote_outcomes_drive_status() {
        let (feed, _batcher, reconciler) = feed();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(feed.clone().run(shutdown_rx));
        // Let the feed subscribe before anything is reconciled
        tokio::task::yield_now().await;

        let params = CircuitParameters::default();
        let remote = PeerId::new([8; 16]);
        let b0 = prove_batch(&params, remote, 0, genesis_commitment(), params.spawn, &[(1, 0); 2]).unwrap();
        assert_eq!(reconciler.process(b0.clone()).await, ReconcileOutcome::Applied);
        wait_status(&feed, ProofStatus::Verified).await;

        let mut tampered = prove_batch(
            &params,
            remote,
            1,
            b0.public_inputs.end_commitment,
            b0.public_inputs.end_position,
            &[(0, 1); 2],
        )
        .unwrap();
        tampered.public_inputs.revealed_points[0] = GridPoint::new(5, 5);
        assert!(reconciler.process(tampered).await.is_rejection());
        wait_status(&feed, ProofStatus::Rejected).await;

        let _ = shutdown_tx.send(());
        let _ = task.await;
    }

    #[tokio::test]
    async fn test_verifying_falls_back_to_settled() {
        let (feed, _batcher, _) = feed();
        feed.on_remote_verifying(1);
        assert_eq!(feed.status(), ProofStatus::Verifying);
        feed.on_remote_verifying(0);
        assert_eq!(feed.status(), ProofStatus::Connecting);

        feed.on_remote_outcome(&ReconcileOutcome::Applied);
        feed.on_remote_verifying(2);
        feed.on_remote_outcome(&ReconcileOutcome::Behind { expected: 0 });
        assert_eq!(feed.status(), ProofStatus::Verifying);
        feed.on_remote_verifying(0);
        assert_eq!(feed.status(), ProofStatus::Verified);
    }

    #[tokio::test]
    async fn test_rejection_status() {
        let (feed, _batcher, _) = feed();
        feed.on_local_outcome(&ReconcileOutcome::RolledBack { reason: "bad".into(), suspect: false });
        assert_eq!(feed.status(), ProofStatus::Rejected);
        feed.on_local_outcome(&ReconcileOutcome::Duplicate);
        assert_eq!(feed.status(), ProofStatus::Rejected);
    }
}
