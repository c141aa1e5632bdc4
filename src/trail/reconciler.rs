//! Peer State Reconciler
//!
//! Owns every peer's trail. Batches for one peer go through that peer's
//! lane and are applied strictly in arrival order; lanes of different peers
//! run concurrently. Verification runs on the blocking pool against a
//! snapshot of the trail, and the outcome is applied under the write lock.
//!
//! A rejected batch changes nothing but the rejection counters: the trail
//! keeps showing the state after the last verified batch.
//!
//! Every applied batch is archived so neighbours that join late, evicted a
//! trail or lost frames can catch up from us.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use crate::core::id::PeerId;
use crate::proof::{
    verify_batch, CircuitParameters, MovementBatch, OrderingPolicy, ProofVerifier, Verdict,
    VerificationError,
};
use super::peer_trail::{PeerTrail, TrailSnapshot, TrailStatus};

/// Staleness and ordering rules.
#[derive(Debug, Clone)]
pub struct ReconcilePolicy {
    /// Require gap-free, genesis-anchored chains.
    pub strict_ordering: bool,
    /// Silence after which a peer goes stale.
    pub stale_after: Duration,
    /// How long a stale trail is kept before eviction.
    pub eviction_grace: Duration,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self {
            strict_ordering: true,
            stale_after: Duration::from_secs(15),
            eviction_grace: Duration::from_secs(30),
        }
    }
}

/// Result of reconciling one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Batch verified and applied.
    Applied,
    /// Already applied; nothing changed.
    Duplicate,
    /// Batch is ahead of the verified chain; nothing changed until the
    /// missing batches arrive.
    Behind {
        /// Next batch the trail can take.
        expected: u64,
    },
    /// Batch rejected; trail left at its last verified state.
    RolledBack {
        /// Why.
        reason: String,
        /// Sender is now suspect.
        suspect: bool,
    },
}

impl ReconcileOutcome {
    /// True for a rejected batch.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::RolledBack { .. })
    }
}

/// Notification for each reconciled batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileEvent {
    /// Batch author.
    pub peer_id: PeerId,
    /// Batch sequence number.
    pub batch_seq: u64,
    /// Author is the local node.
    pub local: bool,
    /// What happened.
    pub outcome: ReconcileOutcome,
}

/// Trails changed by a sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Peers that went stale.
    pub staled: Vec<PeerId>,
    /// Peers removed.
    pub evicted: Vec<PeerId>,
}

struct Inner {
    local_id: PeerId,
    params: Arc<CircuitParameters>,
    verifier: Arc<dyn ProofVerifier>,
    policy: ReconcilePolicy,
    trails: RwLock<BTreeMap<PeerId, PeerTrail>>,
    lanes: Mutex<HashMap<PeerId, mpsc::UnboundedSender<MovementBatch>>>,
    archive: Mutex<HashMap<PeerId, Vec<MovementBatch>>>,
    events: broadcast::Sender<ReconcileEvent>,
    changed: watch::Sender<u64>,
    verifying: watch::Sender<usize>,
}

/// Shared handle to the reconciler.
#[derive(Clone)]
pub struct Reconciler {
    inner: Arc<Inner>,
}

impl Reconciler {
    /// Create a reconciler. The local trail starts pending at spawn.
    pub fn new(
        local_id: PeerId,
        params: Arc<CircuitParameters>,
        verifier: Arc<dyn ProofVerifier>,
        policy: ReconcilePolicy,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        let (changed, _) = watch::channel(0);
        let (verifying, _) = watch::channel(0);
        let mut trails = BTreeMap::new();
        trails.insert(local_id, PeerTrail::new(local_id, params.spawn, Instant::now()));

        Self {
            inner: Arc::new(Inner {
                local_id,
                params,
                verifier,
                policy,
                trails: RwLock::new(trails),
                lanes: Mutex::new(HashMap::new()),
                archive: Mutex::new(HashMap::new()),
                events,
                changed,
                verifying,
            }),
        }
    }

    /// Local peer id.
    pub fn local_id(&self) -> PeerId {
        self.inner.local_id
    }

    /// Subscribe to reconcile outcomes.
    pub fn subscribe(&self) -> broadcast::Receiver<ReconcileEvent> {
        self.inner.events.subscribe()
    }

    /// Watch for any trail change.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.inner.changed.subscribe()
    }

    /// Remote batches currently being verified.
    pub fn verifying(&self) -> watch::Receiver<usize> {
        self.inner.verifying.subscribe()
    }

    /// Queue a batch on its author's lane.
    pub fn submit(&self, batch: MovementBatch) {
        let peer_id = batch.peer_id;
        let mut lanes = self.inner.lanes.lock();
        let lane = lanes
            .entry(peer_id)
            .or_insert_with(|| self.spawn_lane(peer_id));
        if let Err(mpsc::error::SendError(batch)) = lane.send(batch) {
            // Worker gone (evicted mid-flight); start a fresh lane
            let fresh = self.spawn_lane(peer_id);
            let _ = fresh.send(batch);
            lanes.insert(peer_id, fresh);
        }
    }

    fn spawn_lane(&self, peer_id: PeerId) -> mpsc::UnboundedSender<MovementBatch> {
        let (tx, mut rx) = mpsc::unbounded_channel::<MovementBatch>();
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(batch) = rx.recv().await {
                this.process(batch).await;
            }
            debug!("Lane for {} closed", peer_id);
        });
        tx
    }

    /// Verify and apply one batch. Callers must serialize per peer.
    pub async fn process(&self, batch: MovementBatch) -> ReconcileOutcome {
        let remote = batch.peer_id != self.inner.local_id;
        if remote {
            self.inner.verifying.send_modify(|n| *n += 1);
        }
        let outcome = self.verify_and_apply(batch).await;
        if remote {
            self.inner.verifying.send_modify(|n| *n = n.saturating_sub(1));
        }
        outcome
    }

    async fn verify_and_apply(&self, batch: MovementBatch) -> ReconcileOutcome {
        let inner = &self.inner;
        let peer_id = batch.peer_id;
        let batch_seq = batch.batch_seq;

        let view = {
            let trails = inner.trails.read().await;
            match trails.get(&peer_id) {
                Some(trail) => trail.view(),
                None => PeerTrail::new(peer_id, inner.params.spawn, Instant::now()).view(),
            }
        };

        let params = Arc::clone(&inner.params);
        let verifier = Arc::clone(&inner.verifier);
        let policy = OrderingPolicy { strict: inner.policy.strict_ordering };
        let (verdict, batch) = match tokio::task::spawn_blocking(move || {
            let verdict = verify_batch(&view, &batch, &params, verifier.as_ref(), policy);
            (verdict, batch)
        })
        .await
        {
            Ok(result) => result,
            Err(e) => {
                warn!("Verification worker failed for {} batch {}: {}", peer_id, batch_seq, e);
                return ReconcileOutcome::RolledBack {
                    reason: format!("verification worker failed: {}", e),
                    suspect: false,
                };
            }
        };

        let now = Instant::now();
        let outcome = {
            let mut trails = inner.trails.write().await;
            let trail = trails
                .entry(peer_id)
                .or_insert_with(|| PeerTrail::new(peer_id, inner.params.spawn, now));

            match verdict {
                Ok(Verdict::Accept) => {
                    trail.apply_verified(&batch, now);
                    debug!(
                        "Applied batch {} from {}: position {}",
                        batch_seq, peer_id, trail.current_position
                    );
                    inner.archive.lock().entry(peer_id).or_default().push(batch);
                    ReconcileOutcome::Applied
                }
                Ok(Verdict::Duplicate) => ReconcileOutcome::Duplicate,
                Err(VerificationError::OutOfOrder { expected, got }) => {
                    debug!("Batch {} from {} is ahead of {}, catching up", got, peer_id, expected);
                    ReconcileOutcome::Behind { expected }
                }
                Err(e) => {
                    trail.note_rejection(&e);
                    warn!("Rejected batch {} from {}: {}", batch_seq, peer_id, e);
                    ReconcileOutcome::RolledBack {
                        reason: e.to_string(),
                        suspect: trail.suspect,
                    }
                }
            }
        };

        if outcome != ReconcileOutcome::Duplicate {
            if !matches!(outcome, ReconcileOutcome::Behind { .. }) {
                self.bump();
            }
            let _ = inner.events.send(ReconcileEvent {
                peer_id,
                batch_seq,
                local: peer_id == inner.local_id,
                outcome: outcome.clone(),
            });
        }
        outcome
    }

    /// Liveness beacon from a peer. Returns the next batch to request when
    /// the peer has produced batches we have not verified.
    pub async fn note_beacon(&self, peer_id: PeerId, last_batch_seq: Option<u64>) -> Option<u64> {
        if peer_id == self.inner.local_id {
            return None;
        }
        let now = Instant::now();
        let mut trails = self.inner.trails.write().await;
        let trail = trails
            .entry(peer_id)
            .or_insert_with(|| PeerTrail::new(peer_id, self.inner.params.spawn, now));
        let was_stale = trail.status == TrailStatus::Stale;
        trail.touch(now);
        let missing = if last_batch_seq > trail.last_verified_seq {
            debug!(
                "{} reports batch {:?}, verified up to {:?}",
                peer_id, last_batch_seq, trail.last_verified_seq
            );
            Some(trail.last_verified_seq.map_or(0, |seq| seq + 1))
        } else {
            None
        };
        drop(trails);
        if was_stale {
            info!("Peer {} revived", peer_id);
            self.bump();
        }
        missing
    }

    /// First contact with a peer.
    pub async fn note_peer_joined(&self, peer_id: PeerId) {
        if peer_id == self.inner.local_id {
            return;
        }
        let now = Instant::now();
        let mut trails = self.inner.trails.write().await;
        match trails.get_mut(&peer_id) {
            Some(trail) => trail.touch(now),
            None => {
                trails.insert(peer_id, PeerTrail::new(peer_id, self.inner.params.spawn, now));
            }
        }
        drop(trails);
        self.bump();
    }

    /// Gossip gave up on a peer.
    pub async fn mark_stale(&self, peer_id: PeerId) {
        if peer_id == self.inner.local_id {
            return;
        }
        let mut trails = self.inner.trails.write().await;
        if let Some(trail) = trails.get_mut(&peer_id) {
            trail.mark_stale(Instant::now());
            drop(trails);
            info!("Peer {} marked stale", peer_id);
            self.bump();
        }
    }

    /// Stale silent peers and evict expired stale trails.
    pub async fn sweep(&self, now: Instant) -> SweepReport {
        let policy = &self.inner.policy;
        let mut report = SweepReport::default();
        let mut trails = self.inner.trails.write().await;

        for trail in trails.values_mut() {
            if trail.peer_id == self.inner.local_id {
                continue;
            }
            if trail.status != TrailStatus::Stale
                && now.saturating_duration_since(trail.last_heard) >= policy.stale_after
            {
                trail.mark_stale(now);
                report.staled.push(trail.peer_id);
            }
        }

        trails.retain(|peer_id, trail| {
            let expired = trail.stale_since
                .map(|since| now.saturating_duration_since(since) >= policy.eviction_grace)
                .unwrap_or(false);
            if expired {
                report.evicted.push(*peer_id);
            }
            !expired
        });
        drop(trails);

        if !report.evicted.is_empty() {
            let mut lanes = self.inner.lanes.lock();
            let mut archive = self.inner.archive.lock();
            for peer_id in &report.evicted {
                lanes.remove(peer_id);
                archive.remove(peer_id);
            }
        }
        if !report.staled.is_empty() || !report.evicted.is_empty() {
            info!("Sweep: {} stale, {} evicted", report.staled.len(), report.evicted.len());
            self.bump();
        }
        report
    }

    /// Next batch wanted for every trail with verified batches.
    pub async fn heads(&self) -> Vec<(PeerId, u64)> {
        self.inner.trails
            .read()
            .await
            .values()
            .filter_map(|t| t.last_verified_seq.map(|seq| (t.peer_id, seq + 1)))
            .collect()
    }

    /// Archived batches a neighbour with `heads` is missing, oldest first.
    /// Batches authored by `requester` are never sent back to it.
    pub fn archived_since(&self, heads: &[(PeerId, u64)], requester: PeerId) -> Vec<MovementBatch> {
        let wanted: HashMap<PeerId, u64> = heads.iter().copied().collect();
        let archive = self.inner.archive.lock();
        let mut authors: Vec<PeerId> = archive.keys().copied().filter(|id| *id != requester).collect();
        authors.sort();

        let mut batches = Vec::new();
        for author in authors {
            let from = wanted.get(&author).copied().unwrap_or(0);
            batches.extend(archive[&author].iter().filter(|b| b.batch_seq >= from).cloned());
        }
        batches
    }

    /// Snapshot of one trail.
    pub async fn trail(&self, peer_id: &PeerId) -> Option<PeerTrail> {
        self.inner.trails.read().await.get(peer_id).cloned()
    }

    /// Snapshot of the local trail.
    pub async fn local_trail(&self) -> Option<PeerTrail> {
        self.trail(&self.inner.local_id).await
    }

    /// Remote peers that are not stale.
    pub async fn visible(&self) -> Vec<TrailSnapshot> {
        self.inner.trails
            .read()
            .await
            .values()
            .filter(|t| t.peer_id != self.inner.local_id && t.status != TrailStatus::Stale)
            .map(PeerTrail::snapshot)
            .collect()
    }

    /// Every trail, including stale ones and the local one.
    pub async fn snapshot(&self) -> Vec<TrailSnapshot> {
        self.inner.trails.read().await.values().map(PeerTrail::snapshot).collect()
    }

    fn bump(&self) {
        self.inner.changed.send_modify(|v| *v = v.wrapping_add(1));
    }
}

/// Staleness timeout for a batch interval.
pub fn stale_timeout(batch_interval: Duration, intervals: u32) -> Duration {
    batch_interval * intervals
}
