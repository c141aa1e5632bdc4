//! Per-peer verified trail.

use serde::{Serialize, Deserialize};
use tokio::time::Instant;
use crate::core::hash::Hash32;
use crate::core::id::PeerId;
use crate::core::point::GridPoint;
use crate::proof::{genesis_commitment, MovementBatch, TrailView, VerificationError};

/// Trail lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrailStatus {
    /// Known peer, no verified batch yet.
    Pending,
    /// At least one verified batch.
    Verified,
    /// Lost or silent; evicted after the grace period.
    Stale,
}

/// Authoritative view of one peer's movement.
#[derive(Debug, Clone)]
pub struct PeerTrail {
    /// Owner.
    pub peer_id: PeerId,
    /// Revealed points of all verified batches, in order.
    pub verified_points: Vec<GridPoint>,
    /// Committed end position of the last verified batch.
    pub current_position: GridPoint,
    /// Last verified batch.
    pub last_verified_seq: Option<u64>,
    /// End commitment of the last verified batch.
    pub end_commitment: Hash32,
    /// Lifecycle status.
    pub status: TrailStatus,
    /// Last verified batch, beacon or join.
    pub last_heard: Instant,
    /// When the trail went stale.
    pub stale_since: Option<Instant>,
    /// Rejected batches so far.
    pub rejected_batches: u32,
    /// Sent out-of-sequence or chain-breaking batches.
    pub suspect: bool,
}

impl PeerTrail {
    /// New pending trail at `spawn`.
    pub fn new(peer_id: PeerId, spawn: GridPoint, now: Instant) -> Self {
        Self {
            peer_id,
            verified_points: Vec::new(),
            current_position: spawn,
            last_verified_seq: None,
            end_commitment: genesis_commitment(),
            status: TrailStatus::Pending,
            last_heard: now,
            stale_since: None,
            rejected_batches: 0,
            suspect: false,
        }
    }

    /// Chain state the verifier checks against.
    pub fn view(&self) -> TrailView {
        TrailView {
            peer_id: self.peer_id,
            last_verified_seq: self.last_verified_seq,
            end_commitment: self.end_commitment,
            current_position: self.current_position,
        }
    }

    /// Apply an accepted batch.
    pub fn apply_verified(&mut self, batch: &MovementBatch, now: Instant) {
        let inputs = &batch.public_inputs;
        self.verified_points.extend_from_slice(&inputs.revealed_points);
        self.current_position = inputs.end_position;
        self.last_verified_seq = Some(batch.batch_seq);
        self.end_commitment = inputs.end_commitment;
        self.status = TrailStatus::Verified;
        self.last_heard = now;
        self.stale_since = None;
    }

    /// Record a rejected batch. Position and points are untouched.
    pub fn note_rejection(&mut self, error: &VerificationError) {
        self.rejected_batches = self.rejected_batches.saturating_add(1);
        if error.marks_suspect() {
            self.suspect = true;
        }
    }

    /// Peer showed signs of life.
    pub fn touch(&mut self, now: Instant) {
        self.last_heard = now;
        if self.status == TrailStatus::Stale {
            self.revive();
        }
    }

    /// Mark the trail stale.
    pub fn mark_stale(&mut self, now: Instant) {
        if self.status != TrailStatus::Stale {
            self.status = TrailStatus::Stale;
            self.stale_since = Some(now);
        }
    }

    fn revive(&mut self) {
        self.status = if self.last_verified_seq.is_some() {
            TrailStatus::Verified
        } else {
            TrailStatus::Pending
        };
        self.stale_since = None;
    }

    /// UI representation.
    pub fn snapshot(&self) -> TrailSnapshot {
        TrailSnapshot {
            peer_id: self.peer_id.to_uuid_string(),
            status: self.status,
            position: self.current_position,
            trail: self.verified_points.iter().map(|p| p.to_pair()).collect(),
            last_verified_seq: self.last_verified_seq,
            suspect: self.suspect,
        }
    }
}

/// Serializable trail for the state feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrailSnapshot {
    /// Peer UUID.
    pub peer_id: String,
    /// Lifecycle status.
    pub status: TrailStatus,
    /// Committed position.
    pub position: GridPoint,
    /// Verified points as `[x, y]`.
    pub trail: Vec<[i32; 2]>,
    /// Last verified batch.
    pub last_verified_seq: Option<u64>,
    /// Peer flagged for protocol or chain violations.
    pub suspect: bool,
}
