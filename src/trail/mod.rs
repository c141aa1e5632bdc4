//! Peer trails and reconciliation.

pub mod peer_trail;
pub mod reconciler;

pub use peer_trail::{PeerTrail, TrailSnapshot, TrailStatus};
pub use reconciler::{
    stale_timeout, ReconcileEvent, ReconcileOutcome, ReconcilePolicy, Reconciler, SweepReport,
};
