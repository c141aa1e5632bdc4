//! # Footsteps Node
//!
//! Peer-to-peer movement with partial path disclosure. Each node batches
//! its own moves, proves every batch (steps within the movement rule, path
//! inside the area, revealed points and end position genuine) and gossips
//! it. Peers verify before they draw anything.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      FOOTSTEPS NODE                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Grid geometry, peer ids, hashing          │
//! │                                                              │
//! │  proof/          - Commitments, prover, verifier             │
//! │  ├── sigma.rs    - Pedersen / OR / opening / range proofs    │
//! │  ├── prover.rs   - Batch proof generation                    │
//! │  └── verify.rs   - Chain rules + ProofVerifier trait         │
//! │                                                              │
//! │  movement/       - Local side                                │
//! │  ├── buffer.rs   - Movement buffer (tentative position)      │
//! │  └── batcher.rs  - Periodic proof batcher                    │
//! │                                                              │
//! │  trail/          - Remote side                               │
//! │  ├── peer_trail.rs - Verified trail per peer                 │
//! │  └── reconciler.rs - Per-peer lanes, rollback, staleness     │
//! │                                                              │
//! │  network/        - Peer mesh and UI transport                │
//! │  ├── gossip.rs   - Flooding gossip with dedup                │
//! │  ├── link.rs     - Link FSM + reconnect backoff              │
//! │  ├── auth.rs     - Lobby admission tokens                    │
//! │  ├── protocol.rs - Wire and UI messages                      │
//! │  └── server.rs   - UI WebSocket server                       │
//! │                                                              │
//! │  feed.rs         - State feed for the UI                     │
//! │  config.rs       - Node configuration                        │
//! │  node.rs         - Task wiring                               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Trust Model
//!
//! A peer's trail only ever shows points from batches that verified and
//! extend that peer's chain. Anything else is rolled back and the trail
//! keeps its last verified state.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod core;
pub mod feed;
pub mod movement;
pub mod network;
pub mod node;
pub mod proof;
pub mod trail;

// Re-export commonly used types
pub use config::{ConfigError, NodeConfig};
pub use core::{GridPoint, PeerId};
pub use feed::{ProofStatus, StateFeed, StateSnapshot};
pub use node::{Node, NodeError, RunningNode};
pub use proof::{CircuitParameters, MovementBatch, ProofVerifier};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default time between batch cuts (seconds)
pub const DEFAULT_BATCH_INTERVAL_SECS: u64 = 5;

/// Default fraction of path points revealed per batch
pub const DEFAULT_REVEAL_RATIO: f64 = 0.5;
