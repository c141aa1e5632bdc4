//! Network Layer
//!
//! Peer mesh (gossip over WebSocket links) and the UI feed server.
//! Nothing here decides what is true: batches go to the reconciler.

pub mod auth;
pub mod gossip;
pub mod link;
pub mod protocol;
pub mod server;

pub use auth::{AdmissionClaims, AdmissionConfig, AdmissionError, validate_token};
pub use gossip::{
    GossipConfig, GossipError, GossipEvent, GossipLayer, GossipStreams, InboundBatch, SeenKey, SeenSet,
};
pub use link::{Link, LinkError, LinkState, ReconnectPolicy};
pub use protocol::{Key, PeerMessage, UiClientMessage, UiServerMessage, WireError, WIRE_VERSION};
pub use server::{ServerConfig, UiServer, UiServerError};
