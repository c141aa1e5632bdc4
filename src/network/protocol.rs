//! Protocol Messages
//!
//! Two wire formats:
//! - Peer mesh: versioned `PeerMessage` envelopes, bincode in binary frames
//! - UI feed: `type`-tagged JSON in text frames

use serde::{Serialize, Deserialize};
use thiserror::Error;
use crate::core::id::PeerId;
use crate::feed::StateSnapshot;
use crate::movement::Direction;
use crate::proof::MovementBatch;

/// Peer wire version. Bumped on any incompatible change.
pub const WIRE_VERSION: u8 = 1;

/// Largest accepted peer frame.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

// =============================================================================
// PEER MESH
// =============================================================================

/// Messages exchanged between peers.
///
/// Externally tagged: bincode cannot carry `#[serde(tag = "type")]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerMessage {
    /// First message on every link, in both directions.
    Hello {
        /// Sender's id.
        peer_id: PeerId,
        /// Address others can dial to reach the sender.
        advertise_addr: Option<String>,
        /// Lobby admission token.
        admission_token: Option<String>,
    },

    /// Handshake refused; the link closes.
    Reject {
        /// Why.
        reason: String,
    },

    /// A movement batch (own or relayed).
    Batch(MovementBatch),

    /// Liveness from a peer with nothing to prove.
    Beacon {
        /// Beacon author.
        peer_id: PeerId,
        /// Per-author beacon counter (dedup key).
        beacon_seq: u64,
        /// Author's last produced batch.
        last_batch_seq: Option<u64>,
    },

    /// Known dialable addresses.
    Peers {
        /// `host:port` strings.
        addrs: Vec<String>,
    },

    /// Ask a neighbour for verified batches we are missing.
    SyncRequest {
        /// Next batch wanted per author. Authors not listed are wanted
        /// from their first archived batch.
        heads: Vec<(PeerId, u64)>,
    },

    /// Archived batches answering a `SyncRequest`. Never relayed.
    Batches {
        /// Batches in ascending sequence per author.
        batches: Vec<MovementBatch>,
    },
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    version: u8,
    message: PeerMessage,
}

/// Peer frame errors.
#[derive(Debug, Error)]
pub enum WireError {
    /// Remote speaks another protocol version.
    #[error("unsupported wire version {got} (expected {expected})")]
    Version {
        /// Ours.
        expected: u8,
        /// Theirs.
        got: u8,
    },

    /// Frame exceeds `MAX_FRAME_BYTES`.
    #[error("frame of {0} bytes too large")]
    TooLarge(usize),

    /// Empty frame.
    #[error("empty frame")]
    Empty,

    /// Bincode failure.
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
}

impl PeerMessage {
    /// Encode into a versioned frame.
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        Ok(bincode::serialize(&Envelope {
            version: WIRE_VERSION,
            message: self.clone(),
        })?)
    }

    /// Decode a versioned frame.
    pub fn from_bytes(data: &[u8]) -> Result<Self, WireError> {
        if data.len() > MAX_FRAME_BYTES {
            return Err(WireError::TooLarge(data.len()));
        }
        let version = *data.first().ok_or(WireError::Empty)?;
        if version != WIRE_VERSION {
            return Err(WireError::Version { expected: WIRE_VERSION, got: version });
        }
        let envelope: Envelope = bincode::deserialize(data)?;
        Ok(envelope.message)
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::Hello { .. } => "hello",
            PeerMessage::Reject { .. } => "reject",
            PeerMessage::Batch(_) => "batch",
            PeerMessage::Beacon { .. } => "beacon",
            PeerMessage::Peers { .. } => "peers",
            PeerMessage::SyncRequest { .. } => "sync_request",
            PeerMessage::Batches { .. } => "batches",
        }
    }
}

// =============================================================================
// UI CLIENT -> NODE MESSAGES
// =============================================================================

/// Key accepted from the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Key {
    /// Move up.
    Up,
    /// Move down.
    Down,
    /// Move left.
    Left,
    /// Move right.
    Right,
    /// Exercise the proof pipeline without moving.
    Test,
}

impl Key {
    /// Direction for movement keys.
    pub fn direction(self) -> Option<Direction> {
        match self {
            Key::Up => Some(Direction::Up),
            Key::Down => Some(Direction::Down),
            Key::Left => Some(Direction::Left),
            Key::Right => Some(Direction::Right),
            Key::Test => None,
        }
    }
}

/// Messages sent from the UI to the node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiClientMessage {
    /// Directional or test command.
    KeyPress {
        /// Which key.
        key: Key,
    },

    /// Ask for a full snapshot now.
    SyncRequest,
}

// =============================================================================
// NODE -> UI CLIENT MESSAGES
// =============================================================================

/// Messages sent from the node to the UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiServerMessage {
    /// Current state.
    StateUpdate(StateSnapshot),

    /// Peer lifecycle notice.
    PeerEvent {
        /// Human-readable event.
        message: String,
    },

    /// Request could not be handled.
    Error {
        /// What went wrong.
        message: String,
    },
}

impl UiClientMessage {
    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl UiServerMessage {
    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::point::GridPoint;
    use crate::proof::PublicInputs;

    fn sample_batch() -> MovementBatch {
        MovementBatch {
            peer_id: PeerId::new([4; 16]),
            batch_seq: 3,
            proof: vec![1, 2, 3, 4],
            public_inputs: PublicInputs {
                start_position: GridPoint::ORIGIN,
                revealed_points: vec![GridPoint::new(1, 0)],
                redacted_count: 1,
                end_position: GridPoint::new(2, 0),
                start_commitment: [1; 32],
                end_commitment: [2; 32],
            },
        }
    }

    #[test]
    fn test_peer_message_binary() {
        let msg = PeerMessage::Batch(sample_batch());
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(bytes[0], WIRE_VERSION);
        assert_eq!(PeerMessage::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_wire_version_checked() {
        let msg = PeerMessage::Peers { addrs: vec!["127.0.0.1:9000".into()] };
        let mut bytes = msg.to_bytes().unwrap();
        bytes[0] = WIRE_VERSION + 1;
        assert!(matches!(
            PeerMessage::from_bytes(&bytes),
            Err(WireError::Version { got, .. }) if got == WIRE_VERSION + 1
        ));
        assert!(matches!(PeerMessage::from_bytes(&[]), Err(WireError::Empty)));
    }

    #[test]
    fn test_garbage_frame() {
        assert!(matches!(
            PeerMessage::from_bytes(&[WIRE_VERSION, 0xff, 0xff, 0xff, 0xff]),
            Err(WireError::Codec(_))
        ));
    }

    #[test]
    fn test_key_press_json() {
        let msg = UiClientMessage::from_json(r#"{"type":"key_press","key":"left"}"#).unwrap();
        match msg {
            UiClientMessage::KeyPress { key } => {
                assert_eq!(key, Key::Left);
                assert_eq!(key.direction(), Some(Direction::Left));
            }
            other => panic!("unexpected {:?}", other),
        }

        let test = UiClientMessage::from_json(r#"{"type":"key_press","key":"test"}"#).unwrap();
        assert!(matches!(test, UiClientMessage::KeyPress { key: Key::Test }));
        assert!(UiClientMessage::from_json(r#"{"type":"key_press","key":"jump"}"#).is_err());
    }

    #[test]
    fn test_peer_event_json() {
        let msg = UiServerMessage::PeerEvent { message: "peer joined".into() };
        let json = msg.to_json().unwrap();
        assert!(json.contains(r#""type":"peer_event""#));
    }
}
