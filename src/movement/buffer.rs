//! Movement Buffer
//!
//! Accumulates local moves between batch cuts. Moves are clipped so the
//! tentative position never leaves the game area; nothing is rejected here.
//! The UI command path writes, the batcher drains. Both go through one
//! `parking_lot::Mutex`.

use std::sync::Arc;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Serialize, Deserialize};
use crate::core::point::{Bounds, GridPoint};

/// Buffer shared between the command path and the batcher.
pub type SharedBuffer = Arc<Mutex<MovementBuffer>>;

/// One recorded move.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveRecord {
    /// Local sequence number (never reused).
    pub sequence_no: u64,
    /// X delta after clipping.
    pub dx: i32,
    /// Y delta after clipping.
    pub dy: i32,
    /// When the move was recorded.
    pub t: DateTime<Utc>,
}

/// Directional command.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// +y
    Up,
    /// -y
    Down,
    /// -x
    Left,
    /// +x
    Right,
}

impl Direction {
    /// Delta for a command of the given magnitude.
    pub fn delta(self, step: i32) -> (i32, i32) {
        match self {
            Direction::Up => (0, step),
            Direction::Down => (0, -step),
            Direction::Left => (-step, 0),
            Direction::Right => (step, 0),
        }
    }
}

/// Records taken out at a cut.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Drained {
    /// Tentative position before the first drained move.
    pub start: GridPoint,
    /// Drained moves in order.
    pub records: Vec<MoveRecord>,
}

impl Drained {
    /// Deltas only.
    pub fn moves(&self) -> Vec<(i32, i32)> {
        self.records.iter().map(|r| (r.dx, r.dy)).collect()
    }

    /// Nothing was drained.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Pending local moves.
#[derive(Debug)]
pub struct MovementBuffer {
    bounds: Bounds,
    position: GridPoint,
    cut_position: GridPoint,
    pending: Vec<MoveRecord>,
    next_sequence: u64,
}

impl MovementBuffer {
    /// Empty buffer at `spawn`.
    pub fn new(bounds: Bounds, spawn: GridPoint) -> Self {
        Self {
            bounds,
            position: spawn,
            cut_position: spawn,
            pending: Vec::new(),
            next_sequence: 0,
        }
    }

    /// Wrap into a shared handle.
    pub fn shared(self) -> SharedBuffer {
        Arc::new(Mutex::new(self))
    }

    /// Record a move, clipped to the game area.
    pub fn record(&mut self, dx: i32, dy: i32) -> MoveRecord {
        let target = self.bounds.clamp(self.position + GridPoint::new(dx, dy));
        let actual = target - self.position;
        let record = MoveRecord {
            sequence_no: self.next_sequence,
            dx: actual.x,
            dy: actual.y,
            t: Utc::now(),
        };
        self.next_sequence += 1;
        self.position = target;
        self.pending.push(record);
        record
    }

    /// Take every move since the previous cut.
    pub fn drain_since_last_cut(&mut self) -> Drained {
        let drained = Drained {
            start: self.cut_position,
            records: std::mem::take(&mut self.pending),
        };
        self.cut_position = self.position;
        drained
    }

    /// Put a drained segment back in front of newer moves.
    pub fn restore(&mut self, drained: Drained) {
        let mut records = drained.records;
        records.append(&mut self.pending);
        self.pending = records;
        self.cut_position = drained.start;
    }

    /// Drop all pending moves and restart from `position`.
    pub fn rebase(&mut self, position: GridPoint) {
        self.pending.clear();
        self.position = position;
        self.cut_position = position;
    }

    /// Tentative local position (including unproven moves).
    pub fn position(&self) -> GridPoint {
        self.position
    }

    /// Number of moves waiting for the next cut.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer() -> MovementBuffer {
        MovementBuffer::new(Bounds::new(3, 3), GridPoint::ORIGIN)
    }

    #[test]
    fn test_record_sequence() {
        let mut buf = buffer();
        let a = buf.record(1, 0);
        let b = buf.record(0, 1);
        assert_eq!(a.sequence_no, 0);
        assert_eq!(b.sequence_no, 1);
        assert_eq!(buf.position(), GridPoint::new(1, 1));
    }

    #[test]
    fn test_record_clips_to_bounds() {
        let mut buf = buffer();
        for _ in 0..5 {
            buf.record(1, 0);
        }
        assert_eq!(buf.position(), GridPoint::new(3, 0));
        assert_eq!(buf.pending_len(), 5);

        // Partial clip keeps the in-bounds part
        let r = buf.record(2, -5);
        assert_eq!((r.dx, r.dy), (0, -3));
        assert_eq!(buf.position(), GridPoint::new(3, -3));
    }

    #[test]
    fn test_drain_clears() {
        let mut buf = buffer();
        buf.record(1, 0);
        buf.record(1, 0);
        let first = buf.drain_since_last_cut();
        assert_eq!(first.start, GridPoint::ORIGIN);
        assert_eq!(first.moves(), vec![(1, 0), (1, 0)]);

        buf.record(0, 1);
        let second = buf.drain_since_last_cut();
        assert_eq!(second.start, GridPoint::new(2, 0));
        assert_eq!(second.records[0].sequence_no, 2);
        assert!(buf.drain_since_last_cut().is_empty());
    }

    #[test]
    fn test_restore_keeps_order() {
        let mut buf = buffer();
        buf.record(1, 0);
        let drained = buf.drain_since_last_cut();
        buf.record(0, 1);
        buf.restore(drained);

        let all = buf.drain_since_last_cut();
        assert_eq!(all.start, GridPoint::ORIGIN);
        assert_eq!(all.moves(), vec![(1, 0), (0, 1)]);
        assert_eq!(buf.position(), GridPoint::new(1, 1));
    }

    #[test]
    fn test_rebase() {
        let mut buf = buffer();
        buf.record(1, 0);
        buf.record(1, 0);
        buf.rebase(GridPoint::new(-1, -1));
        assert_eq!(buf.position(), GridPoint::new(-1, -1));
        let drained = buf.drain_since_last_cut();
        assert!(drained.is_empty());
        assert_eq!(drained.start, GridPoint::new(-1, -1));
        // Sequence numbers continue
        assert_eq!(buf.record(0, 1).sequence_no, 2);
    }

    #[test]
    fn test_direction_delta() {
        assert_eq!(Direction::Up.delta(1), (0, 1));
        assert_eq!(Direction::Down.delta(2), (0, -2));
        assert_eq!(Direction::Left.delta(1), (-1, 0));
        assert_eq!(Direction::Right.delta(1), (1, 0));
    }
}
