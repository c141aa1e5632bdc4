//! Circuit Parameters
//!
//! Movement-rule constants fixed at genesis. Their hash acts as the
//! verifying key: every proof statement is bound to it, so a peer running
//! different rules cannot produce batches we accept.

use serde::{Serialize, Deserialize};
use crate::config::ConfigError;
use crate::core::hash::{DomainHasher, Hash32};
use crate::core::point::{Bounds, GridPoint};

/// Largest supported half extent of the game area.
pub const MAX_HALF_EXTENT: i32 = 1 << 20;

/// Largest supported per-axis step.
pub const MAX_STEP_LIMIT: i32 = 64;

/// Movement rules and disclosure policy shared by every peer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CircuitParameters {
    /// Maximum per-axis step magnitude.
    pub max_step: i32,
    /// Game area half width (x in [-half_width, half_width]).
    pub half_width: i32,
    /// Game area half height (y in [-half_height, half_height]).
    pub half_height: i32,
    /// Position every chain starts from.
    pub spawn: GridPoint,
    /// Fraction of path points disclosed per batch.
    pub reveal_ratio: f64,
}

impl Default for CircuitParameters {
    fn default() -> Self {
        Self {
            max_step: 1,
            half_width: 32,
            half_height: 32,
            spawn: GridPoint::ORIGIN,
            reveal_ratio: crate::DEFAULT_REVEAL_RATIO,
        }
    }
}

impl CircuitParameters {
    /// Check that the parameters are usable by the proof system.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_STEP_LIMIT).contains(&self.max_step) {
            return Err(ConfigError::InvalidParameter {
                field: "max_step",
                reason: format!("must be in 1..={}, got {}", MAX_STEP_LIMIT, self.max_step),
            });
        }
        for (field, value) in [("half_width", self.half_width), ("half_height", self.half_height)] {
            if !(1..=MAX_HALF_EXTENT).contains(&value) {
                return Err(ConfigError::InvalidParameter {
                    field,
                    reason: format!("must be in 1..={}, got {}", MAX_HALF_EXTENT, value),
                });
            }
        }
        if !self.bounds().contains(self.spawn) {
            return Err(ConfigError::InvalidParameter {
                field: "spawn",
                reason: format!("{} is outside the game area", self.spawn),
            });
        }
        if !self.reveal_ratio.is_finite() || !(0.0..=1.0).contains(&self.reveal_ratio) {
            return Err(ConfigError::InvalidParameter {
                field: "reveal_ratio",
                reason: format!("must be within [0, 1], got {}", self.reveal_ratio),
            });
        }
        Ok(())
    }

    /// Game area bounds.
    #[inline]
    pub fn bounds(&self) -> Bounds {
        Bounds::new(self.half_width, self.half_height)
    }

    /// Values a single axis delta may take.
    pub fn step_values(&self) -> Vec<i64> {
        let m = self.max_step as i64;
        (-m..=m).collect()
    }

    /// Bits needed to range-prove an x offset in [0, 2 * half_width].
    pub fn x_bits(&self) -> u32 {
        bits_for(2 * self.half_width as u64)
    }

    /// Bits needed to range-prove a y offset in [0, 2 * half_height].
    pub fn y_bits(&self) -> u32 {
        bits_for(2 * self.half_height as u64)
    }

    /// Fingerprint of these parameters (the verifying key).
    pub fn params_hash(&self) -> Hash32 {
        let mut hasher = DomainHasher::new(b"FOOTSTEPS_PARAMS_V1");
        hasher.update_i32(self.max_step);
        hasher.update_i32(self.half_width);
        hasher.update_i32(self.half_height);
        hasher.update_point(self.spawn);
        hasher.update_u64(self.reveal_ratio.to_bits());
        hasher.finalize()
    }
}

fn bits_for(value: u64) -> u32 {
    (u64::BITS - value.leading_zeros()).max(1)
}
