//! Integer Grid Points
//!
//! Positions and deltas on the shared 2D grid. All arithmetic is integer,
//! so every peer derives the same path from the same moves.

use std::fmt;
use std::ops::{Add, Sub};
use serde::{Serialize, Deserialize};

/// A position (or delta) on the game grid.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GridPoint {
    /// X coordinate (right is positive)
    pub x: i32,
    /// Y coordinate (up is positive)
    pub y: i32,
}

impl GridPoint {
    /// The origin.
    pub const ORIGIN: Self = Self { x: 0, y: 0 };

    /// Create a new point.
    #[inline]
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Largest per-axis component magnitude (Chebyshev norm).
    #[inline]
    pub fn max_abs(self) -> i32 {
        self.x.saturating_abs().max(self.y.saturating_abs())
    }

    /// As an `[x, y]` pair for JSON trails.
    #[inline]
    pub fn to_pair(self) -> [i32; 2] {
        [self.x, self.y]
    }
}

impl Add for GridPoint {
    type Output = Self;

    #[inline]
    fn add(self, other: Self) -> Self {
        Self::new(self.x.saturating_add(other.x), self.y.saturating_add(other.y))
    }
}

impl Sub for GridPoint {
    type Output = Self;

    #[inline]
    fn sub(self, other: Self) -> Self {
        Self::new(self.x.saturating_sub(other.x), self.y.saturating_sub(other.y))
    }
}

impl fmt::Debug for GridPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

impl fmt::Display for GridPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Rectangular game area, symmetric around the origin.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounds {
    /// Maximum |x|.
    pub half_width: i32,
    /// Maximum |y|.
    pub half_height: i32,
}

impl Bounds {
    /// Create bounds from half extents.
    pub const fn new(half_width: i32, half_height: i32) -> Self {
        Self { half_width, half_height }
    }

    /// Check whether a point lies inside (inclusive).
    #[inline]
    pub fn contains(&self, p: GridPoint) -> bool {
        p.x >= -self.half_width
            && p.x <= self.half_width
            && p.y >= -self.half_height
            && p.y <= self.half_height
    }

    /// Clamp a point to the area.
    #[inline]
    pub fn clamp(&self, p: GridPoint) -> GridPoint {
        GridPoint::new(
            p.x.clamp(-self.half_width, self.half_width),
            p.y.clamp(-self.half_height, self.half_height),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_sub() {
        let a = GridPoint::new(3, -2);
        let b = GridPoint::new(-1, 5);
        assert_eq!(a + b, GridPoint::new(2, 3));
        assert_eq!(a - b, GridPoint::new(4, -7));
    }

    #[test]
    fn test_saturating() {
        let a = GridPoint::new(i32::MAX, i32::MIN);
        let b = GridPoint::new(1, 1);
        assert_eq!(a + b, GridPoint::new(i32::MAX, i32::MIN + 1));
        assert_eq!(GridPoint::new(i32::MIN, 0).max_abs(), i32::MAX);
    }

    #[test]
    fn test_bounds_contains_and_clamp() {
        let bounds = Bounds::new(10, 5);
        assert!(bounds.contains(GridPoint::new(10, -5)));
        assert!(!bounds.contains(GridPoint::new(11, 0)));
        assert_eq!(bounds.clamp(GridPoint::new(40, -9)), GridPoint::new(10, -5));
    }

    #[test]
    fn test_max_abs() {
        assert_eq!(GridPoint::new(-3, 2).max_abs(), 3);
        assert_eq!(GridPoint::ORIGIN.max_abs(), 0);
    }
}
