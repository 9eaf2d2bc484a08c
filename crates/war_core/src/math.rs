//! Battlefield geometry.
//!
//! Timing in this simulation is wall-clock driven rather than lockstep,
//! so coordinates are plain `f64` rather than fixed-point.

use serde::{Deserialize, Serialize};

/// A point on the battlefield.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    /// X coordinate.
    pub x: f64,
    /// Y coordinate.
    pub y: f64,
}

impl Position {
    /// Create a new position.
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Origin.
    pub const ZERO: Self = Self { x: 0.0, y: 0.0 };

    /// Euclidean distance to another position.
    #[must_use]
    pub fn distance(self, other: Self) -> f64 {
        self.distance_sq(other).sqrt()
    }

    /// Squared distance (avoids sqrt for comparisons).
    #[must_use]
    pub fn distance_sq(self, other: Self) -> f64 {
        let dx = other.x - self.x;
        let dy = other.y - self.y;
        dx * dx + dy * dy
    }

    /// Step towards `dest` by at most `max_step`, never overshooting.
    #[must_use]
    pub fn step_towards(self, dest: Self, max_step: f64) -> Self {
        let dist = self.distance(dest);
        if dist <= max_step || dist == 0.0 {
            return dest;
        }
        let ratio = max_step / dist;
        Self {
            x: self.x + (dest.x - self.x) * ratio,
            y: self.y + (dest.y - self.y) * ratio,
        }
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Axis-aligned rectangle, inclusive on both edges.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    /// Bottom-left corner.
    pub min: Position,
    /// Top-right corner.
    pub max: Position,
}

impl Rect {
    /// Create a rectangle from two corners.
    #[must_use]
    pub const fn new(min: Position, max: Position) -> Self {
        Self { min, max }
    }

    /// Rectangle from origin with the given size.
    #[must_use]
    pub const fn sized(width: f64, height: f64) -> Self {
        Self {
            min: Position::ZERO,
            max: Position::new(width, height),
        }
    }

    /// Width of the rectangle.
    #[must_use]
    pub fn width(&self) -> f64 {
        self.max.x - self.min.x
    }

    /// Height of the rectangle.
    #[must_use]
    pub fn height(&self) -> f64 {
        self.max.y - self.min.y
    }

    /// A rectangle with no area (or inverted corners, or non-finite bounds).
    #[must_use]
    pub fn is_degenerate(&self) -> bool {
        let finite = [self.min.x, self.min.y, self.max.x, self.max.y]
            .iter()
            .all(|v| v.is_finite());
        !finite || self.width() <= 0.0 || self.height() <= 0.0
    }

    /// Whether the point lies inside (edges included).
    #[must_use]
    pub fn contains(&self, p: Position) -> bool {
        p.x >= self.min.x && p.x <= self.max.x && p.y >= self.min.y && p.y <= self.max.y
    }

    /// Nearest point inside the rectangle.
    #[must_use]
    pub fn clamp(&self, p: Position) -> Position {
        Position::new(
            p.x.max(self.min.x).min(self.max.x),
            p.y.max(self.min.y).min(self.max.y),
        )
    }

    /// Centre point.
    #[must_use]
    pub fn center(&self) -> Position {
        Position::new(
            (self.min.x + self.max.x) / 2.0,
            (self.min.y + self.max.y) / 2.0,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_345() {
        let a = Position::ZERO;
        let b = Position::new(3.0, 4.0);
        assert!((a.distance(b) - 5.0).abs() < 1e-9);
        assert_eq!(a.distance_sq(b), 25.0);
        assert_eq!(b.distance(b), 0.0);
    }

    #[test]
    fn test_distance_sq_preserves_ordering() {
        let origin = Position::ZERO;
        let near = Position::new(1.0, 1.0);
        let far = Position::new(10.0, 10.0);
        assert!(origin.distance(near) < origin.distance(far));
        assert!(origin.distance_sq(near) < origin.distance_sq(far));
    }

    #[test]
    fn test_step_towards_does_not_overshoot() {
        let start = Position::ZERO;
        let dest = Position::new(10.0, 0.0);
        assert_eq!(start.step_towards(dest, 4.0), Position::new(4.0, 0.0));
        assert_eq!(start.step_towards(dest, 40.0), dest);
    }

    #[test]
    fn test_rect() {
        let r = Rect::sized(100.0, 50.0);
        assert!(!r.is_degenerate());
        assert!(r.contains(Position::new(100.0, 50.0)));
        assert!(!r.contains(Position::new(100.1, 0.0)));
        assert_eq!(r.center(), Position::new(50.0, 25.0));

        assert!(Rect::sized(0.0, 10.0).is_degenerate());
        assert!(Rect::new(Position::new(5.0, 5.0), Position::ZERO).is_degenerate());
        assert!(Rect::sized(f64::NAN, 1.0).is_degenerate());
    }

    #[test]
    fn test_display() {
        assert_eq!(Position::new(50.5, 75.3).to_string(), "(50.5, 75.3)");
    }
}
