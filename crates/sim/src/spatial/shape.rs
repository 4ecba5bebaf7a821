//! Query geometry for the spatial index.
//!
//! Queries come in exactly two shapes: a cell's bounding circle
//! (broad-phase, safe-spawn checks) and a viewer's viewport rectangle.
//! A small closed union replaces dynamic dispatch for the
//! overlap/quadrant tests.

/// Overlap-quadrant bitmask bits, relative to a node's center point.
pub mod quad {
    pub const TOP: u8 = 0x1;
    pub const BOTTOM: u8 = 0x2;
    pub const LEFT: u8 = 0x4;
    pub const RIGHT: u8 = 0x8;
}

/// Axis-aligned rectangle as center plus half extents.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub hw: f32,
    pub hh: f32,
}

impl Rect {
    pub fn new(x: f32, y: f32, hw: f32, hh: f32) -> Self {
        Self { x, y, hw, hh }
    }

    /// Whether the circle lies strictly inside this rectangle.
    #[inline]
    pub fn contains(&self, c: &Circle) -> bool {
        c.x - c.r > self.x - self.hw
            && c.x + c.r < self.x + self.hw
            && c.y - c.r > self.y - self.hh
            && c.y + c.r < self.y + self.hh
    }
}

/// Bounding circle of a cell.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Circle {
    pub x: f32,
    pub y: f32,
    pub r: f32,
}

impl Circle {
    pub fn new(x: f32, y: f32, r: f32) -> Self {
        Self { x, y, r }
    }
}

/// Which child quadrant a circle falls entirely into, relative to a
/// node's center point; `None` when it straddles either axis.
/// Quadrant order matches child order: TL, TR, BL, BR (y up).
#[inline]
pub fn circle_quadrant(c: &Circle, cx: f32, cy: f32) -> Option<usize> {
    if c.y - c.r > cy {
        if c.x + c.r < cx {
            return Some(0);
        } else if c.x - c.r > cx {
            return Some(1);
        }
    } else if c.y + c.r < cy {
        if c.x + c.r < cx {
            return Some(2);
        } else if c.x - c.r > cx {
            return Some(3);
        }
    }
    None
}

/// A query shape: either a cell circle or a viewport rectangle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Shape {
    Circle(Circle),
    Rect(Rect),
}

impl Shape {
    /// Zero-area shapes match nothing.
    #[inline]
    pub fn is_degenerate(&self) -> bool {
        match self {
            Shape::Circle(c) => c.r <= 0.0,
            Shape::Rect(r) => r.hw <= 0.0 || r.hh <= 0.0,
        }
    }

    /// Exact overlap test against an item's bounding circle.
    #[inline]
    pub fn overlaps(&self, c: &Circle) -> bool {
        match self {
            Shape::Circle(q) => {
                let dx = c.x - q.x;
                let dy = c.y - q.y;
                let rs = c.r + q.r;
                dx * dx + dy * dy < rs * rs
            }
            Shape::Rect(rect) => {
                // Distance from circle center to the closest point of
                // the rectangle.
                let tx = c.x.clamp(rect.x - rect.hw, rect.x + rect.hw);
                let ty = c.y.clamp(rect.y - rect.hh, rect.y + rect.hh);
                let dx = c.x - tx;
                let dy = c.y - ty;
                dx * dx + dy * dy <= c.r * c.r
            }
        }
    }

    /// Bitmask of the quadrants this shape overlaps around a node
    /// center, used to prune DFS descent.
    #[inline]
    pub fn overlap_quadrants(&self, cx: f32, cy: f32) -> u8 {
        let (l, r, b, t) = match self {
            Shape::Circle(c) => (c.x - c.r, c.x + c.r, c.y - c.r, c.y + c.r),
            Shape::Rect(rect) => (
                rect.x - rect.hw,
                rect.x + rect.hw,
                rect.y - rect.hh,
                rect.y + rect.hh,
            ),
        };
        let mut mask = 0;
        if t > cy {
            mask |= quad::TOP;
        }
        if b < cy {
            mask |= quad::BOTTOM;
        }
        if l < cx {
            mask |= quad::LEFT;
        }
        if r > cx {
            mask |= quad::RIGHT;
        }
        mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quadrant_requires_full_containment() {
        let c = Circle::new(-10.0, 10.0, 5.0);
        assert_eq!(circle_quadrant(&c, 0.0, 0.0), Some(0));
        // Straddles the y axis.
        let c = Circle::new(-2.0, 10.0, 5.0);
        assert_eq!(circle_quadrant(&c, 0.0, 0.0), None);
        // Straddles the x axis.
        let c = Circle::new(-10.0, 2.0, 5.0);
        assert_eq!(circle_quadrant(&c, 0.0, 0.0), None);
    }

    #[test]
    fn circle_circle_overlap_is_strict() {
        let q = Shape::Circle(Circle::new(0.0, 0.0, 10.0));
        assert!(q.overlaps(&Circle::new(15.0, 0.0, 6.0)));
        // Exactly touching is not overlapping.
        assert!(!q.overlaps(&Circle::new(16.0, 0.0, 6.0)));
    }

    #[test]
    fn rect_circle_overlap() {
        let q = Shape::Rect(Rect::new(0.0, 0.0, 10.0, 10.0));
        assert!(q.overlaps(&Circle::new(12.0, 0.0, 3.0)));
        assert!(!q.overlaps(&Circle::new(14.0, 0.0, 3.0)));
        // Corner case: distance to corner matters, not the projection.
        assert!(!q.overlaps(&Circle::new(13.0, 13.0, 4.0)));
    }

    #[test]
    fn overlap_quadrants_mask() {
        let q = Shape::Circle(Circle::new(5.0, 5.0, 2.0));
        // Entirely top-right of the origin.
        assert_eq!(q.overlap_quadrants(0.0, 0.0), quad::TOP | quad::RIGHT);
        // Centered on a node center overlaps all four.
        assert_eq!(
            q.overlap_quadrants(5.0, 5.0),
            quad::TOP | quad::BOTTOM | quad::LEFT | quad::RIGHT
        );
    }
}
