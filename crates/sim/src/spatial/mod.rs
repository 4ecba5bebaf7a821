//! Spatial indexing for broad-phase collision and visibility queries.

mod quadtree;
mod shape;

pub use quadtree::QuadTree;
pub use shape::{circle_quadrant, quad, Circle, Rect, Shape};
