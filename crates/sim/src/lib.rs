//! Petri arena simulation core.

pub mod arena;
pub mod config;
pub mod driver;
pub mod engine;
pub mod pool;
pub mod spatial;
pub mod view;

// Re-export commonly used types
pub use arena::{Arena, Boost, Cell, CellId};
pub use config::Config;
pub use driver::run_tick_loop;
pub use engine::{Engine, PlayerControl, PlayerId, TickStats};
pub use spatial::{QuadTree, Rect};
pub use view::Viewer;
