//! Shared wire protocol for the petri arena.
//!
//! This crate contains:
//! - Binary reading/writing utilities
//! - The world-update delta frame codec (Add/Update/Eat/Delete)

mod binary;
mod error;
mod frame;

pub use binary::{Reader, Writer};
pub use error::ProtocolError;
pub use frame::{AddRecord, EatRecord, OP_WORLD_UPDATE, UpdateFrame, UpdateRecord};
