//! Protocol error types.

use thiserror::Error;

/// Errors that can occur while decoding a frame.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid frame opcode: {0:#04x}")]
    InvalidOpcode(u8),

    #[error("Unexpected end of frame")]
    UnexpectedEof,
}
