//! Protocol error types

use thiserror::Error;

/// Errors that can occur while framing tunnel traffic
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Unknown frame type byte in a header
    #[error("Unknown frame type: {0:#04x}")]
    UnknownFrameType(u8),

    /// Payload exceeds the 24-bit length field
    #[error("Payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// Payload does not match what the frame type requires
    #[error("Invalid {frame_type} payload: {reason}")]
    InvalidPayload {
        frame_type: &'static str,
        reason: String,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
