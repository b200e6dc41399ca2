//! bm-protocol: tunnel frame protocol for bridgeme
//!
//! A tunnel carries exactly one terminal session over one SSH-forwarded
//! TCP stream. Everything on that stream is a frame: a 4-byte header
//! followed by the payload announced in the header.

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;

pub use codec::FrameCodec;
pub use error::ProtocolError;
pub use frame::{FrameHeader, FrameType, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use message::{Frame, TerminalSize, MAX_DATA_CHUNK};
