//! Frames exchanged over a tunnel
//!
//! One tunnel carries one session, so frames need no routing information.
//! Typical sequence once the forwarded connection exists:
//!
//! 1. Client sends `Resize` with its current window size
//! 2. `Data` flows in both directions
//! 3. Both ends send `Heartbeat` on a fixed interval
//! 4. Either end sends `Close` and drops the stream

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::frame::FrameType;

/// Largest `Data` payload a sender puts into a single frame.
///
/// Well below the 24-bit header limit so one large write never occupies
/// the stream long enough to starve heartbeats.
pub const MAX_DATA_CHUNK: usize = 32 * 1024;

/// Terminal dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    /// Number of rows
    pub rows: u16,
    /// Number of columns
    pub cols: u16,
}

impl TerminalSize {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

impl std::fmt::Display for TerminalSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.rows, self.cols)
    }
}

/// A decoded tunnel frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Terminal bytes, either direction
    Data(Bytes),
    /// New window size of the client terminal
    Resize(TerminalSize),
    /// Liveness signal
    Heartbeat,
    /// Graceful shutdown
    Close,
}

impl Frame {
    /// Wire type of this frame
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Data(_) => FrameType::Data,
            Frame::Resize(_) => FrameType::Resize,
            Frame::Heartbeat => FrameType::Heartbeat,
            Frame::Close => FrameType::Close,
        }
    }

    /// Split terminal bytes into `Data` frames of at most [`MAX_DATA_CHUNK`] bytes.
    ///
    /// An empty buffer yields a single empty `Data` frame.
    pub fn data_chunks(data: Bytes) -> Vec<Frame> {
        if data.len() <= MAX_DATA_CHUNK {
            return vec![Frame::Data(data)];
        }
        let mut frames = Vec::with_capacity(data.len().div_ceil(MAX_DATA_CHUNK));
        let mut rest = data;
        while !rest.is_empty() {
            let take = rest.len().min(MAX_DATA_CHUNK);
            frames.push(Frame::Data(rest.split_to(take)));
        }
        frames
    }

    pub(crate) fn encode_payload(&self) -> Result<Bytes, ProtocolError> {
        match self {
            Frame::Data(data) => Ok(data.clone()),
            Frame::Resize(size) => Ok(Bytes::from(bincode::serialize(size)?)),
            Frame::Heartbeat | Frame::Close => Ok(Bytes::new()),
        }
    }

    pub(crate) fn decode_payload(frame_type: FrameType, payload: Bytes) -> Result<Self, ProtocolError> {
        match frame_type {
            FrameType::Data => Ok(Frame::Data(payload)),
            FrameType::Resize => {
                let size: TerminalSize = bincode::deserialize(&payload)?;
                Ok(Frame::Resize(size))
            }
            FrameType::Heartbeat | FrameType::Close => {
                if !payload.is_empty() {
                    return Err(ProtocolError::InvalidPayload {
                        frame_type: frame_type.name(),
                        reason: format!("expected empty payload, got {} bytes", payload.len()),
                    });
                }
                Ok(if frame_type == FrameType::Heartbeat {
                    Frame::Heartbeat
                } else {
                    Frame::Close
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_data_is_single_chunk() {
        let frames = Frame::data_chunks(Bytes::from_static(b"ls -la\r"));
        assert_eq!(frames, vec![Frame::Data(Bytes::from_static(b"ls -la\r"))]);
    }

    #[test]
    fn test_empty_data_is_single_frame() {
        assert_eq!(Frame::data_chunks(Bytes::new()), vec![Frame::Data(Bytes::new())]);
    }

    #[test]
    fn test_large_data_is_chunked_in_order() {
        let data: Vec<u8> = (0..(MAX_DATA_CHUNK * 2 + 17)).map(|i| (i % 251) as u8).collect();
        let frames = Frame::data_chunks(Bytes::from(data.clone()));
        assert_eq!(frames.len(), 3);

        let mut joined = Vec::new();
        for frame in frames {
            match frame {
                Frame::Data(chunk) => {
                    assert!(chunk.len() <= MAX_DATA_CHUNK);
                    joined.extend_from_slice(&chunk);
                }
                other => panic!("unexpected frame {:?}", other),
            }
        }
        assert_eq!(joined, data);
    }

    #[test]
    fn test_resize_payload_is_two_u16() {
        let payload = Frame::Resize(TerminalSize::new(40, 120)).encode_payload().unwrap();
        assert_eq!(payload.len(), 4);
    }

    #[test]
    fn test_heartbeat_with_payload_is_rejected() {
        let err = Frame::decode_payload(FrameType::Heartbeat, Bytes::from_static(b"x")).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload { frame_type: "heartbeat", .. }));
    }
}
