//! Tokio codec for tunnel frames

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::frame::{FrameHeader, MAX_PAYLOAD_SIZE};
use crate::message::Frame;

/// Codec for encoding/decoding tunnel frames
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// Header already consumed from the buffer whose payload is still incomplete
    pending_header: Option<FrameHeader>,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            pending_header: None,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match self.pending_header.take() {
            Some(h) => h,
            None => match FrameHeader::decode(src)? {
                Some(h) => h,
                None => return Ok(None),
            },
        };

        let payload_len = header.payload_length as usize;
        if src.len() < payload_len {
            src.reserve(payload_len - src.len());
            self.pending_header = Some(header);
            return Ok(None);
        }

        let payload = src.split_to(payload_len).freeze();
        let frame = Frame::decode_payload(header.frame_type, payload)?;
        tracing::trace!(frame_type = header.frame_type.name(), len = payload_len, "decoded frame");
        Ok(Some(frame))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = frame.encode_payload()?;
        let payload_len = payload.len();

        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        FrameHeader::new(frame.frame_type(), payload_len as u32).encode(dst);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::TerminalSize;
    use bytes::Bytes;

    fn encode(frame: Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec::new().encode(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_codec_data_message() {
        let mut codec = FrameCodec::new();
        let mut buf = encode(Frame::Data(Bytes::from("Hello, world!")));

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Frame::Data(Bytes::from("Hello, world!")));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_codec_resize() {
        let mut codec = FrameCodec::new();
        let mut buf = encode(Frame::Resize(TerminalSize::new(40, 120)));

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Frame::Resize(TerminalSize::new(40, 120)));
    }

    #[test]
    fn test_codec_partial_read_byte_by_byte() {
        let mut codec = FrameCodec::new();
        let full = encode(Frame::Data(Bytes::from_static(b"partial frame")));

        let mut buf = BytesMut::new();
        let mut decoded = None;
        for (i, byte) in full.iter().enumerate() {
            buf.extend_from_slice(&[*byte]);
            let result = codec.decode(&mut buf).unwrap();
            if i + 1 < full.len() {
                assert!(result.is_none(), "decoded early at byte {}", i);
            } else {
                decoded = result;
            }
        }
        assert_eq!(decoded, Some(Frame::Data(Bytes::from_static(b"partial frame"))));
    }

    #[test]
    fn test_codec_consecutive_frames() {
        let mut codec = FrameCodec::new();
        let mut buf = encode(Frame::Heartbeat);
        buf.extend_from_slice(&encode(Frame::Data(Bytes::from_static(b"x"))));
        buf.extend_from_slice(&encode(Frame::Close));

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::Heartbeat));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::Data(Bytes::from_static(b"x"))));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::Close));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_codec_rejects_unknown_type() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[0x7F, 0, 0, 0][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::UnknownFrameType(0x7F))
        ));
    }

    #[test]
    fn test_codec_rejects_oversized_payload() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        let result = codec.encode(
            Frame::Data(Bytes::from(vec![0u8; MAX_PAYLOAD_SIZE + 1])),
            &mut buf,
        );
        assert!(matches!(result, Err(ProtocolError::PayloadTooLarge { .. })));
        assert!(buf.is_empty());
    }
}
