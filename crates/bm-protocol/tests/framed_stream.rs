//! Frames pushed through a real async stream with a tiny buffer, so every
//! non-trivial frame spans several reads on the receiving side.

use bm_protocol::{Frame, FrameCodec, TerminalSize, MAX_DATA_CHUNK};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio_util::codec::{FramedRead, FramedWrite};

async fn roundtrip(frames: Vec<Frame>) -> Vec<Frame> {
    let (writer, reader) = tokio::io::duplex(64);
    let mut sink = FramedWrite::new(writer, FrameCodec::new());
    let mut stream = FramedRead::new(reader, FrameCodec::new());

    let expected = frames.len();
    let send = tokio::spawn(async move {
        for frame in frames {
            sink.send(frame).await.unwrap();
        }
        sink
    });

    let mut received = Vec::with_capacity(expected);
    while received.len() < expected {
        let frame = stream.next().await.expect("stream ended early").unwrap();
        received.push(frame);
    }
    drop(send.await.unwrap());
    assert!(stream.next().await.is_none());
    received
}

#[tokio::test]
async fn data_of_length_zero_one_and_large_survive_the_stream() {
    let large: Vec<u8> = (0..MAX_DATA_CHUNK * 3 + 5).map(|i| (i * 7 % 256) as u8).collect();
    let frames = vec![
        Frame::Data(Bytes::new()),
        Frame::Data(Bytes::from_static(b"a")),
        Frame::Data(Bytes::from(large)),
    ];

    let received = roundtrip(frames.clone()).await;
    assert_eq!(received, frames);
}

#[tokio::test]
async fn control_frames_interleave_with_data_in_order() {
    let frames = vec![
        Frame::Resize(TerminalSize::new(40, 120)),
        Frame::Data(Bytes::from_static(b"echo hi\r")),
        Frame::Heartbeat,
        Frame::Data(Bytes::from_static(b"hi\r\n")),
        Frame::Close,
    ];

    assert_eq!(roundtrip(frames.clone()).await, frames);
}

#[tokio::test]
async fn chunked_output_reassembles() {
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 256) as u8).collect();
    let frames = Frame::data_chunks(Bytes::from(payload.clone()));

    let mut joined = Vec::new();
    for frame in roundtrip(frames).await {
        if let Frame::Data(chunk) = frame {
            joined.extend_from_slice(&chunk);
        }
    }
    assert_eq!(joined, payload);
}
