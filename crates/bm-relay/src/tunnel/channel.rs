//! Tunnel channel runtime
//!
//! A channel owns the forwarded stream through two tasks. The reader task
//! decodes inbound frames into [`ChannelEvent`]s and watches for the peer's
//! heartbeats. The writer task writes outbound frames queued through a
//! [`ChannelHandle`] and emits heartbeats on a fixed interval. A peer that
//! stops reading stalls only the writer, so the heartbeat deadline and
//! [`ChannelHandle::close`] still fire. Whatever ends the channel, the reader
//! task reports exactly one [`ChannelEvent::Closed`] and then drops its event
//! sender.

use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use bm_core::config::TunnelConfig;
use bm_core::traits::TunnelStream;
use bm_protocol::{Frame, FrameCodec, ProtocolError, TerminalSize};

/// Outbound frames waiting to be written
const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

/// Inbound events waiting for the session driver
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How long the `Close` frame may take to queue and to flush
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// How long buffered inbound frames are read after a write fails
const DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

type FrameReader = FramedRead<ReadHalf<TunnelStream>, FrameCodec>;
type FrameWriter = FramedWrite<WriteHalf<TunnelStream>, FrameCodec>;

/// Why a channel ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer sent a `Close` frame
    PeerClosed,
    /// The underlying stream reached EOF
    StreamEnded,
    /// Reading or writing the stream failed
    StreamError(String),
    /// No heartbeat arrived within the timeout
    HeartbeatTimeout,
    /// The peer sent bytes that are not a valid frame
    Protocol(String),
    /// This side closed the channel
    LocalClose,
}

impl CloseReason {
    /// Whether the session may wait for the peer to come back.
    ///
    /// Loss of the stream is recoverable; an explicit close from either side
    /// is not.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            CloseReason::StreamEnded
                | CloseReason::StreamError(_)
                | CloseReason::HeartbeatTimeout
                | CloseReason::Protocol(_)
        )
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "peer closed the session"),
            CloseReason::StreamEnded => write!(f, "tunnel stream ended"),
            CloseReason::StreamError(e) => write!(f, "tunnel stream error: {}", e),
            CloseReason::HeartbeatTimeout => write!(f, "heartbeat timeout"),
            CloseReason::Protocol(e) => write!(f, "protocol error: {}", e),
            CloseReason::LocalClose => write!(f, "closed locally"),
        }
    }
}

/// Event delivered to the session driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Data(Bytes),
    Resize(TerminalSize),
    /// Always the last event of a channel
    Closed(CloseReason),
}

/// Sending half of an open channel.
///
/// Dropping the handle closes the channel the same way [`ChannelHandle::close`]
/// does, without waiting.
pub struct ChannelHandle {
    tx: mpsc::Sender<Frame>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ChannelHandle {
    /// Queue terminal bytes, split into chunks that stay well under the
    /// frame size limit.
    ///
    /// Waits while the outbound queue is full.
    pub async fn send_data(&self, data: Bytes) -> bool {
        for frame in Frame::data_chunks(data) {
            if self.tx.send(frame).await.is_err() {
                return false;
            }
        }
        true
    }

    pub async fn send_resize(&self, size: TerminalSize) -> bool {
        self.tx.send(Frame::Resize(size)).await.is_ok()
    }

    /// Whether the channel task has ended
    pub fn is_closed(&self) -> bool {
        self.task.is_finished()
    }

    /// Send `Close` to the peer and wait for the channel to end.
    ///
    /// Falls back to cancelling the channel if the frame cannot be queued or
    /// flushed in time, so this returns even when the peer stopped reading.
    pub async fn close(self) {
        let ChannelHandle { tx, cancel, mut task } = self;
        let queued = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, tx.send(Frame::Close)).await;
        drop(tx);
        if matches!(queued, Ok(Ok(())))
            && tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut task)
                .await
                .is_ok()
        {
            return;
        }

        tracing::debug!("Close frame not flushed in time; cancelling channel");
        cancel.cancel();
        if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT * 2, &mut task).await.is_err() {
            tracing::warn!("Tunnel channel did not stop after cancellation; aborting");
            task.abort();
        }
    }
}

/// Entry point for opening channels
pub struct TunnelChannel;

impl TunnelChannel {
    /// Start the channel tasks over `stream`.
    ///
    /// Returns the sending handle and the receiver of inbound events. The
    /// receiver yields `Closed` exactly once and then `None`.
    pub fn open(
        stream: TunnelStream,
        config: &TunnelConfig,
    ) -> (ChannelHandle, mpsc::Receiver<ChannelEvent>) {
        let (tx, outbound) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
        let (events, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_channel(
            stream,
            outbound,
            events,
            cancel.clone(),
            config.heartbeat_interval,
            config.heartbeat_timeout,
        ));

        (ChannelHandle { tx, cancel, task }, rx)
    }
}

/// How the writer task ended
#[derive(Debug)]
enum WriterExit {
    /// Local close requested; `Close` was flushed or given up on
    Closed,
    /// Writing to the stream failed
    Failed(String),
}

async fn run_channel(
    stream: TunnelStream,
    outbound: mpsc::Receiver<Frame>,
    events: mpsc::Sender<ChannelEvent>,
    cancel: CancellationToken,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
) {
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = FramedRead::new(read_half, FrameCodec::new());
    let mut writer = tokio::spawn(run_writer(
        FramedWrite::new(write_half, FrameCodec::new()),
        outbound,
        cancel.clone(),
        heartbeat_interval,
    ));
    let mut writer_done = false;
    let mut deadline = Instant::now() + heartbeat_timeout;

    let reason = loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break CloseReason::LocalClose,

            exit = &mut writer => {
                writer_done = true;
                match exit {
                    Ok(WriterExit::Closed) => break CloseReason::LocalClose,
                    Ok(WriterExit::Failed(e)) => {
                        break drain_after_write_error(&mut reader, &events, &cancel, e).await;
                    }
                    Err(e) => break CloseReason::StreamError(e.to_string()),
                }
            }

            inbound = reader.next() => match inbound {
                Some(Ok(Frame::Heartbeat)) => {
                    tracing::trace!("Heartbeat received");
                    deadline = Instant::now() + heartbeat_timeout;
                }
                Some(Ok(Frame::Close)) => break CloseReason::PeerClosed,
                Some(Ok(frame)) => {
                    if !forward(&events, frame, &cancel).await {
                        break CloseReason::LocalClose;
                    }
                }
                Some(Err(ProtocolError::Io(e))) => break CloseReason::StreamError(e.to_string()),
                Some(Err(e)) => break CloseReason::Protocol(e.to_string()),
                None => break CloseReason::StreamEnded,
            },

            _ = tokio::time::sleep_until(deadline) => {
                tracing::warn!("No heartbeat for {:?}; closing channel", heartbeat_timeout);
                break CloseReason::HeartbeatTimeout;
            }
        }
    };

    if !writer_done {
        // on cancellation the writer still gets to flush `Close`
        if cancel.is_cancelled()
            && tokio::time::timeout(CLOSE_FLUSH_TIMEOUT * 2, &mut writer)
                .await
                .is_ok()
        {
            writer_done = true;
        }
        if !writer_done {
            writer.abort();
            let _ = writer.await;
        }
    }
    drop(reader);

    finish(&events, reason).await;
}

/// Write queued frames and heartbeats until the channel closes.
///
/// Every write races the cancellation token, so a stalled peer never pins
/// the task.
async fn run_writer(
    mut sink: FrameWriter,
    mut outbound: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
    heartbeat_interval: Duration,
) -> WriterExit {
    let mut ticker =
        tokio::time::interval_at(Instant::now() + heartbeat_interval, heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // Heartbeat right away so the peer starts its timer from a known point
    let mut next = Some(Frame::Heartbeat);
    loop {
        if let Some(frame) = next.take() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                sent = sink.send(frame) => {
                    if let Err(e) = sent {
                        return WriterExit::Failed(e.to_string());
                    }
                }
            }
        }

        next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => Some(Frame::Heartbeat),
            frame = outbound.recv() => match frame {
                Some(Frame::Close) | None => break,
                Some(frame) => Some(frame),
            },
        };
    }

    let _ = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, sink.send(Frame::Close)).await;
    WriterExit::Closed
}

/// Read what the peer sent before a write failed. A trailing `Close` means
/// the peer hung up on purpose rather than losing the stream.
async fn drain_after_write_error(
    reader: &mut FrameReader,
    events: &mpsc::Sender<ChannelEvent>,
    cancel: &CancellationToken,
    error: String,
) -> CloseReason {
    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while let Some(Ok(frame)) = reader.next().await {
            match frame {
                Frame::Close => return Some(CloseReason::PeerClosed),
                Frame::Heartbeat => {}
                frame => {
                    if !forward(events, frame, cancel).await {
                        return Some(CloseReason::LocalClose);
                    }
                }
            }
        }
        None
    })
    .await;

    match drained {
        Ok(Some(reason)) => reason,
        _ => CloseReason::StreamError(error),
    }
}

/// Hand a data or resize frame to the session driver
async fn forward(
    events: &mpsc::Sender<ChannelEvent>,
    frame: Frame,
    cancel: &CancellationToken,
) -> bool {
    let event = match frame {
        Frame::Data(data) => {
            tracing::trace!("Received {} bytes", data.len());
            ChannelEvent::Data(data)
        }
        Frame::Resize(size) => ChannelEvent::Resize(size),
        Frame::Heartbeat | Frame::Close => return true,
    };
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = events.send(event) => sent.is_ok(),
    }
}

async fn finish(events: &mpsc::Sender<ChannelEvent>, reason: CloseReason) {
    tracing::debug!("Tunnel channel closed: {}", reason);
    let _ = events.send(ChannelEvent::Closed(reason)).await;
}
