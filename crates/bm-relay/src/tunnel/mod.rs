//! Framed terminal channel over one forwarded stream

mod channel;

pub use channel::{ChannelEvent, ChannelHandle, CloseReason, TunnelChannel};
