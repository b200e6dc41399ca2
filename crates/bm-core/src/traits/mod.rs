//! Core trait definitions

mod transport;

pub use transport::{RelayConnection, RelayTransport, TunnelIo, TunnelStream};
