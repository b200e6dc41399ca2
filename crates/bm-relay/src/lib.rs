//! bm-relay: session and tunnel management for bridgeme
//!
//! Two peers that cannot reach each other meet on an SSH relay. The host
//! asks the relay for a reverse port forward and serves its shell on it;
//! the client opens a forwarded channel to that port. This crate owns
//! everything between the SSH library and the terminal adapters: port
//! allocation, the session registry, the framed tunnel channel and the
//! per-session lifecycle drivers.

pub mod control;
pub mod relay;
pub mod session;
pub mod ssh;
pub mod tunnel;

pub use control::ControlServer;
pub use relay::{ClientSession, HostSession, RelayOrchestrator};
pub use session::{CloseTarget, PortAllocator, SessionEvent, SessionRegistry};
pub use ssh::SshTransport;
pub use tunnel::{ChannelEvent, ChannelHandle, CloseReason, TunnelChannel};
