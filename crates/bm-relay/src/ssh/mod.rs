//! SSH transport to the relay

mod transport;

pub use transport::{SshConnection, SshTransport};
