//! Relay transport traits
//!
//! The orchestrator drives sessions against these traits only, so the SSH
//! implementation can be swapped for an in-memory relay in tests.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::ConnectionError;
use crate::types::RelayTarget;

/// Byte stream carried by one forwarded TCP connection
pub trait TunnelIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> TunnelIo for T {}

/// Owned, type-erased tunnel stream
pub type TunnelStream = Box<dyn TunnelIo>;

/// Factory for authenticated relay connections
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Open and authenticate a connection to the relay.
    ///
    /// Authentication failures are reported as
    /// [`ConnectionError::AuthenticationFailed`] and must not be retried.
    async fn connect(&self, target: &RelayTarget)
        -> Result<Box<dyn RelayConnection>, ConnectionError>;
}

/// One authenticated connection to the relay
#[async_trait]
pub trait RelayConnection: Send {
    /// Ask the relay to listen on `port` and forward connections back to us.
    ///
    /// Returns [`ConnectionError::BindRejected`] when the relay refuses the port.
    async fn request_reverse_forward(&mut self, port: u16) -> Result<(), ConnectionError>;

    /// Stop a reverse forward previously granted on `port`
    async fn cancel_reverse_forward(&mut self, port: u16) -> Result<(), ConnectionError>;

    /// Open a forwarded channel to `host:port` as seen from the relay
    async fn open_forwarded_channel(
        &mut self,
        host: &str,
        port: u16,
    ) -> Result<TunnelStream, ConnectionError>;

    /// Wait for the next connection arriving on a reverse forward.
    ///
    /// Returns `None` once the relay connection is gone.
    async fn accept_forwarded_connection(&mut self) -> Option<TunnelStream>;

    /// Disconnect from the relay. Idempotent.
    async fn close(&mut self);
}
