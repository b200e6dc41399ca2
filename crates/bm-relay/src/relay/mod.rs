//! Relay orchestrator
//!
//! Drives session lifecycles on top of a [`RelayTransport`]. Each session
//! gets its own task; sessions share only the registry.

mod backoff;
mod client;
mod host;

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use bm_core::config::BridgeConfig;
use bm_core::traits::RelayTransport;
use bm_core::{BridgeError, RelayTarget, SessionError, SessionId, SessionInfo, SessionState};
use bm_terminal::{LocalTerminal, ShellLauncher};

use crate::session::{CloseTarget, SessionEvent, SessionRegistry};

pub use backoff::{connect_with_retry, ExponentialBackoff};
pub use client::ClientSession;
pub use host::HostSession;

/// What a session driver needs besides its own state
#[derive(Clone)]
pub(crate) struct DriverContext {
    pub config: Arc<BridgeConfig>,
    pub registry: Arc<SessionRegistry>,
    pub transport: Arc<dyn RelayTransport>,
}

/// How one tunnel connection ended
pub(crate) enum Outcome {
    /// The peer may come back; wait in `Disconnected`
    Resumable(String),
    /// The session is over, with the reason if it was not a plain request
    Finished(Option<String>),
}

/// Mark a session that never got going as closed
pub(crate) async fn abandon(registry: &SessionRegistry, id: &SessionId, reason: String) {
    tracing::warn!(session = %id, "Session failed: {}", reason);
    let _ = registry
        .transition(id, SessionState::Closing, Some(reason))
        .await;
    let _ = registry.transition(id, SessionState::Closed, None).await;
}

pub(crate) async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Entry point used by the CLI
pub struct RelayOrchestrator {
    config: Arc<BridgeConfig>,
    registry: Arc<SessionRegistry>,
    transport: Arc<dyn RelayTransport>,
    launcher: Arc<dyn ShellLauncher>,
}

impl RelayOrchestrator {
    pub fn new(
        config: BridgeConfig,
        transport: Arc<dyn RelayTransport>,
        launcher: Arc<dyn ShellLauncher>,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new(
            config.session.clone(),
            config.ports.clone(),
        ));
        Self {
            config: Arc::new(config),
            registry,
            transport,
            launcher,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    fn context(&self) -> DriverContext {
        DriverContext {
            config: Arc::clone(&self.config),
            registry: Arc::clone(&self.registry),
            transport: Arc::clone(&self.transport),
        }
    }

    /// Start hosting the local shell through `relay`.
    ///
    /// Returns once the relay has confirmed the port binding.
    pub async fn start_host(
        &self,
        relay: RelayTarget,
        port: Option<u16>,
    ) -> Result<HostSession, BridgeError> {
        host::start_host(self.context(), Arc::clone(&self.launcher), relay, port).await
    }

    /// Attach `terminal` to the host listening on `port` of `relay`.
    ///
    /// Returns once the forwarded channel is open.
    pub async fn start_client(
        &self,
        relay: RelayTarget,
        port: u16,
        terminal: Box<dyn LocalTerminal>,
    ) -> Result<ClientSession, BridgeError> {
        client::start_client(self.context(), relay, port, terminal).await
    }

    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        self.registry.list()
    }

    pub async fn close_session(&self, target: CloseTarget) -> Result<usize, SessionError> {
        self.registry.close(target).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.registry.subscribe()
    }

    pub fn spawn_reaper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        self.registry.spawn_reaper(cancel)
    }

    /// Close every session and wait for the drivers to finish
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down {} session(s)", self.registry.len());
        self.registry
            .teardown(self.config.session.closing_timeout)
            .await;
    }
}
