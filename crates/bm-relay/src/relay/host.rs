//! Host session driver
//!
//! Binds a reverse forward on the relay, waits for the client to dial it and
//! serves the local shell over the tunnel channel. The shell is started on
//! the first connection and survives reconnects; the relay binding is kept
//! (and re-established on relay loss) until the session closes.

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use bm_core::traits::{RelayConnection, TunnelStream};
use bm_core::{
    BridgeError, ConnectionError, RelayTarget, Role, SessionError, SessionId, SessionInfo,
    SessionState,
};
use bm_protocol::TerminalSize;
use bm_terminal::{ShellAdapter, ShellLauncher, ShellSpec};

use super::backoff::{connect_with_retry, ExponentialBackoff};
use super::{abandon, sleep_until_deadline, DriverContext, Outcome};
use crate::tunnel::{ChannelEvent, TunnelChannel};

/// A host session that is listening on the relay
pub struct HostSession {
    info: SessionInfo,
    task: JoinHandle<()>,
}

impl HostSession {
    pub fn id(&self) -> &SessionId {
        &self.info.id
    }

    /// Snapshot taken when the relay confirmed the binding
    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn tunnel_port(&self) -> u16 {
        self.info.tunnel_port
    }

    /// What the client passes to `bridgeme connect`
    pub fn connect_string(&self) -> String {
        self.info.connect_string()
    }

    /// Wait for the session to reach `Closed`
    pub async fn wait(self) {
        if let Err(e) = self.task.await {
            tracing::error!(session = %self.info.id, "Host driver panicked: {}", e);
        }
    }
}

/// Create a host session and bring it to `Listening`.
///
/// With `port` unset the registry picks one and a relay bind rejection
/// leads to a fresh pick. An explicit port is used as is.
pub(crate) async fn start_host(
    ctx: DriverContext,
    launcher: Arc<dyn ShellLauncher>,
    relay: RelayTarget,
    port: Option<u16>,
) -> Result<HostSession, BridgeError> {
    let spec = launcher.detect()?;
    let info = ctx
        .registry
        .create(Role::Host, relay.clone(), port, Some(spec.kind))
        .await?;
    let id = info.id.clone();
    let cancel = ctx.registry.claim(&id).await?;

    let conn = match bind_forward(&ctx, &id, &relay, port.is_none(), &cancel).await {
        Ok(conn) => conn,
        Err(e) => {
            abandon(&ctx.registry, &id, e.to_string()).await;
            return Err(e);
        }
    };

    if let Err(e) = ctx
        .registry
        .transition(&id, SessionState::Listening, None)
        .await
    {
        let mut conn = conn;
        conn.close().await;
        abandon(&ctx.registry, &id, e.to_string()).await;
        return Err(e.into());
    }
    let info = ctx.registry.get(&id)?;
    tracing::info!(
        session = %id,
        "Listening on {}:{}",
        relay.host,
        info.tunnel_port
    );

    let driver = HostDriver {
        ctx,
        launcher,
        spec,
        id,
        relay,
        cancel,
        shell: None,
        output: None,
    };
    let task = tokio::spawn(driver.run(conn));

    Ok(HostSession { info, task })
}

/// Connect to the relay and bind the session's port.
///
/// Transient failures, including losing the relay between connecting and
/// binding, share one retry budget.
async fn bind_forward(
    ctx: &DriverContext,
    id: &SessionId,
    relay: &RelayTarget,
    reassign: bool,
    cancel: &CancellationToken,
) -> Result<Box<dyn RelayConnection>, BridgeError> {
    let retry = &ctx.config.retry;
    let mut backoff = ExponentialBackoff::from_config(&retry.backoff);
    let mut rejected = 0u32;
    let mut lost = 0u32;

    loop {
        let mut conn = connect_with_retry(ctx.transport.as_ref(), relay, retry, cancel).await?;

        let result = loop {
            let port = ctx.registry.get(id)?.tunnel_port;
            match conn.request_reverse_forward(port).await {
                Ok(()) => break Ok(()),
                Err(ConnectionError::BindRejected { port }) => {
                    rejected += 1;
                    if !reassign {
                        break Err(BridgeError::from(SessionError::PortInUse(port)));
                    }
                    if rejected >= retry.max_attempts {
                        break Err(SessionError::PortAllocationFailed { attempts: rejected }.into());
                    }
                    tracing::warn!(session = %id, "Relay rejected port {}; picking another", port);
                    if let Err(e) = ctx.registry.reassign_port(id).await {
                        break Err(e.into());
                    }
                }
                Err(e) => break Err(e.into()),
            }
        };

        match result {
            Ok(()) => return Ok(conn),
            Err(BridgeError::Connection(e)) if e.is_transient() => {
                conn.close().await;
                lost += 1;
                if lost >= retry.max_attempts {
                    return Err(ConnectionError::RelayUnreachable {
                        attempts: lost,
                        reason: e.to_string(),
                    }
                    .into());
                }
                let delay = backoff.next_delay();
                tracing::warn!("Lost relay while binding: {}. Retrying in {:?}", e, delay);
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(ConnectionError::ConnectionLost("cancelled".into()).into());
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => {
                conn.close().await;
                return Err(e);
            }
        }
    }
}

enum Wait {
    Cancelled,
    GraceExpired,
    Accepted(Option<TunnelStream>),
}

enum Step {
    Cancelled,
    Channel(Option<ChannelEvent>),
    Output(Option<Bytes>),
    Extra(Option<TunnelStream>),
}

struct HostDriver {
    ctx: DriverContext,
    launcher: Arc<dyn ShellLauncher>,
    spec: ShellSpec,
    id: SessionId,
    relay: RelayTarget,
    cancel: CancellationToken,
    shell: Option<Box<dyn ShellAdapter>>,
    output: Option<mpsc::Receiver<Bytes>>,
}

impl HostDriver {
    async fn run(mut self, mut conn: Box<dyn RelayConnection>) {
        let mut grace_deadline: Option<Instant> = None;

        let reason = loop {
            let stream = match self.wait_for_peer(&mut conn, grace_deadline).await {
                Ok(stream) => stream,
                Err(reason) => break reason,
            };

            if grace_deadline.take().is_some() {
                if let Err(e) = self.transition(SessionState::Listening, None).await {
                    break Some(e.to_string());
                }
            }
            if let Err(e) = self.transition(SessionState::Connected, None).await {
                break Some(e.to_string());
            }

            match self.serve_peer(stream, &mut conn).await {
                Outcome::Resumable(reason) => {
                    tracing::warn!(session = %self.id, "Client connection lost: {}", reason);
                    if let Err(e) = self
                        .transition(SessionState::Disconnected, Some(reason))
                        .await
                    {
                        break Some(e.to_string());
                    }
                    grace_deadline = Some(Instant::now() + self.ctx.registry.config().reconnect_grace);
                }
                Outcome::Finished(reason) => break reason,
            }
        };

        self.finish(conn, reason).await;
    }

    /// Wait in `Listening` or `Disconnected` for the client to dial in.
    ///
    /// Relay loss is retried here; the binding is requested again for the
    /// same port so the client's connect string stays valid.
    async fn wait_for_peer(
        &mut self,
        conn: &mut Box<dyn RelayConnection>,
        grace_deadline: Option<Instant>,
    ) -> Result<TunnelStream, Option<String>> {
        loop {
            let wait = tokio::select! {
                _ = self.cancel.cancelled() => Wait::Cancelled,
                _ = sleep_until_deadline(grace_deadline) => Wait::GraceExpired,
                stream = conn.accept_forwarded_connection() => Wait::Accepted(stream),
            };

            match wait {
                Wait::Cancelled => return Err(None),
                Wait::GraceExpired => {
                    return Err(Some("reconnection grace period expired".to_string()))
                }
                Wait::Accepted(Some(stream)) => {
                    tracing::info!(session = %self.id, "Client connected");
                    return Ok(stream);
                }
                Wait::Accepted(None) => {
                    tracing::warn!(session = %self.id, "Relay connection lost; re-establishing");
                    conn.close().await;
                    match bind_forward(&self.ctx, &self.id, &self.relay, false, &self.cancel).await
                    {
                        Ok(fresh) => *conn = fresh,
                        Err(_) if self.cancel.is_cancelled() => return Err(None),
                        Err(e) => return Err(Some(e.to_string())),
                    }
                }
            }
        }
    }

    /// Bridge one client connection to the shell until it ends
    async fn serve_peer(
        &mut self,
        stream: TunnelStream,
        conn: &mut Box<dyn RelayConnection>,
    ) -> Outcome {
        let (channel, mut events) = TunnelChannel::open(stream, &self.ctx.config.tunnel);

        if self.shell.is_none() {
            match self.launcher.launch(&self.spec, TerminalSize::default()) {
                Ok(mut shell) => {
                    tracing::info!(
                        session = %self.id,
                        kind = %shell.kind(),
                        pid = ?shell.pid(),
                        "Shell started"
                    );
                    self.output = shell.take_output();
                    self.shell = Some(shell);
                }
                Err(e) => {
                    tracing::error!(session = %self.id, "Failed to start shell: {}", e);
                    let notice = format!("bridgeme: {}\r\n", e);
                    channel.send_data(Bytes::from(notice)).await;
                    channel.close().await;
                    return Outcome::Finished(Some(e.to_string()));
                }
            }
        }

        let banner = format!("*** bridgeme session {} ***\r\n", self.id);
        channel.send_data(Bytes::from(banner)).await;

        // once the relay is gone, accept would only keep reporting it
        let mut relay_lost = false;

        loop {
            let step = tokio::select! {
                _ = self.cancel.cancelled() => Step::Cancelled,
                event = events.recv() => Step::Channel(event),
                output = recv_output(&mut self.output) => Step::Output(output),
                extra = conn.accept_forwarded_connection(), if !relay_lost => Step::Extra(extra),
            };

            match step {
                Step::Cancelled => {
                    channel.close().await;
                    return Outcome::Finished(None);
                }
                Step::Channel(Some(ChannelEvent::Data(data))) => {
                    if let Some(shell) = self.shell.as_mut() {
                        if let Err(e) = shell.write(&data) {
                            tracing::warn!(session = %self.id, "Shell write failed: {}", e);
                        }
                    }
                    self.ctx.registry.touch(&self.id);
                }
                Step::Channel(Some(ChannelEvent::Resize(size))) => {
                    if let Some(shell) = self.shell.as_mut() {
                        match shell.resize(size) {
                            Ok(()) => tracing::debug!(session = %self.id, "Resized to {}", size),
                            Err(e) => tracing::warn!(session = %self.id, "Resize failed: {}", e),
                        }
                    }
                }
                Step::Channel(Some(ChannelEvent::Closed(reason))) => {
                    return if reason.is_resumable() {
                        Outcome::Resumable(reason.to_string())
                    } else {
                        Outcome::Finished(Some(reason.to_string()))
                    };
                }
                Step::Channel(None) => {
                    return Outcome::Resumable("tunnel channel ended".to_string());
                }
                Step::Output(Some(data)) => {
                    channel.send_data(data).await;
                    self.ctx.registry.touch(&self.id);
                }
                Step::Output(None) => {
                    let status = self
                        .shell
                        .as_mut()
                        .and_then(|shell| shell.try_wait().ok().flatten());
                    let reason = match status {
                        Some(code) => format!("shell exited with status {}", code),
                        None => "shell exited".to_string(),
                    };
                    tracing::info!(session = %self.id, "{}", reason);
                    channel.close().await;
                    return Outcome::Finished(Some(reason));
                }
                Step::Extra(Some(_stream)) => {
                    tracing::warn!(
                        session = %self.id,
                        "Rejecting additional connection; session already has a client"
                    );
                }
                Step::Extra(None) => relay_lost = true,
            }
        }
    }

    /// Owns its inputs, so awaiting it never needs the driver to be `Sync`
    fn transition(
        &self,
        to: SessionState,
        reason: Option<String>,
    ) -> impl Future<Output = Result<SessionState, SessionError>> + Send + 'static {
        let registry = Arc::clone(&self.ctx.registry);
        let id = self.id.clone();
        async move { registry.transition(&id, to, reason).await }
    }

    /// `Closing` through `Closed`, releasing everything the session holds
    async fn finish(mut self, mut conn: Box<dyn RelayConnection>, reason: Option<String>) {
        let _ = self.transition(SessionState::Closing, reason).await;

        if let Some(mut shell) = self.shell.take() {
            shell.terminate();
        }
        if let Ok(info) = self.ctx.registry.get(&self.id) {
            if let Err(e) = conn.cancel_reverse_forward(info.tunnel_port).await {
                tracing::debug!(session = %self.id, "Could not cancel relay binding: {}", e);
            }
        }
        conn.close().await;

        let _ = self.transition(SessionState::Closed, None).await;
        tracing::info!(session = %self.id, "Host session closed");
    }
}

async fn recv_output(output: &mut Option<mpsc::Receiver<Bytes>>) -> Option<Bytes> {
    match output {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn test_driver_future_is_send() {
        fn check(driver: HostDriver, conn: Box<dyn RelayConnection>) {
            let run = driver.run(conn);
            assert_send(&run);
        }
        let _ = check;
    }
}
