//! Client session driver
//!
//! Dials the host's forwarded port through the relay and attaches the local
//! terminal to the tunnel channel. When the connection drops the client is
//! the side that re-initiates, for as long as the grace period allows.

use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use bm_core::traits::{RelayConnection, TunnelStream};
use bm_core::{BridgeError, ConnectionError, RelayTarget, Role, SessionId, SessionInfo, SessionState};
use bm_terminal::{LocalInput, LocalTerminal};

use super::backoff::{connect_with_retry, ExponentialBackoff};
use super::{abandon, sleep_until_deadline, DriverContext, Outcome};
use crate::tunnel::{ChannelEvent, TunnelChannel};

const CTRL_C: u8 = 0x03;

/// A client session attached to a host
pub struct ClientSession {
    info: SessionInfo,
    task: JoinHandle<()>,
}

impl ClientSession {
    pub fn id(&self) -> &SessionId {
        &self.info.id
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    /// Wait for the session to reach `Closed`; the terminal is restored by then
    pub async fn wait(self) {
        if let Err(e) = self.task.await {
            tracing::error!(session = %self.info.id, "Client driver panicked: {}", e);
        }
    }
}

/// Create a client session and bring it to `Connected`
pub(crate) async fn start_client(
    ctx: DriverContext,
    relay: RelayTarget,
    port: u16,
    mut terminal: Box<dyn LocalTerminal>,
) -> Result<ClientSession, BridgeError> {
    let info = ctx
        .registry
        .create(Role::Client, relay.clone(), Some(port), None)
        .await?;
    let id = info.id.clone();
    let cancel = ctx.registry.claim(&id).await?;

    let (conn, stream) = match dial_attended(&ctx, &relay, port, &cancel, &mut terminal).await {
        Ok(pair) => pair,
        Err(e) => {
            abandon(&ctx.registry, &id, e.to_string()).await;
            return Err(e.into());
        }
    };

    if let Err(e) = ctx
        .registry
        .transition(&id, SessionState::Connected, None)
        .await
    {
        let mut conn = conn;
        conn.close().await;
        abandon(&ctx.registry, &id, e.to_string()).await;
        return Err(e.into());
    }
    let info = ctx.registry.get(&id)?;
    tracing::info!(session = %id, "Connected to {}:{}", relay.host, port);

    let driver = ClientDriver {
        ctx,
        id,
        relay,
        port,
        cancel,
        terminal,
    };
    let task = tokio::spawn(driver.run(conn, stream));

    Ok(ClientSession { info, task })
}

/// Connect with the retry policy and open the channel to the host's port
async fn dial(
    ctx: &DriverContext,
    relay: &RelayTarget,
    port: u16,
    cancel: &CancellationToken,
) -> Result<(Box<dyn RelayConnection>, TunnelStream), ConnectionError> {
    let conn = connect_with_retry(ctx.transport.as_ref(), relay, &ctx.config.retry, cancel).await?;
    open_channel(ctx, conn, port).await
}

/// [`dial`] while watching the terminal. The user can give up with Ctrl+]
/// or Ctrl+C, since raw mode keeps Ctrl+C from raising a signal.
async fn dial_attended(
    ctx: &DriverContext,
    relay: &RelayTarget,
    port: u16,
    cancel: &CancellationToken,
    terminal: &mut Box<dyn LocalTerminal>,
) -> Result<(Box<dyn RelayConnection>, TunnelStream), ConnectionError> {
    let attempt = dial(ctx, relay, port, cancel);
    tokio::pin!(attempt);

    loop {
        let input = tokio::select! {
            result = &mut attempt => return result,
            input = terminal.next_input() => input,
        };
        match input {
            Some(LocalInput::Close) | None => break,
            Some(LocalInput::Data(data)) if data.contains(&CTRL_C) => break,
            // no shell to deliver anything to yet
            Some(_) => {}
        }
    }

    tracing::info!("Connection attempt abandoned from terminal");
    Err(ConnectionError::ConnectionLost("cancelled by user".into()))
}

async fn open_channel(
    ctx: &DriverContext,
    mut conn: Box<dyn RelayConnection>,
    port: u16,
) -> Result<(Box<dyn RelayConnection>, TunnelStream), ConnectionError> {
    match conn
        .open_forwarded_channel(&ctx.config.relay.bind_address, port)
        .await
    {
        Ok(stream) => Ok((conn, stream)),
        Err(e) => {
            conn.close().await;
            Err(e)
        }
    }
}

enum Step {
    Cancelled,
    Channel(Option<ChannelEvent>),
    Input(Option<LocalInput>),
}

enum Retry {
    Cancelled,
    GraceExpired,
    Input(Option<LocalInput>),
    Attempt(Result<(Box<dyn RelayConnection>, TunnelStream), ConnectionError>),
}

struct ClientDriver {
    ctx: DriverContext,
    id: SessionId,
    relay: RelayTarget,
    port: u16,
    cancel: CancellationToken,
    terminal: Box<dyn LocalTerminal>,
}

impl ClientDriver {
    async fn run(mut self, conn: Box<dyn RelayConnection>, stream: TunnelStream) {
        let mut conn = Some(conn);
        let mut stream = stream;

        let reason = loop {
            match self.serve(stream).await {
                Outcome::Finished(reason) => break reason,
                Outcome::Resumable(reason) => {
                    tracing::warn!(session = %self.id, "Connection to host lost: {}", reason);
                    if let Some(mut old) = conn.take() {
                        old.close().await;
                    }
                    if let Err(e) = self.transition(SessionState::Disconnected, Some(reason)).await {
                        break Some(e.to_string());
                    }
                    match self.reconnect().await {
                        Ok((fresh, fresh_stream)) => {
                            conn = Some(fresh);
                            stream = fresh_stream;
                            if let Err(e) = self.transition(SessionState::Connected, None).await {
                                break Some(e.to_string());
                            }
                            tracing::info!(session = %self.id, "Reconnected to host");
                        }
                        Err(reason) => break reason,
                    }
                }
            }
        };

        let _ = self.transition(SessionState::Closing, reason).await;
        // restores the terminal mode before anything else is printed
        drop(self.terminal);
        if let Some(mut conn) = conn {
            conn.close().await;
        }
        let _ = self
            .ctx
            .registry
            .transition(&self.id, SessionState::Closed, None)
            .await;
        tracing::info!(session = %self.id, "Client session closed");
    }

    /// Bridge the local terminal to one tunnel connection
    async fn serve(&mut self, stream: TunnelStream) -> Outcome {
        let (channel, mut events) = TunnelChannel::open(stream, &self.ctx.config.tunnel);
        channel.send_resize(self.terminal.size()).await;

        loop {
            let step = tokio::select! {
                _ = self.cancel.cancelled() => Step::Cancelled,
                event = events.recv() => Step::Channel(event),
                input = self.terminal.next_input() => Step::Input(input),
            };

            match step {
                Step::Cancelled => {
                    channel.close().await;
                    return Outcome::Finished(None);
                }
                Step::Channel(Some(ChannelEvent::Data(data))) => {
                    if let Err(e) = self.terminal.write_output(&data).await {
                        tracing::warn!(session = %self.id, "Terminal write failed: {}", e);
                    }
                    self.ctx.registry.touch(&self.id);
                }
                Step::Channel(Some(ChannelEvent::Resize(size))) => {
                    tracing::debug!(session = %self.id, "Ignoring resize {} from host", size);
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
                Step::Input(Some(LocalInput::Data(data))) => {
                    channel.send_data(data).await;
                    self.ctx.registry.touch(&self.id);
                }
                Step::Input(Some(LocalInput::Resize(size))) => {
                    channel.send_resize(size).await;
                }
                Step::Input(Some(LocalInput::Close)) => {
                    tracing::info!(session = %self.id, "Close requested from terminal");
                    channel.close().await;
                    return Outcome::Finished(Some("closed by user".to_string()));
                }
                Step::Input(None) => {
                    channel.close().await;
                    return Outcome::Finished(Some("local input ended".to_string()));
                }
            }
        }
    }

    /// `Disconnected` → `Pending`, then dial again with backoff until the
    /// grace period runs out.
    async fn reconnect(
        &mut self,
    ) -> Result<(Box<dyn RelayConnection>, TunnelStream), Option<String>> {
        let deadline = Instant::now() + self.ctx.registry.config().reconnect_grace;
        self.transition(SessionState::Pending, None)
            .await
            .map_err(|e| Some(e.to_string()))?;

        let ctx = self.ctx.clone();
        let relay = self.relay.clone();
        let port = self.port;
        let attempt = redial(ctx, relay, port);
        tokio::pin!(attempt);

        loop {
            let retry = tokio::select! {
                _ = self.cancel.cancelled() => Retry::Cancelled,
                _ = sleep_until_deadline(Some(deadline)) => Retry::GraceExpired,
                input = self.terminal.next_input() => Retry::Input(input),
                result = &mut attempt => Retry::Attempt(result),
            };

            match retry {
                Retry::Cancelled => return Err(None),
                Retry::GraceExpired => {
                    return Err(Some("reconnection grace period expired".to_string()))
                }
                Retry::Input(Some(LocalInput::Close)) => {
                    return Err(Some("closed by user".to_string()))
                }
                Retry::Input(None) => return Err(Some("local input ended".to_string())),
                // nothing to deliver keystrokes to while reconnecting
                Retry::Input(Some(_)) => {}
                Retry::Attempt(Ok(pair)) => return Ok(pair),
                Retry::Attempt(Err(e)) => return Err(Some(e.to_string())),
            }
        }
    }

    /// Owns its inputs, so awaiting it never needs the driver to be `Sync`
    fn transition(
        &self,
        to: SessionState,
        reason: Option<String>,
    ) -> impl Future<Output = Result<SessionState, bm_core::SessionError>> + Send + 'static {
        let registry = Arc::clone(&self.ctx.registry);
        let id = self.id.clone();
        async move { registry.transition(&id, to, reason).await }
    }
}

/// Keep dialing until the host's port answers or a failure is not worth
/// retrying. The caller bounds this with the grace deadline.
async fn redial(
    ctx: DriverContext,
    relay: RelayTarget,
    port: u16,
) -> Result<(Box<dyn RelayConnection>, TunnelStream), ConnectionError> {
    let mut backoff = ExponentialBackoff::from_config(&ctx.config.retry.backoff);
    loop {
        let result = match ctx.transport.connect(&relay).await {
            Ok(conn) => match open_channel(&ctx, conn, port).await {
                Ok(pair) => return Ok(pair),
                Err(e) => e,
            },
            Err(e) => e,
        };

        // the host may still be rebinding, so a refused channel is retried too
        match result {
            ConnectionError::AuthenticationFailed { .. }
            | ConnectionError::HostKeyRejected(_)
            | ConnectionError::NoIdentity(_) => return Err(result),
            e => {
                let delay = backoff.next_delay();
                tracing::debug!("Reconnect attempt failed: {}. Retrying in {:?}", e, delay);
                tokio::time::sleep(delay).await;
            }
        }
    }
}
