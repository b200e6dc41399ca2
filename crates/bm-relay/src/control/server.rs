//! Control server
//!
//! Serves the JSON-lines control protocol on a loopback TCP port so that
//! other `bridgeme` invocations can inspect and close the sessions of a
//! running host process.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use bm_core::ipc::{ControlEvent, ControlRequest, ControlResponse};

use crate::session::{CloseTarget, SessionEvent, SessionRegistry};

impl From<SessionEvent> for ControlEvent {
    fn from(event: SessionEvent) -> Self {
        match event {
            SessionEvent::Created(info) => ControlEvent {
                session_id: info.id,
                from: None,
                to: Some(info.state),
                reason: None,
            },
            SessionEvent::StateChanged {
                id,
                from,
                to,
                reason,
            } => ControlEvent {
                session_id: id,
                from: Some(from),
                to: Some(to),
                reason,
            },
            SessionEvent::Removed { id } => ControlEvent {
                session_id: id,
                from: None,
                to: None,
                reason: None,
            },
        }
    }
}

/// Control server bound to a loopback address
pub struct ControlServer {
    listener: TcpListener,
    registry: Arc<SessionRegistry>,
}

impl ControlServer {
    /// Bind the endpoint. Fails if the address is taken.
    pub async fn bind(address: &str, registry: Arc<SessionRegistry>) -> Result<Self> {
        let listener = TcpListener::bind(address)
            .await
            .with_context(|| format!("Failed to bind control endpoint to {}", address))?;
        Ok(Self { listener, registry })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve clients until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        match self.listener.local_addr() {
            Ok(addr) => tracing::info!("Control endpoint listening on {}", addr),
            Err(e) => tracing::debug!("Control endpoint address unknown: {}", e),
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Control endpoint shutting down");
                    break;
                }
                result = self.listener.accept() => match result {
                    Ok((stream, peer_addr)) => {
                        // Only accept connections from localhost
                        if !peer_addr.ip().is_loopback() {
                            tracing::warn!("Rejected non-localhost control connection from {}", peer_addr);
                            continue;
                        }

                        let registry = Arc::clone(&self.registry);
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_client(stream, registry, cancel).await {
                                tracing::debug!("Control client error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Failed to accept control connection: {}", e);
                    }
                },
            }
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    registry: Arc<SessionRegistry>,
    cancel: CancellationToken,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    let mut watch: Option<broadcast::Receiver<SessionEvent>> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            result = reader.read_line(&mut line) => {
                match result {
                    Ok(0) => break, // EOF
                    Ok(_) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            line.clear();
                            continue;
                        }

                        let response = match serde_json::from_str::<ControlRequest>(trimmed) {
                            Ok(request) => {
                                if request == ControlRequest::Watch && watch.is_none() {
                                    watch = Some(registry.subscribe());
                                }
                                handle_request(request, &registry).await
                            }
                            Err(e) => ControlResponse::Error {
                                message: format!("Invalid request: {}", e),
                            },
                        };
                        write_response(&mut writer, &response).await?;
                        line.clear();
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            result = next_event(&mut watch) => {
                match result {
                    Ok(event) => {
                        let response = ControlResponse::SessionEvent(event.into());
                        write_response(&mut writer, &response).await?;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Control watcher lagged by {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    Ok(())
}

async fn handle_request(request: ControlRequest, registry: &SessionRegistry) -> ControlResponse {
    let result = match request {
        ControlRequest::Ping => return ControlResponse::Pong,
        // watchers start from a snapshot; events follow on the same connection
        ControlRequest::ListSessions | ControlRequest::Watch => {
            return ControlResponse::Sessions {
                sessions: registry.list(),
            }
        }
        ControlRequest::CloseSession { session_id } => {
            tracing::info!(session = %session_id, "Close requested over control endpoint");
            registry.close(CloseTarget::One(session_id)).await
        }
        ControlRequest::CloseAll => {
            tracing::info!("Close of all sessions requested over control endpoint");
            registry.close(CloseTarget::All).await
        }
    };

    match result {
        Ok(count) => ControlResponse::Closed { count },
        Err(e) => ControlResponse::Error {
            message: e.to_string(),
        },
    }
}

async fn next_event(
    watch: &mut Option<broadcast::Receiver<SessionEvent>>,
) -> Result<SessionEvent, broadcast::error::RecvError> {
    match watch {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn write_response(
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
    response: &ControlResponse,
) -> Result<()> {
    let mut json = serde_json::to_string(response)?;
    json.push('\n');
    writer.write_all(json.as_bytes()).await?;
    Ok(())
}
