use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use bm_core::ipc::{ControlEvent, ControlRequest, ControlResponse};
use bm_core::{SessionId, SessionInfo};

/// Connection to a running `bridgeme host` process
pub struct ControlClient {
    address: String,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl ControlClient {
    /// Connect to the control endpoint at `address`
    pub async fn connect(address: &str) -> Result<Self> {
        tracing::debug!("Connecting to control endpoint at {}", address);

        let stream = TcpStream::connect(address).await.with_context(|| {
            format!(
                "No bridgeme host is running (control endpoint {} unreachable)",
                address
            )
        })?;
        let (reader, writer) = stream.into_split();

        Ok(Self {
            address: address.to_string(),
            reader: BufReader::new(reader),
            writer,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Check that the host process answers
    pub async fn ping(&mut self) -> Result<bool> {
        match self.request(ControlRequest::Ping).await {
            Ok(ControlResponse::Pong) => Ok(true),
            _ => Ok(false),
        }
    }

    /// Snapshot of every session the host process knows
    pub async fn list_sessions(&mut self) -> Result<Vec<SessionInfo>> {
        match self.request(ControlRequest::ListSessions).await? {
            ControlResponse::Sessions { sessions } => Ok(sessions),
            ControlResponse::Error { message } => anyhow::bail!("{}", message),
            other => anyhow::bail!("Unexpected response: {:?}", other),
        }
    }

    /// Close one session; returns how many sessions were affected
    pub async fn close_session(&mut self, session_id: SessionId) -> Result<usize> {
        self.expect_closed(ControlRequest::CloseSession { session_id })
            .await
    }

    /// Close every session
    pub async fn close_all(&mut self) -> Result<usize> {
        self.expect_closed(ControlRequest::CloseAll).await
    }

    /// Start watching: returns the current snapshot, after which
    /// [`next_event`](Self::next_event) yields every state change.
    pub async fn watch(&mut self) -> Result<Vec<SessionInfo>> {
        match self.request(ControlRequest::Watch).await? {
            ControlResponse::Sessions { sessions } => Ok(sessions),
            ControlResponse::Error { message } => anyhow::bail!("{}", message),
            other => anyhow::bail!("Unexpected response: {:?}", other),
        }
    }

    /// Next pushed event; `None` once the host process goes away
    pub async fn next_event(&mut self) -> Result<Option<ControlEvent>> {
        loop {
            match self.read_response().await? {
                None => return Ok(None),
                Some(ControlResponse::SessionEvent(event)) => return Ok(Some(event)),
                Some(other) => tracing::debug!("Ignoring unsolicited response: {:?}", other),
            }
        }
    }

    async fn expect_closed(&mut self, request: ControlRequest) -> Result<usize> {
        match self.request(request).await? {
            ControlResponse::Closed { count } => Ok(count),
            ControlResponse::Error { message } => anyhow::bail!("{}", message),
            other => anyhow::bail!("Unexpected response: {:?}", other),
        }
    }

    async fn request(&mut self, request: ControlRequest) -> Result<ControlResponse> {
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;

        self.read_response()
            .await?
            .ok_or_else(|| anyhow::anyhow!("Control endpoint closed the connection"))
    }

    async fn read_response(&mut self) -> Result<Option<ControlResponse>> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        let response = serde_json::from_str(line.trim_end())
            .with_context(|| format!("Malformed control response: {}", line.trim_end()))?;
        Ok(Some(response))
    }
}
