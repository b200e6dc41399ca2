//! Shared fixtures: an in-memory relay, a scripted shell and a scripted
//! terminal, so whole sessions run inside one test process.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use bm_core::config::BridgeConfig;
use bm_core::traits::{RelayConnection, RelayTransport, TunnelStream};
use bm_core::{ConnectionError, RelayTarget, SessionId, SessionInfo, SessionState, ShellKind, TerminalError};
use bm_protocol::TerminalSize;
use bm_relay::SessionRegistry;
use bm_terminal::{LocalInput, LocalTerminal, ShellAdapter, ShellLauncher, ShellSpec};

const STREAM_BUFFER: usize = 64 * 1024;

/// Configuration with timings short enough for tests
pub fn test_config(port_start: u16, port_end: u16) -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.ports.start = port_start;
    config.ports.end = port_end;
    config.session.reconnect_grace = Duration::from_millis(500);
    config.session.closing_timeout = Duration::from_secs(2);
    config.retry.max_attempts = 3;
    config.retry.backoff.initial = Duration::from_millis(10);
    config.retry.backoff.max = Duration::from_millis(50);
    config.retry.backoff.jitter = 0.0;
    config
}

pub fn relay_target() -> RelayTarget {
    RelayTarget::new("relay.test", 22)
}

/// Poll the registry until `id` reaches `state`
pub async fn wait_for_state(
    registry: &SessionRegistry,
    id: &SessionId,
    state: SessionState,
) -> SessionInfo {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(info) = registry.get(id) {
            if info.state == state {
                return info;
            }
        }
        if tokio::time::Instant::now() > deadline {
            panic!(
                "session {} never reached {} (now {:?})",
                id,
                state,
                registry.get(id).map(|info| info.state)
            );
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[derive(Default)]
struct RelayState {
    /// Bound reverse forwards, keyed by relay port
    listeners: Mutex<HashMap<u16, (u64, mpsc::Sender<TunnelStream>)>>,
    /// Ports the relay refuses to bind, as if someone else held them
    reserved: Mutex<HashSet<u16>>,
    live: Mutex<Vec<CancellationToken>>,
    reject_auth: Mutex<bool>,
    unreachable_for: AtomicU32,
    connects: AtomicU32,
    next_conn: AtomicU32,
}

/// A relay living in memory: reverse forwards are a port table and every
/// forwarded connection is a `tokio::io::duplex` pair.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<RelayState>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserve_port(&self, port: u16) {
        self.state.reserved.lock().unwrap().insert(port);
    }

    pub fn reject_auth(&self, reject: bool) {
        *self.state.reject_auth.lock().unwrap() = reject;
    }

    /// Fail the next `n` connection attempts as unreachable
    pub fn unreachable_for(&self, n: u32) {
        self.state.unreachable_for.store(n, Ordering::SeqCst);
    }

    /// Connection attempts seen so far
    pub fn connects(&self) -> u32 {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn is_bound(&self, port: u16) -> bool {
        self.state.listeners.lock().unwrap().contains_key(&port)
    }

    /// Drop every SSH connection, as if the relay restarted
    pub fn drop_connections(&self) {
        self.state.listeners.lock().unwrap().clear();
        let live: Vec<CancellationToken> = self.state.live.lock().unwrap().drain(..).collect();
        for token in live {
            token.cancel();
        }
    }
}

#[async_trait]
impl RelayTransport for MemoryRelay {
    async fn connect(
        &self,
        target: &RelayTarget,
    ) -> Result<Box<dyn RelayConnection>, ConnectionError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);

        let unreachable = self
            .state
            .unreachable_for
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if unreachable {
            return Err(ConnectionError::RelayUnreachable {
                attempts: 1,
                reason: "connection refused".into(),
            });
        }
        if *self.state.reject_auth.lock().unwrap() {
            return Err(ConnectionError::AuthenticationFailed {
                user: "tester".into(),
                host: target.host.clone(),
            });
        }

        let alive = CancellationToken::new();
        self.state.live.lock().unwrap().push(alive.clone());
        let (tx, rx) = mpsc::channel(16);
        Ok(Box::new(MemoryConnection {
            id: u64::from(self.state.next_conn.fetch_add(1, Ordering::SeqCst)),
            relay: self.clone(),
            forwarded_tx: tx,
            forwarded_rx: rx,
            alive,
        }))
    }
}

pub struct MemoryConnection {
    id: u64,
    relay: MemoryRelay,
    forwarded_tx: mpsc::Sender<TunnelStream>,
    forwarded_rx: mpsc::Receiver<TunnelStream>,
    alive: CancellationToken,
}

impl MemoryConnection {
    fn check_alive(&self) -> Result<(), ConnectionError> {
        if self.alive.is_cancelled() {
            Err(ConnectionError::ConnectionLost("relay connection dropped".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RelayConnection for MemoryConnection {
    async fn request_reverse_forward(&mut self, port: u16) -> Result<(), ConnectionError> {
        self.check_alive()?;
        if self.relay.state.reserved.lock().unwrap().contains(&port) {
            return Err(ConnectionError::BindRejected { port });
        }
        let mut listeners = self.relay.state.listeners.lock().unwrap();
        if listeners.contains_key(&port) {
            return Err(ConnectionError::BindRejected { port });
        }
        listeners.insert(port, (self.id, self.forwarded_tx.clone()));
        Ok(())
    }

    async fn cancel_reverse_forward(&mut self, port: u16) -> Result<(), ConnectionError> {
        let mut listeners = self.relay.state.listeners.lock().unwrap();
        if matches!(listeners.get(&port), Some((owner, _)) if *owner == self.id) {
            listeners.remove(&port);
        }
        Ok(())
    }

    async fn open_forwarded_channel(
        &mut self,
        _host: &str,
        port: u16,
    ) -> Result<TunnelStream, ConnectionError> {
        self.check_alive()?;
        let listener = self
            .relay
            .state
            .listeners
            .lock()
            .unwrap()
            .get(&port)
            .map(|(_, tx)| tx.clone());
        let Some(listener) = listener else {
            return Err(ConnectionError::ChannelOpenFailed(format!("nothing bound on {}", port)));
        };

        let (near, far) = tokio::io::duplex(STREAM_BUFFER);
        listener
            .send(Box::new(far))
            .await
            .map_err(|_| ConnectionError::ChannelOpenFailed(format!("listener on {} gone", port)))?;
        Ok(Box::new(near))
    }

    async fn accept_forwarded_connection(&mut self) -> Option<TunnelStream> {
        tokio::select! {
            _ = self.alive.cancelled() => None,
            stream = self.forwarded_rx.recv() => stream,
        }
    }

    async fn close(&mut self) {
        self.alive.cancel();
        self.relay
            .state
            .listeners
            .lock()
            .unwrap()
            .retain(|_, (owner, _)| *owner != self.id);
    }
}

/// What the scripted shell has seen
#[derive(Default)]
pub struct ShellRecord {
    pub launches: AtomicU32,
    pub size: Mutex<Option<TerminalSize>>,
    pub input: Mutex<Vec<u8>>,
    pub terminated: AtomicU32,
}

/// Launches [`EchoShell`]s
#[derive(Clone, Default)]
pub struct EchoShellLauncher {
    pub record: Arc<ShellRecord>,
}

impl EchoShellLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn size(&self) -> Option<TerminalSize> {
        *self.record.size.lock().unwrap()
    }
}

impl ShellLauncher for EchoShellLauncher {
    fn detect(&self) -> Result<ShellSpec, TerminalError> {
        Ok(ShellSpec::for_program("/bin/bash", true))
    }

    fn launch(
        &self,
        _spec: &ShellSpec,
        size: TerminalSize,
    ) -> Result<Box<dyn ShellAdapter>, TerminalError> {
        self.record.launches.fetch_add(1, Ordering::SeqCst);
        *self.record.size.lock().unwrap() = Some(size);
        let (tx, rx) = mpsc::channel(64);
        Ok(Box::new(EchoShell {
            record: Arc::clone(&self.record),
            size,
            output_tx: Some(tx),
            output_rx: Some(rx),
            exit_code: None,
        }))
    }
}

/// Shell stand-in that echoes its input and exits on `exit\r`
pub struct EchoShell {
    record: Arc<ShellRecord>,
    size: TerminalSize,
    output_tx: Option<mpsc::Sender<Bytes>>,
    output_rx: Option<mpsc::Receiver<Bytes>>,
    exit_code: Option<i32>,
}

impl ShellAdapter for EchoShell {
    fn kind(&self) -> ShellKind {
        ShellKind::Bash
    }

    fn pid(&self) -> Option<u32> {
        Some(4242)
    }

    fn write(&mut self, data: &[u8]) -> Result<(), TerminalError> {
        self.record.input.lock().unwrap().extend_from_slice(data);
        if data == b"exit\r" {
            self.exit_code = Some(0);
            self.output_tx = None;
            return Ok(());
        }
        if let Some(tx) = &self.output_tx {
            let _ = tx.try_send(Bytes::copy_from_slice(data));
        }
        Ok(())
    }

    fn resize(&mut self, size: TerminalSize) -> Result<(), TerminalError> {
        self.size = size;
        *self.record.size.lock().unwrap() = Some(size);
        Ok(())
    }

    fn size(&self) -> TerminalSize {
        self.size
    }

    fn take_output(&mut self) -> Option<mpsc::Receiver<Bytes>> {
        self.output_rx.take()
    }

    fn try_wait(&mut self) -> Result<Option<i32>, TerminalError> {
        Ok(self.exit_code)
    }

    fn terminate(&mut self) {
        if self.output_tx.take().is_some() || self.exit_code.is_none() {
            self.exit_code = Some(-1);
        }
        self.record.terminated.fetch_add(1, Ordering::SeqCst);
    }
}

/// Test side of a [`ScriptedTerminal`]
pub struct TerminalControl {
    pub input: mpsc::Sender<LocalInput>,
    pub output: mpsc::UnboundedReceiver<Bytes>,
}

impl TerminalControl {
    /// Read output until `needle` shows up
    pub async fn expect_output(&mut self, needle: &str) -> String {
        let mut seen = String::new();
        let read = async {
            while let Some(chunk) = self.output.recv().await {
                seen.push_str(&String::from_utf8_lossy(&chunk));
                if seen.contains(needle) {
                    return;
                }
            }
        };
        if tokio::time::timeout(Duration::from_secs(5), read).await.is_err() {
            panic!("terminal never showed {:?}; saw {:?}", needle, seen);
        }
        seen
    }
}

/// Local terminal driven by the test
pub struct ScriptedTerminal {
    size: TerminalSize,
    input: mpsc::Receiver<LocalInput>,
    output: mpsc::UnboundedSender<Bytes>,
}

impl ScriptedTerminal {
    pub fn new(size: TerminalSize) -> (Box<dyn LocalTerminal>, TerminalControl) {
        let (input_tx, input_rx) = mpsc::channel(64);
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        (
            Box::new(Self {
                size,
                input: input_rx,
                output: output_tx,
            }),
            TerminalControl {
                input: input_tx,
                output: output_rx,
            },
        )
    }
}

#[async_trait]
impl LocalTerminal for ScriptedTerminal {
    fn size(&self) -> TerminalSize {
        self.size
    }

    async fn next_input(&mut self) -> Option<LocalInput> {
        self.input.recv().await
    }

    async fn write_output(&mut self, data: &[u8]) -> Result<(), TerminalError> {
        let _ = self.output.send(Bytes::copy_from_slice(data));
        Ok(())
    }
}
