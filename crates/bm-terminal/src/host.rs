//! Host-side shell adapters
//!
//! A [`ShellAdapter`] owns one running shell. Output is delivered through a
//! channel fed by a blocking reader thread, so the orchestrator can select on
//! it next to tunnel traffic. Input goes the other way through a writer
//! thread, so a shell that stops reading never blocks the runtime. The adapter
//! is selected once per session:
//!
//! - [`PowerShellAdapter`]: pwsh/powershell on a pseudo-terminal
//! - [`PosixShellAdapter`]: bash/zsh/sh and unknown shells on a pseudo-terminal
//! - [`FallbackPipeAdapter`]: any shell over stdin/stdout pipes

use std::io::{Read, Write};
use std::process::{Child, Command, Stdio};

use bm_core::{ShellKind, TerminalError};
use bm_protocol::TerminalSize;
use bytes::Bytes;
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::shell::{detect_shell, AdapterKind, ShellSpec};

/// Buffered output chunks before the reader thread blocks
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Queued input chunks before [`ShellAdapter::write`] starts refusing input
const INPUT_CHANNEL_CAPACITY: usize = 256;

const READ_BUFFER_SIZE: usize = 4096;

/// A running interactive shell
pub trait ShellAdapter: Send {
    fn kind(&self) -> ShellKind;

    /// OS process id of the shell, if known
    fn pid(&self) -> Option<u32>;

    /// Queue bytes for the shell's input. Never blocks; fails once the
    /// shell's input is closed or too far behind.
    fn write(&mut self, data: &[u8]) -> Result<(), TerminalError>;

    /// Apply a new window size. Adapters without a window record it only.
    fn resize(&mut self, size: TerminalSize) -> Result<(), TerminalError>;

    /// Current window size
    fn size(&self) -> TerminalSize;

    /// Take the output stream. Yields `None` after the first call.
    ///
    /// The stream ends when the shell closes its output.
    fn take_output(&mut self) -> Option<mpsc::Receiver<Bytes>>;

    /// Exit code if the shell has exited
    fn try_wait(&mut self) -> Result<Option<i32>, TerminalError>;

    /// Kill the shell and stop its reader. Idempotent.
    fn terminate(&mut self);
}

/// Starts shells for host sessions
pub trait ShellLauncher: Send + Sync {
    /// Resolve the shell a new session will run
    fn detect(&self) -> Result<ShellSpec, TerminalError>;

    /// Start the shell described by `spec`
    fn launch(
        &self,
        spec: &ShellSpec,
        size: TerminalSize,
    ) -> Result<Box<dyn ShellAdapter>, TerminalError>;
}

/// Launches real shells on this machine
#[derive(Debug, Clone, Default)]
pub struct NativeShellLauncher {
    preferred: Option<String>,
    env: Vec<(String, String)>,
}

impl NativeShellLauncher {
    pub fn new(preferred: Option<String>, env: Vec<(String, String)>) -> Self {
        Self { preferred, env }
    }
}

impl ShellLauncher for NativeShellLauncher {
    fn detect(&self) -> Result<ShellSpec, TerminalError> {
        Ok(detect_shell(self.preferred.as_deref())?.with_env(self.env.clone()))
    }

    /// Pseudo-terminal adapters degrade to pipes before giving up.
    fn launch(
        &self,
        spec: &ShellSpec,
        size: TerminalSize,
    ) -> Result<Box<dyn ShellAdapter>, TerminalError> {
        let attempt: Result<Box<dyn ShellAdapter>, TerminalError> = match spec.adapter {
            AdapterKind::PowerShell => PowerShellAdapter::spawn(spec, size)
                .map(|a| Box::new(a) as Box<dyn ShellAdapter>),
            AdapterKind::Posix => {
                PosixShellAdapter::spawn(spec, size).map(|a| Box::new(a) as Box<dyn ShellAdapter>)
            }
            AdapterKind::Pipe => return Ok(Box::new(FallbackPipeAdapter::spawn(spec, size)?)),
        };

        match attempt {
            Ok(adapter) => Ok(adapter),
            Err(e) => {
                tracing::warn!("Pseudo-terminal shell failed ({}), falling back to pipes", e);
                let pipe = spec.clone().into_pipe();
                FallbackPipeAdapter::spawn(&pipe, size)
                    .map(|a| Box::new(a) as Box<dyn ShellAdapter>)
                    .map_err(|fallback| {
                        TerminalError::ShellUnavailable(format!(
                            "{} (pipe fallback: {})",
                            e, fallback
                        ))
                    })
            }
        }
    }
}

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn unavailable(what: &str, e: impl std::fmt::Display) -> TerminalError {
    TerminalError::ShellUnavailable(format!("{}: {}", what, e))
}

/// Shell on a pseudo-terminal; shared by the PowerShell and POSIX adapters
struct PtyShell {
    kind: ShellKind,
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn portable_pty::Child + Send + Sync>,
    input: Option<mpsc::Sender<Bytes>>,
    output: Option<mpsc::Receiver<Bytes>>,
    size: TerminalSize,
    cancel: CancellationToken,
    terminated: bool,
}

impl PtyShell {
    fn spawn(
        spec: &ShellSpec,
        size: TerminalSize,
        extra_env: &[(&str, &str)],
    ) -> Result<Self, TerminalError> {
        tracing::info!("Spawning {} on a pseudo-terminal ({})", spec.program, size);

        let pair = native_pty_system()
            .openpty(pty_size(size))
            .map_err(|e| unavailable("failed to open pseudo-terminal", e))?;

        let mut cmd = CommandBuilder::new(&spec.program);
        cmd.args(&spec.args);
        for (key, value) in extra_env {
            cmd.env(key, value);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        if let Ok(cwd) = std::env::current_dir() {
            cmd.cwd(cwd);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| unavailable(&format!("failed to spawn {}", spec.program), e))?;
        // Only the child may hold the slave side, or the reader never sees EOF.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| unavailable("failed to clone pseudo-terminal reader", e))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| unavailable("failed to take pseudo-terminal writer", e))?;

        tracing::info!("Spawned shell process with PID: {:?}", child.process_id());

        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        spawn_output_reader("pty", reader, tx, cancel.clone());
        let input = spawn_input_writer("pty", writer);

        Ok(Self {
            kind: spec.kind,
            master: pair.master,
            child,
            input,
            output: Some(rx),
            size,
            cancel,
            terminated: false,
        })
    }

    fn write(&mut self, data: &[u8]) -> Result<(), TerminalError> {
        queue_input(self.input.as_ref(), data)
    }

    fn resize(&mut self, size: TerminalSize) -> Result<(), TerminalError> {
        tracing::debug!("Resizing pseudo-terminal to {}", size);
        self.master
            .resize(pty_size(size))
            .map_err(|e| TerminalError::TerminalModeError(format!("resize failed: {}", e)))?;
        self.size = size;
        Ok(())
    }

    fn size(&self) -> TerminalSize {
        match self.master.get_size() {
            Ok(s) => TerminalSize::new(s.rows, s.cols),
            Err(_) => self.size,
        }
    }

    fn try_wait(&mut self) -> Result<Option<i32>, TerminalError> {
        Ok(self.child.try_wait()?.map(|status| status.exit_code() as i32))
    }

    fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        self.cancel.cancel();
        self.input.take();
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
        }
        match self.child.wait() {
            Ok(status) => tracing::info!("Shell exited with code {}", status.exit_code()),
            Err(e) => tracing::debug!("Failed to reap shell: {}", e),
        }
    }
}

impl Drop for PtyShell {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// PowerShell (pwsh or Windows PowerShell) on a pseudo-terminal
pub struct PowerShellAdapter {
    inner: PtyShell,
}

impl PowerShellAdapter {
    pub fn spawn(spec: &ShellSpec, size: TerminalSize) -> Result<Self, TerminalError> {
        Ok(Self {
            inner: PtyShell::spawn(spec, size, &[])?,
        })
    }
}

/// POSIX-style shell on a pseudo-terminal
pub struct PosixShellAdapter {
    inner: PtyShell,
}

impl PosixShellAdapter {
    pub fn spawn(spec: &ShellSpec, size: TerminalSize) -> Result<Self, TerminalError> {
        Ok(Self {
            inner: PtyShell::spawn(spec, size, &[("TERM", "xterm-256color")])?,
        })
    }
}

macro_rules! delegate_pty_adapter {
    ($ty:ty) => {
        impl ShellAdapter for $ty {
            fn kind(&self) -> ShellKind {
                self.inner.kind
            }

            fn pid(&self) -> Option<u32> {
                self.inner.child.process_id()
            }

            fn write(&mut self, data: &[u8]) -> Result<(), TerminalError> {
                self.inner.write(data)
            }

            fn resize(&mut self, size: TerminalSize) -> Result<(), TerminalError> {
                self.inner.resize(size)
            }

            fn size(&self) -> TerminalSize {
                self.inner.size()
            }

            fn take_output(&mut self) -> Option<mpsc::Receiver<Bytes>> {
                self.inner.output.take()
            }

            fn try_wait(&mut self) -> Result<Option<i32>, TerminalError> {
                self.inner.try_wait()
            }

            fn terminate(&mut self) {
                self.inner.terminate()
            }
        }
    };
}

delegate_pty_adapter!(PowerShellAdapter);
delegate_pty_adapter!(PosixShellAdapter);

/// Shell over plain pipes, for `cmd` and machines without pseudo-terminals.
///
/// There is no window to size, so [`ShellAdapter::resize`] only records the
/// requested size.
pub struct FallbackPipeAdapter {
    kind: ShellKind,
    child: Child,
    input: Option<mpsc::Sender<Bytes>>,
    output: Option<mpsc::Receiver<Bytes>>,
    size: TerminalSize,
    cancel: CancellationToken,
    terminated: bool,
}

impl FallbackPipeAdapter {
    pub fn spawn(spec: &ShellSpec, size: TerminalSize) -> Result<Self, TerminalError> {
        tracing::info!("Spawning {} over pipes", spec.program);

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| unavailable(&format!("failed to spawn {}", spec.program), e))?;

        let input = child
            .stdin
            .take()
            .and_then(|stdin| spawn_input_writer("stdin", Box::new(stdin)));
        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        if let Some(stdout) = child.stdout.take() {
            spawn_output_reader("stdout", Box::new(stdout), tx.clone(), cancel.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_output_reader("stderr", Box::new(stderr), tx, cancel.clone());
        }

        Ok(Self {
            kind: spec.kind,
            child,
            input,
            output: Some(rx),
            size,
            cancel,
            terminated: false,
        })
    }
}

impl ShellAdapter for FallbackPipeAdapter {
    fn kind(&self) -> ShellKind {
        self.kind
    }

    fn pid(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), TerminalError> {
        queue_input(self.input.as_ref(), data)
    }

    fn resize(&mut self, size: TerminalSize) -> Result<(), TerminalError> {
        tracing::debug!("Pipe-attached shell cannot be resized; recording {}", size);
        self.size = size;
        Ok(())
    }

    fn size(&self) -> TerminalSize {
        self.size
    }

    fn take_output(&mut self) -> Option<mpsc::Receiver<Bytes>> {
        self.output.take()
    }

    fn try_wait(&mut self) -> Result<Option<i32>, TerminalError> {
        Ok(self
            .child
            .try_wait()?
            .map(|status| status.code().unwrap_or(-1)))
    }

    fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        self.cancel.cancel();
        self.input.take();
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
        }
        match self.child.wait() {
            Ok(status) => tracing::info!("Shell exited with {}", status),
            Err(e) => tracing::debug!("Failed to reap shell: {}", e),
        }
    }
}

impl Drop for FallbackPipeAdapter {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn queue_input(input: Option<&mpsc::Sender<Bytes>>, data: &[u8]) -> Result<(), TerminalError> {
    let input =
        input.ok_or_else(|| input_error(std::io::ErrorKind::BrokenPipe, "shell input closed"))?;
    input
        .try_send(Bytes::copy_from_slice(data))
        .map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                input_error(std::io::ErrorKind::WouldBlock, "shell is not reading its input")
            }
            mpsc::error::TrySendError::Closed(_) => {
                input_error(std::io::ErrorKind::BrokenPipe, "shell input closed")
            }
        })
}

fn input_error(kind: std::io::ErrorKind, msg: &str) -> TerminalError {
    TerminalError::Io(std::io::Error::new(kind, msg.to_string()))
}

/// Write queued input to the shell on a dedicated thread.
///
/// The thread ends when the sender is dropped or a write fails.
fn spawn_input_writer(
    label: &'static str,
    mut writer: Box<dyn Write + Send>,
) -> Option<mpsc::Sender<Bytes>> {
    let (tx, mut rx) = mpsc::channel::<Bytes>(INPUT_CHANNEL_CAPACITY);
    let spawned = std::thread::Builder::new()
        .name(format!("bridgeme-{}-writer", label))
        .spawn(move || {
            while let Some(chunk) = rx.blocking_recv() {
                if let Err(e) = writer.write_all(&chunk).and_then(|()| writer.flush()) {
                    tracing::debug!("{} writer closed: {}", label, e);
                    break;
                }
            }
        });
    match spawned {
        Ok(_) => Some(tx),
        Err(e) => {
            tracing::error!("Failed to start {} writer thread: {}", label, e);
            None
        }
    }
}

/// Read shell output on a dedicated thread and forward it as chunks.
///
/// A plain thread rather than the blocking pool: a read parked in the kernel
/// must not hold up runtime shutdown. The token is checked between reads.
fn spawn_output_reader(
    label: &'static str,
    mut reader: Box<dyn Read + Send>,
    tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
) {
    let spawned = std::thread::Builder::new()
        .name(format!("bridgeme-{}-reader", label))
        .spawn(move || {
            let mut buf = [0u8; READ_BUFFER_SIZE];
            loop {
                if cancel.is_cancelled() {
                    tracing::debug!("{} reader cancelled", label);
                    break;
                }
                match reader.read(&mut buf) {
                    Ok(0) => {
                        tracing::debug!("{} reader EOF", label);
                        break;
                    }
                    Ok(n) => {
                        if tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                            tracing::debug!("{} output channel closed", label);
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        // EIO is how Linux reports a pseudo-terminal whose shell exited
                        tracing::debug!("{} reader closed: {}", label, e);
                        break;
                    }
                }
            }
        });
    if let Err(e) = spawned {
        tracing::error!("Failed to start {} reader thread: {}", label, e);
    }
}
