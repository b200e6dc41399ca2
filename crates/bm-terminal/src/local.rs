//! Client-side terminal attachment
//!
//! [`ConsoleTerminal`] puts the controlling terminal into raw mode for as long
//! as it lives and turns keyboard and resize events into [`LocalInput`]. If raw
//! mode cannot be entered it degrades to line-buffered stdin.

use std::io::{BufRead, Write};
use std::time::Duration;

use async_trait::async_trait;
use bm_core::TerminalError;
use bm_protocol::TerminalSize;
use bytes::Bytes;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Input produced by the local terminal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalInput {
    /// Bytes to forward to the remote shell
    Data(Bytes),
    /// The local window changed size
    Resize(TerminalSize),
    /// The user asked to end the session (Ctrl+])
    Close,
}

/// The terminal a client session is attached to
#[async_trait]
pub trait LocalTerminal: Send {
    /// Current window size
    fn size(&self) -> TerminalSize;

    /// Next input event; `None` once input is exhausted
    async fn next_input(&mut self) -> Option<LocalInput>;

    /// Write remote output to the screen
    async fn write_output(&mut self, data: &[u8]) -> Result<(), TerminalError>;
}

/// Raw mode for the lifetime of the guard.
///
/// Dropping the guard restores the previous mode on every exit path that
/// unwinds. For `panic = "abort"` builds see [`install_panic_restore`].
#[derive(Debug)]
pub struct RawModeGuard {
    _private: (),
}

impl RawModeGuard {
    pub fn enable() -> Result<Self, TerminalError> {
        enable_raw_mode().map_err(|e| TerminalError::TerminalModeError(e.to_string()))?;
        tracing::debug!("Raw mode enabled");
        Ok(Self { _private: () })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = disable_raw_mode() {
            tracing::warn!("Failed to restore terminal mode: {}", e);
        } else {
            tracing::debug!("Raw mode disabled");
        }
    }
}

/// Restore cooked mode before the default panic message is printed.
///
/// Release builds abort on panic, so guards never get to run their `Drop`.
pub fn install_panic_restore() {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let _ = disable_raw_mode();
        previous(info);
    }));
}

/// The process's controlling terminal
pub struct ConsoleTerminal {
    input: mpsc::Receiver<LocalInput>,
    stop: CancellationToken,
    raw: Option<RawModeGuard>,
}

impl ConsoleTerminal {
    /// Attach to the controlling terminal.
    ///
    /// Falls back to line-buffered input when raw mode is unavailable (for
    /// example when stdin is not a tty).
    pub fn attach() -> Self {
        let (tx, rx) = mpsc::channel(256);
        let stop = CancellationToken::new();

        let raw = match RawModeGuard::enable() {
            Ok(guard) => {
                spawn_event_reader(tx, stop.clone());
                Some(guard)
            }
            Err(e) => {
                tracing::warn!("{}; using line-buffered input", e);
                spawn_line_reader(tx);
                None
            }
        };

        Self {
            input: rx,
            stop,
            raw,
        }
    }

    /// Whether keystrokes are forwarded one by one
    pub fn is_raw(&self) -> bool {
        self.raw.is_some()
    }
}

impl Drop for ConsoleTerminal {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

#[async_trait]
impl LocalTerminal for ConsoleTerminal {
    fn size(&self) -> TerminalSize {
        match crossterm::terminal::size() {
            Ok((cols, rows)) if cols > 0 && rows > 0 => TerminalSize::new(rows, cols),
            _ => TerminalSize::default(),
        }
    }

    async fn next_input(&mut self) -> Option<LocalInput> {
        self.input.recv().await
    }

    async fn write_output(&mut self, data: &[u8]) -> Result<(), TerminalError> {
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(data)?;
        stdout.flush()?;
        Ok(())
    }
}

fn spawn_event_reader(tx: mpsc::Sender<LocalInput>, stop: CancellationToken) {
    let spawned = std::thread::Builder::new()
        .name("bridgeme-console-events".into())
        .spawn(move || {
            while !stop.is_cancelled() {
                match event::poll(EVENT_POLL_INTERVAL) {
                    Ok(false) => continue,
                    Ok(true) => {}
                    Err(e) => {
                        tracing::warn!("Terminal event poll failed: {}", e);
                        break;
                    }
                }
                let input = match event::read() {
                    Ok(evt) => event_to_input(evt),
                    Err(e) => {
                        tracing::warn!("Terminal event read failed: {}", e);
                        break;
                    }
                };
                if let Some(input) = input {
                    if tx.blocking_send(input).is_err() {
                        break;
                    }
                }
            }
        });
    if let Err(e) = spawned {
        tracing::error!("Failed to start terminal event reader: {}", e);
    }
}

fn spawn_line_reader(tx: mpsc::Sender<LocalInput>) {
    let spawned = std::thread::Builder::new()
        .name("bridgeme-console-lines".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            let mut line = String::new();
            loop {
                line.clear();
                match stdin.lock().read_line(&mut line) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        if tx.blocking_send(LocalInput::Data(Bytes::from(line.clone()))).is_err() {
                            break;
                        }
                    }
                }
            }
        });
    if let Err(e) = spawned {
        tracing::error!("Failed to start stdin reader: {}", e);
    }
}

/// Translate a crossterm event into session input
pub fn event_to_input(evt: Event) -> Option<LocalInput> {
    match evt {
        Event::Key(KeyEvent {
            code,
            modifiers,
            kind,
            ..
        }) => {
            if kind == KeyEventKind::Release {
                return None;
            }
            if modifiers.contains(KeyModifiers::CONTROL) && code == KeyCode::Char(']') {
                return Some(LocalInput::Close);
            }
            let data = key_to_bytes(code, modifiers);
            (!data.is_empty()).then(|| LocalInput::Data(Bytes::from(data)))
        }
        Event::Paste(text) => Some(LocalInput::Data(Bytes::from(text))),
        Event::Resize(cols, rows) => Some(LocalInput::Resize(TerminalSize::new(rows, cols))),
        _ => None,
    }
}

/// Convert a key event to the bytes a terminal would send
pub fn key_to_bytes(code: KeyCode, modifiers: KeyModifiers) -> Vec<u8> {
    use KeyCode::*;

    match code {
        Char(c) => {
            if modifiers.contains(KeyModifiers::CONTROL) {
                match c {
                    'a'..='z' | 'A'..='Z' => vec![(c.to_ascii_lowercase() as u8) - b'a' + 1],
                    '[' => vec![0x1b],
                    '\\' => vec![0x1c],
                    '^' => vec![0x1e],
                    '_' => vec![0x1f],
                    ' ' | '@' => vec![0x00],
                    _ => vec![],
                }
            } else if modifiers.contains(KeyModifiers::ALT) {
                let mut out = vec![0x1b];
                out.extend_from_slice(c.to_string().as_bytes());
                out
            } else {
                c.to_string().into_bytes()
            }
        }
        Enter => vec![b'\r'],
        Tab => vec![b'\t'],
        BackTab => vec![0x1b, b'[', b'Z'],
        Backspace => vec![0x7f],
        Esc => vec![0x1b],
        Up => vec![0x1b, b'[', b'A'],
        Down => vec![0x1b, b'[', b'B'],
        Right => vec![0x1b, b'[', b'C'],
        Left => vec![0x1b, b'[', b'D'],
        Home => vec![0x1b, b'[', b'H'],
        End => vec![0x1b, b'[', b'F'],
        PageUp => vec![0x1b, b'[', b'5', b'~'],
        PageDown => vec![0x1b, b'[', b'6', b'~'],
        Delete => vec![0x1b, b'[', b'3', b'~'],
        Insert => vec![0x1b, b'[', b'2', b'~'],
        F(n) => match n {
            1 => vec![0x1b, b'O', b'P'],
            2 => vec![0x1b, b'O', b'Q'],
            3 => vec![0x1b, b'O', b'R'],
            4 => vec![0x1b, b'O', b'S'],
            5 => b"\x1b[15~".to_vec(),
            6 => b"\x1b[17~".to_vec(),
            7 => b"\x1b[18~".to_vec(),
            8 => b"\x1b[19~".to_vec(),
            9 => b"\x1b[20~".to_vec(),
            10 => b"\x1b[21~".to_vec(),
            11 => b"\x1b[23~".to_vec(),
            12 => b"\x1b[24~".to_vec(),
            _ => vec![],
        },
        _ => vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(code: KeyCode, modifiers: KeyModifiers) -> Event {
        Event::Key(KeyEvent::new(code, modifiers))
    }

    #[test]
    fn test_ctrl_bracket_closes() {
        assert_eq!(
            event_to_input(key(KeyCode::Char(']'), KeyModifiers::CONTROL)),
            Some(LocalInput::Close)
        );
    }

    #[test]
    fn test_ctrl_c_is_forwarded() {
        assert_eq!(
            event_to_input(key(KeyCode::Char('c'), KeyModifiers::CONTROL)),
            Some(LocalInput::Data(Bytes::from_static(&[0x03])))
        );
    }

    #[test]
    fn test_resize_event() {
        assert_eq!(
            event_to_input(Event::Resize(120, 40)),
            Some(LocalInput::Resize(TerminalSize::new(40, 120)))
        );
    }

    #[test]
    fn test_key_release_is_ignored() {
        let mut evt = KeyEvent::new(KeyCode::Char('x'), KeyModifiers::NONE);
        evt.kind = KeyEventKind::Release;
        assert_eq!(event_to_input(Event::Key(evt)), None);
    }

    #[test]
    fn test_key_to_bytes() {
        assert_eq!(key_to_bytes(KeyCode::Char('a'), KeyModifiers::NONE), b"a");
        assert_eq!(key_to_bytes(KeyCode::Char('é'), KeyModifiers::NONE), "é".as_bytes());
        assert_eq!(key_to_bytes(KeyCode::Char('x'), KeyModifiers::ALT), b"\x1bx");
        assert_eq!(key_to_bytes(KeyCode::Char('D'), KeyModifiers::CONTROL), vec![0x04]);
        assert_eq!(key_to_bytes(KeyCode::Enter, KeyModifiers::NONE), b"\r");
        assert_eq!(key_to_bytes(KeyCode::Up, KeyModifiers::NONE), b"\x1b[A");
        assert_eq!(key_to_bytes(KeyCode::F(5), KeyModifiers::NONE), b"\x1b[15~");
        assert!(key_to_bytes(KeyCode::F(20), KeyModifiers::NONE).is_empty());
    }
}
