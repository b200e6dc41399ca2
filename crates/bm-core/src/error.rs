//! Core error types for bridgeme

use bm_protocol::ProtocolError;
use std::path::PathBuf;
use thiserror::Error;

use crate::types::{SessionId, SessionState};

/// Top-level error type
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Session error
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Terminal error
    #[error("Terminal error: {0}")]
    Terminal(#[from] TerminalError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Relay connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// The relay refused every offered key. Never retried.
    #[error("Authentication failed for {user}@{host}")]
    AuthenticationFailed { user: String, host: String },

    /// No usable private key could be loaded
    #[error("No usable SSH key: {0}")]
    NoIdentity(String),

    /// Relay could not be reached within the retry budget
    #[error("Relay unreachable after {attempts} attempt(s): {reason}")]
    RelayUnreachable { attempts: u32, reason: String },

    /// Connection lost
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Relay refused to bind the requested remote port
    #[error("Relay rejected port binding on {port}")]
    BindRejected { port: u16 },

    /// Relay refused to open a forwarded channel
    #[error("Channel open failed: {0}")]
    ChannelOpenFailed(String),

    /// Host key verification failed
    #[error("Host key verification failed for {0}")]
    HostKeyRejected(String),
}

impl ConnectionError {
    /// Whether a retry with backoff could plausibly succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConnectionError::RelayUnreachable { .. } | ConnectionError::ConnectionLost(_)
        )
    }
}

/// Session-related errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// Session not found (unknown or already closed)
    #[error("Session not found: {0}")]
    NotFound(SessionId),

    /// No free relay port could be found
    #[error("Port allocation failed after {attempts} attempt(s)")]
    PortAllocationFailed { attempts: u32 },

    /// Port is already held by a live session
    #[error("Port {0} is already in use by another session")]
    PortInUse(u16),

    /// State change that the lifecycle does not allow
    #[error("Session {id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        id: SessionId,
        from: SessionState,
        to: SessionState,
    },

    /// Session is already driven by another task
    #[error("Session {0} is already claimed")]
    AlreadyClaimed(SessionId),

    /// Tunnel channel closed
    #[error("Channel closed: {0}")]
    ChannelClosed(String),
}

/// Terminal adapter errors
#[derive(Error, Debug)]
pub enum TerminalError {
    /// No shell could be spawned
    #[error("Shell unavailable: {0}")]
    ShellUnavailable(String),

    /// Raw mode or terminal size could not be changed
    #[error("Terminal mode change failed: {0}")]
    TerminalModeError(String),

    /// Terminal I/O failed
    #[error("Terminal I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// Relay destination could not be parsed
    #[error("Invalid relay destination '{input}': {reason}")]
    InvalidDestination { input: String, reason: String },

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
