//! bm-core: core abstractions and configuration for bridgeme
//!
//! Shared types, error taxonomy, configuration and transport traits used
//! by the terminal adapters, the relay orchestrator and the CLI.

pub mod config;
pub mod error;
pub mod ipc;
pub mod time;
pub mod traits;
pub mod types;

pub use error::{BridgeError, ConfigError, ConnectionError, SessionError, TerminalError};
pub use types::{RelayTarget, Role, SessionId, SessionInfo, SessionState, ShellKind};
