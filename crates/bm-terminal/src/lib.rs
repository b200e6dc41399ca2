//! bm-terminal: terminal adapters for bridgeme
//!
//! The host side runs a local shell and exposes it as a [`ShellAdapter`];
//! the client side attaches the controlling terminal as a [`LocalTerminal`].
//! Both are plain byte pipes as far as the tunnel is concerned.

pub mod host;
pub mod local;
pub mod shell;

pub use host::{
    FallbackPipeAdapter, NativeShellLauncher, PosixShellAdapter, PowerShellAdapter, ShellAdapter,
    ShellLauncher,
};
pub use local::{install_panic_restore, ConsoleTerminal, LocalInput, LocalTerminal, RawModeGuard};
pub use shell::{detect_shell, AdapterKind, ShellSpec};
