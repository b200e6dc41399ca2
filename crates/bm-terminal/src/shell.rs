//! Shell detection
//!
//! Resolves which shell a host session runs and which adapter drives it.
//! Resolution happens once, when the session is created.

use std::path::{Path, PathBuf};

use bm_core::{ShellKind, TerminalError};
use portable_pty::{native_pty_system, PtySize};

/// How a shell is attached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterKind {
    /// PowerShell on a pseudo-terminal
    PowerShell,
    /// POSIX-style shell on a pseudo-terminal
    Posix,
    /// Plain stdin/stdout pipes, no window size
    Pipe,
}

/// Fully resolved shell to launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellSpec {
    pub kind: ShellKind,
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub adapter: AdapterKind,
}

impl ShellSpec {
    /// Build a spec for `program`, deriving kind, arguments and adapter.
    pub fn for_program(program: impl Into<String>, pty_available: bool) -> Self {
        let program = program.into();
        let kind = ShellKind::from_program(&program);
        Self {
            kind,
            args: default_args(kind),
            env: Vec::new(),
            adapter: select_adapter(kind, pty_available),
            program,
        }
    }

    pub fn with_env(mut self, env: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env.extend(env);
        self
    }

    /// Same shell, attached over pipes
    pub fn into_pipe(mut self) -> Self {
        self.adapter = AdapterKind::Pipe;
        self
    }
}

/// Arguments each shell kind is started with
pub fn default_args(kind: ShellKind) -> Vec<String> {
    let args: &[&str] = match kind {
        ShellKind::PowerShell => &["-NoLogo", "-NoProfile"],
        ShellKind::Cmd => &["/Q"],
        ShellKind::Bash | ShellKind::Zsh | ShellKind::Sh => &["-i"],
        ShellKind::Other => &[],
    };
    args.iter().map(|s| s.to_string()).collect()
}

/// Pick the adapter for a shell kind.
///
/// `cmd` always runs over pipes; everything else prefers a pseudo-terminal.
pub fn select_adapter(kind: ShellKind, pty_available: bool) -> AdapterKind {
    match (kind, pty_available) {
        (_, false) | (ShellKind::Cmd, _) => AdapterKind::Pipe,
        (ShellKind::PowerShell, true) => AdapterKind::PowerShell,
        (_, true) => AdapterKind::Posix,
    }
}

/// Check whether this machine can allocate a pseudo-terminal at all
pub fn pty_available() -> bool {
    let result = native_pty_system().openpty(PtySize {
        rows: 24,
        cols: 80,
        pixel_width: 0,
        pixel_height: 0,
    });
    match result {
        Ok(_) => true,
        Err(e) => {
            tracing::warn!("Pseudo-terminal unavailable, using pipes: {}", e);
            false
        }
    }
}

/// Resolve the shell for a new host session.
///
/// Order: `preferred`, then on Windows pwsh, powershell, cmd; elsewhere
/// `$SHELL`, bash, zsh, sh.
pub fn detect_shell(preferred: Option<&str>) -> Result<ShellSpec, TerminalError> {
    let pty = pty_available();

    if let Some(program) = preferred {
        return match resolve_program(program) {
            Some(path) => Ok(ShellSpec::for_program(path.to_string_lossy(), pty)),
            None => Err(TerminalError::ShellUnavailable(format!(
                "configured shell '{}' not found",
                program
            ))),
        };
    }

    let mut candidates: Vec<String> = Vec::new();
    if cfg!(windows) {
        candidates.extend(["pwsh.exe", "powershell.exe", "cmd.exe"].map(String::from));
    } else {
        if let Ok(shell) = std::env::var("SHELL") {
            if !shell.is_empty() {
                candidates.push(shell);
            }
        }
        candidates.extend(["bash", "zsh", "sh"].map(String::from));
    }

    for candidate in &candidates {
        if let Some(path) = resolve_program(candidate) {
            let spec = ShellSpec::for_program(path.to_string_lossy(), pty);
            tracing::debug!(shell = %spec.program, kind = %spec.kind, adapter = ?spec.adapter, "Detected shell");
            return Ok(spec);
        }
    }

    Err(TerminalError::ShellUnavailable(format!(
        "none of {:?} found",
        candidates
    )))
}

/// Resolve a program name or path to an existing file
pub fn resolve_program(program: &str) -> Option<PathBuf> {
    let path = Path::new(program);
    if path.components().count() > 1 || path.is_absolute() {
        return path.is_file().then(|| path.to_path_buf());
    }
    find_in_path(program)
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}
