//! Core domain types

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// Default SSH port of a relay
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Short random session identifier (8 lowercase hex characters)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Length of a generated identifier
    pub const LEN: usize = 8;

    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        let value: u32 = rand::thread_rng().gen();
        Self(format!("{:08x}", value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_ascii_lowercase())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

/// Which end of a bridge this process is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Shares its local shell through a reverse forward on the relay
    Host,
    /// Attaches its local terminal to a host's forwarded port
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Host => write!(f, "host"),
            Role::Client => write!(f, "client"),
        }
    }
}

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// SSH connection or port binding requested, not yet confirmed
    Pending,
    /// Relay confirmed the reverse forward; waiting for a client
    Listening,
    /// Tunnel channel established
    Connected,
    /// Channel lost; waiting for reconnection within the grace period
    Disconnected,
    /// Teardown in progress
    Closing,
    /// Terminal state; port and resources released
    Closed,
}

impl SessionState {
    /// Whether the lifecycle allows moving from `self` to `to` for a session
    /// of the given role.
    pub fn can_transition_to(self, to: SessionState, role: Role) -> bool {
        use SessionState::*;
        match (self, to) {
            (Pending, Listening) => role == Role::Host,
            (Pending, Connected) => role == Role::Client,
            (Listening, Connected) => role == Role::Host,
            (Connected, Disconnected) => true,
            (Disconnected, Listening) => role == Role::Host,
            (Disconnected, Pending) => role == Role::Client,
            (Closing, Closed) => true,
            (from, Closing) => !matches!(from, Closing | Closed),
            _ => false,
        }
    }

    /// Closing or Closed
    pub fn is_terminating(self) -> bool {
        matches!(self, SessionState::Closing | SessionState::Closed)
    }

    pub fn is_closed(self) -> bool {
        self == SessionState::Closed
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Pending => "pending",
            SessionState::Listening => "listening",
            SessionState::Connected => "connected",
            SessionState::Disconnected => "disconnected",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Kind of interactive shell a host session runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShellKind {
    PowerShell,
    Cmd,
    Bash,
    Zsh,
    Sh,
    Other,
}

impl ShellKind {
    /// Classify a shell by its program path or name
    pub fn from_program(program: &str) -> Self {
        let name = program
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(program)
            .to_ascii_lowercase();
        let name = name.strip_suffix(".exe").unwrap_or(&name);
        match name {
            "pwsh" | "powershell" => ShellKind::PowerShell,
            "cmd" => ShellKind::Cmd,
            "bash" => ShellKind::Bash,
            "zsh" => ShellKind::Zsh,
            "sh" | "dash" | "ash" => ShellKind::Sh,
            _ => ShellKind::Other,
        }
    }

    /// Whether this shell is a POSIX-style shell
    pub fn is_posix(self) -> bool {
        matches!(self, ShellKind::Bash | ShellKind::Zsh | ShellKind::Sh)
    }
}

impl fmt::Display for ShellKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ShellKind::PowerShell => "powershell",
            ShellKind::Cmd => "cmd",
            ShellKind::Bash => "bash",
            ShellKind::Zsh => "zsh",
            ShellKind::Sh => "sh",
            ShellKind::Other => "other",
        };
        f.write_str(s)
    }
}

/// SSH relay endpoint in `[user@]host[:port]` form
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelayTarget {
    /// Login name; falls back to the configured username when absent
    pub username: Option<String>,
    pub host: String,
    pub port: u16,
}

impl RelayTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            username: None,
            host: host.into(),
            port,
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// `host:port` of the SSH endpoint
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// String a client passes to `connect` to reach `tunnel_port`.
    ///
    /// The SSH port is included only when it is not the default, so the
    /// common case reads `relay.example.com:41523`.
    pub fn connect_string(&self, tunnel_port: u16) -> String {
        let mut out = String::new();
        if let Some(user) = &self.username {
            out.push_str(user);
            out.push('@');
        }
        out.push_str(&self.host);
        if self.port != DEFAULT_SSH_PORT {
            out.push_str(&format!(":{}", self.port));
        }
        out.push_str(&format!(":{}", tunnel_port));
        out
    }

    /// Parse a client destination `[user@]host[:ssh_port]:tunnel_port`.
    ///
    /// The last `:`-separated component is always the tunnel port.
    pub fn parse_connect_string(input: &str) -> Result<(Self, u16), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidDestination {
            input: input.to_string(),
            reason: reason.to_string(),
        };

        let (relay, port_str) = input
            .rsplit_once(':')
            .ok_or_else(|| invalid("expected RELAY:PORT"))?;
        let tunnel_port: u16 = port_str
            .parse()
            .map_err(|_| invalid("tunnel port is not a number"))?;
        if tunnel_port == 0 {
            return Err(invalid("tunnel port must be non-zero"));
        }
        Ok((relay.parse()?, tunnel_port))
    }
}

impl FromStr for RelayTarget {
    type Err = ConfigError;

    /// Parses `[user@]host[:port]`. A non-numeric port suffix is treated as
    /// part of the host name, matching how `ssh` destinations are read.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::InvalidDestination {
            input: input.to_string(),
            reason: reason.to_string(),
        };

        let (username, rest) = match input.split_once('@') {
            Some((user, rest)) => {
                if user.is_empty() {
                    return Err(invalid("empty username"));
                }
                (Some(user.to_string()), rest)
            }
            None => (None, input),
        };

        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port_str)) => match port_str.parse::<u16>() {
                Ok(port) => (host, port),
                Err(_) => (rest, DEFAULT_SSH_PORT),
            },
            None => (rest, DEFAULT_SSH_PORT),
        };

        if host.is_empty() {
            return Err(invalid("empty host"));
        }
        if port == 0 {
            return Err(invalid("port must be non-zero"));
        }

        Ok(Self {
            username,
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for RelayTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(user) = &self.username {
            write!(f, "{}@", user)?;
        }
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Point-in-time view of a session, as reported by `status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: SessionId,
    pub role: Role,
    pub relay: RelayTarget,
    /// Relay-side port of the reverse forward (host) or the port dialed (client)
    pub tunnel_port: u16,
    pub state: SessionState,
    /// Unix millis
    pub created_at: u64,
    /// Unix millis of the last state change or tunnel traffic
    pub last_activity_at: u64,
    pub shell: Option<ShellKind>,
    /// Why the session last failed or closed
    pub reason: Option<String>,
    /// Times the session came back from `Disconnected`
    pub reconnects: u32,
}

impl SessionInfo {
    /// Connect string a client would use for this session
    pub fn connect_string(&self) -> String {
        self.relay.connect_string(self.tunnel_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;

    #[test]
    fn test_session_id_format() {
        let id = SessionId::generate();
        assert_eq!(id.as_str().len(), SessionId::LEN);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_session_id_from_user_input_is_lowercased() {
        assert_eq!(SessionId::from("A1B2C3D4").as_str(), "a1b2c3d4");
    }

    #[test]
    fn test_host_transitions() {
        let r = Role::Host;
        assert!(Pending.can_transition_to(Listening, r));
        assert!(!Pending.can_transition_to(Connected, r));
        assert!(Listening.can_transition_to(Connected, r));
        assert!(Connected.can_transition_to(Disconnected, r));
        assert!(Disconnected.can_transition_to(Listening, r));
        assert!(!Disconnected.can_transition_to(Pending, r));
    }

    #[test]
    fn test_client_transitions() {
        let r = Role::Client;
        assert!(Pending.can_transition_to(Connected, r));
        assert!(!Pending.can_transition_to(Listening, r));
        assert!(Disconnected.can_transition_to(Pending, r));
        assert!(!Disconnected.can_transition_to(Listening, r));
    }

    #[test]
    fn test_closing_edges() {
        for from in [Pending, Listening, Connected, Disconnected] {
            assert!(from.can_transition_to(Closing, Role::Host));
            assert!(!from.can_transition_to(Closed, Role::Host));
        }
        assert!(Closing.can_transition_to(Closed, Role::Client));
        assert!(!Closing.can_transition_to(Closing, Role::Client));
        assert!(!Closed.can_transition_to(Closing, Role::Client));
        assert!(!Closed.can_transition_to(Pending, Role::Client));
    }

    #[test]
    fn test_shell_kind_from_program() {
        assert_eq!(ShellKind::from_program("/bin/bash"), ShellKind::Bash);
        assert_eq!(ShellKind::from_program("/usr/bin/zsh"), ShellKind::Zsh);
        assert_eq!(ShellKind::from_program("/bin/dash"), ShellKind::Sh);
        assert_eq!(
            ShellKind::from_program(r"C:\Program Files\PowerShell\7\pwsh.exe"),
            ShellKind::PowerShell
        );
        assert_eq!(ShellKind::from_program("CMD.EXE"), ShellKind::Cmd);
        assert_eq!(ShellKind::from_program("/usr/bin/fish"), ShellKind::Other);
    }

    #[test]
    fn test_relay_target_parse() {
        let t: RelayTarget = "relay.test".parse().unwrap();
        assert_eq!(t, RelayTarget::new("relay.test", 22));

        let t: RelayTarget = "alice@relay.test:2200".parse().unwrap();
        assert_eq!(t.username.as_deref(), Some("alice"));
        assert_eq!(t.port, 2200);

        // Non-numeric suffix belongs to the host
        let t: RelayTarget = "relay.test:ssh".parse().unwrap();
        assert_eq!(t.host, "relay.test:ssh");
        assert_eq!(t.port, 22);
    }

    #[test]
    fn test_relay_target_parse_rejects_empty_parts() {
        assert!("".parse::<RelayTarget>().is_err());
        assert!("@relay.test".parse::<RelayTarget>().is_err());
        assert!("relay.test:0".parse::<RelayTarget>().is_err());
        assert!(":22".parse::<RelayTarget>().is_err());
    }

    #[test]
    fn test_connect_string() {
        let relay = RelayTarget::new("relay.test", 22);
        assert_eq!(relay.connect_string(41523), "relay.test:41523");

        let relay = RelayTarget::new("relay.test", 2200).with_username("bob");
        assert_eq!(relay.connect_string(41523), "bob@relay.test:2200:41523");
    }

    #[test]
    fn test_parse_connect_string() {
        let (relay, port) = RelayTarget::parse_connect_string("relay.test:41523").unwrap();
        assert_eq!(relay, RelayTarget::new("relay.test", 22));
        assert_eq!(port, 41523);

        let (relay, port) =
            RelayTarget::parse_connect_string("bob@relay.test:2200:41523").unwrap();
        assert_eq!(relay.port, 2200);
        assert_eq!(relay.username.as_deref(), Some("bob"));
        assert_eq!(port, 41523);

        assert!(RelayTarget::parse_connect_string("relay.test").is_err());
        assert!(RelayTarget::parse_connect_string("relay.test:abc").is_err());
        assert!(RelayTarget::parse_connect_string("relay.test:0").is_err());
    }
}
