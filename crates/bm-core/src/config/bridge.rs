//! bridgeme configuration

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::duration_secs;
use crate::error::ConfigError;

/// Top-level configuration shared by `host`, `connect`, `status` and `close`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub relay: RelayConfig,
    pub ports: PortRange,
    pub tunnel: TunnelConfig,
    pub session: SessionConfig,
    pub retry: RetryConfig,
    pub shell: ShellConfig,
    pub control: ControlConfig,
}

impl BridgeConfig {
    /// Reject values that would make the lifecycle misbehave
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ports.start == 0 || self.ports.start > self.ports.end {
            return Err(ConfigError::Invalid(format!(
                "port range {}-{} is empty or starts at 0",
                self.ports.start, self.ports.end
            )));
        }
        if self.ports.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "ports.max_attempts must be at least 1".into(),
            ));
        }
        if self.tunnel.heartbeat_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "tunnel.heartbeat_interval must be non-zero".into(),
            ));
        }
        if self.tunnel.heartbeat_timeout <= self.tunnel.heartbeat_interval {
            return Err(ConfigError::Invalid(
                "tunnel.heartbeat_timeout must exceed heartbeat_interval".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.backoff.jitter) {
            return Err(ConfigError::Invalid(
                "retry.backoff.jitter must be between 0.0 and 1.0".into(),
            ));
        }
        Ok(())
    }
}

/// How to reach and authenticate to the relay
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Login name used when the destination carries no `user@`
    pub username: String,

    /// Private keys to offer, in order. Empty means the usual keys in `~/.ssh`.
    pub identity_files: Vec<PathBuf>,

    /// Pinned relay host key fingerprint (`SHA256:...`). When unset the
    /// user's `known_hosts` is consulted instead.
    pub host_key_fingerprint: Option<String>,

    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Address the relay binds reverse forwards on and the client dials
    pub bind_address: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            username: whoami::username(),
            identity_files: Vec::new(),
            host_key_fingerprint: None,
            connect_timeout: Duration::from_secs(30),
            bind_address: "localhost".to_string(),
        }
    }
}

impl RelayConfig {
    /// Keys to try, expanding the default list when none are configured
    pub fn identity_candidates(&self) -> Vec<PathBuf> {
        if !self.identity_files.is_empty() {
            return self.identity_files.clone();
        }
        let Some(ssh_dir) = dirs::home_dir().map(|h| h.join(".ssh")) else {
            return Vec::new();
        };
        ["id_ed25519", "id_ecdsa", "id_rsa"]
            .iter()
            .map(|name| ssh_dir.join(name))
            .filter(|path| path.exists())
            .collect()
    }
}

/// Relay-side port range sessions are allocated from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortRange {
    pub start: u16,
    /// Inclusive
    pub end: u16,
    /// Random draws before giving up with `PortAllocationFailed`
    pub max_attempts: u32,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 10000,
            end: 65000,
            max_attempts: 100,
        }
    }
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    /// Number of ports in the range
    pub fn len(&self) -> usize {
        if self.start > self.end {
            0
        } else {
            (self.end - self.start) as usize + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Tunnel channel liveness
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,

    /// Silence after which the peer is considered gone
    #[serde(with = "duration_secs")]
    pub heartbeat_timeout: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(15),
        }
    }
}

/// Session lifecycle timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long a `Disconnected` session waits for its peer to come back
    #[serde(with = "duration_secs")]
    pub reconnect_grace: Duration,

    /// How long a `Closed` session stays visible in `status`
    #[serde(with = "duration_secs")]
    pub closed_retention: Duration,

    /// Upper bound on a driver's teardown before the reaper forces `Closed`
    #[serde(with = "duration_secs")]
    pub closing_timeout: Duration,

    #[serde(with = "duration_secs")]
    pub reap_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect_grace: Duration::from_secs(30),
            closed_retention: Duration::from_secs(60),
            closing_timeout: Duration::from_secs(10),
            reap_interval: Duration::from_secs(5),
        }
    }
}

/// Retry policy for relay connectivity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Connection attempts before surfacing `RelayUnreachable`
    pub max_attempts: u32,
    pub backoff: BackoffConfig,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Exponential backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    #[serde(with = "duration_secs")]
    pub initial: Duration,

    #[serde(with = "duration_secs")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

/// Host-side shell selection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    /// Explicit shell program; detected when unset
    pub program: Option<String>,
    /// Extra environment for the spawned shell
    pub env: HashMap<String, String>,
}

/// Loopback control endpoint used by `status` and `close`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 22240,
        }
    }
}

impl ControlConfig {
    /// Loopback address of the endpoint
    pub fn address(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }
}
