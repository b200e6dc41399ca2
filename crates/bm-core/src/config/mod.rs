//! Configuration management for bridgeme

mod bridge;
pub mod serde_utils;

pub use bridge::{
    BackoffConfig, BridgeConfig, ControlConfig, PortRange, RelayConfig, RetryConfig,
    SessionConfig, ShellConfig, TunnelConfig,
};

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("bridgeme")
}

/// Get the default configuration file path
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.toml")
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: T = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to a file
pub fn save_config<T: serde::Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConfigError::Invalid(format!("Failed to create config dir: {}", e)))?;
    }

    std::fs::write(path, content)
        .map_err(|e| ConfigError::Invalid(format!("Failed to write config: {}", e)))?;

    Ok(())
}

/// Resolve the effective configuration.
///
/// An explicit path must exist. Without one, the default location is tried
/// and a missing file yields the built-in defaults.
pub fn resolve_config(explicit: Option<&Path>) -> Result<BridgeConfig, ConfigError> {
    let config: BridgeConfig = match explicit {
        Some(path) => load_config(path)?,
        None => match load_config(&default_config_path()) {
            Ok(config) => config,
            Err(ConfigError::NotFound(_)) => BridgeConfig::default(),
            Err(e) => return Err(e),
        },
    };
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = BridgeConfig::default();
        config.session.reconnect_grace = Duration::from_secs(45);
        config.ports = PortRange {
            start: 20000,
            end: 20010,
            max_attempts: 8,
        };
        save_config(&path, &config).unwrap();

        let loaded: BridgeConfig = load_config(&path).unwrap();
        assert_eq!(loaded.session.reconnect_grace, Duration::from_secs(45));
        assert_eq!(loaded.ports.start, 20000);
        assert_eq!(loaded.ports.max_attempts, 8);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_config::<BridgeConfig>(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_resolve_explicit_missing_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = resolve_config(Some(&dir.path().join("absent.toml")));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_resolve_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[ports]\nstart = 5000\nend = 4000\n").unwrap();
        assert!(matches!(
            resolve_config(Some(&path)),
            Err(ConfigError::Invalid(_))
        ));
    }
}
