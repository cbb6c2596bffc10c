//! Configuration system for tarship
//!
//! Supports TOML configuration files with sensible defaults.
//! Configuration is loaded from:
//! - macOS: ~/Library/Application Support/com.tarship.tarship/config.toml
//! - Linux: ~/.config/tarship/config.toml
//! - Windows: %APPDATA%/tarship/tarship/config/config.toml

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::crypto::{parse_digest, DIGEST_SIZE};
use crate::session::RemoteTarget;
use crate::DEFAULT_CHUNK_SIZE;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Pipeline settings
    pub transfer: TransferConfig,
    /// Where `ship`/`unpack`/`send` connect to
    pub remote: RemoteConfig,
    /// Host/server settings
    pub host: HostConfig,
}

/// How progress is shown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressMode {
    Terminal,
    Log,
    None,
}

/// Transfer pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Bytes per shipped chunk
    pub chunk_size: usize,
    /// Create the remote parent directory before shipping
    pub create_remote_parent: bool,
    /// Progress display
    pub progress: ProgressMode,
    /// Minimum time between progress redraws
    pub progress_interval_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            create_remote_parent: true,
            progress: ProgressMode::Terminal,
            progress_interval_ms: 250,
        }
    }
}

impl TransferConfig {
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

/// Remote endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub host: Option<String>,
    pub port: u16,
    pub user: Option<String>,
    /// TLS server name
    pub server_name: String,
    /// Pinned certificate fingerprint (hex)
    pub fingerprint: Option<String>,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: 4433,
            user: None,
            server_name: "localhost".into(),
            fingerprint: None,
            connect_timeout_secs: 10,
            idle_timeout_secs: 120,
        }
    }
}

impl RemoteConfig {
    /// Build a connection target. `host` and `user` override the file.
    pub fn target(
        &self,
        host: Option<&str>,
        user: Option<&str>,
        credential: &str,
    ) -> Result<RemoteTarget, ConfigError> {
        let host = host
            .map(str::to_string)
            .or_else(|| self.host.clone())
            .ok_or(ConfigError::Missing("remote.host"))?;
        let user = user
            .map(str::to_string)
            .or_else(|| self.user.clone())
            .ok_or(ConfigError::Missing("remote.user"))?;

        let fingerprint = match &self.fingerprint {
            Some(hex) => Some(
                parse_digest(hex)
                    .ok_or_else(|| ConfigError::Parse(format!("bad fingerprint: {}", hex)))?,
            ),
            None => None,
        };

        let mut target = RemoteTarget::new(host, self.port, user, credential);
        target.server_name = self.server_name.clone();
        target.fingerprint = fingerprint;
        target.connect_timeout = Duration::from_secs(self.connect_timeout_secs);
        target.idle_timeout = Duration::from_secs(self.idle_timeout_secs);
        Ok(target)
    }
}

/// Host/server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// QUIC port for hosting
    pub port: u16,
    /// Bind address
    pub bind: IpAddr,
    /// Directory served to clients (current directory if unset)
    pub root: Option<PathBuf>,
    /// Concurrent connection limit
    pub max_connections: usize,
    /// Users allowed in, mapped to their credential digest (hex)
    pub users: BTreeMap<String, String>,
    /// Failed logins per IP before lockout kicks in
    pub max_auth_failures: u32,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            port: 4433,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            root: None,
            max_connections: 10,
            users: BTreeMap::new(),
            max_auth_failures: 5,
        }
    }
}

impl HostConfig {
    /// Decode the user table
    pub fn user_digests(&self) -> Result<BTreeMap<String, [u8; DIGEST_SIZE]>, ConfigError> {
        self.users
            .iter()
            .map(|(user, hex)| {
                parse_digest(hex)
                    .map(|digest| (user.clone(), digest))
                    .ok_or_else(|| ConfigError::Parse(format!("bad digest for user {}", user)))
            })
            .collect()
    }
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_from(&path).unwrap_or_else(|e| {
                warn!("Failed to load config from {:?}: {}, using defaults", path, e);
                Self::default()
            }),
            None => {
                debug!("No config directory found, using defaults");
                Self::default()
            }
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))?;

        info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "tarship", "tarship")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Generate a sample configuration file content
    pub fn sample() -> String {
        let mut config = Self::default();
        config.remote.host = Some("files.example.com".into());
        config.remote.user = Some("deploy".into());
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Configuration errors
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// I/O error
    Io(String),
    /// Parse error
    Parse(String),
    /// Serialization error
    Serialize(String),
    /// Required setting absent from both file and command line
    Missing(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "I/O error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Serialize(e) => write!(f, "Serialization error: {}", e),
            ConfigError::Missing(key) => write!(f, "Missing setting: {}", key),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::credential_digest;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.host.port, 4433);
        assert_eq!(config.remote.port, 4433);
        assert_eq!(config.transfer.chunk_size, 10 * 1024 * 1024);
        assert!(config.transfer.create_remote_parent);
    }

    #[test]
    fn test_partial_config() {
        let toml_str = r#"
            [transfer]
            chunk_size = 4096
            progress = "log"

            [remote]
            host = "10.0.0.7"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.transfer.chunk_size, 4096);
        assert_eq!(config.transfer.progress, ProgressMode::Log);
        // Other values should be defaults
        assert_eq!(config.remote.port, 4433);
        assert_eq!(config.host.max_connections, 10);
    }

    #[test]
    fn test_sample_config() {
        let sample = Config::sample();
        assert!(sample.contains("[transfer]"));
        assert!(sample.contains("[remote]"));
        assert!(sample.contains("[host]"));

        let parsed: Config = toml::from_str(&sample).unwrap();
        assert_eq!(parsed.remote.user.as_deref(), Some("deploy"));
    }

    #[test]
    fn test_config_load_missing() {
        let config = Config::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.host.port, 4433);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");

        let mut config = Config::default();
        config
            .host
            .users
            .insert("alice".into(), hex::encode(credential_digest("alice", "pw")));
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        let users = loaded.host.user_digests().unwrap();
        assert_eq!(users["alice"], credential_digest("alice", "pw"));
    }

    #[test]
    fn test_bad_user_digest() {
        let mut host = HostConfig::default();
        host.users.insert("bob".into(), "not-hex".into());
        assert!(matches!(host.user_digests(), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_remote_target_overrides() {
        let remote = RemoteConfig {
            host: Some("a.example".into()),
            user: Some("file-user".into()),
            idle_timeout_secs: 30,
            ..RemoteConfig::default()
        };

        let target = remote.target(None, Some("cli-user"), "pw").unwrap();
        assert_eq!(target.address(), "a.example:4433");
        assert_eq!(target.user, "cli-user");
        assert_eq!(target.idle_timeout, Duration::from_secs(30));

        let empty = RemoteConfig::default();
        assert!(matches!(
            empty.target(None, None, "pw"),
            Err(ConfigError::Missing("remote.host"))
        ));
    }
}
