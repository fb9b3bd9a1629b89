//! Configuration loading for the sync server.
//!
//! Configuration is loaded from a TOML file (default: `server.toml`).
//! Every section and key is optional.
//!
//! ```toml
//! [server]
//! bind_address = "0.0.0.0:8080"
//!
//! [storage]
//! database = "/var/lib/carelog/sync.db"
//!
//! [[auth.tokens]]
//! token = "..."
//! user_id = "alice"
//! family_id = "smith"
//! ```

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use sync_types::{FamilyId, UserId};

/// Root configuration for the sync server.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Storage and request size limits.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Notification hub configuration.
    #[serde(default)]
    pub hub: HubConfig,
    /// Bearer tokens accepted by the API.
    #[serde(default)]
    pub auth: AuthConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the HTTP listener (default: 0.0.0.0:8080).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Timeout for push, pull and status requests (default: 30).
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database file.
    #[serde(default = "default_database_path")]
    pub database: PathBuf,
    /// Maximum encoded size of one event payload (default: 64 KiB).
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    /// Maximum events per push request (default: 100).
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Maximum entries per pull page (default: 1000).
    #[serde(default = "default_max_pull_limit")]
    pub max_pull_limit: u32,
}

/// Notification hub configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    /// Outbound frames buffered per session before drops (default: 32).
    #[serde(default = "default_session_buffer")]
    pub session_buffer: usize,
    /// Interval between keep-alive comments on a stream (default: 15).
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Maximum live sessions across all families (default: 10000).
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

/// Static bearer tokens standing in for the identity provider.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Accepted tokens.
    #[serde(default)]
    pub tokens: Vec<TokenEntry>,
}

/// One accepted bearer token and the identity it maps to.
#[derive(Clone, Deserialize)]
pub struct TokenEntry {
    /// Token value.
    pub token: String,
    /// Verified user.
    pub user_id: UserId,
    /// Family the user belongs to.
    pub family_id: FamilyId,
}

impl std::fmt::Debug for TokenEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenEntry")
            .field("token", &"<redacted>")
            .field("user_id", &self.user_id)
            .field("family_id", &self.family_id)
            .finish()
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_database_path() -> PathBuf {
    PathBuf::from("sync.db")
}

fn default_max_payload_bytes() -> usize {
    64 * 1024
}

fn default_max_batch_size() -> usize {
    100
}

fn default_max_pull_limit() -> u32 {
    1000
}

fn default_session_buffer() -> usize {
    32
}

fn default_keep_alive_secs() -> u64 {
    15
}

fn default_max_sessions() -> usize {
    10_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database_path(),
            max_payload_bytes: default_max_payload_bytes(),
            max_batch_size: default_max_batch_size(),
            max_pull_limit: default_max_pull_limit(),
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            session_buffer: default_session_buffer(),
            keep_alive_secs: default_keep_alive_secs(),
            max_sessions: default_max_sessions(),
        }
    }
}

impl ServerConfig {
    /// Request timeout as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl HubConfig {
    /// Keep-alive interval as a [`Duration`].
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs.max(1))
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert_eq!(config.server.bind_address, "0.0.0.0:8080");
        assert_eq!(config.storage.max_payload_bytes, 64 * 1024);
        assert_eq!(config.storage.max_batch_size, 100);
        assert_eq!(config.hub.session_buffer, 32);
        assert!(config.auth.tokens.is_empty());
    }

    #[test]
    fn config_from_toml_string() {
        let toml = r#"
[server]
bind_address = "127.0.0.1:5000"
request_timeout_secs = 5

[storage]
database = "/data/sync.db"
max_batch_size = 20

[hub]
session_buffer = 4
keep_alive_secs = 30

[[auth.tokens]]
token = "secret-a"
user_id = "alice"
family_id = "smith"

[[auth.tokens]]
token = "secret-b"
user_id = "bob"
family_id = "smith"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.bind_address, "127.0.0.1:5000");
        assert_eq!(config.server.request_timeout(), Duration::from_secs(5));
        assert_eq!(config.storage.database, PathBuf::from("/data/sync.db"));
        assert_eq!(config.storage.max_batch_size, 20);
        assert_eq!(config.hub.session_buffer, 4);
        assert_eq!(config.hub.keep_alive(), Duration::from_secs(30));
        assert_eq!(config.auth.tokens.len(), 2);
        assert_eq!(config.auth.tokens[1].user_id, UserId::new("bob"));
        assert_eq!(config.auth.tokens[1].family_id, FamilyId::new("smith"));
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.storage.max_pull_limit, 1000);
        assert_eq!(config.hub.max_sessions, 10_000);
        assert_eq!(config.server.request_timeout_secs, 30);
    }

    #[test]
    fn token_debug_is_redacted() {
        let entry = TokenEntry {
            token: "hunter2".into(),
            user_id: UserId::new("alice"),
            family_id: FamilyId::new("smith"),
        };
        let debug = format!("{:?}", entry);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("alice"));
    }

    #[test]
    fn missing_file_is_read_error() {
        let result = Config::from_file(std::path::Path::new("/nonexistent/server.toml"));
        assert!(matches!(result, Err(ConfigError::ReadError { .. })));
    }
}
