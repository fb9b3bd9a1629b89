//! Configuration management for the carelog CLI.
//!
//! Two files live in the data directory, both written 0600:
//! - `device.json`: this device's identity
//! - `account.json`: server URL, bearer token and family

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::Path;
use sync_types::{now_millis, DeviceId, FamilyId};

const DEVICE_FILE: &str = "device.json";
const ACCOUNT_FILE: &str = "account.json";

/// Local event store file inside the data directory.
pub const LOCAL_DB: &str = "local.db";

/// Device configuration stored locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique device identifier.
    pub device_id: DeviceId,
    /// Human-readable device name.
    pub device_name: String,
    /// When the device was initialized, in milliseconds.
    pub created_at: u64,
}

impl DeviceConfig {
    /// Create a new device configuration.
    pub fn new(name: &str) -> Self {
        Self {
            device_id: DeviceId::new(),
            device_name: name.to_string(),
            created_at: now_millis(),
        }
    }

    /// Load device configuration from a directory.
    pub async fn load(data_dir: &Path) -> Result<Self> {
        load_json(&data_dir.join(DEVICE_FILE))
            .await
            .context("Device not initialized. Run 'carelog init' first.")
    }

    /// Save device configuration to a directory.
    pub async fn save(&self, data_dir: &Path) -> Result<()> {
        save_json(&data_dir.join(DEVICE_FILE), self)
            .await
            .context("Failed to save device configuration")
    }

    /// Check if device is initialized.
    pub fn exists(data_dir: &Path) -> bool {
        data_dir.join(DEVICE_FILE).exists()
    }
}

/// Server account stored locally.
#[derive(Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Server base URL.
    pub server_url: String,
    /// Bearer token.
    pub token: String,
    /// Family the token belongs to, as reported by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_id: Option<FamilyId>,
    /// When the account was saved, in milliseconds.
    pub logged_in_at: u64,
}

impl std::fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountConfig")
            .field("server_url", &self.server_url)
            .field("token", &"[REDACTED]")
            .field("family_id", &self.family_id)
            .field("logged_in_at", &self.logged_in_at)
            .finish()
    }
}

impl AccountConfig {
    /// Create a new account configuration.
    pub fn new(server_url: &str, token: &str) -> Self {
        Self {
            server_url: server_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            family_id: None,
            logged_in_at: now_millis(),
        }
    }

    /// Load account configuration from a directory.
    pub async fn load(data_dir: &Path) -> Result<Self> {
        load_json(&data_dir.join(ACCOUNT_FILE))
            .await
            .context("Not logged in. Run 'carelog login' first.")
    }

    /// Save account configuration to a directory.
    pub async fn save(&self, data_dir: &Path) -> Result<()> {
        save_json(&data_dir.join(ACCOUNT_FILE), self)
            .await
            .context("Failed to save account configuration")
    }
}

async fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("Invalid {}", path.display()))
}

async fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let contents = serde_json::to_string_pretty(value)?;
    tokio::fs::write(path, contents).await?;
    set_file_permissions_0600(path).await
}

/// Set file permissions to 0600 (owner read/write only) on Unix.
/// No-op on non-Unix platforms.
async fn set_file_permissions_0600(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .context("Failed to set file permissions")?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

/// Set directory permissions to 0700 (owner only) on Unix.
/// No-op on non-Unix platforms.
pub async fn set_dir_permissions_0700(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
            .await
            .context("Failed to set directory permissions")?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn account_roundtrip_trims_trailing_slash() {
        let dir = tempdir().unwrap();
        let mut account = AccountConfig::new("http://localhost:8080/", "secret");
        account.family_id = Some(FamilyId::new("smith"));
        account.save(dir.path()).await.unwrap();

        let loaded = AccountConfig::load(dir.path()).await.unwrap();
        assert_eq!(loaded.server_url, "http://localhost:8080");
        assert_eq!(loaded.token, "secret");
        assert_eq!(loaded.family_id, Some(FamilyId::new("smith")));
    }

    #[tokio::test]
    async fn missing_account_explains_login() {
        let dir = tempdir().unwrap();
        let err = AccountConfig::load(dir.path()).await.unwrap_err();
        assert!(err.to_string().contains("carelog login"));
    }

    #[test]
    fn account_debug_hides_token() {
        let account = AccountConfig::new("http://localhost:8080", "secret");
        let debug = format!("{account:?}");
        assert!(!debug.contains("secret"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn config_file_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        DeviceConfig::new("Kitchen tablet")
            .save(dir.path())
            .await
            .unwrap();
        AccountConfig::new("http://localhost:8080", "secret")
            .save(dir.path())
            .await
            .unwrap();

        for file in [DEVICE_FILE, ACCOUNT_FILE] {
            let perms = tokio::fs::metadata(dir.path().join(file))
                .await
                .unwrap()
                .permissions();
            assert_eq!(perms.mode() & 0o777, 0o600, "{file} should be 0600");
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn data_dir_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let data_dir = dir.path().join("test-data");
        tokio::fs::create_dir_all(&data_dir).await.unwrap();
        set_dir_permissions_0700(&data_dir).await.unwrap();

        let perms = tokio::fs::metadata(&data_dir).await.unwrap().permissions();
        assert_eq!(perms.mode() & 0o777, 0o700, "dir should be 0700");
    }
}
