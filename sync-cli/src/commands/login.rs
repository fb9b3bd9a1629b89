//! Save server credentials.

use anyhow::Result;
use std::path::Path;
use sync_client::{HttpTransport, HttpTransportConfig};

use crate::config::{AccountConfig, DeviceConfig};

/// Run the login command.
///
/// The account is saved even if the server cannot be reached, so a device
/// can be set up offline.
pub async fn run(data_dir: &Path, server_url: &str, token: &str) -> Result<()> {
    DeviceConfig::load(data_dir).await?;

    let mut account = AccountConfig::new(server_url, token);
    let transport = HttpTransport::new(HttpTransportConfig::new(
        account.server_url.as_str(),
        token,
    ))?;

    match transport.status().await {
        Ok(status) => {
            println!("Logged in to {} (family {})", account.server_url, status.family_id);
            account.family_id = Some(status.family_id);
        }
        Err(e) if e.is_auth() => {
            anyhow::bail!("Server rejected the token");
        }
        Err(e) => {
            tracing::warn!("Could not verify token: {}", e);
            println!(
                "Saved account for {} (server unreachable, token not verified)",
                account.server_url
            );
        }
    }

    account.save(data_dir).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::init;
    use tempfile::tempdir;

    #[tokio::test]
    async fn login_requires_init() {
        let dir = tempdir().unwrap();
        assert!(run(dir.path(), "http://127.0.0.1:1", "secret").await.is_err());
    }

    #[tokio::test]
    async fn login_saves_account_when_server_unreachable() {
        let dir = tempdir().unwrap();
        init::run(dir.path(), "Test Device").await.unwrap();

        run(dir.path(), "http://127.0.0.1:1/", "secret").await.unwrap();

        let account = AccountConfig::load(dir.path()).await.unwrap();
        assert_eq!(account.server_url, "http://127.0.0.1:1");
        assert_eq!(account.family_id, None);
    }
}
