//! CLI command implementations.

pub mod init;
pub mod log;
pub mod login;
pub mod pull;
pub mod push;
pub mod retry;
pub mod status;
pub mod sync;
pub mod watch;

use anyhow::{Context, Result};
use std::path::Path;
use sync_client::{
    ClientConfig, HttpTransport, HttpTransportConfig, SqliteLocalStore, SyncClient,
};

use crate::config::{AccountConfig, DeviceConfig, LOCAL_DB};

/// Sync client as the CLI runs it: HTTP transport over the local store.
pub type Device = SyncClient<HttpTransport, SqliteLocalStore>;

/// Open this device's client from the data directory.
pub async fn open_device(data_dir: &Path) -> Result<Device> {
    let device = DeviceConfig::load(data_dir).await?;
    let account = AccountConfig::load(data_dir).await?;

    let transport = HttpTransport::new(HttpTransportConfig::new(
        account.server_url.as_str(),
        account.token.as_str(),
    ))
    .context("Failed to create HTTP transport")?;
    let store = SqliteLocalStore::new(&data_dir.join(LOCAL_DB))
        .await
        .context("Failed to open local store")?;

    SyncClient::open(ClientConfig::new(device.device_id), transport, store)
        .await
        .context("Failed to open sync client")
}

/// Format a millisecond timestamp as a human-readable age.
pub fn format_age(ts_ms: u64) -> String {
    let diff = sync_types::now_millis().saturating_sub(ts_ms) / 1000;

    if diff < 60 {
        "just now".to_string()
    } else if diff < 3600 {
        format!("{} minutes ago", diff / 60)
    } else if diff < 86400 {
        format!("{} hours ago", diff / 3600)
    } else {
        format!("{} days ago", diff / 86400)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::path::Path;

    /// Initialized device logged in to a server nobody listens on.
    pub async fn offline_device(data_dir: &Path) {
        init::run(data_dir, "Test Device").await.unwrap();
        AccountConfig::new("http://127.0.0.1:1", "secret")
            .save(data_dir)
            .await
            .unwrap();
    }
}
