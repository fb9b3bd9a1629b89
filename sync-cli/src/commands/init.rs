//! Initialize device identity.

use anyhow::Result;
use std::path::Path;

use crate::config::DeviceConfig;

/// Run the init command.
pub async fn run(data_dir: &Path, name: &str) -> Result<()> {
    if DeviceConfig::exists(data_dir) {
        anyhow::bail!(
            "Device already initialized. Delete {} to reinitialize.",
            data_dir.join("device.json").display()
        );
    }

    let config = DeviceConfig::new(name);
    config.save(data_dir).await?;

    println!("Device initialized successfully!");
    println!();
    println!("  Device ID: {}", config.device_id);
    println!("  Name:      {}", config.device_name);
    println!("  Data dir:  {}", data_dir.display());
    println!();
    println!("Next step:");
    println!("  carelog login --server <url> --token <token>");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn init_creates_device_config() {
        let dir = tempdir().unwrap();
        run(dir.path(), "Test Device").await.unwrap();

        assert!(dir.path().join("device.json").exists());

        let config = DeviceConfig::load(dir.path()).await.unwrap();
        assert_eq!(config.device_name, "Test Device");
    }

    #[tokio::test]
    async fn init_fails_if_already_initialized() {
        let dir = tempdir().unwrap();

        run(dir.path(), "Device 1").await.unwrap();

        let result = run(dir.path(), "Device 2").await;
        assert!(result.is_err());
    }
}
