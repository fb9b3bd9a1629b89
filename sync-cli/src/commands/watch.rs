//! Keep the device in sync until interrupted.

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use sync_client::spawn_driver;
use sync_core::SyncEvent;
use tokio::sync::broadcast::error::RecvError;

use super::open_device;
use crate::config::DeviceConfig;

/// Run the watch command.
///
/// Holds the change stream open and lets the sync driver react to hints,
/// connectivity changes and its own timer. Ctrl-C stops both.
pub async fn run(data_dir: &Path) -> Result<()> {
    let device = DeviceConfig::load(data_dir).await?;
    let client = Arc::new(open_device(data_dir).await?);
    let mut events = client.events();

    let driver = spawn_driver(Arc::clone(&client));
    let listener = client
        .transport()
        .listener(device.device_id, client.config().retry);
    let listener_task = tokio::spawn(listener.run(driver.signals(), driver.shutdown_signal()));

    println!(
        "Watching {} as {} (Ctrl-C to stop)...",
        client.transport().base_url(),
        device.device_name
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!("Skipped {} sync events", skipped);
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    println!();
    println!("Stopping...");
    driver.stop().await;
    if let Err(e) = listener_task.await {
        tracing::error!("Change stream task failed: {}", e);
    }

    let status = client.status().await?;
    println!(
        "Stopped at cursor {} with {} changes queued.",
        status.cursor,
        status.pending + status.stalled
    );
    Ok(())
}

fn print_event(event: &SyncEvent) {
    match event {
        SyncEvent::Online => println!("online"),
        SyncEvent::Offline => println!("offline; changes stay queued"),
        SyncEvent::Synced { pending: 0 } => println!("synced"),
        SyncEvent::Synced { pending } => println!("synced ({} still queued)", pending),
        SyncEvent::SyncFailed { attempt, error } => {
            println!("sync failed (attempt {}): {}", attempt, error)
        }
        SyncEvent::AuthRequired => println!("token rejected; run 'carelog login' again"),
    }
}
