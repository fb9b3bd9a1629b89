//! Show sync status.

use anyhow::Result;
use std::path::Path;

use super::{format_age, open_device};
use crate::config::{AccountConfig, DeviceConfig};

/// Run the status command. Local state only unless `remote` is set.
pub async fn run(data_dir: &Path, remote: bool) -> Result<()> {
    println!("=== carelog status ===");
    println!();

    match DeviceConfig::load(data_dir).await {
        Ok(device) => {
            println!("Device:");
            println!("  ID:   {}", device.device_id);
            println!("  Name: {}", device.device_name);
            println!("  Init: {}", format_age(device.created_at));
        }
        Err(_) => {
            println!("Device: NOT INITIALIZED");
            println!();
            println!("Run 'carelog init --name <name>' to initialize.");
            return Ok(());
        }
    }

    println!();

    match AccountConfig::load(data_dir).await {
        Ok(account) => {
            println!("Account:");
            println!("  Server: {}", account.server_url);
            match &account.family_id {
                Some(family) => println!("  Family: {}", family),
                None => println!("  Family: (not verified)"),
            }
            println!("  Since:  {}", format_age(account.logged_in_at));
        }
        Err(_) => {
            println!("Account: NOT LOGGED IN");
            println!();
            println!("Run 'carelog login --server <url> --token <token>'");
            return Ok(());
        }
    }

    println!();

    let client = open_device(data_dir).await?;
    let status = client.status().await?;

    println!("Queue:");
    println!("  Pending:     {}", status.pending);
    println!("  Stalled:     {}", status.stalled);
    println!("  Dead-letter: {}", status.dead_letter);
    println!("  Issues:      {}", status.issues);
    println!();
    println!("Sync:");
    println!("  Cursor:      {}", status.cursor);
    match status.last_synced_at {
        Some(at) => println!("  Last sync:   {}", format_age(at)),
        None => println!("  Last sync:   never"),
    }
    if let Some(error) = &status.last_error {
        println!("  Last error:  {}", error);
    }

    if remote {
        println!();
        match client.transport().status().await {
            Ok(server) => {
                println!("Server:");
                println!("  Head:        {}", server.head);
                println!("  Behind by:   {}", server.head.value().saturating_sub(status.cursor.value()));
                println!("  Streams:     {}", server.sessions);
            }
            Err(e) => println!("Server: UNREACHABLE ({})", e),
        }
    }

    Ok(())
}
