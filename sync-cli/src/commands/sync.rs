//! Run one full sync cycle.

use anyhow::Result;
use std::path::Path;
use sync_client::ClientError;

use super::open_device;

/// Run the sync command.
///
/// An unreachable server is not an error here: changes stay queued and the
/// command says so.
pub async fn run(data_dir: &Path) -> Result<()> {
    let client = open_device(data_dir).await?;
    client.set_online(true).await;

    match client.sync().await {
        Ok(report) => {
            let status = client.status().await?;
            println!("Synced.");
            println!();
            println!(
                "  Pushed:  {} acked, {} rebased, {} conflicts, {} rejected",
                report.push.acked, report.push.rebased, report.push.conflicts, report.push.rejected
            );
            println!(
                "  Pulled:  {} applied (cursor {})",
                report.pull.applied, report.pull.cursor
            );
            if report.expired > 0 {
                println!("  Expired: {} (run 'carelog retry --list')", report.expired);
            }
            println!("  Queued:  {}", status.pending + status.stalled);
            Ok(())
        }
        Err(ClientError::Transport(e)) if e.is_transient() => {
            let status = client.status().await?;
            println!("Server unreachable ({}).", e);
            println!("{} changes stay queued for the next sync.", status.pending);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
