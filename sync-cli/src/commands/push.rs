//! Push queued changes to the server.

use anyhow::Result;
use std::path::Path;

use super::open_device;

/// Run the push command.
pub async fn run(data_dir: &Path) -> Result<()> {
    let client = open_device(data_dir).await?;
    let before = client.status().await?;

    if before.pending == 0 {
        println!("Nothing to push.");
        return Ok(());
    }

    println!("Pushing {} queued changes...", before.pending);
    let report = client.push_cycle().await?;

    println!();
    println!("  Acked:     {}", report.acked);
    println!("  Rebased:   {}", report.rebased);
    println!("  Conflicts: {}", report.conflicts);
    println!("  Rejected:  {}", report.rejected);
    println!("  Retried:   {}", report.retried);
    if report.stalled > 0 {
        println!("  Stalled:   {} (run 'carelog retry')", report.stalled);
    }

    Ok(())
}
