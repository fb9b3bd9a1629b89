//! Pull committed changes from the server.

use anyhow::Result;
use std::path::Path;

use super::open_device;

/// Run the pull command.
pub async fn run(data_dir: &Path) -> Result<()> {
    let client = open_device(data_dir).await?;
    let before = client.status().await?.cursor;

    println!("Pulling changes after {}...", before);
    let report = client.pull_cycle().await?;

    println!();
    println!("  Applied:    {}", report.applied);
    if report.duplicates > 0 {
        println!("  Duplicates: {}", report.duplicates);
    }
    println!("  Cursor:     {} -> {}", before, report.cursor);
    if let Some(missing) = report.gap {
        println!("  Stopped at a gap: entry {} was missing", missing);
    }

    Ok(())
}
