//! Record a child-care event locally.

use anyhow::{Context, Result};
use serde_json::Value;
use std::path::Path;
use sync_types::{EntityId, EntityType, Operation};

use super::open_device;

/// Run the log command.
///
/// Never touches the network: the change lands in the local queue and the
/// cache, and goes out with the next sync.
pub async fn run(
    data_dir: &Path,
    entity_type: &str,
    operation: &str,
    id: Option<&str>,
    fields: Option<&str>,
) -> Result<()> {
    let entity_type: EntityType = entity_type.parse()?;
    let operation: Operation = operation.parse()?;

    let entity_id = match (operation, id) {
        (_, Some(id)) => EntityId::new(id),
        (Operation::Create, None) => EntityId::random(),
        (_, None) => anyhow::bail!("--id is required for {}", operation),
    };
    let payload = match (operation, fields) {
        (Operation::Delete, _) => Value::Null,
        (_, Some(raw)) => serde_json::from_str(raw).context("Fields must be a JSON object")?,
        (_, None) => anyhow::bail!("Fields are required for {}", operation),
    };

    let client = open_device(data_dir).await?;
    let queued = client
        .enqueue(entity_type, entity_id, operation, payload)
        .await?;

    println!(
        "Queued {} of {} {} (mutation {})",
        queued.event.operation, queued.event.entity_type, queued.event.entity_id, queued.event.id
    );
    Ok(())
}
