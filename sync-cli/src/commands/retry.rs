//! Resolve stalled, dead-lettered and conflicted changes.

use anyhow::{Context, Result};
use std::path::Path;
use sync_types::MutationId;

use super::{format_age, open_device};

/// What the retry command should do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryAction {
    /// Requeue every stalled and dead-lettered change.
    Requeue,
    /// List recorded issues.
    List,
    /// Drop one queued change.
    Discard(String),
    /// Forget one recorded issue.
    Dismiss(i64),
}

/// Run the retry command.
pub async fn run(data_dir: &Path, action: RetryAction) -> Result<()> {
    let client = open_device(data_dir).await?;

    match action {
        RetryAction::Requeue => {
            let count = client.retry_stalled().await?;
            if count == 0 {
                println!("No stalled changes.");
            } else {
                println!("Requeued {} changes; they go out with the next sync.", count);
            }
        }
        RetryAction::List => {
            let issues = client.conflicts().await?;
            if issues.is_empty() {
                println!("No issues.");
            }
            for issue in issues {
                println!(
                    "[{}] {} {} of {} {} ({})",
                    issue.id,
                    issue.kind.as_str(),
                    issue.operation,
                    issue.entity_type,
                    issue.entity_id,
                    format_age(issue.recorded_at)
                );
                println!("     {}", issue.reason);
                println!("     local:  {}", issue.local_payload);
                if let Some(server) = &issue.server_fields {
                    println!("     server: {}", server);
                }
            }
        }
        RetryAction::Discard(id) => {
            let id: MutationId = id.parse().context("Invalid mutation id")?;
            if client.discard(&id).await? {
                println!("Discarded {}; the entity shows the server state again.", id);
            } else {
                anyhow::bail!("No queued change {}", id);
            }
        }
        RetryAction::Dismiss(id) => {
            if client.dismiss_issue(id).await? {
                println!("Dismissed issue {}.", id);
            } else {
                anyhow::bail!("No issue {}", id);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{log, testing::offline_device};
    use sync_client::LocalStore;
    use tempfile::tempdir;

    #[tokio::test]
    async fn requeue_and_list_with_nothing_to_do() {
        let dir = tempdir().unwrap();
        offline_device(dir.path()).await;

        run(dir.path(), RetryAction::Requeue).await.unwrap();
        run(dir.path(), RetryAction::List).await.unwrap();
    }

    #[tokio::test]
    async fn discard_drops_a_queued_change() {
        let dir = tempdir().unwrap();
        offline_device(dir.path()).await;
        log::run(dir.path(), "feeding", "create", Some("f1"), Some(r#"{"ml": 60}"#))
            .await
            .unwrap();

        let client = open_device(dir.path()).await.unwrap();
        let queued = client.store().queued().await.unwrap();
        assert_eq!(queued.len(), 1);
        drop(client);

        run(dir.path(), RetryAction::Discard(queued[0].event.id.to_string()))
            .await
            .unwrap();

        let client = open_device(dir.path()).await.unwrap();
        assert_eq!(client.status().await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn unknown_ids_are_errors() {
        let dir = tempdir().unwrap();
        offline_device(dir.path()).await;

        assert!(run(dir.path(), RetryAction::Discard("nope".into())).await.is_err());
        assert!(run(dir.path(), RetryAction::Discard(MutationId::new().to_string()))
            .await
            .is_err());
        assert!(run(dir.path(), RetryAction::Dismiss(42)).await.is_err());
    }
}
