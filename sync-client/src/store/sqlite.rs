//! SQLite backend for the Local Event Store.

use super::{
    CachedEntity, IssueKind, LocalStore, NewIssue, PendingEvent, QueueCounts, QueueStatus,
    StoreError, SyncIssue,
};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use sync_core::{apply_mutation, EntityState};
use sync_types::{
    now_millis, ChangeLogEntry, EntityId, EntityType, GlobalSeq, MutationEvent, MutationId,
    Operation, ServerRecord, Version,
};
use tokio::sync::{Mutex, MutexGuard};

const META_CURSOR: &str = "cursor";

/// SQLite-based local store.
///
/// Every multi-step change runs in one transaction, so a crash never leaves
/// the queue, the cache and the cursor out of step. Writers take `writer`
/// first: a deferred transaction that reads before it writes cannot upgrade
/// its lock while another connection holds the write lock, and SQLite fails
/// it with SQLITE_BUSY instead of waiting.
#[derive(Clone)]
pub struct SqliteLocalStore {
    pool: SqlitePool,
    writer: Arc<Mutex<()>>,
}

impl SqliteLocalStore {
    /// Open (or create) the store at `path`.
    pub async fn new(path: &Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(StoreError::Database)?;

        let store = Self {
            pool,
            writer: Arc::new(Mutex::new(())),
        };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(":memory:").map_err(StoreError::Database)?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(StoreError::Database)?;

        let store = Self {
            pool,
            writer: Arc::new(Mutex::new(())),
        };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn begin_write(
        &self,
    ) -> Result<(MutexGuard<'_, ()>, sqlx::Transaction<'static, sqlx::Sqlite>), StoreError> {
        let guard = self.writer.lock().await;
        let tx = self.pool.begin().await.map_err(StoreError::Database)?;
        Ok((guard, tx))
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pending (
                local_seq INTEGER PRIMARY KEY AUTOINCREMENT,
                mutation_id TEXT NOT NULL UNIQUE,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                operation TEXT NOT NULL,
                payload TEXT NOT NULL,
                based_on_version INTEGER NOT NULL,
                client_timestamp INTEGER NOT NULL,
                base_fields TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'pending',
                last_error TEXT,
                enqueued_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entities (
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 0,
                confirmed_fields TEXT,
                confirmed_deleted INTEGER NOT NULL DEFAULT 0,
                fields TEXT NOT NULL,
                deleted INTEGER NOT NULL DEFAULT 0,
                has_pending INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (entity_type, entity_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS issues (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                mutation_id TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                operation TEXT NOT NULL,
                local_payload TEXT NOT NULL,
                server_fields TEXT,
                server_version INTEGER,
                reason TEXT NOT NULL,
                recorded_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_pending_entity ON pending(entity_type, entity_id, local_seq)",
        )
        .execute(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_pending_status ON pending(status, local_seq)")
            .execute(&self.pool)
            .await
            .map_err(StoreError::Database)?;

        Ok(())
    }
}

#[async_trait]
impl LocalStore for SqliteLocalStore {
    async fn enqueue(&self, mut event: MutationEvent) -> Result<PendingEvent, StoreError> {
        let (_writer, mut tx) = self.begin_write().await?;

        let cached = load_entity(&mut tx, event.entity_type, &event.entity_id).await?;
        let base_fields = match &cached {
            Some(row) => Some(parse_json(&row.fields)?),
            None => None,
        };
        event.based_on_version = cached
            .as_ref()
            .map(|row| Version::new(row.version as u64))
            .unwrap_or_else(Version::initial);
        let enqueued_at = now_millis();

        let result = sqlx::query(
            r#"
            INSERT INTO pending (mutation_id, entity_type, entity_id, operation, payload,
                                 based_on_version, client_timestamp, base_fields, enqueued_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(event.id.to_string())
        .bind(event.entity_type.as_str())
        .bind(event.entity_id.as_str())
        .bind(event.operation.as_str())
        .bind(json_text(&event.payload)?)
        .bind(event.based_on_version.value() as i64)
        .bind(event.client_timestamp as i64)
        .bind(base_fields.as_ref().map(json_text).transpose()?)
        .bind(enqueued_at as i64)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::Database)?;

        event.local_seq = result.last_insert_rowid() as u64;
        rebuild_entity(&mut tx, event.entity_type, &event.entity_id).await?;
        tx.commit().await.map_err(StoreError::Database)?;

        tracing::debug!(
            "Enqueued {} {} {} (local_seq={}, based_on={})",
            event.operation,
            event.entity_type,
            event.entity_id,
            event.local_seq,
            event.based_on_version
        );

        Ok(PendingEvent {
            event,
            base_fields,
            attempts: 0,
            status: QueueStatus::Pending,
            last_error: None,
            enqueued_at,
        })
    }

    async fn next_batch(&self, limit: usize) -> Result<Vec<PendingEvent>, StoreError> {
        let rows = sqlx::query_as::<_, PendingRow>(
            r#"
            SELECT * FROM pending p
            WHERE p.status = 'pending'
              AND NOT EXISTS (
                  SELECT 1 FROM pending q
                  WHERE q.entity_type = p.entity_type
                    AND q.entity_id = p.entity_id
                    AND q.local_seq < p.local_seq
                    AND q.status != 'dead_letter'
              )
            ORDER BY p.local_seq ASC
            LIMIT ?1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        rows.into_iter().map(PendingEvent::try_from).collect()
    }

    async fn queued(&self) -> Result<Vec<PendingEvent>, StoreError> {
        let rows = sqlx::query_as::<_, PendingRow>("SELECT * FROM pending ORDER BY local_seq ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::Database)?;

        rows.into_iter().map(PendingEvent::try_from).collect()
    }

    async fn pending_event(&self, id: &MutationId) -> Result<Option<PendingEvent>, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(StoreError::Database)?;
        load_pending(&mut conn, id)
            .await?
            .map(PendingEvent::try_from)
            .transpose()
    }

    async fn acknowledge(&self, id: &MutationId, version: Version) -> Result<(), StoreError> {
        let (_writer, mut tx) = self.begin_write().await?;

        let Some(row) = load_pending(&mut tx, id).await? else {
            return Ok(());
        };
        let pending = PendingEvent::try_from(row)?;
        let event = &pending.event;

        let confirmed = load_entity(&mut tx, event.entity_type, &event.entity_id)
            .await?
            .map(|row| row.confirmed_state())
            .transpose()?
            .flatten();
        let committed = apply_mutation(confirmed.as_ref(), event.operation, &event.payload);
        confirm_state(&mut tx, event.entity_type, &event.entity_id, version, &committed).await?;

        sqlx::query("DELETE FROM pending WHERE mutation_id = ?1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(StoreError::Database)?;

        // Later edits of the same entity were made on top of this one.
        sqlx::query(
            r#"
            UPDATE pending SET based_on_version = ?1
            WHERE entity_type = ?2 AND entity_id = ?3
              AND based_on_version = ?4 AND local_seq > ?5
            "#,
        )
        .bind(version.value() as i64)
        .bind(event.entity_type.as_str())
        .bind(event.entity_id.as_str())
        .bind(event.based_on_version.value() as i64)
        .bind(event.local_seq as i64)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::Database)?;

        rebuild_entity(&mut tx, event.entity_type, &event.entity_id).await?;
        tx.commit().await.map_err(StoreError::Database)?;
        Ok(())
    }

    async fn rebase(&self, id: &MutationId, current: &ServerRecord) -> Result<(), StoreError> {
        let (_writer, mut tx) = self.begin_write().await?;

        let Some(row) = load_pending(&mut tx, id).await? else {
            return Ok(());
        };
        let pending = PendingEvent::try_from(row)?;
        let event = &pending.event;
        adopt_record(&mut tx, current).await?;

        sqlx::query(
            "UPDATE pending SET based_on_version = ?1, base_fields = ?2 WHERE mutation_id = ?3",
        )
        .bind(current.version.value() as i64)
        .bind(json_text(&current.fields)?)
        .bind(id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(StoreError::Database)?;

        // Followers that shared the stale base move with it.
        sqlx::query(
            r#"
            UPDATE pending SET based_on_version = ?1
            WHERE entity_type = ?2 AND entity_id = ?3
              AND based_on_version = ?4 AND local_seq > ?5
            "#,
        )
        .bind(current.version.value() as i64)
        .bind(event.entity_type.as_str())
        .bind(event.entity_id.as_str())
        .bind(event.based_on_version.value() as i64)
        .bind(event.local_seq as i64)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::Database)?;

        rebuild_entity(&mut tx, current.entity_type, &current.entity_id).await?;
        tx.commit().await.map_err(StoreError::Database)?;
        Ok(())
    }

    async fn drop_event(
        &self,
        id: &MutationId,
        current: Option<&ServerRecord>,
        issue: Option<NewIssue>,
    ) -> Result<bool, StoreError> {
        let (_writer, mut tx) = self.begin_write().await?;

        let Some(row) = load_pending(&mut tx, id).await? else {
            return Ok(false);
        };
        let pending = PendingEvent::try_from(row)?;

        if let Some(record) = current {
            adopt_record(&mut tx, record).await?;
        }
        if let Some(issue) = issue {
            insert_issue(&mut tx, &pending.event, current, issue.kind, &issue.reason).await?;
        }

        sqlx::query("DELETE FROM pending WHERE mutation_id = ?1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(StoreError::Database)?;

        rebuild_entity(&mut tx, pending.event.entity_type, &pending.event.entity_id).await?;
        tx.commit().await.map_err(StoreError::Database)?;
        Ok(true)
    }

    async fn record_failure(
        &self,
        ids: &[MutationId],
        error: &str,
        max_attempts: u32,
    ) -> Result<Vec<MutationId>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let (_writer, mut tx) = self.begin_write().await?;
        let mut stalled = Vec::new();

        for id in ids {
            sqlx::query(
                r#"
                UPDATE pending SET attempts = attempts + 1, last_error = ?2
                WHERE mutation_id = ?1 AND status = 'pending'
                "#,
            )
            .bind(id.to_string())
            .bind(error)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::Database)?;

            let result = sqlx::query(
                r#"
                UPDATE pending SET status = 'stalled'
                WHERE mutation_id = ?1 AND status = 'pending' AND attempts >= ?2
                "#,
            )
            .bind(id.to_string())
            .bind(max_attempts as i64)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::Database)?;

            if result.rows_affected() > 0 {
                stalled.push(*id);
            }
        }

        tx.commit().await.map_err(StoreError::Database)?;
        Ok(stalled)
    }

    async fn retry_stalled(&self) -> Result<u64, StoreError> {
        let (_writer, mut tx) = self.begin_write().await?;

        let affected: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT DISTINCT entity_type, entity_id FROM pending
            WHERE status IN ('stalled', 'dead_letter')
            "#,
        )
        .fetch_all(&mut *tx)
        .await
        .map_err(StoreError::Database)?;

        let result = sqlx::query(
            r#"
            UPDATE pending
            SET status = 'pending', attempts = 0, last_error = NULL, enqueued_at = ?1
            WHERE status IN ('stalled', 'dead_letter')
            "#,
        )
        .bind(now_millis() as i64)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::Database)?;

        for (entity_type, entity_id) in affected {
            let entity_type = parse_entity_type(&entity_type)?;
            rebuild_entity(&mut tx, entity_type, &EntityId::new(entity_id)).await?;
        }

        tx.commit().await.map_err(StoreError::Database)?;
        Ok(result.rows_affected())
    }

    async fn expire_pending(&self, cutoff: u64) -> Result<Vec<MutationId>, StoreError> {
        let (_writer, mut tx) = self.begin_write().await?;

        let rows = sqlx::query_as::<_, PendingRow>(
            r#"
            SELECT * FROM pending
            WHERE status IN ('pending', 'stalled') AND enqueued_at < ?1
            ORDER BY local_seq ASC
            "#,
        )
        .bind(cutoff as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(StoreError::Database)?;

        let mut expired = Vec::with_capacity(rows.len());
        for row in rows {
            let pending = PendingEvent::try_from(row)?;
            let event = &pending.event;

            sqlx::query("UPDATE pending SET status = 'dead_letter' WHERE mutation_id = ?1")
                .bind(event.id.to_string())
                .execute(&mut *tx)
                .await
                .map_err(StoreError::Database)?;

            insert_issue(
                &mut tx,
                event,
                None,
                IssueKind::DeadLetter,
                "not delivered before the queue age limit",
            )
            .await?;
            rebuild_entity(&mut tx, event.entity_type, &event.entity_id).await?;
            expired.push(event.id);
        }

        tx.commit().await.map_err(StoreError::Database)?;
        Ok(expired)
    }

    async fn apply_remote(&self, entry: &ChangeLogEntry) -> Result<(), StoreError> {
        let (_writer, mut tx) = self.begin_write().await?;

        adopt_record(&mut tx, &entry.record()).await?;
        rebuild_entity(&mut tx, entry.entity_type, &entry.entity_id).await?;
        write_meta(&mut tx, META_CURSOR, Some(&entry.global_seq.value().to_string())).await?;

        tx.commit().await.map_err(StoreError::Database)?;
        Ok(())
    }

    async fn cursor(&self) -> Result<GlobalSeq, StoreError> {
        match self.meta(META_CURSOR).await? {
            Some(value) => value
                .parse::<u64>()
                .map(GlobalSeq::new)
                .map_err(|_| StoreError::Corrupt(format!("invalid cursor: {value}"))),
            None => Ok(GlobalSeq::zero()),
        }
    }

    async fn entity(
        &self,
        entity_type: EntityType,
        entity_id: &EntityId,
    ) -> Result<Option<CachedEntity>, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(StoreError::Database)?;
        load_entity(&mut conn, entity_type, entity_id)
            .await?
            .map(CachedEntity::try_from)
            .transpose()
    }

    async fn entities(
        &self,
        entity_type: Option<EntityType>,
    ) -> Result<Vec<CachedEntity>, StoreError> {
        let rows = sqlx::query_as::<_, EntityRow>(
            r#"
            SELECT * FROM entities
            WHERE deleted = 0 AND (?1 IS NULL OR entity_type = ?1)
            ORDER BY entity_type, entity_id
            "#,
        )
        .bind(entity_type.map(|t| t.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        rows.into_iter().map(CachedEntity::try_from).collect()
    }

    async fn counts(&self) -> Result<QueueCounts, StoreError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM pending GROUP BY status")
                .fetch_all(&self.pool)
                .await
                .map_err(StoreError::Database)?;

        let mut counts = QueueCounts::default();
        for (status, count) in rows {
            match QueueStatus::from_str(&status)? {
                QueueStatus::Pending => counts.pending = count as u64,
                QueueStatus::Stalled => counts.stalled = count as u64,
                QueueStatus::DeadLetter => counts.dead_letter = count as u64,
            }
        }
        Ok(counts)
    }

    async fn issues(&self) -> Result<Vec<SyncIssue>, StoreError> {
        let rows = sqlx::query_as::<_, IssueRow>("SELECT * FROM issues ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::Database)?;

        rows.into_iter().map(SyncIssue::try_from).collect()
    }

    async fn dismiss_issue(&self, id: i64) -> Result<bool, StoreError> {
        let _writer = self.writer.lock().await;
        let result = sqlx::query("DELETE FROM issues WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn meta(&self, key: &str) -> Result<Option<String>, StoreError> {
        sqlx::query_scalar("SELECT value FROM meta WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::Database)
    }

    async fn set_meta(&self, key: &str, value: Option<&str>) -> Result<(), StoreError> {
        let _writer = self.writer.lock().await;
        let mut conn = self.pool.acquire().await.map_err(StoreError::Database)?;
        write_meta(&mut conn, key, value).await
    }
}

async fn load_pending(
    conn: &mut SqliteConnection,
    id: &MutationId,
) -> Result<Option<PendingRow>, StoreError> {
    sqlx::query_as::<_, PendingRow>("SELECT * FROM pending WHERE mutation_id = ?1")
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await
        .map_err(StoreError::Database)
}

async fn load_entity(
    conn: &mut SqliteConnection,
    entity_type: EntityType,
    entity_id: &EntityId,
) -> Result<Option<EntityRow>, StoreError> {
    sqlx::query_as::<_, EntityRow>(
        "SELECT * FROM entities WHERE entity_type = ?1 AND entity_id = ?2",
    )
    .bind(entity_type.as_str())
    .bind(entity_id.as_str())
    .fetch_optional(&mut *conn)
    .await
    .map_err(StoreError::Database)
}

/// Record a committed server state unless a newer one is already known.
async fn confirm_state(
    conn: &mut SqliteConnection,
    entity_type: EntityType,
    entity_id: &EntityId,
    version: Version,
    state: &EntityState,
) -> Result<(), StoreError> {
    let fields = json_text(&state.fields)?;
    sqlx::query(
        r#"
        INSERT INTO entities (entity_type, entity_id, version, confirmed_fields,
                              confirmed_deleted, fields, deleted)
        VALUES (?1, ?2, ?3, ?4, ?5, ?4, ?5)
        ON CONFLICT(entity_type, entity_id) DO UPDATE SET
            version = excluded.version,
            confirmed_fields = excluded.confirmed_fields,
            confirmed_deleted = excluded.confirmed_deleted
        WHERE excluded.version >= entities.version
        "#,
    )
    .bind(entity_type.as_str())
    .bind(entity_id.as_str())
    .bind(version.value() as i64)
    .bind(fields)
    .bind(state.deleted)
    .execute(&mut *conn)
    .await
    .map_err(StoreError::Database)?;
    Ok(())
}

async fn adopt_record(conn: &mut SqliteConnection, record: &ServerRecord) -> Result<(), StoreError> {
    let state = EntityState {
        fields: record.fields.clone(),
        deleted: record.deleted,
    };
    confirm_state(conn, record.entity_type, &record.entity_id, record.version, &state).await
}

/// Recompute the cached view: confirmed state plus queued changes in order.
async fn rebuild_entity(
    conn: &mut SqliteConnection,
    entity_type: EntityType,
    entity_id: &EntityId,
) -> Result<(), StoreError> {
    let row = load_entity(conn, entity_type, entity_id).await?;
    let confirmed = match &row {
        Some(row) => row.confirmed_state()?,
        None => None,
    };

    let queued: Vec<(String, String)> = sqlx::query_as(
        r#"
        SELECT operation, payload FROM pending
        WHERE entity_type = ?1 AND entity_id = ?2 AND status != 'dead_letter'
        ORDER BY local_seq ASC
        "#,
    )
    .bind(entity_type.as_str())
    .bind(entity_id.as_str())
    .fetch_all(&mut *conn)
    .await
    .map_err(StoreError::Database)?;

    let has_pending = !queued.is_empty();
    let mut state = confirmed;
    for (operation, payload) in queued {
        let operation = parse_operation(&operation)?;
        state = Some(apply_mutation(state.as_ref(), operation, &parse_json(&payload)?));
    }

    match state {
        Some(state) => {
            sqlx::query(
                r#"
                INSERT INTO entities (entity_type, entity_id, fields, deleted, has_pending)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(entity_type, entity_id) DO UPDATE SET
                    fields = excluded.fields,
                    deleted = excluded.deleted,
                    has_pending = excluded.has_pending
                "#,
            )
            .bind(entity_type.as_str())
            .bind(entity_id.as_str())
            .bind(json_text(&state.fields)?)
            .bind(state.deleted)
            .bind(has_pending)
            .execute(&mut *conn)
            .await
            .map_err(StoreError::Database)?;
        }
        None if row.is_some() => {
            sqlx::query("DELETE FROM entities WHERE entity_type = ?1 AND entity_id = ?2")
                .bind(entity_type.as_str())
                .bind(entity_id.as_str())
                .execute(&mut *conn)
                .await
                .map_err(StoreError::Database)?;
        }
        None => {}
    }
    Ok(())
}

async fn insert_issue(
    conn: &mut SqliteConnection,
    event: &MutationEvent,
    current: Option<&ServerRecord>,
    kind: IssueKind,
    reason: &str,
) -> Result<(), StoreError> {
    let server_fields = current.map(|r| json_text(&r.fields)).transpose()?;
    sqlx::query(
        r#"
        INSERT INTO issues (kind, mutation_id, entity_type, entity_id, operation,
                            local_payload, server_fields, server_version, reason, recorded_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        "#,
    )
    .bind(kind.as_str())
    .bind(event.id.to_string())
    .bind(event.entity_type.as_str())
    .bind(event.entity_id.as_str())
    .bind(event.operation.as_str())
    .bind(json_text(&event.payload)?)
    .bind(server_fields)
    .bind(current.map(|r| r.version.value() as i64))
    .bind(reason)
    .bind(now_millis() as i64)
    .execute(&mut *conn)
    .await
    .map_err(StoreError::Database)?;
    Ok(())
}

async fn write_meta(
    conn: &mut SqliteConnection,
    key: &str,
    value: Option<&str>,
) -> Result<(), StoreError> {
    match value {
        Some(value) => {
            sqlx::query(
                r#"
                INSERT INTO meta (key, value) VALUES (?1, ?2)
                ON CONFLICT(key) DO UPDATE SET value = excluded.value
                "#,
            )
            .bind(key)
            .bind(value)
            .execute(&mut *conn)
            .await
            .map_err(StoreError::Database)?;
        }
        None => {
            sqlx::query("DELETE FROM meta WHERE key = ?1")
                .bind(key)
                .execute(&mut *conn)
                .await
                .map_err(StoreError::Database)?;
        }
    }
    Ok(())
}

fn json_text(value: &Value) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(StoreError::Json)
}

fn parse_json(text: &str) -> Result<Value, StoreError> {
    serde_json::from_str(text).map_err(StoreError::Json)
}

fn parse_entity_type(value: &str) -> Result<EntityType, StoreError> {
    value
        .parse()
        .map_err(|_| StoreError::Corrupt(format!("unknown entity type: {value}")))
}

fn parse_operation(value: &str) -> Result<Operation, StoreError> {
    value
        .parse()
        .map_err(|_| StoreError::Corrupt(format!("unknown operation: {value}")))
}

fn parse_mutation_id(value: &str) -> Result<MutationId, StoreError> {
    value
        .parse()
        .map_err(|_| StoreError::Corrupt(format!("invalid mutation id: {value}")))
}

/// Internal row type for the pending queue.
#[derive(sqlx::FromRow)]
struct PendingRow {
    local_seq: i64,
    mutation_id: String,
    entity_type: String,
    entity_id: String,
    operation: String,
    payload: String,
    based_on_version: i64,
    client_timestamp: i64,
    base_fields: Option<String>,
    attempts: i64,
    status: String,
    last_error: Option<String>,
    enqueued_at: i64,
}

impl TryFrom<PendingRow> for PendingEvent {
    type Error = StoreError;

    fn try_from(row: PendingRow) -> Result<Self, Self::Error> {
        Ok(PendingEvent {
            event: MutationEvent {
                id: parse_mutation_id(&row.mutation_id)?,
                entity_type: parse_entity_type(&row.entity_type)?,
                entity_id: EntityId::new(row.entity_id),
                operation: parse_operation(&row.operation)?,
                payload: parse_json(&row.payload)?,
                based_on_version: Version::new(row.based_on_version as u64),
                client_timestamp: row.client_timestamp as u64,
                local_seq: row.local_seq as u64,
            },
            base_fields: row.base_fields.as_deref().map(parse_json).transpose()?,
            attempts: row.attempts as u32,
            status: QueueStatus::from_str(&row.status)?,
            last_error: row.last_error,
            enqueued_at: row.enqueued_at as u64,
        })
    }
}

/// Internal row type for the entity cache.
#[derive(sqlx::FromRow)]
struct EntityRow {
    entity_type: String,
    entity_id: String,
    version: i64,
    confirmed_fields: Option<String>,
    confirmed_deleted: bool,
    fields: String,
    deleted: bool,
    has_pending: bool,
}

impl EntityRow {
    fn confirmed_state(&self) -> Result<Option<EntityState>, StoreError> {
        self.confirmed_fields
            .as_deref()
            .map(|text| {
                Ok(EntityState {
                    fields: parse_json(text)?,
                    deleted: self.confirmed_deleted,
                })
            })
            .transpose()
    }
}

impl TryFrom<EntityRow> for CachedEntity {
    type Error = StoreError;

    fn try_from(row: EntityRow) -> Result<Self, Self::Error> {
        Ok(CachedEntity {
            entity_type: parse_entity_type(&row.entity_type)?,
            entity_id: EntityId::new(row.entity_id),
            version: Version::new(row.version as u64),
            fields: parse_json(&row.fields)?,
            deleted: row.deleted,
            has_pending: row.has_pending,
        })
    }
}

/// Internal row type for recorded issues.
#[derive(sqlx::FromRow)]
struct IssueRow {
    id: i64,
    kind: String,
    mutation_id: String,
    entity_type: String,
    entity_id: String,
    operation: String,
    local_payload: String,
    server_fields: Option<String>,
    server_version: Option<i64>,
    reason: String,
    recorded_at: i64,
}

impl TryFrom<IssueRow> for SyncIssue {
    type Error = StoreError;

    fn try_from(row: IssueRow) -> Result<Self, Self::Error> {
        Ok(SyncIssue {
            id: row.id,
            kind: IssueKind::from_str(&row.kind)?,
            mutation_id: parse_mutation_id(&row.mutation_id)?,
            entity_type: parse_entity_type(&row.entity_type)?,
            entity_id: EntityId::new(row.entity_id),
            operation: parse_operation(&row.operation)?,
            local_payload: parse_json(&row.local_payload)?,
            server_fields: row.server_fields.as_deref().map(parse_json).transpose()?,
            server_version: row.server_version.map(|v| Version::new(v as u64)),
            reason: row.reason,
            recorded_at: row.recorded_at as u64,
        })
    }
}
