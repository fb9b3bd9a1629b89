//! SQLite storage backend for the sync server.

use super::{Commit, CommitOutcome, StorageStats, SyncStorage};
use crate::error::{StorageError, ValidationError};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use sync_core::{apply_mutation, EntityState};
use sync_types::{
    ChangeLogEntry, DeviceId, EntityId, EntityType, FamilyId, GlobalSeq, MutationId, Operation,
    ServerRecord, UserId, Version,
};

/// SQLite-based sync storage.
///
/// Uses WAL mode for concurrent reads/writes.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Create a new SQLite storage from a database path.
    ///
    /// Creates the database file if it doesn't exist.
    pub async fn new(path: &Path) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await
            .map_err(StorageError::Database)?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Create an in-memory SQLite storage (for testing).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options =
            SqliteConnectOptions::from_str(":memory:").map_err(StorageError::Database)?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(StorageError::Database)?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS family_seq (
                family_id TEXT PRIMARY KEY,
                head INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                family_id TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                fields TEXT NOT NULL,
                deleted INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL,
                updated_by TEXT NOT NULL,
                client_timestamp INTEGER NOT NULL,
                PRIMARY KEY (family_id, entity_type, entity_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS change_log (
                family_id TEXT NOT NULL,
                global_seq INTEGER NOT NULL,
                mutation_id TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                operation TEXT NOT NULL,
                payload TEXT NOT NULL,
                version INTEGER NOT NULL,
                fields TEXT NOT NULL,
                deleted INTEGER NOT NULL,
                user_id TEXT NOT NULL,
                origin_device TEXT NOT NULL,
                client_timestamp INTEGER NOT NULL,
                committed_at INTEGER NOT NULL,
                PRIMARY KEY (family_id, global_seq)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS applied_mutations (
                mutation_id TEXT PRIMARY KEY,
                family_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                global_seq INTEGER NOT NULL,
                committed_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        Ok(())
    }
}

#[async_trait]
impl SyncStorage for SqliteStorage {
    async fn commit(&self, commit: Commit<'_>) -> Result<CommitOutcome, StorageError> {
        let event = commit.event;
        let family = commit.family_id;
        let mut tx = self.pool.begin().await.map_err(StorageError::Database)?;

        // Write first so the transaction holds the write lock before it reads.
        sqlx::query(
            "INSERT INTO family_seq (family_id, head) VALUES (?1, 0) ON CONFLICT(family_id) DO NOTHING",
        )
        .bind(family.as_str())
        .execute(&mut *tx)
        .await
        .map_err(StorageError::Database)?;

        if let Some(applied) = load_applied(&mut tx, &event.id).await? {
            if applied.family_id != family.as_str() {
                return Ok(CommitOutcome::Rejected(ValidationError::MutationIdReused(
                    event.id,
                )));
            }
            return Ok(CommitOutcome::Duplicate {
                version: Version::new(applied.version as u64),
                global_seq: GlobalSeq::new(applied.global_seq as u64),
            });
        }

        if event.operation == Operation::Create && event.based_on_version != Version::initial() {
            return Ok(CommitOutcome::Rejected(ValidationError::CreateNotInitial(
                event.based_on_version,
            )));
        }

        let current = load_record(&mut tx, family, event.entity_type, &event.entity_id)
            .await?
            .map(ServerRecord::try_from)
            .transpose()?;

        match &current {
            None if event.operation != Operation::Create => {
                return Ok(CommitOutcome::Rejected(ValidationError::UnknownEntity {
                    entity_type: event.entity_type,
                    entity_id: event.entity_id.clone(),
                }));
            }
            Some(record) if record.version != event.based_on_version => {
                return Ok(CommitOutcome::Conflict(record.clone()));
            }
            Some(record) if record.deleted => {
                return Ok(CommitOutcome::Rejected(ValidationError::EntityDeleted {
                    entity_type: event.entity_type,
                    entity_id: event.entity_id.clone(),
                }));
            }
            _ => {}
        }

        let state = current.as_ref().map(|record| EntityState {
            fields: record.fields.clone(),
            deleted: record.deleted,
        });
        let next = apply_mutation(state.as_ref(), event.operation, &event.payload);
        let version = current
            .as_ref()
            .map(|record| record.version)
            .unwrap_or_else(Version::initial)
            .next();

        let head: i64 = sqlx::query_scalar(
            "UPDATE family_seq SET head = head + 1 WHERE family_id = ?1 RETURNING head",
        )
        .bind(family.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(StorageError::Database)?;
        let global_seq = GlobalSeq::new(head as u64);

        let entry = ChangeLogEntry {
            family_id: family.clone(),
            global_seq,
            mutation_id: event.id,
            entity_type: event.entity_type,
            entity_id: event.entity_id.clone(),
            operation: event.operation,
            payload: event.payload.clone(),
            version,
            fields: next.fields,
            deleted: next.deleted,
            user_id: commit.user_id.clone(),
            origin_device: commit.device_id,
            client_timestamp: event.client_timestamp,
            committed_at: commit.committed_at,
        };

        write_record(&mut tx, &entry.record()).await?;
        append_change(&mut tx, &entry).await?;

        sqlx::query(
            r#"
            INSERT INTO applied_mutations (mutation_id, family_id, version, global_seq, committed_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(event.id.to_string())
        .bind(family.as_str())
        .bind(version.value() as i64)
        .bind(global_seq.value() as i64)
        .bind(commit.committed_at as i64)
        .execute(&mut *tx)
        .await
        .map_err(StorageError::Database)?;

        tx.commit().await.map_err(StorageError::Database)?;
        Ok(CommitOutcome::Committed(entry))
    }

    async fn changes_since(
        &self,
        family_id: &FamilyId,
        since: GlobalSeq,
        limit: u32,
    ) -> Result<Vec<ChangeLogEntry>, StorageError> {
        let rows = sqlx::query_as::<_, ChangeRow>(
            r#"
            SELECT * FROM change_log
            WHERE family_id = ?1 AND global_seq > ?2
            ORDER BY global_seq ASC
            LIMIT ?3
            "#,
        )
        .bind(family_id.as_str())
        .bind(since.value() as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        rows.into_iter().map(ChangeLogEntry::try_from).collect()
    }

    async fn applied(
        &self,
        family_id: &FamilyId,
        mutation_id: &MutationId,
    ) -> Result<Option<(Version, GlobalSeq)>, StorageError> {
        let mut conn = self.pool.acquire().await.map_err(StorageError::Database)?;
        Ok(load_applied(&mut conn, mutation_id)
            .await?
            .filter(|row| row.family_id == family_id.as_str())
            .map(|row| {
                (
                    Version::new(row.version as u64),
                    GlobalSeq::new(row.global_seq as u64),
                )
            }))
    }

    async fn head(&self, family_id: &FamilyId) -> Result<GlobalSeq, StorageError> {
        let head: Option<i64> = sqlx::query_scalar("SELECT head FROM family_seq WHERE family_id = ?1")
            .bind(family_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(StorageError::Database)?;

        Ok(GlobalSeq::new(head.unwrap_or(0) as u64))
    }

    async fn record(
        &self,
        family_id: &FamilyId,
        entity_type: EntityType,
        entity_id: &EntityId,
    ) -> Result<Option<ServerRecord>, StorageError> {
        let mut conn = self.pool.acquire().await.map_err(StorageError::Database)?;
        load_record(&mut conn, family_id, entity_type, entity_id)
            .await?
            .map(ServerRecord::try_from)
            .transpose()
    }

    async fn stats(&self) -> Result<StorageStats, StorageError> {
        let (families, records, changes): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT (SELECT COUNT(*) FROM family_seq),
                   (SELECT COUNT(*) FROM records),
                   (SELECT COUNT(*) FROM change_log)
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        Ok(StorageStats {
            families: families as u64,
            records: records as u64,
            changes: changes as u64,
        })
    }
}

async fn load_applied(
    conn: &mut SqliteConnection,
    id: &MutationId,
) -> Result<Option<AppliedRow>, StorageError> {
    sqlx::query_as::<_, AppliedRow>(
        "SELECT family_id, version, global_seq FROM applied_mutations WHERE mutation_id = ?1",
    )
    .bind(id.to_string())
    .fetch_optional(&mut *conn)
    .await
    .map_err(StorageError::Database)
}

async fn load_record(
    conn: &mut SqliteConnection,
    family_id: &FamilyId,
    entity_type: EntityType,
    entity_id: &EntityId,
) -> Result<Option<RecordRow>, StorageError> {
    sqlx::query_as::<_, RecordRow>(
        r#"
        SELECT * FROM records
        WHERE family_id = ?1 AND entity_type = ?2 AND entity_id = ?3
        "#,
    )
    .bind(family_id.as_str())
    .bind(entity_type.as_str())
    .bind(entity_id.as_str())
    .fetch_optional(&mut *conn)
    .await
    .map_err(StorageError::Database)
}

async fn write_record(
    conn: &mut SqliteConnection,
    record: &ServerRecord,
) -> Result<(), StorageError> {
    sqlx::query(
        r#"
        INSERT INTO records (family_id, entity_type, entity_id, version, fields, deleted,
                             updated_at, updated_by, client_timestamp)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        ON CONFLICT(family_id, entity_type, entity_id) DO UPDATE SET
            version = excluded.version,
            fields = excluded.fields,
            deleted = excluded.deleted,
            updated_at = excluded.updated_at,
            updated_by = excluded.updated_by,
            client_timestamp = excluded.client_timestamp
        "#,
    )
    .bind(record.family_id.as_str())
    .bind(record.entity_type.as_str())
    .bind(record.entity_id.as_str())
    .bind(record.version.value() as i64)
    .bind(serde_json::to_string(&record.fields)?)
    .bind(record.deleted)
    .bind(record.updated_at as i64)
    .bind(record.updated_by.to_string())
    .bind(record.client_timestamp as i64)
    .execute(&mut *conn)
    .await
    .map_err(StorageError::Database)?;

    Ok(())
}

async fn append_change(
    conn: &mut SqliteConnection,
    entry: &ChangeLogEntry,
) -> Result<(), StorageError> {
    sqlx::query(
        r#"
        INSERT INTO change_log (family_id, global_seq, mutation_id, entity_type, entity_id,
                                operation, payload, version, fields, deleted, user_id,
                                origin_device, client_timestamp, committed_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
        "#,
    )
    .bind(entry.family_id.as_str())
    .bind(entry.global_seq.value() as i64)
    .bind(entry.mutation_id.to_string())
    .bind(entry.entity_type.as_str())
    .bind(entry.entity_id.as_str())
    .bind(entry.operation.as_str())
    .bind(serde_json::to_string(&entry.payload)?)
    .bind(entry.version.value() as i64)
    .bind(serde_json::to_string(&entry.fields)?)
    .bind(entry.deleted)
    .bind(entry.user_id.as_str())
    .bind(entry.origin_device.to_string())
    .bind(entry.client_timestamp as i64)
    .bind(entry.committed_at as i64)
    .execute(&mut *conn)
    .await
    .map_err(StorageError::Database)?;

    Ok(())
}

fn parse_json(text: &str) -> Result<Value, StorageError> {
    serde_json::from_str(text).map_err(StorageError::Json)
}

fn parse_entity_type(value: &str) -> Result<EntityType, StorageError> {
    value
        .parse()
        .map_err(|_| StorageError::Corrupt(format!("unknown entity type: {value}")))
}

fn parse_device(value: &str) -> Result<DeviceId, StorageError> {
    value
        .parse()
        .map_err(|_| StorageError::Corrupt(format!("invalid device id: {value}")))
}

/// Internal row type for idempotency lookups.
#[derive(sqlx::FromRow)]
struct AppliedRow {
    family_id: String,
    version: i64,
    global_seq: i64,
}

/// Internal row type for records.
#[derive(sqlx::FromRow)]
struct RecordRow {
    family_id: String,
    entity_type: String,
    entity_id: String,
    version: i64,
    fields: String,
    deleted: bool,
    updated_at: i64,
    updated_by: String,
    client_timestamp: i64,
}

impl TryFrom<RecordRow> for ServerRecord {
    type Error = StorageError;

    fn try_from(row: RecordRow) -> Result<Self, Self::Error> {
        Ok(ServerRecord {
            family_id: FamilyId::new(row.family_id),
            entity_type: parse_entity_type(&row.entity_type)?,
            entity_id: EntityId::new(row.entity_id),
            version: Version::new(row.version as u64),
            fields: parse_json(&row.fields)?,
            deleted: row.deleted,
            updated_at: row.updated_at as u64,
            updated_by: parse_device(&row.updated_by)?,
            client_timestamp: row.client_timestamp as u64,
        })
    }
}

/// Internal row type for change log entries.
#[derive(sqlx::FromRow)]
struct ChangeRow {
    family_id: String,
    global_seq: i64,
    mutation_id: String,
    entity_type: String,
    entity_id: String,
    operation: String,
    payload: String,
    version: i64,
    fields: String,
    deleted: bool,
    user_id: String,
    origin_device: String,
    client_timestamp: i64,
    committed_at: i64,
}

impl TryFrom<ChangeRow> for ChangeLogEntry {
    type Error = StorageError;

    fn try_from(row: ChangeRow) -> Result<Self, Self::Error> {
        Ok(ChangeLogEntry {
            family_id: FamilyId::new(row.family_id),
            global_seq: GlobalSeq::new(row.global_seq as u64),
            mutation_id: row
                .mutation_id
                .parse()
                .map_err(|_| StorageError::Corrupt(format!("invalid mutation id: {}", row.mutation_id)))?,
            entity_type: parse_entity_type(&row.entity_type)?,
            entity_id: EntityId::new(row.entity_id),
            operation: row
                .operation
                .parse()
                .map_err(|_| StorageError::Corrupt(format!("unknown operation: {}", row.operation)))?,
            payload: parse_json(&row.payload)?,
            version: Version::new(row.version as u64),
            fields: parse_json(&row.fields)?,
            deleted: row.deleted,
            user_id: UserId::new(row.user_id),
            origin_device: parse_device(&row.origin_device)?,
            client_timestamp: row.client_timestamp as u64,
            committed_at: row.committed_at as u64,
        })
    }
}
