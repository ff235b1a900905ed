use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{BoxStream, StreamExt};
use serde_json::{Map, Value};
use sqlx::postgres::{PgListener, PgPool, PgRow};
use sqlx::{Postgres, Row, Transaction};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::event_sourcing::{
    Agent, AggregateId, AggregateType, EventMetadata, EventName, EventRecord, EventSourcingRepo,
    SerializedEvent, StoreError, Version, WriteBatch,
};
use crate::messaging::inbox::{IncomingMessage, IncomingMessageId, IncomingMessageRepo};
use crate::messaging::outbox::{LockToken, MessagingOutboxEntry, MessagingOutboxRepo};

// ============================================================================
// PostgreSQL Store
// ============================================================================
//
// aggregate_heads holds one row per stream; the conditional UPDATE/INSERT on
// it is the optimistic-concurrency check. Events, snapshots and outbox rows
// of one WriteBatch share a transaction. Outbox inserts are announced with
// pg_notify, which Postgres only delivers on commit.
//
// ============================================================================

pub const OUTBOX_INSERTS_CHANNEL: &str = "messaging_outbox_inserts";

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS aggregate_heads (
        aggregate_type TEXT NOT NULL,
        aggregate_id TEXT NOT NULL,
        version BIGINT NOT NULL,
        PRIMARY KEY (aggregate_type, aggregate_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS events (
        aggregate_type TEXT NOT NULL,
        aggregate_id TEXT NOT NULL,
        aggregate_version BIGINT NOT NULL,
        event_name TEXT NOT NULL,
        event_version BIGINT NOT NULL,
        payload JSONB NOT NULL,
        agent_type TEXT NOT NULL,
        agent_id TEXT,
        date TIMESTAMPTZ NOT NULL,
        is_snapshot BOOLEAN NOT NULL DEFAULT FALSE,
        PRIMARY KEY (aggregate_type, aggregate_id, aggregate_version)
    )"#,
    r#"CREATE INDEX IF NOT EXISTS events_snapshots_idx
        ON events (aggregate_type, aggregate_id, aggregate_version)
        WHERE is_snapshot"#,
    r#"CREATE TABLE IF NOT EXISTS messaging_outbox (
        id UUID PRIMARY KEY,
        target TEXT NOT NULL,
        routing_key TEXT NOT NULL,
        payload JSONB NOT NULL,
        headers JSONB NOT NULL DEFAULT '{}',
        created_at TIMESTAMPTZ NOT NULL,
        locked_at TIMESTAMPTZ,
        lock_token UUID,
        acknowledged_at TIMESTAMPTZ,
        failed_at TIMESTAMPTZ,
        retry_count INTEGER NOT NULL DEFAULT 0,
        last_error TEXT
    )"#,
    r#"CREATE INDEX IF NOT EXISTS messaging_outbox_publishable_idx
        ON messaging_outbox (created_at, id)
        WHERE lock_token IS NULL AND acknowledged_at IS NULL"#,
    r#"CREATE TABLE IF NOT EXISTS messaging_inbox (
        id TEXT PRIMARY KEY,
        received_at TIMESTAMPTZ NOT NULL
    )"#,
];

const OUTBOX_COLUMNS: &str = "id, target, routing_key, payload, headers, created_at, locked_at, \
     lock_token, acknowledged_at, failed_at, retry_count, last_error";

const EVENT_COLUMNS: &str = "aggregate_type, aggregate_id, aggregate_version, event_name, \
     event_version, payload, agent_type, agent_id, date, is_snapshot";

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await.map_err(backend)?;
        tracing::info!("🐘 Connected to PostgreSQL");
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes when missing
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await.map_err(backend)?;
        }
        tracing::debug!("PostgreSQL schema ready");
        Ok(())
    }

    async fn advance_head(
        tx: &mut Transaction<'_, Postgres>,
        aggregate_id: &AggregateId,
        aggregate_type: &AggregateType,
        expected: Option<Version>,
        new_version: Version,
    ) -> Result<bool, sqlx::Error> {
        let result = match expected {
            None => {
                sqlx::query(
                    "INSERT INTO aggregate_heads (aggregate_type, aggregate_id, version) \
                     VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
                )
                .bind(aggregate_type.as_str())
                .bind(aggregate_id.as_str())
                .bind(to_db_version(new_version))
                .execute(&mut **tx)
                .await?
            }
            Some(expected) => {
                sqlx::query(
                    "UPDATE aggregate_heads SET version = $3 \
                     WHERE aggregate_type = $1 AND aggregate_id = $2 AND version = $4",
                )
                .bind(aggregate_type.as_str())
                .bind(aggregate_id.as_str())
                .bind(to_db_version(new_version))
                .bind(to_db_version(expected))
                .execute(&mut **tx)
                .await?
            }
        };
        Ok(result.rows_affected() == 1)
    }

    async fn insert_event(tx: &mut Transaction<'_, Postgres>, record: &EventRecord) -> Result<(), sqlx::Error> {
        let metadata = &record.metadata;
        sqlx::query(&format!(
            "INSERT INTO events ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            EVENT_COLUMNS
        ))
        .bind(metadata.aggregate_type.as_str())
        .bind(metadata.aggregate_id.as_str())
        .bind(to_db_version(metadata.aggregate_version))
        .bind(record.event.name.as_str())
        .bind(to_db_version(record.event.version))
        .bind(sqlx::types::Json(&record.event.payload))
        .bind(metadata.agent.agent_type())
        .bind(metadata.agent.id().map(|id| id.as_str()))
        .bind(metadata.date)
        .bind(metadata.is_snapshot)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Returns false when a snapshot at or after this version already exists
    async fn write_snapshot(tx: &mut Transaction<'_, Postgres>, snapshot: &EventRecord) -> Result<bool, StoreError> {
        let metadata = &snapshot.metadata;
        let version = to_db_version(metadata.aggregate_version);

        let head: Option<i64> = sqlx::query_scalar(
            "SELECT version FROM aggregate_heads WHERE aggregate_type = $1 AND aggregate_id = $2 FOR UPDATE",
        )
        .bind(metadata.aggregate_type.as_str())
        .bind(metadata.aggregate_id.as_str())
        .fetch_optional(&mut **tx)
        .await
        .map_err(backend)?;
        if head.map_or(true, |head| version > head) {
            return Err(StoreError::Corrupted(format!(
                "snapshot at version {} is beyond the head of {}/{}",
                metadata.aggregate_version, metadata.aggregate_type, metadata.aggregate_id
            )));
        }

        let superseded: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM events WHERE aggregate_type = $1 AND aggregate_id = $2 \
             AND aggregate_version >= $3 AND is_snapshot)",
        )
        .bind(metadata.aggregate_type.as_str())
        .bind(metadata.aggregate_id.as_str())
        .bind(version)
        .fetch_one(&mut **tx)
        .await
        .map_err(backend)?;
        if superseded {
            return Ok(false);
        }

        sqlx::query("DELETE FROM events WHERE aggregate_type = $1 AND aggregate_id = $2 AND aggregate_version <= $3")
            .bind(metadata.aggregate_type.as_str())
            .bind(metadata.aggregate_id.as_str())
            .bind(version)
            .execute(&mut **tx)
            .await
            .map_err(backend)?;
        Self::insert_event(tx, snapshot).await.map_err(backend)?;
        Ok(true)
    }

    async fn insert_outbox_entry(
        tx: &mut Transaction<'_, Postgres>,
        entry: &MessagingOutboxEntry,
    ) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "INSERT INTO messaging_outbox ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
            OUTBOX_COLUMNS
        ))
        .bind(entry.id)
        .bind(&entry.target)
        .bind(&entry.routing_key)
        .bind(sqlx::types::Json(&entry.payload))
        .bind(sqlx::types::Json(&entry.headers))
        .bind(entry.created_at)
        .bind(entry.locked_at)
        .bind(entry.lock_token.map(|token| token.as_uuid()))
        .bind(entry.acknowledged_at)
        .bind(entry.failed_at)
        .bind(entry.retry_count as i32)
        .bind(entry.last_error.as_deref())
        .execute(&mut **tx)
        .await
        .map_err(|e| duplicate_or_backend(e, format!("outbox entry {}", entry.id)))?;

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(OUTBOX_INSERTS_CHANNEL)
            .bind(entry.id.to_string())
            .execute(&mut **tx)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn query_events(
        &self,
        aggregate_id: &AggregateId,
        aggregate_type: &AggregateType,
        condition: &str,
        version: Version,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM events WHERE aggregate_type = $1 AND aggregate_id = $2 AND {} \
             ORDER BY aggregate_version ASC",
            EVENT_COLUMNS, condition
        ))
        .bind(aggregate_type.as_str())
        .bind(aggregate_id.as_str())
        .bind(to_db_version(version))
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.iter().map(event_from_row).collect()
    }
}

// ============================================================================
// Row mapping
// ============================================================================

fn backend(error: sqlx::Error) -> StoreError {
    StoreError::Backend(error.to_string())
}

fn duplicate_or_backend(error: sqlx::Error, what: String) -> StoreError {
    match error.as_database_error() {
        Some(db_err) if db_err.is_unique_violation() => StoreError::Duplicate(what),
        _ => backend(error),
    }
}

fn to_db_version(version: Version) -> i64 {
    version.value() as i64
}

fn from_db_version(value: i64) -> Result<Version, StoreError> {
    u64::try_from(value)
        .map(Version::new)
        .map_err(|_| StoreError::Corrupted(format!("negative version {}", value)))
}

fn corrupted(error: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupted(error.to_string())
}

fn event_from_row(row: &PgRow) -> Result<EventRecord, StoreError> {
    let agent_type: String = row.try_get("agent_type").map_err(backend)?;
    let agent_id: Option<String> = row.try_get("agent_id").map_err(backend)?;
    let payload: sqlx::types::Json<Map<String, Value>> = row.try_get("payload").map_err(backend)?;

    Ok(EventRecord {
        metadata: EventMetadata {
            aggregate_id: AggregateId::new(row.try_get::<String, _>("aggregate_id").map_err(backend)?)
                .map_err(corrupted)?,
            aggregate_type: AggregateType::new(row.try_get::<String, _>("aggregate_type").map_err(backend)?)
                .map_err(corrupted)?,
            aggregate_version: from_db_version(row.try_get("aggregate_version").map_err(backend)?)?,
            agent: Agent::from_parts(&agent_type, agent_id.as_deref()).map_err(corrupted)?,
            date: row.try_get("date").map_err(backend)?,
            is_snapshot: row.try_get("is_snapshot").map_err(backend)?,
        },
        event: SerializedEvent::new(
            EventName::new(row.try_get::<String, _>("event_name").map_err(backend)?).map_err(corrupted)?,
            from_db_version(row.try_get("event_version").map_err(backend)?)?,
            payload.0,
        ),
    })
}

fn outbox_entry_from_row(row: &PgRow) -> Result<MessagingOutboxEntry, StoreError> {
    let payload: sqlx::types::Json<Map<String, Value>> = row.try_get("payload").map_err(backend)?;
    let headers: sqlx::types::Json<BTreeMap<String, String>> = row.try_get("headers").map_err(backend)?;
    let lock_token: Option<Uuid> = row.try_get("lock_token").map_err(backend)?;
    let retry_count: i32 = row.try_get("retry_count").map_err(backend)?;

    Ok(MessagingOutboxEntry {
        id: row.try_get("id").map_err(backend)?,
        target: row.try_get("target").map_err(backend)?,
        routing_key: row.try_get("routing_key").map_err(backend)?,
        payload: payload.0,
        headers: headers.0,
        created_at: row.try_get("created_at").map_err(backend)?,
        locked_at: row.try_get("locked_at").map_err(backend)?,
        lock_token: lock_token.map(LockToken::from_uuid),
        acknowledged_at: row.try_get("acknowledged_at").map_err(backend)?,
        failed_at: row.try_get("failed_at").map_err(backend)?,
        retry_count: u32::try_from(retry_count).map_err(corrupted)?,
        last_error: row.try_get("last_error").map_err(backend)?,
    })
}

// ============================================================================
// Events
// ============================================================================

#[async_trait]
impl EventSourcingRepo for PostgresStore {
    async fn insert(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        for append in &batch.appends {
            append.validate()?;
            let Some(new_version) = append.new_version() else {
                continue;
            };
            let conflict = || StoreError::Conflict {
                aggregate_id: append.aggregate_id.clone(),
                aggregate_type: append.aggregate_type.clone(),
                expected: append.expected_version,
            };

            let advanced = Self::advance_head(
                &mut tx,
                &append.aggregate_id,
                &append.aggregate_type,
                append.expected_version,
                new_version,
            )
            .await
            .map_err(backend)?;
            if !advanced {
                return Err(conflict());
            }

            for record in &append.events {
                Self::insert_event(&mut tx, record).await.map_err(|e| match e.as_database_error() {
                    Some(db_err) if db_err.is_unique_violation() => conflict(),
                    _ => backend(e),
                })?;
            }
        }

        for snapshot in &batch.snapshots {
            if !Self::write_snapshot(&mut tx, snapshot).await? {
                tracing::debug!(
                    aggregate_id = %snapshot.metadata.aggregate_id,
                    version = %snapshot.metadata.aggregate_version,
                    "Skipping snapshot superseded by a newer one"
                );
            }
        }

        for entry in &batch.outbox {
            Self::insert_outbox_entry(&mut tx, entry).await?;
        }

        // Dropping an uncommitted transaction rolls it back
        tx.commit().await.map_err(backend)?;
        Ok(())
    }

    async fn find_nearest_snapshot_event(
        &self,
        aggregate_id: &AggregateId,
        aggregate_type: &AggregateType,
        version: Version,
    ) -> Result<Option<EventRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM events WHERE aggregate_type = $1 AND aggregate_id = $2 \
             AND aggregate_version <= $3 AND is_snapshot ORDER BY aggregate_version DESC LIMIT 1",
            EVENT_COLUMNS
        ))
        .bind(aggregate_type.as_str())
        .bind(aggregate_id.as_str())
        .bind(to_db_version(version))
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.as_ref().map(event_from_row).transpose()
    }

    async fn find_latest_snapshot_event(
        &self,
        aggregate_id: &AggregateId,
        aggregate_type: &AggregateType,
    ) -> Result<Option<EventRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM events WHERE aggregate_type = $1 AND aggregate_id = $2 \
             AND is_snapshot ORDER BY aggregate_version DESC LIMIT 1",
            EVENT_COLUMNS
        ))
        .bind(aggregate_type.as_str())
        .bind(aggregate_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.as_ref().map(event_from_row).transpose()
    }

    async fn find_events(
        &self,
        aggregate_id: &AggregateId,
        aggregate_type: &AggregateType,
        from: Version,
    ) -> Result<Vec<EventRecord>, StoreError> {
        self.query_events(aggregate_id, aggregate_type, "aggregate_version >= $3", from)
            .await
    }

    async fn find_events_until_version(
        &self,
        aggregate_id: &AggregateId,
        aggregate_type: &AggregateType,
        until: Version,
    ) -> Result<Vec<EventRecord>, StoreError> {
        self.query_events(aggregate_id, aggregate_type, "aggregate_version <= $3", until)
            .await
    }

    async fn remove_events_until_version(
        &self,
        aggregate_id: &AggregateId,
        aggregate_type: &AggregateType,
        until: Version,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM events WHERE aggregate_type = $1 AND aggregate_id = $2 AND aggregate_version <= $3",
        )
        .bind(aggregate_type.as_str())
        .bind(aggregate_id.as_str())
        .bind(to_db_version(until))
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected())
    }

    async fn find_current_version(
        &self,
        aggregate_id: &AggregateId,
        aggregate_type: &AggregateType,
    ) -> Result<Option<Version>, StoreError> {
        let head: Option<i64> =
            sqlx::query_scalar("SELECT version FROM aggregate_heads WHERE aggregate_type = $1 AND aggregate_id = $2")
                .bind(aggregate_type.as_str())
                .bind(aggregate_id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?;
        head.map(from_db_version).transpose()
    }
}

// ============================================================================
// Outbox
// ============================================================================

#[async_trait]
impl MessagingOutboxRepo for PostgresStore {
    async fn insert(&self, entries: Vec<MessagingOutboxEntry>) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        for entry in &entries {
            Self::insert_outbox_entry(&mut tx, entry).await?;
        }
        tx.commit().await.map_err(backend)?;
        Ok(())
    }

    async fn save(&self, entry: &MessagingOutboxEntry, lock: &LockToken) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE messaging_outbox SET locked_at = $2, lock_token = $3, acknowledged_at = $4, \
             failed_at = $5, retry_count = $6, last_error = $7 WHERE id = $1 AND lock_token = $8",
        )
        .bind(entry.id)
        .bind(entry.locked_at)
        .bind(entry.lock_token.map(|token| token.as_uuid()))
        .bind(entry.acknowledged_at)
        .bind(entry.failed_at)
        .bind(entry.retry_count as i32)
        .bind(entry.last_error.as_deref())
        .bind(lock.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected() == 1)
    }

    async fn lock_next_publishable_entries(
        &self,
        token: &LockToken,
        max_entries: usize,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let result = sqlx::query(
            "UPDATE messaging_outbox SET lock_token = $1, locked_at = $2 WHERE id IN ( \
                SELECT id FROM messaging_outbox \
                WHERE lock_token IS NULL AND acknowledged_at IS NULL \
                ORDER BY created_at, id LIMIT $3 \
                FOR UPDATE SKIP LOCKED)",
        )
        .bind(token.as_uuid())
        .bind(now)
        .bind(i64::try_from(max_entries).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected() as usize)
    }

    async fn find_locked_entries(&self, token: &LockToken) -> Result<Vec<MessagingOutboxEntry>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM messaging_outbox WHERE lock_token = $1 ORDER BY created_at, id",
            OUTBOX_COLUMNS
        ))
        .bind(token.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(outbox_entry_from_row).collect()
    }

    async fn unlock_entries_older_than(&self, date: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE messaging_outbox SET lock_token = NULL, locked_at = NULL \
             WHERE locked_at IS NOT NULL AND locked_at < $1",
        )
        .bind(date)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected())
    }

    async fn remove_acknowledged_entries_older_than(&self, date: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM messaging_outbox WHERE acknowledged_at < $1")
            .bind(date)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected())
    }

    async fn find_failed_entries_older_than(
        &self,
        date: DateTime<Utc>,
    ) -> Result<Vec<MessagingOutboxEntry>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM messaging_outbox WHERE failed_at < $1 AND acknowledged_at IS NULL \
             ORDER BY created_at, id",
            OUTBOX_COLUMNS
        ))
        .bind(date)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(outbox_entry_from_row).collect()
    }

    async fn watch_inserts(&self) -> Result<BoxStream<'static, Result<Uuid, StoreError>>, StoreError> {
        let mut listener = PgListener::connect_with(&self.pool).await.map_err(backend)?;
        listener.listen(OUTBOX_INSERTS_CHANNEL).await.map_err(backend)?;

        Ok(listener
            .into_stream()
            .map(|notification| {
                let notification = notification.map_err(backend)?;
                Uuid::parse_str(notification.payload()).map_err(corrupted)
            })
            .boxed())
    }
}

// ============================================================================
// Inbox
// ============================================================================

#[async_trait]
impl IncomingMessageRepo for PostgresStore {
    async fn insert(&self, message: IncomingMessage) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO messaging_inbox (id, received_at) VALUES ($1, $2)")
            .bind(message.id.as_str())
            .bind(message.received_at)
            .execute(&self.pool)
            .await
            .map_err(|e| duplicate_or_backend(e, format!("incoming message {}", message.id)))?;
        Ok(())
    }

    async fn exists(&self, id: &IncomingMessageId) -> Result<bool, StoreError> {
        sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM messaging_inbox WHERE id = $1)")
            .bind(id.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(backend)
    }

    async fn remove(&self, id: &IncomingMessageId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM messaging_inbox WHERE id = $1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versions_map_to_bigint() {
        assert_eq!(to_db_version(Version::new(42)), 42);
        assert_eq!(from_db_version(42).unwrap(), Version::new(42));
        assert!(matches!(from_db_version(-1), Err(StoreError::Corrupted(_))));
    }

    #[test]
    fn test_schema_covers_every_table() {
        let schema = SCHEMA.join("\n");
        for table in ["aggregate_heads", "events", "messaging_outbox", "messaging_inbox"] {
            assert!(schema.contains(&format!("CREATE TABLE IF NOT EXISTS {} ", table)));
        }
    }
}
