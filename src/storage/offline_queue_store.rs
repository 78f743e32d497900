//! Durable per-agent outbox rows.
//!
//! At-least-once with ordered redelivery: pending scans are insertion
//! ordered via the auto-increment id, a delivered row is never redelivered,
//! and the expiry sweep only ever touches undelivered rows.

use chrono::{DateTime, Duration, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use crate::database::{Database, StorageError, StorageResult};
use crate::domain::AgentId;

mod sql {
    pub(super) fn create_table() -> &'static str {
        "CREATE TABLE IF NOT EXISTS offline_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            agent_id TEXT NOT NULL,
            message_type TEXT NOT NULL,
            payload BLOB NOT NULL,
            created_at TEXT NOT NULL,
            expires_at TEXT NOT NULL,
            delivered INTEGER NOT NULL DEFAULT 0,
            delivered_at TEXT
        )"
    }

    pub(super) fn create_agent_index() -> &'static str {
        "CREATE INDEX IF NOT EXISTS idx_offline_agent_delivered
         ON offline_queue (agent_id, delivered)"
    }

    pub(super) fn create_expiry_index() -> &'static str {
        "CREATE INDEX IF NOT EXISTS idx_offline_expires ON offline_queue (expires_at)"
    }

    pub(super) fn insert() -> &'static str {
        "INSERT INTO offline_queue (agent_id, message_type, payload, created_at, expires_at, delivered)
         VALUES (?, ?, ?, ?, ?, 0)"
    }

    pub(super) fn select_pending_for_agent() -> &'static str {
        "SELECT * FROM offline_queue
         WHERE agent_id = ? AND delivered = 0 AND expires_at > ?
         ORDER BY id ASC"
    }

    pub(super) fn mark_delivered() -> &'static str {
        "UPDATE offline_queue SET delivered = 1, delivered_at = ?
         WHERE id = ? AND delivered = 0"
    }

    pub(super) fn delete_expired_undelivered() -> &'static str {
        "DELETE FROM offline_queue WHERE delivered = 0 AND expires_at <= ?"
    }

    pub(super) fn delete_delivered_before() -> &'static str {
        "DELETE FROM offline_queue WHERE delivered = 1 AND delivered_at <= ?"
    }

    pub(super) fn count_pending() -> &'static str {
        "SELECT agent_id, COUNT(*) AS pending FROM offline_queue
         WHERE delivered = 0 AND expires_at > ?
         GROUP BY agent_id"
    }
}

mod mapping {
    use super::{AgentId, DateTime, OfflineQueueEntry, Row, SqliteRow, StorageError, StorageResult, Utc};

    pub(super) fn row_to_entry(row: &SqliteRow) -> StorageResult<OfflineQueueEntry> {
        let agent_id: String = row.get("agent_id");
        Ok(OfflineQueueEntry {
            id: row.get("id"),
            agent_id: AgentId::try_new(agent_id).map_err(|e| StorageError::CorruptRow {
                table: "offline_queue".to_string(),
                reason: format!("agent_id: {e}"),
            })?,
            message_type: row.get("message_type"),
            payload: row.get("payload"),
            created_at: row.get::<DateTime<Utc>, _>("created_at"),
            expires_at: row.get::<DateTime<Utc>, _>("expires_at"),
            delivered: row.get::<i64, _>("delivered") != 0,
            delivered_at: row.get::<Option<DateTime<Utc>>, _>("delivered_at"),
        })
    }
}

/// One durable outbox row.
#[derive(Debug, Clone)]
pub struct OfflineQueueEntry {
    pub id: i64,
    pub agent_id: AgentId,
    pub message_type: String,
    /// Opaque encoded frame bytes.
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub delivered: bool,
    pub delivered_at: Option<DateTime<Utc>>,
}

/// Offline-queue row store.
#[derive(Clone)]
pub struct OfflineQueueStore {
    db: Database,
}

impl OfflineQueueStore {
    /// Creates the store over a database handle.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Creates the table and indexes if missing.
    pub async fn ensure_schema(&self) -> StorageResult<()> {
        sqlx::query(sql::create_table()).execute(self.db.pool()).await?;
        sqlx::query(sql::create_agent_index())
            .execute(self.db.pool())
            .await?;
        sqlx::query(sql::create_expiry_index())
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Appends an encoded frame for an agent with the given TTL.
    pub async fn enqueue(
        &self,
        agent: &AgentId,
        message_type: &str,
        payload: &[u8],
        ttl: std::time::Duration,
    ) -> StorageResult<i64> {
        let now = Utc::now();
        let expires_at = now
            + Duration::from_std(ttl).unwrap_or_else(|_| Duration::seconds(86_400));
        let result = sqlx::query(sql::insert())
            .bind(agent.as_str())
            .bind(message_type)
            .bind(payload)
            .bind(now)
            .bind(expires_at)
            .execute(self.db.pool())
            .await?;
        Ok(result.last_insert_rowid())
    }

    /// Undelivered, unexpired rows for one agent in insertion order.
    pub async fn find_pending_by_agent(
        &self,
        agent: &AgentId,
    ) -> StorageResult<Vec<OfflineQueueEntry>> {
        let rows = sqlx::query(sql::select_pending_for_agent())
            .bind(agent.as_str())
            .bind(Utc::now())
            .fetch_all(self.db.pool())
            .await?;
        rows.iter().map(mapping::row_to_entry).collect()
    }

    /// Marks a row delivered exactly once. Returns false when the row was
    /// already delivered (or gone).
    pub async fn mark_delivered(&self, id: i64) -> StorageResult<bool> {
        let affected = sqlx::query(sql::mark_delivered())
            .bind(Utc::now())
            .bind(id)
            .execute(self.db.pool())
            .await?
            .rows_affected();
        Ok(affected > 0)
    }

    /// Deletes undelivered rows past their TTL. Delivered rows are kept for
    /// audit inside `retention` and dropped afterwards.
    pub async fn clean_expired(&self, retention: std::time::Duration) -> StorageResult<u64> {
        let now = Utc::now();
        let expired = sqlx::query(sql::delete_expired_undelivered())
            .bind(now)
            .execute(self.db.pool())
            .await?
            .rows_affected();
        let cutoff =
            now - Duration::from_std(retention).unwrap_or_else(|_| Duration::days(7));
        sqlx::query(sql::delete_delivered_before())
            .bind(cutoff)
            .execute(self.db.pool())
            .await?;
        Ok(expired)
    }

    /// Pending counts per agent, for the admin surface.
    pub async fn pending_counts(&self) -> StorageResult<Vec<(AgentId, i64)>> {
        let rows = sqlx::query(sql::count_pending())
            .bind(Utc::now())
            .fetch_all(self.db.pool())
            .await?;
        rows.iter()
            .map(|row| {
                let agent: String = row.get("agent_id");
                let pending: i64 = row.get("pending");
                AgentId::try_new(agent)
                    .map(|a| (a, pending))
                    .map_err(|e| StorageError::CorruptRow {
                        table: "offline_queue".to_string(),
                        reason: format!("agent_id: {e}"),
                    })
            })
            .collect()
    }
}
