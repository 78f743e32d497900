//! Append-only audit log.

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use crate::database::{Database, StorageResult};

mod sql {
    pub(super) fn create_table() -> &'static str {
        "CREATE TABLE IF NOT EXISTS audit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            action TEXT NOT NULL,
            resource_type TEXT NOT NULL,
            resource_id TEXT NOT NULL,
            user_id TEXT,
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL
        )"
    }

    pub(super) fn insert() -> &'static str {
        "INSERT INTO audit_log (action, resource_type, resource_id, user_id, metadata, created_at)
         VALUES (?, ?, ?, ?, ?, ?)"
    }

    pub(super) fn select_recent() -> &'static str {
        "SELECT * FROM audit_log ORDER BY id DESC LIMIT ?"
    }
}

/// One immutable audit row.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub id: i64,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub user_id: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

fn row_to_entry(row: &SqliteRow) -> AuditEntry {
    let metadata: String = row.get("metadata");
    AuditEntry {
        id: row.get("id"),
        action: row.get("action"),
        resource_type: row.get("resource_type"),
        resource_id: row.get("resource_id"),
        user_id: row.get("user_id"),
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
    }
}

/// Audit log store. Rows are never mutated after insert.
#[derive(Clone)]
pub struct AuditStore {
    db: Database,
}

impl AuditStore {
    /// Creates the store over a database handle.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Creates the table if missing.
    pub async fn ensure_schema(&self) -> StorageResult<()> {
        sqlx::query(sql::create_table()).execute(self.db.pool()).await?;
        Ok(())
    }

    /// Appends one entry.
    pub async fn record(
        &self,
        action: &str,
        resource_type: &str,
        resource_id: &str,
        user_id: Option<&str>,
        metadata: serde_json::Value,
    ) -> StorageResult<()> {
        sqlx::query(sql::insert())
            .bind(action)
            .bind(resource_type)
            .bind(resource_id)
            .bind(user_id)
            .bind(metadata.to_string())
            .bind(Utc::now())
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// The most recent entries, newest first.
    pub async fn recent(&self, limit: i64) -> StorageResult<Vec<AuditEntry>> {
        let rows = sqlx::query(sql::select_recent())
            .bind(limit)
            .fetch_all(self.db.pool())
            .await?;
        Ok(rows.iter().map(row_to_entry).collect())
    }
}
