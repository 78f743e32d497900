//! AI session persistence and expiry sweep.

use chrono::{DateTime, Duration, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;

use crate::database::{Database, StorageError, StorageResult};
use crate::domain::{AgentId, SessionRecord, SessionStatus, TaskId};

mod sql {
    pub(super) fn create_table() -> &'static str {
        "CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL,
            agent_id TEXT NOT NULL,
            model TEXT NOT NULL,
            input_tokens INTEGER NOT NULL DEFAULT 0,
            output_tokens INTEGER NOT NULL DEFAULT 0,
            estimated_cost REAL NOT NULL DEFAULT 0,
            duration_ms INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            completed_at TEXT,
            expires_at TEXT NOT NULL,
            last_activity_at TEXT NOT NULL
        )"
    }

    pub(super) fn create_expiry_index() -> &'static str {
        "CREATE INDEX IF NOT EXISTS idx_sessions_expires ON sessions (expires_at)"
    }

    pub(super) fn upsert() -> &'static str {
        "INSERT INTO sessions (
            id, task_id, agent_id, model, input_tokens, output_tokens,
            estimated_cost, duration_ms, status, created_at, completed_at,
            expires_at, last_activity_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
            input_tokens = excluded.input_tokens,
            output_tokens = excluded.output_tokens,
            estimated_cost = excluded.estimated_cost,
            duration_ms = excluded.duration_ms,
            status = excluded.status,
            completed_at = excluded.completed_at,
            last_activity_at = excluded.last_activity_at"
    }

    pub(super) fn select_by_id() -> &'static str {
        "SELECT * FROM sessions WHERE id = ?"
    }

    pub(super) fn expire_stale() -> &'static str {
        "UPDATE sessions SET status = 'expired'
         WHERE expires_at <= ? AND status = 'active'"
    }
}

mod mapping {
    use super::{
        AgentId, Row, SessionRecord, SessionStatus, SqliteRow, StorageError, StorageResult,
        TaskId, Uuid,
    };
    use chrono::{DateTime, Utc};

    fn corrupt(reason: impl Into<String>) -> StorageError {
        StorageError::CorruptRow {
            table: "sessions".to_string(),
            reason: reason.into(),
        }
    }

    pub(super) fn row_to_session(row: &SqliteRow) -> StorageResult<SessionRecord> {
        let task_id: String = row.get("task_id");
        let agent_id: String = row.get("agent_id");
        let status: String = row.get("status");
        Ok(SessionRecord {
            id: row.get("id"),
            task_id: TaskId::new(
                Uuid::parse_str(&task_id).map_err(|e| corrupt(format!("task_id: {e}")))?,
            ),
            agent_id: AgentId::try_new(agent_id)
                .map_err(|e| corrupt(format!("agent_id: {e}")))?,
            model: row.get("model"),
            input_tokens: row.get("input_tokens"),
            output_tokens: row.get("output_tokens"),
            estimated_cost: row.get("estimated_cost"),
            duration_ms: row.get("duration_ms"),
            status: SessionStatus::parse(&status),
            created_at: row.get::<DateTime<Utc>, _>("created_at"),
            completed_at: row.get::<Option<DateTime<Utc>>, _>("completed_at"),
            expires_at: row.get::<DateTime<Utc>, _>("expires_at"),
            last_activity_at: row.get::<DateTime<Utc>, _>("last_activity_at"),
        })
    }
}

/// Session row store.
#[derive(Clone)]
pub struct SessionStore {
    db: Database,
}

impl SessionStore {
    /// Creates the store over a database handle.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Creates the table and index if missing.
    pub async fn ensure_schema(&self) -> StorageResult<()> {
        sqlx::query(sql::create_table()).execute(self.db.pool()).await?;
        sqlx::query(sql::create_expiry_index())
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Inserts or refreshes a session record by its SDK token.
    pub async fn upsert(&self, session: &SessionRecord) -> StorageResult<()> {
        sqlx::query(sql::upsert())
            .bind(&session.id)
            .bind(session.task_id.to_string())
            .bind(session.agent_id.as_str())
            .bind(&session.model)
            .bind(session.input_tokens)
            .bind(session.output_tokens)
            .bind(session.estimated_cost)
            .bind(session.duration_ms)
            .bind(session.status.as_str())
            .bind(session.created_at)
            .bind(session.completed_at)
            .bind(session.expires_at)
            .bind(session.last_activity_at)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Loads a session by SDK token.
    pub async fn get(&self, id: &str) -> StorageResult<Option<SessionRecord>> {
        let row = sqlx::query(sql::select_by_id())
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;
        row.as_ref().map(mapping::row_to_session).transpose()
    }

    /// Marks active sessions past their expiry. Returns the number swept.
    pub async fn expire_stale(&self) -> StorageResult<u64> {
        let affected = sqlx::query(sql::expire_stale())
            .bind(Utc::now())
            .execute(self.db.pool())
            .await?
            .rows_affected();
        Ok(affected)
    }
}

/// Builds a fresh active record for a newly reported session id.
#[must_use]
pub fn new_session(
    id: String,
    task_id: TaskId,
    agent_id: AgentId,
    model: String,
    ttl_secs: u64,
) -> SessionRecord {
    let now = Utc::now();
    SessionRecord {
        id,
        task_id,
        agent_id,
        model,
        input_tokens: 0,
        output_tokens: 0,
        estimated_cost: 0.0,
        duration_ms: 0,
        status: SessionStatus::Active,
        created_at: now,
        completed_at: None,
        expires_at: now + Duration::seconds(i64::try_from(ttl_secs).unwrap_or(86_400)),
        last_activity_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;

    #[tokio::test]
    async fn upsert_and_expiry_sweep() {
        let db = Database::in_memory().await.unwrap();
        let store = SessionStore::new(db);
        store.ensure_schema().await.unwrap();

        let mut stale = new_session(
            "sess-old".to_string(),
            TaskId::generate(),
            AgentId::try_new("worker-1".to_string()).unwrap(),
            "claude-sonnet-4".to_string(),
            3600,
        );
        stale.expires_at = Utc::now() - Duration::seconds(5);
        store.upsert(&stale).await.unwrap();

        let live = new_session(
            "sess-new".to_string(),
            TaskId::generate(),
            AgentId::try_new("worker-1".to_string()).unwrap(),
            "claude-sonnet-4".to_string(),
            3600,
        );
        store.upsert(&live).await.unwrap();

        assert_eq!(store.expire_stale().await.unwrap(), 1);
        let swept = store.get("sess-old").await.unwrap().unwrap();
        assert_eq!(swept.status, SessionStatus::Expired);
        let kept = store.get("sess-new").await.unwrap().unwrap();
        assert_eq!(kept.status, SessionStatus::Active);
    }
}
