//! Chat user persistence. Users are upserted on first contact.

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;

use crate::database::{Database, StorageError, StorageResult};
use crate::domain::{ChatUserId, User, UserRole};

mod sql {
    pub(super) fn create_table() -> &'static str {
        "CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            chat_user_id TEXT NOT NULL UNIQUE,
            display_name TEXT NOT NULL,
            role TEXT NOT NULL,
            rate_limit_per_minute INTEGER,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )"
    }

    pub(super) fn upsert_on_contact() -> &'static str {
        "INSERT INTO users (id, chat_user_id, display_name, role, rate_limit_per_minute, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(chat_user_id) DO UPDATE SET
            display_name = excluded.display_name,
            updated_at = excluded.updated_at"
    }

    pub(super) fn select_by_chat_id() -> &'static str {
        "SELECT * FROM users WHERE chat_user_id = ?"
    }

    pub(super) fn update_role() -> &'static str {
        "UPDATE users SET role = ?, updated_at = ? WHERE chat_user_id = ?"
    }
}

mod mapping {
    use super::{ChatUserId, Row, SqliteRow, StorageError, StorageResult, User, UserRole, Uuid};
    use chrono::{DateTime, Utc};

    pub(super) fn row_to_user(row: &SqliteRow) -> StorageResult<User> {
        let id: String = row.get("id");
        let chat_user_id: String = row.get("chat_user_id");
        let role: String = row.get("role");
        let rate: Option<i64> = row.get("rate_limit_per_minute");
        Ok(User {
            id: Uuid::parse_str(&id).map_err(|e| StorageError::CorruptRow {
                table: "users".to_string(),
                reason: format!("id: {e}"),
            })?,
            chat_user_id: ChatUserId::try_new(chat_user_id).map_err(|e| {
                StorageError::CorruptRow {
                    table: "users".to_string(),
                    reason: format!("chat_user_id: {e}"),
                }
            })?,
            display_name: row.get("display_name"),
            role: UserRole::parse(&role),
            rate_limit_per_minute: rate.and_then(|r| u32::try_from(r).ok()),
            created_at: row.get::<DateTime<Utc>, _>("created_at"),
            updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
        })
    }
}

/// User row store.
#[derive(Clone)]
pub struct UserStore {
    db: Database,
}

impl UserStore {
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

    /// Upserts a user on first contact and returns the stored row. An
    /// existing row keeps its role and rate override; only the display name
    /// refreshes.
    pub async fn upsert_on_contact(
        &self,
        chat_user_id: &ChatUserId,
        display_name: &str,
    ) -> StorageResult<User> {
        let now = Utc::now();
        sqlx::query(sql::upsert_on_contact())
            .bind(Uuid::new_v4().to_string())
            .bind(chat_user_id.as_str())
            .bind(display_name)
            .bind(UserRole::Member.as_str())
            .bind(Option::<i64>::None)
            .bind(now)
            .bind(now)
            .execute(self.db.pool())
            .await?;
        self.require(chat_user_id).await
    }

    /// Loads a user by chat id.
    pub async fn find(&self, chat_user_id: &ChatUserId) -> StorageResult<Option<User>> {
        let row = sqlx::query(sql::select_by_chat_id())
            .bind(chat_user_id.as_str())
            .fetch_optional(self.db.pool())
            .await?;
        row.as_ref().map(mapping::row_to_user).transpose()
    }

    /// Loads a user, erroring when absent.
    pub async fn require(&self, chat_user_id: &ChatUserId) -> StorageResult<User> {
        self.find(chat_user_id)
            .await?
            .ok_or_else(|| StorageError::NotFound {
                resource: "user".to_string(),
                id: chat_user_id.as_str().to_string(),
            })
    }

    /// Changes a user's role.
    pub async fn set_role(&self, chat_user_id: &ChatUserId, role: UserRole) -> StorageResult<()> {
        sqlx::query(sql::update_role())
            .bind(role.as_str())
            .bind(Utc::now())
            .bind(chat_user_id.as_str())
            .execute(self.db.pool())
            .await?;
        Ok(())
    }
}
