//! Task persistence.
//!
//! The store is the sole writer of task rows. Terminal updates are guarded
//! by a `WHERE status IN (...)` clause so a late or duplicate frame can
//! never rewrite a terminal row; callers read the affected-row count to
//! distinguish "applied" from "already terminal".

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;

use crate::database::{Database, StorageError, StorageResult};
use crate::domain::{
    AgentId, BotName, ChannelId, ChatUserId, ProjectId, Task, TaskId, TaskStatus,
};

mod sql {
    pub(super) fn create_table() -> &'static str {
        "CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            bot_name TEXT NOT NULL,
            command TEXT NOT NULL,
            prompt TEXT NOT NULL,
            status TEXT NOT NULL,
            result TEXT,
            error_message TEXT,
            channel_id TEXT NOT NULL,
            thread_ts TEXT,
            user_id TEXT NOT NULL,
            message_ts TEXT,
            session_id TEXT,
            input_tokens INTEGER NOT NULL DEFAULT 0,
            output_tokens INTEGER NOT NULL DEFAULT 0,
            estimated_cost REAL NOT NULL DEFAULT 0,
            max_budget REAL,
            files_changed TEXT NOT NULL DEFAULT '[]',
            commands_run TEXT NOT NULL DEFAULT '[]',
            parent_task_id TEXT,
            agent_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            completed_at TEXT
        )"
    }

    pub(super) fn create_project_index() -> &'static str {
        "CREATE INDEX IF NOT EXISTS idx_tasks_project_created
         ON tasks (project_id, created_at DESC)"
    }

    pub(super) fn create_parent_index() -> &'static str {
        "CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks (parent_task_id)"
    }

    pub(super) fn insert() -> &'static str {
        "INSERT INTO tasks (
            id, project_id, bot_name, command, prompt, status, result,
            error_message, channel_id, thread_ts, user_id, message_ts,
            session_id, input_tokens, output_tokens, estimated_cost,
            max_budget, files_changed, commands_run, parent_task_id,
            agent_id, created_at, updated_at, completed_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    }

    pub(super) fn select_by_id() -> &'static str {
        "SELECT * FROM tasks WHERE id = ?"
    }

    pub(super) fn select_children() -> &'static str {
        "SELECT * FROM tasks WHERE parent_task_id = ? ORDER BY created_at ASC"
    }

    pub(super) fn select_recent_by_project() -> &'static str {
        "SELECT * FROM tasks WHERE project_id = ? ORDER BY created_at DESC LIMIT ?"
    }

    pub(super) fn update_status_guarded() -> &'static str {
        "UPDATE tasks SET status = ?, updated_at = ?
         WHERE id = ? AND status IN (?, ?)"
    }

    pub(super) fn update_agent() -> &'static str {
        "UPDATE tasks SET agent_id = ?, updated_at = ? WHERE id = ?"
    }

    pub(super) fn update_session() -> &'static str {
        "UPDATE tasks SET session_id = ?, updated_at = ? WHERE id = ?"
    }

    pub(super) fn complete_guarded() -> &'static str {
        "UPDATE tasks SET
            status = 'completed', result = ?, session_id = COALESCE(?, session_id),
            input_tokens = ?, output_tokens = ?, estimated_cost = ?,
            files_changed = ?, commands_run = ?, updated_at = ?, completed_at = ?
         WHERE id = ? AND status = 'running'"
    }

    pub(super) fn fail_guarded() -> &'static str {
        "UPDATE tasks SET
            status = 'failed', error_message = ?,
            session_id = COALESCE(?, session_id), updated_at = ?, completed_at = ?
         WHERE id = ? AND status = 'running'"
    }

    pub(super) fn cancel_guarded() -> &'static str {
        "UPDATE tasks SET
            status = 'cancelled', error_message = COALESCE(?, error_message),
            updated_at = ?, completed_at = ?
         WHERE id = ? AND status IN ('pending', 'queued', 'running')"
    }
}

mod mapping {
    use super::{
        AgentId, BotName, ChannelId, ChatUserId, ProjectId, Row, SqliteRow, StorageError,
        StorageResult, Task, TaskId, TaskStatus, Uuid,
    };
    use chrono::{DateTime, Utc};

    fn corrupt(reason: impl Into<String>) -> StorageError {
        StorageError::CorruptRow {
            table: "tasks".to_string(),
            reason: reason.into(),
        }
    }

    pub(super) fn parse_uuid(s: &str, field: &str) -> StorageResult<Uuid> {
        Uuid::parse_str(s).map_err(|e| corrupt(format!("{field}: {e}")))
    }

    pub(super) fn string_set_to_json(set: &[String]) -> String {
        serde_json::to_string(set).unwrap_or_else(|_| "[]".to_string())
    }

    pub(super) fn json_to_string_set(raw: &str) -> Vec<String> {
        serde_json::from_str(raw).unwrap_or_default()
    }

    pub(super) fn row_to_task(row: &SqliteRow) -> StorageResult<Task> {
        let id: String = row.get("id");
        let project_id: String = row.get("project_id");
        let bot_name: String = row.get("bot_name");
        let status: String = row.get("status");
        let channel_id: String = row.get("channel_id");
        let user_id: String = row.get("user_id");
        let parent: Option<String> = row.get("parent_task_id");
        let agent: Option<String> = row.get("agent_id");
        let files_changed: String = row.get("files_changed");
        let commands_run: String = row.get("commands_run");

        Ok(Task {
            id: TaskId::new(parse_uuid(&id, "id")?),
            project_id: ProjectId::new(parse_uuid(&project_id, "project_id")?),
            bot_name: BotName::try_new(bot_name).map_err(|e| corrupt(format!("bot_name: {e}")))?,
            command: row.get("command"),
            prompt: row.get("prompt"),
            status: TaskStatus::parse(&status).map_err(|e| corrupt(e.to_string()))?,
            result: row.get("result"),
            error_message: row.get("error_message"),
            channel_id: ChannelId::try_new(channel_id)
                .map_err(|e| corrupt(format!("channel_id: {e}")))?,
            thread_ts: row.get("thread_ts"),
            user_id: ChatUserId::try_new(user_id).map_err(|e| corrupt(format!("user_id: {e}")))?,
            message_ts: row.get("message_ts"),
            session_id: row.get("session_id"),
            input_tokens: row.get("input_tokens"),
            output_tokens: row.get("output_tokens"),
            estimated_cost: row.get("estimated_cost"),
            max_budget: row.get("max_budget"),
            files_changed: json_to_string_set(&files_changed),
            commands_run: json_to_string_set(&commands_run),
            parent_task_id: parent
                .map(|p| parse_uuid(&p, "parent_task_id").map(TaskId::new))
                .transpose()?,
            agent_id: agent
                .map(|a| AgentId::try_new(a).map_err(|e| corrupt(format!("agent_id: {e}"))))
                .transpose()?,
            created_at: row.get::<DateTime<Utc>, _>("created_at"),
            updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
            completed_at: row.get::<Option<DateTime<Utc>>, _>("completed_at"),
        })
    }
}

/// Terminal metrics written with a completion.
#[derive(Debug, Clone)]
pub struct CompletionUpdate {
    pub result: String,
    pub session_id: Option<String>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub estimated_cost: f64,
    pub files_changed: Vec<String>,
    pub commands_run: Vec<String>,
}

/// Task row store.
#[derive(Clone)]
pub struct TaskStore {
    db: Database,
}

impl TaskStore {
    /// Creates the store over a database handle.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Creates the table and indexes if missing.
    pub async fn ensure_schema(&self) -> StorageResult<()> {
        sqlx::query(sql::create_table()).execute(self.db.pool()).await?;
        sqlx::query(sql::create_project_index())
            .execute(self.db.pool())
            .await?;
        sqlx::query(sql::create_parent_index())
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Persists a freshly created task.
    pub async fn insert(&self, task: &Task) -> StorageResult<()> {
        sqlx::query(sql::insert())
            .bind(task.id.to_string())
            .bind(task.project_id.to_string())
            .bind(task.bot_name.as_str())
            .bind(&task.command)
            .bind(&task.prompt)
            .bind(task.status.as_str())
            .bind(&task.result)
            .bind(&task.error_message)
            .bind(task.channel_id.as_str())
            .bind(&task.thread_ts)
            .bind(task.user_id.as_str())
            .bind(&task.message_ts)
            .bind(&task.session_id)
            .bind(task.input_tokens)
            .bind(task.output_tokens)
            .bind(task.estimated_cost)
            .bind(task.max_budget)
            .bind(mapping::string_set_to_json(&task.files_changed))
            .bind(mapping::string_set_to_json(&task.commands_run))
            .bind(task.parent_task_id.map(|p| p.to_string()))
            .bind(task.agent_id.as_ref().map(|a| a.as_str().to_string()))
            .bind(task.created_at)
            .bind(task.updated_at)
            .bind(task.completed_at)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Loads a task by id.
    pub async fn get(&self, id: TaskId) -> StorageResult<Option<Task>> {
        let row = sqlx::query(sql::select_by_id())
            .bind(id.to_string())
            .fetch_optional(self.db.pool())
            .await?;
        row.as_ref().map(mapping::row_to_task).transpose()
    }

    /// Loads a task, erroring when absent.
    pub async fn require(&self, id: TaskId) -> StorageResult<Task> {
        self.get(id).await?.ok_or_else(|| StorageError::NotFound {
            resource: "task".to_string(),
            id: id.to_string(),
        })
    }

    /// All children of a decomposition parent, in creation order.
    pub async fn children_of(&self, parent: TaskId) -> StorageResult<Vec<Task>> {
        let rows = sqlx::query(sql::select_children())
            .bind(parent.to_string())
            .fetch_all(self.db.pool())
            .await?;
        rows.iter().map(mapping::row_to_task).collect()
    }

    /// Recent tasks for a project, newest first.
    pub async fn recent_by_project(
        &self,
        project: ProjectId,
        limit: i64,
    ) -> StorageResult<Vec<Task>> {
        let rows = sqlx::query(sql::select_recent_by_project())
            .bind(project.to_string())
            .bind(limit)
            .fetch_all(self.db.pool())
            .await?;
        rows.iter().map(mapping::row_to_task).collect()
    }

    /// Moves `pending → queued`. Returns false when the guard rejected it.
    pub async fn mark_queued(&self, id: TaskId) -> StorageResult<bool> {
        let affected = sqlx::query(sql::update_status_guarded())
            .bind(TaskStatus::Queued.as_str())
            .bind(Utc::now())
            .bind(id.to_string())
            .bind(TaskStatus::Pending.as_str())
            .bind(TaskStatus::Pending.as_str())
            .execute(self.db.pool())
            .await?
            .rows_affected();
        Ok(affected > 0)
    }

    /// Moves `pending|queued → running`. Returns false when the guard
    /// rejected it (already running or terminal).
    pub async fn mark_running(&self, id: TaskId) -> StorageResult<bool> {
        let affected = sqlx::query(sql::update_status_guarded())
            .bind(TaskStatus::Running.as_str())
            .bind(Utc::now())
            .bind(id.to_string())
            .bind(TaskStatus::Pending.as_str())
            .bind(TaskStatus::Queued.as_str())
            .execute(self.db.pool())
            .await?
            .rows_affected();
        Ok(affected > 0)
    }

    /// Records the agent a task was dispatched or queued to.
    pub async fn set_agent(&self, id: TaskId, agent: &AgentId) -> StorageResult<()> {
        sqlx::query(sql::update_agent())
            .bind(agent.as_str())
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Persists a session id as soon as it is known, ahead of any terminal
    /// write, so resume is always possible.
    pub async fn set_session_id(&self, id: TaskId, session_id: &str) -> StorageResult<()> {
        sqlx::query(sql::update_session())
            .bind(session_id)
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Terminal success write, guarded on `running`. Returns false when the
    /// row was not in `running` (duplicate or late frame).
    pub async fn complete(&self, id: TaskId, update: &CompletionUpdate) -> StorageResult<bool> {
        let now = Utc::now();
        let affected = sqlx::query(sql::complete_guarded())
            .bind(&update.result)
            .bind(&update.session_id)
            .bind(update.input_tokens)
            .bind(update.output_tokens)
            .bind(update.estimated_cost)
            .bind(mapping::string_set_to_json(&update.files_changed))
            .bind(mapping::string_set_to_json(&update.commands_run))
            .bind(now)
            .bind(now)
            .bind(id.to_string())
            .execute(self.db.pool())
            .await?
            .rows_affected();
        Ok(affected > 0)
    }

    /// Terminal failure write, guarded on `running`. The session id, when
    /// supplied, survives the failure.
    pub async fn fail(
        &self,
        id: TaskId,
        error: &str,
        session_id: Option<&str>,
    ) -> StorageResult<bool> {
        let now = Utc::now();
        let affected = sqlx::query(sql::fail_guarded())
            .bind(error)
            .bind(session_id)
            .bind(now)
            .bind(now)
            .bind(id.to_string())
            .execute(self.db.pool())
            .await?
            .rows_affected();
        Ok(affected > 0)
    }

    /// Terminal cancellation write, allowed from any non-terminal status.
    pub async fn cancel(&self, id: TaskId, reason: Option<&str>) -> StorageResult<bool> {
        let now = Utc::now();
        let affected = sqlx::query(sql::cancel_guarded())
            .bind(reason)
            .bind(now)
            .bind(now)
            .bind(id.to_string())
            .execute(self.db.pool())
            .await?
            .rows_affected();
        Ok(affected > 0)
    }
}
