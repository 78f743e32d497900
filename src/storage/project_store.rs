//! Project persistence.

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;

use crate::database::{Database, StorageError, StorageResult};
use crate::domain::{AgentSelector, ChannelId, Project, ProjectId};

mod sql {
    pub(super) fn create_table() -> &'static str {
        "CREATE TABLE IF NOT EXISTS projects (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            channel_id TEXT NOT NULL UNIQUE,
            agent_id TEXT NOT NULL,
            local_path TEXT NOT NULL,
            default_model TEXT NOT NULL,
            default_max_budget REAL,
            deploy_platform_id TEXT,
            auto_commit_push INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )"
    }

    pub(super) fn upsert() -> &'static str {
        "INSERT INTO projects (
            id, name, channel_id, agent_id, local_path, default_model,
            default_max_budget, deploy_platform_id, auto_commit_push,
            created_at, updated_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(channel_id) DO UPDATE SET
            name = excluded.name,
            agent_id = excluded.agent_id,
            local_path = excluded.local_path,
            default_model = excluded.default_model,
            default_max_budget = excluded.default_max_budget,
            deploy_platform_id = excluded.deploy_platform_id,
            auto_commit_push = excluded.auto_commit_push,
            updated_at = excluded.updated_at"
    }

    pub(super) fn select_by_channel() -> &'static str {
        "SELECT * FROM projects WHERE channel_id = ?"
    }

    pub(super) fn select_by_id() -> &'static str {
        "SELECT * FROM projects WHERE id = ?"
    }

    pub(super) fn select_all() -> &'static str {
        "SELECT * FROM projects ORDER BY name ASC"
    }
}

mod mapping {
    use super::{
        AgentSelector, ChannelId, Project, ProjectId, Row, SqliteRow, StorageError, StorageResult,
        Uuid,
    };
    use chrono::{DateTime, Utc};

    fn corrupt(reason: impl Into<String>) -> StorageError {
        StorageError::CorruptRow {
            table: "projects".to_string(),
            reason: reason.into(),
        }
    }

    pub(super) fn row_to_project(row: &SqliteRow) -> StorageResult<Project> {
        let id: String = row.get("id");
        let channel: String = row.get("channel_id");
        let agent: String = row.get("agent_id");
        Ok(Project {
            id: ProjectId::new(
                Uuid::parse_str(&id).map_err(|e| corrupt(format!("id: {e}")))?,
            ),
            name: row.get("name"),
            channel_id: ChannelId::try_new(channel)
                .map_err(|e| corrupt(format!("channel_id: {e}")))?,
            agent: AgentSelector::parse(&agent)
                .ok_or_else(|| corrupt(format!("agent_id: {agent}")))?,
            local_path: row.get("local_path"),
            default_model: row.get("default_model"),
            default_max_budget: row.get("default_max_budget"),
            deploy_platform_id: row.get("deploy_platform_id"),
            auto_commit_push: row.get::<i64, _>("auto_commit_push") != 0,
            created_at: row.get::<DateTime<Utc>, _>("created_at"),
            updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
        })
    }
}

/// Project row store.
#[derive(Clone)]
pub struct ProjectStore {
    db: Database,
}

impl ProjectStore {
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

    /// Inserts or updates a project, keyed by its unique channel.
    pub async fn upsert(&self, project: &Project) -> StorageResult<()> {
        sqlx::query(sql::upsert())
            .bind(project.id.to_string())
            .bind(&project.name)
            .bind(project.channel_id.as_str())
            .bind(project.agent.as_str())
            .bind(&project.local_path)
            .bind(&project.default_model)
            .bind(project.default_max_budget)
            .bind(&project.deploy_platform_id)
            .bind(i64::from(project.auto_commit_push))
            .bind(project.created_at)
            .bind(project.updated_at)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Resolves the project configured for a channel.
    pub async fn find_by_channel(&self, channel: &ChannelId) -> StorageResult<Option<Project>> {
        let row = sqlx::query(sql::select_by_channel())
            .bind(channel.as_str())
            .fetch_optional(self.db.pool())
            .await?;
        row.as_ref().map(mapping::row_to_project).transpose()
    }

    /// Loads a project by id.
    pub async fn get(&self, id: ProjectId) -> StorageResult<Option<Project>> {
        let row = sqlx::query(sql::select_by_id())
            .bind(id.to_string())
            .fetch_optional(self.db.pool())
            .await?;
        row.as_ref().map(mapping::row_to_project).transpose()
    }

    /// Loads a project, erroring when absent.
    pub async fn require(&self, id: ProjectId) -> StorageResult<Project> {
        self.get(id).await?.ok_or_else(|| StorageError::NotFound {
            resource: "project".to_string(),
            id: id.to_string(),
        })
    }

    /// All configured projects.
    pub async fn list(&self) -> StorageResult<Vec<Project>> {
        let rows = sqlx::query(sql::select_all())
            .fetch_all(self.db.pool())
            .await?;
        rows.iter().map(mapping::row_to_project).collect()
    }
}
