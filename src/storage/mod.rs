//! Durable stores over the embedded SQLite database.
//!
//! Each store keeps the same split: a `sql` module of pure statement text,
//! a `mapping` module of pure row ↔ domain conversions, and an imperative
//! shell struct that executes against the pool. Every store exposes an
//! idempotent `ensure_schema` run once at startup.

pub mod api_key_store;
pub mod audit_store;
pub mod offline_queue_store;
pub mod project_store;
pub mod session_store;
pub mod task_store;
pub mod user_store;

pub use api_key_store::ApiKeyStore;
pub use audit_store::{AuditEntry, AuditStore};
pub use offline_queue_store::{OfflineQueueEntry, OfflineQueueStore};
pub use project_store::ProjectStore;
pub use session_store::SessionStore;
pub use task_store::TaskStore;
pub use user_store::UserStore;

use crate::database::{Database, StorageResult};

/// Bundles every store over one database handle.
#[derive(Clone)]
pub struct Stores {
    pub projects: ProjectStore,
    pub users: UserStore,
    pub tasks: TaskStore,
    pub sessions: SessionStore,
    pub audit: AuditStore,
    pub offline_queue: OfflineQueueStore,
    pub api_keys: ApiKeyStore,
}

impl Stores {
    /// Builds the store set and bootstraps every table.
    ///
    /// # Errors
    ///
    /// Returns the first schema bootstrap failure.
    pub async fn open(db: &Database) -> StorageResult<Self> {
        let stores = Self {
            projects: ProjectStore::new(db.clone()),
            users: UserStore::new(db.clone()),
            tasks: TaskStore::new(db.clone()),
            sessions: SessionStore::new(db.clone()),
            audit: AuditStore::new(db.clone()),
            offline_queue: OfflineQueueStore::new(db.clone()),
            api_keys: ApiKeyStore::new(db.clone()),
        };
        stores.projects.ensure_schema().await?;
        stores.users.ensure_schema().await?;
        stores.tasks.ensure_schema().await?;
        stores.sessions.ensure_schema().await?;
        stores.audit.ensure_schema().await?;
        stores.offline_queue.ensure_schema().await?;
        stores.api_keys.ensure_schema().await?;
        Ok(stores)
    }
}
