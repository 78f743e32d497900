//! Api-key persistence for agent handshakes.
//!
//! Only SHA-256 digests of keys are stored. Validation walks the active
//! rows and compares digests in constant time; a key is bound to exactly
//! one agent id.

use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::Row;
use subtle::ConstantTimeEq;

use crate::database::{Database, StorageResult};
use crate::domain::AgentId;

mod sql {
    pub(super) fn create_table() -> &'static str {
        "CREATE TABLE IF NOT EXISTS api_keys (
            key_hash TEXT PRIMARY KEY,
            agent_id TEXT NOT NULL,
            label TEXT NOT NULL,
            revoked INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            last_used_at TEXT
        )"
    }

    pub(super) fn insert() -> &'static str {
        "INSERT INTO api_keys (key_hash, agent_id, label, revoked, created_at)
         VALUES (?, ?, ?, 0, ?)"
    }

    pub(super) fn select_active() -> &'static str {
        "SELECT key_hash, agent_id FROM api_keys WHERE revoked = 0"
    }

    pub(super) fn touch() -> &'static str {
        "UPDATE api_keys SET last_used_at = ? WHERE key_hash = ?"
    }

    pub(super) fn revoke() -> &'static str {
        "UPDATE api_keys SET revoked = 1 WHERE key_hash = ?"
    }
}

fn digest_hex(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Api-key store and validator.
#[derive(Clone)]
pub struct ApiKeyStore {
    db: Database,
}

impl ApiKeyStore {
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

    /// Registers a key for an agent. The plaintext key is hashed and
    /// discarded.
    pub async fn register(
        &self,
        key: &str,
        agent: &AgentId,
        label: &str,
    ) -> StorageResult<()> {
        sqlx::query(sql::insert())
            .bind(digest_hex(key))
            .bind(agent.as_str())
            .bind(label)
            .bind(Utc::now())
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Validates a presented key, yielding the bound agent id on success.
    /// Digest comparison is constant time.
    pub async fn validate(&self, key: &str) -> StorageResult<Option<AgentId>> {
        let presented = digest_hex(key);
        let rows = sqlx::query(sql::select_active())
            .fetch_all(self.db.pool())
            .await?;

        for row in rows {
            let stored: String = row.get("key_hash");
            if stored.as_bytes().ct_eq(presented.as_bytes()).into() {
                let agent: String = row.get("agent_id");
                if let Ok(agent_id) = AgentId::try_new(agent) {
                    sqlx::query(sql::touch())
                        .bind(Utc::now())
                        .bind(&stored)
                        .execute(self.db.pool())
                        .await?;
                    return Ok(Some(agent_id));
                }
            }
        }
        Ok(None)
    }

    /// Revokes a key by its plaintext.
    pub async fn revoke(&self, key: &str) -> StorageResult<()> {
        sqlx::query(sql::revoke())
            .bind(digest_hex(key))
            .execute(self.db.pool())
            .await?;
        Ok(())
    }
}
