//! AI SDK session records.
//!
//! A session is created when the agent reports a session id and lets later
//! invocations resume context. Rows are expired by a periodic sweeper.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::primitives::{AgentId, TaskId};

/// Lifecycle status of a recorded session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
    Expired,
}

impl SessionStatus {
    /// Database/text representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }

    /// Parses the database/text representation, defaulting to active.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "expired" => Self::Expired,
            _ => Self::Active,
        }
    }
}

/// One AI SDK session, keyed by the SDK's opaque token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    /// The SDK's opaque session token.
    pub id: String,
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub estimated_cost: f64,
    pub duration_ms: i64,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}
