//! Task entity and its status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::primitives::{AgentId, BotName, ChannelId, ChatUserId, ProjectId, TaskId};

/// Lifecycle status of a task.
///
/// Transition graph:
/// `pending → {queued, running, cancelled}`,
/// `queued → {running, cancelled}`,
/// `running → {completed, failed, cancelled}`.
/// Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// True for completed, failed and cancelled.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the declared state graph allows `self → next`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use TaskStatus::{Cancelled, Completed, Failed, Pending, Queued, Running};
        matches!(
            (self, next),
            (Pending, Queued | Running | Cancelled)
                | (Queued, Running | Cancelled)
                | (Running, Completed | Failed | Cancelled)
        )
    }

    /// Database/text representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parses the database/text representation.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError::UnknownStatus`] for any other string.
    pub fn parse(s: &str) -> Result<Self, TransitionError> {
        match s {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(TransitionError::UnknownStatus {
                status: other.to_string(),
            }),
        }
    }
}

/// Errors raised by the status state machine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("illegal task transition: {from:?} -> {to:?}")]
    IllegalTransition { from: TaskStatus, to: TaskStatus },

    #[error("unknown task status: {status}")]
    UnknownStatus { status: String },
}

/// The unit of work dispatched to an agent.
///
/// Created by the command service; terminal fields are mutated only by the
/// message router through the task store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub project_id: ProjectId,
    pub bot_name: BotName,
    pub command: String,
    pub prompt: String,
    pub status: TaskStatus,
    pub result: Option<String>,
    pub error_message: Option<String>,
    pub channel_id: ChannelId,
    pub thread_ts: Option<String>,
    pub user_id: ChatUserId,
    /// Timestamp id of the originating chat message (reaction anchor).
    pub message_ts: Option<String>,
    /// Opaque AI SDK token enabling resume. Preserved even on failure.
    pub session_id: Option<String>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub estimated_cost: f64,
    pub max_budget: Option<f64>,
    /// Ordered, deduplicated list of files touched by the agent.
    pub files_changed: Vec<String>,
    /// Ordered, deduplicated list of shell commands the agent ran.
    pub commands_run: Vec<String>,
    pub parent_task_id: Option<TaskId>,
    /// Agent the task was dispatched (or queued) to.
    pub agent_id: Option<AgentId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// True when this task is a decomposition child.
    #[must_use]
    pub fn is_subtask(&self) -> bool {
        self.parent_task_id.is_some()
    }

    /// Validates and applies a status transition in memory.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError::IllegalTransition`] when the state graph
    /// forbids the move; terminal states never transition.
    pub fn transition_to(&mut self, next: TaskStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError::IllegalTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        if next.is_terminal() {
            self.completed_at = Some(self.updated_at);
        }
        Ok(())
    }
}

/// Appends `value` to an ordered set kept as a `Vec`, preserving first-seen
/// order.
pub fn push_unique(set: &mut Vec<String>, value: impl Into<String>) {
    let value = value.into();
    if !set.iter().any(|v| *v == value) {
        set.push(value);
    }
}
