//! Sync workflow state: test → build → restart → deploy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::primitives::{AgentId, ChannelId, ChatUserId, ProjectId, RequestId, TaskId, WorkflowId};

/// Phase of a sync workflow.
///
/// Testing and building run in parallel; the displayed phase reflects
/// whichever leg is still outstanding. Restart never starts until both legs
/// have confirmed success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Testing,
    Building,
    Restarting,
    Deploying,
    Completed,
    Failed,
}

impl SyncStatus {
    /// True for completed and failed.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// In-memory record of one sync workflow. Retained one hour past terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncWorkflow {
    pub id: WorkflowId,
    pub project_id: ProjectId,
    pub agent_id: AgentId,
    /// Project checkout path on the agent host, for the deploy step.
    pub local_path: String,
    pub channel_id: ChannelId,
    pub thread_ts: Option<String>,
    pub requested_by: ChatUserId,
    pub status: SyncStatus,
    pub test_task_id: Option<TaskId>,
    pub build_task_id: Option<TaskId>,
    pub deploy_request_id: Option<RequestId>,
    /// Per-leg outcomes; restart gates on both being `Some(true)`.
    pub test_ok: Option<bool>,
    pub build_ok: Option<bool>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl SyncWorkflow {
    /// Both parallel legs confirmed successful.
    #[must_use]
    pub fn ready_to_restart(&self) -> bool {
        self.test_ok == Some(true) && self.build_ok == Some(true)
    }
}
