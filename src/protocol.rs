//! Broker ↔ agent wire protocol.
//!
//! Every frame on the duplex channel is one JSON object of the shape
//! `{"type": <kebab-case tag>, "payload": <object>}`, carried as a single
//! WebSocket text message. Payload fields are camelCase. Unknown `type`
//! tags fail decoding; the gateway logs and drops them without touching
//! the connection.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{ProjectId, RequestId, TaskId};

/// Protocol-level failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame decode failed: {source}")]
    Decode {
        #[source]
        source: serde_json::Error,
    },

    #[error("frame encode failed: {source}")]
    Encode {
        #[source]
        source: serde_json::Error,
    },
}

/// One frame on the broker ↔ agent channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum Frame {
    // Broker → agent
    TaskSubmit(TaskSubmit),
    TaskCancel(TaskCancel),
    DeployRequest(DeployRequest),
    PathValidateRequest(PathValidateRequest),
    SystemRestart(SystemRestart),
    // Agent → broker
    TaskAck(TaskAck),
    TaskProgress(TaskProgress),
    TaskStream(TaskStream),
    TaskComplete(TaskComplete),
    TaskError(TaskError),
    TaskCancelled(TaskCancelled),
    DeployResult(DeployResult),
    PathValidateResult(PathValidateResult),
    AgentStatus(AgentStatus),
}

impl Frame {
    /// Serializes the frame to its wire bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Encode`] when serialization fails.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|source| ProtocolError::Encode { source })
    }

    /// Deserializes a frame from wire bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Decode`] for malformed JSON and for unknown
    /// `type` tags.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|source| ProtocolError::Decode { source })
    }

    /// The wire tag of this frame, for logging and outbox bookkeeping.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::TaskSubmit(_) => "task-submit",
            Self::TaskCancel(_) => "task-cancel",
            Self::DeployRequest(_) => "deploy-request",
            Self::PathValidateRequest(_) => "path-validate-request",
            Self::SystemRestart(_) => "system-restart",
            Self::TaskAck(_) => "task-ack",
            Self::TaskProgress(_) => "task-progress",
            Self::TaskStream(_) => "task-stream",
            Self::TaskComplete(_) => "task-complete",
            Self::TaskError(_) => "task-error",
            Self::TaskCancelled(_) => "task-cancelled",
            Self::DeployResult(_) => "deploy-result",
            Self::PathValidateResult(_) => "path-validate-result",
            Self::AgentStatus(_) => "agent-status",
        }
    }
}

/// Chat location a task originated from; echoed back by the agent so the
/// broker can route updates without a task lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatContext {
    pub channel_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_ts: Option<String>,
    pub user_id: String,
}

/// Binary attachment shipped with a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentPayload {
    pub name: String,
    pub mimetype: String,
    /// Base64-encoded content.
    pub base64: String,
    pub size: u64,
}

/// Outcome of materializing one attachment on the agent host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentResult {
    pub name: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_path: Option<String>,
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Broker → agent: execute a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSubmit {
    pub task_id: TaskId,
    pub project_id: ProjectId,
    pub bot_name: String,
    pub command: String,
    pub prompt: String,
    pub system_prompt: String,
    pub local_path: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_budget: Option<f64>,
    pub allowed_tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_continuations: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentPayload>,
    #[serde(rename = "slackContext")]
    pub chat: ChatContext,
}

/// Broker → agent: stop a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCancel {
    pub task_id: TaskId,
    pub reason: String,
}

/// Broker → agent: run the project deploy step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployRequest {
    pub request_id: RequestId,
    pub local_path: String,
    pub channel_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_ts: Option<String>,
    pub requested_by: String,
}

/// Broker → agent: check (and create if missing) a workspace path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathValidateRequest {
    pub request_id: RequestId,
    pub path: String,
}

/// Broker → agent: restart the worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemRestart {
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rebuild: Option<bool>,
}

/// Agent → broker: task accepted or rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAck {
    pub task_id: TaskId,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Kind of a progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    ToolUse,
    Info,
}

/// Agent → broker: a tool-use or informational progress step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskProgress {
    pub task_id: TaskId,
    #[serde(rename = "type")]
    pub kind: ProgressKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Agent → broker: an incremental text delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStream {
    pub task_id: TaskId,
    pub delta: String,
    pub timestamp: DateTime<Utc>,
}

/// Agent → broker: terminal success (including budget-exhausted partials).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskComplete {
    pub task_id: TaskId,
    pub result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub estimated_cost: f64,
    pub files_changed: Vec<String>,
    pub commands_run: Vec<String>,
    pub duration_ms: u64,
    pub continuations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_results: Option<Vec<AttachmentResult>>,
}

/// Agent → broker: terminal failure. The session id is preserved so the
/// task can be resumed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskError {
    pub task_id: TaskId,
    pub error: String,
    pub recoverable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Agent → broker: the task was cancelled on the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCancelled {
    pub task_id: TaskId,
    pub reason: String,
}

/// Agent → broker: outcome of a deploy request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployResult {
    pub request_id: RequestId,
    pub success: bool,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_logs_url: Option<String>,
}

/// Agent → broker: outcome of a path validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathValidateResult {
    pub request_id: RequestId,
    pub success: bool,
    pub exists: bool,
    pub created: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Reported agent availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportedStatus {
    Online,
    Busy,
}

/// Agent → broker: periodic status report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    pub status: ReportedStatus,
    pub active_task_ids: Vec<TaskId>,
    pub ts: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_tag_is_kebab_case_with_payload_object() {
        let frame = Frame::TaskAck(TaskAck {
            task_id: TaskId::generate(),
            accepted: true,
            reason: None,
        });
        let value: serde_json::Value = serde_json::from_slice(&frame.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "task-ack");
        assert!(value["payload"]["taskId"].is_string());
        assert!(value["payload"].get("reason").is_none());
    }

    #[test]
    fn frames_round_trip() {
        let frame = Frame::TaskComplete(TaskComplete {
            task_id: TaskId::generate(),
            result: "done".into(),
            session_id: Some("sess-1".into()),
            input_tokens: 100,
            output_tokens: 200,
            estimated_cost: 0.003,
            files_changed: vec!["src/login.rs".into()],
            commands_run: vec!["cargo test".into()],
            duration_ms: 1234,
            continuations: 0,
            attachment_results: None,
        });
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn progress_kind_uses_snake_case_type_field() {
        let frame = Frame::TaskProgress(TaskProgress {
            task_id: TaskId::generate(),
            kind: ProgressKind::ToolUse,
            message: "Reading `src/main.rs`".into(),
            timestamp: Utc::now(),
        });
        let value: serde_json::Value = serde_json::from_slice(&frame.encode().unwrap()).unwrap();
        assert_eq!(value["payload"]["type"], "tool_use");
    }

    #[test]
    fn unknown_type_tag_fails_decode() {
        let raw = br#"{"type":"task-teleport","payload":{}}"#;
        assert!(Frame::decode(raw).is_err());
    }

    #[test]
    fn submit_frame_uses_slack_context_key() {
        let frame = Frame::TaskSubmit(TaskSubmit {
            task_id: TaskId::generate(),
            project_id: ProjectId::generate(),
            bot_name: "coder".into(),
            command: "build".into(),
            prompt: "fix the login bug".into(),
            system_prompt: "You are a careful engineer.".into(),
            local_path: "/srv/projects/app".into(),
            model: "claude-sonnet-4".into(),
            max_budget: Some(2.5),
            allowed_tools: vec!["Read".into(), "Edit".into()],
            max_continuations: Some(3),
            resume_session_id: None,
            parent_task_id: None,
            attachments: Vec::new(),
            chat: ChatContext {
                channel_id: "C0123".into(),
                thread_ts: None,
                user_id: "U0456".into(),
            },
        });
        let value: serde_json::Value = serde_json::from_slice(&frame.encode().unwrap()).unwrap();
        assert!(value["payload"]["slackContext"]["channelId"].is_string());
        assert!(value["payload"].get("attachments").is_none());
    }
}
