//! AI SDK contract.
//!
//! The real SDK is an external collaborator; this module pins the shape
//! the executor depends on: one invocation streams events into a channel
//! and resolves to a final result carrying token counters and the opaque
//! session token. Tests drive a scripted implementation.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Result text the SDK reports when an invocation exhausts its per-turn
/// budget; the trigger for auto-continuation.
pub const ERROR_MAX_TURNS: &str = "error_max_turns";

/// One SDK invocation.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub prompt: String,
    pub system_prompt: String,
    pub model: String,
    pub max_turns: u32,
    /// Project checkout the SDK operates in.
    pub cwd: String,
    pub allowed_tools: Vec<String>,
    /// Resume token from a previous invocation.
    pub resume_session_id: Option<String>,
}

/// A content block inside an assistant message.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text { text: String },
    ToolUse { name: String, input: Value },
}

/// Streamed SDK events.
#[derive(Debug, Clone, PartialEq)]
pub enum SdkEvent {
    /// Initialization message carrying the session token.
    SystemInit { session_id: String },
    /// One assistant turn.
    Assistant { blocks: Vec<ContentBlock> },
}

/// Final invocation outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationResult {
    pub session_id: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_cost: f64,
    pub num_turns: u32,
    pub is_error: bool,
    pub result_text: String,
}

/// SDK invocation failures.
#[derive(Debug, Error)]
pub enum SdkError {
    #[error("sdk invocation failed: {message}")]
    Invocation { message: String },

    #[error("sdk invocation aborted")]
    Aborted,
}

/// The coding SDK as the executor sees it.
#[async_trait]
pub trait CodingSdk: Send + Sync {
    /// Runs one invocation, streaming events into `events` as they occur.
    /// Implementations must honor `cancel` promptly and return
    /// [`SdkError::Aborted`] when it fires.
    async fn invoke(
        &self,
        request: InvocationRequest,
        events: mpsc::Sender<SdkEvent>,
        cancel: CancellationToken,
    ) -> Result<InvocationResult, SdkError>;
}

/// Placeholder wired by the agent binary until a real SDK client is
/// configured: every task fails fast with a clear error.
pub struct UnconfiguredSdk;

#[async_trait]
impl CodingSdk for UnconfiguredSdk {
    async fn invoke(
        &self,
        _request: InvocationRequest,
        _events: mpsc::Sender<SdkEvent>,
        _cancel: CancellationToken,
    ) -> Result<InvocationResult, SdkError> {
        Err(SdkError::Invocation {
            message: "no coding SDK configured on this agent".to_string(),
        })
    }
}
