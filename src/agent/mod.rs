//! Worker-side runtime.
//!
//! An agent process holds one persistent connection to the broker, accepts
//! task-submit frames, and drives the AI SDK per task with streaming
//! progress and the auto-continuation loop.

pub mod attachments;
pub mod client;
pub mod executor;
pub mod sdk;

pub use client::{AgentClient, DeployOutcome, DeployRunner, ShellDeployRunner};
pub use executor::{ExecutorConfig, TaskExecutor};
pub use sdk::{CodingSdk, ContentBlock, InvocationRequest, InvocationResult, SdkError, SdkEvent};
