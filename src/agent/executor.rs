//! Task executor: drives one AI invocation chain for one task.
//!
//! Streams tool-use progress and text deltas back to the broker while the
//! SDK runs, tracks touched files and executed commands, and auto-continues
//! the session when an invocation exhausts its turn budget — up to the
//! task's continuation budget. Budget exhaustion is a completed-with-warning
//! terminal outcome, not a failure.

use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::agent::attachments;
use crate::agent::sdk::{
    CodingSdk, ContentBlock, ERROR_MAX_TURNS, InvocationRequest, InvocationResult, SdkError,
    SdkEvent,
};
use crate::domain::task::push_unique;
use crate::protocol::{
    Frame, ProgressKind, TaskAck, TaskCancelled, TaskComplete, TaskError, TaskProgress, TaskStream,
    TaskSubmit,
};

/// Prompt used for every automatic continuation.
const CONTINUE_PROMPT: &str =
    "Continue where you left off. Complete the remaining work from the original task.";

/// Pause between a max-turns exhaustion and the resumed invocation.
const CONTINUATION_DELAY: Duration = Duration::from_secs(1);

/// Executor tuning.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub max_turns_per_invocation: u32,
    pub default_max_continuations: u32,
    pub invocation_timeout: Duration,
    pub attachment_retry_attempts: u32,
    pub attachment_dir: PathBuf,
}

/// State shared between the event relay and the terminal frame.
#[derive(Debug, Default)]
struct Tracked {
    session_id: Option<String>,
    files_changed: Vec<String>,
    commands_run: Vec<String>,
    prev_turn_had_text: bool,
}

/// Drives SDK invocations for submitted tasks.
pub struct TaskExecutor {
    sdk: Arc<dyn CodingSdk>,
    config: ExecutorConfig,
}

impl TaskExecutor {
    /// Creates the executor.
    #[must_use]
    pub fn new(sdk: Arc<dyn CodingSdk>, config: ExecutorConfig) -> Self {
        Self { sdk, config }
    }

    /// Runs one task to its terminal frame. Every outbound effect goes
    /// through `outbound`; an external cancel (or the global timeout)
    /// fires `cancel` and surfaces as a task-cancelled frame.
    #[instrument(skip(self, submit, outbound, cancel), fields(task = %submit.task_id))]
    pub async fn execute(
        &self,
        submit: TaskSubmit,
        outbound: mpsc::Sender<Frame>,
        cancel: CancellationToken,
    ) {
        let started = Instant::now();

        let materialized = attachments::materialize(
            &self.config.attachment_dir,
            submit.task_id,
            &submit.attachments,
            self.config.attachment_retry_attempts,
        )
        .await;
        let mut prompt = submit.prompt.clone();
        if let Some(suffix) = attachments::prompt_suffix(&materialized.saved_paths) {
            prompt.push_str(&suffix);
        }

        send(&outbound, Frame::TaskAck(TaskAck {
            task_id: submit.task_id,
            accepted: true,
            reason: None,
        }))
        .await;

        // Global wall-clock budget shares the task's cancellation signal.
        let timeout_guard = {
            let cancel = cancel.clone();
            let timeout = self.config.invocation_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                cancel.cancel();
            })
        };

        let tracked = Arc::new(Mutex::new(Tracked {
            session_id: submit.resume_session_id.clone(),
            ..Tracked::default()
        }));
        let max_continuations = submit
            .max_continuations
            .unwrap_or(self.config.default_max_continuations);

        let mut totals = (0u64, 0u64, 0f64, 0u32); // in, out, cost, turns
        let mut invocations = 0u32;
        let mut continuations = 0u32;
        let mut resume = submit.resume_session_id.clone();
        let mut current_prompt = prompt;

        let outcome = loop {
            invocations += 1;
            let (ev_tx, ev_rx) = mpsc::channel(64);
            let relay = tokio::spawn(relay_events(
                ev_rx,
                outbound.clone(),
                submit.task_id,
                Arc::clone(&tracked),
            ));

            let request = InvocationRequest {
                prompt: current_prompt.clone(),
                system_prompt: submit.system_prompt.clone(),
                model: submit.model.clone(),
                max_turns: self.config.max_turns_per_invocation,
                cwd: submit.local_path.clone(),
                allowed_tools: submit.allowed_tools.clone(),
                resume_session_id: resume.clone(),
            };
            let result = self.sdk.invoke(request, ev_tx, cancel.clone()).await;
            let _ = relay.await;

            match result {
                Ok(result) => {
                    totals.0 += result.input_tokens;
                    totals.1 += result.output_tokens;
                    totals.2 += result.total_cost;
                    totals.3 += result.num_turns;
                    if let Some(session) = &result.session_id {
                        tracked.lock().expect("tracked lock").session_id = Some(session.clone());
                    }
                    let session_known = tracked
                        .lock()
                        .expect("tracked lock")
                        .session_id
                        .is_some();

                    let hit_turn_budget =
                        result.is_error && result.result_text == ERROR_MAX_TURNS;
                    if hit_turn_budget
                        && session_known
                        && continuations < max_continuations
                        && !cancel.is_cancelled()
                    {
                        continuations += 1;
                        resume = tracked.lock().expect("tracked lock").session_id.clone();
                        current_prompt = CONTINUE_PROMPT.to_string();
                        info!(
                            continuation = continuations,
                            of = max_continuations,
                            "turn budget exhausted, continuing session"
                        );
                        tokio::time::sleep(CONTINUATION_DELAY).await;
                        continue;
                    }
                    break Ok(result);
                }
                Err(err) => break Err(err),
            }
        };
        timeout_guard.abort();

        let snapshot = {
            let tracked = tracked.lock().expect("tracked lock");
            (
                tracked.session_id.clone(),
                tracked.files_changed.clone(),
                tracked.commands_run.clone(),
            )
        };
        let (session_id, files_changed, commands_run) = snapshot;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let terminal = match outcome {
            Err(SdkError::Aborted) => {
                debug!("task aborted");
                Frame::TaskCancelled(TaskCancelled {
                    task_id: submit.task_id,
                    reason: "cancelled or timed out".to_string(),
                })
            }
            Err(err) => Frame::TaskError(TaskError {
                task_id: submit.task_id,
                error: err.to_string(),
                recoverable: true,
                session_id,
            }),
            Ok(result) if result.is_error && result.result_text == ERROR_MAX_TURNS => {
                // Continuation budget exhausted while still hitting the turn
                // ceiling: a partial result, not a failure.
                warn!(turns = totals.3, invocations, "continuation budget exhausted");
                Frame::TaskComplete(TaskComplete {
                    task_id: submit.task_id,
                    result: format!(
                        "Partial result: stopped after {} turns across {invocations} \
                         invocation(s); the turn budget and {max_continuations} \
                         continuation(s) were exhausted. Resubmit to continue the session.",
                        totals.3
                    ),
                    session_id,
                    input_tokens: totals.0,
                    output_tokens: totals.1,
                    estimated_cost: totals.2,
                    files_changed,
                    commands_run,
                    duration_ms,
                    continuations,
                    attachment_results: non_empty(materialized.results.clone()),
                })
            }
            Ok(result) if result.is_error => Frame::TaskError(TaskError {
                task_id: submit.task_id,
                error: result.result_text,
                recoverable: true,
                session_id,
            }),
            Ok(result) => Frame::TaskComplete(TaskComplete {
                task_id: submit.task_id,
                result: result.result_text,
                session_id,
                input_tokens: totals.0,
                output_tokens: totals.1,
                estimated_cost: totals.2,
                files_changed,
                commands_run,
                duration_ms,
                continuations,
                attachment_results: non_empty(materialized.results.clone()),
            }),
        };
        send(&outbound, terminal).await;

        attachments::sweep(&materialized.saved_paths).await;
    }
}

fn non_empty<T>(v: Vec<T>) -> Option<Vec<T>> {
    if v.is_empty() { None } else { Some(v) }
}

async fn send(outbound: &mpsc::Sender<Frame>, frame: Frame) {
    if outbound.send(frame).await.is_err() {
        debug!("outbound channel closed, frame dropped");
    }
}

/// Maps SDK events onto progress and stream frames, tracking session id,
/// touched files and executed commands along the way.
async fn relay_events(
    mut events: mpsc::Receiver<SdkEvent>,
    outbound: mpsc::Sender<Frame>,
    task_id: crate::domain::TaskId,
    tracked: Arc<Mutex<Tracked>>,
) {
    while let Some(event) = events.recv().await {
        match event {
            SdkEvent::SystemInit { session_id } => {
                tracked.lock().expect("tracked lock").session_id = Some(session_id);
            }
            SdkEvent::Assistant { blocks } => {
                let mut turn_has_text = false;
                for block in blocks {
                    match block {
                        ContentBlock::Text { text } => {
                            let needs_separator = {
                                let t = tracked.lock().expect("tracked lock");
                                !turn_has_text && t.prev_turn_had_text
                            };
                            if needs_separator {
                                send(
                                    &outbound,
                                    Frame::TaskStream(TaskStream {
                                        task_id,
                                        delta: "\n\n".to_string(),
                                        timestamp: chrono::Utc::now(),
                                    }),
                                )
                                .await;
                            }
                            turn_has_text = true;
                            send(
                                &outbound,
                                Frame::TaskStream(TaskStream {
                                    task_id,
                                    delta: text,
                                    timestamp: chrono::Utc::now(),
                                }),
                            )
                            .await;
                        }
                        ContentBlock::ToolUse { name, input } => {
                            track_tool_use(&tracked, &name, &input);
                            send(
                                &outbound,
                                Frame::TaskProgress(TaskProgress {
                                    task_id,
                                    kind: ProgressKind::ToolUse,
                                    message: tool_descriptor(&name, &input),
                                    timestamp: chrono::Utc::now(),
                                }),
                            )
                            .await;
                        }
                    }
                }
                if turn_has_text {
                    tracked.lock().expect("tracked lock").prev_turn_had_text = true;
                }
            }
        }
    }
}

fn track_tool_use(tracked: &Arc<Mutex<Tracked>>, name: &str, input: &Value) {
    let mut tracked = tracked.lock().expect("tracked lock");
    match name {
        "Edit" | "Write" => {
            if let Some(path) = input.get("file_path").and_then(Value::as_str) {
                push_unique(&mut tracked.files_changed, path);
            }
        }
        "NotebookEdit" => {
            if let Some(path) = input.get("notebook_path").and_then(Value::as_str) {
                push_unique(&mut tracked.files_changed, path);
            }
        }
        "Bash" => {
            if let Some(command) = input.get("command").and_then(Value::as_str) {
                push_unique(&mut tracked.commands_run, truncate(command, 200));
            }
        }
        _ => {}
    }
}

/// Human-readable descriptor for a tool-use progress step.
#[must_use]
pub fn tool_descriptor(name: &str, input: &Value) -> String {
    let str_field = |key: &str| input.get(key).and_then(Value::as_str);
    match name {
        "Read" => str_field("file_path")
            .map_or_else(|| "Reading a file".to_string(), |p| format!("Reading `{p}`")),
        "Edit" => str_field("file_path")
            .map_or_else(|| "Editing a file".to_string(), |p| format!("Editing `{p}`")),
        "Write" => str_field("file_path")
            .map_or_else(|| "Writing a file".to_string(), |p| format!("Writing `{p}`")),
        "NotebookEdit" => str_field("notebook_path").map_or_else(
            || "Editing a notebook".to_string(),
            |p| format!("Editing `{p}`"),
        ),
        "Bash" => str_field("command").map_or_else(
            || "Running a command".to_string(),
            |c| format!("Running: `{}`", truncate(c, 120)),
        ),
        "Grep" | "Glob" => str_field("pattern").map_or_else(
            || "Searching the workspace".to_string(),
            |p| format!("Searching for `{p}`"),
        ),
        other => format!("Using {other}"),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn descriptors_name_the_object() {
        assert_eq!(
            tool_descriptor("Read", &json!({"file_path": "src/main.rs"})),
            "Reading `src/main.rs`"
        );
        assert_eq!(
            tool_descriptor("Bash", &json!({"command": "cargo test"})),
            "Running: `cargo test`"
        );
        assert_eq!(tool_descriptor("WebSearch", &json!({})), "Using WebSearch");
    }

    #[test]
    fn bash_commands_are_truncated_to_200_chars() {
        let tracked = Arc::new(Mutex::new(Tracked::default()));
        let long = "x".repeat(500);
        track_tool_use(&tracked, "Bash", &json!({ "command": long }));
        let commands = tracked.lock().unwrap().commands_run.clone();
        assert_eq!(commands[0].chars().count(), 200);
    }

    #[test]
    fn file_tracking_dedupes_in_order() {
        let tracked = Arc::new(Mutex::new(Tracked::default()));
        track_tool_use(&tracked, "Edit", &json!({"file_path": "a.rs"}));
        track_tool_use(&tracked, "Write", &json!({"file_path": "b.rs"}));
        track_tool_use(&tracked, "Edit", &json!({"file_path": "a.rs"}));
        let files = tracked.lock().unwrap().files_changed.clone();
        assert_eq!(files, vec!["a.rs".to_string(), "b.rs".to_string()]);
    }
}
