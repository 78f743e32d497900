//! Command service: submit, decomposition, resubmit, cancel.
//!
//! The only component that creates task rows. Dispatch goes through the
//! registry; a failed or offline dispatch parks the frame in the offline
//! queue and flips the chat surface to its queued state.

use chrono::Utc;
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::blocks;
use crate::bots::{BotCatalog, DECOMPOSE_COMMAND, planning_prompt, read_only_tools};
use crate::database::StorageError;
use crate::domain::{
    AgentId, BotName, ChannelId, ChatUserId, Project, Task, TaskId, TaskStatus,
};
use crate::health::HealthTracker;
use crate::notifier::Notifier;
use crate::offline_queue::OfflineQueue;
use crate::protocol::{AttachmentPayload, ChatContext, Frame, ProtocolError, TaskCancel, TaskSubmit};
use crate::registry::{AgentRegistry, Resolution};
use crate::storage::Stores;

/// Budget ceiling for the planning pre-pass.
const PLANNING_MAX_BUDGET: f64 = 0.5;

/// Command-service failures surfaced to the chat layer.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unknown bot: {name}")]
    UnknownBot { name: String },

    #[error("no agents online for auto dispatch")]
    NoAgentsOnline,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Everything needed to create and dispatch one task.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub bot: BotName,
    pub command: String,
    pub prompt: String,
    pub project: Project,
    pub channel_id: ChannelId,
    pub thread_ts: Option<String>,
    pub user_id: ChatUserId,
    /// Originating chat message, reaction anchor.
    pub message_ts: Option<String>,
    pub attachments: Vec<AttachmentPayload>,
    pub resume_session_id: Option<String>,
    pub parent_task_id: Option<TaskId>,
    pub max_continuations_override: Option<u32>,
}

/// A parsed decomposition subtask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubtaskSpec {
    pub title: String,
    pub prompt: String,
    pub command: String,
}

/// Submit / resubmit / cancel over the stores, registry and queue.
pub struct CommandService {
    stores: Stores,
    registry: Arc<AgentRegistry>,
    offline_queue: Arc<OfflineQueue>,
    notifier: Arc<Notifier>,
    health: Arc<HealthTracker>,
    bots: BotCatalog,
    offline_ttl_hours: u64,
}

impl CommandService {
    /// Wires the service.
    #[must_use]
    pub fn new(
        stores: Stores,
        registry: Arc<AgentRegistry>,
        offline_queue: Arc<OfflineQueue>,
        notifier: Arc<Notifier>,
        health: Arc<HealthTracker>,
        offline_ttl_hours: u64,
    ) -> Self {
        Self {
            stores,
            registry,
            offline_queue,
            notifier,
            health,
            bots: BotCatalog::builtin(),
            offline_ttl_hours,
        }
    }

    /// The bot catalog, for the chat surface.
    #[must_use]
    pub fn bots(&self) -> &BotCatalog {
        &self.bots
    }

    /// Creates, persists and dispatches a task. Returns its id.
    #[instrument(skip(self, request), fields(bot = %request.bot, command = %request.command))]
    pub async fn submit(&self, request: SubmitRequest) -> Result<TaskId, CommandError> {
        let bot = self
            .bots
            .get(&request.bot)
            .ok_or_else(|| CommandError::UnknownBot {
                name: request.bot.as_str().to_string(),
            })?;

        let now = Utc::now();
        let task = Task {
            id: TaskId::generate(),
            project_id: request.project.id,
            bot_name: bot.name.clone(),
            command: request.command.clone(),
            prompt: request.prompt.clone(),
            status: TaskStatus::Pending,
            result: None,
            error_message: None,
            channel_id: request.channel_id.clone(),
            thread_ts: request.thread_ts.clone(),
            user_id: request.user_id.clone(),
            message_ts: request.message_ts.clone(),
            session_id: request.resume_session_id.clone(),
            input_tokens: 0,
            output_tokens: 0,
            estimated_cost: 0.0,
            max_budget: request.project.default_max_budget,
            files_changed: Vec::new(),
            commands_run: Vec::new(),
            parent_task_id: request.parent_task_id,
            agent_id: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        self.stores.tasks.insert(&task).await?;

        let frame = self.build_submit_frame(&task, &request);

        if let Some(ts) = &request.message_ts {
            let _ = self
                .notifier
                .add_reaction(request.channel_id.as_str(), ts, "hourglass_flowing_sand")
                .await;
        }

        self.stores
            .audit
            .record(
                "task:submitted",
                "task",
                &task.id.to_string(),
                Some(request.user_id.as_str()),
                serde_json::json!({
                    "bot": bot.name.as_str(),
                    "command": request.command,
                    "project": request.project.id.to_string(),
                }),
            )
            .await?;

        self.dispatch(&task, frame, &request).await?;
        Ok(task.id)
    }

    fn build_submit_frame(&self, task: &Task, request: &SubmitRequest) -> Frame {
        let bot = self.bots.get(&task.bot_name).expect("bot checked by submit");
        let decompose = task.command == DECOMPOSE_COMMAND;

        let system_prompt = bot.system_prompt.clone();
        let allowed_tools = if decompose {
            read_only_tools()
        } else {
            bot.allowed_tools.clone()
        };
        let prompt = if decompose {
            planning_prompt(&task.prompt)
        } else {
            task.prompt.clone()
        };
        let max_budget = if decompose {
            Some(
                task.max_budget
                    .map_or(PLANNING_MAX_BUDGET, |b| b.min(PLANNING_MAX_BUDGET)),
            )
        } else {
            task.max_budget
        };
        let max_continuations = if decompose {
            Some(0)
        } else {
            Some(
                request
                    .max_continuations_override
                    .unwrap_or(bot.max_continuations),
            )
        };

        Frame::TaskSubmit(TaskSubmit {
            task_id: task.id,
            project_id: task.project_id,
            bot_name: bot.name.as_str().to_string(),
            command: task.command.clone(),
            prompt,
            system_prompt,
            local_path: request.project.local_path.clone(),
            model: request.project.default_model.clone(),
            max_budget,
            allowed_tools,
            max_continuations,
            resume_session_id: request.resume_session_id.clone(),
            parent_task_id: task.parent_task_id,
            attachments: request.attachments.clone(),
            chat: ChatContext {
                channel_id: task.channel_id.as_str().to_string(),
                thread_ts: task.thread_ts.clone(),
                user_id: task.user_id.as_str().to_string(),
            },
        })
    }

    async fn dispatch(
        &self,
        task: &Task,
        frame: Frame,
        request: &SubmitRequest,
    ) -> Result<(), CommandError> {
        let health = &self.health;
        let resolution = self
            .registry
            .resolve_filtered(&request.project.agent, |agent| health.allow_request(agent));

        match resolution {
            Resolution::Online(agent) => {
                self.stores.tasks.set_agent(task.id, &agent).await?;
                if self.registry.send(&agent, frame.clone()) {
                    info!(task = %task.id, agent = %agent, "task dispatched");
                } else {
                    // The hand-off lost a race with a disconnect; park it.
                    warn!(task = %task.id, agent = %agent, "send failed, parking task");
                    self.park(task, &agent, &frame, request).await?;
                }
                Ok(())
            }
            Resolution::QueueOffline(agent) => {
                self.stores.tasks.set_agent(task.id, &agent).await?;
                self.park(task, &agent, &frame, request).await?;
                Ok(())
            }
            Resolution::NoAgents => {
                // Never dispatched: cancelled is the only terminal reachable
                // from pending.
                self.stores
                    .tasks
                    .cancel(task.id, Some("no agents online for auto dispatch"))
                    .await?;
                Err(CommandError::NoAgentsOnline)
            }
        }
    }

    async fn park(
        &self,
        task: &Task,
        agent: &AgentId,
        frame: &Frame,
        request: &SubmitRequest,
    ) -> Result<(), CommandError> {
        self.offline_queue.enqueue(agent, frame).await?;
        self.stores.tasks.mark_queued(task.id).await?;

        if let Some(ts) = &request.message_ts {
            let _ = self
                .notifier
                .swap_reaction(
                    request.channel_id.as_str(),
                    ts,
                    "hourglass_flowing_sand",
                    "inbox_tray",
                )
                .await;
        }
        let queued_blocks = blocks::queued(task, agent.as_str(), self.offline_ttl_hours);
        let _ = self
            .notifier
            .post_blocks(
                request.channel_id.as_str(),
                request.thread_ts.as_deref(),
                "Task queued",
                &queued_blocks,
            )
            .await;

        self.stores
            .audit
            .record(
                "task:queued",
                "task",
                &task.id.to_string(),
                Some(request.user_id.as_str()),
                serde_json::json!({ "agent": agent.as_str() }),
            )
            .await?;
        Ok(())
    }

    /// Submits a request, routing complex ones through the decomposition
    /// pre-pass (a planning parent whose completion spawns the subtasks).
    pub async fn submit_with_decomposition(
        &self,
        mut request: SubmitRequest,
    ) -> Result<TaskId, CommandError> {
        let bot = self
            .bots
            .get(&request.bot)
            .ok_or_else(|| CommandError::UnknownBot {
                name: request.bot.as_str().to_string(),
            })?;

        if bot.wants_decomposition(&request.command, &request.prompt) {
            info!(bot = %request.bot, "request routed through decomposition");
            request.command = DECOMPOSE_COMMAND.to_string();
        }
        self.submit(request).await
    }

    /// Consumes a planning parent's result: parse subtasks and submit each
    /// as a child. Zero accepted subtasks falls back to one direct submit
    /// of the original prompt, still as a child so parent aggregation holds.
    pub async fn handle_decomposition_complete(
        &self,
        parent: &Task,
        result_text: &str,
    ) -> Result<Vec<TaskId>, CommandError> {
        let project = self.stores.projects.require(parent.project_id).await?;
        let subtasks = parse_subtasks(result_text);

        let specs = if subtasks.is_empty() {
            info!(parent = %parent.id, "no parseable subtasks, falling back to direct submit");
            vec![SubtaskSpec {
                title: "direct".to_string(),
                prompt: parent.prompt.clone(),
                command: "build".to_string(),
            }]
        } else {
            info!(parent = %parent.id, count = subtasks.len(), "decomposition produced subtasks");
            subtasks
        };

        let mut ids = Vec::with_capacity(specs.len());
        for spec in specs {
            let id = self
                .submit(SubmitRequest {
                    bot: parent.bot_name.clone(),
                    command: spec.command,
                    prompt: spec.prompt,
                    project: project.clone(),
                    channel_id: parent.channel_id.clone(),
                    thread_ts: parent.thread_ts.clone(),
                    user_id: parent.user_id.clone(),
                    message_ts: None,
                    attachments: Vec::new(),
                    resume_session_id: None,
                    parent_task_id: Some(parent.id),
                    max_continuations_override: None,
                })
                .await?;
            ids.push(id);
        }
        Ok(ids)
    }

    /// Rebuilds and resubmits a finished task, resuming its AI session.
    pub async fn resubmit(&self, task: &Task, project: &Project) -> Result<TaskId, CommandError> {
        self.submit(SubmitRequest {
            bot: task.bot_name.clone(),
            command: task.command.clone(),
            prompt: task.prompt.clone(),
            project: project.clone(),
            channel_id: task.channel_id.clone(),
            thread_ts: task.thread_ts.clone(),
            user_id: task.user_id.clone(),
            message_ts: task.message_ts.clone(),
            attachments: Vec::new(),
            resume_session_id: task.session_id.clone(),
            parent_task_id: None,
            max_continuations_override: None,
        })
        .await
    }

    /// Cancels a task and every non-terminal subtask under it. The cancel
    /// frame is broadcast to all connected agents — only the holder acts.
    /// Returns the number of tasks cancelled.
    pub async fn cancel(
        &self,
        task_id: TaskId,
        reason: &str,
        cancelled_by: Option<&ChatUserId>,
    ) -> Result<usize, CommandError> {
        let mut cancelled = 0;
        let mut queue = VecDeque::from([task_id]);

        while let Some(id) = queue.pop_front() {
            let Some(task) = self.stores.tasks.get(id).await? else {
                continue;
            };
            for child in self.stores.tasks.children_of(id).await? {
                queue.push_back(child.id);
            }
            if task.status.is_terminal() {
                continue;
            }
            if !self.stores.tasks.cancel(id, Some(reason)).await? {
                continue;
            }
            cancelled += 1;

            self.registry.broadcast_frame(&Frame::TaskCancel(TaskCancel {
                task_id: id,
                reason: reason.to_string(),
            }));

            if let Some(ts) = &task.message_ts {
                let _ = self
                    .notifier
                    .swap_reaction(
                        task.channel_id.as_str(),
                        ts,
                        "hourglass_flowing_sand",
                        "no_entry_sign",
                    )
                    .await;
            }

            self.stores
                .audit
                .record(
                    "task:cancelled",
                    "task",
                    &id.to_string(),
                    cancelled_by.map(crate::domain::ChatUserId::as_str),
                    serde_json::json!({ "reason": reason }),
                )
                .await?;
        }
        Ok(cancelled)
    }
}

/// Parses a decomposition result into subtask specs.
///
/// Preferred form: a fenced ```` ```json:subtasks ```` block containing a
/// JSON array. Fallback: the first balanced JSON array anywhere in the text.
/// Either way the array is accepted only when *every* element is an object
/// with string `title`, `prompt` and `command`; otherwise the whole array is
/// rejected and the caller falls back to a direct submit.
#[must_use]
pub fn parse_subtasks(text: &str) -> Vec<SubtaskSpec> {
    if let Some(block) = fenced_block(text, "json:subtasks") {
        return validated_array(&block).unwrap_or_default();
    }
    if let Some(raw) = first_balanced_array(text) {
        return validated_array(&raw).unwrap_or_default();
    }
    Vec::new()
}

fn fenced_block(text: &str, tag: &str) -> Option<String> {
    let opener = format!("```{tag}");
    let start = text.find(&opener)? + opener.len();
    let rest = &text[start..];
    let end = rest.find("```")?;
    Some(rest[..end].trim().to_string())
}

/// Finds the first bracket-balanced `[...]` substring, skipping brackets
/// inside JSON strings.
fn first_balanced_array(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    let mut start = None;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' if start.is_some() => in_string = true,
            b'[' => {
                if start.is_none() {
                    start = Some(i);
                }
                depth += 1;
            }
            b']' if start.is_some() => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start?..=i].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

fn validated_array(raw: &str) -> Option<Vec<SubtaskSpec>> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    let array = value.as_array()?;
    if array.is_empty() {
        return None;
    }
    let mut specs = Vec::with_capacity(array.len());
    for item in array {
        let title = item.get("title")?.as_str()?;
        let prompt = item.get("prompt")?.as_str()?;
        let command = item.get("command")?.as_str()?;
        specs.push(SubtaskSpec {
            title: title.to_string(),
            prompt: prompt.to_string(),
            command: command.to_string(),
        });
    }
    Some(specs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fenced_block_is_preferred() {
        let text = r#"Here is the plan:
```json:subtasks
[{"title": "a", "prompt": "do a", "command": "build"},
 {"title": "b", "prompt": "do b", "command": "test"}]
```
And also this decoy: [1, 2, 3]"#;
        let specs = parse_subtasks(text);
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].title, "a");
        assert_eq!(specs[1].command, "test");
    }

    #[test]
    fn bare_array_fallback_requires_all_keys() {
        let ok = r#"Plan: [{"title": "a", "prompt": "p", "command": "build"}] done"#;
        assert_eq!(parse_subtasks(ok).len(), 1);

        // One element missing `command`: the whole array is rejected.
        let partial = r#"[{"title": "a", "prompt": "p", "command": "build"},
                          {"title": "b", "prompt": "p"}]"#;
        assert!(parse_subtasks(partial).is_empty());
    }

    #[test]
    fn non_json_text_yields_nothing() {
        assert!(parse_subtasks("I could not break this down.").is_empty());
        assert!(parse_subtasks("").is_empty());
        assert!(parse_subtasks("[1, 2, 3]").is_empty());
    }

    #[test]
    fn balanced_scan_ignores_brackets_in_strings() {
        let tricky = r#"note [see "a ] b"] then [{"title": "a", "prompt": "p [x]", "command": "c"}]"#;
        // First balanced array is `[see ...]` which is not JSON, so nothing
        // parses; the scanner takes the first candidate only.
        assert!(parse_subtasks(tricky).is_empty());

        let clean = r#"[{"title": "a", "prompt": "p [x]", "command": "c"}]"#;
        let specs = parse_subtasks(clean);
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].prompt, "p [x]");
    }
}
