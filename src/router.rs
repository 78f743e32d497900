//! Agent-frame router.
//!
//! Demultiplexes every agent → broker frame into state transitions and
//! outbound chat effects. The router never throws into the gateway loop: a
//! per-frame failure is logged and the next frame proceeds. A repository
//! failure aborts that frame; a notifier failure is already swallowed by
//! the notifier's own retry/failed-queue machinery.

use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::blocks;
use crate::bots::DECOMPOSE_COMMAND;
use crate::commands::CommandService;
use crate::database::StorageResult;
use crate::domain::{AgentId, Task, TaskId, TaskStatus};
use crate::health::HealthTracker;
use crate::notifier::Notifier;
use crate::pending::{DeployTable, PathValidations};
use crate::progress::{ProgressTrackers, step_description};
use crate::protocol::{
    AgentStatus, DeployResult, Frame, PathValidateResult, ProgressKind, ReportedStatus, TaskAck,
    TaskCancelled, TaskComplete, TaskError, TaskProgress, TaskStream,
};
use crate::registry::AgentRegistry;
use crate::storage::{Stores, session_store, task_store::CompletionUpdate};
use crate::stream_accumulator::StreamAccumulator;
use crate::sync::SyncOrchestrator;

/// Routes agent frames into the broker's state and chat surface.
pub struct FrameRouter {
    stores: Stores,
    registry: Arc<AgentRegistry>,
    health: Arc<HealthTracker>,
    accumulator: Arc<StreamAccumulator>,
    progress: Arc<ProgressTrackers>,
    notifier: Arc<Notifier>,
    commands: Arc<CommandService>,
    sync: Arc<SyncOrchestrator>,
    deploys: Arc<DeployTable>,
    path_validations: Arc<PathValidations>,
    session_ttl_secs: u64,
}

impl FrameRouter {
    /// Wires the router.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stores: Stores,
        registry: Arc<AgentRegistry>,
        health: Arc<HealthTracker>,
        accumulator: Arc<StreamAccumulator>,
        progress: Arc<ProgressTrackers>,
        notifier: Arc<Notifier>,
        commands: Arc<CommandService>,
        sync: Arc<SyncOrchestrator>,
        deploys: Arc<DeployTable>,
        path_validations: Arc<PathValidations>,
        session_ttl_secs: u64,
    ) -> Self {
        Self {
            stores,
            registry,
            health,
            accumulator,
            progress,
            notifier,
            commands,
            sync,
            deploys,
            path_validations,
            session_ttl_secs,
        }
    }

    /// Entry point from the gateway: handle one frame, swallowing errors.
    #[instrument(skip(self, frame), fields(agent = %agent, frame = frame.type_name()))]
    pub async fn handle_frame(&self, agent: &AgentId, frame: Frame) {
        let result = match frame {
            Frame::TaskAck(payload) => self.on_ack(agent, payload).await,
            Frame::TaskProgress(payload) => self.on_progress(payload).await,
            Frame::TaskStream(payload) => self.on_stream(payload).await,
            Frame::TaskComplete(payload) => self.on_complete(agent, payload).await,
            Frame::TaskError(payload) => self.on_error(agent, payload).await,
            Frame::TaskCancelled(payload) => self.on_cancelled(payload).await,
            Frame::DeployResult(payload) => self.on_deploy_result(payload).await,
            Frame::PathValidateResult(payload) => self.on_path_validate_result(payload),
            Frame::AgentStatus(payload) => self.on_agent_status(agent, payload),
            // Broker → agent frames have no business arriving here.
            other => {
                warn!(frame = other.type_name(), "unexpected inbound frame discarded");
                Ok(())
            }
        };
        if let Err(err) = result {
            warn!(error = %err, "frame handling failed");
        }
    }

    async fn on_ack(&self, agent: &AgentId, payload: TaskAck) -> StorageResult<()> {
        let task = self.stores.tasks.require(payload.task_id).await?;
        if task.status.is_terminal() {
            debug!(task = %task.id, "ack for terminal task ignored");
            return Ok(());
        }

        if payload.accepted {
            self.stores.tasks.mark_running(task.id).await?;
            self.stores.tasks.set_agent(task.id, agent).await?;
            debug!(task = %task.id, "task running");
        } else {
            let reason = payload.reason.unwrap_or_else(|| "rejected by agent".to_string());
            // Rejection is a failure; route it through running so the
            // observed status path stays on the declared graph.
            self.stores.tasks.mark_running(task.id).await?;
            self.stores.tasks.fail(task.id, &reason, None).await?;
            self.finalize_reaction(&task, "x").await;
            let rejected = blocks::rejected(&task, &reason);
            let _ = self
                .notifier
                .post_blocks(
                    task.channel_id.as_str(),
                    task.thread_ts.as_deref(),
                    "Task rejected",
                    &rejected,
                )
                .await;
            self.stores
                .audit
                .record(
                    "task:failed",
                    "task",
                    &task.id.to_string(),
                    None,
                    serde_json::json!({ "reason": reason }),
                )
                .await?;
        }
        Ok(())
    }

    async fn on_progress(&self, payload: TaskProgress) -> StorageResult<()> {
        if payload.kind != ProgressKind::ToolUse {
            debug!(task = %payload.task_id, message = %payload.message, "info progress");
            return Ok(());
        }
        let task = self.stores.tasks.require(payload.task_id).await?;
        self.progress
            .record_step(
                task.id,
                task.channel_id.as_str(),
                task.thread_ts.as_deref(),
                &step_description(&payload.message),
            )
            .await;
        Ok(())
    }

    async fn on_stream(&self, payload: TaskStream) -> StorageResult<()> {
        let task = self.stores.tasks.require(payload.task_id).await?;
        if task.status.is_terminal() {
            debug!(task = %task.id, "stream delta after terminal state dropped");
            return Ok(());
        }
        self.accumulator.add_delta(
            task.id,
            &payload.delta,
            task.channel_id.as_str(),
            task.thread_ts.as_deref(),
        );
        Ok(())
    }

    async fn on_complete(&self, agent: &AgentId, payload: TaskComplete) -> StorageResult<()> {
        let task = self.stores.tasks.require(payload.task_id).await?;
        if task.status.is_terminal() {
            debug!(task = %task.id, "duplicate terminal frame ignored");
            return Ok(());
        }
        // A lost ack leaves the row pending/queued; pull it onto the graph.
        if task.status != TaskStatus::Running {
            self.stores.tasks.mark_running(task.id).await?;
        }

        // Session durability comes first: resume must survive anything that
        // happens after this point.
        if let Some(session_id) = &payload.session_id {
            self.stores.tasks.set_session_id(task.id, session_id).await?;
            self.upsert_session(&task, agent, session_id, &payload).await?;
        }

        if task.command == DECOMPOSE_COMMAND {
            // The planning parent stays running until its children are all
            // terminal; its completion is the parent-summary path.
            self.health.record_outcome(agent, true);
            match self
                .commands
                .handle_decomposition_complete(&task, &payload.result)
                .await
            {
                Ok(children) => {
                    info!(parent = %task.id, children = children.len(), "decomposition dispatched");
                }
                Err(err) => {
                    warn!(parent = %task.id, error = %err, "decomposition dispatch failed");
                    self.stores
                        .tasks
                        .fail(task.id, &format!("decomposition failed: {err}"), None)
                        .await?;
                    self.finalize_reaction(&task, "x").await;
                }
            }
            self.accumulator.remove(task.id);
            self.progress.remove(task.id);
            return Ok(());
        }

        let update = CompletionUpdate {
            result: payload.result.clone(),
            session_id: payload.session_id.clone(),
            input_tokens: i64::try_from(payload.input_tokens).unwrap_or(i64::MAX),
            output_tokens: i64::try_from(payload.output_tokens).unwrap_or(i64::MAX),
            estimated_cost: payload.estimated_cost,
            files_changed: payload.files_changed.clone(),
            commands_run: payload.commands_run.clone(),
        };
        if !self.stores.tasks.complete(task.id, &update).await? {
            debug!(task = %task.id, "terminal write lost the race, skipping effects");
            return Ok(());
        }

        self.health.record_outcome(agent, true);
        self.sync.on_task_complete(task.id, true).await;

        // Stream buffer goes before the terminal block so a late flush can
        // never clobber it.
        self.accumulator.remove(task.id);
        self.progress.remove(task.id);

        let terminal = blocks::completed(&task, &payload);
        let _ = self
            .notifier
            .post_blocks(
                task.channel_id.as_str(),
                task.thread_ts.as_deref(),
                "Task complete",
                &terminal,
            )
            .await;
        if !task.is_subtask() {
            self.finalize_reaction(&task, "white_check_mark").await;
        }

        self.stores
            .audit
            .record(
                "task:completed",
                "task",
                &task.id.to_string(),
                None,
                serde_json::json!({
                    "cost": payload.estimated_cost,
                    "inputTokens": payload.input_tokens,
                    "outputTokens": payload.output_tokens,
                    "continuations": payload.continuations,
                }),
            )
            .await?;

        if let Some(parent_id) = task.parent_task_id {
            self.maybe_finalize_parent(parent_id).await?;
        }
        Ok(())
    }

    async fn on_error(&self, agent: &AgentId, payload: TaskError) -> StorageResult<()> {
        let task = self.stores.tasks.require(payload.task_id).await?;
        if task.status.is_terminal() {
            debug!(task = %task.id, "duplicate terminal frame ignored");
            return Ok(());
        }
        if task.status != TaskStatus::Running {
            self.stores.tasks.mark_running(task.id).await?;
        }

        if let Some(session_id) = &payload.session_id {
            // Preserved so the session can be resumed after the failure.
            self.stores.tasks.set_session_id(task.id, session_id).await?;
        }

        if !self
            .stores
            .tasks
            .fail(task.id, &payload.error, payload.session_id.as_deref())
            .await?
        {
            debug!(task = %task.id, "terminal write lost the race, skipping effects");
            return Ok(());
        }

        self.health.record_outcome(agent, false);
        self.sync.on_task_complete(task.id, false).await;

        self.accumulator.remove(task.id);
        self.progress.remove(task.id);

        let failed = blocks::failed(&task, &payload.error, payload.recoverable);
        let _ = self
            .notifier
            .post_blocks(
                task.channel_id.as_str(),
                task.thread_ts.as_deref(),
                "Task failed",
                &failed,
            )
            .await;
        if !task.is_subtask() {
            self.finalize_reaction(&task, "x").await;
        }

        self.stores
            .audit
            .record(
                "task:failed",
                "task",
                &task.id.to_string(),
                None,
                serde_json::json!({ "error": payload.error, "recoverable": payload.recoverable }),
            )
            .await?;

        if let Some(parent_id) = task.parent_task_id {
            self.maybe_finalize_parent(parent_id).await?;
        }
        Ok(())
    }

    async fn on_cancelled(&self, payload: TaskCancelled) -> StorageResult<()> {
        let task = self.stores.tasks.require(payload.task_id).await?;
        let applied = self
            .stores
            .tasks
            .cancel(task.id, Some(&payload.reason))
            .await?;

        self.accumulator.remove(task.id);
        self.progress.remove(task.id);

        if applied {
            self.sync.on_task_complete(task.id, false).await;
            if !task.is_subtask() {
                self.finalize_reaction(&task, "no_entry_sign").await;
            }
            self.stores
                .audit
                .record(
                    "task:cancelled",
                    "task",
                    &task.id.to_string(),
                    None,
                    serde_json::json!({ "reason": payload.reason }),
                )
                .await?;
        }

        if let Some(parent_id) = task.parent_task_id {
            self.maybe_finalize_parent(parent_id).await?;
        }
        Ok(())
    }

    async fn on_deploy_result(&self, payload: DeployResult) -> StorageResult<()> {
        let Some(registration) = self.deploys.take(payload.request_id) else {
            warn!(request = %payload.request_id, "deploy result for unknown request discarded");
            return Ok(());
        };

        let outcome = blocks::deploy_outcome(
            payload.success,
            &payload.output,
            payload.build_logs_url.as_deref(),
        );
        let _ = self
            .notifier
            .post_blocks(
                &registration.channel_id,
                registration.thread_ts.as_deref(),
                if payload.success { "Deploy succeeded" } else { "Deploy failed" },
                &outcome,
            )
            .await;

        self.stores
            .audit
            .record(
                if payload.success { "deploy:succeeded" } else { "deploy:failed" },
                "deploy",
                &payload.request_id.to_string(),
                Some(&registration.requested_by),
                serde_json::json!({}),
            )
            .await?;

        if let Some(workflow_id) = registration.workflow_id {
            self.sync.on_deploy_complete(workflow_id, payload.success).await;
        }
        Ok(())
    }

    fn on_path_validate_result(&self, payload: PathValidateResult) -> StorageResult<()> {
        if !self.path_validations.resolve(payload.request_id, payload.clone()) {
            warn!(request = %payload.request_id, "path-validate result for unknown request discarded");
        }
        Ok(())
    }

    fn on_agent_status(&self, agent: &AgentId, payload: AgentStatus) -> StorageResult<()> {
        self.registry.apply_status_report(
            agent,
            payload.status == ReportedStatus::Busy,
            payload.active_task_ids,
        );
        Ok(())
    }

    /// Completes the parent once its last child reaches a terminal state:
    /// posts the aggregate summary and writes the aggregated terminal row.
    async fn maybe_finalize_parent(&self, parent_id: TaskId) -> StorageResult<()> {
        let children = self.stores.tasks.children_of(parent_id).await?;
        if children.is_empty() || children.iter().any(|c| !c.status.is_terminal()) {
            return Ok(());
        }
        let parent = self.stores.tasks.require(parent_id).await?;
        if parent.status.is_terminal() {
            return Ok(());
        }

        let summary = blocks::parent_summary(&parent, &children);
        let _ = self
            .notifier
            .post_blocks(
                parent.channel_id.as_str(),
                parent.thread_ts.as_deref(),
                "Subtasks finished",
                &summary,
            )
            .await;

        let completed = children
            .iter()
            .filter(|c| c.status == TaskStatus::Completed)
            .count();
        let total_cost: f64 = children.iter().map(|c| c.estimated_cost).sum();
        let mut files = Vec::new();
        let mut commands = Vec::new();
        for child in &children {
            for f in &child.files_changed {
                crate::domain::task::push_unique(&mut files, f.clone());
            }
            for c in &child.commands_run {
                crate::domain::task::push_unique(&mut commands, c.clone());
            }
        }

        if parent.status != TaskStatus::Running {
            self.stores.tasks.mark_running(parent.id).await?;
        }
        let update = CompletionUpdate {
            result: format!("{completed} of {} subtasks completed", children.len()),
            session_id: None,
            input_tokens: children.iter().map(|c| c.input_tokens).sum(),
            output_tokens: children.iter().map(|c| c.output_tokens).sum(),
            estimated_cost: total_cost,
            files_changed: files,
            commands_run: commands,
        };
        if self.stores.tasks.complete(parent.id, &update).await? {
            self.finalize_reaction(&parent, "white_check_mark").await;
            self.stores
                .audit
                .record(
                    "task:completed",
                    "task",
                    &parent.id.to_string(),
                    None,
                    serde_json::json!({ "subtasks": children.len(), "cost": total_cost }),
                )
                .await?;
            info!(parent = %parent.id, "parent task finalized");
        }
        Ok(())
    }

    /// Clears the pending reactions and sets the terminal one.
    async fn finalize_reaction(&self, task: &Task, emoji: &str) {
        let Some(ts) = &task.message_ts else { return };
        let channel = task.channel_id.as_str();
        let _ = self.notifier.remove_reaction(channel, ts, "hourglass_flowing_sand").await;
        let _ = self.notifier.remove_reaction(channel, ts, "inbox_tray").await;
        let _ = self.notifier.add_reaction(channel, ts, emoji).await;
    }

    async fn upsert_session(
        &self,
        task: &Task,
        agent: &AgentId,
        session_id: &str,
        payload: &TaskComplete,
    ) -> StorageResult<()> {
        let model = self
            .stores
            .projects
            .get(task.project_id)
            .await?
            .map(|p| p.default_model)
            .unwrap_or_default();
        let mut record = session_store::new_session(
            session_id.to_string(),
            task.id,
            agent.clone(),
            model,
            self.session_ttl_secs,
        );
        record.input_tokens = i64::try_from(payload.input_tokens).unwrap_or(i64::MAX);
        record.output_tokens = i64::try_from(payload.output_tokens).unwrap_or(i64::MAX);
        record.estimated_cost = payload.estimated_cost;
        record.duration_ms = i64::try_from(payload.duration_ms).unwrap_or(i64::MAX);
        record.status = crate::domain::SessionStatus::Completed;
        record.completed_at = Some(chrono::Utc::now());
        self.stores.sessions.upsert(&record).await
    }
}
