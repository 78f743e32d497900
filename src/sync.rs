//! Sync workflow orchestrator: test + build in parallel, two-phase agent
//! restart, event-driven deploy.
//!
//! Every phase advances on a real signal — task completions, registry
//! connection edges, deploy results — never on wall-clock guessing. The
//! restart wait demands a falling edge *then* a rising edge so the deploy
//! cannot be handed to the dying connection.

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::commands::{CommandError, CommandService, SubmitRequest};
use crate::domain::{
    AgentId, AgentSelector, BotName, ChannelId, ChatUserId, Project, RequestId, SyncStatus,
    SyncWorkflow, TaskId, WorkflowId,
};
use crate::notifier::Notifier;
use crate::pending::{DeployRegistration, DeployTable};
use crate::protocol::{DeployRequest, Frame, SystemRestart};
use crate::registry::{AgentEvent, AgentRegistry};
use crate::storage::AuditStore;

/// Sync orchestration failures.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("project has no pinned agent; sync needs a fixed worker host")]
    AutoProject,

    #[error(transparent)]
    Command(#[from] CommandError),
}

/// Orchestrates sync workflows and owns their in-memory state.
pub struct SyncOrchestrator {
    workflows: DashMap<WorkflowId, SyncWorkflow>,
    task_index: DashMap<TaskId, WorkflowId>,
    registry: Arc<AgentRegistry>,
    notifier: Arc<Notifier>,
    audit: AuditStore,
    deploys: Arc<DeployTable>,
    restart_timeout: Duration,
    deploy_timeout: Duration,
    retention: Duration,
}

impl SyncOrchestrator {
    /// Wires the orchestrator.
    #[must_use]
    pub fn new(
        registry: Arc<AgentRegistry>,
        notifier: Arc<Notifier>,
        audit: AuditStore,
        deploys: Arc<DeployTable>,
        restart_timeout: Duration,
        deploy_timeout: Duration,
        retention: Duration,
    ) -> Self {
        Self {
            workflows: DashMap::new(),
            task_index: DashMap::new(),
            registry,
            notifier,
            audit,
            deploys,
            restart_timeout,
            deploy_timeout,
            retention,
        }
    }

    /// Starts a sync workflow: submits the test and build legs in parallel
    /// and registers their task ids.
    #[instrument(skip(self, commands, project), fields(project = %project.id))]
    pub async fn start_sync(
        self: &Arc<Self>,
        commands: &CommandService,
        project: &Project,
        channel_id: ChannelId,
        thread_ts: Option<String>,
        requested_by: ChatUserId,
    ) -> Result<WorkflowId, SyncError> {
        let AgentSelector::Pinned(agent) = &project.agent else {
            return Err(SyncError::AutoProject);
        };

        let id = WorkflowId::generate();
        let mut workflow = SyncWorkflow {
            id,
            project_id: project.id,
            agent_id: agent.clone(),
            local_path: project.local_path.clone(),
            channel_id: channel_id.clone(),
            thread_ts: thread_ts.clone(),
            requested_by: requested_by.clone(),
            status: SyncStatus::Testing,
            test_task_id: None,
            build_task_id: None,
            deploy_request_id: None,
            test_ok: None,
            build_ok: None,
            created_at: Utc::now(),
            completed_at: None,
            error: None,
        };

        let ops = BotName::try_new("ops".to_string()).expect("builtin bot name");
        let base = SubmitRequest {
            bot: ops,
            command: String::new(),
            prompt: String::new(),
            project: project.clone(),
            channel_id: channel_id.clone(),
            thread_ts: thread_ts.clone(),
            user_id: requested_by,
            message_ts: None,
            attachments: Vec::new(),
            resume_session_id: None,
            parent_task_id: None,
            max_continuations_override: None,
        };

        let test_task = commands
            .submit(SubmitRequest {
                command: "test".to_string(),
                prompt: "Run the project test suite and report pass or fail.".to_string(),
                ..base.clone()
            })
            .await?;
        let build_task = commands
            .submit(SubmitRequest {
                command: "build".to_string(),
                prompt: "Run the project build and report pass or fail.".to_string(),
                ..base
            })
            .await?;

        workflow.test_task_id = Some(test_task);
        workflow.build_task_id = Some(build_task);
        self.task_index.insert(test_task, id);
        self.task_index.insert(build_task, id);
        self.workflows.insert(id, workflow);

        let _ = self
            .notifier
            .post_message(
                channel_id.as_str(),
                thread_ts.as_deref(),
                "🔄 Sync started — running tests and build in parallel…",
            )
            .await;
        let _ = self
            .audit
            .record("sync:started", "workflow", &id.to_string(), None, serde_json::json!({}))
            .await;

        info!(workflow = %id, %test_task, %build_task, "sync workflow started");
        Ok(id)
    }

    /// True when the task belongs to a live workflow.
    #[must_use]
    pub fn involves_task(&self, task: TaskId) -> bool {
        self.task_index.contains_key(&task)
    }

    /// Feeds a terminal task outcome into its workflow, if any. Test and
    /// build may land in either order; restart waits for both.
    pub async fn on_task_complete(self: &Arc<Self>, task: TaskId, success: bool) {
        let Some((_, workflow_id)) = self.task_index.remove(&task) else {
            return;
        };
        let (proceed, channel, thread, agent) = {
            let Some(mut workflow) = self.workflows.get_mut(&workflow_id) else {
                warn!(%task, "task completion for unknown workflow");
                return;
            };
            if workflow.status.is_terminal() {
                return;
            }

            let leg = if workflow.test_task_id == Some(task) {
                workflow.test_ok = Some(success);
                "Tests"
            } else {
                workflow.build_ok = Some(success);
                "Build"
            };

            if !success {
                let channel = workflow.channel_id.clone();
                let thread = workflow.thread_ts.clone();
                drop(workflow);
                self.fail_workflow(workflow_id, &format!("{leg} failed")).await;
                let _ = self
                    .notifier
                    .post_message(
                        channel.as_str(),
                        thread.as_deref(),
                        &format!("❌ {leg} failed — sync aborted before restart."),
                    )
                    .await;
                return;
            }

            let waiting_on = if workflow.test_ok.is_none() {
                Some("tests")
            } else if workflow.build_ok.is_none() {
                Some("build")
            } else {
                None
            };
            workflow.status = match waiting_on {
                Some("tests") => SyncStatus::Testing,
                Some("build") => SyncStatus::Building,
                _ => workflow.status,
            };

            (
                workflow.ready_to_restart(),
                workflow.channel_id.clone(),
                workflow.thread_ts.clone(),
                workflow.agent_id.clone(),
            )
        };

        if proceed {
            self.begin_restart(workflow_id, channel, thread, agent).await;
        } else {
            let _ = self
                .notifier
                .post_message(
                    channel.as_str(),
                    thread.as_deref(),
                    "✅ One leg passed — waiting for the other…",
                )
                .await;
        }
    }

    /// Restart phase: send the restart frame, then demand the falling edge
    /// followed by the rising edge before deploying.
    async fn begin_restart(
        self: &Arc<Self>,
        workflow_id: WorkflowId,
        channel: ChannelId,
        thread: Option<String>,
        agent: AgentId,
    ) {
        if let Some(mut workflow) = self.workflows.get_mut(&workflow_id) {
            workflow.status = SyncStatus::Restarting;
        }
        let _ = self
            .notifier
            .post_message(
                channel.as_str(),
                thread.as_deref(),
                "✅ Tests and build passed — restarting the agent…",
            )
            .await;

        // Subscribe before sending the restart so neither edge can be missed.
        let mut events = self.registry.subscribe();
        let sent = self.registry.send(
            &agent,
            Frame::SystemRestart(SystemRestart {
                reason: "sync workflow restart".to_string(),
                rebuild: Some(true),
            }),
        );
        if !sent {
            self.fail_workflow(workflow_id, "agent offline at restart").await;
            return;
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let watch = async {
                // Falling edge first: an agent that never disconnects is an
                // old connection that would swallow the deploy.
                loop {
                    match events.recv().await {
                        Ok(AgentEvent::Disconnected(a)) if a == agent => break,
                        Ok(_) => {}
                        Err(_) => return Err("registry event stream closed"),
                    }
                }
                loop {
                    match events.recv().await {
                        Ok(AgentEvent::Connected(a)) if a == agent => return Ok(()),
                        Ok(_) => {}
                        Err(_) => return Err("registry event stream closed"),
                    }
                }
            };

            match tokio::time::timeout(this.restart_timeout, watch).await {
                Ok(Ok(())) => this.begin_deploy(workflow_id, channel, thread, agent).await,
                Ok(Err(reason)) => this.fail_workflow(workflow_id, reason).await,
                Err(_) => {
                    this.fail_workflow(workflow_id, "agent did not complete restart in time")
                        .await;
                }
            }
        });
    }

    /// Deploy phase: register the request id, send the frame, arm the
    /// safety timeout.
    async fn begin_deploy(
        self: &Arc<Self>,
        workflow_id: WorkflowId,
        channel: ChannelId,
        thread: Option<String>,
        agent: AgentId,
    ) {
        let request_id = RequestId::generate();
        let (local_path, requested_by) = {
            let Some(mut workflow) = self.workflows.get_mut(&workflow_id) else {
                return;
            };
            workflow.status = SyncStatus::Deploying;
            workflow.deploy_request_id = Some(request_id);
            (workflow.local_path.clone(), workflow.requested_by.clone())
        };

        self.deploys.register(
            request_id,
            DeployRegistration {
                channel_id: channel.as_str().to_string(),
                thread_ts: thread.clone(),
                requested_by: requested_by.as_str().to_string(),
                workflow_id: Some(workflow_id),
            },
        );

        let sent = self.registry.send(
            &agent,
            Frame::DeployRequest(DeployRequest {
                request_id,
                local_path,
                channel_id: channel.as_str().to_string(),
                thread_ts: thread.clone(),
                requested_by: requested_by.as_str().to_string(),
            }),
        );
        if !sent {
            let _ = self.deploys.take(request_id);
            self.fail_workflow(workflow_id, "agent offline at deploy").await;
            return;
        }

        let _ = self
            .notifier
            .post_message(
                channel.as_str(),
                thread.as_deref(),
                "🔁 Agent back online — deploying…",
            )
            .await;

        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(this.deploy_timeout).await;
            let still_waiting = this
                .workflows
                .get(&workflow_id)
                .is_some_and(|w| w.status == SyncStatus::Deploying
                    && w.deploy_request_id == Some(request_id));
            if still_waiting {
                let _ = this.deploys.take(request_id);
                this.fail_workflow(workflow_id, "no deploy result within the timeout")
                    .await;
            }
        });
    }

    /// Feeds a deploy result into its workflow.
    pub async fn on_deploy_complete(self: &Arc<Self>, workflow_id: WorkflowId, success: bool) {
        if success {
            self.complete_workflow(workflow_id).await;
        } else {
            self.fail_workflow(workflow_id, "deploy failed").await;
        }
    }

    async fn complete_workflow(&self, workflow_id: WorkflowId) {
        let Some(mut workflow) = self.workflows.get_mut(&workflow_id) else {
            return;
        };
        if workflow.status.is_terminal() {
            return;
        }
        workflow.status = SyncStatus::Completed;
        workflow.completed_at = Some(Utc::now());
        let channel = workflow.channel_id.clone();
        let thread = workflow.thread_ts.clone();
        drop(workflow);

        info!(workflow = %workflow_id, "sync workflow completed");
        let _ = self
            .notifier
            .post_message(channel.as_str(), thread.as_deref(), "🎉 Sync completed.")
            .await;
        let _ = self
            .audit
            .record(
                "sync:completed",
                "workflow",
                &workflow_id.to_string(),
                None,
                serde_json::json!({}),
            )
            .await;
    }

    async fn fail_workflow(&self, workflow_id: WorkflowId, reason: &str) {
        let Some(mut workflow) = self.workflows.get_mut(&workflow_id) else {
            return;
        };
        if workflow.status.is_terminal() {
            return;
        }
        workflow.status = SyncStatus::Failed;
        workflow.completed_at = Some(Utc::now());
        workflow.error = Some(reason.to_string());
        let channel = workflow.channel_id.clone();
        let thread = workflow.thread_ts.clone();
        drop(workflow);

        warn!(workflow = %workflow_id, reason, "sync workflow failed");
        let _ = self
            .notifier
            .post_message(
                channel.as_str(),
                thread.as_deref(),
                &format!("❌ Sync failed: {reason}"),
            )
            .await;
        let _ = self
            .audit
            .record(
                "sync:failed",
                "workflow",
                &workflow_id.to_string(),
                None,
                serde_json::json!({ "reason": reason }),
            )
            .await;
    }

    /// Reads one workflow's state (admin and tests).
    #[must_use]
    pub fn workflow(&self, id: WorkflowId) -> Option<SyncWorkflow> {
        self.workflows.get(&id).map(|w| w.clone())
    }

    /// Drops terminal workflows past the retention window.
    pub fn sweep(&self) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.retention)
                .unwrap_or_else(|_| chrono::Duration::hours(1));
        let before = self.workflows.len();
        self.workflows.retain(|_, w| {
            !(w.status.is_terminal() && w.completed_at.is_some_and(|at| at < cutoff))
        });
        self.deploys.sweep_expired();
        before - self.workflows.len()
    }

    /// Sweep loop until cancelled.
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => { self.sweep(); }
                () = cancel.cancelled() => return,
            }
        }
    }
}
