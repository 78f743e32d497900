//! Chat surface entry: authz, rate limiting, command dispatch.
//!
//! The workspace delivers slash commands and channel messages; everything
//! here is thin — resolve the user and project, apply the rate limit, then
//! hand off to the command service or orchestrator. Permanent domain
//! errors surface to the user as a ❌-prefixed line.

use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::commands::{CommandError, CommandService, SubmitRequest};
use crate::domain::{BotName, ChannelId, ChatUserId, Project, TaskId, UserRole};
use crate::notifier::Notifier;
use crate::pending::{DeployRegistration, DeployTable};
use crate::protocol::{DeployRequest, Frame};
use crate::rate_limit::RateLimiter;
use crate::registry::{AgentRegistry, Resolution};
use crate::storage::Stores;
use crate::sync::SyncOrchestrator;

/// A slash-command invocation as delivered by the workspace.
#[derive(Debug, Clone)]
pub struct SlashCommand {
    pub channel_id: String,
    pub user_id: String,
    pub user_name: String,
    /// Everything after the slash command itself.
    pub text: String,
    /// Timestamp of the triggering message, when the surface provides one.
    pub message_ts: Option<String>,
}

/// A plain channel message.
#[derive(Debug, Clone)]
pub struct ChannelMessage {
    pub channel_id: String,
    pub user_id: String,
    pub user_name: String,
    pub text: String,
    pub message_ts: String,
    pub thread_ts: Option<String>,
}

/// Chat event handler.
pub struct ChatHandler {
    stores: Stores,
    commands: Arc<CommandService>,
    sync: Arc<SyncOrchestrator>,
    registry: Arc<AgentRegistry>,
    notifier: Arc<Notifier>,
    rate_limiter: Arc<RateLimiter>,
    deploys: Arc<DeployTable>,
    offline_queue: Arc<crate::offline_queue::OfflineQueue>,
}

impl ChatHandler {
    /// Wires the handler.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stores: Stores,
        commands: Arc<CommandService>,
        sync: Arc<SyncOrchestrator>,
        registry: Arc<AgentRegistry>,
        notifier: Arc<Notifier>,
        rate_limiter: Arc<RateLimiter>,
        deploys: Arc<DeployTable>,
        offline_queue: Arc<crate::offline_queue::OfflineQueue>,
    ) -> Self {
        Self {
            stores,
            commands,
            sync,
            registry,
            notifier,
            rate_limiter,
            deploys,
            offline_queue,
        }
    }

    /// Handles one `/bm` invocation.
    #[instrument(skip(self, cmd), fields(channel = %cmd.channel_id, user = %cmd.user_id))]
    pub async fn handle_slash_command(&self, cmd: SlashCommand) {
        let Some((channel, user_id)) = self.parse_ids(&cmd.channel_id, &cmd.user_id).await else {
            return;
        };

        let Some(user) = self.admit(&channel, &user_id, &cmd.user_name).await else {
            return;
        };

        let mut words = cmd.text.split_whitespace();
        let subcommand = words.next().unwrap_or("").to_lowercase();
        let rest = words.collect::<Vec<_>>().join(" ");

        match subcommand.as_str() {
            "build" | "fix" => {
                self.submit_task(&channel, &user_id, &cmd, "coder", "build", &rest, false)
                    .await;
            }
            "feature" => {
                self.submit_task(&channel, &user_id, &cmd, "coder", "feature", &rest, true)
                    .await;
            }
            "test" => {
                self.submit_task(
                    &channel,
                    &user_id,
                    &cmd,
                    "ops",
                    "test",
                    "Run the project test suite and report pass or fail.",
                    false,
                )
                .await;
            }
            "netsuite" => {
                self.submit_task(&channel, &user_id, &cmd, "netsuite", "build", &rest, true)
                    .await;
            }
            "deploy" => self.start_deploy(&channel, &user_id, &cmd).await,
            "sync" => self.start_sync(&channel, &user_id, &cmd).await,
            "agents" => self.show_agents(&channel, &user_id).await,
            "queue" => self.show_queue(&channel, &user_id).await,
            "cancel" => self.cancel_task(&channel, &user_id, user.role, &rest).await,
            _ => {
                let bots = self.commands.bots().names().join(", ");
                self.ephemeral(
                    &channel,
                    &user_id,
                    &format!(
                        "Usage: `/bm <build|feature|test|netsuite|deploy|sync|agents|queue|cancel> …` (bots: {bots})"
                    ),
                )
                .await;
            }
        }
    }

    /// Handles a plain message in a configured channel as a coder request.
    pub async fn handle_message(&self, message: ChannelMessage) {
        if message.text.trim().is_empty() {
            return;
        }
        let Some((channel, user_id)) = self.parse_ids(&message.channel_id, &message.user_id).await
        else {
            return;
        };
        if self.admit(&channel, &user_id, &message.user_name).await.is_none() {
            return;
        }
        let Some(project) = self.project_for(&channel, &user_id).await else {
            return;
        };

        let request = SubmitRequest {
            bot: BotName::try_new("coder".to_string()).expect("builtin bot name"),
            command: "build".to_string(),
            prompt: message.text.clone(),
            project,
            channel_id: channel.clone(),
            thread_ts: message.thread_ts.clone(),
            user_id: user_id.clone(),
            message_ts: Some(message.message_ts.clone()),
            attachments: Vec::new(),
            resume_session_id: None,
            parent_task_id: None,
            max_continuations_override: None,
        };
        if let Err(err) = self.commands.submit(request).await {
            self.report_command_error(&channel, &user_id, &err).await;
        }
    }

    async fn parse_ids(&self, channel: &str, user: &str) -> Option<(ChannelId, ChatUserId)> {
        match (
            ChannelId::try_new(channel.to_string()),
            ChatUserId::try_new(user.to_string()),
        ) {
            (Ok(c), Ok(u)) => Some((c, u)),
            _ => {
                warn!(channel, user, "malformed chat identifiers");
                None
            }
        }
    }

    /// Upserts the user and applies the rate limit.
    async fn admit(
        &self,
        channel: &ChannelId,
        user_id: &ChatUserId,
        user_name: &str,
    ) -> Option<crate::domain::User> {
        let user = match self.stores.users.upsert_on_contact(user_id, user_name).await {
            Ok(user) => user,
            Err(err) => {
                warn!(error = %err, "user upsert failed");
                return None;
            }
        };
        if !self.rate_limiter.check(user_id, user.rate_limit_per_minute) {
            self.ephemeral(channel, user_id, "❌ Rate limit exceeded — try again in a minute.")
                .await;
            return None;
        }
        Some(user)
    }

    async fn project_for(&self, channel: &ChannelId, user_id: &ChatUserId) -> Option<Project> {
        match self.stores.projects.find_by_channel(channel).await {
            Ok(Some(project)) => Some(project),
            Ok(None) => {
                self.ephemeral(
                    channel,
                    user_id,
                    "❌ This channel has no configured project.",
                )
                .await;
                None
            }
            Err(err) => {
                warn!(error = %err, "project lookup failed");
                None
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn submit_task(
        &self,
        channel: &ChannelId,
        user_id: &ChatUserId,
        cmd: &SlashCommand,
        bot: &str,
        command: &str,
        prompt: &str,
        decompose: bool,
    ) {
        if prompt.trim().is_empty() {
            self.ephemeral(channel, user_id, "❌ Nothing to do — add a prompt.").await;
            return;
        }
        let Some(project) = self.project_for(channel, user_id).await else {
            return;
        };

        let request = SubmitRequest {
            bot: BotName::try_new(bot.to_string()).expect("builtin bot name"),
            command: command.to_string(),
            prompt: prompt.to_string(),
            project,
            channel_id: channel.clone(),
            thread_ts: None,
            user_id: user_id.clone(),
            message_ts: cmd.message_ts.clone(),
            attachments: Vec::new(),
            resume_session_id: None,
            parent_task_id: None,
            max_continuations_override: None,
        };

        let outcome = if decompose {
            self.commands.submit_with_decomposition(request).await
        } else {
            self.commands.submit(request).await
        };
        match outcome {
            Ok(task_id) => info!(%task_id, "task submitted from chat"),
            Err(err) => self.report_command_error(channel, user_id, &err).await,
        }
    }

    async fn start_deploy(&self, channel: &ChannelId, user_id: &ChatUserId, cmd: &SlashCommand) {
        let Some(project) = self.project_for(channel, user_id).await else {
            return;
        };
        let request_id = crate::domain::RequestId::generate();
        self.deploys.register(
            request_id,
            DeployRegistration {
                channel_id: channel.as_str().to_string(),
                thread_ts: None,
                requested_by: user_id.as_str().to_string(),
                workflow_id: None,
            },
        );
        let frame = Frame::DeployRequest(DeployRequest {
            request_id,
            local_path: project.local_path.clone(),
            channel_id: channel.as_str().to_string(),
            thread_ts: None,
            requested_by: user_id.as_str().to_string(),
        });

        match self.registry.resolve(&project.agent) {
            Resolution::Online(agent) if self.registry.send(&agent, frame.clone()) => {
                let _ = self
                    .notifier
                    .post_message(channel.as_str(), None, "🚀 Deploy requested…")
                    .await;
            }
            Resolution::Online(agent) | Resolution::QueueOffline(agent) => {
                if let Err(err) = self.offline_queue.enqueue(&agent, &frame).await {
                    warn!(error = %err, "deploy enqueue failed");
                    self.ephemeral(channel, user_id, "❌ Could not queue the deploy.").await;
                } else {
                    let _ = self
                        .notifier
                        .post_message(
                            channel.as_str(),
                            None,
                            "📥 Agent offline — deploy queued for reconnect.",
                        )
                        .await;
                }
            }
            Resolution::NoAgents => {
                self.ephemeral(channel, user_id, "❌ No agents online to deploy.").await;
            }
        }
    }

    async fn start_sync(&self, channel: &ChannelId, user_id: &ChatUserId, _cmd: &SlashCommand) {
        let Some(project) = self.project_for(channel, user_id).await else {
            return;
        };
        if let Err(err) = self
            .sync
            .start_sync(&self.commands, &project, channel.clone(), None, user_id.clone())
            .await
        {
            self.ephemeral(channel, user_id, &format!("❌ Sync not started: {err}"))
                .await;
        }
    }

    async fn show_agents(&self, channel: &ChannelId, user_id: &ChatUserId) {
        let snapshot = self.registry.snapshot();
        if snapshot.is_empty() {
            self.ephemeral(channel, user_id, "No agents connected.").await;
            return;
        }
        let lines: Vec<String> = snapshot
            .iter()
            .map(|agent| {
                format!(
                    "• `{}` — {:?}, {} active task(s)",
                    agent.agent_id,
                    agent.status,
                    agent.active_task_ids.len()
                )
            })
            .collect();
        self.ephemeral(channel, user_id, &lines.join("\n")).await;
    }

    async fn show_queue(&self, channel: &ChannelId, user_id: &ChatUserId) {
        match self.stores.offline_queue.pending_counts().await {
            Ok(counts) if counts.is_empty() => {
                self.ephemeral(channel, user_id, "Offline queue is empty.").await;
            }
            Ok(counts) => {
                let lines: Vec<String> = counts
                    .iter()
                    .map(|(agent, count)| format!("• `{}` — {count} pending", agent.as_str()))
                    .collect();
                self.ephemeral(channel, user_id, &lines.join("\n")).await;
            }
            Err(err) => {
                warn!(error = %err, "queue stats failed");
            }
        }
    }

    async fn cancel_task(
        &self,
        channel: &ChannelId,
        user_id: &ChatUserId,
        role: UserRole,
        rest: &str,
    ) {
        let Ok(uuid) = Uuid::parse_str(rest.trim()) else {
            self.ephemeral(channel, user_id, "❌ Usage: `/bm cancel <task-id>`").await;
            return;
        };
        let task_id = TaskId::new(uuid);

        let task = match self.stores.tasks.get(task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                self.ephemeral(channel, user_id, "❌ No such task.").await;
                return;
            }
            Err(err) => {
                warn!(error = %err, "task lookup failed");
                return;
            }
        };
        if role != UserRole::Admin && task.user_id != *user_id {
            self.ephemeral(channel, user_id, "❌ Only admins may cancel other users' tasks.")
                .await;
            return;
        }

        match self
            .commands
            .cancel(task_id, "cancelled from chat", Some(user_id))
            .await
        {
            Ok(0) => {
                self.ephemeral(channel, user_id, "Task is already finished.").await;
            }
            Ok(count) => {
                let _ = self
                    .notifier
                    .post_message(
                        channel.as_str(),
                        None,
                        &format!("🚫 Cancelled {count} task(s)."),
                    )
                    .await;
            }
            Err(err) => self.report_command_error(channel, user_id, &err).await,
        }
    }

    async fn report_command_error(
        &self,
        channel: &ChannelId,
        user_id: &ChatUserId,
        err: &CommandError,
    ) {
        warn!(error = %err, "command failed");
        self.ephemeral(channel, user_id, &format!("❌ {err}")).await;
    }

    async fn ephemeral(&self, channel: &ChannelId, user_id: &ChatUserId, text: &str) {
        let _ = self
            .notifier
            .post_ephemeral(channel.as_str(), user_id.as_str(), text)
            .await;
    }
}
