//! Shared test harness: an assembled broker core over an in-memory
//! database and a recording chat API, with a fake agent hanging off the
//! registry.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use foreman::commands::CommandService;
use foreman::config::BreakerConfig;
use foreman::database::Database;
use foreman::domain::{
    AgentId, AgentSelector, BotName, ChannelId, ChatUserId, Project, ProjectId, Task, TaskId,
};
use foreman::health::HealthTracker;
use foreman::notifier::{ChatApi, ChatApiError, Notifier};
use foreman::offline_queue::OfflineQueue;
use foreman::pending::{DeployTable, PathValidations};
use foreman::progress::ProgressTrackers;
use foreman::protocol::Frame;
use foreman::registry::AgentRegistry;
use foreman::router::FrameRouter;
use foreman::storage::Stores;
use foreman::stream_accumulator::StreamAccumulator;
use foreman::sync::SyncOrchestrator;

/// One recorded chat call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCall {
    Post { channel: String, text: String, ts: String },
    Blocks { channel: String, fallback: String, ts: String },
    Update { ts: String, text: String },
    ReactionAdd { ts: String, name: String },
    ReactionRemove { ts: String, name: String },
    Ephemeral { user: String, text: String },
}

/// Chat API double that records every call and always succeeds.
#[derive(Default)]
pub struct RecordingChatApi {
    pub calls: Mutex<Vec<ChatCall>>,
    ts_seq: AtomicU64,
}

impl RecordingChatApi {
    fn next_ts(&self) -> String {
        format!("ts-{}", self.ts_seq.fetch_add(1, Ordering::SeqCst))
    }

    pub fn calls(&self) -> Vec<ChatCall> {
        self.calls.lock().unwrap().clone()
    }

    /// The final text of the message with timestamp `ts` (post + updates).
    pub fn message_text(&self, ts: &str) -> Option<String> {
        let calls = self.calls.lock().unwrap();
        let mut text = None;
        for call in calls.iter() {
            match call {
                ChatCall::Post { ts: t, text: body, .. } if t == ts => {
                    text = Some(body.clone());
                }
                ChatCall::Update { ts: t, text: body } if t == ts => {
                    text = Some(body.clone());
                }
                _ => {}
            }
        }
        text
    }

    /// Timestamps of plain posts, in order.
    pub fn post_timestamps(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                ChatCall::Post { ts, .. } => Some(ts.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn block_fallbacks(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                ChatCall::Blocks { fallback, .. } => Some(fallback.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn reactions_added(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                ChatCall::ReactionAdd { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl ChatApi for RecordingChatApi {
    async fn post_message(
        &self,
        channel: &str,
        _thread_ts: Option<&str>,
        text: &str,
    ) -> Result<String, ChatApiError> {
        let ts = self.next_ts();
        self.calls.lock().unwrap().push(ChatCall::Post {
            channel: channel.to_string(),
            text: text.to_string(),
            ts: ts.clone(),
        });
        Ok(ts)
    }

    async fn post_blocks(
        &self,
        channel: &str,
        _thread_ts: Option<&str>,
        fallback_text: &str,
        _blocks: &serde_json::Value,
    ) -> Result<String, ChatApiError> {
        let ts = self.next_ts();
        self.calls.lock().unwrap().push(ChatCall::Blocks {
            channel: channel.to_string(),
            fallback: fallback_text.to_string(),
            ts: ts.clone(),
        });
        Ok(ts)
    }

    async fn update_message(
        &self,
        _channel: &str,
        ts: &str,
        text: &str,
    ) -> Result<(), ChatApiError> {
        self.calls.lock().unwrap().push(ChatCall::Update {
            ts: ts.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn add_reaction(&self, _channel: &str, ts: &str, name: &str) -> Result<(), ChatApiError> {
        self.calls.lock().unwrap().push(ChatCall::ReactionAdd {
            ts: ts.to_string(),
            name: name.to_string(),
        });
        Ok(())
    }

    async fn remove_reaction(
        &self,
        _channel: &str,
        ts: &str,
        name: &str,
    ) -> Result<(), ChatApiError> {
        self.calls.lock().unwrap().push(ChatCall::ReactionRemove {
            ts: ts.to_string(),
            name: name.to_string(),
        });
        Ok(())
    }

    async fn post_ephemeral(
        &self,
        _channel: &str,
        user: &str,
        text: &str,
    ) -> Result<(), ChatApiError> {
        self.calls.lock().unwrap().push(ChatCall::Ephemeral {
            user: user.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn upload_file(&self, _: &str, _: &str, _: &[u8]) -> Result<(), ChatApiError> {
        Ok(())
    }
}

/// Assembled broker core for component-level scenarios.
pub struct Harness {
    pub api: Arc<RecordingChatApi>,
    pub stores: Stores,
    pub registry: Arc<AgentRegistry>,
    pub health: Arc<HealthTracker>,
    pub notifier: Arc<Notifier>,
    pub accumulator: Arc<StreamAccumulator>,
    pub progress: Arc<ProgressTrackers>,
    pub offline_queue: Arc<OfflineQueue>,
    pub commands: Arc<CommandService>,
    pub sync: Arc<SyncOrchestrator>,
    pub deploys: Arc<DeployTable>,
    pub router: Arc<FrameRouter>,
}

impl Harness {
    /// Builds the harness with short orchestration timeouts.
    pub async fn new() -> Self {
        Self::with_timeouts(Duration::from_millis(500), Duration::from_millis(500)).await
    }

    pub async fn with_timeouts(restart_timeout: Duration, deploy_timeout: Duration) -> Self {
        let db = Database::in_memory().await.unwrap();
        let stores = Stores::open(&db).await.unwrap();
        let api = Arc::new(RecordingChatApi::default());
        let notifier = Arc::new(Notifier::new(
            api.clone(),
            3,
            Duration::from_millis(1),
            32,
        ));
        let registry = Arc::new(AgentRegistry::new());
        let health = Arc::new(HealthTracker::new(BreakerConfig::default()));
        let accumulator = Arc::new(StreamAccumulator::new(Arc::clone(&notifier)));
        let progress = Arc::new(ProgressTrackers::new(
            Arc::clone(&notifier),
            64,
            Duration::from_secs(3600),
        ));
        let offline_queue = Arc::new(OfflineQueue::new(
            stores.offline_queue.clone(),
            Arc::clone(&registry),
            Duration::from_secs(86_400),
            Duration::from_secs(3600),
        ));
        let commands = Arc::new(CommandService::new(
            stores.clone(),
            Arc::clone(&registry),
            Arc::clone(&offline_queue),
            Arc::clone(&notifier),
            Arc::clone(&health),
            24,
        ));
        let deploys = Arc::new(DeployTable::new(Duration::from_secs(60)));
        let path_validations = Arc::new(PathValidations::new(Duration::from_secs(60)));
        let sync = Arc::new(SyncOrchestrator::new(
            Arc::clone(&registry),
            Arc::clone(&notifier),
            stores.audit.clone(),
            Arc::clone(&deploys),
            restart_timeout,
            deploy_timeout,
            Duration::from_secs(3600),
        ));
        let router = Arc::new(FrameRouter::new(
            stores.clone(),
            Arc::clone(&registry),
            Arc::clone(&health),
            Arc::clone(&accumulator),
            Arc::clone(&progress),
            Arc::clone(&notifier),
            Arc::clone(&commands),
            Arc::clone(&sync),
            Arc::clone(&deploys),
            Arc::clone(&path_validations),
            3600,
        ));

        Self {
            api,
            stores,
            registry,
            health,
            notifier,
            accumulator,
            progress,
            offline_queue,
            commands,
            sync,
            deploys,
            router,
        }
    }

    /// Stores a project pinned to `agent` on channel `channel`.
    pub async fn project(&self, channel: &str, agent: &str) -> Project {
        let now = Utc::now();
        let project = Project {
            id: ProjectId::generate(),
            name: "webapp".to_string(),
            channel_id: ChannelId::try_new(channel.to_string()).unwrap(),
            agent: AgentSelector::parse(agent).unwrap(),
            local_path: "/srv/projects/webapp".to_string(),
            default_model: "claude-sonnet-4".to_string(),
            default_max_budget: Some(5.0),
            deploy_platform_id: None,
            auto_commit_push: false,
            created_at: now,
            updated_at: now,
        };
        self.stores.projects.upsert(&project).await.unwrap();
        project
    }

    /// Registers a fake agent connection; the receiver sees every frame the
    /// broker hands to it.
    pub fn connect_agent(&self, name: &str) -> (AgentId, mpsc::Receiver<Frame>, u64) {
        let agent = AgentId::try_new(name.to_string()).unwrap();
        let (tx, rx) = mpsc::channel(64);
        let conn_id = self
            .registry
            .register(agent.clone(), tx, CancellationToken::new());
        (agent, rx, conn_id)
    }

    pub async fn task(&self, id: TaskId) -> Task {
        self.stores.tasks.require(id).await.unwrap()
    }
}

/// Default submit request targeting `project` from chat user `U1`.
pub fn submit_request(project: &Project, prompt: &str) -> foreman::commands::SubmitRequest {
    foreman::commands::SubmitRequest {
        bot: BotName::try_new("coder".to_string()).unwrap(),
        command: "build".to_string(),
        prompt: prompt.to_string(),
        project: project.clone(),
        channel_id: project.channel_id.clone(),
        thread_ts: None,
        user_id: ChatUserId::try_new("U1".to_string()).unwrap(),
        message_ts: Some("orig-1".to_string()),
        attachments: Vec::new(),
        resume_session_id: None,
        parent_task_id: None,
        max_continuations_override: None,
    }
}

/// Drains every frame currently queued on the fake agent.
pub fn drain_frames(rx: &mut mpsc::Receiver<Frame>) -> Vec<Frame> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(frame);
    }
    frames
}
