//! Agent-side broker connection.
//!
//! Maintains one authenticated WebSocket to the broker with reconnect
//! backoff, dispatches inbound frames (task submits spawn executors,
//! cancels fire their tokens, deploy and path-validate requests run
//! locally) and reports status periodically. A system-restart frame ends
//! the process loop so the supervisor restarts it — the broker observes
//! the offline/online edge pair it is waiting for.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::agent::executor::{ExecutorConfig, TaskExecutor};
use crate::agent::sdk::CodingSdk;
use crate::config::AgentConfig;
use crate::domain::TaskId;
use crate::protocol::{
    AgentStatus, DeployRequest, DeployResult, Frame, PathValidateRequest, PathValidateResult,
    ReportedStatus,
};

const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(60);

/// Outcome of one deploy run.
#[derive(Debug, Clone)]
pub struct DeployOutcome {
    pub success: bool,
    pub output: String,
    pub build_logs_url: Option<String>,
}

/// Runs the project deploy step on the worker host.
#[async_trait]
pub trait DeployRunner: Send + Sync {
    /// Executes a deploy inside `local_path`.
    async fn deploy(&self, local_path: &str) -> DeployOutcome;
}

/// Default runner: executes the configured shell command in the project
/// directory and captures its output.
pub struct ShellDeployRunner {
    command: String,
}

impl ShellDeployRunner {
    /// Creates a runner for the given shell command.
    #[must_use]
    pub fn new(command: String) -> Self {
        Self { command }
    }
}

#[async_trait]
impl DeployRunner for ShellDeployRunner {
    async fn deploy(&self, local_path: &str) -> DeployOutcome {
        let result = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(local_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;

        match result {
            Ok(output) => {
                let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                if !output.stderr.is_empty() {
                    text.push_str(&String::from_utf8_lossy(&output.stderr));
                }
                DeployOutcome {
                    success: output.status.success(),
                    output: tail(&text, 4_000),
                    build_logs_url: None,
                }
            }
            Err(err) => DeployOutcome {
                success: false,
                output: format!("deploy command failed to start: {err}"),
                build_logs_url: None,
            },
        }
    }
}

fn tail(s: &str, max: usize) -> String {
    let count = s.chars().count();
    if count <= max {
        s.to_string()
    } else {
        s.chars().skip(count - max).collect()
    }
}

/// Why the connection loop ended.
enum ConnectionEnd {
    /// Broker asked for a restart; exit so the supervisor brings us back.
    Restart,
    /// Connection dropped; reconnect.
    Lost,
}

/// The worker-side client.
pub struct AgentClient {
    config: AgentConfig,
    executor: Arc<TaskExecutor>,
    deploy_runner: Arc<dyn DeployRunner>,
    active: Arc<DashMap<TaskId, CancellationToken>>,
}

impl AgentClient {
    /// Wires the client.
    #[must_use]
    pub fn new(config: AgentConfig, sdk: Arc<dyn CodingSdk>) -> Self {
        let executor = Arc::new(TaskExecutor::new(
            sdk,
            ExecutorConfig {
                max_turns_per_invocation: config.max_turns_per_invocation,
                default_max_continuations: config.default_max_continuations,
                invocation_timeout: Duration::from_secs(config.invocation_timeout_secs),
                attachment_retry_attempts: config.attachment_retry_attempts,
                attachment_dir: config.attachment_dir.clone().into(),
            },
        ));
        let deploy_runner = Arc::new(ShellDeployRunner::new(config.deploy_command.clone()));
        Self {
            config,
            executor,
            deploy_runner,
            active: Arc::new(DashMap::new()),
        }
    }

    /// Replaces the deploy runner (tests).
    #[must_use]
    pub fn with_deploy_runner(mut self, runner: Arc<dyn DeployRunner>) -> Self {
        self.deploy_runner = runner;
        self
    }

    /// Connection loop with exponential reconnect backoff. Returns when
    /// the broker requests a restart or `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let mut backoff = RECONNECT_BASE;
        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }
            match self.connect_once(&shutdown).await {
                Ok(ConnectionEnd::Restart) => {
                    info!("restart requested by broker");
                    return Ok(());
                }
                Ok(ConnectionEnd::Lost) => {
                    backoff = RECONNECT_BASE;
                }
                Err(err) => {
                    warn!(error = %err, "connection attempt failed");
                }
            }
            tokio::select! {
                () = tokio::time::sleep(backoff) => {}
                () = shutdown.cancelled() => return Ok(()),
            }
            backoff = (backoff * 2).min(RECONNECT_MAX);
        }
    }

    #[instrument(skip(self, shutdown))]
    async fn connect_once(&self, shutdown: &CancellationToken) -> anyhow::Result<ConnectionEnd> {
        let mut request = self.config.broker_url.clone().into_client_request()?;
        request.headers_mut().insert(
            "authorization",
            format!("Bearer {}", self.config.api_key).parse()?,
        );

        let (ws, _) = connect_async(request).await?;
        info!(url = %self.config.broker_url, "connected to broker");
        let (mut sink, mut source) = ws.split();

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Frame>(256);
        let conn_cancel = shutdown.child_token();

        // Writer: outbound frames plus the periodic status report.
        let writer_cancel = conn_cancel.clone();
        let status_interval = Duration::from_secs(self.config.status_interval_secs);
        let active = Arc::clone(&self.active);
        let writer = tokio::spawn(async move {
            let mut status = tokio::time::interval(status_interval);
            status.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    frame = outbound_rx.recv() => {
                        let Some(frame) = frame else { break };
                        let Ok(bytes) = frame.encode() else { continue };
                        let text = String::from_utf8_lossy(&bytes).into_owned();
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    _ = status.tick() => {
                        let active_ids: Vec<TaskId> =
                            active.iter().map(|entry| *entry.key()).collect();
                        let frame = Frame::AgentStatus(AgentStatus {
                            status: if active_ids.is_empty() {
                                ReportedStatus::Online
                            } else {
                                ReportedStatus::Busy
                            },
                            active_task_ids: active_ids,
                            ts: chrono::Utc::now(),
                        });
                        let Ok(bytes) = frame.encode() else { continue };
                        let text = String::from_utf8_lossy(&bytes).into_owned();
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    () = writer_cancel.cancelled() => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        });

        let mut end = ConnectionEnd::Lost;
        loop {
            tokio::select! {
                message = source.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            match Frame::decode(text.as_bytes()) {
                                Ok(Frame::SystemRestart(payload)) => {
                                    info!(reason = %payload.reason, "system restart frame");
                                    end = ConnectionEnd::Restart;
                                    break;
                                }
                                Ok(frame) => self.dispatch(frame, &outbound_tx).await,
                                Err(err) => {
                                    warn!(error = %err, "undecodable frame dropped");
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            debug!(error = %err, "websocket read error");
                            break;
                        }
                    }
                }
                () = shutdown.cancelled() => break,
            }
        }

        conn_cancel.cancel();
        let _ = writer.await;
        Ok(end)
    }

    async fn dispatch(&self, frame: Frame, outbound: &mpsc::Sender<Frame>) {
        match frame {
            Frame::TaskSubmit(submit) => {
                let task_id = submit.task_id;
                let token = CancellationToken::new();
                self.active.insert(task_id, token.clone());

                let executor = Arc::clone(&self.executor);
                let outbound = outbound.clone();
                let active = Arc::clone(&self.active);
                tokio::spawn(async move {
                    executor.execute(submit, outbound, token).await;
                    active.remove(&task_id);
                });
            }
            Frame::TaskCancel(cancel) => {
                match self.active.get(&cancel.task_id) {
                    Some(token) => {
                        info!(task = %cancel.task_id, reason = %cancel.reason, "cancelling task");
                        token.cancel();
                    }
                    // Broadcast cancel for a task another agent holds.
                    None => debug!(task = %cancel.task_id, "cancel for task not held here"),
                }
            }
            Frame::DeployRequest(request) => {
                self.run_deploy(request, outbound.clone());
            }
            Frame::PathValidateRequest(request) => {
                let outbound = outbound.clone();
                tokio::spawn(async move {
                    let result = validate_path(&request).await;
                    if outbound.send(Frame::PathValidateResult(result)).await.is_err() {
                        debug!("path-validate result dropped, connection closed");
                    }
                });
            }
            other => {
                warn!(frame = other.type_name(), "unexpected frame for agent discarded");
            }
        }
    }

    fn run_deploy(&self, request: DeployRequest, outbound: mpsc::Sender<Frame>) {
        let runner = Arc::clone(&self.deploy_runner);
        tokio::spawn(async move {
            info!(request = %request.request_id, path = %request.local_path, "deploy starting");
            let outcome = runner.deploy(&request.local_path).await;
            let frame = Frame::DeployResult(DeployResult {
                request_id: request.request_id,
                success: outcome.success,
                output: outcome.output,
                build_logs_url: outcome.build_logs_url,
            });
            if outbound.send(frame).await.is_err() {
                debug!("deploy result dropped, connection closed");
            }
        });
    }
}

async fn validate_path(request: &PathValidateRequest) -> PathValidateResult {
    let path = std::path::Path::new(&request.path);
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => PathValidateResult {
            request_id: request.request_id,
            success: true,
            exists: true,
            created: false,
            error: None,
        },
        Ok(_) => PathValidateResult {
            request_id: request.request_id,
            success: false,
            exists: true,
            created: false,
            error: Some("path exists but is not a directory".to_string()),
        },
        Err(_) => match tokio::fs::create_dir_all(path).await {
            Ok(()) => PathValidateResult {
                request_id: request.request_id,
                success: true,
                exists: false,
                created: true,
                error: None,
            },
            Err(err) => PathValidateResult {
                request_id: request.request_id,
                success: false,
                exists: false,
                created: false,
                error: Some(err.to_string()),
            },
        },
    }
}
