//! Broker composition root.
//!
//! Wires every component over one database handle, owns the background
//! tasks (flush ticker, drain loop, sweeps, heartbeat monitor) and runs
//! graceful shutdown in the declared order: tickers → drains → gateway →
//! admin listener → database.

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::admin_api::{self, AdminState};
use crate::chat::ChatHandler;
use crate::commands::CommandService;
use crate::config::BrokerConfig;
use crate::database::Database;
use crate::gateway::{Gateway, heartbeat_monitor};
use crate::health::HealthTracker;
use crate::notifier::{ChatApi, Notifier};
use crate::offline_queue::OfflineQueue;
use crate::pending::{DeployTable, PathValidations};
use crate::progress::ProgressTrackers;
use crate::rate_limit::RateLimiter;
use crate::registry::AgentRegistry;
use crate::router::FrameRouter;
use crate::storage::Stores;
use crate::stream_accumulator::StreamAccumulator;
use crate::sync::SyncOrchestrator;

struct ShutdownTokens {
    tickers: CancellationToken,
    drains: CancellationToken,
    gateway: CancellationToken,
    admin: CancellationToken,
}

/// The assembled broker.
pub struct Broker {
    pub config: BrokerConfig,
    pub db: Database,
    pub stores: Stores,
    pub registry: Arc<AgentRegistry>,
    pub health: Arc<HealthTracker>,
    pub notifier: Arc<Notifier>,
    pub accumulator: Arc<StreamAccumulator>,
    pub progress: Arc<ProgressTrackers>,
    pub offline_queue: Arc<OfflineQueue>,
    pub commands: Arc<CommandService>,
    pub sync: Arc<SyncOrchestrator>,
    pub router: Arc<FrameRouter>,
    pub chat: Arc<ChatHandler>,
    tokens: ShutdownTokens,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Broker {
    /// Builds the full component graph over the configured database.
    ///
    /// # Errors
    ///
    /// Returns an error when the configuration is invalid or the database
    /// cannot be opened.
    pub async fn build(
        config: BrokerConfig,
        chat_api: Arc<dyn ChatApi>,
    ) -> anyhow::Result<Self> {
        config.validate().context("broker configuration")?;

        let db = Database::connect(&config.database_path)
            .await
            .context("open database")?;
        let stores = Stores::open(&db).await.context("bootstrap schema")?;

        let registry = Arc::new(AgentRegistry::new());
        let health = Arc::new(HealthTracker::new(config.breaker.clone()));
        let notifier = Arc::new(Notifier::new(
            chat_api,
            config.notifier_max_attempts.as_u32(),
            Duration::from_millis(config.notifier_base_delay_ms),
            config.failed_notification_cap,
        ));
        let accumulator = Arc::new(StreamAccumulator::new(Arc::clone(&notifier)));
        let progress = Arc::new(ProgressTrackers::new(
            Arc::clone(&notifier),
            config.max_progress_trackers.as_usize(),
            Duration::from_secs(config.progress_ttl_secs),
        ));
        let offline_queue = Arc::new(OfflineQueue::new(
            stores.offline_queue.clone(),
            Arc::clone(&registry),
            config.offline_ttl.as_duration(),
            Duration::from_secs(config.delivered_retention_secs),
        ));
        let commands = Arc::new(CommandService::new(
            stores.clone(),
            Arc::clone(&registry),
            Arc::clone(&offline_queue),
            Arc::clone(&notifier),
            Arc::clone(&health),
            config.offline_ttl.as_duration().as_secs() / 3_600,
        ));
        let deploys = Arc::new(DeployTable::new(Duration::from_secs(
            config.deploy_timeout_secs * 2,
        )));
        let path_validations = Arc::new(PathValidations::new(Duration::from_secs(60)));
        let sync = Arc::new(SyncOrchestrator::new(
            Arc::clone(&registry),
            Arc::clone(&notifier),
            stores.audit.clone(),
            Arc::clone(&deploys),
            Duration::from_secs(config.restart_timeout_secs),
            Duration::from_secs(config.deploy_timeout_secs),
            Duration::from_secs(config.workflow_retention_secs),
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
            config.session_ttl_secs,
        ));
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit_per_minute));
        let chat = Arc::new(ChatHandler::new(
            stores.clone(),
            Arc::clone(&commands),
            Arc::clone(&sync),
            Arc::clone(&registry),
            Arc::clone(&notifier),
            rate_limiter,
            Arc::clone(&deploys),
            Arc::clone(&offline_queue),
        ));

        Ok(Self {
            config,
            db,
            stores,
            registry,
            health,
            notifier,
            accumulator,
            progress,
            offline_queue,
            commands,
            sync,
            router,
            chat,
            tokens: ShutdownTokens {
                tickers: CancellationToken::new(),
                drains: CancellationToken::new(),
                gateway: CancellationToken::new(),
                admin: CancellationToken::new(),
            },
            tasks: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// Binds the gateway and admin listeners and spawns every background
    /// task.
    ///
    /// # Errors
    ///
    /// Returns an error when a listener cannot bind.
    pub async fn start(&self) -> anyhow::Result<()> {
        let gateway_listener = TcpListener::bind(&self.config.gateway_addr)
            .await
            .with_context(|| format!("bind gateway {}", self.config.gateway_addr))?;
        let admin_listener = TcpListener::bind(&self.config.admin_addr)
            .await
            .with_context(|| format!("bind admin {}", self.config.admin_addr))?;

        let mut tasks = self.tasks.lock().expect("task list lock");

        // Stream accumulator flush ticker.
        tasks.push(tokio::spawn(
            Arc::clone(&self.accumulator).run(
                self.config.flush_interval.as_duration(),
                self.tokens.tickers.clone(),
            ),
        ));
        // Progress tracker TTL sweep.
        tasks.push(tokio::spawn(Arc::clone(&self.progress).run(
            Duration::from_secs(self.config.sweep_interval_secs),
            self.tokens.tickers.clone(),
        )));
        // Workflow retention sweep.
        tasks.push(tokio::spawn(Arc::clone(&self.sync).run(
            Duration::from_secs(self.config.sweep_interval_secs),
            self.tokens.tickers.clone(),
        )));
        // Session expiry sweep.
        {
            let sessions = self.stores.sessions.clone();
            let token = self.tokens.tickers.clone();
            let interval = Duration::from_secs(self.config.sweep_interval_secs);
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(err) = sessions.expire_stale().await {
                                warn!(error = %err, "session sweep failed");
                            }
                        }
                        () = token.cancelled() => return,
                    }
                }
            }));
        }
        // Offline queue drain loop.
        tasks.push(tokio::spawn(Arc::clone(&self.offline_queue).run(
            Duration::from_secs(self.config.drain_interval_secs),
            self.tokens.drains.clone(),
        )));
        // Heartbeat supervision.
        tasks.push(tokio::spawn(heartbeat_monitor(
            Arc::clone(&self.registry),
            self.config.heartbeat_interval.as_duration(),
            self.tokens.gateway.clone(),
        )));
        // Gateway accept loop.
        let gateway = Arc::new(Gateway::new(
            Arc::clone(&self.registry),
            self.stores.api_keys.clone(),
            self.stores.audit.clone(),
            Arc::clone(&self.router),
            self.config.heartbeat_interval.as_duration(),
        ));
        tasks.push(tokio::spawn(
            gateway.run(gateway_listener, self.tokens.gateway.clone()),
        ));
        // Admin HTTP surface.
        let admin_router = admin_api::create_router(AdminState {
            registry: Arc::clone(&self.registry),
            health: Arc::clone(&self.health),
            notifier: Arc::clone(&self.notifier),
            offline_queue: self.stores.offline_queue.clone(),
        });
        let admin_token = self.tokens.admin.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(err) = admin_api::serve(admin_listener, admin_router, admin_token).await {
                warn!(error = %err, "admin server exited with error");
            }
        }));

        info!(
            gateway = %self.config.gateway_addr,
            admin = %self.config.admin_addr,
            "broker started"
        );
        Ok(())
    }

    /// Graceful shutdown in the declared order. The caller owns the hard
    /// force-exit watchdog.
    pub async fn shutdown(&self) {
        info!("broker shutting down");
        // 1. Stop the flush ticker and sweeps (a final flush runs inside).
        self.tokens.tickers.cancel();
        // 2. Stop periodic drains.
        self.tokens.drains.cancel();
        // 3. Close the gateway: refuse new connections, tear down live ones
        //    (agents observe the close and their edges fire).
        self.tokens.gateway.cancel();
        // 4. Close the admin listener.
        self.tokens.admin.cancel();

        let handles: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.tasks.lock().expect("task list lock"));
        for handle in handles {
            let _ = handle.await;
        }

        // 5. Close the database last.
        self.db.close().await;
        info!("broker shutdown complete");
    }
}
