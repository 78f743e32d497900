//! Foreman broker entry point.

use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use foreman::broker::Broker;
use foreman::config::BrokerConfig;
use foreman::notifier::{ChatApi, ChatApiError};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "foreman", about = "Chat-driven task dispatch broker")]
struct Cli {
    /// Gateway (agent WebSocket) bind address.
    #[arg(long, env = "FOREMAN_GATEWAY_ADDR")]
    gateway_addr: Option<String>,

    /// Admin HTTP bind address.
    #[arg(long, env = "FOREMAN_ADMIN_ADDR")]
    admin_addr: Option<String>,

    /// SQLite database path.
    #[arg(long, env = "FOREMAN_DATABASE")]
    database: Option<String>,

    /// Use the development preset instead of production defaults.
    #[arg(long)]
    dev: bool,
}

/// Stand-in chat client that logs outbound traffic. The workspace SDK is
/// wired here in a real deployment; everything upstream only sees the
/// [`ChatApi`] trait.
struct LoggingChatApi {
    ts_seq: AtomicU64,
}

#[async_trait]
impl ChatApi for LoggingChatApi {
    async fn post_message(
        &self,
        channel: &str,
        _thread_ts: Option<&str>,
        text: &str,
    ) -> Result<String, ChatApiError> {
        info!(channel, text, "chat post");
        Ok(format!("local-{}", self.ts_seq.fetch_add(1, Ordering::Relaxed)))
    }

    async fn post_blocks(
        &self,
        channel: &str,
        thread_ts: Option<&str>,
        fallback_text: &str,
        _blocks: &serde_json::Value,
    ) -> Result<String, ChatApiError> {
        self.post_message(channel, thread_ts, fallback_text).await
    }

    async fn update_message(
        &self,
        channel: &str,
        ts: &str,
        text: &str,
    ) -> Result<(), ChatApiError> {
        info!(channel, ts, text, "chat update");
        Ok(())
    }

    async fn add_reaction(&self, channel: &str, ts: &str, name: &str) -> Result<(), ChatApiError> {
        info!(channel, ts, name, "chat reaction add");
        Ok(())
    }

    async fn remove_reaction(
        &self,
        channel: &str,
        ts: &str,
        name: &str,
    ) -> Result<(), ChatApiError> {
        info!(channel, ts, name, "chat reaction remove");
        Ok(())
    }

    async fn post_ephemeral(
        &self,
        channel: &str,
        user: &str,
        text: &str,
    ) -> Result<(), ChatApiError> {
        info!(channel, user, text, "chat ephemeral");
        Ok(())
    }

    async fn upload_file(
        &self,
        channel: &str,
        filename: &str,
        content: &[u8],
    ) -> Result<(), ChatApiError> {
        info!(channel, filename, bytes = content.len(), "chat upload");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("foreman=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let mut config = if cli.dev {
        BrokerConfig::development()
    } else {
        BrokerConfig::production()
    };
    if let Some(addr) = cli.gateway_addr {
        config.gateway_addr = addr;
    }
    if let Some(addr) = cli.admin_addr {
        config.admin_addr = addr;
    }
    if let Some(path) = cli.database {
        config.database_path = path;
    }

    let chat_api = Arc::new(LoggingChatApi {
        ts_seq: AtomicU64::new(0),
    });
    let grace = std::time::Duration::from_secs(config.shutdown_grace_secs);
    let broker = Broker::build(config, chat_api).await?;
    broker.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("interrupt received");

    // Hard watchdog: if graceful shutdown stalls, force-exit non-zero.
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        eprintln!("shutdown watchdog fired, forcing exit");
        std::process::exit(1);
    });

    broker.shutdown().await;
    Ok(())
}
