//! Foreman worker-agent entry point.
//!
//! Connects to the broker, executes dispatched tasks, and exits cleanly on
//! a system-restart frame so the process supervisor restarts it.

use anyhow::{Context, Result};
use clap::Parser;
use foreman::agent::AgentClient;
use foreman::agent::sdk::UnconfiguredSdk;
use foreman::config::AgentConfig;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "foreman-agent", about = "Foreman worker agent")]
struct Cli {
    /// Broker gateway URL, e.g. ws://broker:7800.
    #[arg(long, env = "FOREMAN_BROKER_URL")]
    broker_url: String,

    /// Api key presented at handshake (prefer the file variant).
    #[arg(long, env = "FOREMAN_API_KEY")]
    api_key: Option<String>,

    /// File containing the api key.
    #[arg(long, env = "FOREMAN_API_KEY_FILE")]
    api_key_file: Option<String>,

    /// Shell command the deploy step runs in the project directory.
    #[arg(long, env = "FOREMAN_DEPLOY_COMMAND")]
    deploy_command: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("foreman=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let api_key = match (cli.api_key, cli.api_key_file) {
        (Some(key), _) => key,
        (None, Some(path)) => std::fs::read_to_string(&path)
            .with_context(|| format!("read api key file {path}"))?
            .trim()
            .to_string(),
        (None, None) => anyhow::bail!("one of --api-key or --api-key-file is required"),
    };

    let mut config = AgentConfig::new(cli.broker_url, api_key);
    if let Some(command) = cli.deploy_command {
        config.deploy_command = command;
    }

    let client = AgentClient::new(config, Arc::new(UnconfiguredSdk));

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("interrupt received");
        signal_token.cancel();
    });

    client.run(shutdown).await?;
    info!("agent exiting");
    Ok(())
}
