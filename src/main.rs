use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;

use deskhand::agent::engine::AgentEngine;
use deskhand::agent::tools::{ToolContext, ToolRegistry, WordPressClient};
use deskhand::config::AgentConfig;
use deskhand::provider::AnthropicProvider;
use deskhand::server::{self, AppState};
use deskhand::store::{ConversationStore, SqliteConversationStore};
use deskhand::workspace::{NullNotifier, Workspace};

#[derive(Parser)]
#[command(name = "deskhand", about = "Workspace agent server", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server
    Start {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:8787")]
        listen: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "deskhand=info".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Start { listen } => start(&listen).await,
    }
}

async fn start(listen: &str) -> anyhow::Result<()> {
    let config = AgentConfig::from_env();
    let store = SqliteConversationStore::open(config.database_url.clone(), config.retention_hours)
        .await
        .context("opening conversation store")?;
    let shared: Arc<dyn ConversationStore> = Arc::new(store.clone());

    let workspace = Workspace::new(&config.workspace_root, Arc::new(NullNotifier))
        .context("opening workspace root")?;
    let ctx = ToolContext {
        workspace: Arc::new(workspace),
        wordpress: Arc::new(WordPressClient::from_config(&config)),
        notify_watcher: true,
    };
    let engine = Arc::new(AgentEngine::new(
        Arc::clone(&shared),
        Arc::new(AnthropicProvider::from_config(&config)),
        Arc::new(ToolRegistry::with_default_tools()),
        ctx,
        config.max_rounds,
    ));

    let sweeper = server::spawn_cleanup(shared);
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    server::serve(listener, AppState { engine }).await?;

    sweeper.abort();
    store.close().await;
    Ok(())
}
