//! Execution agent server: accepts execution requests and reports results to
//! their callback URLs.

mod routes;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing::info;

use autoship::execution::ExecutionAgent;
use autoship::io::agent::CommandAgentBackend;
use autoship::io::config::load_agent_config;
use autoship::io::quality::ScriptQualityGate;

use crate::state::AppState;

#[derive(Parser)]
#[command(name = "autoship-agent")]
#[command(about = "Run coding tasks in isolated worktrees and report the outcome")]
struct Args {
    /// Path to the agent config (TOML). Missing file means defaults.
    #[arg(long, default_value = "autoship-agent.toml")]
    config: PathBuf,

    /// Address to bind the server to (overrides config)
    #[arg(long)]
    bind: Option<String>,

    /// Port to listen on (overrides config)
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    autoship::logging::init("autoship=info,autoship_agent=info,tower_http=info");

    let args = Args::parse();
    let mut config = load_agent_config(&args.config)
        .with_context(|| format!("load config {}", args.config.display()))?;
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    std::fs::create_dir_all(&config.workspace_root)
        .with_context(|| format!("create workspace {}", config.workspace_root.display()))?;
    info!(
        workspace_root = %config.workspace_root.display(),
        auth = config.auth_token.is_some(),
        "starting autoship-agent"
    );

    let addr: SocketAddr = format!("{}:{}", config.bind, config.port).parse()?;
    let backend = Arc::new(CommandAgentBackend::new(config.agent.clone()));
    let quality = Arc::new(ScriptQualityGate::new(config.quality.clone()));
    let state = AppState::new(ExecutionAgent::new(config, backend, quality));

    let app = Router::new()
        .merge(routes::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!(addr = %addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(err = %err, "failed to listen for shutdown signal");
    }
    info!("shutting down; in-flight executions are abandoned");
}
