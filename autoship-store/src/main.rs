//! Task state store server: one ledger actor per configured project, each
//! dispatching eligible tasks to the execution agent.

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

use autoship::io::config::load_store_config;
use autoship::store::{HttpDispatcher, ProjectRegistry};

use crate::state::AppState;

#[derive(Parser)]
#[command(name = "autoship-store")]
#[command(about = "Persistent task ledger that dispatches work to the execution agent")]
struct Args {
    /// Path to the store config (TOML). Missing file means defaults.
    #[arg(long, default_value = "autoship-store.toml")]
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
    autoship::logging::init("autoship=info,autoship_store=info,tower_http=info");

    let args = Args::parse();
    let mut config = load_store_config(&args.config)
        .with_context(|| format!("load config {}", args.config.display()))?;
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if config.projects.is_empty() {
        tracing::warn!("no projects configured; every project route will return 404");
    }

    let dispatcher = Arc::new(HttpDispatcher::new(
        &config.agent_url,
        config.agent_token.clone(),
        config.dispatch_retry.clone(),
    ));
    let projects = ProjectRegistry::spawn(&config, dispatcher).context("start project actors")?;
    info!(
        data_dir = %config.data_dir.display(),
        agent_url = %config.agent_url,
        projects = ?projects.names().collect::<Vec<_>>(),
        "starting autoship-store"
    );

    let app = Router::new()
        .merge(routes::router())
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { projects });

    let addr: SocketAddr = format!("{}:{}", config.bind, config.port).parse()?;
    info!(addr = %addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!(err = %err, "failed to listen for shutdown signal");
            }
            info!("shutting down");
        })
        .await?;
    Ok(())
}
