mod config;
mod error;
mod exec;
mod protocol;
mod routes;
mod state;
mod utils {
    pub mod clean;
}

use std::sync::Arc;
use anyhow::Context;
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing_subscriber::EnvFilter;

use crate::{config::Config, exec::ExecutionOrchestrator, state::RoomRegistry, utils::clean};

const BODY_LIMIT: usize = 10 * 1024 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("coderoom_server=info,tower_http=info")),
        )
        .init();

    let cfg = Config::from_env().context("reading configuration")?;
    let rooms = RoomRegistry::default();
    let runner = Arc::new(ExecutionOrchestrator::new(&cfg));

    match runner.environment().ensure_root().await {
        Ok(()) => tracing::info!(dir = %cfg.temp_root.display(), "temporary directory ready"),
        Err(e) => tracing::error!(dir = %cfg.temp_root.display(), error = %e, "cannot create temporary directory"),
    }
    tokio::spawn(clean::task(cfg.temp_root.clone(), cfg.sweep_interval, cfg.stale_job_after)); // 啟動清道夫

    let app = routes::app(rooms, runner)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT));

    let addr = cfg.addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, "server running");
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}
