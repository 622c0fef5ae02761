use std::sync::Arc;
use axum::{Router, routing::get, Extension};

use crate::{exec::ExecutionOrchestrator, state::RoomRegistry};

pub mod rooms;
pub mod ws;

pub fn router() -> Router {
    Router::new()
        .route("/", get(|| async { "CodeRoom server is running" }))
        .nest("/api", rooms::router())
        .merge(ws::router())
}

/// Routes plus the shared state they extract.
pub fn app(rooms: RoomRegistry, runner: Arc<ExecutionOrchestrator>) -> Router {
    router()
        .layer(Extension(rooms))
        .layer(Extension(runner))
}
