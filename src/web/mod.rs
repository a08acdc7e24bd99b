pub mod api;

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::engine::{AutonomousApi, BotManager};

/// State shared by all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<BotManager>,
    pub autonomous: Arc<AutonomousApi>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(api::health))
        .route("/api/bots", post(api::start_bot).get(api::all_bot_status))
        .route("/api/bots/:id", get(api::bot_status).delete(api::remove_bot))
        .route("/api/bots/:id/stop", post(api::stop_bot))
        .route("/api/bots/:id/trade", post(api::manual_trade))
        .route("/api/trades", get(api::trade_history))
        .route("/api/agent/tool", post(api::agent_tool))
        .route("/ws/events", get(api::event_stream))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!("Dashboard API listening on http://0.0.0.0:{port}");
    axum::serve(listener, app).await?;
    Ok(())
}
