//! HTTP server setup and routing

use crate::state::AppContext;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::{Json, Router};
use binsight_common::{Error, Result};
use serde_json::json;
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;
use tracing::info;

/// Build the full application router; exported so integration tests can
/// drive it without binding a socket
pub fn build_router(ctx: AppContext) -> Router {
    // Sized for the worst-case batch: the file cap at the per-file size
    // limit, plus multipart overhead
    let body_limit = ctx.config.blob.max_file_size as usize
        * (ctx.config.max_batch_files + 1)
        + 1024 * 1024;

    Router::new()
        // Health endpoint
        .route("/health", get(health))
        // SDK surface (API-key auth)
        .route("/sdk/analyze", post(super::sdk::analyze))
        .route("/sdk/analyze/batch", post(super::sdk::analyze_batch))
        .route("/sdk/results/:job_id", get(super::sdk::get_results))
        .route("/sdk/check-hash", get(super::sdk::check_hash))
        .route("/sdk/credits", get(super::sdk::credits))
        // Dashboard surface (session auth upstream)
        .route("/user/analyze", post(super::user::analyze))
        .route("/user/analyze", get(super::user::history))
        // Payment gateway webhook (signature auth)
        .route("/payment/webhook", post(super::payment::webhook))
        // SSE event stream
        .route("/events", get(super::sse::event_stream))
        // Operator surface
        .route("/admin/queue", get(super::admin::queue_counts))
        .route("/admin/queue/clear", post(super::admin::queue_clear))
        .route("/admin/janitor/run", post(super::admin::janitor_run))
        .with_state(ctx)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
}

/// GET /health - liveness
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "module": "binsight-server",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Bind and serve until the process exits
pub async fn run(ctx: AppContext, addr: SocketAddr) -> Result<()> {
    let app = build_router(ctx);
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Config(format!("Failed to bind to {addr}: {e}")))?;

    axum::serve(listener, app)
        .await
        .map_err(|e| Error::Internal(format!("Server error: {e}")))?;

    Ok(())
}
