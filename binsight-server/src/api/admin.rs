//! Operator endpoints: queue introspection and the manual janitor trigger

use crate::api::auth::AdminAuth;
use crate::api::error::ApiError;
use crate::state::AppContext;
use axum::extract::State;
use axum::Json;
use serde_json::json;

/// GET /admin/queue - counts by state
pub async fn queue_counts(
    State(ctx): State<AppContext>,
    _auth: AdminAuth,
) -> Result<Json<serde_json::Value>, ApiError> {
    let counts = ctx.queue.counts().await?;
    Ok(Json(json!({
        "success": true,
        "counts": counts,
    })))
}

/// POST /admin/queue/clear - purge everything, in-flight leases included
pub async fn queue_clear(
    State(ctx): State<AppContext>,
    _auth: AdminAuth,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deleted = ctx.queue.clear_all().await?;
    Ok(Json(json!({
        "success": true,
        "deleted": deleted,
    })))
}

/// POST /admin/janitor/run - manual sweep trigger
pub async fn janitor_run(
    State(ctx): State<AppContext>,
    _auth: AdminAuth,
) -> Result<Json<serde_json::Value>, ApiError> {
    match ctx.janitor.run_once().await? {
        Some(report) => Ok(Json(json!({
            "success": true,
            "ran": true,
            "report": report,
        }))),
        None => Ok(Json(json!({
            "success": true,
            "ran": false,
            "message": "janitor already running",
        }))),
    }
}
