//! Dashboard routes: analyze and paged job history
//!
//! These sit behind the session middleware, which injects the
//! authenticated user id; see `auth::SessionUser`.

use crate::api::auth::SessionUser;
use crate::api::error::ApiError;
use crate::api::sdk::{ingest_response, meta_from_headers, read_single_file, JobView};
use crate::ingest::{ingest_upload, IngestRequest};
use crate::state::AppContext;
use axum::extract::{Multipart, Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::Json;
use binsight_common::model::JobSource;
use serde::Deserialize;
use serde_json::json;

/// Default and maximum page sizes for history browsing
const DEFAULT_PAGE_SIZE: i64 = 20;
const MAX_PAGE_SIZE: i64 = 100;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

/// POST /user/analyze - dashboard upload
pub async fn analyze(
    State(ctx): State<AppContext>,
    SessionUser(user_id): SessionUser,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let (filename, bytes) = read_single_file(multipart, ctx.config.blob.max_file_size).await?;
    let outcome = ingest_upload(
        &ctx,
        IngestRequest {
            user_id,
            api_key_id: None,
            filename,
            bytes,
            source: JobSource::Dashboard,
            meta: meta_from_headers(&headers),
        },
    )
    .await?;

    Ok(ingest_response(&ctx, outcome.job, outcome.cached))
}

/// GET /user/analyze - paged history, newest first
pub async fn history(
    State(ctx): State<AppContext>,
    SessionUser(user_id): SessionUser,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let total: i64 = ctx.jobs.list_for_owner(user_id, 1, 0).await?.1;
    let total_pages = (total + limit - 1) / limit;
    let page = query.page.unwrap_or(1).max(1).min(total_pages.max(1));
    let offset = (page - 1) * limit;

    let (jobs, _) = ctx.jobs.list_for_owner(user_id, limit, offset).await?;

    Ok(Json(json!({
        "success": true,
        "jobs": jobs.into_iter().map(JobView::from).collect::<Vec<_>>(),
        "pagination": {
            "page": page,
            "limit": limit,
            "total": total,
            "total_pages": total_pages,
        },
    })))
}
