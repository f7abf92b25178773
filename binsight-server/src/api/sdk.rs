//! SDK routes: analyze, batch, results polling, cache probe, credits

use crate::api::auth::ApiKeyAuth;
use crate::api::error::ApiError;
use crate::ingest::{ingest_upload, validate_hash, IngestRequest};
use crate::state::AppContext;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use binsight_common::model::{
    AnalysisReport, Capability, Job, JobError, JobSource, UploadMeta,
};
use binsight_common::pricing::CreditBreakdown;
use binsight_common::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

// ============================================================================
// Request/Response Types
// ============================================================================

/// Client-facing view of a job; blob handles and upload metadata stay
/// internal
#[derive(Debug, Serialize)]
pub struct JobView {
    pub job_id: Uuid,
    pub filename: String,
    pub size_bytes: i64,
    pub hash: String,
    pub status: String,
    pub progress: i64,
    pub tier: String,
    pub queued_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credits_charged: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credit_breakdown: Option<CreditBreakdown>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<AnalysisReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        Self {
            job_id: job.id,
            filename: job.filename,
            size_bytes: job.size_bytes,
            hash: job.hash,
            status: job.status.as_str().to_string(),
            progress: job.progress,
            tier: job.tier.as_str().to_string(),
            queued_at: job.queued_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            processing_seconds: job.processing_seconds,
            credits_charged: job.credits_charged,
            credit_breakdown: job.credit_breakdown,
            results: job.results,
            error: job.error,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CheckHashQuery {
    pub hash: String,
}

#[derive(Debug, Serialize)]
pub struct BatchItem {
    pub filename: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<serde_json::Value>,
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /sdk/analyze - single-file analysis
pub async fn analyze(
    State(ctx): State<AppContext>,
    auth: ApiKeyAuth,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    auth.require(Capability::Analyze)?;

    let (filename, bytes) = read_single_file(multipart, ctx.config.blob.max_file_size).await?;
    let outcome = ingest_upload(
        &ctx,
        IngestRequest {
            user_id: auth.0.user_id,
            api_key_id: Some(auth.0.id),
            filename,
            bytes,
            source: JobSource::Sdk,
            meta: meta_from_headers(&headers),
        },
    )
    .await?;

    Ok(ingest_response(&ctx, outcome.job, outcome.cached))
}

/// POST /sdk/analyze/batch - up to the configured cap of files
pub async fn analyze_batch(
    State(ctx): State<AppContext>,
    auth: ApiKeyAuth,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    auth.require(Capability::Batch)?;

    // Collect everything first so the cap rejects before any upload
    let files = read_all_files(multipart, ctx.config.blob.max_file_size).await?;
    if files.is_empty() {
        return Err(Error::MissingFile.into());
    }
    if files.len() > ctx.config.max_batch_files {
        return Err(Error::TooManyFiles {
            limit: ctx.config.max_batch_files,
            actual: files.len(),
        }
        .into());
    }

    // Per-file ingestion; one failure never rolls back its siblings
    let meta = meta_from_headers(&headers);
    let mut results = Vec::with_capacity(files.len());
    for (filename, bytes) in files {
        let outcome = ingest_upload(
            &ctx,
            IngestRequest {
                user_id: auth.0.user_id,
                api_key_id: Some(auth.0.id),
                filename: filename.clone(),
                bytes,
                source: JobSource::Sdk,
                meta: meta.clone(),
            },
        )
        .await;

        results.push(match outcome {
            Ok(outcome) => BatchItem {
                filename,
                success: true,
                job_id: Some(outcome.job.id),
                cached: Some(outcome.cached),
                error: None,
            },
            Err(err) => BatchItem {
                filename,
                success: false,
                job_id: None,
                cached: None,
                error: Some(json!({
                    "message": err.to_string(),
                    "code": err.code().as_str(),
                })),
            },
        });
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "success": true,
            "results": results,
            "polling": polling_hint(&ctx),
        })),
    )
        .into_response())
}

/// GET /sdk/results/{job_id} - poll one job
pub async fn get_results(
    State(ctx): State<AppContext>,
    auth: ApiKeyAuth,
    Path(job_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    auth.require(Capability::Results)?;

    let job = ctx
        .jobs
        .get(job_id)
        .await?
        .filter(|job| job.user_id == auth.0.user_id)
        .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;

    Ok(Json(json!({
        "success": true,
        "job": JobView::from(job),
    })))
}

/// GET /sdk/check-hash?hash=<sha256-hex> - cache probe
pub async fn check_hash(
    State(ctx): State<AppContext>,
    auth: ApiKeyAuth,
    Query(query): Query<CheckHashQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    auth.require(Capability::CheckHash)?;
    validate_hash(&query.hash)?;

    let cached = ctx
        .jobs
        .find_completed_by_owner_and_hash(auth.0.user_id, &query.hash)
        .await?;

    Ok(Json(match cached {
        Some(job) => json!({
            "success": true,
            "cached": true,
            "job": JobView::from(job),
        }),
        None => json!({
            "success": true,
            "cached": false,
        }),
    }))
}

/// GET /sdk/credits - balance snapshot
pub async fn credits(
    State(ctx): State<AppContext>,
    auth: ApiKeyAuth,
) -> Result<Json<serde_json::Value>, ApiError> {
    auth.require(Capability::Credits)?;

    let balance = ctx.ledger.balance(auth.0.user_id).await?;
    let tier = ctx.users.tier_of(auth.0.user_id).await?;
    let percent = if balance.total > 0 {
        (balance.used as f64 / balance.total as f64 * 100.0).round()
    } else {
        0.0
    };

    Ok(Json(json!({
        "success": true,
        "credits": {
            "total": balance.total,
            "used": balance.used,
            "remaining": balance.remaining,
            "percent": percent,
        },
        "tier": tier.as_str(),
    })))
}

// ============================================================================
// Shared helpers
// ============================================================================

/// 202 with a polling hint for a fresh job, 200 for a cache hit
pub fn ingest_response(ctx: &AppContext, job: Job, cached: bool) -> Response {
    if cached {
        (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "cached": true,
                "credits_charged": 0,
                "job": JobView::from(job),
            })),
        )
            .into_response()
    } else {
        let job_id = job.id;
        (
            StatusCode::ACCEPTED,
            Json(json!({
                "success": true,
                "cached": false,
                "job_id": job_id,
                "status": "queued",
                "polling": polling_hint(ctx),
            })),
        )
            .into_response()
    }
}

fn polling_hint(ctx: &AppContext) -> serde_json::Value {
    json!({
        "url": "/sdk/results/{jobId}",
        "interval_ms": ctx.config.polling_interval_ms,
    })
}

/// Pull the single `file` part out of a multipart body
pub async fn read_single_file(
    mut multipart: Multipart,
    max_size: u64,
) -> Result<(String, Vec<u8>), Error> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::Internal(format!("multipart read failed: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or("upload.bin").to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| Error::Internal(format!("multipart read failed: {e}")))?
            .to_vec();
        if bytes.len() as u64 > max_size {
            return Err(Error::FileTooLarge {
                size: bytes.len() as u64,
                limit: max_size,
            });
        }
        return Ok((filename, bytes));
    }
    Err(Error::MissingFile)
}

/// Pull every file-carrying part out of a multipart body
async fn read_all_files(
    mut multipart: Multipart,
    max_size: u64,
) -> Result<Vec<(String, Vec<u8>)>, Error> {
    let mut files = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::Internal(format!("multipart read failed: {e}")))?
    {
        let Some(filename) = field.file_name().map(str::to_string) else {
            continue;
        };
        let bytes = field
            .bytes()
            .await
            .map_err(|e| Error::Internal(format!("multipart read failed: {e}")))?
            .to_vec();
        if bytes.len() as u64 > max_size {
            return Err(Error::FileTooLarge {
                size: bytes.len() as u64,
                limit: max_size,
            });
        }
        files.push((filename, bytes));
    }
    Ok(files)
}

/// Upload metadata captured from request headers
pub fn meta_from_headers(headers: &HeaderMap) -> UploadMeta {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };
    UploadMeta {
        source_ip: header("x-forwarded-for")
            .map(|raw| raw.split(',').next().unwrap_or(&raw).trim().to_string()),
        user_agent: header("user-agent"),
        sdk_version: header("x-sdk-version"),
        ci_provider: header("x-ci-provider"),
    }
}
