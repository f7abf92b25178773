//! Upload ingestion
//!
//! The shared path behind both the SDK and dashboard analyze endpoints:
//! admission gate, blob upload, per-hash cache probe, job creation and
//! queue submission. Batch ingestion applies this per file with no
//! rollback of siblings.

use crate::state::AppContext;
use binsight_common::model::{Job, JobSource, UploadMeta};
use binsight_common::{Error, Result};
use tracing::{info, warn};
use uuid::Uuid;

/// One accepted upload
pub struct IngestRequest {
    pub user_id: Uuid,
    pub api_key_id: Option<Uuid>,
    pub filename: String,
    pub bytes: Vec<u8>,
    pub source: JobSource,
    pub meta: UploadMeta,
}

/// Outcome of ingestion: either a fresh queued job or a cache hit
#[derive(Debug)]
pub struct IngestOutcome {
    pub job: Job,
    pub cached: bool,
}

/// Run one upload through the ingestion path
pub async fn ingest_upload(ctx: &AppContext, request: IngestRequest) -> Result<IngestOutcome> {
    if request.bytes.is_empty() {
        return Err(Error::MissingFile);
    }

    // Admission gate: a fixed threshold rather than a cost estimate,
    // because the true cost depends on processing time we cannot know
    // yet. Balances may consequently dip below zero by one job's cost.
    let threshold = ctx.config.admission_threshold;
    let balance = ctx.ledger.balance(request.user_id).await?;
    if balance.remaining < threshold {
        return Err(Error::InsufficientCredits {
            available: balance.remaining,
            required: threshold,
            deficit: threshold - balance.remaining,
        });
    }

    let stored = ctx
        .blobs
        .put(request.user_id, &request.filename, &request.bytes)
        .await?;

    // Cache probe on (owner, digest): a hit discards the fresh upload and
    // returns the completed job with no ledger effect.
    if let Some(cached) = ctx
        .jobs
        .find_completed_by_owner_and_hash(request.user_id, &stored.digest)
        .await?
    {
        info!(
            user_id = %request.user_id,
            job_id = %cached.id,
            hash = %stored.digest,
            "cache hit, discarding fresh upload"
        );
        if let Err(err) = ctx.blobs.delete(&stored.handle).await {
            warn!(handle = %stored.handle, "failed to delete duplicate upload: {err}");
        }
        return Ok(IngestOutcome {
            job: cached,
            cached: true,
        });
    }

    let tier = ctx.users.tier_of(request.user_id).await?;
    let job = Job::new(
        request.user_id,
        request.api_key_id,
        request.filename,
        stored.size as i64,
        stored.digest,
        stored.handle.clone(),
        Some(stored.url_hint),
        tier,
        request.source,
        request.meta,
    );

    ctx.jobs.insert(&job).await?;
    if let Err(err) = ctx.queue.submit(job.id, tier).await {
        // Queue backend unreachable: undo the record and the upload so the
        // client can retry cleanly.
        warn!(job_id = %job.id, "queue submit failed, rolling back ingestion: {err}");
        let _ = ctx.jobs.delete(job.id).await;
        let _ = ctx.blobs.delete(&stored.handle).await;
        return Err(err);
    }

    info!(
        job_id = %job.id,
        user_id = %request.user_id,
        tier = tier.as_str(),
        size_bytes = job.size_bytes,
        "job queued"
    );
    Ok(IngestOutcome { job, cached: false })
}

/// SHA-256 hex fingerprints are the only accepted hash format
pub fn validate_hash(hash: &str) -> Result<()> {
    if hash.len() == 64 && hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()) {
        Ok(())
    } else {
        Err(Error::InvalidHash(hash.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_validation_accepts_lowercase_sha256() {
        assert!(validate_hash(&"a1".repeat(32)).is_ok());
        assert!(validate_hash(&"0".repeat(64)).is_ok());
    }

    #[test]
    fn hash_validation_rejects_malformed_input() {
        assert!(validate_hash("").is_err());
        assert!(validate_hash(&"a".repeat(63)).is_err());
        assert!(validate_hash(&"a".repeat(65)).is_err());
        assert!(validate_hash(&"G".repeat(64)).is_err());
        // Uppercase hex is not the canonical form
        assert!(validate_hash(&"A".repeat(64)).is_err());
    }
}
