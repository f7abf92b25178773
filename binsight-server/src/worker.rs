//! Worker state machine and tier worker pools
//!
//! One attempt drives a job through:
//!
//! ```text
//! received → processing (10%) → downloading (20%) → analyzing (40%) →
//! analyzed (75%) → results-saved (90%) → charged → completed (100%)
//!                                                      \→ failed
//! ```
//!
//! Side effects are idempotent per job id: a redelivered job that is
//! already terminal short-circuits, and a job that was charged but not
//! completed (crash between the two writes) completes without charging
//! again. The ledger charge itself never fails the job; the user already
//! has results, so a charge failure is an operator problem, not theirs.

use crate::analyzer::Analyzer;
use crate::blob::BlobStore;
use crate::db::jobs::JobStore;
use crate::db::ledger::Ledger;
use crate::queue::{QueueLease, TieredQueue};
use binsight_common::config::QueueConfig;
use binsight_common::events::{EventBus, JobEvent};
use binsight_common::model::{Job, JobError, ServiceTier};
use binsight_common::pricing;
use binsight_common::{Error, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Everything a worker needs; cheap to clone across pools
#[derive(Clone)]
pub struct WorkerContext {
    pub jobs: JobStore,
    pub ledger: Ledger,
    pub queue: TieredQueue,
    pub blobs: Arc<dyn BlobStore>,
    pub analyzer: Arc<dyn Analyzer>,
    pub events: EventBus,
}

impl WorkerContext {
    fn queue_config(&self) -> &QueueConfig {
        self.queue.config()
    }
}

/// Process one claimed lease end to end: run the attempt under the
/// per-attempt timeout, then settle the queue entry and, on a final
/// failure, the job row and its blob.
pub async fn process_lease(ctx: &WorkerContext, lease: QueueLease) -> Result<()> {
    let timeout = ctx.queue_config().job_timeout;
    let outcome = match tokio::time::timeout(timeout, run_attempt(ctx, &lease)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("attempt timed out after {}s", timeout.as_secs()),
        ))),
    };

    match outcome {
        Ok(()) => {
            ctx.queue.complete(&lease).await?;
            Ok(())
        }
        Err(err) => {
            let will_retry =
                err.is_retryable() && lease.attempt < ctx.queue_config().max_attempts;
            ctx.queue
                .fail(&lease, &err.to_string(), err.is_retryable())
                .await?;
            if !will_retry {
                finalize_failure(ctx, &lease, &err).await;
            }
            Err(err)
        }
    }
}

/// One pass of the state machine. Transient errors bubble out for the
/// queue's retry policy; the job row is only failed once retries are
/// spent (`finalize_failure`), so a redelivery finds it still mutable.
async fn run_attempt(ctx: &WorkerContext, lease: &QueueLease) -> Result<()> {
    // received → processing. A missing row means a stale queue entry;
    // fatal, never retried.
    let job = ctx
        .jobs
        .get(lease.job_id)
        .await?
        .ok_or_else(|| Error::JobNotFound(lease.job_id.to_string()))?;

    // Redelivery of a settled job: nothing to do, charge nothing
    if job.status.is_terminal() {
        info!(
            job_id = %job.id,
            status = job.status.as_str(),
            "redelivered terminal job, short-circuiting"
        );
        return Ok(());
    }

    ctx.jobs.mark_processing(job.id, 10).await?;
    ctx.events.publish(JobEvent::JobProcessing {
        job_id: job.id,
        user_id: job.user_id,
        progress: 10,
        timestamp: Utc::now(),
    });

    // → downloading
    ctx.jobs.update_progress(job.id, 20).await?;
    publish_progress(ctx, &job, 20, "downloading");
    ctx.queue.renew_lease(lease).await?;

    let temp_path = ctx
        .blobs
        .get_to_temp_file(&job.blob_id, &job.filename)
        .await?;

    let result = analyze_and_settle(ctx, lease, &job, &temp_path).await;
    remove_temp(&temp_path).await;
    result
}

/// analyzing → analyzed → charged → completed, with the temp file already
/// fetched. Split out so the temp file is cleaned on every exit path.
async fn analyze_and_settle(
    ctx: &WorkerContext,
    lease: &QueueLease,
    job: &Job,
    temp_path: &Path,
) -> Result<()> {
    // → analyzing
    ctx.jobs.update_progress(job.id, 40).await?;
    publish_progress(ctx, job, 40, "analyzing");
    ctx.queue.renew_lease(lease).await?;

    let started = Instant::now();
    let report = ctx.analyzer.analyze(temp_path, &job.filename).await?;
    let elapsed_seconds = started.elapsed().as_secs();

    // → analyzed
    ctx.jobs.attach_results(job.id, &report).await?;
    ctx.jobs.update_progress(job.id, 75).await?;
    publish_progress(ctx, job, 75, "analyzed");
    ctx.jobs.update_progress(job.id, 90).await?;
    publish_progress(ctx, job, 90, "results-saved");
    ctx.queue.renew_lease(lease).await?;

    // → charged. If a previous attempt already charged (crash between
    // charge and completion), keep that charge and do not debit again.
    let credits = match job.credits_charged {
        Some(existing) => {
            info!(job_id = %job.id, existing, "charge already recorded, skipping debit");
            existing
        }
        None => {
            let breakdown = pricing::price(job.size_bytes as u64, elapsed_seconds);
            ctx.jobs
                .set_credit_charge(job.id, breakdown.total, &breakdown, elapsed_seconds as i64)
                .await?;

            if let Err(err) = ctx
                .ledger
                .deduct_usage(
                    job.user_id,
                    breakdown.total,
                    job.id,
                    job.api_key_id,
                    job.source.ledger_description(),
                )
                .await
            {
                // The user still gets results; surface for operators only
                error!(
                    job_id = %job.id,
                    user_id = %job.user_id,
                    credits = breakdown.total,
                    "ledger charge failed, job completes anyway: {err}"
                );
            }
            breakdown.total
        }
    };

    // → completed. The blob stays; the janitor owns its 24 h retention.
    ctx.jobs.complete(job.id).await?;
    ctx.events.publish(JobEvent::JobCompleted {
        job_id: job.id,
        user_id: job.user_id,
        results: Box::new(report),
        credits_charged: credits,
        timestamp: Utc::now(),
    });

    info!(
        job_id = %job.id,
        credits,
        elapsed_seconds,
        "job completed"
    );
    Ok(())
}

/// Retries are spent: fail the job row, drop the blob (failed jobs do not
/// justify the storage), publish the failure. Nothing was charged, so
/// there is nothing to refund.
async fn finalize_failure(ctx: &WorkerContext, lease: &QueueLease, err: &Error) {
    let job_error = JobError {
        message: err.to_string(),
        code: err.code().as_str().to_string(),
        stack: None,
    };

    let job = match ctx.jobs.get(lease.job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => return,
        Err(load_err) => {
            error!(job_id = %lease.job_id, "cannot load job to record failure: {load_err}");
            return;
        }
    };
    if job.status.is_terminal() {
        return;
    }

    if let Err(fail_err) = ctx.jobs.fail(job.id, &job_error).await {
        error!(job_id = %job.id, "failed to record job failure: {fail_err}");
    }
    if let Err(del_err) = ctx.blobs.delete(&job.blob_id).await {
        warn!(job_id = %job.id, "blob cleanup after failure: {del_err}");
    }

    ctx.events.publish(JobEvent::JobFailed {
        job_id: job.id,
        user_id: job.user_id,
        error: job_error,
        timestamp: Utc::now(),
    });
}

fn publish_progress(ctx: &WorkerContext, job: &Job, progress: i64, stage: &str) {
    ctx.events.publish(JobEvent::JobProgress {
        job_id: job.id,
        user_id: job.user_id,
        progress,
        stage: stage.to_string(),
        timestamp: Utc::now(),
    });
}

async fn remove_temp(path: &PathBuf) {
    if let Err(err) = tokio::fs::remove_file(path).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            debug!(path = %path.display(), "temp file cleanup failed: {err}");
        }
    }
}

/// Spawn one polling pool per tier, each bounded by its concurrency cap.
/// No worker owns more than one job at a time; a pool claims only when a
/// permit is free, so the cap is a strict upper bound.
pub fn spawn_worker_pools(ctx: WorkerContext, cancel: CancellationToken) {
    for tier in [ServiceTier::Tier1, ServiceTier::Tier2] {
        let cap = match tier {
            ServiceTier::Tier1 => ctx.queue_config().tier1_concurrency,
            ServiceTier::Tier2 => ctx.queue_config().tier2_concurrency,
        };
        let ctx = ctx.clone();
        let cancel = cancel.clone();
        tokio::spawn(run_tier_pool(ctx, tier, cap, cancel));
    }
}

async fn run_tier_pool(
    ctx: WorkerContext,
    tier: ServiceTier,
    concurrency: usize,
    cancel: CancellationToken,
) {
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let poll_interval = ctx.queue_config().poll_interval;
    info!(tier = tier.as_str(), concurrency, "worker pool started");

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        match ctx.queue.claim(tier).await {
            Ok(Some(lease)) => {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    let job_id = lease.job_id;
                    if let Err(err) = process_lease(&ctx, lease).await {
                        debug!(job_id = %job_id, "attempt ended with error: {err}");
                    }
                    drop(permit);
                });
            }
            Ok(None) => {
                drop(permit);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
            Err(err) => {
                drop(permit);
                warn!(tier = tier.as_str(), "queue claim failed: {err}");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
        }
    }

    info!(tier = tier.as_str(), "worker pool stopped");
}
