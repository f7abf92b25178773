//! Worker state-machine integration tests
//!
//! Drives jobs through ingestion, the queue and the worker against the
//! scripted analyzer, checking charges, retries and cleanup.

mod helpers;

use binsight_common::events::JobEvent;
use binsight_common::model::{JobSource, JobStatus, ServiceTier, TxnKind, UploadMeta};
use binsight_server::ingest::{ingest_upload, IngestRequest};
use binsight_server::queue::QueueLease;
use binsight_server::worker;
use helpers::{sample_report, Scripted, TestApp};
use uuid::Uuid;

async fn ingest_file(app: &TestApp, user: Uuid, filename: &str, bytes: Vec<u8>) -> Uuid {
    let outcome = ingest_upload(
        &app.ctx,
        IngestRequest {
            user_id: user,
            api_key_id: None,
            filename: filename.to_string(),
            bytes,
            source: JobSource::Sdk,
            meta: UploadMeta::default(),
        },
    )
    .await
    .unwrap();
    assert!(!outcome.cached);
    outcome.job.id
}

#[tokio::test]
async fn small_fast_file_completes_and_charges_two_credits() {
    let app = TestApp::spawn().await;
    let user = app.seed_user(100, ServiceTier::Tier2).await;
    let mut events = app.ctx.events.subscribe();

    // 200 KiB payload, analyzer answers immediately
    let job_id = ingest_file(&app, user, "small.bin", vec![7u8; 200 * 1024]).await;
    app.analyzer.push(Scripted::Succeed(sample_report())).await;

    app.run_next_job(ServiceTier::Tier2).await.unwrap();

    let job = app.ctx.jobs.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 100);
    assert_eq!(job.credits_charged, Some(2));
    assert!(job.results.is_some());
    assert!(job.completed_at.is_some());

    let breakdown = job.credit_breakdown.unwrap();
    assert_eq!(breakdown.size_credits, 2);
    assert_eq!(breakdown.time_credits, 0);

    // One debit of 2 against the ledger
    let balance = app.ctx.ledger.balance(user).await.unwrap();
    assert_eq!(balance.remaining, 98);
    let txns = app.ctx.ledger.transactions_for(user).await.unwrap();
    let debits: Vec<_> = txns.iter().filter(|t| t.kind == TxnKind::Debit).collect();
    assert_eq!(debits.len(), 1);
    assert_eq!(debits[0].amount, 2);
    assert_eq!(debits[0].job_id, Some(job_id));
    assert_eq!(debits[0].description, "SDK Binary Analysis");

    // Blob retained for the janitor's 24 h window
    assert!(app.ctx.blobs.get(&job.blob_id).await.is_ok());

    // Progress never decreased across the published ladder
    let mut last_progress = 0;
    let mut saw_completed = false;
    while let Ok(event) = events.try_recv() {
        match event {
            JobEvent::JobProcessing { progress, .. } | JobEvent::JobProgress { progress, .. } => {
                assert!(progress >= last_progress, "progress went backwards");
                last_progress = progress;
            }
            JobEvent::JobCompleted {
                credits_charged, ..
            } => {
                assert_eq!(credits_charged, 2);
                saw_completed = true;
            }
            JobEvent::JobFailed { .. } => panic!("unexpected failure event"),
        }
    }
    assert!(saw_completed);
}

#[tokio::test]
async fn identical_reupload_is_served_from_cache() {
    let app = TestApp::spawn().await;
    let user = app.seed_user(100, ServiceTier::Tier2).await;
    let payload = vec![42u8; 1024];

    let job_id = ingest_file(&app, user, "dup.bin", payload.clone()).await;
    app.analyzer.push(Scripted::Succeed(sample_report())).await;
    app.run_next_job(ServiceTier::Tier2).await.unwrap();
    let calls_after_first = app.analyzer.call_count();

    // Same bytes again: cache hit, no new job, no analyzer call, no charge
    let outcome = ingest_upload(
        &app.ctx,
        IngestRequest {
            user_id: user,
            api_key_id: None,
            filename: "dup-again.bin".to_string(),
            bytes: payload,
            source: JobSource::Sdk,
            meta: UploadMeta::default(),
        },
    )
    .await
    .unwrap();

    assert!(outcome.cached);
    assert_eq!(outcome.job.id, job_id);
    assert!(app.run_next_job(ServiceTier::Tier2).await.is_none());
    assert_eq!(app.analyzer.call_count(), calls_after_first);

    let balance = app.ctx.ledger.balance(user).await.unwrap();
    assert_eq!(balance.remaining, 98); // only the first job charged

    // The duplicate upload's blob was discarded; the original remains
    let job = app.ctx.jobs.get(job_id).await.unwrap().unwrap();
    assert!(app.ctx.blobs.get(&job.blob_id).await.is_ok());
}

#[tokio::test]
async fn admission_passes_at_threshold_then_debt_blocks_the_next_upload() {
    let app = TestApp::spawn().await;
    let user = app.seed_user(5, ServiceTier::Tier2).await;

    // Admitted with exactly the threshold; a huge file drives debt
    let job_id = ingest_file(&app, user, "huge.bin", vec![1u8; 1024]).await;
    // Price as a 60 MiB upload regardless of what the test actually wrote
    sqlx::query("UPDATE jobs SET size_bytes = ? WHERE id = ?")
        .bind(60 * 1024 * 1024_i64)
        .bind(job_id.to_string())
        .execute(&app.ctx.db)
        .await
        .unwrap();

    app.analyzer.push(Scripted::Succeed(sample_report())).await;
    app.run_next_job(ServiceTier::Tier2).await.unwrap();

    let job = app.ctx.jobs.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.credits_charged, Some(35));

    let balance = app.ctx.ledger.balance(user).await.unwrap();
    assert_eq!(balance.remaining, 5 - 35);

    // Next upload is rejected with the balance snapshot
    let err = ingest_upload(
        &app.ctx,
        IngestRequest {
            user_id: user,
            api_key_id: None,
            filename: "next.bin".to_string(),
            bytes: vec![2u8; 64],
            source: JobSource::Sdk,
            meta: UploadMeta::default(),
        },
    )
    .await
    .unwrap_err();

    match err {
        binsight_common::Error::InsufficientCredits {
            available,
            required,
            deficit,
        } => {
            assert_eq!(available, -30);
            assert_eq!(required, 5);
            assert_eq!(deficit, 35);
        }
        other => panic!("expected InsufficientCredits, got {other}"),
    }
}

#[tokio::test]
async fn analyzer_outage_retries_then_succeeds_without_double_charge() {
    let app = TestApp::spawn().await;
    let user = app.seed_user(100, ServiceTier::Tier1).await;

    let job_id = ingest_file(&app, user, "flaky.bin", vec![3u8; 2048]).await;
    app.analyzer
        .push(Scripted::Unavailable("analyzer returned 500".to_string()))
        .await;
    app.analyzer
        .push(Scripted::Unavailable("analyzer returned 500".to_string()))
        .await;
    app.analyzer.push(Scripted::Succeed(sample_report())).await;

    // Three attempts: two transient failures, then success
    let attempts = app.run_until_idle(ServiceTier::Tier1).await;
    assert_eq!(attempts, 3);
    assert_eq!(app.analyzer.call_count(), 3);

    let job = app.ctx.jobs.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);

    // Exactly one debit despite the retries
    let txns = app.ctx.ledger.transactions_for(user).await.unwrap();
    assert_eq!(
        txns.iter().filter(|t| t.kind == TxnKind::Debit).count(),
        1
    );
}

#[tokio::test]
async fn exhausted_retries_fail_the_job_and_drop_the_blob() {
    let app = TestApp::spawn().await;
    let user = app.seed_user(100, ServiceTier::Tier1).await;
    let mut events = app.ctx.events.subscribe();

    let job_id = ingest_file(&app, user, "down.bin", vec![4u8; 512]).await;
    for _ in 0..3 {
        app.analyzer
            .push(Scripted::Unavailable("connection refused".to_string()))
            .await;
    }

    let attempts = app.run_until_idle(ServiceTier::Tier1).await;
    assert_eq!(attempts, 3);

    let job = app.ctx.jobs.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    let error = job.error.unwrap();
    assert_eq!(error.code, "ANALYZER_UNAVAILABLE");

    // Blob deleted, nothing charged, nothing refunded
    assert!(app.ctx.blobs.get(&job.blob_id).await.is_err());
    assert!(app.ctx.ledger.transactions_for(user).await.unwrap().len() == 1); // seed grant only

    let mut saw_failed = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, JobEvent::JobFailed { .. }) {
            saw_failed = true;
        }
    }
    assert!(saw_failed);
}

#[tokio::test]
async fn logical_analyzer_error_fails_immediately_without_retry() {
    let app = TestApp::spawn().await;
    let user = app.seed_user(100, ServiceTier::Tier2).await;

    let job_id = ingest_file(&app, user, "bad.bin", vec![5u8; 512]).await;
    app.analyzer
        .push(Scripted::Fail("unsupported architecture".to_string()))
        .await;

    let attempts = app.run_until_idle(ServiceTier::Tier2).await;
    assert_eq!(attempts, 1);
    assert_eq!(app.analyzer.call_count(), 1);

    let job = app.ctx.jobs.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.unwrap().code, "ANALYSIS_FAILED");
    assert!(app.ctx.blobs.get(&job.blob_id).await.is_err());
}

#[tokio::test]
async fn redelivered_completed_job_short_circuits() {
    let app = TestApp::spawn().await;
    let user = app.seed_user(100, ServiceTier::Tier2).await;

    let job_id = ingest_file(&app, user, "once.bin", vec![6u8; 512]).await;
    app.analyzer.push(Scripted::Succeed(sample_report())).await;
    app.run_next_job(ServiceTier::Tier2).await.unwrap();

    let calls = app.analyzer.call_count();
    let balance = app.ctx.ledger.balance(user).await.unwrap();

    // Force a redelivery of the already-completed job
    app.ctx.queue.submit(job_id, ServiceTier::Tier2).await.unwrap();
    app.run_next_job(ServiceTier::Tier2).await.unwrap();

    // No second analysis, no second charge
    assert_eq!(app.analyzer.call_count(), calls);
    assert_eq!(
        app.ctx.ledger.balance(user).await.unwrap().remaining,
        balance.remaining
    );
    let txns = app.ctx.ledger.transactions_for(user).await.unwrap();
    assert_eq!(
        txns.iter().filter(|t| t.kind == TxnKind::Debit).count(),
        1
    );
}

#[tokio::test]
async fn stale_queue_entry_fails_without_retry() {
    let app = TestApp::spawn().await;

    // Entry pointing at a job that never existed
    let ghost = Uuid::new_v4();
    app.ctx.queue.submit(ghost, ServiceTier::Tier1).await.unwrap();

    let lease: QueueLease = app.worker.queue.claim(ServiceTier::Tier1).await.unwrap().unwrap();
    let err = worker::process_lease(&app.worker, lease).await.unwrap_err();
    assert!(matches!(err, binsight_common::Error::JobNotFound(_)));

    // Fatal: not redelivered
    assert!(app.worker.queue.claim(ServiceTier::Tier1).await.unwrap().is_none());
    assert_eq!(app.ctx.queue.counts().await.unwrap().failed, 1);
    assert_eq!(app.analyzer.call_count(), 0);
}
