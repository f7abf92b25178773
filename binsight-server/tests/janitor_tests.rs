//! Janitor sweep integration tests

mod helpers;

use binsight_common::model::{JobStatus, ServiceTier};
use chrono::Utc;
use helpers::{sample_report, Scripted, TestApp};
use std::time::Duration;
use uuid::Uuid;

mod ingest_util {
    use super::*;
    use binsight_common::model::{JobSource, UploadMeta};
    use binsight_server::ingest::{ingest_upload, IngestRequest};

    pub async fn queue_job(app: &TestApp, user: Uuid, bytes: Vec<u8>) -> Uuid {
        ingest_upload(
            &app.ctx,
            IngestRequest {
                user_id: user,
                api_key_id: None,
                filename: "sweep.bin".to_string(),
                bytes,
                source: JobSource::Sdk,
                meta: UploadMeta::default(),
            },
        )
        .await
        .unwrap()
        .job
        .id
    }
}

#[tokio::test]
async fn sweep_removes_old_blobs_jobs_and_otps() {
    let app = TestApp::spawn().await;
    let user = app.seed_user(100, ServiceTier::Tier2).await;

    // Complete a job so a blob and a terminal row exist
    let job_id = ingest_util::queue_job(&app, user, vec![1u8; 128]).await;
    app.analyzer.push(Scripted::Succeed(sample_report())).await;
    app.run_next_job(ServiceTier::Tier2).await.unwrap();

    // An expired OTP row
    let otp = app.ctx.otps.issue(user, "login").await.unwrap();
    sqlx::query("UPDATE otps SET expires_at = ? WHERE id = ?")
        .bind(Utc::now() - chrono::Duration::minutes(3))
        .bind(otp.id.to_string())
        .execute(&app.ctx.db)
        .await
        .unwrap();

    // First sweep: everything is fresh, only the OTP goes
    let report = app.ctx.janitor.run_once().await.unwrap().unwrap();
    assert_eq!(report.blobs_deleted, 0);
    assert_eq!(report.jobs_deleted, 0);
    assert_eq!(report.otps_deleted, 1);
    assert!(app.ctx.jobs.get(job_id).await.unwrap().is_some());

    // Age the terminal row and queue entry past the 7 day horizon
    sqlx::query("UPDATE jobs SET completed_at = ? WHERE id = ?")
        .bind(Utc::now() - chrono::Duration::days(8))
        .bind(job_id.to_string())
        .execute(&app.ctx.db)
        .await
        .unwrap();
    sqlx::query("UPDATE queue_entries SET finished_at = ?")
        .bind(Utc::now() - chrono::Duration::days(8))
        .execute(&app.ctx.db)
        .await
        .unwrap();

    let report = app.ctx.janitor.run_once().await.unwrap().unwrap();
    assert_eq!(report.jobs_deleted, 1);
    assert_eq!(report.queue_entries_pruned, 1);
    assert!(app.ctx.jobs.get(job_id).await.unwrap().is_none());
}

#[tokio::test]
async fn sweep_ignores_jobs_still_processing() {
    let app = TestApp::spawn().await;
    let user = app.seed_user(100, ServiceTier::Tier2).await;

    let job_id = ingest_util::queue_job(&app, user, vec![2u8; 128]).await;
    // Claim it so it sits in processing
    let lease = app.worker.queue.claim(ServiceTier::Tier2).await.unwrap().unwrap();
    app.ctx.jobs.mark_processing(lease.job_id, 10).await.unwrap();

    let report = app.ctx.janitor.run_once().await.unwrap().unwrap();
    assert_eq!(report.jobs_deleted, 0);
    assert_eq!(
        app.ctx.jobs.get(job_id).await.unwrap().unwrap().status,
        JobStatus::Processing
    );
}

#[tokio::test]
async fn old_blobs_are_swept_after_retention() {
    let app = TestApp::spawn().await;
    let user = app.seed_user(100, ServiceTier::Tier2).await;

    let stored = app
        .ctx
        .blobs
        .put(user, "stale.bin", b"stale bytes")
        .await
        .unwrap();

    // Fresh blob survives
    let report = app.ctx.janitor.run_once().await.unwrap().unwrap();
    assert_eq!(report.blobs_deleted, 0);
    assert!(app.ctx.blobs.get(&stored.handle).await.is_ok());

    // With retention reduced to zero the blob qualifies
    let mut config = app.ctx.config.janitor.clone();
    config.blob_retention = Duration::from_secs(0);
    let janitor = binsight_server::janitor::Janitor::new(
        app.ctx.jobs.clone(),
        app.ctx.otps.clone(),
        app.ctx.queue.clone(),
        app.ctx.blobs.clone(),
        config,
    );
    tokio::time::sleep(Duration::from_millis(20)).await;
    let report = janitor.run_once().await.unwrap().unwrap();
    assert!(report.blobs_deleted >= 1);
    assert!(app.ctx.blobs.get(&stored.handle).await.is_err());
}
