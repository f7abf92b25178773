//! Job rows: the durable record of each analysis job and its lifecycle
//!
//! Mutation guards enforce the lifecycle invariants at the SQL layer: a
//! terminal row (completed or failed) is immutable here; only the janitor
//! deletes it. A guarded update that matches no row surfaces as
//! `Error::InvalidState` and is never retried.

use binsight_common::model::{
    AnalysisReport, Job, JobError, JobSource, JobStatus, ServiceTier, UploadMeta,
};
use binsight_common::pricing::CreditBreakdown;
use binsight_common::{Error, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Accessor for the `jobs` table
#[derive(Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, job: &Job) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs
                (id, user_id, api_key_id, filename, size_bytes, hash, blob_id, blob_url,
                 tier, priority, status, progress, queued_at, source, meta)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job.id.to_string())
        .bind(job.user_id.to_string())
        .bind(job.api_key_id.map(|id| id.to_string()))
        .bind(&job.filename)
        .bind(job.size_bytes)
        .bind(&job.hash)
        .bind(&job.blob_id)
        .bind(job.blob_url.as_deref())
        .bind(job.tier.as_str())
        .bind(job.priority)
        .bind(job.status.as_str())
        .bind(job.progress)
        .bind(job.queued_at)
        .bind(job.source.as_str())
        .bind(serde_json::to_string(&job.meta)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    /// First pick-up of an attempt: queued/processing → processing.
    /// Redeliveries land here again, which is allowed.
    pub async fn mark_processing(&self, id: Uuid, progress: i64) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'processing', progress = ?,
                started_at = COALESCE(started_at, ?)
            WHERE id = ? AND status IN ('queued', 'processing')
            "#,
        )
        .bind(progress)
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(Error::InvalidState(format!(
                "job {id} is terminal or missing, cannot mark processing"
            )));
        }
        Ok(())
    }

    pub async fn update_progress(&self, id: Uuid, progress: i64) -> Result<()> {
        if !(0..=100).contains(&progress) {
            return Err(Error::InvalidState(format!(
                "progress out of range: {progress}"
            )));
        }
        let updated = sqlx::query(
            "UPDATE jobs SET progress = ? WHERE id = ? AND status NOT IN ('completed', 'failed')",
        )
        .bind(progress)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(Error::InvalidState(format!(
                "job {id} is terminal or missing, cannot update progress"
            )));
        }
        Ok(())
    }

    pub async fn attach_results(&self, id: Uuid, results: &AnalysisReport) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE jobs SET results = ? WHERE id = ? AND status NOT IN ('completed', 'failed')",
        )
        .bind(serde_json::to_string(results)?)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(Error::InvalidState(format!(
                "job {id} is terminal or missing, cannot attach results"
            )));
        }
        Ok(())
    }

    pub async fn set_credit_charge(
        &self,
        id: Uuid,
        amount: i64,
        breakdown: &CreditBreakdown,
        processing_seconds: i64,
    ) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET credits_charged = ?, credit_breakdown = ?, processing_seconds = ?
            WHERE id = ? AND status NOT IN ('completed', 'failed')
            "#,
        )
        .bind(amount)
        .bind(serde_json::to_string(breakdown)?)
        .bind(processing_seconds)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(Error::InvalidState(format!(
                "job {id} is terminal or missing, cannot set charge"
            )));
        }
        Ok(())
    }

    /// Terminal success; requires results and charge already persisted
    pub async fn complete(&self, id: Uuid) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed', progress = 100, completed_at = ?
            WHERE id = ? AND status = 'processing'
                AND results IS NOT NULL AND credits_charged IS NOT NULL
            "#,
        )
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(Error::InvalidState(format!(
                "job {id} cannot complete: wrong state or missing results/charge"
            )));
        }
        Ok(())
    }

    /// Terminal failure with the structured error record
    pub async fn fail(&self, id: Uuid, error: &JobError) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed', completed_at = ?, error = ?
            WHERE id = ? AND status NOT IN ('completed', 'failed')
            "#,
        )
        .bind(Utc::now())
        .bind(serde_json::to_string(error)?)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(Error::InvalidState(format!(
                "job {id} is terminal or missing, cannot fail"
            )));
        }
        Ok(())
    }

    /// Latest completed job for `(owner, fingerprint)`; the ingestion cache
    pub async fn find_completed_by_owner_and_hash(
        &self,
        user_id: Uuid,
        hash: &str,
    ) -> Result<Option<Job>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM jobs
            WHERE user_id = ? AND hash = ? AND status = 'completed'
            ORDER BY completed_at DESC LIMIT 1
            "#,
        )
        .bind(user_id.to_string())
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    /// Janitor sweep of old terminal rows; returns the number deleted
    pub async fn delete_terminal_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let deleted = sqlx::query(
            "DELETE FROM jobs WHERE status IN ('completed', 'failed') AND completed_at < ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(deleted.rows_affected())
    }

    /// Remove a row outright; used to roll back an enqueue that failed
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Paged history for the dashboard, newest first
    pub async fn list_for_owner(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<Job>, i64)> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE user_id = ?")
            .bind(user_id.to_string())
            .fetch_one(&self.pool)
            .await?;

        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE user_id = ? ORDER BY queued_at DESC LIMIT ? OFFSET ?",
        )
        .bind(user_id.to_string())
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let jobs = rows.iter().map(job_from_row).collect::<Result<Vec<_>>>()?;
        Ok((jobs, total))
    }
}

fn job_from_row(row: &SqliteRow) -> Result<Job> {
    let id: String = row.try_get("id")?;
    let user_id: String = row.try_get("user_id")?;
    let api_key_id: Option<String> = row.try_get("api_key_id")?;
    let tier: String = row.try_get("tier")?;
    let status: String = row.try_get("status")?;
    let source: String = row.try_get("source")?;
    let breakdown: Option<String> = row.try_get("credit_breakdown")?;
    let results: Option<String> = row.try_get("results")?;
    let error: Option<String> = row.try_get("error")?;
    let meta: String = row.try_get("meta")?;

    Ok(Job {
        id: parse_uuid(&id)?,
        user_id: parse_uuid(&user_id)?,
        api_key_id: api_key_id.as_deref().map(parse_uuid).transpose()?,
        filename: row.try_get("filename")?,
        size_bytes: row.try_get("size_bytes")?,
        hash: row.try_get("hash")?,
        blob_id: row.try_get("blob_id")?,
        blob_url: row.try_get("blob_url")?,
        tier: ServiceTier::parse(&tier)?,
        priority: row.try_get("priority")?,
        status: JobStatus::parse(&status)?,
        progress: row.try_get("progress")?,
        queued_at: row.try_get("queued_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        processing_seconds: row.try_get("processing_seconds")?,
        credits_charged: row.try_get("credits_charged")?,
        credit_breakdown: breakdown
            .as_deref()
            .map(serde_json::from_str::<CreditBreakdown>)
            .transpose()?,
        results: results
            .as_deref()
            .map(serde_json::from_str::<AnalysisReport>)
            .transpose()?,
        error: error
            .as_deref()
            .map(serde_json::from_str::<JobError>)
            .transpose()?,
        source: JobSource::parse(&source)?,
        meta: serde_json::from_str::<UploadMeta>(&meta)?,
    })
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| Error::Internal(format!("bad uuid in job row: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use binsight_common::db::connect_memory;
    use binsight_common::model::{FileInfo, VulnerabilityAssessment};
    use binsight_common::pricing;

    fn sample_job(user_id: Uuid, hash: &str) -> Job {
        Job::new(
            user_id,
            None,
            "sample.bin".to_string(),
            200 * 1024,
            hash.to_string(),
            "blob-1".to_string(),
            None,
            ServiceTier::Tier2,
            JobSource::Sdk,
            UploadMeta::default(),
        )
    }

    fn sample_report() -> AnalysisReport {
        AnalysisReport {
            file_info: FileInfo {
                file_type: "ELF64".to_string(),
                size_bytes: 200 * 1024,
                sha256: "a".repeat(64),
                md5: "b".repeat(32),
                sha1: "c".repeat(40),
            },
            algorithms: Vec::new(),
            functions: Vec::new(),
            protocols: Vec::new(),
            vulnerability_assessment: VulnerabilityAssessment::default(),
            explanation: "clean sample".to_string(),
        }
    }

    #[tokio::test]
    async fn insert_get_round_trips() {
        let pool = connect_memory().await.unwrap();
        let store = JobStore::new(pool);
        let job = sample_job(Uuid::new_v4(), &"d".repeat(64));

        store.insert(&job).await.unwrap();
        let loaded = store.get(job.id).await.unwrap().unwrap();

        assert_eq!(loaded.id, job.id);
        assert_eq!(loaded.status, JobStatus::Queued);
        assert_eq!(loaded.filename, "sample.bin");
        assert_eq!(loaded.tier, ServiceTier::Tier2);
        assert!(loaded.results.is_none());
    }

    #[tokio::test]
    async fn full_lifecycle_to_completed() {
        let pool = connect_memory().await.unwrap();
        let store = JobStore::new(pool);
        let job = sample_job(Uuid::new_v4(), &"d".repeat(64));
        store.insert(&job).await.unwrap();

        store.mark_processing(job.id, 10).await.unwrap();
        store.update_progress(job.id, 40).await.unwrap();
        store.attach_results(job.id, &sample_report()).await.unwrap();
        store.update_progress(job.id, 90).await.unwrap();
        store
            .set_credit_charge(job.id, 2, &pricing::price(200 * 1024, 5), 5)
            .await
            .unwrap();
        store.complete(job.id).await.unwrap();

        let loaded = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Completed);
        assert_eq!(loaded.progress, 100);
        assert_eq!(loaded.credits_charged, Some(2));
        assert_eq!(loaded.processing_seconds, Some(5));
        assert!(loaded.completed_at.is_some());
        assert!(loaded.results.is_some());
        assert!(loaded.started_at.is_some());
    }

    #[tokio::test]
    async fn complete_requires_results_and_charge() {
        let pool = connect_memory().await.unwrap();
        let store = JobStore::new(pool);
        let job = sample_job(Uuid::new_v4(), &"d".repeat(64));
        store.insert(&job).await.unwrap();
        store.mark_processing(job.id, 10).await.unwrap();

        // No results or charge persisted yet
        assert!(store.complete(job.id).await.is_err());
    }

    #[tokio::test]
    async fn terminal_rows_are_immutable() {
        let pool = connect_memory().await.unwrap();
        let store = JobStore::new(pool);
        let job = sample_job(Uuid::new_v4(), &"d".repeat(64));
        store.insert(&job).await.unwrap();
        store.mark_processing(job.id, 10).await.unwrap();
        store
            .fail(
                job.id,
                &JobError {
                    message: "analyzer exploded".to_string(),
                    code: "ANALYSIS_FAILED".to_string(),
                    stack: None,
                },
            )
            .await
            .unwrap();

        assert!(store.update_progress(job.id, 50).await.is_err());
        assert!(store.mark_processing(job.id, 10).await.is_err());
        assert!(store.attach_results(job.id, &sample_report()).await.is_err());
        assert!(store
            .fail(
                job.id,
                &JobError {
                    message: "again".to_string(),
                    code: "X".to_string(),
                    stack: None
                }
            )
            .await
            .is_err());
    }

    #[tokio::test]
    async fn cache_lookup_finds_latest_completed_only() {
        let pool = connect_memory().await.unwrap();
        let store = JobStore::new(pool);
        let user = Uuid::new_v4();
        let hash = "e".repeat(64);

        // A queued job with the same hash is not a cache hit
        let queued = sample_job(user, &hash);
        store.insert(&queued).await.unwrap();
        assert!(store
            .find_completed_by_owner_and_hash(user, &hash)
            .await
            .unwrap()
            .is_none());

        let mut done = sample_job(user, &hash);
        done.id = Uuid::new_v4();
        store.insert(&done).await.unwrap();
        store.mark_processing(done.id, 10).await.unwrap();
        store.attach_results(done.id, &sample_report()).await.unwrap();
        store
            .set_credit_charge(done.id, 2, &pricing::price(200 * 1024, 5), 5)
            .await
            .unwrap();
        store.complete(done.id).await.unwrap();

        let hit = store
            .find_completed_by_owner_and_hash(user, &hash)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.id, done.id);

        // Another owner with the same hash sees no cache entry
        assert!(store
            .find_completed_by_owner_and_hash(Uuid::new_v4(), &hash)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn terminal_sweep_respects_cutoff() {
        let pool = connect_memory().await.unwrap();
        let store = JobStore::new(pool.clone());
        let job = sample_job(Uuid::new_v4(), &"f".repeat(64));
        store.insert(&job).await.unwrap();
        store.mark_processing(job.id, 10).await.unwrap();
        store
            .fail(
                job.id,
                &JobError {
                    message: "boom".to_string(),
                    code: "ANALYSIS_FAILED".to_string(),
                    stack: None,
                },
            )
            .await
            .unwrap();

        // A fresh terminal row survives the 7-day cutoff
        let cutoff = Utc::now() - chrono::Duration::days(7);
        assert_eq!(store.delete_terminal_older_than(cutoff).await.unwrap(), 0);

        // Backdate and sweep again
        sqlx::query("UPDATE jobs SET completed_at = ? WHERE id = ?")
            .bind(Utc::now() - chrono::Duration::days(8))
            .bind(job.id.to_string())
            .execute(&pool)
            .await
            .unwrap();
        assert_eq!(store.delete_terminal_older_than(cutoff).await.unwrap(), 1);
        assert!(store.get(job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn owner_history_pages_newest_first() {
        let pool = connect_memory().await.unwrap();
        let store = JobStore::new(pool);
        let user = Uuid::new_v4();
        for i in 0..5 {
            let mut job = sample_job(user, &format!("{:064}", i));
            job.queued_at = Utc::now() + chrono::Duration::seconds(i);
            store.insert(&job).await.unwrap();
        }

        let (page, total) = store.list_for_owner(user, 2, 0).await.unwrap();
        assert_eq!(total, 5);
        assert_eq!(page.len(), 2);
        assert!(page[0].queued_at > page[1].queued_at);
    }
}
