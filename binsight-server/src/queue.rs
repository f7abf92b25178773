//! Tier-partitioned durable job queue
//!
//! Entries live in the `queue_entries` table so a restart loses nothing.
//! Delivery is at-least-once: a claim leases the entry and bumps its
//! attempt counter; an entry whose lease lapses without renewal goes back
//! to the pending set. Retryable failures re-schedule with exponential
//! backoff until the attempt cap, then park the entry as `failed`.
//!
//! Ordering inside a tier is priority then FIFO. Tiers are fully
//! partitioned; each tier's worker pool claims only its own entries, so
//! tier1 can never starve tier2.

use binsight_common::config::QueueConfig;
use binsight_common::model::ServiceTier;
use binsight_common::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// A claimed entry; the worker holds this for the duration of an attempt
#[derive(Debug, Clone)]
pub struct QueueLease {
    pub entry_id: Uuid,
    pub job_id: Uuid,
    pub tier: ServiceTier,
    /// 1-based attempt number including this delivery
    pub attempt: u32,
}

/// Counts by state for the operator surface
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct QueueCounts {
    pub active: i64,
    pub waiting: i64,
    pub delayed: i64,
    pub completed: i64,
    pub failed: i64,
}

/// Durable queue handle; cheap to clone
#[derive(Clone)]
pub struct TieredQueue {
    pool: SqlitePool,
    config: QueueConfig,
}

impl TieredQueue {
    pub fn new(pool: SqlitePool, config: QueueConfig) -> Self {
        Self { pool, config }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Enqueue a job under its tier. A backend failure surfaces as the
    /// retryable `QueueUnavailable` so ingestion can tell the client to
    /// try again rather than silently dropping the upload.
    pub async fn submit(&self, job_id: Uuid, tier: ServiceTier) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO queue_entries
                (id, job_id, tier, priority, state, attempts, available_at, enqueued_at, updated_at)
            VALUES (?, ?, ?, ?, 'waiting', 0, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(job_id.to_string())
        .bind(tier.as_str())
        .bind(tier.priority())
        .bind(now.timestamp())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::QueueUnavailable(format!("submit failed: {e}")))?;

        Ok(())
    }

    /// Claim the next ready entry for a tier, leasing it to the caller.
    /// The update is a single statement, so concurrent pools on the same
    /// tier never double-claim.
    pub async fn claim(&self, tier: ServiceTier) -> Result<Option<QueueLease>> {
        let now = Utc::now();
        let lease_expires = now.timestamp() + self.config.lease.as_secs() as i64;

        let row = sqlx::query(
            r#"
            UPDATE queue_entries
            SET state = 'active', attempts = attempts + 1,
                lease_expires_at = ?, updated_at = ?
            WHERE id = (
                SELECT id FROM queue_entries
                WHERE state IN ('waiting', 'delayed') AND tier = ? AND available_at <= ?
                ORDER BY priority, enqueued_at
                LIMIT 1
            )
            RETURNING id, job_id, attempts
            "#,
        )
        .bind(lease_expires)
        .bind(now)
        .bind(tier.as_str())
        .bind(now.timestamp())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let entry_id: String = row.try_get("id")?;
        let job_id: String = row.try_get("job_id")?;
        let attempts: i64 = row.try_get("attempts")?;

        Ok(Some(QueueLease {
            entry_id: parse_uuid(&entry_id)?,
            job_id: parse_uuid(&job_id)?,
            tier,
            attempt: attempts as u32,
        }))
    }

    /// Extend the lease mid-attempt; called between worker stages
    pub async fn renew_lease(&self, lease: &QueueLease) -> Result<()> {
        let expires = Utc::now().timestamp() + self.config.lease.as_secs() as i64;
        sqlx::query(
            "UPDATE queue_entries SET lease_expires_at = ?, updated_at = ? WHERE id = ? AND state = 'active'",
        )
        .bind(expires)
        .bind(Utc::now())
        .bind(lease.entry_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark an attempt's entry done
    pub async fn complete(&self, lease: &QueueLease) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE queue_entries
            SET state = 'completed', lease_expires_at = NULL, finished_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(lease.entry_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a failed attempt. Retryable errors under the attempt cap
    /// re-schedule with exponential backoff; everything else parks the
    /// entry as failed.
    pub async fn fail(&self, lease: &QueueLease, error: &str, retryable: bool) -> Result<()> {
        let now = Utc::now();
        let will_retry = retryable && lease.attempt < self.config.max_attempts;

        if will_retry {
            let delay = backoff_delay(self.config.backoff_base, lease.attempt);
            let available_at = now.timestamp() + delay.as_secs() as i64;
            warn!(
                job_id = %lease.job_id,
                attempt = lease.attempt,
                delay_secs = delay.as_secs(),
                "attempt failed, re-scheduling: {error}"
            );
            sqlx::query(
                r#"
                UPDATE queue_entries
                SET state = 'delayed', lease_expires_at = NULL, available_at = ?,
                    last_error = ?, updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(available_at)
            .bind(error)
            .bind(now)
            .bind(lease.entry_id.to_string())
            .execute(&self.pool)
            .await?;
        } else {
            warn!(
                job_id = %lease.job_id,
                attempt = lease.attempt,
                retryable,
                "attempt failed terminally: {error}"
            );
            sqlx::query(
                r#"
                UPDATE queue_entries
                SET state = 'failed', lease_expires_at = NULL, last_error = ?,
                    finished_at = ?, updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(error)
            .bind(now)
            .bind(now)
            .bind(lease.entry_id.to_string())
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    /// Return stalled entries (active past their lease) to the pending
    /// set. The claim already counted the attempt, so an entry at the cap
    /// parks as failed instead.
    pub async fn requeue_stalled(&self) -> Result<u64> {
        let now = Utc::now();

        let parked = sqlx::query(
            r#"
            UPDATE queue_entries
            SET state = 'failed', lease_expires_at = NULL,
                last_error = 'stalled: lease expired', finished_at = ?, updated_at = ?
            WHERE state = 'active' AND lease_expires_at < ? AND attempts >= ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(now.timestamp())
        .bind(self.config.max_attempts as i64)
        .execute(&self.pool)
        .await?
        .rows_affected();

        let requeued = sqlx::query(
            r#"
            UPDATE queue_entries
            SET state = 'waiting', lease_expires_at = NULL, available_at = ?,
                last_error = 'stalled: lease expired', updated_at = ?
            WHERE state = 'active' AND lease_expires_at < ?
            "#,
        )
        .bind(now.timestamp())
        .bind(now)
        .bind(now.timestamp())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if parked + requeued > 0 {
            warn!(requeued, parked, "stall sweep recovered expired leases");
        }
        Ok(requeued + parked)
    }

    /// Counts by state for the operator surface
    pub async fn counts(&self) -> Result<QueueCounts> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM queue_entries GROUP BY state")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = QueueCounts::default();
        for row in rows {
            let state: String = row.try_get("state")?;
            let n: i64 = row.try_get("n")?;
            match state.as_str() {
                "active" => counts.active = n,
                "waiting" => counts.waiting = n,
                "delayed" => counts.delayed = n,
                "completed" => counts.completed = n,
                "failed" => counts.failed = n,
                _ => {}
            }
        }
        Ok(counts)
    }

    /// Administrative purge of everything, in-flight leases included
    pub async fn clear_all(&self) -> Result<u64> {
        let deleted = sqlx::query("DELETE FROM queue_entries")
            .execute(&self.pool)
            .await?
            .rows_affected();
        info!(deleted, "queue cleared by operator");
        Ok(deleted)
    }

    /// Janitor sweep of old terminal entries
    pub async fn prune_finished_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let deleted = sqlx::query(
            "DELETE FROM queue_entries WHERE state IN ('completed', 'failed') AND finished_at < ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(deleted)
    }
}

/// Backoff for the next attempt after `attempt` failed: base * 2^(n-1)
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base * 2u32.saturating_pow(attempt.saturating_sub(1))
}

/// Periodic stall sweep until cancellation
pub fn spawn_stall_sweeper(queue: TieredQueue, cancel: CancellationToken) {
    let interval = queue.config.stall_sweep_interval;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    if let Err(err) = queue.requeue_stalled().await {
                        warn!("stall sweep failed: {err}");
                    }
                }
            }
        }
    });
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| Error::Internal(format!("bad uuid in queue row: {e}")))
}
