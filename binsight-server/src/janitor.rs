//! Nightly janitor
//!
//! Two sweeps on a daily schedule (default 02:00 local): blobs past their
//! 24 h retention and terminal jobs past the 7 day horizon. Expired OTP
//! rows and finished queue entries ride along. An atomic `running` flag
//! keeps a slow sweep from overlapping the next trigger, manual or
//! scheduled.

use crate::blob::BlobStore;
use crate::db::jobs::JobStore;
use crate::db::otps::OtpStore;
use crate::queue::TieredQueue;
use binsight_common::config::JanitorConfig;
use binsight_common::Result;
use chrono::{DateTime, Duration as ChronoDuration, Local, Timelike, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// What one sweep removed
#[derive(Debug, Clone, Default, Serialize)]
pub struct JanitorReport {
    pub blobs_deleted: u64,
    pub jobs_deleted: u64,
    pub otps_deleted: u64,
    pub queue_entries_pruned: u64,
}

/// Periodic cleanup of stale blobs and terminal records
pub struct Janitor {
    jobs: JobStore,
    otps: OtpStore,
    queue: TieredQueue,
    blobs: Arc<dyn BlobStore>,
    config: JanitorConfig,
    running: AtomicBool,
}

impl Janitor {
    pub fn new(
        jobs: JobStore,
        otps: OtpStore,
        queue: TieredQueue,
        blobs: Arc<dyn BlobStore>,
        config: JanitorConfig,
    ) -> Self {
        Self {
            jobs,
            otps,
            queue,
            blobs,
            config,
            running: AtomicBool::new(false),
        }
    }

    /// Run both sweeps once. Returns `None` when a sweep is already in
    /// flight (manual trigger racing the schedule).
    pub async fn run_once(&self) -> Result<Option<JanitorReport>> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("janitor already running, skipping overlapping trigger");
            return Ok(None);
        }

        let result = self.sweep().await;
        self.running.store(false, Ordering::SeqCst);
        result.map(Some)
    }

    async fn sweep(&self) -> Result<JanitorReport> {
        let mut report = JanitorReport::default();

        // Blob sweep: anything under binaries/ past retention
        let stale = self
            .blobs
            .list_older_than(self.config.blob_retention, "binaries/")
            .await?;
        for handle in stale {
            match self.blobs.delete(&handle).await {
                Ok(()) => report.blobs_deleted += 1,
                Err(err) => warn!(handle, "blob sweep delete failed: {err}"),
            }
        }

        // Job sweep: terminal rows past the retention horizon
        let job_cutoff = Utc::now()
            - ChronoDuration::from_std(self.config.job_retention).unwrap_or_default();
        report.jobs_deleted = self.jobs.delete_terminal_older_than(job_cutoff).await?;
        report.queue_entries_pruned = self.queue.prune_finished_older_than(job_cutoff).await?;

        report.otps_deleted = self.otps.delete_expired(Utc::now()).await?;

        info!(
            blobs = report.blobs_deleted,
            jobs = report.jobs_deleted,
            otps = report.otps_deleted,
            queue_entries = report.queue_entries_pruned,
            "janitor sweep finished"
        );
        Ok(report)
    }
}

/// Seconds until the next occurrence of `hour`:00 local time
pub fn seconds_until_hour(now: DateTime<Local>, hour: u32) -> u64 {
    let today_run = now
        .with_hour(hour)
        .and_then(|t| t.with_minute(0))
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now);

    let next = if today_run > now {
        today_run
    } else {
        today_run + ChronoDuration::days(1)
    };
    (next - now).num_seconds().max(1) as u64
}

/// Run the janitor on its daily schedule until cancellation
pub fn spawn_schedule(janitor: Arc<Janitor>, hour: u32, cancel: CancellationToken) {
    tokio::spawn(async move {
        loop {
            let wait = seconds_until_hour(Local::now(), hour);
            info!(wait_secs = wait, "janitor sleeping until next scheduled run");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(wait)) => {
                    if let Err(err) = janitor.run_once().await {
                        warn!("scheduled janitor run failed: {err}");
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn schedule_picks_today_when_hour_is_ahead() {
        let now = Local.with_ymd_and_hms(2026, 3, 10, 0, 30, 0).unwrap();
        // 02:00 is 90 minutes away
        assert_eq!(seconds_until_hour(now, 2), 90 * 60);
    }

    #[test]
    fn schedule_rolls_to_tomorrow_when_hour_has_passed() {
        let now = Local.with_ymd_and_hms(2026, 3, 10, 2, 0, 0).unwrap();
        // Exactly at the run instant: schedule the next day
        assert_eq!(seconds_until_hour(now, 2), 24 * 3600);

        let later = Local.with_ymd_and_hms(2026, 3, 10, 23, 0, 0).unwrap();
        assert_eq!(seconds_until_hour(later, 2), 3 * 3600);
    }
}
