//! Job progress events and the broadcast event bus
//!
//! Every update is published on two logical channels, `job:<jobId>` and
//! `user:<userId>`; subscribers filter on whichever they care about.
//! Delivery is best-effort: a publish with no listeners (or a lagging
//! listener) never affects job outcome.

use crate::model::{AnalysisReport, JobError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Per-job notification published by the worker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    /// Worker picked the job up
    JobProcessing {
        job_id: Uuid,
        user_id: Uuid,
        progress: i64,
        timestamp: DateTime<Utc>,
    },

    /// Progress ladder update during an attempt
    JobProgress {
        job_id: Uuid,
        user_id: Uuid,
        progress: i64,
        stage: String,
        timestamp: DateTime<Utc>,
    },

    /// Terminal success with the normalized results and the charge
    JobCompleted {
        job_id: Uuid,
        user_id: Uuid,
        results: Box<AnalysisReport>,
        credits_charged: i64,
        timestamp: DateTime<Utc>,
    },

    /// Terminal failure with the structured error record
    JobFailed {
        job_id: Uuid,
        user_id: Uuid,
        error: JobError,
        timestamp: DateTime<Utc>,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> Uuid {
        match self {
            JobEvent::JobProcessing { job_id, .. }
            | JobEvent::JobProgress { job_id, .. }
            | JobEvent::JobCompleted { job_id, .. }
            | JobEvent::JobFailed { job_id, .. } => *job_id,
        }
    }

    pub fn user_id(&self) -> Uuid {
        match self {
            JobEvent::JobProcessing { user_id, .. }
            | JobEvent::JobProgress { user_id, .. }
            | JobEvent::JobCompleted { user_id, .. }
            | JobEvent::JobFailed { user_id, .. } => *user_id,
        }
    }

    /// Wire name used as the SSE event field
    pub fn kind(&self) -> &'static str {
        match self {
            JobEvent::JobProcessing { .. } => "job:processing",
            JobEvent::JobProgress { .. } => "job:progress",
            JobEvent::JobCompleted { .. } => "job:completed",
            JobEvent::JobFailed { .. } => "job:failed",
        }
    }
}

/// Broadcast event bus shared by the worker pools and the SSE endpoint
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<JobEvent>,
}

impl EventBus {
    /// Create a new bus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event, ignoring the no-subscriber case
    pub fn publish(&self, event: JobEvent) {
        if let Err(err) = self.tx.send(event) {
            tracing::trace!("event dropped, no subscribers: {}", err.0.kind());
        }
    }

    /// Subscribe to the raw event stream
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }

    /// Current number of subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress_event(job_id: Uuid, user_id: Uuid, progress: i64) -> JobEvent {
        JobEvent::JobProgress {
            job_id,
            user_id,
            progress,
            stage: "analyzing".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        let job_id = Uuid::new_v4();
        bus.publish(progress_event(job_id, Uuid::new_v4(), 40));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.job_id(), job_id);
        assert_eq!(event.kind(), "job:progress");
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = EventBus::new(16);
        // Must not panic or error
        bus.publish(progress_event(Uuid::new_v4(), Uuid::new_v4(), 10));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn event_serializes_with_snake_case_tag() {
        let event = progress_event(Uuid::new_v4(), Uuid::new_v4(), 75);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "job_progress");
        assert_eq!(json["progress"], 75);
    }
}
