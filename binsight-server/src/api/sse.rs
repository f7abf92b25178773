//! SSE stream of job events
//!
//! Each event is published on two logical channels, `job:<id>` and
//! `user:<id>`; clients subscribe to either by query parameter, or to the
//! firehose with none.

use crate::state::AppContext;
use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{Stream, StreamExt};
use serde::Deserialize;
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct EventFilter {
    /// Restrict to one job's channel
    pub job: Option<Uuid>,
    /// Restrict to one user's channel
    pub user: Option<Uuid>,
}

/// GET /events - subscribe to job progress updates
pub async fn event_stream(
    State(ctx): State<AppContext>,
    Query(filter): Query<EventFilter>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!(
        clients = ctx.events.subscriber_count() + 1,
        job = ?filter.job,
        user = ?filter.user,
        "sse client connected"
    );

    let rx = ctx.events.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(move |result| {
        let filter_job = filter.job;
        let filter_user = filter.user;
        async move {
            match result {
                Ok(event) => {
                    if let Some(job_id) = filter_job {
                        if event.job_id() != job_id {
                            return None;
                        }
                    }
                    if let Some(user_id) = filter_user {
                        if event.user_id() != user_id {
                            return None;
                        }
                    }
                    Event::default()
                        .event(event.kind())
                        .json_data(&event)
                        .ok()
                        .map(Ok)
                }
                Err(err) => {
                    // A lagged receiver just drops the missed events
                    warn!("sse client lagged: {err}");
                    None
                }
            }
        }
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(30))
            .text("keep-alive"),
    )
}
