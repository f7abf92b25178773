//! Shared application context
//!
//! Every component takes its collaborators from here; there is no ambient
//! state. `AppContext` implements `Clone`, which gives axum handlers
//! access through `State<AppContext>`.

use crate::analyzer::Analyzer;
use crate::blob::BlobStore;
use crate::db::api_keys::ApiKeyStore;
use crate::db::jobs::JobStore;
use crate::db::ledger::Ledger;
use crate::db::otps::OtpStore;
use crate::db::payments::PaymentStore;
use crate::db::users::UserStore;
use crate::janitor::Janitor;
use crate::queue::TieredQueue;
use crate::worker::WorkerContext;
use binsight_common::config::Config;
use binsight_common::events::EventBus;
use sqlx::SqlitePool;
use std::sync::Arc;

/// Shared application context passed to all handlers and workers
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub db: SqlitePool,
    pub users: UserStore,
    pub jobs: JobStore,
    pub ledger: Ledger,
    pub payments: PaymentStore,
    pub api_keys: ApiKeyStore,
    pub otps: OtpStore,
    pub blobs: Arc<dyn BlobStore>,
    pub queue: TieredQueue,
    pub events: EventBus,
    pub janitor: Arc<Janitor>,
}

impl AppContext {
    /// Assemble the full context from its parts
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        db: SqlitePool,
        blobs: Arc<dyn BlobStore>,
        queue: TieredQueue,
        events: EventBus,
        janitor: Arc<Janitor>,
    ) -> Self {
        Self {
            users: UserStore::new(db.clone()),
            jobs: JobStore::new(db.clone()),
            ledger: Ledger::new(db.clone()),
            payments: PaymentStore::new(db.clone()),
            api_keys: ApiKeyStore::new(db.clone()),
            otps: OtpStore::new(db.clone()),
            config,
            db,
            blobs,
            queue,
            events,
            janitor,
        }
    }

    /// View of the context the worker pools need
    pub fn worker_context(&self, analyzer: Arc<dyn Analyzer>) -> WorkerContext {
        WorkerContext {
            jobs: self.jobs.clone(),
            ledger: self.ledger.clone(),
            queue: self.queue.clone(),
            blobs: self.blobs.clone(),
            analyzer,
            events: self.events.clone(),
        }
    }
}
