//! Test harness for integration tests
//!
//! Builds the full application context over an in-memory database and a
//! temp-dir blob store, with a scripted analyzer standing in for the
//! external ML service.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use binsight_common::config::Config;
use binsight_common::events::EventBus;
use binsight_common::model::{
    AnalysisReport, ApiKey, Capability, FileInfo, ServiceTier, VulnerabilityAssessment,
};
use binsight_common::model::TxnKind;
use binsight_common::{Error, Result};
use binsight_server::analyzer::Analyzer;
use binsight_server::api::build_router;
use binsight_server::blob::FsBlobStore;
use binsight_server::db::jobs::JobStore;
use binsight_server::db::otps::OtpStore;
use binsight_server::janitor::Janitor;
use binsight_server::queue::{QueueLease, TieredQueue};
use binsight_server::state::AppContext;
use binsight_server::worker::{self, WorkerContext};
use serde_json::Value;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Mutex;
use uuid::Uuid;

pub const WEBHOOK_SECRET: &str = "whsec_test";

/// One scripted analyzer response
pub enum Scripted {
    Succeed(AnalysisReport),
    Unavailable(String),
    Fail(String),
}

/// Analyzer stub that plays back scripted outcomes and counts calls
pub struct ScriptedAnalyzer {
    script: Mutex<VecDeque<Scripted>>,
    pub calls: AtomicUsize,
}

impl ScriptedAnalyzer {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub async fn push(&self, outcome: Scripted) {
        self.script.lock().await.push_back(outcome);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Analyzer for ScriptedAnalyzer {
    async fn analyze(&self, _file_path: &Path, _filename: &str) -> Result<AnalysisReport> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().await.pop_front() {
            Some(Scripted::Succeed(report)) => Ok(report),
            Some(Scripted::Unavailable(message)) => Err(Error::AnalyzerUnavailable(message)),
            Some(Scripted::Fail(message)) => Err(Error::AnalysisFailed(message)),
            None => Ok(sample_report()),
        }
    }
}

/// A clean benign report for scripted successes
pub fn sample_report() -> AnalysisReport {
    AnalysisReport {
        file_info: FileInfo {
            file_type: "ELF64".to_string(),
            size_bytes: 0,
            sha256: "0".repeat(64),
            md5: "0".repeat(32),
            sha1: "0".repeat(40),
        },
        algorithms: Vec::new(),
        functions: Vec::new(),
        protocols: Vec::new(),
        vulnerability_assessment: VulnerabilityAssessment::default(),
        explanation: "no findings".to_string(),
    }
}

/// Full in-process application for tests
pub struct TestApp {
    pub ctx: AppContext,
    pub analyzer: Arc<ScriptedAnalyzer>,
    pub worker: WorkerContext,
    _blob_dir: TempDir,
}

impl TestApp {
    pub async fn spawn() -> Self {
        let blob_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.blob.root = blob_dir.path().to_path_buf();
        config.blob.max_file_size = 100 * 1024 * 1024;
        // Immediate redelivery keeps retry tests fast
        config.queue.backoff_base = Duration::from_secs(0);
        config.payment.webhook_secret = WEBHOOK_SECRET.to_string();
        let config = Arc::new(config);

        let db = binsight_common::db::connect_memory().await.unwrap();
        let blobs = Arc::new(FsBlobStore::new(&config.blob).unwrap());
        let queue = TieredQueue::new(db.clone(), config.queue.clone());
        let janitor = Arc::new(Janitor::new(
            JobStore::new(db.clone()),
            OtpStore::new(db.clone()),
            queue.clone(),
            blobs.clone(),
            config.janitor.clone(),
        ));

        let ctx = AppContext::new(
            config,
            db,
            blobs,
            queue,
            EventBus::default(),
            janitor,
        );

        let analyzer = Arc::new(ScriptedAnalyzer::new());
        let worker = ctx.worker_context(analyzer.clone());

        Self {
            ctx,
            analyzer,
            worker,
            _blob_dir: blob_dir,
        }
    }

    pub fn router(&self) -> Router {
        build_router(self.ctx.clone())
    }

    /// Create an active user with a granted balance
    pub async fn seed_user(&self, credits: i64, tier: ServiceTier) -> Uuid {
        let user_id = Uuid::new_v4();
        self.ctx.users.ensure(user_id, Some(tier)).await.unwrap();
        if credits > 0 {
            self.ctx
                .ledger
                .add_credits(user_id, credits, "Test grant", TxnKind::Credit)
                .await
                .unwrap();
        }
        user_id
    }

    pub async fn seed_api_key(&self, user_id: Uuid) -> ApiKey {
        self.ctx
            .api_keys
            .issue(user_id, "test key", Capability::all(), None)
            .await
            .unwrap()
    }

    /// Claim and process the next entry for a tier; returns whether an
    /// entry was found
    pub async fn run_next_job(&self, tier: ServiceTier) -> Option<QueueLease> {
        let lease = self.worker.queue.claim(tier).await.unwrap()?;
        let _ = worker::process_lease(&self.worker, lease.clone()).await;
        Some(lease)
    }

    /// Drain the tier until no ready work remains
    pub async fn run_until_idle(&self, tier: ServiceTier) -> usize {
        let mut attempts = 0;
        while self.run_next_job(tier).await.is_some() {
            attempts += 1;
            assert!(attempts < 50, "queue did not drain");
        }
        attempts
    }
}

// ============================================================================
// HTTP helpers
// ============================================================================

pub const BOUNDARY: &str = "binsight-test-boundary";

/// Encode a single-file multipart body
pub fn multipart_body(field: &str, filename: &str, bytes: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(bytes);
    body.extend_from_slice(b"\r\n");
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

/// Encode several files into one multipart body
pub fn multipart_batch(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut body = Vec::new();
    for (filename, bytes) in files {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"files\"; filename=\"{filename}\"\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

pub fn multipart_request(uri: &str, token: &str, body: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("x-api-key", token)
        .header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

pub fn get_request(uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .header("x-api-key", token)
        .body(Body::empty())
        .unwrap()
}

pub async fn json_body(response: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("should read body");
    serde_json::from_slice(&bytes).expect("should parse JSON")
}
