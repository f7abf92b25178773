//! Configuration loading for the binsight backend
//!
//! All knobs resolve from `BINSIGHT_`-prefixed environment variables with
//! compiled defaults, so a bare `binsight-server` starts against a local
//! data directory. Command-line flags override host/port/data-dir in main.

use crate::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Service tier queue knobs
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Concurrent jobs for tier1 workers
    pub tier1_concurrency: usize,
    /// Concurrent jobs for tier2 workers
    pub tier2_concurrency: usize,
    /// Per-attempt processing timeout
    pub job_timeout: Duration,
    /// Attempt cap per job (first delivery included)
    pub max_attempts: u32,
    /// Base delay between attempts; doubles per attempt
    pub backoff_base: Duration,
    /// Lease window; an active entry past this is considered stalled
    pub lease: Duration,
    /// How often the stall sweeper runs
    pub stall_sweep_interval: Duration,
    /// Idle poll interval when a tier has no waiting work
    pub poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            tier1_concurrency: 10,
            tier2_concurrency: 5,
            job_timeout: Duration::from_secs(600),
            max_attempts: 3,
            backoff_base: Duration::from_secs(10),
            lease: Duration::from_secs(120),
            stall_sweep_interval: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Blob store knobs
#[derive(Debug, Clone)]
pub struct BlobConfig {
    /// Root directory for stored artifacts
    pub root: PathBuf,
    /// Hard cap on artifact size (default 80 MiB)
    pub max_file_size: u64,
    /// Per-call fetch timeout
    pub fetch_timeout: Duration,
    /// Retries for transient fetch failures
    pub fetch_retries: u32,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./binsight_data/blobs"),
            max_file_size: 80 * 1024 * 1024,
            fetch_timeout: Duration::from_secs(30),
            fetch_retries: 3,
        }
    }
}

/// External ML analyzer endpoint knobs
#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// Analyzer HTTP endpoint
    pub endpoint: String,
    /// Value of the identifying `X-Service` header
    pub service_ident: String,
    /// Total request timeout
    pub request_timeout: Duration,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8500/analyze".to_string(),
            service_ident: "binsight-backend".to_string(),
            request_timeout: Duration::from_secs(300),
        }
    }
}

/// Payment gateway knobs
#[derive(Debug, Clone)]
pub struct PaymentConfig {
    pub key_id: String,
    pub key_secret: String,
    /// Shared secret for webhook HMAC-SHA256 verification
    pub webhook_secret: String,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            key_id: String::new(),
            key_secret: String::new(),
            webhook_secret: String::new(),
        }
    }
}

/// Janitor schedule and retention knobs
#[derive(Debug, Clone)]
pub struct JanitorConfig {
    /// Local hour of day for the daily sweep (default 02:00)
    pub hour: u32,
    /// Blobs older than this are swept
    pub blob_retention: Duration,
    /// Terminal jobs older than this are deleted
    pub job_retention: Duration,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            hour: 2,
            blob_retention: Duration::from_secs(24 * 3600),
            job_retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// A purchasable credit plan; the price list is the contract with the
/// payment gateway and is fixed at compile time.
#[derive(Debug, Clone)]
pub struct Plan {
    pub id: &'static str,
    pub name: &'static str,
    pub credits: i64,
    /// Price in minor units (paise)
    pub amount_paise: i64,
    pub currency: &'static str,
}

/// Built-in price list
pub const PLANS: &[Plan] = &[
    Plan {
        id: "starter",
        name: "Starter Pack",
        credits: 100,
        amount_paise: 99_900,
        currency: "INR",
    },
    Plan {
        id: "standard",
        name: "Standard Pack",
        credits: 500,
        amount_paise: 450_000,
        currency: "INR",
    },
    Plan {
        id: "pro",
        name: "Pro Pack",
        credits: 2000,
        amount_paise: 1_600_000,
        currency: "INR",
    },
];

/// Look up a plan by identifier
pub fn find_plan(id: &str) -> Option<&'static Plan> {
    PLANS.iter().find(|p| p.id == id)
}

/// Top-level backend configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP bind host
    pub host: String,
    /// HTTP bind port
    pub port: u16,
    /// Data directory (SQLite database lives here)
    pub data_dir: PathBuf,
    /// Minimum balance admitted at ingestion
    pub admission_threshold: i64,
    /// Per-batch file cap
    pub max_batch_files: usize,
    /// Suggested polling interval returned to SDK clients
    pub polling_interval_ms: u64,
    /// Shared secret for the operator endpoints; unset means open (local
    /// deployments behind their own auth)
    pub admin_token: Option<String>,
    pub queue: QueueConfig,
    pub blob: BlobConfig,
    pub analyzer: AnalyzerConfig,
    pub payment: PaymentConfig,
    pub janitor: JanitorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5810,
            data_dir: PathBuf::from("./binsight_data"),
            admission_threshold: 5,
            max_batch_files: 50,
            polling_interval_ms: 2000,
            admin_token: None,
            queue: QueueConfig::default(),
            blob: BlobConfig::default(),
            analyzer: AnalyzerConfig::default(),
            payment: PaymentConfig::default(),
            janitor: JanitorConfig::default(),
        }
    }
}

impl Config {
    /// Resolve configuration from the environment, falling back to defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();

        if let Some(host) = env_string("BINSIGHT_HOST") {
            config.host = host;
        }
        if let Some(port) = env_parse::<u16>("BINSIGHT_PORT")? {
            config.port = port;
        }
        if let Some(dir) = env_string("BINSIGHT_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(threshold) = env_parse::<i64>("BINSIGHT_ADMISSION_THRESHOLD")? {
            config.admission_threshold = threshold;
        }
        if let Some(cap) = env_parse::<usize>("BINSIGHT_MAX_BATCH_FILES")? {
            config.max_batch_files = cap;
        }
        config.admin_token = env_string("BINSIGHT_ADMIN_TOKEN");

        if let Some(n) = env_parse::<usize>("BINSIGHT_QUEUE_TIER1_CONCURRENCY")? {
            config.queue.tier1_concurrency = n;
        }
        if let Some(n) = env_parse::<usize>("BINSIGHT_QUEUE_TIER2_CONCURRENCY")? {
            config.queue.tier2_concurrency = n;
        }
        if let Some(secs) = env_parse::<u64>("BINSIGHT_QUEUE_JOB_TIMEOUT_SECS")? {
            config.queue.job_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = env_parse::<u32>("BINSIGHT_QUEUE_MAX_ATTEMPTS")? {
            config.queue.max_attempts = n;
        }
        if let Some(secs) = env_parse::<u64>("BINSIGHT_QUEUE_BACKOFF_BASE_SECS")? {
            config.queue.backoff_base = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("BINSIGHT_QUEUE_LEASE_SECS")? {
            config.queue.lease = Duration::from_secs(secs);
        }

        if let Some(root) = env_string("BINSIGHT_BLOB_ROOT") {
            config.blob.root = PathBuf::from(root);
        }
        if let Some(bytes) = env_parse::<u64>("BINSIGHT_BLOB_MAX_FILE_SIZE")? {
            config.blob.max_file_size = bytes;
        }
        if let Some(secs) = env_parse::<u64>("BINSIGHT_BLOB_FETCH_TIMEOUT_SECS")? {
            config.blob.fetch_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = env_parse::<u32>("BINSIGHT_BLOB_FETCH_RETRIES")? {
            config.blob.fetch_retries = n;
        }

        if let Some(url) = env_string("BINSIGHT_ANALYZER_URL") {
            config.analyzer.endpoint = url;
        }
        if let Some(ident) = env_string("BINSIGHT_ANALYZER_SERVICE_IDENT") {
            config.analyzer.service_ident = ident;
        }
        if let Some(secs) = env_parse::<u64>("BINSIGHT_ANALYZER_TIMEOUT_SECS")? {
            config.analyzer.request_timeout = Duration::from_secs(secs);
        }

        if let Some(key) = env_string("BINSIGHT_PAYMENT_KEY_ID") {
            config.payment.key_id = key;
        }
        if let Some(secret) = env_string("BINSIGHT_PAYMENT_KEY_SECRET") {
            config.payment.key_secret = secret;
        }
        if let Some(secret) = env_string("BINSIGHT_PAYMENT_WEBHOOK_SECRET") {
            config.payment.webhook_secret = secret;
        }

        if let Some(hour) = env_parse::<u32>("BINSIGHT_JANITOR_HOUR")? {
            if hour > 23 {
                return Err(Error::Config(format!(
                    "BINSIGHT_JANITOR_HOUR must be 0-23, got {hour}"
                )));
            }
            config.janitor.hour = hour;
        }
        if let Some(hours) = env_parse::<u64>("BINSIGHT_BLOB_RETENTION_HOURS")? {
            config.janitor.blob_retention = Duration::from_secs(hours * 3600);
        }
        if let Some(days) = env_parse::<u64>("BINSIGHT_JOB_RETENTION_DAYS")? {
            config.janitor.job_retention = Duration::from_secs(days * 24 * 3600);
        }

        Ok(config)
    }

    /// Path of the SQLite database under the data directory
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("binsight.db")
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match env_string(key) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::Config(format!("Invalid value for {key}: {raw}"))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = Config::default();
        assert_eq!(config.queue.tier1_concurrency, 10);
        assert_eq!(config.queue.tier2_concurrency, 5);
        assert_eq!(config.queue.max_attempts, 3);
        assert_eq!(config.queue.job_timeout, Duration::from_secs(600));
        assert_eq!(config.blob.max_file_size, 80 * 1024 * 1024);
        assert_eq!(config.blob.fetch_retries, 3);
        assert_eq!(config.admission_threshold, 5);
        assert_eq!(config.max_batch_files, 50);
        assert_eq!(config.janitor.hour, 2);
    }

    #[test]
    fn plan_lookup() {
        let plan = find_plan("standard").unwrap();
        assert_eq!(plan.credits, 500);
        assert_eq!(plan.amount_paise, 450_000);
        assert!(find_plan("nonexistent").is_none());
    }
}
