//! Record types for the binsight backend
//!
//! All records are closed types with explicit optionality. Enum fields are
//! stored in SQLite as their snake_case text form; the `as_str`/`parse`
//! pairs below are the single source of truth for that mapping.

use crate::pricing::CreditBreakdown;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Jobs
// ============================================================================

/// Service class controlling queue priority and worker-pool concurrency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceTier {
    Tier1,
    Tier2,
}

impl ServiceTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceTier::Tier1 => "tier1",
            ServiceTier::Tier2 => "tier2",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "tier1" => Ok(ServiceTier::Tier1),
            "tier2" => Ok(ServiceTier::Tier2),
            other => Err(Error::Internal(format!("unknown service tier: {other}"))),
        }
    }

    /// Queue priority; lower runs sooner
    pub fn priority(&self) -> i64 {
        match self {
            ServiceTier::Tier1 => 1,
            ServiceTier::Tier2 => 2,
        }
    }
}

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(Error::Internal(format!("unknown job status: {other}"))),
        }
    }

    /// Completed and failed jobs are immutable except for janitor deletion
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Where an upload entered the system; selects the ledger description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobSource {
    Sdk,
    Dashboard,
}

impl JobSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobSource::Sdk => "sdk",
            JobSource::Dashboard => "dashboard",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "sdk" => Ok(JobSource::Sdk),
            "dashboard" => Ok(JobSource::Dashboard),
            other => Err(Error::Internal(format!("unknown job source: {other}"))),
        }
    }

    /// Human description recorded on the debit transaction
    pub fn ledger_description(&self) -> &'static str {
        match self {
            JobSource::Sdk => "SDK Binary Analysis",
            JobSource::Dashboard => "Dashboard Binary Analysis",
        }
    }
}

/// Structured failure record attached to a failed job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    pub message: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// Free-form upload metadata captured at ingestion
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdk_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ci_provider: Option<String>,
}

/// One analysis job and its full lifecycle state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub user_id: Uuid,
    pub api_key_id: Option<Uuid>,
    pub filename: String,
    pub size_bytes: i64,
    /// SHA-256 hex fingerprint of the uploaded content
    pub hash: String,
    /// Opaque blob store handle
    pub blob_id: String,
    pub blob_url: Option<String>,
    pub tier: ServiceTier,
    pub priority: i64,
    pub status: JobStatus,
    /// 0..=100
    pub progress: i64,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub processing_seconds: Option<i64>,
    /// Populated only on `completed`
    pub credits_charged: Option<i64>,
    pub credit_breakdown: Option<CreditBreakdown>,
    pub results: Option<AnalysisReport>,
    pub error: Option<JobError>,
    pub source: JobSource,
    pub meta: UploadMeta,
}

impl Job {
    /// Create a fresh `queued` job for an accepted upload
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: Uuid,
        api_key_id: Option<Uuid>,
        filename: String,
        size_bytes: i64,
        hash: String,
        blob_id: String,
        blob_url: Option<String>,
        tier: ServiceTier,
        source: JobSource,
        meta: UploadMeta,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            api_key_id,
            filename,
            size_bytes,
            hash,
            blob_id,
            blob_url,
            tier,
            priority: tier.priority(),
            status: JobStatus::Queued,
            progress: 0,
            queued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            processing_seconds: None,
            credits_charged: None,
            credit_breakdown: None,
            results: None,
            error: None,
            source,
            meta,
        }
    }
}

// ============================================================================
// Analysis results
// ============================================================================

/// Vulnerability severity ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    None,
    Low,
    Medium,
    High,
    Critical,
}

/// File metadata echoed back by the analyzer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub file_type: String,
    pub size_bytes: i64,
    pub sha256: String,
    pub md5: String,
    pub sha1: String,
}

/// One detected algorithm with its supporting evidence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedAlgorithm {
    pub name: String,
    /// 0.0..=1.0
    pub confidence: f64,
    pub class: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structural_tag: Option<String>,
    #[serde(default)]
    pub evidence: Vec<String>,
}

/// Function-level finding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionFinding {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// Network protocol usage finding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolFinding {
    pub protocol: String,
    pub confidence: f64,
    #[serde(default)]
    pub evidence: Vec<String>,
}

/// Aggregate vulnerability verdict for a binary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VulnerabilityAssessment {
    pub has_vulns: bool,
    pub severity: Severity,
    #[serde(default)]
    pub vulnerabilities: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    /// 0.0..=10.0
    pub score: f64,
}

impl Default for VulnerabilityAssessment {
    fn default() -> Self {
        Self {
            has_vulns: false,
            severity: Severity::None,
            vulnerabilities: Vec::new(),
            recommendations: Vec::new(),
            score: 0.0,
        }
    }
}

/// Canonical normalized analysis artifact attached to a completed job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub file_info: FileInfo,
    #[serde(default)]
    pub algorithms: Vec<DetectedAlgorithm>,
    #[serde(default)]
    pub functions: Vec<FunctionFinding>,
    #[serde(default)]
    pub protocols: Vec<ProtocolFinding>,
    pub vulnerability_assessment: VulnerabilityAssessment,
    #[serde(default)]
    pub explanation: String,
}

// ============================================================================
// Users & credits
// ============================================================================

/// Embedded credit snapshot on a user row
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditBalance {
    /// Lifetime credits granted
    pub total: i64,
    /// Lifetime credits charged
    pub used: i64,
    /// Signed; may go negative under debt tolerance
    pub remaining: i64,
}

/// Owner identity with tier assignment and credit snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    /// None for admin accounts
    pub tier: Option<ServiceTier>,
    pub active: bool,
    pub credits: CreditBalance,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Transactions
// ============================================================================

/// Ledger transaction type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxnKind {
    Credit,
    Debit,
    Bonus,
    Refund,
}

impl TxnKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxnKind::Credit => "credit",
            TxnKind::Debit => "debit",
            TxnKind::Bonus => "bonus",
            TxnKind::Refund => "refund",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "credit" => Ok(TxnKind::Credit),
            "debit" => Ok(TxnKind::Debit),
            "bonus" => Ok(TxnKind::Bonus),
            "refund" => Ok(TxnKind::Refund),
            other => Err(Error::Internal(format!("unknown transaction kind: {other}"))),
        }
    }

    /// Sign applied to the amount when replaying the log against `remaining`
    pub fn sign(&self) -> i64 {
        match self {
            TxnKind::Debit => -1,
            _ => 1,
        }
    }
}

/// Append-only ledger entry; amounts are positive magnitudes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: TxnKind,
    pub amount: i64,
    pub description: String,
    pub job_id: Option<Uuid>,
    pub api_key_id: Option<Uuid>,
    pub payment_id: Option<String>,
    pub balance_before: i64,
    pub balance_after: i64,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Payments
// ============================================================================

/// Payment lifecycle; transitions are monotone except `success → refunded`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Created,
    Pending,
    Success,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Created => "created",
            PaymentStatus::Pending => "pending",
            PaymentStatus::Success => "success",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(PaymentStatus::Created),
            "pending" => Ok(PaymentStatus::Pending),
            "success" => Ok(PaymentStatus::Success),
            "failed" => Ok(PaymentStatus::Failed),
            "refunded" => Ok(PaymentStatus::Refunded),
            other => Err(Error::Internal(format!("unknown payment status: {other}"))),
        }
    }

    /// Whether a transition from `self` to `next` is allowed
    pub fn can_transition(&self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;
        match (self, next) {
            (Created, Pending) | (Created, Success) | (Created, Failed) => true,
            (Pending, Success) | (Pending, Failed) => true,
            (Success, Refunded) => true,
            _ => false,
        }
    }
}

/// One gateway order and its reconciliation state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    /// Unique gateway order id; the idempotency key for webhook replays
    pub order_id: String,
    pub payment_id: Option<String>,
    pub signature: Option<String>,
    pub plan_id: String,
    pub plan_name: String,
    pub credits: i64,
    pub amount_paise: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub method: Option<String>,
    pub card_last4: Option<String>,
    pub card_network: Option<String>,
    /// Set once the credit transaction has been appended
    pub credits_added: bool,
    pub refund_id: Option<String>,
    pub refund_amount: Option<i64>,
    pub failure_reason: Option<String>,
    pub user_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// API keys
// ============================================================================

/// Capability grants carried by an API key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    Analyze,
    Batch,
    Results,
    Credits,
    CheckHash,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Analyze => "analyze",
            Capability::Batch => "batch",
            Capability::Results => "results",
            Capability::Credits => "credits",
            Capability::CheckHash => "check-hash",
        }
    }

    /// Every capability; the default grant for a freshly issued key
    pub fn all() -> Vec<Capability> {
        vec![
            Capability::Analyze,
            Capability::Batch,
            Capability::Results,
            Capability::Credits,
            Capability::CheckHash,
        ]
    }
}

/// Programmatic access token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: Uuid,
    /// Fixed prefix + random suffix; unique per active key
    pub token: String,
    pub user_id: Uuid,
    pub name: String,
    pub active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub request_count: i64,
    pub capabilities: Vec<Capability>,
    pub created_at: DateTime<Utc>,
}

impl ApiKey {
    pub fn has_capability(&self, cap: Capability) -> bool {
        self.capabilities.contains(&cap)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

// ============================================================================
// OTPs
// ============================================================================

/// One-time password row; expired rows are garbage-collected by the janitor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Otp {
    pub id: Uuid,
    pub user_id: Uuid,
    pub code: String,
    pub purpose: String,
    pub used: bool,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Otp {
    /// A code exactly at its expiry instant is already expired
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn tier_priority_ordering() {
        assert!(ServiceTier::Tier1.priority() < ServiceTier::Tier2.priority());
        assert_eq!(ServiceTier::parse("tier1").unwrap(), ServiceTier::Tier1);
        assert!(ServiceTier::parse("tier3").is_err());
    }

    #[test]
    fn payment_transitions_are_monotone() {
        use PaymentStatus::*;
        assert!(Created.can_transition(Success));
        assert!(Pending.can_transition(Failed));
        assert!(Success.can_transition(Refunded));
        assert!(!Success.can_transition(Pending));
        assert!(!Failed.can_transition(Success));
        assert!(!Refunded.can_transition(Success));
    }

    #[test]
    fn txn_sign_treats_debit_negative() {
        assert_eq!(TxnKind::Debit.sign(), -1);
        assert_eq!(TxnKind::Credit.sign(), 1);
        assert_eq!(TxnKind::Refund.sign(), 1);
        assert_eq!(TxnKind::Bonus.sign(), 1);
    }

    #[test]
    fn otp_expiry_boundary() {
        let now = Utc::now();
        let otp = Otp {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            code: "123456".to_string(),
            purpose: "login".to_string(),
            used: false,
            expires_at: now,
            created_at: now - Duration::minutes(2),
        };
        // Exactly at the expiry instant counts as expired
        assert!(otp.is_expired(now));
        assert!(!otp.is_expired(now - Duration::seconds(1)));
    }

    #[test]
    fn severity_orders_for_aggregation() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::None);
    }

    #[test]
    fn fresh_job_starts_queued() {
        let job = Job::new(
            Uuid::new_v4(),
            None,
            "sample.bin".to_string(),
            1024,
            "a".repeat(64),
            "blob-1".to_string(),
            None,
            ServiceTier::Tier2,
            JobSource::Sdk,
            UploadMeta::default(),
        );
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.progress, 0);
        assert_eq!(job.priority, 2);
        assert!(job.credits_charged.is_none());
        assert!(job.completed_at.is_none());
    }
}
