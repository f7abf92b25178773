//! External ML analyzer client
//!
//! Streams the artifact as `multipart/form-data` to the configured
//! endpoint and normalizes the response. The analyzer answers in one of
//! two shapes: a modular wrapper under `analysis` or a flat legacy
//! object. Both are accepted; which one was seen is logged so the legacy
//! path can eventually be retired.

use async_trait::async_trait;
use binsight_common::config::AnalyzerConfig;
use binsight_common::model::{
    AnalysisReport, DetectedAlgorithm, FileInfo, FunctionFinding, ProtocolFinding, Severity,
    VulnerabilityAssessment,
};
use binsight_common::{Error, Result};
use serde::Deserialize;
use std::path::Path;
use tracing::{debug, info, warn};

/// Analyzer seam; injected so worker tests can substitute a stub
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, file_path: &Path, filename: &str) -> Result<AnalysisReport>;
}

/// Production client for the analyzer HTTP endpoint
pub struct HttpAnalyzer {
    client: reqwest::Client,
    endpoint: String,
    service_ident: String,
    timeout_secs: u64,
}

impl HttpAnalyzer {
    pub fn new(config: &AnalyzerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Config(format!("analyzer client build failed: {e}")))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            service_ident: config.service_ident.clone(),
            timeout_secs: config.request_timeout.as_secs(),
        })
    }
}

#[async_trait]
impl Analyzer for HttpAnalyzer {
    async fn analyze(&self, file_path: &Path, filename: &str) -> Result<AnalysisReport> {
        let bytes = tokio::fs::read(file_path).await?;

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(filename.to_string())
            .mime_str("application/octet-stream")
            .map_err(|e| Error::Internal(format!("multipart build failed: {e}")))?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .client
            .post(&self.endpoint)
            .header("X-Service", &self.service_ident)
            .multipart(form)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    Error::AnalyzerTimeout {
                        seconds: self.timeout_secs,
                    }
                } else {
                    Error::AnalyzerUnavailable(err.to_string())
                }
            })?;

        let status = response.status();
        if status.is_server_error() {
            // 5xx is transient from our side; the queue may retry it
            return Err(Error::AnalyzerUnavailable(format!(
                "analyzer returned {status}"
            )));
        }
        if !status.is_success() {
            return Err(Error::AnalysisFailed(format!(
                "analyzer rejected request with {status}"
            )));
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::AnalysisFailed(format!("unparseable analyzer response: {e}")))?;

        normalize_response(payload)
    }
}

// ============================================================================
// Response normalization
// ============================================================================

/// Accepted wire shapes, tried in order
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireResponse {
    Modular { analysis: WireAnalysis },
    Flat(WireAnalysis),
}

/// Union of the fields both shapes may carry
#[derive(Debug, Default, Deserialize)]
struct WireAnalysis {
    file_info: Option<WireFileInfo>,
    file_type: Option<String>,
    #[serde(alias = "file_size")]
    size_bytes: Option<i64>,
    sha256: Option<String>,
    md5: Option<String>,
    sha1: Option<String>,
    #[serde(default)]
    algorithms: Vec<WireAlgorithm>,
    #[serde(default)]
    functions: Vec<WireFunction>,
    #[serde(default)]
    protocols: Vec<WireProtocol>,
    vulnerability_assessment: Option<WireAssessment>,
    #[serde(default)]
    vulnerabilities: Vec<WireVuln>,
    #[serde(default)]
    recommendations: Vec<String>,
    #[serde(alias = "vulnerability_score")]
    score: Option<f64>,
    explanation: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireFileInfo {
    #[serde(alias = "type")]
    file_type: Option<String>,
    #[serde(alias = "size", alias = "file_size")]
    size_bytes: Option<i64>,
    sha256: Option<String>,
    md5: Option<String>,
    sha1: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireAlgorithm {
    name: String,
    confidence: Option<f64>,
    #[serde(alias = "category", alias = "algorithm_class")]
    class: Option<String>,
    #[serde(alias = "structure")]
    structural_tag: Option<String>,
    #[serde(default)]
    evidence: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(alias = "addr")]
    address: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    confidence: Option<f64>,
    summary: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireProtocol {
    #[serde(alias = "name")]
    protocol: String,
    confidence: Option<f64>,
    #[serde(default)]
    evidence: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireAssessment {
    has_vulns: Option<bool>,
    severity: Option<String>,
    #[serde(default)]
    vulnerabilities: Vec<WireVuln>,
    #[serde(default)]
    recommendations: Vec<String>,
    score: Option<f64>,
}

/// A vulnerability line is either a bare string or an object carrying its
/// own severity
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireVuln {
    Detailed {
        #[serde(alias = "title", alias = "message")]
        description: String,
        severity: Option<String>,
    },
    Line(String),
}

impl WireVuln {
    fn description(&self) -> &str {
        match self {
            WireVuln::Detailed { description, .. } => description,
            WireVuln::Line(line) => line,
        }
    }

    fn severity(&self) -> Option<Severity> {
        match self {
            WireVuln::Detailed { severity, .. } => severity.as_deref().map(parse_severity),
            WireVuln::Line(_) => None,
        }
    }
}

/// Turn a raw analyzer payload into the canonical report
pub fn normalize_response(payload: serde_json::Value) -> Result<AnalysisReport> {
    if let Some(message) = payload.get("error").and_then(|v| v.as_str()) {
        return Err(Error::AnalysisFailed(message.to_string()));
    }

    let response: WireResponse = serde_json::from_value(payload)
        .map_err(|e| Error::AnalysisFailed(format!("unrecognized analyzer shape: {e}")))?;

    let analysis = match response {
        WireResponse::Modular { analysis } => {
            debug!("analyzer answered in the modular shape");
            analysis
        }
        WireResponse::Flat(analysis) => {
            info!("analyzer answered in the flat legacy shape");
            analysis
        }
    };

    let file_info = match analysis.file_info {
        Some(info) => FileInfo {
            file_type: info.file_type.unwrap_or_else(|| "unknown".to_string()),
            size_bytes: info.size_bytes.unwrap_or(0),
            sha256: info.sha256.unwrap_or_default(),
            md5: info.md5.unwrap_or_default(),
            sha1: info.sha1.unwrap_or_default(),
        },
        None => FileInfo {
            file_type: analysis.file_type.unwrap_or_else(|| "unknown".to_string()),
            size_bytes: analysis.size_bytes.unwrap_or(0),
            sha256: analysis.sha256.unwrap_or_default(),
            md5: analysis.md5.unwrap_or_default(),
            sha1: analysis.sha1.unwrap_or_default(),
        },
    };

    // The assessment may arrive pre-built (modular) or as loose top-level
    // fields (flat); either way the aggregate severity is derived from the
    // per-vuln severities when one was not supplied.
    let (vulns, recommendations, score, given_severity, given_has_vulns) =
        match analysis.vulnerability_assessment {
            Some(assessment) => (
                assessment.vulnerabilities,
                assessment.recommendations,
                assessment.score,
                assessment.severity,
                assessment.has_vulns,
            ),
            None => (
                analysis.vulnerabilities,
                analysis.recommendations,
                analysis.score,
                None,
                None,
            ),
        };

    let severity = match given_severity.as_deref() {
        Some(s) => parse_severity(s),
        None => aggregate_severity(&vulns),
    };
    let vulnerabilities: Vec<String> = vulns
        .iter()
        .map(|v| v.description().to_string())
        .collect();
    let has_vulns = given_has_vulns.unwrap_or(!vulnerabilities.is_empty());

    let report = AnalysisReport {
        file_info,
        algorithms: analysis
            .algorithms
            .into_iter()
            .map(|a| DetectedAlgorithm {
                name: a.name,
                confidence: a.confidence.unwrap_or(0.0),
                class: a.class.unwrap_or_else(|| "unknown".to_string()),
                structural_tag: a.structural_tag,
                evidence: a.evidence,
            })
            .collect(),
        functions: analysis
            .functions
            .into_iter()
            .map(|f| FunctionFinding {
                name: f.name,
                address: f.address.unwrap_or_default(),
                tags: f.tags,
                confidence: f.confidence.unwrap_or(0.0),
                summary: f.summary,
            })
            .collect(),
        protocols: analysis
            .protocols
            .into_iter()
            .map(|p| ProtocolFinding {
                protocol: p.protocol,
                confidence: p.confidence.unwrap_or(0.0),
                evidence: p.evidence,
            })
            .collect(),
        vulnerability_assessment: VulnerabilityAssessment {
            has_vulns,
            severity,
            vulnerabilities,
            recommendations,
            score: score.unwrap_or(0.0),
        },
        explanation: analysis.explanation.unwrap_or_default(),
    };

    Ok(normalize_report(report))
}

/// Clamp and reconcile a report so that normalization is stable:
/// `normalize_report(normalize_report(x)) == normalize_report(x)`
pub fn normalize_report(mut report: AnalysisReport) -> AnalysisReport {
    for algo in &mut report.algorithms {
        algo.confidence = algo.confidence.clamp(0.0, 1.0);
    }
    for func in &mut report.functions {
        func.confidence = func.confidence.clamp(0.0, 1.0);
    }
    for proto in &mut report.protocols {
        proto.confidence = proto.confidence.clamp(0.0, 1.0);
    }

    let assessment = &mut report.vulnerability_assessment;
    assessment.score = assessment.score.clamp(0.0, 10.0);
    assessment.has_vulns = !assessment.vulnerabilities.is_empty();
    if assessment.vulnerabilities.is_empty() {
        assessment.severity = Severity::None;
    } else if assessment.severity == Severity::None {
        // Vulns present but severity never derived: at least Medium
        assessment.severity = Severity::Medium;
    }

    report
}

/// Critical if any vuln is critical, else High if any is high, else
/// Medium if any at all, else None
fn aggregate_severity(vulns: &[WireVuln]) -> Severity {
    if vulns.is_empty() {
        return Severity::None;
    }
    let mut worst = Severity::Medium;
    for vuln in vulns {
        match vuln.severity() {
            Some(Severity::Critical) => return Severity::Critical,
            Some(Severity::High) => worst = worst.max(Severity::High),
            _ => {}
        }
    }
    worst
}

fn parse_severity(s: &str) -> Severity {
    match s.to_ascii_lowercase().as_str() {
        "critical" => Severity::Critical,
        "high" => Severity::High,
        "medium" => Severity::Medium,
        "low" => Severity::Low,
        other => {
            if !other.is_empty() && other != "none" {
                warn!("unknown severity label from analyzer: {other}");
            }
            Severity::None
        }
    }
}
