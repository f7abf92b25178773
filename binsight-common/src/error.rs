//! Common error types for the binsight backend

use thiserror::Error;

/// Common result type for binsight operations
pub type Result<T> = std::result::Result<T, Error>;

/// Stable machine-readable error codes surfaced to API clients
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InsufficientCredits,
    InvalidHash,
    MissingFile,
    TooManyFiles,
    FileTooLarge,
    JobNotFound,
    InvalidApiKey,
    Forbidden,
    QueueUnavailable,
    InvalidSignature,
    UnknownOrder,
    AnalyzerUnavailable,
    AnalyzerTimeout,
    AnalysisFailed,
    BlobNotFound,
    InvalidState,
    ValidationFailed,
    InternalError,
}

impl ErrorCode {
    /// Wire representation used in the API error envelope
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InsufficientCredits => "INSUFFICIENT_CREDITS",
            ErrorCode::InvalidHash => "INVALID_HASH",
            ErrorCode::MissingFile => "MISSING_FILE",
            ErrorCode::TooManyFiles => "TOO_MANY_FILES",
            ErrorCode::FileTooLarge => "FILE_TOO_LARGE",
            ErrorCode::JobNotFound => "JOB_NOT_FOUND",
            ErrorCode::InvalidApiKey => "INVALID_API_KEY",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::QueueUnavailable => "QUEUE_UNAVAILABLE",
            ErrorCode::InvalidSignature => "INVALID_SIGNATURE",
            ErrorCode::UnknownOrder => "UNKNOWN_ORDER",
            ErrorCode::AnalyzerUnavailable => "ANALYZER_UNAVAILABLE",
            ErrorCode::AnalyzerTimeout => "ANALYZER_TIMEOUT",
            ErrorCode::AnalysisFailed => "ANALYSIS_FAILED",
            ErrorCode::BlobNotFound => "BLOB_NOT_FOUND",
            ErrorCode::InvalidState => "INVALID_STATE",
            ErrorCode::ValidationFailed => "VALIDATION_FAILED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Error types shared across the binsight backend
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed content fingerprint supplied by a client
    #[error("Invalid hash: {0}")]
    InvalidHash(String),

    /// Upload request carried no file part
    #[error("No file provided")]
    MissingFile,

    #[error("Too many files: {actual} exceeds batch limit of {limit}")]
    TooManyFiles { limit: usize, actual: usize },

    #[error("File too large: {size} bytes exceeds limit of {limit} bytes")]
    FileTooLarge { size: u64, limit: u64 },

    /// Admission gate failure; carries the balance snapshot for the client
    #[error("Insufficient credits: {available} available, {required} required")]
    InsufficientCredits {
        available: i64,
        required: i64,
        deficit: i64,
    },

    #[error("Invalid API key: {0}")]
    InvalidApiKey(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Blob not found: {0}")]
    BlobNotFound(String),

    /// Analyzer endpoint unreachable (connection refused, DNS failure, 5xx)
    #[error("Analyzer unavailable: {0}")]
    AnalyzerUnavailable(String),

    #[error("Analyzer timed out after {seconds}s")]
    AnalyzerTimeout { seconds: u64 },

    /// The analyzer returned a logical error payload; terminal for the job
    #[error("Analysis failed: {0}")]
    AnalysisFailed(String),

    #[error("Queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("Webhook signature verification failed")]
    InvalidSignature,

    #[error("Unknown payment order: {0}")]
    UnknownOrder(String),

    /// Invariant violation (e.g. a backwards status transition); never retried
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable code for the API error envelope
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::InsufficientCredits { .. } => ErrorCode::InsufficientCredits,
            Error::InvalidHash(_) => ErrorCode::InvalidHash,
            Error::MissingFile => ErrorCode::MissingFile,
            Error::TooManyFiles { .. } => ErrorCode::TooManyFiles,
            Error::FileTooLarge { .. } => ErrorCode::FileTooLarge,
            Error::JobNotFound(_) => ErrorCode::JobNotFound,
            Error::InvalidApiKey(_) => ErrorCode::InvalidApiKey,
            Error::Forbidden(_) => ErrorCode::Forbidden,
            Error::QueueUnavailable(_) => ErrorCode::QueueUnavailable,
            Error::InvalidSignature => ErrorCode::InvalidSignature,
            Error::UnknownOrder(_) => ErrorCode::UnknownOrder,
            Error::AnalyzerUnavailable(_) => ErrorCode::AnalyzerUnavailable,
            Error::AnalyzerTimeout { .. } => ErrorCode::AnalyzerTimeout,
            Error::AnalysisFailed(_) => ErrorCode::AnalysisFailed,
            Error::BlobNotFound(_) => ErrorCode::BlobNotFound,
            Error::InvalidState(_) => ErrorCode::InvalidState,
            Error::Config(_) => ErrorCode::ValidationFailed,
            _ => ErrorCode::InternalError,
        }
    }

    /// Whether the queue's retry policy may re-attempt a job that failed
    /// with this error. Validation, authorization and invariant errors are
    /// never retried; transient backend errors are retried up to the
    /// attempt cap.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::AnalyzerUnavailable(_)
                | Error::AnalyzerTimeout { .. }
                | Error::QueueUnavailable(_)
                | Error::Database(_)
                | Error::Io(_)
                | Error::BlobNotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        let err = Error::InsufficientCredits {
            available: -55,
            required: 5,
            deficit: 60,
        };
        assert_eq!(err.code().as_str(), "INSUFFICIENT_CREDITS");
        assert_eq!(
            Error::InvalidHash("xyz".into()).code().as_str(),
            "INVALID_HASH"
        );
        assert_eq!(Error::MissingFile.code().as_str(), "MISSING_FILE");
    }

    #[test]
    fn transient_errors_are_retryable() {
        assert!(Error::AnalyzerUnavailable("refused".into()).is_retryable());
        assert!(Error::AnalyzerTimeout { seconds: 300 }.is_retryable());
        assert!(Error::QueueUnavailable("down".into()).is_retryable());
    }

    #[test]
    fn logical_errors_are_not_retryable() {
        assert!(!Error::AnalysisFailed("bad payload".into()).is_retryable());
        assert!(!Error::JobNotFound("j1".into()).is_retryable());
        assert!(!Error::InvalidState("backwards".into()).is_retryable());
    }
}
