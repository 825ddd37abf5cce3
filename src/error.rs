//! Error types for crosscheck-core.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using crosscheck-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during a validation run.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration failed validation before the run started
    #[error("Configuration error: {0}")]
    Config(String),

    /// The output directory could not be created or written to
    #[error("Output directory not writable: {path}: {message}")]
    OutputDir { path: String, message: String },

    /// The rolling failure rate exceeded the escalation threshold
    #[error("Run escalated: rolling failure rate {rate:.2} exceeded threshold {threshold:.2}")]
    Escalated { rate: f64, threshold: f64 },

    /// The run was cancelled externally
    #[error("Run cancelled")]
    Cancelled,

    /// Browser capability error
    #[error("Browser error: {0}")]
    Browser(String),

    /// OCR capability error
    #[error("OCR error: {0}")]
    Ocr(String),

    /// LLM adjudicator transport error
    #[error("LLM error: {0}")]
    Llm(String),

    /// Timeout during operation
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Evidence persistence error
    #[error("Evidence error: {0}")]
    Evidence(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Create an escalation error.
    pub fn escalated(rate: f64, threshold: f64) -> Self {
        Self::Escalated { rate, threshold }
    }
}

/// Machine-readable error kinds, used for retry matching and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    // Run-level fatal
    ConfigInvalid,
    Escalation,
    OutputDirUnwritable,
    // Row-level fatal
    NavigationTimeout,
    PageNotFound,
    HttpStatus,
    EvidenceWriteFailed,
    // Recoverable
    ElementNotFound,
    OcrLowConfidence,
    TransientTransport,
    LlmUnavailable,
    Cancelled,
    // Informational
    NormalizationNull,
    CacheHit,
}

impl ErrorKind {
    /// Whether this kind is recoverable by default (the configured
    /// recoverable/critical lists can override per run).
    pub fn default_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ElementNotFound
                | Self::OcrLowConfidence
                | Self::TransientTransport
                | Self::LlmUnavailable
                | Self::NormalizationNull
                | Self::CacheHit
        )
    }

    /// Stable snake_case name, matching the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigInvalid => "config_invalid",
            Self::Escalation => "escalation",
            Self::OutputDirUnwritable => "output_dir_unwritable",
            Self::NavigationTimeout => "navigation_timeout",
            Self::PageNotFound => "page_not_found",
            Self::HttpStatus => "http_status",
            Self::EvidenceWriteFailed => "evidence_write_failed",
            Self::ElementNotFound => "element_not_found",
            Self::OcrLowConfidence => "ocr_low_confidence",
            Self::TransientTransport => "transient_transport",
            Self::LlmUnavailable => "llm_unavailable",
            Self::Cancelled => "cancelled",
            Self::NormalizationNull => "normalization_null",
            Self::CacheHit => "cache_hit",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error value carried across stage boundaries.
///
/// Every pipeline stage returns either a value or a `StageError`; the
/// scheduler's retry logic pattern-matches on `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageError {
    /// Machine-readable kind
    pub kind: ErrorKind,
    /// Human-readable message
    pub message: String,
    /// Whether the row may continue or retry after this error
    pub recoverable: bool,
    /// Optional underlying cause, stringified for the report
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl StageError {
    /// Create a stage error with the kind's default recoverability.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            recoverable: kind.default_recoverable(),
            cause: None,
        }
    }

    /// Override the recoverable flag.
    pub fn with_recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = recoverable;
        self
    }

    /// Attach a stringified cause.
    pub fn with_cause(mut self, cause: impl std::fmt::Display) -> Self {
        self.cause = Some(cause.to_string());
        self
    }
}

impl std::fmt::Display for StageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Result alias for stage boundaries.
pub type StageResult<T> = std::result::Result<T, StageError>;
