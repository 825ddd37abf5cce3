//! Validation run configuration.
//!
//! The caller parses and schema-validates its own config format; this
//! module defines the already-typed configuration the orchestrator
//! consumes, with spec defaults on every knob and a final `validate()`
//! pass for cross-field constraints.

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};
use crate::fuzzy::FuzzyAlgorithm;
use crate::types::{FieldMapping, FieldType};

/// Complete configuration for one validation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// URL template with `{column}` tokens interpolated per row
    pub url_template: String,
    /// Field mappings, in declaration order
    pub field_mappings: Vec<FieldMapping>,
    #[serde(default)]
    pub rules: Rules,
    #[serde(default)]
    pub performance: PerformanceConfig,
    #[serde(default)]
    pub evidence: EvidenceConfig,
}

impl ValidationConfig {
    pub fn new(url_template: impl Into<String>, field_mappings: Vec<FieldMapping>) -> Self {
        Self {
            url_template: url_template.into(),
            field_mappings,
            rules: Rules::default(),
            performance: PerformanceConfig::default(),
            evidence: EvidenceConfig::default(),
        }
    }

    /// Cross-field validation; returns `Error::Config` on the first
    /// violation.
    pub fn validate(&self) -> Result<()> {
        if self.url_template.trim().is_empty() {
            return Err(Error::config("url_template must not be empty"));
        }
        if self.field_mappings.is_empty() {
            return Err(Error::config("at least one field mapping is required"));
        }
        for mapping in &self.field_mappings {
            if mapping.csv_field.trim().is_empty() {
                return Err(Error::config("field mapping with empty csv_field"));
            }
            if mapping.web_selector.trim().is_empty() {
                return Err(Error::config(format!(
                    "field mapping '{}' has an empty selector",
                    mapping.csv_field
                )));
            }
        }

        let c = &self.rules.confidence;
        for (name, value) in [
            ("minimum_overall", c.minimum_overall),
            ("minimum_field", c.minimum_field),
            ("ocr_threshold", c.ocr_threshold),
            ("fuzzy_match_threshold", c.fuzzy_match_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::config(format!(
                    "rules.confidence.{name} must be within [0, 1], got {value}"
                )));
            }
        }

        if self.rules.fuzzy.enabled && self.rules.fuzzy.algorithms.is_empty() {
            return Err(Error::config(
                "rules.fuzzy.enabled requires at least one algorithm",
            ));
        }
        if self.rules.fuzzy.number_tolerance < 0.0 {
            return Err(Error::config("rules.fuzzy.number_tolerance must be >= 0"));
        }

        let eh = &self.rules.error_handling;
        if !(0.0..=1.0).contains(&eh.escalation_threshold) {
            return Err(Error::config(
                "rules.error_handling.escalation_threshold must be within [0, 1]",
            ));
        }

        if self.performance.parallel_workers == 0 {
            return Err(Error::config("performance.parallel_workers must be >= 1"));
        }
        let t = &self.performance.timeouts;
        for (name, value) in [
            ("navigation", t.navigation_ms),
            ("dom_extraction", t.dom_extraction_ms),
            ("ocr_processing", t.ocr_processing_ms),
            ("validation_decision", t.validation_decision_ms),
            ("evidence_collection", t.evidence_collection_ms),
        ] {
            if value == 0 {
                return Err(Error::config(format!(
                    "performance.timeouts.{name} must be > 0"
                )));
            }
        }

        Ok(())
    }
}

/// Decision and comparison rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Rules {
    #[serde(default)]
    pub confidence: ConfidenceRules,
    #[serde(default)]
    pub fuzzy: FuzzyRules,
    #[serde(default)]
    pub normalization: NormalizationPolicy,
    #[serde(default)]
    pub error_handling: ErrorHandlingRules,
}

/// How per-field confidences combine into the row confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceAggregation {
    /// The weakest required field bounds the row (default)
    Minimum,
    /// Mean over required fields
    WeightedAverage,
}

/// Confidence thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceRules {
    /// Row-level acceptance threshold
    #[serde(default = "default_minimum_overall")]
    pub minimum_overall: f64,
    /// Field-level threshold below which hybrid fields escalate to the LLM
    #[serde(default = "default_minimum_field")]
    pub minimum_field: f64,
    /// Extraction confidence below which OCR fallback triggers
    #[serde(default = "default_ocr_threshold")]
    pub ocr_threshold: f64,
    /// Fuzzy string score at or above which two values match
    #[serde(default = "default_fuzzy_threshold")]
    pub fuzzy_match_threshold: f64,
    #[serde(default = "default_aggregation")]
    pub aggregation: ConfidenceAggregation,
}

fn default_minimum_overall() -> f64 {
    0.7
}
fn default_minimum_field() -> f64 {
    0.7
}
fn default_ocr_threshold() -> f64 {
    0.5
}
fn default_fuzzy_threshold() -> f64 {
    0.8
}
fn default_aggregation() -> ConfidenceAggregation {
    ConfidenceAggregation::Minimum
}

impl Default for ConfidenceRules {
    fn default() -> Self {
        Self {
            minimum_overall: default_minimum_overall(),
            minimum_field: default_minimum_field(),
            ocr_threshold: default_ocr_threshold(),
            fuzzy_match_threshold: default_fuzzy_threshold(),
            aggregation: default_aggregation(),
        }
    }
}

/// Fuzzy comparison settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuzzyRules {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Applied in declared order; the maximum score wins
    #[serde(default = "default_algorithms")]
    pub algorithms: Vec<FuzzyAlgorithm>,
    #[serde(default = "default_fuzzy_threshold")]
    pub string_similarity_threshold: f64,
    /// Numeric fields match when |a - b| <= tolerance
    #[serde(default = "default_number_tolerance")]
    pub number_tolerance: f64,
    #[serde(default = "default_true")]
    pub case_insensitive: bool,
    #[serde(default = "default_true")]
    pub ignore_whitespace: bool,
}

fn default_true() -> bool {
    true
}
fn default_algorithms() -> Vec<FuzzyAlgorithm> {
    vec![FuzzyAlgorithm::Levenshtein, FuzzyAlgorithm::JaroWinkler]
}
fn default_number_tolerance() -> f64 {
    0.001
}

impl Default for FuzzyRules {
    fn default() -> Self {
        Self {
            enabled: true,
            algorithms: default_algorithms(),
            string_similarity_threshold: default_fuzzy_threshold(),
            number_tolerance: default_number_tolerance(),
            case_insensitive: true,
            ignore_whitespace: true,
        }
    }
}

/// Case canonicalization applied per field type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CasePolicy {
    Lowercase,
    Uppercase,
    TitleCase,
    Preserve,
}

impl CasePolicy {
    /// Spec defaults: email lowercases, names title-case, text preserves.
    pub fn default_for(field_type: FieldType) -> Self {
        match field_type {
            FieldType::Email => Self::Lowercase,
            FieldType::Name => Self::TitleCase,
            _ => Self::Preserve,
        }
    }
}

/// Whitespace handling, applied in field order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhitespacePolicy {
    #[serde(default = "default_true")]
    pub trim_leading: bool,
    #[serde(default = "default_true")]
    pub trim_trailing: bool,
    #[serde(default = "default_true")]
    pub collapse_internal: bool,
}

impl Default for WhitespacePolicy {
    fn default() -> Self {
        Self {
            trim_leading: true,
            trim_trailing: true,
            collapse_internal: true,
        }
    }
}

/// Special character handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecialCharsPolicy {
    /// Unicode decomposition then combining-mark removal
    #[serde(default)]
    pub strip_accents: bool,
    /// Curly quotes to straight quotes
    #[serde(default = "default_true")]
    pub unify_quotes: bool,
    /// En/em dashes to hyphen-minus
    #[serde(default = "default_true")]
    pub unify_dashes: bool,
}

impl Default for SpecialCharsPolicy {
    fn default() -> Self {
        Self {
            strip_accents: false,
            unify_quotes: true,
            unify_dashes: true,
        }
    }
}

/// Numeric parsing policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NumberPolicy {
    #[serde(default = "default_decimal_separator")]
    pub decimal_separator: char,
    #[serde(default = "default_thousand_separator")]
    pub thousand_separator: char,
    #[serde(default = "default_true")]
    pub strip_currency_symbols: bool,
}

fn default_decimal_separator() -> char {
    '.'
}
fn default_thousand_separator() -> char {
    ','
}

impl Default for NumberPolicy {
    fn default() -> Self {
        Self {
            decimal_separator: default_decimal_separator(),
            thousand_separator: default_thousand_separator(),
            strip_currency_symbols: true,
        }
    }
}

/// Date parsing policy; input formats are tried in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatePolicy {
    #[serde(default = "default_date_format")]
    pub target_format: String,
    #[serde(default = "default_accepted_formats")]
    pub accepted_input_formats: Vec<String>,
}

fn default_date_format() -> String {
    "%Y-%m-%d".to_string()
}

fn default_accepted_formats() -> Vec<String> {
    vec![
        "%Y-%m-%d".to_string(),
        "%d/%m/%Y".to_string(),
        "%m/%d/%Y".to_string(),
        "%d.%m.%Y".to_string(),
        "%B %d, %Y".to_string(),
        "%d %B %Y".to_string(),
    ]
}

impl Default for DatePolicy {
    fn default() -> Self {
        Self {
            target_format: default_date_format(),
            accepted_input_formats: default_accepted_formats(),
        }
    }
}

/// Full normalization policy (spec rules.normalization).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NormalizationPolicy {
    #[serde(default)]
    pub whitespace: WhitespacePolicy,
    /// Per-type case override; `None` falls back to `CasePolicy::default_for`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_override: Option<CasePolicy>,
    #[serde(default)]
    pub special_chars: SpecialCharsPolicy,
    #[serde(default)]
    pub numbers: NumberPolicy,
    #[serde(default)]
    pub dates: DatePolicy,
}

impl NormalizationPolicy {
    /// Effective case policy for a field type.
    pub fn case_for(&self, field_type: FieldType) -> CasePolicy {
        self.case_override
            .unwrap_or_else(|| CasePolicy::default_for(field_type))
    }
}

/// Retry and escalation policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorHandlingRules {
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_true")]
    pub exponential_backoff: bool,
    /// Kinds that immediately fail the row regardless of defaults
    #[serde(default)]
    pub critical_errors: Vec<ErrorKind>,
    /// Kinds eligible for retry
    #[serde(default = "default_recoverable_errors")]
    pub recoverable_errors: Vec<ErrorKind>,
    /// Rolling failure-rate ceiling before the run halts
    #[serde(default = "default_escalation_threshold")]
    pub escalation_threshold: f64,
}

fn default_max_retry_attempts() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    2000
}
fn default_recoverable_errors() -> Vec<ErrorKind> {
    vec![
        ErrorKind::ElementNotFound,
        ErrorKind::OcrLowConfidence,
        ErrorKind::NavigationTimeout,
        ErrorKind::TransientTransport,
    ]
}
fn default_escalation_threshold() -> f64 {
    0.2
}

impl Default for ErrorHandlingRules {
    fn default() -> Self {
        Self {
            max_retry_attempts: default_max_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            exponential_backoff: true,
            critical_errors: Vec::new(),
            recoverable_errors: default_recoverable_errors(),
            escalation_threshold: default_escalation_threshold(),
        }
    }
}

impl ErrorHandlingRules {
    /// Whether a stage error of `kind` is retryable under these rules.
    ///
    /// `navigation_timeout` is retryable on its first occurrence only; the
    /// caller tracks occurrence count.
    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        if self.critical_errors.contains(&kind) {
            return false;
        }
        self.recoverable_errors.contains(&kind)
    }
}

/// Caching toggles with TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachingConfig {
    #[serde(default)]
    pub dom_snapshots: bool,
    #[serde(default)]
    pub ocr_results: bool,
    #[serde(default = "default_true")]
    pub validation_decisions: bool,
    /// Entry time-to-live in seconds
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_cache_ttl_secs() -> u64 {
    3600
}

impl Default for CachingConfig {
    fn default() -> Self {
        Self {
            dom_snapshots: false,
            ocr_results: false,
            validation_decisions: true,
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

/// Per-stage timeouts in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTimeouts {
    #[serde(default = "default_navigation_ms")]
    pub navigation_ms: u64,
    #[serde(default = "default_dom_extraction_ms")]
    pub dom_extraction_ms: u64,
    #[serde(default = "default_ocr_processing_ms")]
    pub ocr_processing_ms: u64,
    #[serde(default = "default_validation_decision_ms")]
    pub validation_decision_ms: u64,
    #[serde(default = "default_evidence_collection_ms")]
    pub evidence_collection_ms: u64,
}

fn default_navigation_ms() -> u64 {
    30_000
}
fn default_dom_extraction_ms() -> u64 {
    15_000
}
fn default_ocr_processing_ms() -> u64 {
    45_000
}
fn default_validation_decision_ms() -> u64 {
    30_000
}
fn default_evidence_collection_ms() -> u64 {
    10_000
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            navigation_ms: default_navigation_ms(),
            dom_extraction_ms: default_dom_extraction_ms(),
            ocr_processing_ms: default_ocr_processing_ms(),
            validation_decision_ms: default_validation_decision_ms(),
            evidence_collection_ms: default_evidence_collection_ms(),
        }
    }
}

/// Throughput and caching knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_parallel_workers")]
    pub parallel_workers: usize,
    /// Optional ceiling on page loads per minute against the target
    /// origin; `None` disables rate limiting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_per_minute: Option<u32>,
    #[serde(default)]
    pub caching: CachingConfig,
    #[serde(default)]
    pub timeouts: StageTimeouts,
}

fn default_batch_size() -> usize {
    50
}
fn default_parallel_workers() -> usize {
    3
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            parallel_workers: default_parallel_workers(),
            rate_limit_per_minute: None,
            caching: CachingConfig::default(),
            timeouts: StageTimeouts::default(),
        }
    }
}

/// Evidence persistence knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceConfig {
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_true")]
    pub screenshot_enabled: bool,
    #[serde(default = "default_true")]
    pub dom_snapshot_enabled: bool,
    #[serde(default)]
    pub compression_enabled: bool,
    /// Bundles older than this many days are flagged for compression
    #[serde(default = "default_compression_after_days")]
    pub compression_after_days: u32,
    #[serde(default = "default_true")]
    pub include_in_reports: bool,
}

fn default_retention_days() -> u32 {
    30
}
fn default_compression_after_days() -> u32 {
    7
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            screenshot_enabled: true,
            dom_snapshot_enabled: true,
            compression_enabled: false,
            compression_after_days: default_compression_after_days(),
            include_in_reports: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Strategy;

    fn minimal_config() -> ValidationConfig {
        ValidationConfig::new(
            "https://example.com/books/{id}",
            vec![FieldMapping::new("name", "h1", FieldType::Name, Strategy::Dom).required()],
        )
    }

    #[test]
    fn test_defaults_match_spec() {
        let config = minimal_config();
        assert_eq!(config.performance.parallel_workers, 3);
        assert_eq!(config.performance.timeouts.navigation_ms, 30_000);
        assert_eq!(config.performance.timeouts.ocr_processing_ms, 45_000);
        assert_eq!(config.rules.error_handling.max_retry_attempts, 3);
        assert_eq!(config.rules.error_handling.retry_delay_ms, 2000);
        assert!((config.rules.error_handling.escalation_threshold - 0.2).abs() < f64::EPSILON);
        assert_eq!(config.evidence.retention_days, 30);
        assert_eq!(config.evidence.compression_after_days, 7);
        assert_eq!(
            config.rules.confidence.aggregation,
            ConfidenceAggregation::Minimum
        );
    }

    #[test]
    fn test_validate_accepts_defaults() {
        assert!(minimal_config().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_template() {
        let mut config = minimal_config();
        config.url_template = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_out_of_range_threshold() {
        let mut config = minimal_config();
        config.rules.confidence.minimum_overall = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config = minimal_config();
        config.performance.parallel_workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_case_policy_defaults() {
        assert_eq!(CasePolicy::default_for(FieldType::Email), CasePolicy::Lowercase);
        assert_eq!(CasePolicy::default_for(FieldType::Name), CasePolicy::TitleCase);
        assert_eq!(CasePolicy::default_for(FieldType::Text), CasePolicy::Preserve);
    }

    #[test]
    fn test_retryable_respects_critical_override() {
        let mut rules = ErrorHandlingRules::default();
        assert!(rules.is_retryable(ErrorKind::ElementNotFound));

        rules.critical_errors.push(ErrorKind::ElementNotFound);
        assert!(!rules.is_retryable(ErrorKind::ElementNotFound));
    }

    #[test]
    fn test_config_deserializes_with_partial_keys() {
        let json = r#"{
            "url_template": "https://example.com/{id}",
            "field_mappings": [
                {"csv_field": "name", "web_selector": "h1", "field_type": "name", "strategy": "dom"}
            ],
            "performance": {"parallel_workers": 8}
        }"#;
        let config: ValidationConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.performance.parallel_workers, 8);
        assert_eq!(config.performance.batch_size, 50);
        assert!(config.rules.fuzzy.enabled);
    }
}
