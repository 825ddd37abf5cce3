//! # crosscheck-core
//!
//! Core orchestrator for reconciling tabular records against live web
//! pages. For each input row it navigates to a row-parameterized page,
//! extracts the mapped fields (DOM first, OCR fallback), decides field
//! by field whether the observed values correspond to the declared
//! record, and persists a reviewable evidence bundle plus a structured
//! run report.
//!
//! ## Core Components
//!
//! - **Scheduler**: bounded worker pool with retries, escalation, and
//!   cancellation
//! - **RowPipeline**: per-row state machine (navigate, extract, decide,
//!   persist)
//! - **DecisionEngine**: normalize, exact, fuzzy, optional LLM
//!   adjudication
//! - **EvidenceCollector**: checksummed per-row evidence bundles
//!
//! ## Example
//!
//! ```rust,ignore
//! use crosscheck_core::{Scheduler, ValidationConfig, RunReport};
//!
//! let scheduler = Scheduler::new(config, pipeline, registry, collector);
//! let output = scheduler.run(rows, cancel_token).await;
//! let report = RunReport::build(output, &config);
//! println!("{} of {} rows matched", report.summary.succeeded, report.summary.total_rows);
//! ```

pub mod browser;
pub mod config;
pub mod decision;
pub mod error;
pub mod evidence;
pub mod extract;
pub mod fuzzy;
pub mod llm;
pub mod navigate;
pub mod normalize;
pub mod ocr;
pub mod pipeline;
pub mod progress;
pub mod registry;
pub mod report;
pub mod runner;
pub mod scheduler;
pub mod types;

#[cfg(test)]
mod proptests;

// Re-exports for convenience
pub use browser::{BrowserDriver, ElementHandle, ElementKind, ElementValue, NavigationResponse};
pub use config::{
    CachingConfig, CasePolicy, ConfidenceAggregation, ConfidenceRules, DatePolicy,
    ErrorHandlingRules, EvidenceConfig, FuzzyRules, NormalizationPolicy, NumberPolicy,
    PerformanceConfig, Rules, SpecialCharsPolicy, StageTimeouts, ValidationConfig,
    WhitespacePolicy,
};
pub use decision::{CacheStats, DecisionCache, DecisionCacheKey, DecisionEngine, ISSUE_CACHE_HIT};
pub use error::{Error, ErrorKind, Result, StageError, StageResult};
pub use evidence::{
    EvidenceCollector, EvidenceFileEntry, EvidenceFileKind, RowEvidence, RowEvidenceIndex,
    RunIndexEntry, SweepReport,
};
pub use extract::{derive_fallback_selectors, FieldExtraction, PageExtractor};
pub use fuzzy::{FuzzyAlgorithm, FuzzyComparator, FuzzyOutcome};
pub use llm::{
    parse_adjudication, AdjudicationOutcome, AdjudicationRequest, Adjudicator, AdjudicatorConfig,
    AdjudicatorStats, HttpLlmJudge, HttpLlmJudgeConfig, LlmJudge, ParseLayer, ParsedAdjudication,
};
pub use navigate::{interpolate_url, LoadedPage, Navigator};
pub use normalize::{normalize, normalize_cell, NormalizeFailure, Normalized};
pub use ocr::{OcrCache, OcrEngine, OcrOptions, OcrPreprocessing, OcrRecognition, OcrWord};
pub use pipeline::{aggregate_decisions, DomSnapshotCache, RowPipeline, RowState};
pub use progress::{EventCallback, ProgressCallback, ProgressUpdate, RunEvent, RunEventType};
pub use registry::{CleanupReport, Resource, ResourceId, ResourceRegistry};
pub use report::{FieldAccuracy, RunReport, RunStatistics, RunSummary};
pub use runner::{exit_code, Capabilities, ValidationRunner};
pub use scheduler::{RunOutput, RunStatus, Scheduler};
pub use types::{
    CellValue, ExtractedField, FieldDecision, FieldMapping, FieldType, Method, PageObservation,
    Region, Row, RowId, RowResult, Screenshot, ScreenshotKind, Strategy, Viewport,
};
