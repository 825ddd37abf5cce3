//! Per-row state machine.
//!
//! `New -> Navigating -> Extracting -> Deciding -> PersistingEvidence
//! -> Done`, with any stage able to divert to `Failed`. Every stage
//! runs under its configured timeout; a timed-out stage records its
//! error and the row proceeds with partial data, except navigation,
//! which fails the row. Failed and cancelled rows still get a
//! best-effort evidence write before their result is emitted.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::browser::BrowserDriver;
use crate::config::{ConfidenceAggregation, Rules, ValidationConfig};
use crate::decision::DecisionEngine;
use crate::error::{ErrorKind, StageError};
use crate::evidence::{EvidenceCollector, RowEvidence};
use crate::extract::{FieldExtraction, PageExtractor};
use crate::navigate::{LoadedPage, Navigator};
use crate::types::{
    ExtractedField, FieldDecision, FieldMapping, Method, PageObservation, Row, RowResult,
};

/// States of the per-row machine. Terminal states are `Done` and
/// `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowState {
    New,
    Navigating,
    Extracting,
    Deciding,
    PersistingEvidence,
    Done,
    Failed,
}

impl std::fmt::Display for RowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Navigating => "navigating",
            Self::Extracting => "extracting",
            Self::Deciding => "deciding",
            Self::PersistingEvidence => "persisting_evidence",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// TTL cache of serialized DOM snapshots keyed by final URL, for runs
/// where many rows land on the same page.
pub struct DomSnapshotCache {
    entries: RwLock<HashMap<String, (String, DateTime<Utc>)>>,
    ttl: chrono::Duration,
}

impl DomSnapshotCache {
    pub fn with_ttl_secs(ttl_secs: u64) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl: chrono::Duration::seconds(ttl_secs as i64),
        }
    }

    pub async fn get(&self, url: &str) -> Option<String> {
        let entries = self.entries.read().await;
        entries
            .get(url)
            .filter(|(_, created)| Utc::now() - *created <= self.ttl)
            .map(|(snapshot, _)| snapshot.clone())
    }

    pub async fn insert(&self, url: String, snapshot: String) {
        let mut entries = self.entries.write().await;
        entries.insert(url, (snapshot, Utc::now()));
    }
}

/// Runs one row through navigation, extraction, decisioning, and
/// evidence capture. The scheduler owns the row; the pipeline borrows
/// it and returns the result by value.
pub struct RowPipeline {
    config: Arc<ValidationConfig>,
    navigator: Navigator,
    extractor: PageExtractor,
    engine: Arc<DecisionEngine>,
    collector: Arc<EvidenceCollector>,
    browser: Arc<dyn BrowserDriver>,
    dom_cache: Option<Arc<DomSnapshotCache>>,
}

impl RowPipeline {
    pub fn new(
        config: Arc<ValidationConfig>,
        navigator: Navigator,
        extractor: PageExtractor,
        engine: Arc<DecisionEngine>,
        collector: Arc<EvidenceCollector>,
        browser: Arc<dyn BrowserDriver>,
    ) -> Self {
        Self {
            config,
            navigator,
            extractor,
            engine,
            collector,
            browser,
            dom_cache: None,
        }
    }

    /// Cache DOM snapshots by final URL.
    pub fn with_dom_cache(mut self, cache: Arc<DomSnapshotCache>) -> Self {
        self.dom_cache = Some(cache);
        self
    }

    /// Serialize the DOM, through the cache when one is configured.
    async fn snapshot_dom(&self, loaded: &LoadedPage) -> Option<String> {
        let url = &loaded.response.final_url;
        if let Some(cache) = &self.dom_cache {
            if let Some(snapshot) = cache.get(url).await {
                debug!(%url, "DOM snapshot cache hit");
                return Some(snapshot);
            }
        }
        let snapshot = self.browser.dom_snapshot().await.ok()?;
        if let Some(cache) = &self.dom_cache {
            cache.insert(url.clone(), snapshot.clone()).await;
        }
        Some(snapshot)
    }

    /// Process one row to a final `RowResult`. Never returns an error;
    /// failures are encoded in the result.
    #[instrument(skip(self, row, cancel), fields(row = %row.id))]
    pub async fn process_row(&self, row: &Row, cancel: &CancellationToken) -> RowResult {
        let started = Instant::now();
        let evidence_id = Uuid::new_v4().to_string();
        let timeouts = &self.config.performance.timeouts;
        let mut state = RowState::New;
        let mut errors: Vec<StageError> = Vec::new();

        // NAVIGATING
        state = transition(&row.id, state, RowState::Navigating);
        let nav_timeout = Duration::from_millis(timeouts.navigation_ms);
        let loaded = match tokio::time::timeout(
            nav_timeout,
            self.navigator.load(&self.config.url_template, row, cancel),
        )
        .await
        {
            Ok(Ok(loaded)) => loaded,
            Ok(Err(err)) => {
                errors.push(err);
                return self
                    .fail_row(row, evidence_id, None, Vec::new(), Vec::new(), errors, started)
                    .await;
            }
            Err(_) => {
                errors.push(
                    StageError::new(
                        ErrorKind::NavigationTimeout,
                        format!("navigation stage exceeded {}ms", timeouts.navigation_ms),
                    )
                    .with_recoverable(true),
                );
                return self
                    .fail_row(row, evidence_id, None, Vec::new(), Vec::new(), errors, started)
                    .await;
            }
        };

        if cancel.is_cancelled() {
            errors.push(StageError::new(ErrorKind::Cancelled, "row cancelled"));
            return self
                .fail_row(row, evidence_id, Some(&loaded), Vec::new(), Vec::new(), errors, started)
                .await;
        }

        // EXTRACTING, in mapping declaration order.
        state = transition(&row.id, state, RowState::Extracting);
        let mut extractions: Vec<FieldExtraction> = Vec::new();
        for mapping in &self.config.field_mappings {
            let extraction = self
                .extract_with_timeout(mapping, cancel, &mut errors)
                .await;
            if extraction.extracted.confidence == 0.0 {
                errors.push(StageError::new(
                    ErrorKind::ElementNotFound,
                    format!("no element for '{}'", mapping.csv_field),
                ));
            } else if extraction.extracted.method == Method::Ocr
                && extraction.extracted.confidence < self.config.rules.confidence.ocr_threshold
            {
                errors.push(StageError::new(
                    ErrorKind::OcrLowConfidence,
                    format!("weak OCR read for '{}'", mapping.csv_field),
                ));
            }
            extractions.push(extraction);
            if cancel.is_cancelled() {
                errors.push(StageError::new(ErrorKind::Cancelled, "row cancelled"));
                return self
                    .fail_row(row, evidence_id, Some(&loaded), extractions, Vec::new(), errors, started)
                    .await;
            }
        }

        // DECIDING, same order.
        state = transition(&row.id, state, RowState::Deciding);
        let decision_timeout = Duration::from_millis(timeouts.validation_decision_ms);
        let mut decisions: Vec<FieldDecision> = Vec::new();
        for (mapping, extraction) in self.config.field_mappings.iter().zip(&extractions) {
            let csv_cell = row
                .get_ci(&mapping.csv_field)
                .cloned()
                .unwrap_or(crate::types::CellValue::Absent);
            let decision = match tokio::time::timeout(
                decision_timeout,
                self.engine
                    .decide(mapping, &csv_cell, &extraction.extracted, cancel),
            )
            .await
            {
                Ok(decision) => decision,
                Err(_) => {
                    errors.push(StageError::new(
                        ErrorKind::TransientTransport,
                        format!(
                            "decision for '{}' exceeded {}ms",
                            mapping.csv_field, timeouts.validation_decision_ms
                        ),
                    ));
                    timed_out_decision(mapping, &extraction.extracted)
                }
            };
            decisions.push(decision);
        }

        if cancel.is_cancelled() {
            errors.push(StageError::new(ErrorKind::Cancelled, "row cancelled"));
            return self
                .fail_row(row, evidence_id, Some(&loaded), extractions, decisions, errors, started)
                .await;
        }

        // PERSISTING_EVIDENCE
        state = transition(&row.id, state, RowState::PersistingEvidence);
        let dom_snapshot = self.snapshot_dom(&loaded).await;
        let evidence = build_evidence(&loaded, &extractions, &decisions, &errors, dom_snapshot.clone());
        let evidence_timeout = Duration::from_millis(timeouts.evidence_collection_ms);
        let persisted = match tokio::time::timeout(
            evidence_timeout,
            self.collector.persist_row(&evidence_id, &row.id, &evidence),
        )
        .await
        {
            Ok(Ok(_index)) => true,
            Ok(Err(err)) => {
                errors.push(err);
                false
            }
            Err(_) => {
                errors.push(StageError::new(
                    ErrorKind::EvidenceWriteFailed,
                    format!("evidence stage exceeded {}ms", timeouts.evidence_collection_ms),
                ));
                false
            }
        };

        if !persisted {
            return self.finish_failed(row, evidence_id, Some(&loaded), extractions, decisions, errors, started);
        }

        // DONE
        let state = transition(&row.id, state, RowState::Done);
        debug!(row = %row.id, %state, "row finished");

        let (overall_match, overall_confidence) =
            aggregate_decisions(&decisions, &self.config.field_mappings, &self.config.rules);

        RowResult {
            row_id: row.id.clone(),
            row_index: row.index,
            row: row.clone(),
            observation: Some(build_observation(&loaded, &extractions, dom_snapshot)),
            field_decisions: decisions,
            overall_match,
            overall_confidence,
            processing_time_ms: started.elapsed().as_millis() as u64,
            errors,
            evidence_id,
        }
    }

    async fn extract_with_timeout(
        &self,
        mapping: &FieldMapping,
        cancel: &CancellationToken,
        errors: &mut Vec<StageError>,
    ) -> FieldExtraction {
        let timeouts = &self.config.performance.timeouts;
        let mut budget_ms = timeouts.dom_extraction_ms;
        if mapping.strategy.ocr_enabled() {
            budget_ms += timeouts.ocr_processing_ms;
        }

        match tokio::time::timeout(
            Duration::from_millis(budget_ms),
            self.extractor.extract_field(mapping, cancel),
        )
        .await
        {
            Ok(Ok(extraction)) => extraction,
            Ok(Err(err)) => {
                errors.push(err);
                missing_extraction(mapping)
            }
            Err(_) => {
                errors.push(StageError::new(
                    ErrorKind::TransientTransport,
                    format!("extraction of '{}' exceeded {budget_ms}ms", mapping.csv_field),
                ));
                missing_extraction(mapping)
            }
        }
    }

    /// Failed path: best-effort evidence write, then a mismatch result.
    async fn fail_row(
        &self,
        row: &Row,
        evidence_id: String,
        loaded: Option<&LoadedPage>,
        extractions: Vec<FieldExtraction>,
        decisions: Vec<FieldDecision>,
        mut errors: Vec<StageError>,
        started: Instant,
    ) -> RowResult {
        let dom_snapshot = match loaded {
            Some(loaded) => self.snapshot_dom(loaded).await,
            None => None,
        };
        let evidence = match loaded {
            Some(loaded) => build_evidence(loaded, &extractions, &decisions, &errors, dom_snapshot),
            None => RowEvidence {
                decisions: decisions.clone(),
                errors: errors.clone(),
                ..RowEvidence::default()
            },
        };

        let evidence_timeout =
            Duration::from_millis(self.config.performance.timeouts.evidence_collection_ms);
        if let Ok(Err(err)) = tokio::time::timeout(
            evidence_timeout,
            self.collector.persist_row(&evidence_id, &row.id, &evidence),
        )
        .await
        {
            errors.push(err);
        }

        self.finish_failed(row, evidence_id, loaded, extractions, decisions, errors, started)
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_failed(
        &self,
        row: &Row,
        evidence_id: String,
        loaded: Option<&LoadedPage>,
        extractions: Vec<FieldExtraction>,
        decisions: Vec<FieldDecision>,
        errors: Vec<StageError>,
        started: Instant,
    ) -> RowResult {
        debug!(row = %row.id, state = %RowState::Failed, "row failed");
        RowResult {
            row_id: row.id.clone(),
            row_index: row.index,
            row: row.clone(),
            observation: loaded
                .map(|loaded| build_observation(loaded, &extractions, None)),
            field_decisions: decisions,
            overall_match: false,
            overall_confidence: 0.0,
            processing_time_ms: started.elapsed().as_millis() as u64,
            errors,
            evidence_id,
        }
    }
}

fn transition(row_id: &crate::types::RowId, from: RowState, to: RowState) -> RowState {
    debug!(row = %row_id, %from, %to, "row state transition");
    to
}

/// Placeholder extraction for a field whose stage errored out.
fn missing_extraction(mapping: &FieldMapping) -> FieldExtraction {
    let empty = ExtractedField {
        csv_field: mapping.csv_field.clone(),
        raw_value: None,
        normalized_value: None,
        method: Method::Dom,
        confidence: 0.0,
        element_box: None,
    };
    FieldExtraction {
        extracted: empty.clone(),
        dom_attempt: empty,
        ocr_attempt: None,
        element_screenshot: None,
    }
}

/// Mismatch decision recorded when the decision stage timed out.
fn timed_out_decision(mapping: &FieldMapping, extracted: &ExtractedField) -> FieldDecision {
    FieldDecision {
        csv_field: mapping.csv_field.clone(),
        csv_value: None,
        web_value: extracted.raw_value.clone(),
        normalized_csv: None,
        normalized_web: extracted.normalized_value.clone(),
        matched: false,
        confidence: 0.0,
        reasoning: "decision stage timed out".to_string(),
        method: extracted.method,
        fuzzy_score: None,
        issues: vec!["decision_timeout".to_string()],
        llm_raw_response: None,
    }
}

fn build_evidence(
    loaded: &LoadedPage,
    extractions: &[FieldExtraction],
    decisions: &[FieldDecision],
    errors: &[StageError],
    dom_snapshot: Option<String>,
) -> RowEvidence {
    let mut extracted = Vec::new();
    let mut field_screenshots = Vec::new();
    for extraction in extractions {
        extracted.push(extraction.dom_attempt.clone());
        if let Some(ocr) = &extraction.ocr_attempt {
            extracted.push(ocr.clone());
        }
        if let Some(shot) = &extraction.element_screenshot {
            field_screenshots.push((extraction.extracted.csv_field.clone(), shot.clone()));
        }
    }

    RowEvidence {
        full_screenshot: loaded.full_screenshot.clone(),
        field_screenshots,
        dom_snapshot,
        extracted,
        decisions: decisions.to_vec(),
        errors: errors.to_vec(),
    }
}

fn build_observation(
    loaded: &LoadedPage,
    extractions: &[FieldExtraction],
    dom_snapshot: Option<String>,
) -> PageObservation {
    let mut screenshots = Vec::new();
    if let Some(shot) = &loaded.full_screenshot {
        screenshots.push(shot.clone());
    }
    for extraction in extractions {
        if let Some(shot) = &extraction.element_screenshot {
            screenshots.push(shot.clone());
        }
    }

    PageObservation {
        url: loaded.url.clone(),
        final_url: loaded.response.final_url.clone(),
        title: loaded.response.title.clone(),
        load_time_ms: loaded.response.load_time_ms,
        status_code: loaded.response.status_code,
        redirects: loaded.response.redirects.clone(),
        viewport: crate::types::Viewport::default(),
        captured_at: Utc::now(),
        extracted_fields: extractions.iter().map(|e| e.extracted.clone()).collect(),
        screenshots,
        dom_snapshot: dom_snapshot.unwrap_or_default(),
    }
}

/// Derive the row verdict from its field decisions alone.
///
/// The aggregation set is the required fields when any exist, otherwise
/// every field. `overall_match` requires every field in the set to
/// match and the aggregate confidence to clear the configured floor.
pub fn aggregate_decisions(
    decisions: &[FieldDecision],
    mappings: &[FieldMapping],
    rules: &Rules,
) -> (bool, f64) {
    let required: Vec<&str> = mappings
        .iter()
        .filter(|m| m.required)
        .map(|m| m.csv_field.as_str())
        .collect();

    let in_set = |decision: &&FieldDecision| {
        required.is_empty() || required.contains(&decision.csv_field.as_str())
    };

    let set: Vec<&FieldDecision> = decisions.iter().filter(in_set).collect();
    if set.is_empty() {
        return (false, 0.0);
    }

    let all_matched = set.iter().all(|d| d.matched);
    let confidence = match rules.confidence.aggregation {
        ConfidenceAggregation::Minimum => set
            .iter()
            .map(|d| d.confidence)
            .fold(f64::INFINITY, f64::min),
        ConfidenceAggregation::WeightedAverage => {
            set.iter().map(|d| d.confidence).sum::<f64>() / set.len() as f64
        }
    };

    let overall_match = all_matched && confidence >= rules.confidence.minimum_overall;
    (overall_match, confidence)
}
