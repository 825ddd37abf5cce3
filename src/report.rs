//! Run report assembly.
//!
//! Summary and statistics are derived from the row results alone, so
//! regenerating them from a persisted report yields the same values.
//! Rendering to HTML/Markdown/CSV is a caller concern; this module
//! only produces the serializable structure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::config::ValidationConfig;
use crate::scheduler::{RunOutput, RunStatus};
use crate::types::RowResult;

/// Aggregate counters for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Rows scanned from the input
    pub total_rows: usize,
    /// Rows with a final result; less than `total_rows` only when the
    /// run was cancelled or escalated
    pub processed: usize,
    /// Processed rows without a fatal error
    pub succeeded: usize,
    /// Processed rows with a fatal error
    pub failed: usize,
    /// Mean overall confidence across processed rows
    pub avg_confidence: f64,
    /// failed / processed
    pub error_rate: f64,
    pub throughput_rows_per_sec: f64,
}

/// Per-field accuracy entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldAccuracy {
    pub matched: usize,
    pub total: usize,
    pub accuracy: f64,
}

/// Distribution statistics over the run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStatistics {
    /// Overall-confidence histogram in 0.1-wide buckets
    pub confidence_histogram: BTreeMap<String, usize>,
    /// Field decisions per winning method
    pub method_usage: BTreeMap<String, usize>,
    /// Match rate per mapped field
    pub field_accuracy: BTreeMap<String, FieldAccuracy>,
    /// Row errors per kind
    pub errors_by_kind: BTreeMap<String, usize>,
}

/// The full serializable run report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub summary: RunSummary,
    pub results: Vec<RowResult>,
    pub statistics: RunStatistics,
    pub config: ValidationConfig,
    pub metadata: BTreeMap<String, String>,
}

impl RunReport {
    /// Assemble the report from a finished run.
    pub fn build(output: RunOutput, config: &ValidationConfig) -> Self {
        let summary = summarize(&output);
        let statistics = statistics(&output.results);

        let mut metadata = BTreeMap::new();
        metadata.insert(
            "crate_version".to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        );
        metadata.insert(
            "exit_code".to_string(),
            output.status.exit_code().to_string(),
        );

        Self {
            run_id: Uuid::new_v4().to_string(),
            status: output.status,
            started_at: output.started_at,
            finished_at: output.finished_at,
            summary,
            results: output.results,
            statistics,
            config: config.clone(),
            metadata,
        }
    }
}

fn summarize(output: &RunOutput) -> RunSummary {
    let processed = output.results.len();
    let failed = output
        .results
        .iter()
        .filter(|r| row_failed(r))
        .count();
    let succeeded = processed - failed;

    let avg_confidence = if processed == 0 {
        0.0
    } else {
        output
            .results
            .iter()
            .map(|r| r.overall_confidence)
            .sum::<f64>()
            / processed as f64
    };

    let elapsed_secs = (output.finished_at - output.started_at)
        .num_milliseconds()
        .max(1) as f64
        / 1000.0;

    RunSummary {
        total_rows: output.total_rows,
        processed,
        succeeded,
        failed,
        avg_confidence,
        error_rate: if processed == 0 {
            0.0
        } else {
            failed as f64 / processed as f64
        },
        throughput_rows_per_sec: processed as f64 / elapsed_secs,
    }
}

fn row_failed(result: &RowResult) -> bool {
    result.errors.iter().any(|e| !e.recoverable)
}

fn statistics(results: &[RowResult]) -> RunStatistics {
    let mut stats = RunStatistics::default();

    for result in results {
        let bucket = confidence_bucket(result.overall_confidence);
        *stats.confidence_histogram.entry(bucket).or_insert(0) += 1;

        for decision in &result.field_decisions {
            *stats
                .method_usage
                .entry(decision.method.to_string())
                .or_insert(0) += 1;

            let entry = stats
                .field_accuracy
                .entry(decision.csv_field.clone())
                .or_insert(FieldAccuracy {
                    matched: 0,
                    total: 0,
                    accuracy: 0.0,
                });
            entry.total += 1;
            if decision.matched {
                entry.matched += 1;
            }
        }

        for error in &result.errors {
            *stats
                .errors_by_kind
                .entry(error.kind.as_str().to_string())
                .or_insert(0) += 1;
        }
    }

    for entry in stats.field_accuracy.values_mut() {
        entry.accuracy = if entry.total == 0 {
            0.0
        } else {
            entry.matched as f64 / entry.total as f64
        };
    }

    stats
}

/// Bucket label for a confidence value: `"0.0-0.1"` through
/// `"0.9-1.0"`.
fn confidence_bucket(confidence: f64) -> String {
    let index = ((confidence * 10.0).floor() as usize).min(9);
    format!("0.{index}-{}", if index == 9 { "1.0".to_string() } else { format!("0.{}", index + 1) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, StageError};
    use crate::types::{FieldDecision, FieldMapping, FieldType, Method, Row, RowId, Strategy};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap as Map;

    fn config() -> ValidationConfig {
        ValidationConfig::new(
            "https://example.com/{id}",
            vec![FieldMapping::new("name", "h1", FieldType::Name, Strategy::Dom).required()],
        )
    }

    fn result(index: usize, matched: bool, confidence: f64, errors: Vec<StageError>) -> RowResult {
        RowResult {
            row_id: RowId::from_index(index),
            row_index: index,
            row: Row::new(index, Map::new()),
            observation: None,
            field_decisions: vec![FieldDecision {
                csv_field: "name".to_string(),
                csv_value: None,
                web_value: None,
                normalized_csv: None,
                normalized_web: None,
                matched,
                confidence,
                reasoning: String::new(),
                method: Method::Dom,
                fuzzy_score: None,
                issues: vec![],
                llm_raw_response: None,
            }],
            overall_match: matched,
            overall_confidence: confidence,
            processing_time_ms: 100,
            errors,
            evidence_id: format!("ev-{index}"),
        }
    }

    fn output(results: Vec<RowResult>, total: usize, status: RunStatus) -> RunOutput {
        let started_at = Utc::now() - chrono::Duration::seconds(10);
        RunOutput {
            results,
            status,
            total_rows: total,
            started_at,
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn test_empty_run_report() {
        let report = RunReport::build(output(Vec::new(), 0, RunStatus::Completed), &config());
        assert_eq!(report.summary.total_rows, 0);
        assert_eq!(report.summary.processed, 0);
        assert!(report.results.is_empty());
        assert_eq!(report.summary.avg_confidence, 0.0);
        assert_eq!(report.summary.error_rate, 0.0);
    }

    #[test]
    fn test_summary_counts_and_invariants() {
        let results = vec![
            result(0, true, 0.95, vec![]),
            result(1, false, 0.3, vec![]),
            result(
                2,
                false,
                0.0,
                vec![StageError::new(ErrorKind::PageNotFound, "404")],
            ),
        ];
        let report = RunReport::build(output(results, 3, RunStatus::Completed), &config());

        // processed equals the number of row results.
        assert_eq!(report.summary.processed, report.results.len());
        assert_eq!(report.summary.total_rows, 3);
        // A clean mismatch is a success; only the 404 row failed.
        assert_eq!(report.summary.succeeded, 2);
        assert_eq!(report.summary.failed, 1);
        assert!((report.summary.error_rate - 1.0 / 3.0).abs() < 1e-9);
        assert!(report.summary.throughput_rows_per_sec > 0.0);
    }

    #[test]
    fn test_processed_below_total_when_escalated() {
        let results = vec![result(0, true, 0.9, vec![])];
        let report = RunReport::build(
            output(results, 101, RunStatus::Escalated { rate: 0.21 }),
            &config(),
        );
        assert!(report.summary.processed < report.summary.total_rows);
        assert_eq!(report.metadata.get("exit_code").map(String::as_str), Some("2"));
    }

    #[test]
    fn test_statistics_aggregation() {
        let results = vec![
            result(0, true, 0.95, vec![]),
            result(1, true, 0.92, vec![]),
            result(
                2,
                false,
                0.3,
                vec![StageError::new(ErrorKind::ElementNotFound, "missing h1")],
            ),
        ];
        let report = RunReport::build(output(results, 3, RunStatus::Completed), &config());

        assert_eq!(report.statistics.confidence_histogram.get("0.9-1.0"), Some(&2));
        assert_eq!(report.statistics.confidence_histogram.get("0.3-0.4"), Some(&1));
        assert_eq!(report.statistics.method_usage.get("dom"), Some(&3));
        assert_eq!(
            report.statistics.errors_by_kind.get("element_not_found"),
            Some(&1)
        );

        let accuracy = report.statistics.field_accuracy.get("name").unwrap();
        assert_eq!(accuracy.total, 3);
        assert_eq!(accuracy.matched, 2);
        assert!((accuracy.accuracy - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_confidence_bucket_edges() {
        assert_eq!(confidence_bucket(0.0), "0.0-0.1");
        assert_eq!(confidence_bucket(0.35), "0.3-0.4");
        assert_eq!(confidence_bucket(0.95), "0.9-1.0");
        assert_eq!(confidence_bucket(1.0), "0.9-1.0");
    }

    #[test]
    fn test_report_serializes() {
        let report = RunReport::build(
            output(vec![result(0, true, 0.9, vec![])], 1, RunStatus::Completed),
            &config(),
        );
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"status\":\"completed\""));
        assert!(json.contains("confidence_histogram"));
    }
}
