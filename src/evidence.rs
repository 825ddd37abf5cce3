//! Evidence persistence.
//!
//! Each row gets a directory under `{output_dir}/evidence/` keyed by
//! its evidence id, holding screenshots, the DOM snapshot, the raw
//! extraction payload, the decision log, and a checksummed per-row
//! index. A run-level index aggregates all rows and is rewritten under
//! a mutex on every append. Evidence is committed before the row is
//! reported complete.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::EvidenceConfig;
use crate::error::{ErrorKind, StageError, StageResult};
use crate::types::{ExtractedField, FieldDecision, RowId, Screenshot};

/// Everything a row hands over for persistence. Fields the row never
/// produced (failed before navigation) stay `None`/empty; the decision
/// log and index are always written.
#[derive(Debug, Default)]
pub struct RowEvidence {
    pub full_screenshot: Option<Screenshot>,
    /// csv_field name to its element screenshot
    pub field_screenshots: Vec<(String, Screenshot)>,
    pub dom_snapshot: Option<String>,
    pub extracted: Vec<ExtractedField>,
    pub decisions: Vec<FieldDecision>,
    pub errors: Vec<StageError>,
}

/// Kind of a file inside an evidence bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceFileKind {
    Screenshot,
    DomSnapshot,
    Payload,
    DecisionLog,
}

/// One file in a per-row index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceFileEntry {
    pub name: String,
    pub size: u64,
    /// Hex sha256 of the file contents
    pub checksum: String,
    pub kind: EvidenceFileKind,
}

/// Per-row `index.json` contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowEvidenceIndex {
    pub evidence_id: String,
    pub row_id: RowId,
    pub created_at: DateTime<Utc>,
    pub files: Vec<EvidenceFileEntry>,
}

/// One row's entry in the run-level `evidence_index.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunIndexEntry {
    pub evidence_id: String,
    pub row_id: RowId,
    pub created_at: DateTime<Utc>,
    pub file_count: usize,
    pub total_bytes: u64,
    /// Set when the bundle is older than the compression window
    #[serde(default)]
    pub compression_pending: bool,
}

/// Writes evidence bundles and maintains the run index.
pub struct EvidenceCollector {
    evidence_dir: PathBuf,
    run_index_path: PathBuf,
    config: EvidenceConfig,
    run_index: Arc<Mutex<Vec<RunIndexEntry>>>,
}

impl EvidenceCollector {
    /// Create the collector, ensuring `{output_dir}/evidence/` exists.
    pub async fn new(output_dir: &Path, config: EvidenceConfig) -> std::io::Result<Self> {
        let evidence_dir = output_dir.join("evidence");
        tokio::fs::create_dir_all(&evidence_dir).await?;
        Ok(Self {
            run_index_path: output_dir.join("evidence_index.json"),
            evidence_dir,
            config,
            run_index: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn evidence_dir(&self) -> &Path {
        &self.evidence_dir
    }

    /// Persist one row's bundle. Returns the per-row index.
    pub async fn persist_row(
        &self,
        evidence_id: &str,
        row_id: &RowId,
        evidence: &RowEvidence,
    ) -> StageResult<RowEvidenceIndex> {
        let dir = self.evidence_dir.join(evidence_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| write_error("create evidence directory", e))?;

        let mut files = Vec::new();

        if self.config.screenshot_enabled {
            if let Some(shot) = &evidence.full_screenshot {
                files.push(
                    self.write_file(&dir, "full.png", &shot.bytes, EvidenceFileKind::Screenshot)
                        .await?,
                );
            }
            for (csv_field, shot) in &evidence.field_screenshots {
                let name = format!("field-{csv_field}.png");
                files.push(
                    self.write_file(&dir, &name, &shot.bytes, EvidenceFileKind::Screenshot)
                        .await?,
                );
            }
        }

        if self.config.dom_snapshot_enabled {
            if let Some(dom) = &evidence.dom_snapshot {
                files.push(
                    self.write_file(&dir, "dom.html", dom.as_bytes(), EvidenceFileKind::DomSnapshot)
                        .await?,
                );
            }
        }

        if !evidence.extracted.is_empty() {
            let payload = serde_json::to_vec_pretty(&evidence.extracted)
                .map_err(|e| serialize_error("extracted payload", e))?;
            files.push(
                self.write_file(&dir, "extracted.json", &payload, EvidenceFileKind::Payload)
                    .await?,
            );
        }

        // The decision log is written even for rows that failed before
        // producing anything else.
        let decision_log = DecisionLog {
            decisions: &evidence.decisions,
            errors: &evidence.errors,
        };
        let decisions = serde_json::to_vec_pretty(&decision_log)
            .map_err(|e| serialize_error("decision log", e))?;
        files.push(
            self.write_file(&dir, "decisions.json", &decisions, EvidenceFileKind::DecisionLog)
                .await?,
        );

        let index = RowEvidenceIndex {
            evidence_id: evidence_id.to_string(),
            row_id: row_id.clone(),
            created_at: Utc::now(),
            files,
        };
        let index_bytes = serde_json::to_vec_pretty(&index)
            .map_err(|e| serialize_error("row index", e))?;
        tokio::fs::write(dir.join("index.json"), &index_bytes)
            .await
            .map_err(|e| write_error("write index.json", e))?;

        self.append_run_index(&index).await?;

        debug!(evidence_id, row = %row_id, files = index.files.len(), "evidence committed");
        Ok(index)
    }

    async fn write_file(
        &self,
        dir: &Path,
        name: &str,
        bytes: &[u8],
        kind: EvidenceFileKind,
    ) -> StageResult<EvidenceFileEntry> {
        tokio::fs::write(dir.join(name), bytes)
            .await
            .map_err(|e| write_error(name, e))?;
        Ok(EvidenceFileEntry {
            name: name.to_string(),
            size: bytes.len() as u64,
            checksum: checksum(bytes),
            kind,
        })
    }

    /// Append to the run index and flush it, serialized by the mutex.
    async fn append_run_index(&self, index: &RowEvidenceIndex) -> StageResult<()> {
        let mut entries = self.run_index.lock().await;
        entries.push(RunIndexEntry {
            evidence_id: index.evidence_id.clone(),
            row_id: index.row_id.clone(),
            created_at: index.created_at,
            file_count: index.files.len(),
            total_bytes: index.files.iter().map(|f| f.size).sum(),
            compression_pending: false,
        });
        let bytes = serde_json::to_vec_pretty(&*entries)
            .map_err(|e| serialize_error("run index", e))?;
        tokio::fs::write(&self.run_index_path, &bytes)
            .await
            .map_err(|e| write_error("write evidence_index.json", e))
            .map(|_| ())
    }

    /// Retention pass: delete bundles past `retention_days`, flag
    /// bundles past `compression_after_days` for compression. Safe to
    /// run at shutdown.
    pub async fn sweep(&self) -> std::io::Result<SweepReport> {
        let now = Utc::now();
        let retention = chrono::Duration::days(self.config.retention_days as i64);
        let compression_window = chrono::Duration::days(self.config.compression_after_days as i64);
        let mut report = SweepReport::default();

        let mut dir_entries = tokio::fs::read_dir(&self.evidence_dir).await?;
        let mut expired = Vec::new();
        while let Some(entry) = dir_entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let index_path = entry.path().join("index.json");
            let created_at = match tokio::fs::read(&index_path).await {
                Ok(bytes) => serde_json::from_slice::<RowEvidenceIndex>(&bytes)
                    .map(|i| i.created_at)
                    .ok(),
                Err(_) => None,
            };
            let Some(created_at) = created_at else {
                continue;
            };
            if now - created_at > retention {
                expired.push((entry.path(), created_at));
            } else if self.config.compression_enabled && now - created_at > compression_window {
                report.flagged_for_compression += 1;
            }
        }

        for (path, created_at) in expired {
            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => {
                    info!(path = %path.display(), %created_at, "expired evidence removed");
                    report.removed += 1;
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed to remove expired evidence");
                    report.failed += 1;
                }
            }
        }

        if report.flagged_for_compression > 0 {
            let mut entries = self.run_index.lock().await;
            for entry in entries.iter_mut() {
                if now - entry.created_at > compression_window {
                    entry.compression_pending = true;
                }
            }
        }

        Ok(report)
    }

    /// Current run-index snapshot.
    pub async fn run_index(&self) -> Vec<RunIndexEntry> {
        self.run_index.lock().await.clone()
    }
}

/// Outcome of a retention sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: usize,
    pub failed: usize,
    pub flagged_for_compression: usize,
}

/// Shape of `decisions.json`: decisions plus the row's error trail.
#[derive(Serialize)]
struct DecisionLog<'a> {
    decisions: &'a [FieldDecision],
    errors: &'a [StageError],
}

fn checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn write_error(context: &str, err: std::io::Error) -> StageError {
    StageError::new(
        ErrorKind::EvidenceWriteFailed,
        format!("evidence write failed: {context}"),
    )
    .with_cause(err)
}

fn serialize_error(context: &str, err: serde_json::Error) -> StageError {
    StageError::new(
        ErrorKind::EvidenceWriteFailed,
        format!("evidence serialization failed: {context}"),
    )
    .with_cause(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Method;
    use tempfile::TempDir;

    fn decision(field: &str) -> FieldDecision {
        FieldDecision {
            csv_field: field.to_string(),
            csv_value: Some("Herman Melville".to_string()),
            web_value: Some("Herman Melville".to_string()),
            normalized_csv: Some("Herman Melville".to_string()),
            normalized_web: Some("Herman Melville".to_string()),
            matched: true,
            confidence: 1.0,
            reasoning: "values are identical".to_string(),
            method: Method::Dom,
            fuzzy_score: None,
            issues: vec![],
            llm_raw_response: Some("{\"match\": true}".to_string()),
        }
    }

    fn evidence() -> RowEvidence {
        RowEvidence {
            full_screenshot: Some(Screenshot::full(vec![0x89, 0x50, 0x4e, 0x47])),
            field_screenshots: vec![(
                "title".to_string(),
                Screenshot::element(vec![0x89, 0x50], None),
            )],
            dom_snapshot: Some("<html><h1>Moby-Dick</h1></html>".to_string()),
            extracted: vec![ExtractedField {
                csv_field: "title".to_string(),
                raw_value: Some("Moby-Dick".to_string()),
                normalized_value: Some("Moby-Dick".to_string()),
                method: Method::Dom,
                confidence: 0.9,
                element_box: None,
            }],
            decisions: vec![decision("title")],
            errors: vec![],
        }
    }

    #[tokio::test]
    async fn test_full_bundle_layout() {
        let dir = TempDir::new().unwrap();
        let collector = EvidenceCollector::new(dir.path(), EvidenceConfig::default())
            .await
            .unwrap();

        let index = collector
            .persist_row("ev-1", &RowId("row-0".to_string()), &evidence())
            .await
            .unwrap();

        let bundle = dir.path().join("evidence/ev-1");
        assert!(bundle.join("full.png").exists());
        assert!(bundle.join("field-title.png").exists());
        assert!(bundle.join("dom.html").exists());
        assert!(bundle.join("extracted.json").exists());
        assert!(bundle.join("decisions.json").exists());
        assert!(bundle.join("index.json").exists());
        assert!(dir.path().join("evidence_index.json").exists());

        assert_eq!(index.files.len(), 5);
        assert!(index.files.iter().all(|f| f.size > 0 && f.checksum.len() == 64));
    }

    #[tokio::test]
    async fn test_decision_log_contains_llm_raw_response() {
        let dir = TempDir::new().unwrap();
        let collector = EvidenceCollector::new(dir.path(), EvidenceConfig::default())
            .await
            .unwrap();
        collector
            .persist_row("ev-2", &RowId("row-1".to_string()), &evidence())
            .await
            .unwrap();

        let log = std::fs::read_to_string(dir.path().join("evidence/ev-2/decisions.json")).unwrap();
        assert!(log.contains("llm_raw_response"));
        assert!(log.contains("values are identical"));
    }

    #[tokio::test]
    async fn test_failed_row_still_gets_decision_log() {
        let dir = TempDir::new().unwrap();
        let collector = EvidenceCollector::new(dir.path(), EvidenceConfig::default())
            .await
            .unwrap();

        let bundle = RowEvidence {
            errors: vec![StageError::new(ErrorKind::PageNotFound, "page returned 404")],
            ..RowEvidence::default()
        };
        let index = collector
            .persist_row("ev-3", &RowId("row-2".to_string()), &bundle)
            .await
            .unwrap();

        let dir_path = dir.path().join("evidence/ev-3");
        assert!(dir_path.join("decisions.json").exists());
        assert!(!dir_path.join("full.png").exists());
        assert_eq!(index.files.len(), 1);

        let log = std::fs::read_to_string(dir_path.join("decisions.json")).unwrap();
        assert!(log.contains("page_not_found"));
    }

    #[tokio::test]
    async fn test_screenshots_respect_config() {
        let dir = TempDir::new().unwrap();
        let config = EvidenceConfig {
            screenshot_enabled: false,
            dom_snapshot_enabled: false,
            ..EvidenceConfig::default()
        };
        let collector = EvidenceCollector::new(dir.path(), config).await.unwrap();
        collector
            .persist_row("ev-4", &RowId("row-3".to_string()), &evidence())
            .await
            .unwrap();

        let bundle = dir.path().join("evidence/ev-4");
        assert!(!bundle.join("full.png").exists());
        assert!(!bundle.join("dom.html").exists());
        assert!(bundle.join("extracted.json").exists());
    }

    #[tokio::test]
    async fn test_run_index_aggregates_rows() {
        let dir = TempDir::new().unwrap();
        let collector = EvidenceCollector::new(dir.path(), EvidenceConfig::default())
            .await
            .unwrap();
        collector
            .persist_row("ev-a", &RowId("row-0".to_string()), &evidence())
            .await
            .unwrap();
        collector
            .persist_row("ev-b", &RowId("row-1".to_string()), &evidence())
            .await
            .unwrap();

        let run_index = collector.run_index().await;
        assert_eq!(run_index.len(), 2);
        assert_eq!(run_index[0].evidence_id, "ev-a");
        assert!(run_index[0].total_bytes > 0);

        let on_disk: Vec<RunIndexEntry> = serde_json::from_slice(
            &std::fs::read(dir.path().join("evidence_index.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(on_disk.len(), 2);
    }

    #[tokio::test]
    async fn test_sweep_keeps_fresh_bundles() {
        let dir = TempDir::new().unwrap();
        let collector = EvidenceCollector::new(dir.path(), EvidenceConfig::default())
            .await
            .unwrap();
        collector
            .persist_row("ev-fresh", &RowId("row-0".to_string()), &evidence())
            .await
            .unwrap();

        let report = collector.sweep().await.unwrap();
        assert_eq!(report.removed, 0);
        assert!(dir.path().join("evidence/ev-fresh").exists());
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_bundles() {
        let dir = TempDir::new().unwrap();
        let collector = EvidenceCollector::new(dir.path(), EvidenceConfig::default())
            .await
            .unwrap();
        collector
            .persist_row("ev-old", &RowId("row-0".to_string()), &evidence())
            .await
            .unwrap();

        // Age the bundle by rewriting its index with an old timestamp.
        let index_path = dir.path().join("evidence/ev-old/index.json");
        let mut index: RowEvidenceIndex =
            serde_json::from_slice(&std::fs::read(&index_path).unwrap()).unwrap();
        index.created_at = Utc::now() - chrono::Duration::days(60);
        std::fs::write(&index_path, serde_json::to_vec_pretty(&index).unwrap()).unwrap();

        let report = collector.sweep().await.unwrap();
        assert_eq!(report.removed, 1);
        assert!(!dir.path().join("evidence/ev-old").exists());
    }
}
