//! Progress reporting for observable validation runs.
//!
//! The scheduler emits a typed event per row transition plus a compact
//! progress update after each completion. Callers render these however
//! they like (CLI progress bar, TUI panel, JSON log); the core only
//! guarantees ordering per row, not across rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::types::RowId;

/// Compact progress snapshot delivered after each completed row.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// Rows with a final `RowResult`
    pub processed: usize,
    /// Rows scanned from the input
    pub total: usize,
    /// Naive remaining-time estimate from the running mean row duration
    pub eta_ms: u64,
}

/// Callback invoked by the scheduler after each row completes.
pub type ProgressCallback = Arc<dyn Fn(ProgressUpdate) + Send + Sync>;

/// Types of events emitted during a validation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunEventType {
    /// Run accepted and dispatch started
    RunStart,
    /// A row entered its pipeline
    RowStart,
    /// A row produced a final result
    RowComplete,
    /// A row exhausted retries and failed
    RowFailed,
    /// A row attempt is being retried
    RowRetry,
    /// Dispatch halted by the rolling failure rate
    RunEscalated,
    /// External cancellation observed
    RunCancelled,
    /// All dispatched rows drained
    RunComplete,
}

impl std::fmt::Display for RunEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::RunStart => "RUN_START",
            Self::RowStart => "ROW_START",
            Self::RowComplete => "ROW_COMPLETE",
            Self::RowFailed => "ROW_FAILED",
            Self::RowRetry => "ROW_RETRY",
            Self::RunEscalated => "RUN_ESCALATED",
            Self::RunCancelled => "RUN_CANCELLED",
            Self::RunComplete => "RUN_COMPLETE",
        };
        write!(f, "{s}")
    }
}

/// An event emitted during a validation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub event_type: RunEventType,
    /// Row this event concerns, when row-scoped
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_id: Option<RowId>,
    /// Human-readable description
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl RunEvent {
    pub fn new(event_type: RunEventType, content: impl Into<String>) -> Self {
        Self {
            event_type,
            row_id: None,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn for_row(mut self, row_id: RowId) -> Self {
        self.row_id = Some(row_id);
        self
    }

    // Convenience constructors for common event types

    pub fn run_start(total_rows: usize) -> Self {
        Self::new(RunEventType::RunStart, format!("{total_rows} rows queued"))
    }

    pub fn row_start(row_id: RowId) -> Self {
        Self::new(RunEventType::RowStart, format!("row {row_id} started")).for_row(row_id)
    }

    pub fn row_complete(row_id: RowId, matched: bool) -> Self {
        let verdict = if matched { "matched" } else { "mismatched" };
        Self::new(RunEventType::RowComplete, format!("row {row_id} {verdict}")).for_row(row_id)
    }

    pub fn row_retry(row_id: RowId, attempt: u32, reason: impl Into<String>) -> Self {
        Self::new(
            RunEventType::RowRetry,
            format!("row {row_id} retry {attempt}: {}", reason.into()),
        )
        .for_row(row_id)
    }

    pub fn row_failed(row_id: RowId, reason: impl Into<String>) -> Self {
        Self::new(
            RunEventType::RowFailed,
            format!("row {row_id} failed: {}", reason.into()),
        )
        .for_row(row_id)
    }

    pub fn run_escalated(rate: f64) -> Self {
        Self::new(
            RunEventType::RunEscalated,
            format!("dispatch halted at rolling failure rate {rate:.2}"),
        )
    }

    pub fn run_cancelled() -> Self {
        Self::new(RunEventType::RunCancelled, "cancellation observed")
    }

    pub fn run_complete(processed: usize) -> Self {
        Self::new(RunEventType::RunComplete, format!("{processed} rows processed"))
    }
}

/// Callback invoked with every run event. Optional; progress updates
/// remain available without it.
pub type EventCallback = Arc<dyn Fn(RunEvent) + Send + Sync>;
