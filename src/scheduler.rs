//! Bounded worker pool over the input row stream.
//!
//! Rows dispatch in arrival order onto up to `parallel_workers`
//! concurrent pipelines and may complete out of order; results are
//! reassembled by row index. The scheduler owns per-row retries, the
//! rolling-failure escalation breaker, rate limiting, cooperative
//! cancellation with a drain window, progress callbacks, and the final
//! registry shutdown.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::ValidationConfig;
use crate::error::{ErrorKind, StageError};
use crate::evidence::EvidenceCollector;
use crate::pipeline::RowPipeline;
use crate::progress::{EventCallback, ProgressCallback, ProgressUpdate, RunEvent};
use crate::registry::ResourceRegistry;
use crate::types::{Row, RowResult};

/// Default drain window after cancellation before cleanup is forced.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(20);

/// Size of the rolling window the escalation breaker evaluates.
const ESCALATION_WINDOW: usize = 100;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    /// All dispatched rows drained; individual rows may still have
    /// failed
    Completed,
    /// The rolling failure rate tripped the breaker
    Escalated { rate: f64 },
    /// External cancellation stopped the run
    Cancelled,
}

impl RunStatus {
    /// Exit-code convention for CLI wrappers.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Completed => 0,
            Self::Escalated { .. } => 2,
            Self::Cancelled => 130,
        }
    }
}

/// Everything a run produced, before report assembly.
#[derive(Debug)]
pub struct RunOutput {
    /// Final row results, sorted by row index
    pub results: Vec<RowResult>,
    pub status: RunStatus,
    /// Rows scanned from the input
    pub total_rows: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Sliding-window page-load limiter (requests per window against the
/// target origin).
struct RateLimiter {
    limit: u32,
    window: Duration,
    state: Mutex<(Instant, u32)>,
}

impl RateLimiter {
    fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            state: Mutex::new((Instant::now(), 0)),
        }
    }

    async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let (window_start, used) = &mut *state;
                let elapsed = window_start.elapsed();
                if elapsed >= self.window {
                    *window_start = Instant::now();
                    *used = 0;
                }
                if *used < self.limit {
                    *used += 1;
                    None
                } else {
                    Some(self.window.saturating_sub(elapsed))
                }
            };
            match wait {
                Some(wait) => sleep(wait).await,
                None => break,
            }
        }
    }
}

/// Shared mutable run state across worker tasks.
struct RunState {
    results: Mutex<Vec<RowResult>>,
    window: Mutex<VecDeque<bool>>,
    escalated: AtomicBool,
    escalation_rate: Mutex<Option<f64>>,
    processed: AtomicUsize,
}

/// Drives a validation run over a set of rows.
pub struct Scheduler {
    config: Arc<ValidationConfig>,
    pipeline: Arc<RowPipeline>,
    registry: Arc<ResourceRegistry>,
    collector: Arc<EvidenceCollector>,
    progress: Option<ProgressCallback>,
    events: Option<EventCallback>,
    drain_timeout: Duration,
}

impl Scheduler {
    pub fn new(
        config: Arc<ValidationConfig>,
        pipeline: Arc<RowPipeline>,
        registry: Arc<ResourceRegistry>,
        collector: Arc<EvidenceCollector>,
    ) -> Self {
        Self {
            config,
            pipeline,
            registry,
            collector,
            progress: None,
            events: None,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn with_events(mut self, callback: EventCallback) -> Self {
        self.events = Some(callback);
        self
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    fn emit(&self, event: RunEvent) {
        if let Some(events) = &self.events {
            events(event);
        }
    }

    /// Run every row to completion, escalation, or cancellation.
    #[instrument(skip_all, fields(rows = rows.len()))]
    pub async fn run(&self, rows: Vec<Row>, cancel: CancellationToken) -> RunOutput {
        let started_at = Utc::now();
        let run_start = Instant::now();
        let total = rows.len();
        self.emit(RunEvent::run_start(total));

        if total == 0 {
            self.registry.shutdown().await;
            return RunOutput {
                results: Vec::new(),
                status: RunStatus::Completed,
                total_rows: 0,
                started_at,
                finished_at: Utc::now(),
            };
        }

        let workers = self.config.performance.parallel_workers.max(1);
        let semaphore = Arc::new(Semaphore::new(workers));
        let rate_limiter = self
            .config
            .performance
            .rate_limit_per_minute
            .map(|limit| Arc::new(RateLimiter::new(limit, Duration::from_secs(60))));
        let state = Arc::new(RunState {
            results: Mutex::new(Vec::with_capacity(total)),
            window: Mutex::new(VecDeque::with_capacity(ESCALATION_WINDOW)),
            escalated: AtomicBool::new(false),
            escalation_rate: Mutex::new(None),
            processed: AtomicUsize::new(0),
        });

        let mut handles = Vec::with_capacity(total);
        for row in rows {
            if cancel.is_cancelled() || state.escalated.load(Ordering::SeqCst) {
                break;
            }

            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => permit.expect("semaphore closed"),
                _ = cancel.cancelled() => break,
            };
            // A row finishing while we waited may have tripped the breaker.
            if state.escalated.load(Ordering::SeqCst) {
                break;
            }

            let pipeline = Arc::clone(&self.pipeline);
            let config = Arc::clone(&self.config);
            let state = Arc::clone(&state);
            let cancel = cancel.clone();
            let progress = self.progress.clone();
            let events = self.events.clone();
            let rate_limiter = rate_limiter.clone();

            handles.push(tokio::spawn(async move {
                let _permit = permit;
                if let Some(limiter) = &rate_limiter {
                    limiter.acquire().await;
                }
                if let Some(events) = &events {
                    events(RunEvent::row_start(row.id.clone()));
                }

                let result =
                    run_row_with_retries(&pipeline, &config, &row, &cancel, events.as_ref()).await;

                let threshold = config.rules.error_handling.escalation_threshold;
                complete_row(
                    &state,
                    result,
                    total,
                    run_start,
                    threshold,
                    progress.as_ref(),
                    events.as_ref(),
                )
                .await;
            }));
        }

        // Drain in-flight rows; cancellation gets a bounded window.
        let drained = if cancel.is_cancelled() {
            self.emit(RunEvent::run_cancelled());
            tokio::time::timeout(self.drain_timeout, futures::future::join_all(&mut handles))
                .await
                .is_ok()
        } else {
            futures::future::join_all(&mut handles).await;
            true
        };
        if !drained {
            warn!("drain window elapsed; aborting in-flight rows");
            for handle in &handles {
                handle.abort();
            }
        }

        // Registry cleanup runs regardless of how the run ended.
        self.registry.shutdown().await;
        if let Err(err) = self.collector.sweep().await {
            warn!(error = %err, "evidence retention sweep failed");
        }

        let mut results = state.results.lock().await.drain(..).collect::<Vec<_>>();
        results.sort_by_key(|r| r.row_index);

        let status = if cancel.is_cancelled() {
            RunStatus::Cancelled
        } else if state.escalated.load(Ordering::SeqCst) {
            let rate = state.escalation_rate.lock().await.unwrap_or(0.0);
            self.emit(RunEvent::run_escalated(rate));
            RunStatus::Escalated { rate }
        } else {
            self.emit(RunEvent::run_complete(results.len()));
            RunStatus::Completed
        };

        info!(
            processed = results.len(),
            total,
            status = ?status,
            "run finished"
        );

        RunOutput {
            results,
            status,
            total_rows: total,
            started_at,
            finished_at: Utc::now(),
        }
    }
}

/// Run one row, retrying per the error-handling rules. Errors and
/// elapsed time from failed attempts accumulate into the final result.
async fn run_row_with_retries(
    pipeline: &RowPipeline,
    config: &ValidationConfig,
    row: &Row,
    cancel: &CancellationToken,
    events: Option<&EventCallback>,
) -> RowResult {
    let rules = &config.rules.error_handling;
    let row_start = Instant::now();
    let mut attempt: u32 = 0;
    let mut nav_timeout_retried = false;
    let mut prior_errors: Vec<StageError> = Vec::new();

    loop {
        let mut result = pipeline.process_row(row, cancel).await;

        let retry_kind = result.errors.iter().map(|e| e.kind).find(|kind| {
            rules.is_retryable(*kind)
                && !(*kind == ErrorKind::NavigationTimeout && nav_timeout_retried)
        });

        let should_retry = !result.overall_match
            && !cancel.is_cancelled()
            && attempt < rules.max_retry_attempts
            && retry_kind.is_some();

        if !should_retry {
            if !prior_errors.is_empty() {
                prior_errors.append(&mut result.errors);
                result.errors = prior_errors;
            }
            result.processing_time_ms = row_start.elapsed().as_millis() as u64;
            return result;
        }

        let kind = retry_kind.expect("checked above");
        if kind == ErrorKind::NavigationTimeout {
            // Retryable on its first occurrence only.
            nav_timeout_retried = true;
        }
        prior_errors.append(&mut result.errors);
        attempt += 1;

        if let Some(events) = events {
            events(RunEvent::row_retry(row.id.clone(), attempt, kind.as_str()));
        }
        debug!(row = %row.id, attempt, kind = %kind, "retrying row");

        let delay = retry_delay(rules.retry_delay_ms, rules.exponential_backoff, attempt - 1);
        tokio::select! {
            _ = sleep(delay) => {}
            _ = cancel.cancelled() => {}
        }
    }
}

/// Backoff delay with up to 25% additive jitter.
fn retry_delay(base_ms: u64, exponential: bool, attempt: u32) -> Duration {
    let factor = if exponential {
        2f64.powi(attempt as i32)
    } else {
        1.0
    };
    let ms = (base_ms as f64 * factor).round() as u64;
    let jitter = if ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=ms / 4)
    };
    Duration::from_millis(ms + jitter)
}

/// Record a finished row: rolling window, escalation check, progress,
/// events, result collection.
async fn complete_row(
    state: &RunState,
    result: RowResult,
    total: usize,
    run_start: Instant,
    escalation_threshold: f64,
    progress: Option<&ProgressCallback>,
    events: Option<&EventCallback>,
) {
    // A row failed when it carries a non-recoverable error; a clean
    // mismatch is a processed success.
    let failed = result.errors.iter().any(|e| !e.recoverable);

    let rate = {
        let mut window = state.window.lock().await;
        if window.len() == ESCALATION_WINDOW {
            window.pop_front();
        }
        window.push_back(failed);
        let failures = window.iter().filter(|f| **f).count();
        // The denominator is the full window size, so early failures
        // ramp the rate gradually rather than tripping on the first
        // row.
        failures as f64 / ESCALATION_WINDOW as f64
    };
    if rate > escalation_threshold && !state.escalated.swap(true, Ordering::SeqCst) {
        warn!(
            rate,
            threshold = escalation_threshold,
            "rolling failure rate exceeded threshold; halting dispatch"
        );
        let mut stored = state.escalation_rate.lock().await;
        *stored = Some(rate);
    }

    if let Some(events) = events {
        if failed {
            let reason = result
                .errors
                .iter()
                .find(|e| !e.recoverable)
                .map(|e| e.kind.as_str())
                .unwrap_or("unknown");
            events(RunEvent::row_failed(result.row_id.clone(), reason));
        } else {
            events(RunEvent::row_complete(result.row_id.clone(), result.overall_match));
        }
    }

    let processed = state.processed.fetch_add(1, Ordering::SeqCst) + 1;
    if let Some(progress) = progress {
        let elapsed_ms = run_start.elapsed().as_millis() as u64;
        let avg_ms = elapsed_ms / processed as u64;
        let remaining = total.saturating_sub(processed) as u64;
        progress(ProgressUpdate {
            processed,
            total,
            eta_ms: avg_ms * remaining,
        });
    }

    let mut results = state.results.lock().await;
    results.push(result);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(RunStatus::Completed.exit_code(), 0);
        assert_eq!(RunStatus::Escalated { rate: 0.25 }.exit_code(), 2);
        assert_eq!(RunStatus::Cancelled.exit_code(), 130);
    }

    #[test]
    fn test_retry_delay_growth() {
        let first = retry_delay(100, true, 0);
        let third = retry_delay(100, true, 2);
        assert!(first >= Duration::from_millis(100));
        assert!(first <= Duration::from_millis(125));
        assert!(third >= Duration::from_millis(400));
        assert!(third <= Duration::from_millis(500));
    }

    #[test]
    fn test_retry_delay_without_backoff() {
        let delay = retry_delay(100, false, 5);
        assert!(delay >= Duration::from_millis(100));
        assert!(delay <= Duration::from_millis(125));
    }

    #[tokio::test]
    async fn test_rate_limiter_enforces_window() {
        let limiter = RateLimiter::new(2, Duration::from_millis(40));
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
