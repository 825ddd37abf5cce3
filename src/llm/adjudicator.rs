//! Adjudication driver: retries, budgets, and the deterministic
//! fallback.
//!
//! Wraps any `LlmJudge` with exponential backoff plus jitter, a health
//! probe gating every retry, a per-request timeout, an overall
//! per-adjudication budget, and a semaphore bounding in-flight
//! requests to the worker count. The caller always gets an outcome;
//! when the judge is unreachable the outcome is the deterministic
//! fallback with `llm_unavailable` recorded.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::client::{AdjudicationRequest, LlmJudge};
use super::parse::parse_adjudication;

/// Issue tag recorded when the fallback answer is used.
pub const ISSUE_LLM_UNAVAILABLE: &str = "llm_unavailable";

/// Retry and budget configuration.
#[derive(Debug, Clone)]
pub struct AdjudicatorConfig {
    /// Retries after the initial attempt
    pub max_retries: u32,
    /// Base backoff delay
    pub backoff_base: Duration,
    /// Backoff multiplier per attempt
    pub backoff_factor: f64,
    /// Per-request timeout
    pub request_timeout: Duration,
    /// Overall budget for one adjudication, retries included
    pub total_budget: Duration,
    /// Maximum in-flight requests; size this to the worker count
    pub max_in_flight: usize,
}

impl Default for AdjudicatorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_secs(2),
            backoff_factor: 2.0,
            request_timeout: Duration::from_secs(10),
            total_budget: Duration::from_secs(30),
            max_in_flight: 3,
        }
    }
}

impl AdjudicatorConfig {
    /// Backoff delay for a retry attempt (0-based), with up to 25%
    /// additive jitter.
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.max(1.0).powi(attempt as i32);
        let base_ms = (self.backoff_base.as_millis() as f64 * factor).round() as u64;
        let jitter_ms = if base_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=base_ms / 4)
        };
        Duration::from_millis(base_ms + jitter_ms)
    }
}

/// Per-run adjudicator counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdjudicatorStats {
    pub calls: u64,
    pub retries: u64,
    pub transport_failures: u64,
    pub parse_fallbacks: u64,
    pub deterministic_fallbacks: u64,
}

/// Final outcome of one adjudication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdjudicationOutcome {
    pub matched: bool,
    pub confidence: f64,
    pub reasoning: String,
    /// Raw judge response, retained for the evidence bundle
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
    #[serde(default)]
    pub issues: Vec<String>,
}

/// Drives a judge with retries and budgets.
pub struct Adjudicator {
    judge: Arc<dyn LlmJudge>,
    config: AdjudicatorConfig,
    semaphore: Arc<Semaphore>,
    stats: Arc<RwLock<AdjudicatorStats>>,
}

impl Adjudicator {
    pub fn new(judge: Arc<dyn LlmJudge>, config: AdjudicatorConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_in_flight.max(1)));
        Self {
            judge,
            config,
            semaphore,
            stats: Arc::new(RwLock::new(AdjudicatorStats::default())),
        }
    }

    /// Current counters.
    pub async fn stats(&self) -> AdjudicatorStats {
        self.stats.read().await.clone()
    }

    /// Adjudicate one field pair.
    ///
    /// `normalized_equal` feeds the deterministic fallback: when the
    /// judge never answers, the fallback verdict is normalized equality
    /// with confidence 0.6 (match) or 0.2 (mismatch).
    pub async fn adjudicate(
        &self,
        request: AdjudicationRequest,
        normalized_equal: bool,
        cancel: &CancellationToken,
    ) -> AdjudicationOutcome {
        {
            let mut stats = self.stats.write().await;
            stats.calls += 1;
        }

        let permit = tokio::select! {
            permit = self.semaphore.acquire() => permit.expect("semaphore closed"),
            _ = cancel.cancelled() => {
                return self.fallback(normalized_equal).await;
            }
        };
        let _permit = permit;

        let deadline = Instant::now() + self.config.total_budget;
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return self.fallback(normalized_equal).await;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(field = %request.field_name, "adjudication budget exhausted");
                return self.fallback(normalized_equal).await;
            }

            let per_attempt = remaining.min(self.config.request_timeout);
            let result = tokio::select! {
                result = timeout(per_attempt, self.judge.adjudicate(&request)) => match result {
                    Ok(inner) => inner,
                    Err(_) => Err(crate::error::Error::timeout(per_attempt.as_millis() as u64)),
                },
                _ = cancel.cancelled() => {
                    return self.fallback(normalized_equal).await;
                }
            };

            match result {
                Ok(raw) => match parse_adjudication(&raw) {
                    Some((parsed, layer)) => {
                        let mut issues = Vec::new();
                        if !layer.is_clean() {
                            issues.push(format!("llm_parse_warning:{}", layer.as_str()));
                            let mut stats = self.stats.write().await;
                            stats.parse_fallbacks += 1;
                        }
                        debug!(
                            field = %request.field_name,
                            layer = layer.as_str(),
                            matched = parsed.matched,
                            "adjudication parsed"
                        );
                        return AdjudicationOutcome {
                            matched: parsed.matched,
                            confidence: parsed.confidence,
                            reasoning: parsed.reasoning,
                            raw_response: Some(raw),
                            issues,
                        };
                    }
                    None => {
                        warn!(field = %request.field_name, "unparseable adjudication response");
                        // An unusable body counts as a failed attempt.
                    }
                },
                Err(err) => {
                    debug!(field = %request.field_name, error = %err, "adjudication transport error");
                    let mut stats = self.stats.write().await;
                    stats.transport_failures += 1;
                }
            }

            if attempt >= self.config.max_retries {
                return self.fallback(normalized_equal).await;
            }

            let delay = self
                .config
                .delay_for_attempt(attempt)
                .min(deadline.saturating_duration_since(Instant::now()));
            attempt += 1;
            {
                let mut stats = self.stats.write().await;
                stats.retries += 1;
            }

            tokio::select! {
                _ = sleep(delay) => {}
                _ = cancel.cancelled() => {
                    return self.fallback(normalized_equal).await;
                }
            }

            // Health probe gates every retry; a sick endpoint burns the
            // attempt without sending the request.
            if self.judge.health().await.is_err() {
                debug!(field = %request.field_name, attempt, "health gate failed before retry");
                if attempt > self.config.max_retries {
                    return self.fallback(normalized_equal).await;
                }
            }
        }
    }

    async fn fallback(&self, normalized_equal: bool) -> AdjudicationOutcome {
        {
            let mut stats = self.stats.write().await;
            stats.deterministic_fallbacks += 1;
        }
        AdjudicationOutcome {
            matched: normalized_equal,
            confidence: if normalized_equal { 0.6 } else { 0.2 },
            reasoning: "adjudicator unavailable; fell back to normalized equality".to_string(),
            raw_response: None,
            issues: vec![ISSUE_LLM_UNAVAILABLE.to_string()],
        }
    }
}
