//! LLM judge capability trait and HTTP implementation.
//!
//! The HTTP judge discovers a local inference endpoint from a candidate
//! list, pins the first one that answers a health probe, and re-runs
//! discovery after two consecutive transport failures.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::types::FieldType;

/// Default candidate endpoints probed during discovery, in order.
pub const DEFAULT_CANDIDATE_ENDPOINTS: &[&str] = &[
    "http://127.0.0.1:8000",
    "http://127.0.0.1:8080",
    "http://[::1]:8000",
    "http://[::1]:8080",
];

/// Structured adjudication request sent to the judge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdjudicationRequest {
    pub csv_value: String,
    pub web_value: String,
    pub field_type: FieldType,
    pub field_name: String,
}

/// LLM judge capability.
#[async_trait]
pub trait LlmJudge: Send + Sync {
    /// Probe the judge; `Ok` means it can take requests.
    async fn health(&self) -> Result<()>;

    /// Submit an adjudication request; returns the raw response body.
    /// Parsing is the caller's concern (the response may be arbitrarily
    /// messy).
    async fn adjudicate(&self, request: &AdjudicationRequest) -> Result<String>;

    /// Generic completion endpoint for diagnostics.
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// Configuration for the HTTP judge.
#[derive(Debug, Clone)]
pub struct HttpLlmJudgeConfig {
    /// Candidate base URLs, probed in order
    pub endpoints: Vec<String>,
    /// Health probe timeout
    pub health_timeout: Duration,
    /// Per-request timeout
    pub request_timeout: Duration,
}

impl Default for HttpLlmJudgeConfig {
    fn default() -> Self {
        Self {
            endpoints: DEFAULT_CANDIDATE_ENDPOINTS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            health_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
        }
    }
}

fn build_http_client(timeout: Duration) -> Client {
    // Proxy auto-detection can panic in some sandboxed environments;
    // fall back to a no-proxy client in that case.
    match catch_unwind(AssertUnwindSafe(|| {
        Client::builder().timeout(timeout).build()
    })) {
        Ok(Ok(client)) => client,
        Ok(Err(_)) | Err(_) => Client::builder()
            .no_proxy()
            .timeout(timeout)
            .build()
            .expect("Failed to create HTTP client"),
    }
}

/// HTTP-transport judge with endpoint discovery and pinning.
pub struct HttpLlmJudge {
    config: HttpLlmJudgeConfig,
    http: Client,
    /// Endpoint pinned for the run after a successful health probe
    pinned: RwLock<Option<String>>,
    /// Consecutive transport failures since the last success
    consecutive_failures: AtomicU32,
}

#[derive(Debug, Serialize)]
struct ValidatePayload<'a> {
    csv_value: &'a str,
    web_value: &'a str,
    field_type: FieldType,
    field_name: &'a str,
}

#[derive(Debug, Serialize)]
struct CompletePayload<'a> {
    prompt: &'a str,
}

impl HttpLlmJudge {
    /// Failures tolerated before the pin is dropped and discovery
    /// re-runs.
    const REDISCOVERY_FAILURES: u32 = 2;

    pub fn new(config: HttpLlmJudgeConfig) -> Self {
        let http = build_http_client(config.request_timeout);
        Self {
            config,
            http,
            pinned: RwLock::new(None),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// Return the pinned endpoint, running discovery if needed.
    async fn endpoint(&self) -> Result<String> {
        if let Some(url) = self.pinned.read().await.clone() {
            return Ok(url);
        }
        self.discover().await
    }

    /// Probe candidates in order and pin the first healthy one.
    async fn discover(&self) -> Result<String> {
        for candidate in &self.config.endpoints {
            debug!(endpoint = %candidate, "probing candidate endpoint");
            if self.probe(candidate).await {
                info!(endpoint = %candidate, "LLM endpoint pinned");
                let mut pinned = self.pinned.write().await;
                *pinned = Some(candidate.clone());
                return Ok(candidate.clone());
            }
        }
        Err(Error::Llm(format!(
            "no healthy endpoint among {} candidates",
            self.config.endpoints.len()
        )))
    }

    async fn probe(&self, base_url: &str) -> bool {
        let url = format!("{base_url}/health");
        let request = self.http.get(&url).timeout(self.config.health_timeout);
        match request.send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    /// Drop the pin after two consecutive failures so the next call
    /// re-discovers.
    async fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= Self::REDISCOVERY_FAILURES {
            warn!(failures, "dropping pinned LLM endpoint for rediscovery");
            let mut pinned = self.pinned.write().await;
            *pinned = None;
            self.consecutive_failures.store(0, Ordering::SeqCst);
        }
    }

    async fn post_for_text(&self, url: &str, body: &impl Serialize) -> Result<String> {
        let response = self
            .http
            .post(url)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Llm(format!("HTTP request failed: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::Llm(format!("Failed to read response: {e}")))?;

        if !status.is_success() {
            return Err(Error::Llm(format!("endpoint returned {status}: {text}")));
        }
        Ok(text)
    }
}

#[async_trait]
impl LlmJudge for HttpLlmJudge {
    async fn health(&self) -> Result<()> {
        let endpoint = self.endpoint().await?;
        if self.probe(&endpoint).await {
            Ok(())
        } else {
            self.record_failure().await;
            Err(Error::Llm(format!("health probe failed for {endpoint}")))
        }
    }

    async fn adjudicate(&self, request: &AdjudicationRequest) -> Result<String> {
        let endpoint = self.endpoint().await?;
        let url = format!("{endpoint}/validate");
        let payload = ValidatePayload {
            csv_value: &request.csv_value,
            web_value: &request.web_value,
            field_type: request.field_type,
            field_name: &request.field_name,
        };

        match self.post_for_text(&url, &payload).await {
            Ok(text) => {
                self.record_success();
                Ok(text)
            }
            Err(err) => {
                self.record_failure().await;
                Err(err)
            }
        }
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let endpoint = self.endpoint().await?;
        let url = format!("{endpoint}/complete");
        match self.post_for_text(&url, &CompletePayload { prompt }).await {
            Ok(text) => {
                self.record_success();
                Ok(text)
            }
            Err(err) => {
                self.record_failure().await;
                Err(err)
            }
        }
    }
}
