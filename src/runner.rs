//! Top-level run assembly.
//!
//! Callers hand over a validated config, the capability
//! implementations, an output directory, and the rows; the runner
//! wires the navigator, extractor, decision engine, caches, evidence
//! collector, registry, and scheduler together and returns the final
//! report. Report rendering and config parsing stay outside the core.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::browser::BrowserDriver;
use crate::config::ValidationConfig;
use crate::decision::{DecisionCache, DecisionEngine};
use crate::error::{Error, Result};
use crate::evidence::EvidenceCollector;
use crate::extract::PageExtractor;
use crate::llm::{Adjudicator, AdjudicatorConfig, LlmJudge};
use crate::navigate::Navigator;
use crate::ocr::{OcrCache, OcrEngine};
use crate::pipeline::{DomSnapshotCache, RowPipeline};
use crate::progress::{EventCallback, ProgressCallback};
use crate::registry::{Resource, ResourceRegistry};
use crate::report::RunReport;
use crate::scheduler::Scheduler;
use crate::types::Row;

/// The pluggable backends a run needs. OCR and LLM are optional;
/// without them the corresponding fallback and escalation paths stay
/// inert.
#[derive(Clone)]
pub struct Capabilities {
    pub browser: Arc<dyn BrowserDriver>,
    pub ocr: Option<Arc<dyn OcrEngine>>,
    pub llm: Option<Arc<dyn LlmJudge>>,
}

/// Registry adapter that closes the browser session on shutdown.
struct BrowserSession {
    driver: Arc<dyn BrowserDriver>,
    closed: AtomicBool,
}

impl BrowserSession {
    fn new(driver: Arc<dyn BrowserDriver>) -> Self {
        Self {
            driver,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait::async_trait]
impl Resource for BrowserSession {
    fn name(&self) -> &str {
        "browser-session"
    }

    async fn cleanup(&self) -> Result<()> {
        self.driver.close().await?;
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_cleaned_up(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Assembles and drives validation runs.
pub struct ValidationRunner {
    config: Arc<ValidationConfig>,
    capabilities: Capabilities,
    progress: Option<ProgressCallback>,
    events: Option<EventCallback>,
}

impl ValidationRunner {
    /// Create a runner; the config is validated up front so a broken
    /// one fails before any capability is touched.
    pub fn new(config: ValidationConfig, capabilities: Capabilities) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            capabilities,
            progress: None,
            events: None,
        })
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn with_events(mut self, callback: EventCallback) -> Self {
        self.events = Some(callback);
        self
    }

    /// Run the rows and return the report. Escalation and cancellation
    /// are reported through `report.status`, not as errors; `Err` means
    /// the run could not start.
    pub async fn run(
        &self,
        rows: Vec<Row>,
        output_dir: &Path,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        let config = &self.config;
        let caching = &config.performance.caching;

        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(|e| Error::OutputDir {
                path: output_dir.display().to_string(),
                message: e.to_string(),
            })?;
        let collector = Arc::new(
            EvidenceCollector::new(output_dir, config.evidence.clone())
                .await
                .map_err(|e| Error::OutputDir {
                    path: output_dir.display().to_string(),
                    message: e.to_string(),
                })?,
        );

        let registry = Arc::new(ResourceRegistry::new());
        registry
            .register(Arc::new(BrowserSession::new(self.capabilities.browser.clone())))
            .await?;

        let navigator = Navigator::new(
            self.capabilities.browser.clone(),
            Duration::from_millis(config.performance.timeouts.navigation_ms),
        )
        .with_screenshots(config.evidence.screenshot_enabled);

        let mut extractor = PageExtractor::new(
            self.capabilities.browser.clone(),
            self.capabilities.ocr.clone(),
            config.rules.normalization.clone(),
            config.rules.confidence.ocr_threshold,
        );
        if caching.ocr_results {
            extractor = extractor.with_ocr_cache(Arc::new(OcrCache::with_ttl_secs(caching.ttl_secs)));
        }

        let decision_cache = caching
            .validation_decisions
            .then(|| Arc::new(DecisionCache::with_ttl_secs(caching.ttl_secs)));
        let adjudicator = self.capabilities.llm.clone().map(|judge| {
            Arc::new(Adjudicator::new(
                judge,
                AdjudicatorConfig {
                    max_in_flight: config.performance.parallel_workers,
                    ..AdjudicatorConfig::default()
                },
            ))
        });
        let engine = Arc::new(DecisionEngine::new(
            config.rules.clone(),
            decision_cache,
            adjudicator,
        ));

        let mut pipeline = RowPipeline::new(
            config.clone(),
            navigator,
            extractor,
            engine,
            collector.clone(),
            self.capabilities.browser.clone(),
        );
        if caching.dom_snapshots {
            pipeline = pipeline.with_dom_cache(Arc::new(DomSnapshotCache::with_ttl_secs(
                caching.ttl_secs,
            )));
        }

        let mut scheduler = Scheduler::new(config.clone(), Arc::new(pipeline), registry, collector);
        if let Some(progress) = &self.progress {
            scheduler = scheduler.with_progress(progress.clone());
        }
        if let Some(events) = &self.events {
            scheduler = scheduler.with_events(events.clone());
        }

        let output = scheduler.run(rows, cancel).await;
        Ok(RunReport::build(output, config))
    }
}

/// Map a runner outcome onto the CLI exit-code convention: 0 completed,
/// 1 config invalid, 2 unrecoverable runtime error, 130 cancelled.
pub fn exit_code(result: &Result<RunReport>) -> i32 {
    match result {
        Ok(report) => report.status.exit_code(),
        Err(Error::Config(_)) => 1,
        Err(_) => 2,
    }
}
