//! Field extraction from a loaded page.
//!
//! DOM first: locate the selector (with derived fallbacks), read the
//! canonical value, normalize it, and score confidence. When the DOM
//! result is weak and the mapping allows OCR, a clipped screenshot goes
//! through the OCR engine and the higher-confidence result wins. Both
//! attempts are kept for the evidence bundle.

use regex::Regex;
use std::sync::Arc;
use std::sync::OnceLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::browser::{BrowserDriver, ElementHandle};
use crate::config::NormalizationPolicy;
use crate::error::{ErrorKind, StageError, StageResult};
use crate::normalize::normalize;
use crate::ocr::{OcrCache, OcrEngine, OcrOptions, OcrRecognition};
use crate::types::{ExtractedField, FieldMapping, FieldType, Method, Screenshot};

/// Margin in pixels added around an element before clipping its
/// screenshot.
const SCREENSHOT_MARGIN_PX: f64 = 10.0;

/// Ceiling on OCR-sourced extraction confidence.
const OCR_CONFIDENCE_CAP: f64 = 0.8;

/// Confidence for a non-empty DOM value.
const DOM_VALUE_CONFIDENCE: f64 = 0.9;
/// Confidence when the element exists but its value is empty.
const DOM_EMPTY_CONFIDENCE: f64 = 0.3;

/// Result of extracting one field, with both attempts retained.
#[derive(Debug)]
pub struct FieldExtraction {
    /// The winning extraction
    pub extracted: ExtractedField,
    /// DOM attempt, always present
    pub dom_attempt: ExtractedField,
    /// OCR attempt, when the fallback ran
    pub ocr_attempt: Option<ExtractedField>,
    /// Element (or viewport) screenshot captured for OCR
    pub element_screenshot: Option<Screenshot>,
}

/// Extracts mapped fields from the currently loaded page.
pub struct PageExtractor {
    browser: Arc<dyn BrowserDriver>,
    ocr: Option<Arc<dyn OcrEngine>>,
    ocr_cache: Option<Arc<OcrCache>>,
    policy: NormalizationPolicy,
    /// Extraction confidence below which the OCR fallback triggers
    ocr_fallback_threshold: f64,
}

impl PageExtractor {
    pub fn new(
        browser: Arc<dyn BrowserDriver>,
        ocr: Option<Arc<dyn OcrEngine>>,
        policy: NormalizationPolicy,
        ocr_fallback_threshold: f64,
    ) -> Self {
        Self {
            browser,
            ocr,
            ocr_cache: None,
            policy,
            ocr_fallback_threshold,
        }
    }

    /// Cache recognitions by image content; duplicate clips skip the
    /// engine.
    pub fn with_ocr_cache(mut self, cache: Arc<OcrCache>) -> Self {
        self.ocr_cache = Some(cache);
        self
    }

    /// Extract one mapped field.
    ///
    /// Never fails for a missing element; that surfaces as a
    /// confidence-0 extraction the decision engine turns into a
    /// mismatch. The only error is cancellation.
    #[instrument(skip(self, cancel), fields(field = %mapping.csv_field))]
    pub async fn extract_field(
        &self,
        mapping: &FieldMapping,
        cancel: &CancellationToken,
    ) -> StageResult<FieldExtraction> {
        if cancel.is_cancelled() {
            return Err(StageError::new(ErrorKind::Cancelled, "extraction cancelled"));
        }

        let handle = self.locate(&mapping.web_selector).await;
        let dom_attempt = self.read_dom(mapping, handle.as_ref()).await;

        let mut ocr_attempt = None;
        let mut element_screenshot = None;

        let wants_ocr = dom_attempt.confidence < self.ocr_fallback_threshold
            && mapping.strategy.ocr_enabled();
        if wants_ocr {
            if let Some(ocr) = &self.ocr {
                if cancel.is_cancelled() {
                    return Err(StageError::new(ErrorKind::Cancelled, "extraction cancelled"));
                }
                let region = handle
                    .as_ref()
                    .and_then(|h| h.bounding_box)
                    .map(|b| b.with_margin(SCREENSHOT_MARGIN_PX));
                match self.browser.screenshot_region(region).await {
                    Ok(bytes) => {
                        let shot = Screenshot::element(bytes, region);
                        match self.recognize(ocr, &shot.bytes).await {
                            Ok(recognition) => {
                                ocr_attempt = self.read_ocr(mapping, &recognition);
                            }
                            Err(err) => {
                                debug!(error = %err, "OCR recognition failed; keeping DOM result");
                            }
                        }
                        element_screenshot = Some(shot);
                    }
                    Err(err) => {
                        debug!(error = %err, "element screenshot failed; skipping OCR");
                    }
                }
            }
        }

        let extracted = match &ocr_attempt {
            Some(ocr) if ocr.confidence > dom_attempt.confidence => ocr.clone(),
            _ => dom_attempt.clone(),
        };

        Ok(FieldExtraction {
            extracted,
            dom_attempt,
            ocr_attempt,
            element_screenshot,
        })
    }

    /// Recognize through the cache when one is configured.
    async fn recognize(
        &self,
        ocr: &Arc<dyn OcrEngine>,
        image: &[u8],
    ) -> crate::error::Result<OcrRecognition> {
        let options = OcrOptions::default();
        let key = self
            .ocr_cache
            .as_ref()
            .map(|_| OcrCache::key(image, &options.language));

        if let (Some(cache), Some(key)) = (&self.ocr_cache, &key) {
            if let Some(recognition) = cache.get(key).await {
                debug!("OCR cache hit");
                return Ok(recognition);
            }
        }

        let recognition = ocr.recognize(image, &options).await?;
        if let (Some(cache), Some(key)) = (&self.ocr_cache, key) {
            cache.insert(key, recognition.clone()).await;
        }
        Ok(recognition)
    }

    /// Try the declared selector, then derived fallbacks.
    async fn locate(&self, selector: &str) -> Option<ElementHandle> {
        if let Ok(Some(handle)) = self.browser.query_selector(selector).await {
            return Some(handle);
        }
        for fallback in derive_fallback_selectors(selector) {
            debug!(%selector, %fallback, "trying fallback selector");
            if let Ok(Some(handle)) = self.browser.query_selector(&fallback).await {
                return Some(handle);
            }
        }
        None
    }

    async fn read_dom(
        &self,
        mapping: &FieldMapping,
        handle: Option<&ElementHandle>,
    ) -> ExtractedField {
        let (raw_value, element_box) = match handle {
            Some(handle) => {
                let raw = self
                    .browser
                    .element_value(handle)
                    .await
                    .ok()
                    .map(|v| v.as_text());
                (raw, handle.bounding_box)
            }
            None => (None, None),
        };

        let normalized = raw_value
            .as_deref()
            .and_then(|raw| normalize(raw, mapping.field_type, &self.policy).ok())
            .map(|n| n.as_string());

        let confidence = match (handle, &normalized) {
            (Some(_), Some(value)) if !value.is_empty() => DOM_VALUE_CONFIDENCE,
            (Some(_), _) => DOM_EMPTY_CONFIDENCE,
            (None, _) => 0.0,
        };

        ExtractedField {
            csv_field: mapping.csv_field.clone(),
            raw_value,
            normalized_value: normalized,
            method: Method::Dom,
            confidence,
            element_box,
        }
    }

    /// Turn a recognition into an extraction, if a usable candidate
    /// exists.
    fn read_ocr(
        &self,
        mapping: &FieldMapping,
        recognition: &OcrRecognition,
    ) -> Option<ExtractedField> {
        let (text, confidence) =
            select_ocr_candidate(recognition, mapping.field_type, &mapping.csv_field)?;

        let normalized = normalize(&text, mapping.field_type, &self.policy)
            .ok()
            .map(|n| n.as_string());

        Some(ExtractedField {
            csv_field: mapping.csv_field.clone(),
            raw_value: Some(text),
            normalized_value: normalized,
            method: Method::Ocr,
            confidence: confidence.min(OCR_CONFIDENCE_CAP),
            element_box: None,
        })
    }
}

/// Derive fallback selectors from the declared one: id and class
/// selectors get attribute variants, which survive markup where the
/// shorthand form was rewritten.
pub fn derive_fallback_selectors(selector: &str) -> Vec<String> {
    let trimmed = selector.trim();
    if let Some(id) = trimmed.strip_prefix('#') {
        if !id.is_empty() && !id.contains([' ', '>', '.', '[']) {
            return vec![
                format!("[id=\"{id}\"]"),
                format!("[name=\"{id}\"]"),
                format!("[data-field=\"{id}\"]"),
            ];
        }
    }
    if let Some(class) = trimmed.strip_prefix('.') {
        if !class.is_empty() && !class.contains([' ', '>', '#', '[']) {
            return vec![
                format!("[class*=\"{class}\"]"),
                format!("[data-field=\"{class}\"]"),
            ];
        }
    }
    Vec::new()
}

fn email_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("static regex")
    })
}

fn phone_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\+?[0-9][0-9().\s-]{5,}[0-9]").expect("static regex"))
}

fn amount_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[$€£¥]?\s?-?\d{1,3}(?:[,.]\d{3})*(?:[.,]\d+)?").expect("static regex")
    })
}

/// Pick the OCR token or line to use for a field.
///
/// Typed fields (email/phone/currency/number) must match their pattern
/// or the OCR result is discarded. Freeform fields prefer the line
/// holding a recognized field label, then the highest-confidence word.
fn select_ocr_candidate(
    recognition: &OcrRecognition,
    field_type: FieldType,
    field_name: &str,
) -> Option<(String, f64)> {
    let text = recognition.text.as_str();

    let pattern = match field_type {
        FieldType::Email => Some(email_pattern()),
        FieldType::Phone => Some(phone_pattern()),
        FieldType::Currency | FieldType::Number => Some(amount_pattern()),
        _ => None,
    };

    if let Some(pattern) = pattern {
        let matched = pattern.find(text)?;
        let candidate = matched.as_str().trim().to_string();
        let confidence = recognition
            .words
            .iter()
            .filter(|w| candidate.contains(w.text.trim()) || w.text.contains(&candidate))
            .map(|w| w.confidence)
            .fold(recognition.confidence, f64::max);
        return Some((candidate, confidence));
    }

    // Label-adjacent line, when a line mentions the field name.
    let label = field_name.to_lowercase();
    for line in recognition.lines() {
        let lower = line.to_lowercase();
        if let Some(pos) = lower.find(&label) {
            let after = line[pos + label.len()..]
                .trim_start_matches([':', '=', ' ', '\t'])
                .trim();
            if !after.is_empty() {
                return Some((after.to_string(), recognition.confidence));
            }
        }
    }

    // Highest-confidence word, then the full first line.
    let best_word = recognition
        .words
        .iter()
        .filter(|w| !w.text.trim().is_empty())
        .max_by(|a, b| a.confidence.total_cmp(&b.confidence));
    if let Some(word) = best_word {
        // Prefer the whole line containing the best word so multi-word
        // values survive.
        let line = recognition
            .lines()
            .into_iter()
            .find(|l| l.contains(word.text.trim()))
            .unwrap_or(word.text.trim());
        return Some((line.to_string(), word.confidence));
    }

    let first_line = recognition.lines().first().map(|l| l.to_string())?;
    Some((first_line, recognition.confidence))
}
