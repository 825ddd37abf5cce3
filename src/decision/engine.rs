//! The field decision ladder.
//!
//! Per field: normalize both sides, try exact equality, fall back to
//! fuzzy similarity, and for hybrid fields below the field threshold
//! escalate to the LLM adjudicator. Ties between fuzzy and LLM resolve
//! toward the deterministic fuzzy verdict so reruns reproduce.

use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::cache::{CachedVerdict, DecisionCache, DecisionCacheKey, ISSUE_CACHE_HIT};
use crate::config::Rules;
use crate::fuzzy::FuzzyComparator;
use crate::llm::{AdjudicationRequest, Adjudicator};
use crate::normalize::{normalize, normalize_cell, Normalized};
use crate::types::{CellValue, ExtractedField, FieldDecision, FieldMapping, Method, Strategy};

/// Hard ceiling on the confidence of any OCR-sourced decision.
const OCR_CONFIDENCE_CAP: f64 = 0.8;

/// Confidence for raw (pre-normalization) equality.
const RAW_EQUALITY_CONFIDENCE: f64 = 1.0;
/// Confidence for equality reached only after normalization.
const NORMALIZED_EQUALITY_CONFIDENCE: f64 = 0.95;

/// Agreement band: when fuzzy and LLM agree and score within this, the
/// deterministic verdict is kept.
const AGREEMENT_BAND: f64 = 0.05;
/// Disagreement band: when fuzzy and LLM disagree within this, fuzzy
/// wins for reproducibility.
const DISAGREEMENT_BAND: f64 = 0.1;

/// Combines normalization, fuzzy scoring, and optional LLM judgment
/// into field decisions.
pub struct DecisionEngine {
    rules: Rules,
    comparator: FuzzyComparator,
    cache: Option<Arc<DecisionCache>>,
    adjudicator: Option<Arc<Adjudicator>>,
    ruleset_version: String,
}

impl DecisionEngine {
    /// Build an engine. `cache: None` disables caching; `adjudicator:
    /// None` disables LLM escalation.
    pub fn new(
        rules: Rules,
        cache: Option<Arc<DecisionCache>>,
        adjudicator: Option<Arc<Adjudicator>>,
    ) -> Self {
        let comparator = FuzzyComparator::new(rules.fuzzy.clone());
        let ruleset_version = ruleset_version(&rules);
        Self {
            rules,
            comparator,
            cache,
            adjudicator,
            ruleset_version,
        }
    }

    /// Decide one field.
    pub async fn decide(
        &self,
        mapping: &FieldMapping,
        csv_cell: &CellValue,
        extracted: &ExtractedField,
        cancel: &CancellationToken,
    ) -> FieldDecision {
        let csv_raw = csv_cell.as_text();
        let web_raw = extracted.raw_value.clone();
        let policy = &self.rules.normalization;

        let norm_csv = normalize_cell(csv_cell, mapping.field_type, policy);
        let norm_web = match &web_raw {
            Some(raw) => normalize(raw, mapping.field_type, policy),
            None => Err(crate::normalize::NormalizeFailure {
                reason: "no value extracted".to_string(),
            }),
        };

        // A failed normalization short-circuits the ladder.
        let (norm_csv, norm_web) = match (norm_csv, norm_web) {
            (Ok(c), Ok(w)) => (c, w),
            (csv, web) => {
                let mut issues = Vec::new();
                let mut reasons = Vec::new();
                if let Err(failure) = &csv {
                    issues.push(format!("csv_normalization_failed: {}", failure.reason));
                    reasons.push(format!("CSV value unusable ({})", failure.reason));
                }
                if let Err(failure) = &web {
                    issues.push(format!("web_normalization_failed: {}", failure.reason));
                    reasons.push(format!("web value unusable ({})", failure.reason));
                }
                return FieldDecision {
                    csv_field: mapping.csv_field.clone(),
                    csv_value: csv_raw,
                    web_value: web_raw,
                    normalized_csv: csv.ok().map(|n| n.as_string()),
                    normalized_web: web.ok().map(|n| n.as_string()),
                    matched: false,
                    confidence: 0.0,
                    reasoning: reasons.join("; "),
                    method: extracted.method,
                    fuzzy_score: None,
                    issues,
                    llm_raw_response: None,
                };
            }
        };

        let ncsv_str = norm_csv.as_string();
        let nweb_str = norm_web.as_string();

        // Cache replay before any comparison work.
        let cache_key = DecisionCacheKey::generate(
            &ncsv_str,
            &nweb_str,
            &format!("{:?}", mapping.field_type),
            &self.ruleset_version,
        );
        if let Some(cache) = &self.cache {
            if let Some(verdict) = cache.get(&cache_key).await {
                debug!(field = %mapping.csv_field, key = %cache_key, "decision cache hit");
                return self.assemble(
                    mapping,
                    csv_raw,
                    web_raw,
                    &ncsv_str,
                    &nweb_str,
                    verdict,
                    vec![ISSUE_CACHE_HIT.to_string()],
                    None,
                    extracted,
                );
            }
        }

        let mut issues = Vec::new();
        let mut llm_raw = None;

        // Exact equality, raw first then normalized.
        let raw_equal = matches!((&csv_raw, &web_raw), (Some(a), Some(b)) if a == b);
        let verdict = if raw_equal || norm_csv == norm_web {
            CachedVerdict {
                matched: true,
                confidence: if raw_equal {
                    RAW_EQUALITY_CONFIDENCE
                } else {
                    NORMALIZED_EQUALITY_CONFIDENCE
                },
                reasoning: if raw_equal {
                    "values are identical".to_string()
                } else {
                    "values equal after normalization".to_string()
                },
                method: extracted.method,
                fuzzy_score: None,
            }
        } else if !self.rules.fuzzy.enabled
            && matches!(
                (&norm_csv, &norm_web),
                (Normalized::Text { .. }, Normalized::Text { .. })
            )
        {
            // String fuzziness is off; unequal text is a confident
            // mismatch. Number and date tolerance still apply below.
            CachedVerdict {
                matched: false,
                confidence: 0.9,
                reasoning: "values differ (fuzzy matching disabled)".to_string(),
                method: extracted.method,
                fuzzy_score: None,
            }
        } else {
            let fuzzy = self.comparator.compare(&norm_csv, &norm_web);
            let mut verdict = CachedVerdict {
                matched: fuzzy.matched,
                confidence: fuzzy.confidence,
                reasoning: format!(
                    "fuzzy similarity {:.3} vs threshold {:.2}",
                    fuzzy.score, self.rules.fuzzy.string_similarity_threshold
                ),
                method: Method::Fuzzy,
                fuzzy_score: Some(fuzzy.score),
            };

            // Hybrid fields below the field threshold escalate to the LLM.
            let escalate = mapping.strategy == Strategy::Hybrid
                && verdict.confidence < self.rules.confidence.minimum_field;
            if escalate {
                if let Some(adjudicator) = &self.adjudicator {
                    let request = AdjudicationRequest {
                        csv_value: ncsv_str.clone(),
                        web_value: nweb_str.clone(),
                        field_type: mapping.field_type,
                        field_name: mapping.csv_field.clone(),
                    };
                    let outcome = adjudicator
                        .adjudicate(request, ncsv_str == nweb_str, cancel)
                        .await;
                    issues.extend(outcome.issues.clone());
                    llm_raw = outcome.raw_response.clone();

                    if llm_wins(&verdict, outcome.matched, outcome.confidence) {
                        verdict = CachedVerdict {
                            matched: outcome.matched,
                            confidence: outcome.confidence,
                            reasoning: outcome.reasoning,
                            method: Method::Llm,
                            fuzzy_score: verdict.fuzzy_score,
                        };
                    }
                }
            }
            verdict
        };

        if let Some(cache) = &self.cache {
            cache.insert(cache_key, verdict.clone()).await;
        }

        self.assemble(
            mapping, csv_raw, web_raw, &ncsv_str, &nweb_str, verdict, issues, llm_raw, extracted,
        )
    }

    /// Build the final decision, remapping extraction-origin methods to
    /// the current extraction and applying the OCR confidence cap.
    #[allow(clippy::too_many_arguments)]
    fn assemble(
        &self,
        mapping: &FieldMapping,
        csv_value: Option<String>,
        web_value: Option<String>,
        normalized_csv: &str,
        normalized_web: &str,
        verdict: CachedVerdict,
        issues: Vec<String>,
        llm_raw_response: Option<String>,
        extracted: &ExtractedField,
    ) -> FieldDecision {
        let method = match verdict.method {
            Method::Dom | Method::Ocr | Method::Manual => extracted.method,
            other => other,
        };

        let mut confidence = verdict.confidence;
        if extracted.method == Method::Ocr {
            confidence = confidence
                .min(extracted.confidence)
                .min(OCR_CONFIDENCE_CAP);
        }

        FieldDecision {
            csv_field: mapping.csv_field.clone(),
            csv_value,
            web_value,
            normalized_csv: Some(normalized_csv.to_string()),
            normalized_web: Some(normalized_web.to_string()),
            matched: verdict.matched,
            confidence,
            reasoning: verdict.reasoning,
            method,
            fuzzy_score: verdict.fuzzy_score,
            issues,
            llm_raw_response,
        }
    }
}

/// Whether the LLM verdict displaces the fuzzy one.
///
/// Agreement within the agreement band keeps the deterministic verdict;
/// disagreement within the disagreement band also keeps it
/// (reproducibility); otherwise the better-scored verdict wins.
fn llm_wins(fuzzy: &CachedVerdict, llm_matched: bool, llm_confidence: f64) -> bool {
    let diff = (fuzzy.confidence - llm_confidence).abs();
    if fuzzy.matched == llm_matched {
        diff > AGREEMENT_BAND && llm_confidence > fuzzy.confidence
    } else {
        diff > DISAGREEMENT_BAND && llm_confidence > fuzzy.confidence
    }
}

/// Stable fingerprint of the ruleset, part of every cache key.
fn ruleset_version(rules: &Rules) -> String {
    let serialized = serde_json::to_string(&json!({
        "confidence": rules.confidence,
        "fuzzy": rules.fuzzy,
        "normalization": rules.normalization,
    }))
    .unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    format!("{:x}", hasher.finalize())[..16].to_string()
}
