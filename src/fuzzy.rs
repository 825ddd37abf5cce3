//! Deterministic similarity scoring over already-normalized values.
//!
//! Scores are pure functions of their inputs: same pair in, same score
//! out, and `score(a, b) == score(b, a)`. The decision cache and the
//! reproducibility tie-break both depend on this.

use serde::{Deserialize, Serialize};
use strsim::{jaro_winkler, normalized_levenshtein};

use crate::config::FuzzyRules;
use crate::normalize::Normalized;

/// Similarity algorithms; the configured list is applied in order and
/// the maximum score over enabled algorithms wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FuzzyAlgorithm {
    /// Edit-distance ratio
    Levenshtein,
    /// Prefix-weighted Jaro similarity
    JaroWinkler,
}

impl FuzzyAlgorithm {
    /// Score two strings in [0, 1].
    pub fn score(&self, a: &str, b: &str) -> f64 {
        match self {
            Self::Levenshtein => normalized_levenshtein(a, b),
            Self::JaroWinkler => jaro_winkler(a, b),
        }
    }
}

/// Outcome of a fuzzy comparison.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FuzzyOutcome {
    pub matched: bool,
    /// Decision confidence in [0, 1]
    pub confidence: f64,
    /// Raw similarity score in [0, 1]
    pub score: f64,
}

/// Confidence assigned to tolerance-based (number/date) matches; below
/// exact-equality confidence, above the fuzzy string threshold.
const TOLERANCE_MATCH_CONFIDENCE: f64 = 0.9;
const TOLERANCE_MISMATCH_CONFIDENCE: f64 = 0.1;

/// Deterministic fuzzy comparator configured from `rules.fuzzy`.
#[derive(Debug, Clone)]
pub struct FuzzyComparator {
    rules: FuzzyRules,
}

impl FuzzyComparator {
    pub fn new(rules: FuzzyRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &FuzzyRules {
        &self.rules
    }

    /// Maximum similarity over the enabled algorithms.
    pub fn string_score(&self, a: &str, b: &str) -> f64 {
        let (a, b) = self.prepare(a, b);
        self.rules
            .algorithms
            .iter()
            .map(|alg| alg.score(&a, &b))
            .fold(0.0, f64::max)
    }

    fn prepare(&self, a: &str, b: &str) -> (String, String) {
        let mut a = a.to_string();
        let mut b = b.to_string();
        if self.rules.case_insensitive {
            a = a.to_lowercase();
            b = b.to_lowercase();
        }
        if self.rules.ignore_whitespace {
            a.retain(|c| !c.is_whitespace());
            b.retain(|c| !c.is_whitespace());
        }
        (a, b)
    }

    /// Compare two normalized strings against the configured threshold.
    ///
    /// A score at or above the threshold matches with the score as
    /// confidence; below it, confidence is `1 - score` clamped to
    /// [0, 0.5] so a near-miss never looks like a confident rejection.
    pub fn compare_strings(&self, a: &str, b: &str) -> FuzzyOutcome {
        let score = self.string_score(a, b);
        let threshold = self.rules.string_similarity_threshold;
        if score >= threshold {
            FuzzyOutcome {
                matched: true,
                confidence: score,
                score,
            }
        } else {
            FuzzyOutcome {
                matched: false,
                confidence: (1.0 - score).clamp(0.0, 0.5),
                score,
            }
        }
    }

    /// Numbers match when within the configured tolerance.
    pub fn compare_numbers(&self, a: f64, b: f64) -> FuzzyOutcome {
        let matched = (a - b).abs() <= self.rules.number_tolerance;
        FuzzyOutcome {
            matched,
            confidence: if matched {
                TOLERANCE_MATCH_CONFIDENCE
            } else {
                TOLERANCE_MISMATCH_CONFIDENCE
            },
            score: if matched { 1.0 } else { 0.0 },
        }
    }

    /// Dates match when equal at day resolution.
    pub fn compare_dates(&self, a: chrono::NaiveDate, b: chrono::NaiveDate) -> FuzzyOutcome {
        let matched = a == b;
        FuzzyOutcome {
            matched,
            confidence: if matched {
                TOLERANCE_MATCH_CONFIDENCE
            } else {
                TOLERANCE_MISMATCH_CONFIDENCE
            },
            score: if matched { 1.0 } else { 0.0 },
        }
    }

    /// Dispatch on the normalized value shapes. Mixed shapes fall back
    /// to string comparison of their canonical forms.
    pub fn compare(&self, a: &Normalized, b: &Normalized) -> FuzzyOutcome {
        match (a, b) {
            (Normalized::Number { value: x }, Normalized::Number { value: y }) => {
                self.compare_numbers(*x, *y)
            }
            (Normalized::Date { date: x, .. }, Normalized::Date { date: y, .. }) => {
                self.compare_dates(*x, *y)
            }
            (Normalized::Bool { value: x }, Normalized::Bool { value: y }) => FuzzyOutcome {
                matched: x == y,
                confidence: if x == y { 1.0 } else { 0.0 },
                score: if x == y { 1.0 } else { 0.0 },
            },
            _ => self.compare_strings(&a.as_string(), &b.as_string()),
        }
    }
}

impl Default for FuzzyComparator {
    fn default() -> Self {
        Self::new(FuzzyRules::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comparator() -> FuzzyComparator {
        FuzzyComparator::default()
    }

    #[test]
    fn test_identical_strings_score_one() {
        let c = comparator();
        assert_eq!(c.string_score("Herman Melville", "Herman Melville"), 1.0);
    }

    #[test]
    fn test_score_is_symmetric() {
        let c = comparator();
        let ab = c.string_score("Melville, Herman", "Herman Melville");
        let ba = c.string_score("Herman Melville", "Melville, Herman");
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_max_over_algorithms() {
        let c = comparator();
        let combined = c.string_score("Radhika Apte", "Radika Apte");
        let lev = FuzzyAlgorithm::Levenshtein.score("radhikaapte", "radikaapte");
        let jw = FuzzyAlgorithm::JaroWinkler.score("radhikaapte", "radikaapte");
        assert!((combined - lev.max(jw)).abs() < 1e-12);
    }

    #[test]
    fn test_near_match_above_threshold() {
        let c = comparator();
        let outcome = c.compare_strings("Herman Melville", "Herman Melvile");
        assert!(outcome.matched);
        assert!(outcome.confidence >= 0.8);
        assert_eq!(outcome.confidence, outcome.score);
    }

    #[test]
    fn test_mismatch_confidence_is_bounded() {
        let c = comparator();
        let outcome = c.compare_strings("Herman Melville", "Jane Austen");
        assert!(!outcome.matched);
        assert!(outcome.confidence <= 0.5);
        assert!(outcome.confidence >= 0.0);
    }

    #[test]
    fn test_case_and_whitespace_insensitivity() {
        let c = comparator();
        assert_eq!(c.string_score("Herman  Melville", "herman melville"), 1.0);
    }

    #[test]
    fn test_number_tolerance() {
        let c = comparator();
        assert!(c.compare_numbers(10.0, 10.0005).matched);
        assert!(!c.compare_numbers(10.0, 10.1).matched);
    }

    #[test]
    fn test_date_day_resolution() {
        let c = comparator();
        let a = chrono::NaiveDate::from_ymd_opt(1851, 10, 18).unwrap();
        let b = chrono::NaiveDate::from_ymd_opt(1851, 10, 18).unwrap();
        let other = chrono::NaiveDate::from_ymd_opt(1851, 10, 19).unwrap();
        assert!(c.compare_dates(a, b).matched);
        assert!(!c.compare_dates(a, other).matched);
    }

    #[test]
    fn test_mixed_shapes_compare_as_strings() {
        let c = comparator();
        let n = Normalized::Number { value: 1851.0 };
        let t = Normalized::Text {
            value: "1851".to_string(),
        };
        let outcome = c.compare(&n, &t);
        assert!(outcome.matched);
    }
}
