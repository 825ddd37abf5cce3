//! Property-based tests for the deterministic core.
//!
//! These pin the invariants the rest of the system leans on:
//!
//! - normalization is idempotent
//! - fuzzy scoring is symmetric and reflexive
//! - mismatch confidence stays within its bound
//! - row aggregation is a pure function of the field decisions

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::config::{NormalizationPolicy, Rules};
    use crate::fuzzy::FuzzyComparator;
    use crate::normalize::normalize;
    use crate::pipeline::aggregate_decisions;
    use crate::types::{FieldDecision, FieldMapping, FieldType, Method, Strategy as FieldStrategy};

    // Strategy for printable text with some unicode noise.
    fn text_input() -> impl Strategy<Value = String> {
        proptest::string::string_regex("[ -~éàüñ\u{2018}\u{2019}\u{2013}\u{2014}]{0,40}")
            .expect("valid regex")
    }

    fn confidence() -> impl Strategy<Value = f64> {
        0.0f64..=1.0f64
    }

    fn decision(field: &str, matched: bool, confidence: f64) -> FieldDecision {
        FieldDecision {
            csv_field: field.to_string(),
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
        }
    }

    proptest! {
        /// Normalizing an already-normalized text value changes nothing.
        #[test]
        fn normalize_is_idempotent_for_text(raw in text_input()) {
            let policy = NormalizationPolicy::default();
            for field_type in [FieldType::Text, FieldType::Name, FieldType::Email, FieldType::Address] {
                if let Ok(once) = normalize(&raw, field_type, &policy) {
                    let twice = normalize(&once.as_string(), field_type, &policy)
                        .expect("normalized output must renormalize");
                    prop_assert_eq!(once.as_string(), twice.as_string());
                }
            }
        }

        /// Fuzzy scoring is symmetric.
        #[test]
        fn fuzzy_score_is_symmetric(a in text_input(), b in text_input()) {
            let comparator = FuzzyComparator::default();
            let ab = comparator.string_score(&a, &b);
            let ba = comparator.string_score(&b, &a);
            prop_assert!((ab - ba).abs() < 1e-12);
        }

        /// Every string scores 1.0 against itself.
        #[test]
        fn fuzzy_score_is_reflexive(a in text_input()) {
            let comparator = FuzzyComparator::default();
            prop_assert_eq!(comparator.string_score(&a, &a), 1.0);
        }

        /// Scores stay in [0, 1] and mismatch confidence in [0, 0.5].
        #[test]
        fn fuzzy_outcome_bounds(a in text_input(), b in text_input()) {
            let comparator = FuzzyComparator::default();
            let outcome = comparator.compare_strings(&a, &b);
            prop_assert!((0.0..=1.0).contains(&outcome.score));
            prop_assert!((0.0..=1.0).contains(&outcome.confidence));
            if !outcome.matched {
                prop_assert!(outcome.confidence <= 0.5);
            }
        }

        /// Row aggregation is reproducible from the decisions alone and
        /// the overall confidence is the minimum over required fields.
        #[test]
        fn aggregation_derivable_from_decisions(
            confidences in proptest::collection::vec(confidence(), 1..6),
            matches in proptest::collection::vec(any::<bool>(), 1..6),
        ) {
            let n = confidences.len().min(matches.len());
            let decisions: Vec<FieldDecision> = (0..n)
                .map(|i| decision(&format!("f{i}"), matches[i], confidences[i]))
                .collect();
            let mappings: Vec<FieldMapping> = (0..n)
                .map(|i| {
                    let mut m = FieldMapping::new(
                        format!("f{i}"),
                        "sel",
                        FieldType::Text,
                        FieldStrategy::Dom,
                    );
                    m.required = true;
                    m
                })
                .collect();
            let rules = Rules::default();

            let (matched_1, conf_1) = aggregate_decisions(&decisions, &mappings, &rules);
            let (matched_2, conf_2) = aggregate_decisions(&decisions, &mappings, &rules);
            prop_assert_eq!(matched_1, matched_2);
            prop_assert_eq!(conf_1, conf_2);

            let min = confidences[..n].iter().cloned().fold(f64::INFINITY, f64::min);
            prop_assert_eq!(conf_1, min);

            let all = matches[..n].iter().all(|m| *m);
            prop_assert_eq!(matched_1, all && conf_1 >= rules.confidence.minimum_overall);
        }
    }
}
