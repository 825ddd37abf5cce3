//! Pure value canonicalization per declared field type.
//!
//! Normalization never panics and never returns a Rust error: ill-typed
//! input yields a tagged `NormalizeFailure` the decision engine surfaces
//! as an issue. Given identical inputs the output is always identical,
//! which the decision cache and the test suite both rely on.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::config::{CasePolicy, NormalizationPolicy};
use crate::types::{CellValue, FieldType};

/// A successfully canonicalized value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Normalized {
    Text { value: String },
    Number { value: f64 },
    Bool { value: bool },
    Date { date: NaiveDate, formatted: String },
}

impl Normalized {
    /// Canonical string form, as stored on decisions and in evidence.
    pub fn as_string(&self) -> String {
        match self {
            Self::Text { value } => value.clone(),
            Self::Number { value } => {
                if value.fract() == 0.0 && value.abs() < 1e15 {
                    format!("{}", *value as i64)
                } else {
                    format!("{value}")
                }
            }
            Self::Bool { value } => value.to_string(),
            Self::Date { formatted, .. } => formatted.clone(),
        }
    }
}

/// Tagged normalization failure; carried into decision issues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizeFailure {
    pub reason: String,
}

impl NormalizeFailure {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Outcome of normalization; the `Err` arm is a tagged failure, not a
/// process error.
pub type NormalizeOutcome = std::result::Result<Normalized, NormalizeFailure>;

/// Normalize a raw string under the policy for the given field type.
pub fn normalize(raw: &str, field_type: FieldType, policy: &NormalizationPolicy) -> NormalizeOutcome {
    let cleaned = clean_text(raw, field_type, policy);

    match field_type {
        FieldType::Number | FieldType::Currency => parse_number(&cleaned, policy),
        FieldType::Date => parse_date(&cleaned, policy),
        FieldType::Boolean => parse_bool(&cleaned),
        FieldType::Phone => Ok(Normalized::Text {
            value: canonical_phone(&cleaned),
        }),
        FieldType::Text | FieldType::Email | FieldType::Name | FieldType::Address => {
            Ok(Normalized::Text { value: cleaned })
        }
    }
}

/// Normalize an input-table cell. Absent cells are a tagged failure so
/// the decision engine can report them.
pub fn normalize_cell(
    cell: &CellValue,
    field_type: FieldType,
    policy: &NormalizationPolicy,
) -> NormalizeOutcome {
    match cell {
        CellValue::Absent => Err(NormalizeFailure::new("value absent")),
        CellValue::Bool(b) if field_type == FieldType::Boolean => {
            Ok(Normalized::Bool { value: *b })
        }
        CellValue::Number(n) if field_type.is_numeric() => {
            if n.is_finite() {
                Ok(Normalized::Number { value: *n })
            } else {
                Err(NormalizeFailure::new("number is not finite"))
            }
        }
        other => match other.as_text() {
            Some(text) => normalize(&text, field_type, policy),
            None => Err(NormalizeFailure::new("value absent")),
        },
    }
}

/// Shared text pipeline: whitespace, then case, then special characters.
fn clean_text(raw: &str, field_type: FieldType, policy: &NormalizationPolicy) -> String {
    let mut text = raw.to_string();

    let ws = &policy.whitespace;
    if ws.trim_leading {
        text = text.trim_start().to_string();
    }
    if ws.trim_trailing {
        text = text.trim_end().to_string();
    }
    if ws.collapse_internal {
        text = collapse_whitespace(&text);
    }

    text = match policy.case_for(field_type) {
        CasePolicy::Lowercase => text.to_lowercase(),
        CasePolicy::Uppercase => text.to_uppercase(),
        CasePolicy::TitleCase => title_case(&text),
        CasePolicy::Preserve => text,
    };

    let special = &policy.special_chars;
    if special.strip_accents {
        text = strip_accents(&text);
    }
    if special.unify_quotes {
        text = unify_quotes(&text);
    }
    if special.unify_dashes {
        text = unify_dashes(&text);
    }

    text
}

fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_space = false;
    for ch in text.chars() {
        if ch.is_whitespace() {
            if !in_space {
                out.push(' ');
            }
            in_space = true;
        } else {
            out.push(ch);
            in_space = false;
        }
    }
    out
}

fn title_case(text: &str) -> String {
    text.split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => {
                    first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Unicode decomposition followed by combining-mark removal.
fn strip_accents(text: &str) -> String {
    text.nfd().filter(|c| !is_combining_mark(*c)).collect()
}

fn unify_quotes(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{2032}' => '\'',
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{2033}' => '"',
            other => other,
        })
        .collect()
}

fn unify_dashes(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '\u{2010}' | '\u{2011}' | '\u{2012}' | '\u{2013}' | '\u{2014}' | '\u{2015}'
            | '\u{2212}' => '-',
            other => other,
        })
        .collect()
}

/// Digits plus a leading `+`; everything else is punctuation noise.
fn canonical_phone(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for (i, ch) in text.chars().enumerate() {
        if ch.is_ascii_digit() {
            out.push(ch);
        } else if ch == '+' && i == 0 {
            out.push(ch);
        }
    }
    out
}

const CURRENCY_SYMBOLS: &[char] = &['$', '€', '£', '¥', '₹', '₩', '¢'];

fn parse_number(cleaned: &str, policy: &NormalizationPolicy) -> NormalizeOutcome {
    let numbers = &policy.numbers;
    let mut text = cleaned.to_string();

    if numbers.strip_currency_symbols {
        text = text
            .chars()
            .filter(|c| !CURRENCY_SYMBOLS.contains(c))
            .collect::<String>()
            .trim()
            .to_string();
    }

    // Thousand separators go away entirely; the decimal separator becomes '.'
    text = text
        .chars()
        .filter(|c| *c != numbers.thousand_separator)
        .map(|c| {
            if c == numbers.decimal_separator {
                '.'
            } else {
                c
            }
        })
        .collect();

    match text.trim().parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(Normalized::Number { value }),
        Ok(_) => Err(NormalizeFailure::new("number is not finite")),
        Err(_) => Err(NormalizeFailure::new(format!(
            "not a number after stripping: '{}'",
            text.trim()
        ))),
    }
}

fn parse_date(cleaned: &str, policy: &NormalizationPolicy) -> NormalizeOutcome {
    let dates = &policy.dates;
    for format in &dates.accepted_input_formats {
        if let Ok(date) = NaiveDate::parse_from_str(cleaned, format) {
            return Ok(Normalized::Date {
                date,
                formatted: date.format(&dates.target_format).to_string(),
            });
        }
    }
    Err(NormalizeFailure::new(format!(
        "'{cleaned}' matched none of {} accepted date formats",
        dates.accepted_input_formats.len()
    )))
}

fn parse_bool(cleaned: &str) -> NormalizeOutcome {
    match cleaned.to_lowercase().as_str() {
        "true" | "yes" | "y" | "1" | "checked" | "on" => Ok(Normalized::Bool { value: true }),
        "false" | "no" | "n" | "0" | "unchecked" | "off" | "" => {
            Ok(Normalized::Bool { value: false })
        }
        other => Err(NormalizeFailure::new(format!("not a boolean: '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpecialCharsPolicy;
    use pretty_assertions::assert_eq;

    fn policy() -> NormalizationPolicy {
        NormalizationPolicy::default()
    }

    fn text_of(outcome: NormalizeOutcome) -> String {
        outcome.expect("normalization should succeed").as_string()
    }

    #[test]
    fn test_whitespace_pipeline_order() {
        let out = normalize("  Herman   Melville  ", FieldType::Text, &policy());
        assert_eq!(text_of(out), "Herman Melville");
    }

    #[test]
    fn test_email_lowercases_by_default() {
        let out = normalize("  Ahab@Pequod.SEA ", FieldType::Email, &policy());
        assert_eq!(text_of(out), "ahab@pequod.sea");
    }

    #[test]
    fn test_name_title_cases_by_default() {
        let out = normalize("herman MELVILLE", FieldType::Name, &policy());
        assert_eq!(text_of(out), "Herman Melville");
    }

    #[test]
    fn test_accent_stripping() {
        let mut policy = policy();
        policy.special_chars = SpecialCharsPolicy {
            strip_accents: true,
            unify_quotes: true,
            unify_dashes: true,
        };
        let out = normalize("Café Révolution", FieldType::Text, &policy);
        assert_eq!(text_of(out), "Cafe Revolution");
    }

    #[test]
    fn test_quote_and_dash_unification() {
        let out = normalize("\u{201C}Moby\u{2010}Dick\u{201D}", FieldType::Text, &policy());
        assert_eq!(text_of(out), "\"Moby-Dick\"");
    }

    #[test]
    fn test_currency_parsing() {
        let out = normalize("$1,234.56", FieldType::Currency, &policy());
        assert_eq!(out, Ok(Normalized::Number { value: 1234.56 }));
    }

    #[test]
    fn test_number_rejects_garbage() {
        let out = normalize("not a price", FieldType::Number, &policy());
        assert!(out.is_err());
    }

    #[test]
    fn test_european_separators() {
        let mut policy = policy();
        policy.numbers.decimal_separator = ',';
        policy.numbers.thousand_separator = '.';
        let out = normalize("1.234,56", FieldType::Number, &policy);
        assert_eq!(out, Ok(Normalized::Number { value: 1234.56 }));
    }

    #[test]
    fn test_date_first_matching_format_wins() {
        let out = normalize("18/10/1851", FieldType::Date, &policy()).unwrap();
        match out {
            Normalized::Date { formatted, .. } => assert_eq!(formatted, "1851-10-18"),
            other => panic!("expected date, got {other:?}"),
        }
    }

    #[test]
    fn test_date_rejects_unknown_format() {
        let out = normalize("18th of October", FieldType::Date, &policy());
        assert!(out.is_err());
    }

    #[test]
    fn test_boolean_variants() {
        assert_eq!(
            normalize("Yes", FieldType::Boolean, &policy()),
            Ok(Normalized::Bool { value: true })
        );
        assert_eq!(
            normalize("off", FieldType::Boolean, &policy()),
            Ok(Normalized::Bool { value: false })
        );
        assert!(normalize("maybe", FieldType::Boolean, &policy()).is_err());
    }

    #[test]
    fn test_phone_canonicalization() {
        let out = normalize("+1 (555) 123-4567", FieldType::Phone, &policy());
        assert_eq!(text_of(out), "+15551234567");
    }

    #[test]
    fn test_absent_cell_is_tagged_failure() {
        let out = normalize_cell(&CellValue::Absent, FieldType::Text, &policy());
        assert_eq!(out.unwrap_err().reason, "value absent");
    }

    #[test]
    fn test_idempotence_on_text() {
        let p = policy();
        let once = text_of(normalize("  herman   MELVILLE ", FieldType::Name, &p));
        let twice = text_of(normalize(&once, FieldType::Name, &p));
        assert_eq!(once, twice);
    }

    #[test]
    fn test_idempotence_on_dates() {
        let p = policy();
        let once = text_of(normalize("18/10/1851", FieldType::Date, &p));
        let twice = text_of(normalize(&once, FieldType::Date, &p));
        assert_eq!(once, twice);
    }
}
