//! Tolerant parsing of adjudicator responses.
//!
//! Models wrap JSON in prose, code fences, labels, and near-JSON with
//! trailing commas or single quotes. Parsing proceeds through five
//! layers in order; exactly one layer produces the result. If all five
//! fail, a key-pattern text scrape recovers `match`, `confidence`, and
//! `reasoning` from free text. Every layer attempt is logged at debug
//! level.

use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;
use tracing::debug;

/// Which layer produced the parsed result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseLayer {
    /// Direct JSON parse of the whole response
    Direct,
    /// JSON extracted by brace matching
    BraceMatched,
    /// JSON inside a fenced code block
    CodeFence,
    /// JSON after a `result:` / `response:` label
    Labelled,
    /// JSON after common-error repair
    Repaired,
    /// Key-pattern scrape of free text
    TextScrape,
}

impl ParseLayer {
    /// Layers past `Direct` indicate the model strayed from the request
    /// contract; the decision engine records a parse warning for them.
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Direct)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::BraceMatched => "brace_matched",
            Self::CodeFence => "code_fence",
            Self::Labelled => "labelled",
            Self::Repaired => "repaired",
            Self::TextScrape => "text_scrape",
        }
    }
}

/// Parsed adjudication envelope.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ParsedAdjudication {
    #[serde(alias = "match", alias = "is_match")]
    pub matched: bool,
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default, alias = "normalizedCsv")]
    pub normalized_csv: Option<String>,
    #[serde(default, alias = "normalizedWeb")]
    pub normalized_web: Option<String>,
}

impl ParsedAdjudication {
    fn clamp(mut self) -> Self {
        self.confidence = self.confidence.clamp(0.0, 1.0);
        self
    }
}

/// Parse an adjudicator response through the layered strategy.
///
/// Returns the parsed envelope and the layer that produced it, or
/// `None` when even the text scrape finds nothing usable.
pub fn parse_adjudication(raw: &str) -> Option<(ParsedAdjudication, ParseLayer)> {
    // Layer 1: the response is exactly the JSON we asked for.
    debug!(layer = "direct", "attempting adjudication parse");
    if let Ok(parsed) = serde_json::from_str::<ParsedAdjudication>(raw.trim()) {
        return Some((parsed.clamp(), ParseLayer::Direct));
    }

    // Layer 2: JSON embedded in prose, recovered by brace matching.
    debug!(layer = "brace_matched", "attempting adjudication parse");
    if let Some(candidate) = brace_matched_json(raw) {
        if let Ok(parsed) = serde_json::from_str::<ParsedAdjudication>(candidate) {
            return Some((parsed.clamp(), ParseLayer::BraceMatched));
        }
    }

    // Layer 3: JSON inside a fenced code block.
    debug!(layer = "code_fence", "attempting adjudication parse");
    if let Some(candidate) = fenced_block(raw) {
        if let Ok(parsed) = serde_json::from_str::<ParsedAdjudication>(candidate.trim()) {
            return Some((parsed.clamp(), ParseLayer::CodeFence));
        }
    }

    // Layer 4: JSON after a label such as `result:` or `response:`.
    debug!(layer = "labelled", "attempting adjudication parse");
    if let Some(candidate) = labelled_json(raw) {
        if let Ok(parsed) = serde_json::from_str::<ParsedAdjudication>(candidate) {
            return Some((parsed.clamp(), ParseLayer::Labelled));
        }
    }

    // Layer 5: repair the most common JSON mistakes and retry.
    debug!(layer = "repaired", "attempting adjudication parse");
    if let Some(candidate) = brace_matched_json(raw).or_else(|| fenced_block(raw)) {
        let repaired = repair_json(candidate);
        if let Ok(parsed) = serde_json::from_str::<ParsedAdjudication>(&repaired) {
            return Some((parsed.clamp(), ParseLayer::Repaired));
        }
    }

    // Last resort: scrape key patterns out of free text.
    debug!(layer = "text_scrape", "attempting adjudication parse");
    text_scrape(raw).map(|parsed| (parsed.clamp(), ParseLayer::TextScrape))
}

/// Extract the first balanced `{...}` block, respecting string
/// literals and escapes.
fn brace_matched_json(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let bytes = raw.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Content of the first fenced code block, with or without a language
/// tag.
fn fenced_block(raw: &str) -> Option<&str> {
    let start = raw.find("```")?;
    let after_fence = &raw[start + 3..];
    // Skip the language tag line if present.
    let content_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(0);
    let content = &after_fence[content_start..];
    let end = content.find("```")?;
    Some(&content[..end])
}

/// JSON following a `result:` or `response:` label.
fn labelled_json(raw: &str) -> Option<&str> {
    let lower = raw.to_lowercase();
    let label_pos = ["result:", "response:"]
        .iter()
        .filter_map(|label| lower.find(label).map(|i| i + label.len()))
        .min()?;
    brace_matched_json(&raw[label_pos..])
}

/// Repair trailing commas, bare keys, and single-quoted strings.
fn repair_json(candidate: &str) -> String {
    static TRAILING_COMMA: OnceLock<Regex> = OnceLock::new();
    static BARE_KEY: OnceLock<Regex> = OnceLock::new();

    let trailing_comma =
        TRAILING_COMMA.get_or_init(|| Regex::new(r",\s*([}\]])").expect("static regex"));
    let bare_key =
        BARE_KEY.get_or_init(|| Regex::new(r#"([{,]\s*)([A-Za-z_][A-Za-z0-9_]*)\s*:"#).expect("static regex"));

    let mut repaired = candidate.replace('\'', "\"");
    repaired = trailing_comma.replace_all(&repaired, "$1").to_string();
    repaired = bare_key.replace_all(&repaired, "$1\"$2\":").to_string();
    repaired
}

/// Scrape `match`, `confidence`, and `reasoning` out of free text.
fn text_scrape(raw: &str) -> Option<ParsedAdjudication> {
    static MATCH_RE: OnceLock<Regex> = OnceLock::new();
    static CONF_RE: OnceLock<Regex> = OnceLock::new();
    static REASON_RE: OnceLock<Regex> = OnceLock::new();

    let match_re = MATCH_RE.get_or_init(|| {
        Regex::new(r#"(?i)["']?(?:match|matched|is_match)["']?\s*[:=]\s*["']?(true|false|yes|no)"#)
            .expect("static regex")
    });
    let conf_re = CONF_RE.get_or_init(|| {
        Regex::new(r#"(?i)["']?confidence["']?\s*[:=]\s*["']?([0-9]*\.?[0-9]+)"#)
            .expect("static regex")
    });
    let reason_re = REASON_RE.get_or_init(|| {
        Regex::new(r#"(?i)["']?reasoning["']?\s*[:=]\s*["']([^"']+)["']"#).expect("static regex")
    });

    let matched = match match_re.captures(raw)?.get(1)?.as_str().to_lowercase().as_str() {
        "true" | "yes" => true,
        _ => false,
    };

    let confidence = conf_re
        .captures(raw)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .unwrap_or(0.5);

    let reasoning = reason_re
        .captures(raw)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| "recovered from unstructured response".to_string());

    Some(ParsedAdjudication {
        matched,
        confidence,
        reasoning,
        normalized_csv: None,
        normalized_web: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_direct_json() {
        let raw = r#"{"match": true, "confidence": 0.9, "reasoning": "same person"}"#;
        let (parsed, layer) = parse_adjudication(raw).unwrap();
        assert_eq!(layer, ParseLayer::Direct);
        assert!(parsed.matched);
        assert_eq!(parsed.confidence, 0.9);
        assert_eq!(parsed.reasoning, "same person");
    }

    #[test]
    fn test_brace_matched_in_prose() {
        let raw = r#"Sure! Here is my verdict: {"match": false, "confidence": 0.3, "reasoning": "different {nested} values"} Hope that helps."#;
        let (parsed, layer) = parse_adjudication(raw).unwrap();
        assert_eq!(layer, ParseLayer::BraceMatched);
        assert!(!parsed.matched);
    }

    #[test]
    fn test_code_fence() {
        let raw = "Verdict below, but note the fence:\n```json\n\"not an object\"\n```\nno brace outside";
        // A fence whose content is not the envelope falls through to scrape,
        // which finds nothing here.
        assert!(parse_adjudication(raw).is_none());

        let raw = "```json\n{\"match\": true, \"confidence\": 0.85, \"reasoning\": \"ok\"}\n```";
        let (parsed, layer) = parse_adjudication(raw).unwrap();
        // Brace matching runs first and already lands on the fenced object.
        assert!(matches!(layer, ParseLayer::BraceMatched | ParseLayer::CodeFence));
        assert!(parsed.matched);
    }

    #[test]
    fn test_labelled_json() {
        let raw = "result: {\"match\": true, \"confidence\": 0.7}";
        let (parsed, _) = parse_adjudication(raw).unwrap();
        assert!(parsed.matched);
        assert_eq!(parsed.confidence, 0.7);
    }

    #[test]
    fn test_repair_trailing_comma_and_single_quotes() {
        let raw = "{'match': true, 'confidence': 0.8, 'reasoning': 'close enough',}";
        let (parsed, layer) = parse_adjudication(raw).unwrap();
        assert_eq!(layer, ParseLayer::Repaired);
        assert!(parsed.matched);
        assert_eq!(parsed.reasoning, "close enough");
    }

    #[test]
    fn test_repair_bare_keys() {
        let raw = "{match: false, confidence: 0.2}";
        let (parsed, layer) = parse_adjudication(raw).unwrap();
        assert_eq!(layer, ParseLayer::Repaired);
        assert!(!parsed.matched);
    }

    #[test]
    fn test_text_scrape_fallback() {
        let raw = "I believe match: true with confidence: 0.65 because the names are inverted.";
        let (parsed, layer) = parse_adjudication(raw).unwrap();
        assert_eq!(layer, ParseLayer::TextScrape);
        assert!(parsed.matched);
        assert_eq!(parsed.confidence, 0.65);
    }

    #[test]
    fn test_unusable_response() {
        assert!(parse_adjudication("I cannot help with that.").is_none());
    }

    #[test]
    fn test_confidence_clamped() {
        let raw = r#"{"match": true, "confidence": 1.4, "reasoning": "overconfident"}"#;
        let (parsed, _) = parse_adjudication(raw).unwrap();
        assert_eq!(parsed.confidence, 1.0);
    }

    #[test]
    fn test_camel_case_aliases() {
        let raw = r#"{"match": true, "confidence": 0.9, "normalizedCsv": "a", "normalizedWeb": "b"}"#;
        let (parsed, _) = parse_adjudication(raw).unwrap();
        assert_eq!(parsed.normalized_csv.as_deref(), Some("a"));
        assert_eq!(parsed.normalized_web.as_deref(), Some("b"));
    }

    #[test]
    fn test_clean_layer_flag() {
        assert!(ParseLayer::Direct.is_clean());
        assert!(!ParseLayer::TextScrape.is_clean());
    }
}
