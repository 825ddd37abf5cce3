//! Core data model for validation runs.
//!
//! Rows come in from the caller, observations come back from the browser,
//! decisions come out of the engine, and everything is frozen into a
//! `RowResult` once the row's evidence is on disk.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::StageError;

/// Opaque stable identifier for a row, used for evidence filing and
/// result correlation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowId(pub String);

impl RowId {
    /// Derive a row id from an index when no primary-key column exists.
    pub fn from_index(index: usize) -> Self {
        Self(format!("row-{index}"))
    }
}

impl std::fmt::Display for RowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A scalar cell value from the input table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Text(String),
    Number(f64),
    Bool(bool),
    Absent,
}

impl CellValue {
    /// Render the cell as the string the comparator sees.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Self::Text(s) => Some(s.clone()),
            Self::Number(n) => Some(format_number(*n)),
            Self::Bool(b) => Some(b.to_string()),
            Self::Absent => None,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }
}

impl From<&str> for CellValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for CellValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<f64> for CellValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<bool> for CellValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// Format a number the way the input table would have written it: no
/// trailing `.0` for integral values.
fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

/// One input record to be validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    /// Stable identifier for evidence filing and correlation
    pub id: RowId,
    /// Zero-based position in the input stream
    pub index: usize,
    /// Column name to cell value
    pub values: BTreeMap<String, CellValue>,
}

impl Row {
    /// Create a row with an id derived from its index.
    pub fn new(index: usize, values: BTreeMap<String, CellValue>) -> Self {
        Self {
            id: RowId::from_index(index),
            index,
            values,
        }
    }

    /// Create a row keyed by a primary-key column value.
    pub fn with_id(id: impl Into<String>, index: usize, values: BTreeMap<String, CellValue>) -> Self {
        Self {
            id: RowId(id.into()),
            index,
            values,
        }
    }

    /// Look up a cell by exact column name.
    pub fn get(&self, column: &str) -> Option<&CellValue> {
        self.values.get(column)
    }

    /// Look up a cell by exact column name, then case-insensitively.
    pub fn get_ci(&self, column: &str) -> Option<&CellValue> {
        self.values.get(column).or_else(|| {
            self.values
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(column))
                .map(|(_, v)| v)
        })
    }
}

/// Declared type of a mapped field, driving normalization and comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Text,
    Email,
    Phone,
    Currency,
    Date,
    Name,
    Address,
    Number,
    Boolean,
}

impl FieldType {
    /// Whether values of this type compare numerically.
    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Number | Self::Currency)
    }
}

/// How a field is extracted and compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Structured DOM extraction only
    Dom,
    /// Visual OCR extraction only
    Ocr,
    /// DOM with OCR fallback
    Hybrid,
    /// DOM extraction, fuzzy comparison emphasis
    Fuzzy,
}

impl Strategy {
    /// Whether OCR fallback is enabled for this strategy.
    pub fn ocr_enabled(&self) -> bool {
        matches!(self, Self::Ocr | Self::Hybrid)
    }
}

/// Declaration tying a row column to a page selector, type, and strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Column name in the input table
    pub csv_field: String,
    /// CSS selector locating the value on the page
    pub web_selector: String,
    /// Declared field type
    pub field_type: FieldType,
    /// Required fields gate the row's overall match
    #[serde(default)]
    pub required: bool,
    /// Extraction/comparison strategy
    pub strategy: Strategy,
    /// Free-form per-field rule overrides, interpreted by the caller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_rules: Option<Value>,
}

impl FieldMapping {
    pub fn new(
        csv_field: impl Into<String>,
        web_selector: impl Into<String>,
        field_type: FieldType,
        strategy: Strategy,
    ) -> Self {
        Self {
            csv_field: csv_field.into(),
            web_selector: web_selector.into(),
            field_type,
            required: false,
            strategy,
            custom_rules: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Pixel rectangle on the rendered page.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Region {
    /// Expand the region by `margin` pixels on every side, clamping the
    /// origin at zero.
    pub fn with_margin(&self, margin: f64) -> Self {
        Self {
            x: (self.x - margin).max(0.0),
            y: (self.y - margin).max(0.0),
            width: self.width + margin * 2.0,
            height: self.height + margin * 2.0,
        }
    }
}

/// Screenshot kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScreenshotKind {
    Full,
    Element,
}

/// A captured screenshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Screenshot {
    pub id: Uuid,
    /// Raw image bytes; not serialized into reports
    #[serde(skip)]
    pub bytes: Vec<u8>,
    /// Image encoding, e.g. "png"
    pub encoding: String,
    /// Clip region for element screenshots
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<Region>,
    pub captured_at: DateTime<Utc>,
    pub kind: ScreenshotKind,
}

impl Screenshot {
    pub fn full(bytes: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            bytes,
            encoding: "png".to_string(),
            region: None,
            captured_at: Utc::now(),
            kind: ScreenshotKind::Full,
        }
    }

    pub fn element(bytes: Vec<u8>, region: Option<Region>) -> Self {
        Self {
            id: Uuid::new_v4(),
            bytes,
            encoding: "png".to_string(),
            region,
            captured_at: Utc::now(),
            kind: ScreenshotKind::Element,
        }
    }
}

/// How a value was extracted or a decision was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Dom,
    Ocr,
    Fuzzy,
    Llm,
    Manual,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Dom => "dom",
            Self::Ocr => "ocr",
            Self::Fuzzy => "fuzzy",
            Self::Llm => "llm",
            Self::Manual => "manual",
        };
        write!(f, "{s}")
    }
}

/// A field value pulled off the page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedField {
    pub csv_field: String,
    /// Value as read from the page, before normalization
    pub raw_value: Option<String>,
    /// Value after normalization, when normalization succeeded
    pub normalized_value: Option<String>,
    pub method: Method,
    /// Extraction confidence in [0, 1]
    pub confidence: f64,
    /// Bounding box of the source element, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub element_box: Option<Region>,
}

/// Viewport dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 800,
        }
    }
}

/// Everything observed while visiting one page for one row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageObservation {
    /// URL requested (after template interpolation)
    pub url: String,
    /// URL after redirects
    pub final_url: String,
    pub title: Option<String>,
    pub load_time_ms: u64,
    pub status_code: u16,
    pub redirects: Vec<String>,
    pub viewport: Viewport,
    pub captured_at: DateTime<Utc>,
    pub extracted_fields: Vec<ExtractedField>,
    pub screenshots: Vec<Screenshot>,
    /// Serialized DOM at extraction time; not embedded in reports
    #[serde(skip)]
    pub dom_snapshot: String,
}

/// A field-level verdict with confidence and reasoning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDecision {
    pub csv_field: String,
    /// Declared value from the input row
    pub csv_value: Option<String>,
    /// Observed value from the page
    pub web_value: Option<String>,
    pub normalized_csv: Option<String>,
    pub normalized_web: Option<String>,
    pub matched: bool,
    /// Decision confidence in [0, 1]
    pub confidence: f64,
    pub reasoning: String,
    pub method: Method,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fuzzy_score: Option<f64>,
    /// Normalization failures, LLM parse warnings, cache fallbacks
    #[serde(default)]
    pub issues: Vec<String>,
    /// Raw adjudicator response, retained for the evidence bundle
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_raw_response: Option<String>,
}

/// Frozen outcome for one row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowResult {
    pub row_id: RowId,
    pub row_index: usize,
    pub row: Row,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observation: Option<PageObservation>,
    pub field_decisions: Vec<FieldDecision>,
    pub overall_match: bool,
    pub overall_confidence: f64,
    pub processing_time_ms: u64,
    #[serde(default)]
    pub errors: Vec<StageError>,
    pub evidence_id: String,
}
