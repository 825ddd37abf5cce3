//! Browser capability interface.
//!
//! The concrete driver (CDP, WebDriver, an embedded engine) lives
//! outside the core; the orchestrator only needs the operations below.
//! Implementations must be safe to share across the worker pool.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::Result;
use crate::types::{Region, Viewport};

/// Result of a page load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavigationResponse {
    pub status_code: u16,
    /// URL after following redirects
    pub final_url: String,
    /// Intermediate redirect URLs, in order
    pub redirects: Vec<String>,
    pub load_time_ms: u64,
    pub title: Option<String>,
}

/// Kind of element a selector resolved to; drives canonical value
/// reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    /// Form input: value, or checked state for checkboxes/radios
    Input,
    /// Select: the chosen option's value
    Select,
    /// Textarea: content
    Textarea,
    /// Anything else: visible text
    Other,
}

/// Opaque handle to a located element.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElementHandle {
    /// Driver-scoped identifier
    pub id: String,
    pub kind: ElementKind,
    /// Layout box, when the driver can compute one
    pub bounding_box: Option<Region>,
}

/// Canonical value read from an element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ElementValue {
    Text(String),
    Bool(bool),
}

impl ElementValue {
    pub fn as_text(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Bool(b) => b.to_string(),
        }
    }
}

/// Browser capability required by the orchestrator.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    /// Load a URL and wait for DOM/network quiescence, up to `timeout`.
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<NavigationResponse>;

    /// Locate the first element matching a CSS selector.
    async fn query_selector(&self, selector: &str) -> Result<Option<ElementHandle>>;

    /// Read the canonical value for an element per its kind.
    async fn element_value(&self, handle: &ElementHandle) -> Result<ElementValue>;

    /// Capture the full page as PNG bytes.
    async fn screenshot_full(&self) -> Result<Vec<u8>>;

    /// Capture a region as PNG bytes; `None` region means the viewport.
    async fn screenshot_region(&self, region: Option<Region>) -> Result<Vec<u8>>;

    /// Serialize the current DOM.
    async fn dom_snapshot(&self) -> Result<String>;

    /// Current viewport dimensions.
    fn viewport(&self) -> Viewport;

    /// Release the underlying browser session.
    async fn close(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_value_as_text() {
        assert_eq!(ElementValue::Text("Moby-Dick".to_string()).as_text(), "Moby-Dick");
        assert_eq!(ElementValue::Bool(true).as_text(), "true");
    }

    #[test]
    fn test_element_kind_serialized_form() {
        let json = serde_json::to_string(&ElementKind::Textarea).unwrap();
        assert_eq!(json, "\"textarea\"");
    }
}
