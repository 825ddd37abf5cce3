//! Row-parameterized page navigation.
//!
//! Interpolates `{column}` tokens in the URL template from the row,
//! loads the page with a settle timeout, and classifies failures into
//! the retryable/fatal taxonomy the scheduler acts on.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::browser::{BrowserDriver, NavigationResponse};
use crate::error::{Error, ErrorKind, StageError, StageResult};
use crate::types::{Row, Screenshot};

/// A successfully loaded page, ready for extraction.
#[derive(Debug)]
pub struct LoadedPage {
    /// URL requested after interpolation
    pub url: String,
    pub response: NavigationResponse,
    /// Full-page capture taken right after settle
    pub full_screenshot: Option<Screenshot>,
}

/// Replace `{token}` placeholders with row values.
///
/// Lookup order per token: exact column name, then case-insensitive,
/// then the placeholder is left unchanged. Values are URL-encoded.
pub fn interpolate_url(template: &str, row: &Row) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + 1..];
        match after_open.find('}') {
            Some(close) => {
                let token = &after_open[..close];
                match row.get_ci(token).and_then(|cell| cell.as_text()) {
                    Some(value) => out.push_str(&urlencoding::encode(&value)),
                    None => {
                        out.push('{');
                        out.push_str(token);
                        out.push('}');
                    }
                }
                rest = &after_open[close + 1..];
            }
            None => {
                out.push('{');
                rest = after_open;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Drives page loads for the pipeline.
pub struct Navigator {
    browser: Arc<dyn BrowserDriver>,
    /// Settle timeout for one load attempt
    nav_timeout: Duration,
    screenshot_enabled: bool,
}

impl Navigator {
    pub fn new(browser: Arc<dyn BrowserDriver>, nav_timeout: Duration) -> Self {
        Self {
            browser,
            nav_timeout,
            screenshot_enabled: true,
        }
    }

    pub fn with_screenshots(mut self, enabled: bool) -> Self {
        self.screenshot_enabled = enabled;
        self
    }

    /// Interpolate and load the page for a row.
    #[instrument(skip(self, row, cancel), fields(row = %row.id))]
    pub async fn load(
        &self,
        url_template: &str,
        row: &Row,
        cancel: &CancellationToken,
    ) -> StageResult<LoadedPage> {
        let url = interpolate_url(url_template, row);
        debug!(%url, "navigating");

        let response = tokio::select! {
            result = self.browser.navigate(&url, self.nav_timeout) => result,
            _ = cancel.cancelled() => {
                return Err(StageError::new(ErrorKind::Cancelled, "navigation cancelled"));
            }
        };

        let response = match response {
            Ok(response) => response,
            Err(err) => return Err(classify_navigation_error(&err)),
        };

        if let Some(err) = classify_status(response.status_code) {
            return Err(err);
        }

        let full_screenshot = if self.screenshot_enabled {
            match self.browser.screenshot_full().await {
                Ok(bytes) => Some(Screenshot::full(bytes)),
                Err(err) => {
                    debug!(error = %err, "full-page screenshot failed; continuing without");
                    None
                }
            }
        } else {
            None
        };

        Ok(LoadedPage {
            url,
            response,
            full_screenshot,
        })
    }
}

/// Map a browser error onto the stage taxonomy.
fn classify_navigation_error(err: &Error) -> StageError {
    match err {
        Error::Timeout { duration_ms } => StageError::new(
            ErrorKind::NavigationTimeout,
            format!("page did not settle within {duration_ms}ms"),
        )
        .with_recoverable(true),
        other => StageError::new(ErrorKind::TransientTransport, "navigation failed")
            .with_cause(other),
    }
}

/// Non-2xx statuses fail the row: 404 as `page_not_found`, the rest as
/// `http_status`.
fn classify_status(status_code: u16) -> Option<StageError> {
    match status_code {
        200..=299 => None,
        404 => Some(StageError::new(
            ErrorKind::PageNotFound,
            "page returned 404",
        )),
        code => Some(StageError::new(
            ErrorKind::HttpStatus,
            format!("page returned HTTP {code}"),
        )),
    }
}
