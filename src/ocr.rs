//! OCR capability interface.
//!
//! The concrete engine (Tesseract, a cloud service) lives outside the
//! core. The extractor hands over pre-clipped image bytes plus
//! preprocessing flags and gets back recognized words with per-word
//! confidence.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::types::Region;

/// Preprocessing requested before recognition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OcrPreprocessing {
    pub enhance_contrast: bool,
    pub denoise: bool,
    /// 2x upscale before recognition
    pub upscale: bool,
}

impl Default for OcrPreprocessing {
    fn default() -> Self {
        Self {
            enhance_contrast: true,
            denoise: true,
            upscale: true,
        }
    }
}

/// Recognition options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrOptions {
    pub language: String,
    #[serde(default)]
    pub preprocessing: OcrPreprocessing,
}

impl Default for OcrOptions {
    fn default() -> Self {
        Self {
            language: "eng".to_string(),
            preprocessing: OcrPreprocessing::default(),
        }
    }
}

/// One recognized word.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrWord {
    pub text: String,
    /// Engine confidence in [0, 1]
    pub confidence: f64,
    pub bbox: Option<Region>,
}

/// Full recognition result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrRecognition {
    /// Full recognized text, line breaks preserved
    pub text: String,
    pub words: Vec<OcrWord>,
    /// Overall engine confidence in [0, 1]
    pub confidence: f64,
    pub processing_time_ms: u64,
}

impl OcrRecognition {
    /// Lines of the recognized text, trimmed, empties dropped.
    pub fn lines(&self) -> Vec<&str> {
        self.text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect()
    }
}

/// OCR capability required by the extractor.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// Recognize text in the given image bytes.
    async fn recognize(&self, image: &[u8], options: &OcrOptions) -> Result<OcrRecognition>;
}

/// TTL cache of recognitions keyed by image content and language.
///
/// Duplicate rows against the same page produce byte-identical element
/// clips; caching sidesteps the most expensive stage for them.
pub struct OcrCache {
    entries: RwLock<HashMap<String, (OcrRecognition, DateTime<Utc>)>>,
    ttl: Duration,
}

impl OcrCache {
    pub fn with_ttl_secs(ttl_secs: u64) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl: Duration::seconds(ttl_secs as i64),
        }
    }

    /// Cache key over the image bytes and language.
    pub fn key(image: &[u8], language: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(image);
        hasher.update(b"\nlang:");
        hasher.update(language.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub async fn get(&self, key: &str) -> Option<OcrRecognition> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|(_, created)| Utc::now() - *created <= self.ttl)
            .map(|(recognition, _)| recognition.clone())
    }

    pub async fn insert(&self, key: String, recognition: OcrRecognition) {
        let mut entries = self.entries.write().await;
        entries.insert(key, (recognition, Utc::now()));
    }

    /// Drop expired entries.
    pub async fn cleanup(&self) {
        let mut entries = self.entries.write().await;
        let now = Utc::now();
        entries.retain(|_, (_, created)| now - *created <= self.ttl);
    }
}
