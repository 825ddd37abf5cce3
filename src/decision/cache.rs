//! TTL-bounded cache of field verdicts.
//!
//! Keyed by the normalized value pair, the field type, and the ruleset
//! version, so a rule change invalidates every prior entry. The cache
//! never changes an outcome: hits replay the stored verdict and are
//! flagged with `cache_hit` in the decision's issues.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::types::Method;

/// Issue tag appended to decisions served from the cache.
pub const ISSUE_CACHE_HIT: &str = "cache_hit";

/// Cache key over the inputs that fully determine a verdict.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DecisionCacheKey(pub String);

impl DecisionCacheKey {
    /// Generate a key from the normalized pair, field type, and ruleset
    /// version.
    pub fn generate(
        normalized_csv: &str,
        normalized_web: &str,
        field_type: &str,
        ruleset_version: &str,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"csv:");
        hasher.update(normalized_csv.as_bytes());
        hasher.update(b"\nweb:");
        hasher.update(normalized_web.as_bytes());
        hasher.update(b"\ntype:");
        hasher.update(field_type.as_bytes());
        hasher.update(b"\nrules:");
        hasher.update(ruleset_version.as_bytes());
        let hash = hasher.finalize();
        DecisionCacheKey(format!("{hash:x}"))
    }
}

impl std::fmt::Display for DecisionCacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0[..16])
    }
}

/// The replayable part of a decision. Row- and field-identity live on
/// the decision itself, so entries are shared across fields of the same
/// type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedVerdict {
    pub matched: bool,
    pub confidence: f64,
    pub reasoning: String,
    pub method: Method,
    pub fuzzy_score: Option<f64>,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    verdict: CachedVerdict,
    created_at: DateTime<Utc>,
}

impl CacheEntry {
    fn is_expired(&self, ttl: Duration) -> bool {
        Utc::now() - self.created_at > ttl
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entry_count: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Concurrent decision cache with TTL expiry.
pub struct DecisionCache {
    entries: Arc<RwLock<HashMap<DecisionCacheKey, CacheEntry>>>,
    stats: Arc<RwLock<CacheStats>>,
    ttl: Duration,
}

impl DecisionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(CacheStats::default())),
            ttl,
        }
    }

    /// Cache with the given TTL in seconds.
    pub fn with_ttl_secs(ttl_secs: u64) -> Self {
        Self::new(Duration::seconds(ttl_secs as i64))
    }

    /// Look up a verdict; expired entries are misses.
    pub async fn get(&self, key: &DecisionCacheKey) -> Option<CachedVerdict> {
        let entries = self.entries.read().await;
        let hit = entries
            .get(key)
            .filter(|e| !e.is_expired(self.ttl))
            .map(|e| e.verdict.clone());
        drop(entries);

        let mut stats = self.stats.write().await;
        if hit.is_some() {
            stats.hits += 1;
        } else {
            stats.misses += 1;
        }
        hit
    }

    /// Store a verdict. Writes are idempotent; racing misses for the
    /// same key settle on whichever write lands last.
    pub async fn insert(&self, key: DecisionCacheKey, verdict: CachedVerdict) {
        let mut entries = self.entries.write().await;
        entries.insert(
            key,
            CacheEntry {
                verdict,
                created_at: Utc::now(),
            },
        );
        let count = entries.len() as u64;
        drop(entries);

        let mut stats = self.stats.write().await;
        stats.entry_count = count;
    }

    /// Drop expired entries.
    pub async fn cleanup(&self) {
        let mut entries = self.entries.write().await;
        entries.retain(|_, e| !e.is_expired(self.ttl));
        let count = entries.len() as u64;
        drop(entries);

        let mut stats = self.stats.write().await;
        stats.entry_count = count;
    }

    pub async fn stats(&self) -> CacheStats {
        self.stats.read().await.clone()
    }

    pub async fn clear(&self) {
        let mut entries = self.entries.write().await;
        entries.clear();
        drop(entries);

        let mut stats = self.stats.write().await;
        *stats = CacheStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verdict() -> CachedVerdict {
        CachedVerdict {
            matched: true,
            confidence: 0.95,
            reasoning: "values equal after normalization".to_string(),
            method: Method::Dom,
            fuzzy_score: None,
        }
    }

    #[test]
    fn test_key_is_deterministic() {
        let a = DecisionCacheKey::generate("herman melville", "herman melville", "name", "v1");
        let b = DecisionCacheKey::generate("herman melville", "herman melville", "name", "v1");
        assert_eq!(a, b);
    }

    #[test]
    fn test_key_varies_with_each_component() {
        let base = DecisionCacheKey::generate("a", "b", "text", "v1");
        assert_ne!(base, DecisionCacheKey::generate("x", "b", "text", "v1"));
        assert_ne!(base, DecisionCacheKey::generate("a", "x", "text", "v1"));
        assert_ne!(base, DecisionCacheKey::generate("a", "b", "name", "v1"));
        assert_ne!(base, DecisionCacheKey::generate("a", "b", "text", "v2"));
    }

    #[test]
    fn test_key_components_are_delimited() {
        // Concatenation ambiguity must not produce colliding keys.
        let a = DecisionCacheKey::generate("ab", "c", "text", "v1");
        let b = DecisionCacheKey::generate("a", "bc", "text", "v1");
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_insert_then_hit() {
        let cache = DecisionCache::with_ttl_secs(3600);
        let key = DecisionCacheKey::generate("a", "b", "text", "v1");

        assert!(cache.get(&key).await.is_none());
        cache.insert(key.clone(), verdict()).await;
        let hit = cache.get(&key).await.unwrap();
        assert!(hit.matched);

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entry_count, 1);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss() {
        let cache = DecisionCache::new(Duration::zero());
        let key = DecisionCacheKey::generate("a", "b", "text", "v1");
        cache.insert(key.clone(), verdict()).await;

        assert!(cache.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_cleanup_drops_expired() {
        let cache = DecisionCache::new(Duration::zero());
        let key = DecisionCacheKey::generate("a", "b", "text", "v1");
        cache.insert(key, verdict()).await;

        cache.cleanup().await;
        assert_eq!(cache.stats().await.entry_count, 0);
    }

    #[tokio::test]
    async fn test_clear_resets_stats() {
        let cache = DecisionCache::with_ttl_secs(3600);
        let key = DecisionCacheKey::generate("a", "b", "text", "v1");
        cache.insert(key.clone(), verdict()).await;
        cache.get(&key).await;

        cache.clear().await;
        let stats = cache.stats().await;
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.entry_count, 0);
    }
}
