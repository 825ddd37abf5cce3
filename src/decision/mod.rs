//! Field decisioning.
//!
//! The engine turns an extracted web value and a declared CSV value
//! into a `FieldDecision` through a deterministic ladder (normalize,
//! exact equality, fuzzy similarity) with optional LLM escalation for
//! hybrid fields. An optional TTL cache short-circuits repeated pairs;
//! absence of the cache argument means caching is disabled.

mod cache;
mod engine;

pub use cache::{CacheStats, CachedVerdict, DecisionCache, DecisionCacheKey, ISSUE_CACHE_HIT};
pub use engine::DecisionEngine;
