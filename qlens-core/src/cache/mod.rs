//! # Response Cache
//!
//! Fingerprint-keyed memoization of completion and embedding responses.
//! Two backends implement the same [`ResponseCache`] contract: an
//! in-process store with TTL expiration and LRU eviction
//! ([`memory::MemoryCache`]) and an external key/value variant that
//! delegates TTL to Redis ([`redis::RedisCache`]).
//!
//! Whether a request may be memoized at all is decided up front by
//! [`completion_cacheable`] / [`embedding_cacheable`]; the orchestrator
//! consults those predicates before both lookup and store so a request is
//! either fully cache-transparent or fully bypassed.
//!
//! Cached responses are returned as copies with `cache_hit` set; the
//! stored value is never mutated.

pub mod key;
pub mod memory;
pub mod redis;

use crate::error::QLensError;
use crate::models::{CompletionRequest, CompletionResponse, EmbeddingRequest, EmbeddingResponse};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub use self::memory::MemoryCache;
pub use self::redis::RedisCache;

/// Cache backend selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CacheBackend {
    Memory,
    Redis { url: String },
}

/// Cache policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Default TTL applied when a request carries no override.
    pub ttl: Duration,
    /// Entry capacity of the in-memory backend.
    pub max_size: usize,
    pub backend: CacheBackend,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(900),
            max_size: 1000,
            backend: CacheBackend::Memory,
        }
    }
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub size: usize,
    pub evictions: u64,
}

/// Shared hit/miss/eviction accounting used by both backends.
#[derive(Debug, Default)]
pub(crate) struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl CacheCounters {
    pub fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn evicted(&self, n: u64) {
        self.evictions.fetch_add(n, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
    }

    pub fn stats(&self, size: usize) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            hits,
            misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            size,
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// Contract every cache backend implements.
#[async_trait::async_trait]
pub trait ResponseCache: Send + Sync {
    async fn get_completion(&self, key: &str) -> Option<CompletionResponse>;
    async fn set_completion(&self, key: &str, response: &CompletionResponse, ttl: Duration);
    async fn get_embeddings(&self, key: &str) -> Option<EmbeddingResponse>;
    async fn set_embeddings(&self, key: &str, response: &EmbeddingResponse, ttl: Duration);
    async fn delete(&self, key: &str);
    async fn stats(&self) -> CacheStats;
    async fn health_check(&self) -> Result<(), QLensError>;
    async fn configure(&self, config: CacheConfig);
    async fn clear(&self);
    async fn close(&self);
}

/// Sampling above this temperature is too nondeterministic to memoize.
const MAX_CACHEABLE_TEMPERATURE: f32 = 0.8;

/// Whether a completion request may be served from and stored into the
/// cache. Streaming responses and requests carrying an end-user identifier
/// are never cached.
pub fn completion_cacheable(cache_enabled: bool, req: &CompletionRequest) -> bool {
    cache_enabled
        && req.cache_enabled
        && !req.stream
        && req.user.as_deref().unwrap_or("").is_empty()
        && req
            .temperature
            .map_or(true, |t| t <= MAX_CACHEABLE_TEMPERATURE)
}

/// Whether an embedding request may be cached.
pub fn embedding_cacheable(cache_enabled: bool, req: &EmbeddingRequest) -> bool {
    cache_enabled && req.user.as_deref().unwrap_or("").is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Message;

    fn cacheable_request() -> CompletionRequest {
        CompletionRequest {
            model: "gpt-35-turbo".into(),
            messages: vec![Message::user("hi")],
            temperature: Some(0.5),
            ..Default::default()
        }
    }

    #[test]
    fn deterministic_request_is_cacheable() {
        assert!(completion_cacheable(true, &cacheable_request()));
    }

    #[test]
    fn cache_disabled_globally_wins() {
        assert!(!completion_cacheable(false, &cacheable_request()));
    }

    #[test]
    fn request_level_opt_out_wins() {
        let mut req = cacheable_request();
        req.cache_enabled = false;
        assert!(!completion_cacheable(true, &req));
    }

    #[test]
    fn streaming_is_never_cacheable() {
        let mut req = cacheable_request();
        req.stream = true;
        assert!(!completion_cacheable(true, &req));
    }

    #[test]
    fn hot_temperature_is_not_cacheable() {
        let mut req = cacheable_request();
        req.temperature = Some(0.9);
        assert!(!completion_cacheable(true, &req));

        req.temperature = Some(0.8);
        assert!(completion_cacheable(true, &req));

        req.temperature = None;
        assert!(completion_cacheable(true, &req));
    }

    #[test]
    fn end_user_identifier_disables_caching() {
        let mut req = cacheable_request();
        req.user = Some("end-user-7".into());
        assert!(!completion_cacheable(true, &req));

        req.user = Some(String::new());
        assert!(completion_cacheable(true, &req));
    }

    #[test]
    fn embedding_cacheability() {
        let mut req = EmbeddingRequest {
            model: "text-embedding-ada-002".into(),
            input: vec!["hello".into()],
            ..Default::default()
        };
        assert!(embedding_cacheable(true, &req));
        assert!(!embedding_cacheable(false, &req));
        req.user = Some("someone".into());
        assert!(!embedding_cacheable(true, &req));
    }

    #[test]
    fn counters_compute_hit_rate() {
        let counters = CacheCounters::default();
        counters.hit();
        counters.hit();
        counters.hit();
        counters.miss();
        let stats = counters.stats(3);
        assert_eq!(stats.hits, 3);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.75).abs() < 1e-9);
        assert_eq!(stats.size, 3);
    }
}
