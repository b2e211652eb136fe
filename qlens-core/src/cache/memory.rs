//! In-process cache backend with TTL expiration and LRU eviction.

use super::{CacheConfig, CacheCounters, CacheStats, ResponseCache};
use crate::error::QLensError;
use crate::models::{CompletionResponse, EmbeddingResponse};
use crate::observability::{Clock, SystemClock};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
enum CachedPayload {
    Completion(CompletionResponse),
    Embedding(EmbeddingResponse),
}

#[derive(Debug, Clone)]
struct CacheEntry {
    payload: CachedPayload,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    access_count: u64,
    last_accessed: DateTime<Utc>,
}

impl CacheEntry {
    fn expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

enum Lookup {
    Miss,
    Expired,
    Hit(CachedPayload),
}

/// In-memory [`ResponseCache`].
///
/// Expired entries are invisible: a read that finds one removes it and
/// reports a miss. A background sweeper additionally clears expired
/// entries every minute so idle keys do not pin memory until the next
/// lookup. Both paths count removals as evictions, as does the LRU
/// eviction that makes room when the store is at capacity.
pub struct MemoryCache {
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
    counters: Arc<CacheCounters>,
    config: RwLock<CacheConfig>,
    clock: Arc<dyn Clock>,
    sweeper: StdMutex<Option<JoinHandle<()>>>,
}

impl MemoryCache {
    pub fn new(config: CacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        let entries: Arc<RwLock<HashMap<String, CacheEntry>>> =
            Arc::new(RwLock::new(HashMap::new()));
        let counters = Arc::new(CacheCounters::default());
        let sweeper = spawn_sweeper(entries.clone(), counters.clone(), clock.clone());
        Self {
            entries,
            counters,
            config: RwLock::new(config),
            clock,
            sweeper: StdMutex::new(Some(sweeper)),
        }
    }

    async fn lookup(&self, key: &str) -> Option<CachedPayload> {
        let now = self.clock.now();
        let outcome = {
            let entries = self.entries.read().await;
            match entries.get(key) {
                None => Lookup::Miss,
                Some(entry) if entry.expired_at(now) => Lookup::Expired,
                Some(entry) => Lookup::Hit(entry.payload.clone()),
            }
        };
        match outcome {
            Lookup::Hit(payload) => {
                let mut entries = self.entries.write().await;
                if let Some(entry) = entries.get_mut(key) {
                    entry.access_count += 1;
                    entry.last_accessed = now;
                }
                self.counters.hit();
                Some(payload)
            }
            Lookup::Expired => {
                let mut entries = self.entries.write().await;
                if entries.get(key).is_some_and(|e| e.expired_at(now)) {
                    entries.remove(key);
                    self.counters.evicted(1);
                }
                self.counters.miss();
                None
            }
            Lookup::Miss => {
                self.counters.miss();
                None
            }
        }
    }

    async fn insert(&self, key: &str, payload: CachedPayload, ttl: Duration) {
        let max_size = self.config.read().await.max_size;
        let now = self.clock.now();
        let mut entries = self.entries.write().await;

        if !entries.contains_key(key) && entries.len() >= max_size {
            if let Some(victim) = lru_victim(&entries) {
                entries.remove(&victim);
                self.counters.evicted(1);
            }
        }

        entries.insert(
            key.to_string(),
            CacheEntry {
                payload,
                created_at: now,
                expires_at: now + chrono::Duration::from_std(ttl).unwrap_or_default(),
                access_count: 0,
                last_accessed: now,
            },
        );
    }
}

/// Pick the entry with the oldest `last_accessed`, breaking ties on the
/// oldest `created_at`.
fn lru_victim(entries: &HashMap<String, CacheEntry>) -> Option<String> {
    entries
        .iter()
        .min_by_key(|(_, e)| (e.last_accessed, e.created_at))
        .map(|(k, _)| k.clone())
}

fn spawn_sweeper(
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
    counters: Arc<CacheCounters>,
    clock: Arc<dyn Clock>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let now = clock.now();
            let mut entries = entries.write().await;
            let before = entries.len();
            entries.retain(|_, entry| !entry.expired_at(now));
            let removed = (before - entries.len()) as u64;
            if removed > 0 {
                counters.evicted(removed);
                tracing::debug!(removed, "cache sweep removed expired entries");
            }
        }
    })
}

#[async_trait::async_trait]
impl ResponseCache for MemoryCache {
    async fn get_completion(&self, key: &str) -> Option<CompletionResponse> {
        match self.lookup(key).await {
            Some(CachedPayload::Completion(mut response)) => {
                response.cache_hit = true;
                Some(response)
            }
            _ => None,
        }
    }

    async fn set_completion(&self, key: &str, response: &CompletionResponse, ttl: Duration) {
        self.insert(key, CachedPayload::Completion(response.clone()), ttl)
            .await;
    }

    async fn get_embeddings(&self, key: &str) -> Option<EmbeddingResponse> {
        match self.lookup(key).await {
            Some(CachedPayload::Embedding(mut response)) => {
                response.cache_hit = true;
                Some(response)
            }
            _ => None,
        }
    }

    async fn set_embeddings(&self, key: &str, response: &EmbeddingResponse, ttl: Duration) {
        self.insert(key, CachedPayload::Embedding(response.clone()), ttl)
            .await;
    }

    async fn delete(&self, key: &str) {
        self.entries.write().await.remove(key);
    }

    async fn stats(&self) -> CacheStats {
        let size = self.entries.read().await.len();
        self.counters.stats(size)
    }

    async fn health_check(&self) -> Result<(), QLensError> {
        Ok(())
    }

    async fn configure(&self, config: CacheConfig) {
        *self.config.write().await = config;
    }

    async fn clear(&self) {
        self.entries.write().await.clear();
        self.counters.reset();
    }

    async fn close(&self) {
        if let Some(handle) = self.sweeper.lock().ok().and_then(|mut s| s.take()) {
            handle.abort();
        }
    }
}

impl Drop for MemoryCache {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.lock().ok().and_then(|mut s| s.take()) {
            handle.abort();
        }
    }
}
