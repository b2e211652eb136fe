//! External key/value cache backend.
//!
//! Same contract as the in-memory store, but entries live in Redis under
//! `qlens:`-prefixed keys and TTL handling is delegated to the store via
//! `SET .. EX`. Values are canonical JSON; anything that fails to
//! deserialize is treated as a miss. Hit/miss/eviction accounting stays
//! process-local.

use super::{CacheConfig, CacheCounters, CacheStats, ResponseCache};
use crate::error::QLensError;
use crate::models::{CompletionResponse, EmbeddingResponse};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::RwLock;

const KEY_NAMESPACE: &str = "qlens";

pub struct RedisCache {
    conn: MultiplexedConnection,
    counters: CacheCounters,
    config: RwLock<CacheConfig>,
}

impl RedisCache {
    /// Connect to the configured Redis instance.
    pub async fn connect(url: &str, config: CacheConfig) -> Result<Self, QLensError> {
        let client = redis::Client::open(url).map_err(|e| {
            QLensError::configuration(format!("invalid redis url: {e}"))
        })?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                QLensError::configuration("redis connection failed")
                    .with_internal(e.to_string())
            })?;
        Ok(Self {
            conn,
            counters: CacheCounters::default(),
            config: RwLock::new(config),
        })
    }

    fn namespaced(key: &str) -> String {
        format!("{KEY_NAMESPACE}:{key}")
    }

    async fn fetch<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = match conn.get(Self::namespaced(key)).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(error = %e, "redis get failed, treating as miss");
                None
            }
        };
        let parsed = raw.and_then(|json| match serde_json::from_str(&json) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(error = %e, "stale cache payload, treating as miss");
                None
            }
        });
        match parsed {
            Some(value) => {
                self.counters.hit();
                Some(value)
            }
            None => {
                self.counters.miss();
                None
            }
        }
    }

    async fn store<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let json = match serde_json::to_string(value) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "cache payload serialization failed, skipping store");
                return;
            }
        };
        let mut conn = self.conn.clone();
        let ttl_secs = ttl.as_secs().max(1);
        if let Err(e) = conn
            .set_ex::<_, _, ()>(Self::namespaced(key), json, ttl_secs)
            .await
        {
            tracing::warn!(error = %e, "redis set failed");
        }
    }
}

#[async_trait::async_trait]
impl ResponseCache for RedisCache {
    async fn get_completion(&self, key: &str) -> Option<CompletionResponse> {
        let mut response: CompletionResponse = self.fetch(key).await?;
        response.cache_hit = true;
        Some(response)
    }

    async fn set_completion(&self, key: &str, response: &CompletionResponse, ttl: Duration) {
        self.store(key, response, ttl).await;
    }

    async fn get_embeddings(&self, key: &str) -> Option<EmbeddingResponse> {
        let mut response: EmbeddingResponse = self.fetch(key).await?;
        response.cache_hit = true;
        Some(response)
    }

    async fn set_embeddings(&self, key: &str, response: &EmbeddingResponse, ttl: Duration) {
        self.store(key, response, ttl).await;
    }

    async fn delete(&self, key: &str) {
        let mut conn = self.conn.clone();
        if let Err(e) = conn.del::<_, ()>(Self::namespaced(key)).await {
            tracing::warn!(error = %e, "redis del failed");
        }
    }

    async fn stats(&self) -> CacheStats {
        let mut conn = self.conn.clone();
        let size: usize = redis::cmd("DBSIZE")
            .query_async::<_, i64>(&mut conn)
            .await
            .map(|n| n.max(0) as usize)
            .unwrap_or(0);
        self.counters.stats(size)
    }

    async fn health_check(&self) -> Result<(), QLensError> {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| {
                QLensError::service_unavailable("cache backend unreachable")
                    .with_internal(e.to_string())
            })?;
        Ok(())
    }

    async fn configure(&self, config: CacheConfig) {
        *self.config.write().await = config;
    }

    async fn clear(&self) {
        let mut scan_conn = self.conn.clone();
        let pattern = format!("{KEY_NAMESPACE}:*");
        let keys: Vec<String> = {
            match scan_conn.scan_match::<_, String>(&pattern).await {
                Ok(mut iter) => {
                    let mut keys = Vec::new();
                    while let Some(key) = iter.next_item().await {
                        keys.push(key);
                    }
                    keys
                }
                Err(e) => {
                    tracing::warn!(error = %e, "redis scan failed during clear");
                    return;
                }
            }
        };
        if keys.is_empty() {
            return;
        }
        let mut conn = self.conn.clone();
        if let Err(e) = conn.del::<_, ()>(keys).await {
            tracing::warn!(error = %e, "redis del failed during clear");
        }
        self.counters.reset();
    }

    async fn close(&self) {}
}
