//! # Router
//!
//! Provider registry, health tracking, and selection policy. The registry
//! is read-mostly: every request runs a selection (shared lock), while
//! registration, unregistration, and config replacement take the write
//! path. Health lives in a per-provider lock so the background health loop
//! publishes updates atomically without blocking selections on other
//! providers.
//!
//! Selection never talks to the network. Model advertisement is
//! adapter-owned static data, and health is whatever the last health-loop
//! tick published. The router holds no pricing and no per-model state
//! beyond what adapters expose.

use crate::error::QLensError;
use crate::models::{
    CompletionRequest, EmbeddingRequest, ProviderChoice, ProviderId, RequestPriority,
};
use crate::providers::{HealthStatus, ProviderAdapter, ProviderConfig, ProviderHealth};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock, Weak};
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

/// Latency above this marks a probed provider as degraded.
const DEGRADED_LATENCY_MS: u64 = 2000;

/// Routing policy.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Reselect to another healthy provider on retryable failures.
    pub auto_failover: bool,
    /// Round-robin across equal candidates instead of always taking the
    /// highest-priority one.
    pub load_balancing: bool,
    pub health_check_interval: Duration,
    /// Preferred provider when it survives filtering.
    pub default_provider: Option<ProviderId>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            auto_failover: true,
            load_balancing: true,
            health_check_interval: Duration::from_secs(30),
            default_provider: None,
        }
    }
}

struct ProviderEntry {
    adapter: Arc<dyn ProviderAdapter>,
    config: ProviderConfig,
    health: StdRwLock<ProviderHealth>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpKind {
    Completion,
    Embedding,
}

pub struct Router {
    registry: RwLock<HashMap<ProviderId, ProviderEntry>>,
    config: StdRwLock<RouterConfig>,
    rr_completion: AtomicUsize,
    rr_embedding: AtomicUsize,
    health_task: StdMutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl Router {
    pub fn new(config: RouterConfig) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            registry: RwLock::new(HashMap::new()),
            config: StdRwLock::new(config),
            rr_completion: AtomicUsize::new(0),
            rr_embedding: AtomicUsize::new(0),
            health_task: StdMutex::new(None),
            shutdown,
        })
    }

    /// Start the background health loop. One task per router; calling
    /// again replaces the previous loop.
    pub fn spawn_health_loop(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let mut shutdown_rx = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                let interval = match weak.upgrade() {
                    Some(router) => router.config.read().expect("config lock poisoned").health_check_interval,
                    None => return,
                };
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown_rx.changed() => return,
                }
                let Some(router) = weak.upgrade() else { return };
                router.run_health_probes().await;
            }
        });
        if let Ok(mut slot) = self.health_task.lock() {
            if let Some(previous) = slot.replace(handle) {
                previous.abort();
            }
        }
    }

    /// Probe every registered provider in parallel and publish the
    /// observations. Latency above the degradation threshold downgrades a
    /// healthy result; a failed probe marks the provider unhealthy.
    pub async fn run_health_probes(&self) {
        let adapters: Vec<(ProviderId, Arc<dyn ProviderAdapter>)> = {
            let registry = self.registry.read().await;
            registry
                .iter()
                .map(|(id, entry)| (*id, entry.adapter.clone()))
                .collect()
        };

        let probes = adapters.into_iter().map(|(id, adapter)| async move {
            (id, adapter.health_check().await)
        });
        for (id, outcome) in futures::future::join_all(probes).await {
            let health = match outcome {
                Ok(mut health) => {
                    if health.status == HealthStatus::Healthy
                        && health.latency_ms > DEGRADED_LATENCY_MS
                    {
                        health.status = HealthStatus::Degraded;
                        health.message = Some(format!(
                            "probe latency {}ms above threshold",
                            health.latency_ms
                        ));
                    }
                    health
                }
                Err(e) => ProviderHealth::unhealthy(0, e.to_string()),
            };
            tracing::debug!(provider = %id, status = ?health.status, latency_ms = health.latency_ms, "health probe");
            self.update_provider_health(id, health).await;
        }
    }

    /// Register a provider. The provider starts out healthy and the next
    /// health tick revalidates it.
    pub async fn register_provider(
        &self,
        adapter: Arc<dyn ProviderAdapter>,
        config: ProviderConfig,
    ) {
        let provider = adapter.provider();
        let entry = ProviderEntry {
            adapter,
            config,
            health: StdRwLock::new(ProviderHealth::healthy(0)),
        };
        self.registry.write().await.insert(provider, entry);
        tracing::info!(provider = %provider, "provider registered");
    }

    pub async fn unregister_provider(&self, provider: ProviderId) {
        let removed = self.registry.write().await.remove(&provider);
        if let Some(entry) = removed {
            entry.adapter.close().await;
            tracing::info!(provider = %provider, "provider unregistered");
        }
    }

    pub async fn adapter(&self, provider: ProviderId) -> Option<Arc<dyn ProviderAdapter>> {
        self.registry
            .read()
            .await
            .get(&provider)
            .map(|entry| entry.adapter.clone())
    }

    pub async fn provider_timeout(&self, provider: ProviderId) -> Option<Duration> {
        self.registry
            .read()
            .await
            .get(&provider)
            .map(|entry| entry.config.timeout)
    }

    pub async fn update_provider_health(&self, provider: ProviderId, health: ProviderHealth) {
        let registry = self.registry.read().await;
        if let Some(entry) = registry.get(&provider) {
            if let Ok(mut slot) = entry.health.write() {
                *slot = health;
            }
        }
    }

    pub async fn provider_health(&self, provider: ProviderId) -> Option<ProviderHealth> {
        let registry = self.registry.read().await;
        registry
            .get(&provider)
            .and_then(|entry| entry.health.read().ok().map(|h| h.clone()))
    }

    /// Every registered provider, eligible or not.
    pub async fn registered_providers(&self) -> Vec<ProviderId> {
        self.registry.read().await.keys().copied().collect()
    }

    /// Providers currently eligible for traffic.
    pub async fn available_providers(&self) -> Vec<ProviderId> {
        let registry = self.registry.read().await;
        registry
            .iter()
            .filter(|(_, entry)| {
                entry.config.enabled
                    && entry
                        .health
                        .read()
                        .map(|h| h.status.is_eligible())
                        .unwrap_or(false)
            })
            .map(|(id, _)| *id)
            .collect()
    }

    pub async fn select_provider(
        &self,
        request: &CompletionRequest,
        exclude: &HashSet<ProviderId>,
    ) -> Result<ProviderId, QLensError> {
        self.select(
            request.provider,
            &request.model,
            request.priority,
            OpKind::Completion,
            exclude,
        )
        .await
    }

    pub async fn select_embedding_provider(
        &self,
        request: &EmbeddingRequest,
        exclude: &HashSet<ProviderId>,
    ) -> Result<ProviderId, QLensError> {
        self.select(
            request.provider,
            &request.model,
            RequestPriority::Normal,
            OpKind::Embedding,
            exclude,
        )
        .await
    }

    async fn select(
        &self,
        choice: ProviderChoice,
        model: &str,
        priority: RequestPriority,
        op: OpKind,
        exclude: &HashSet<ProviderId>,
    ) -> Result<ProviderId, QLensError> {
        let config = self.config.read().expect("config lock poisoned").clone();
        let registry = self.registry.read().await;

        // An explicitly pinned provider short-circuits when it is usable;
        // otherwise it is an error unless failover may widen the search.
        if let ProviderChoice::Specific(pinned) = choice {
            if !exclude.contains(&pinned) {
                let usable = registry.get(&pinned).is_some_and(|entry| {
                    entry.config.enabled
                        && entry
                            .health
                            .read()
                            .map(|h| h.status.is_eligible())
                            .unwrap_or(false)
                });
                if usable {
                    return Ok(pinned);
                }
                if !config.auto_failover {
                    return Err(QLensError::provider_unavailable(
                        pinned.as_str(),
                        format!("provider {pinned} is not available"),
                    ));
                }
            }
        }

        struct Candidate {
            provider: ProviderId,
            priority: u32,
            latency_ms: u64,
        }

        let eligible: Vec<Candidate> = registry
            .iter()
            .filter(|(id, entry)| {
                !exclude.contains(id)
                    && entry.config.enabled
                    && entry
                        .health
                        .read()
                        .map(|h| h.status.is_eligible())
                        .unwrap_or(false)
            })
            .map(|(id, entry)| Candidate {
                provider: *id,
                priority: entry.config.priority,
                latency_ms: entry.health.read().map(|h| h.latency_ms).unwrap_or(0),
            })
            .collect();

        if eligible.is_empty() {
            return Err(QLensError::service_unavailable(
                "no healthy providers available",
            ));
        }

        let mut candidates: Vec<Candidate> = eligible
            .into_iter()
            .filter(|c| {
                registry.get(&c.provider).is_some_and(|entry| {
                    entry.adapter.supports_model(model)
                        && (op != OpKind::Embedding || entry.adapter.supports_embeddings(model))
                })
            })
            .collect();

        if candidates.is_empty() {
            return Err(QLensError::model_unavailable(model));
        }

        // Elevated request priority trades configured ordering for observed
        // latency and takes the fastest candidate outright.
        if priority.is_elevated() {
            candidates.sort_by_key(|c| c.latency_ms);
            return Ok(candidates[0].provider);
        }

        candidates.sort_by(|a, b| b.priority.cmp(&a.priority));

        if let Some(default) = config.default_provider {
            if let Some(c) = candidates.iter().find(|c| c.provider == default) {
                return Ok(c.provider);
            }
        }

        if config.load_balancing && candidates.len() > 1 {
            let counter = match op {
                OpKind::Completion => &self.rr_completion,
                OpKind::Embedding => &self.rr_embedding,
            };
            let slot = counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
            return Ok(candidates[slot].provider);
        }

        Ok(candidates[0].provider)
    }

    pub fn configure(&self, config: RouterConfig) {
        *self.config.write().expect("config lock poisoned") = config;
    }

    pub fn config(&self) -> RouterConfig {
        self.config.read().expect("config lock poisoned").clone()
    }

    /// Ready when at least one provider can take traffic.
    pub async fn health_check(&self) -> Result<(), QLensError> {
        if self.available_providers().await.is_empty() {
            Err(QLensError::service_unavailable(
                "no healthy providers available",
            ))
        } else {
            Ok(())
        }
    }

    /// Stop the health loop and close every adapter.
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        if let Ok(mut slot) = self.health_task.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
        let mut registry = self.registry.write().await;
        for (_, entry) in registry.drain() {
            entry.adapter.close().await;
        }
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Ok(mut slot) = self.health_task.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}
