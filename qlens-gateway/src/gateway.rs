//! # Gateway Orchestrator
//!
//! The synchronous request path: validation, cache lookup, routing,
//! provider invocation with failover, metrics, and response shaping. One
//! orchestrator instance serves every request concurrently; all state it
//! touches (router registry, cache, metrics) is internally synchronized.
//!
//! The failover loop retries a completion on a different provider only
//! when the failure is marked retryable and the router policy allows it,
//! up to three providers per request. Streaming requests route once and
//! never fail over mid-stream; the derived stream guarantees exactly one
//! terminal frame whatever the upstream does.

use qlens_core::cache::{self, key, CacheConfig, ResponseCache};
use qlens_core::error::{ErrorKind, QLensError};
use qlens_core::models::{
    CompletionRequest, CompletionResponse, Delta, EmbeddingRequest, EmbeddingResponse,
    FinishReason, Model, ProviderId, Role, StreamChoice, StreamDelta, StreamFrame,
};
use qlens_core::observability::{CorrelationIds, MetricsSink, RequestLog};
use qlens_core::providers::{CompletionStream, ProviderHealth};
use qlens_core::router::Router;
use async_stream::stream;
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

const OP_COMPLETION: &str = "completion";
const OP_EMBEDDING: &str = "embedding";
const OP_MODELS: &str = "models";

/// Cross-provider attempts per request, the first try included.
const MAX_PROVIDER_ATTEMPTS: usize = 3;

const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Gateway {
    router: Arc<Router>,
    cache: Option<Arc<dyn ResponseCache>>,
    cache_config: CacheConfig,
    metrics: Arc<dyn MetricsSink>,
    response_ids: CorrelationIds,
    stream_timeout: Duration,
}

impl Gateway {
    pub fn new(router: Arc<Router>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            router,
            cache: None,
            cache_config: CacheConfig {
                enabled: false,
                ..Default::default()
            },
            metrics,
            response_ids: CorrelationIds::new("chatcmpl"),
            stream_timeout: DEFAULT_STREAM_TIMEOUT,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn ResponseCache>, config: CacheConfig) -> Self {
        self.cache = Some(cache);
        self.cache_config = config;
        self
    }

    pub fn with_stream_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeout = timeout;
        self
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Gateway readiness: at least one provider can take traffic.
    pub async fn health_check(&self) -> Result<(), QLensError> {
        self.router.health_check().await
    }

    pub async fn list_models(&self, provider: Option<ProviderId>) -> Result<Vec<Model>, QLensError> {
        self.metrics.inc_request(OP_MODELS);
        let providers = match provider {
            Some(p) => vec![p],
            None => self.router.registered_providers().await,
        };
        let mut models = Vec::new();
        for provider in providers {
            let Some(adapter) = self.router.adapter(provider).await else {
                return Err(QLensError::provider_unavailable(
                    provider.as_str(),
                    format!("provider {provider} is not registered"),
                ));
            };
            models.extend(adapter.list_models().await?);
        }
        Ok(models)
    }

    pub async fn get_model(
        &self,
        id: &str,
        provider: Option<ProviderId>,
    ) -> Result<Model, QLensError> {
        let providers = match provider {
            Some(p) => vec![p],
            None => self.router.registered_providers().await,
        };
        for provider in providers {
            if let Some(adapter) = self.router.adapter(provider).await {
                if let Ok(model) = adapter.get_model(id).await {
                    return Ok(model);
                }
            }
        }
        Err(QLensError::not_found(format!("model {id} not found")).with_model(id))
    }

    pub async fn create_completion(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, QLensError> {
        validate_completion(&request)?;
        let log = RequestLog::start(
            OP_COMPLETION,
            "/v1/completions",
            &request.correlation_id,
            &request.tenant_id,
            &request.user_id,
        );
        self.metrics.inc_request(OP_COMPLETION);

        let cache_key = self
            .cache
            .as_ref()
            .filter(|_| cache::completion_cacheable(self.cache_config.enabled, &request))
            .map(|_| key::completion_key(&request));

        if let (Some(cache), Some(cache_key)) = (&self.cache, &cache_key) {
            if let Some(hit) = cache.get_completion(cache_key).await {
                self.metrics.inc_cache_hit(OP_COMPLETION);
                self.metrics.observe_latency(OP_COMPLETION, log.elapsed());
                log.end(200);
                return Ok(hit);
            }
            self.metrics.inc_cache_miss(OP_COMPLETION);
        }

        let outcome = self.invoke_completion(&request, &log).await;
        match outcome {
            Ok(response) => {
                self.metrics
                    .add_tokens(OP_COMPLETION, response.usage.total_tokens as u64);
                self.metrics.add_cost(OP_COMPLETION, response.usage.cost_usd);
                self.metrics.observe_latency(OP_COMPLETION, log.elapsed());
                if let (Some(cache), Some(cache_key)) = (&self.cache, &cache_key) {
                    let ttl = request.cache_ttl().unwrap_or(self.cache_config.ttl);
                    cache.set_completion(cache_key, &response, ttl).await;
                }
                log.end(200);
                Ok(response)
            }
            Err(error) => {
                self.metrics.inc_error(OP_COMPLETION, error.kind);
                log.end(error.http_status());
                Err(error.with_request_id(request.correlation_id.clone()))
            }
        }
    }

    async fn invoke_completion(
        &self,
        request: &CompletionRequest,
        log: &RequestLog,
    ) -> Result<CompletionResponse, QLensError> {
        let auto_failover = self.router.config().auto_failover;
        let mut tried: HashSet<ProviderId> = HashSet::new();
        let mut last_error: Option<QLensError> = None;

        while tried.len() < MAX_PROVIDER_ATTEMPTS {
            let provider = match self.router.select_provider(request, &tried).await {
                Ok(provider) => provider,
                Err(selection_error) => {
                    // A reselection that comes up empty surfaces the last
                    // provider failure, not the emptiness of the registry.
                    return Err(last_error.unwrap_or(selection_error));
                }
            };
            tried.insert(provider);

            let Some(adapter) = self.router.adapter(provider).await else {
                return Err(QLensError::internal(format!(
                    "selected provider {provider} disappeared from the registry"
                )));
            };
            let timeout = self
                .router
                .provider_timeout(provider)
                .await
                .unwrap_or(DEFAULT_PROVIDER_TIMEOUT);

            log.provider_request(provider, &request.model);
            let started = Instant::now();
            let result = match tokio::time::timeout(timeout, adapter.create_completion(request))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(QLensError::timeout(format!(
                    "provider {provider} exceeded {}s deadline",
                    timeout.as_secs()
                ))
                .with_provider(provider.as_str())),
            };

            match result {
                Ok(response) => {
                    log.provider_response(provider, started.elapsed());
                    self.metrics.inc_provider_request(provider);
                    return Ok(response);
                }
                Err(error) => {
                    log.provider_error(provider, &error);
                    self.metrics.inc_provider_error(provider, error.kind);
                    self.demote_health(provider, &error, timeout).await;
                    if error.retryable && auto_failover {
                        last_error = Some(error);
                        continue;
                    }
                    return Err(error);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| QLensError::service_unavailable("all providers failed")))
    }

    /// Live-traffic health demotion. The next health tick revalidates.
    async fn demote_health(&self, provider: ProviderId, error: &QLensError, timeout: Duration) {
        match error.kind {
            ErrorKind::Timeout => {
                self.router
                    .update_provider_health(
                        provider,
                        ProviderHealth::degraded(
                            timeout.as_millis() as u64,
                            "timed out during live traffic",
                        ),
                    )
                    .await;
            }
            ErrorKind::ProviderUnavailable => {
                self.router
                    .update_provider_health(
                        provider,
                        ProviderHealth::unhealthy(0, "connection failure during live traffic"),
                    )
                    .await;
            }
            _ => {}
        }
    }

    pub async fn create_completion_stream(
        &self,
        mut request: CompletionRequest,
    ) -> Result<CompletionStream, QLensError> {
        request.stream = true;
        validate_completion(&request)?;
        let log = RequestLog::start(
            OP_COMPLETION,
            "/v1/completions",
            &request.correlation_id,
            &request.tenant_id,
            &request.user_id,
        );
        self.metrics.inc_request(OP_COMPLETION);

        let provider = match self.router.select_provider(&request, &HashSet::new()).await {
            Ok(provider) => provider,
            Err(error) => {
                self.metrics.inc_error(OP_COMPLETION, error.kind);
                log.end(error.http_status());
                return Err(error.with_request_id(request.correlation_id.clone()));
            }
        };
        let Some(adapter) = self.router.adapter(provider).await else {
            return Err(QLensError::internal(format!(
                "selected provider {provider} disappeared from the registry"
            )));
        };

        log.provider_request(provider, &request.model);
        let upstream = match adapter.create_completion_stream(&request).await {
            Ok(upstream) => upstream,
            Err(error) => {
                log.provider_error(provider, &error);
                self.metrics.inc_error(OP_COMPLETION, error.kind);
                self.metrics.inc_provider_error(provider, error.kind);
                log.end(error.http_status());
                return Err(error.with_request_id(request.correlation_id.clone()));
            }
        };
        self.metrics.inc_provider_request(provider);

        let response_id = self.response_ids.next();
        let request_id = request.correlation_id.clone();
        let model = request.model.clone();
        let idle_timeout = self.stream_timeout;

        let wrapped = stream! {
            let mut upstream = upstream;
            let mut last_index = 0u32;
            loop {
                let frame = match tokio::time::timeout(idle_timeout, upstream.next()).await {
                    Err(_) => {
                        yield StreamFrame::Error(
                            QLensError::timeout("stream idle timeout exceeded")
                                .with_provider(provider.as_str())
                                .with_request_id(request_id.clone()),
                        );
                        log.end(408);
                        return;
                    }
                    Ok(frame) => frame,
                };
                match frame {
                    Some(StreamFrame::Delta(mut delta)) => {
                        delta.id = response_id.clone();
                        last_index = delta.choice.index;
                        yield StreamFrame::Delta(delta);
                    }
                    Some(StreamFrame::Done) => {
                        yield StreamFrame::Done;
                        log.end(200);
                        return;
                    }
                    Some(StreamFrame::Error(error)) => {
                        // Mid-stream failures pass through; no failover once
                        // frames have flowed.
                        let status = error.http_status();
                        yield StreamFrame::Error(error.with_request_id(request_id.clone()));
                        log.end(status);
                        return;
                    }
                    None => {
                        // Upstream ended without a terminal frame: close the
                        // sequence ourselves.
                        yield StreamFrame::Delta(StreamDelta {
                            id: response_id.clone(),
                            model: model.clone(),
                            provider,
                            choice: StreamChoice {
                                index: last_index,
                                delta: Delta::default(),
                                finish_reason: Some(FinishReason::Stop),
                            },
                        });
                        yield StreamFrame::Done;
                        log.end(200);
                        return;
                    }
                }
            }
        };
        Ok(Box::pin(wrapped))
    }

    pub async fn create_embeddings(
        &self,
        request: EmbeddingRequest,
    ) -> Result<EmbeddingResponse, QLensError> {
        validate_embeddings(&request)?;
        let log = RequestLog::start(
            OP_EMBEDDING,
            "/v1/embeddings",
            &request.correlation_id,
            &request.tenant_id,
            &request.user_id,
        );
        self.metrics.inc_request(OP_EMBEDDING);

        let cache_key = self
            .cache
            .as_ref()
            .filter(|_| cache::embedding_cacheable(self.cache_config.enabled, &request))
            .map(|_| key::embedding_key(&request));

        if let (Some(cache), Some(cache_key)) = (&self.cache, &cache_key) {
            if let Some(hit) = cache.get_embeddings(cache_key).await {
                self.metrics.inc_cache_hit(OP_EMBEDDING);
                self.metrics.observe_latency(OP_EMBEDDING, log.elapsed());
                log.end(200);
                return Ok(hit);
            }
            self.metrics.inc_cache_miss(OP_EMBEDDING);
        }

        let outcome = self.invoke_embeddings(&request, &log).await;
        match outcome {
            Ok(response) => {
                self.metrics
                    .add_tokens(OP_EMBEDDING, response.usage.total_tokens as u64);
                self.metrics.add_cost(OP_EMBEDDING, response.usage.cost_usd);
                self.metrics.observe_latency(OP_EMBEDDING, log.elapsed());
                if let (Some(cache), Some(cache_key)) = (&self.cache, &cache_key) {
                    cache
                        .set_embeddings(cache_key, &response, self.cache_config.ttl)
                        .await;
                }
                log.end(200);
                Ok(response)
            }
            Err(error) => {
                self.metrics.inc_error(OP_EMBEDDING, error.kind);
                log.end(error.http_status());
                Err(error.with_request_id(request.correlation_id.clone()))
            }
        }
    }

    async fn invoke_embeddings(
        &self,
        request: &EmbeddingRequest,
        log: &RequestLog,
    ) -> Result<EmbeddingResponse, QLensError> {
        let auto_failover = self.router.config().auto_failover;
        let mut tried: HashSet<ProviderId> = HashSet::new();
        let mut last_error: Option<QLensError> = None;

        while tried.len() < MAX_PROVIDER_ATTEMPTS {
            let provider = match self.router.select_embedding_provider(request, &tried).await {
                Ok(provider) => provider,
                Err(selection_error) => return Err(last_error.unwrap_or(selection_error)),
            };
            tried.insert(provider);

            let Some(adapter) = self.router.adapter(provider).await else {
                return Err(QLensError::internal(format!(
                    "selected provider {provider} disappeared from the registry"
                )));
            };
            let timeout = self
                .router
                .provider_timeout(provider)
                .await
                .unwrap_or(DEFAULT_PROVIDER_TIMEOUT);

            log.provider_request(provider, &request.model);
            let started = Instant::now();
            let result = match tokio::time::timeout(timeout, adapter.create_embeddings(request))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(QLensError::timeout(format!(
                    "provider {provider} exceeded {}s deadline",
                    timeout.as_secs()
                ))
                .with_provider(provider.as_str())),
            };

            match result {
                Ok(response) => {
                    log.provider_response(provider, started.elapsed());
                    self.metrics.inc_provider_request(provider);
                    return Ok(response);
                }
                Err(error) => {
                    log.provider_error(provider, &error);
                    self.metrics.inc_provider_error(provider, error.kind);
                    self.demote_health(provider, &error, timeout).await;
                    if error.retryable && auto_failover {
                        last_error = Some(error);
                        continue;
                    }
                    return Err(error);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| QLensError::service_unavailable("all providers failed")))
    }
}

fn validate_completion(request: &CompletionRequest) -> Result<(), QLensError> {
    if request.tenant_id.is_empty() {
        return Err(QLensError::validation("tenant_id", "tenant id is required"));
    }
    if request.user_id.is_empty() {
        return Err(QLensError::validation("user_id", "user id is required"));
    }
    if request.correlation_id.is_empty() {
        return Err(QLensError::validation(
            "correlation_id",
            "correlation id is required",
        ));
    }
    if request.model.is_empty() {
        return Err(QLensError::validation("model", "model is required"));
    }
    if request.messages.is_empty() {
        return Err(QLensError::validation(
            "messages",
            "at least one message is required",
        ));
    }
    if request
        .messages
        .iter()
        .any(|m| m.content.is_empty())
    {
        return Err(QLensError::validation(
            "messages",
            "every message needs at least one content part",
        ));
    }
    if let Some(last) = request.messages.last() {
        if !matches!(last.role, Role::User | Role::Tool) {
            return Err(QLensError::validation(
                "messages",
                "last message must come from user or tool",
            ));
        }
    }
    if let Some(temperature) = request.temperature {
        if !(0.0..=2.0).contains(&temperature) {
            return Err(QLensError::validation(
                "temperature",
                "temperature must be between 0 and 2",
            ));
        }
    }
    if let Some(top_p) = request.top_p {
        if !(0.0..=1.0).contains(&top_p) {
            return Err(QLensError::validation(
                "top_p",
                "top_p must be between 0 and 1",
            ));
        }
    }
    if let Some(max_tokens) = request.max_tokens {
        if max_tokens < 1 {
            return Err(QLensError::validation(
                "max_tokens",
                "max_tokens must be at least 1",
            ));
        }
    }
    Ok(())
}

fn validate_embeddings(request: &EmbeddingRequest) -> Result<(), QLensError> {
    if request.tenant_id.is_empty() {
        return Err(QLensError::validation("tenant_id", "tenant id is required"));
    }
    if request.user_id.is_empty() {
        return Err(QLensError::validation("user_id", "user id is required"));
    }
    if request.model.is_empty() {
        return Err(QLensError::validation("model", "model is required"));
    }
    if request.input.is_empty() {
        return Err(QLensError::validation("input", "input must not be empty"));
    }
    if request.input.iter().any(|s| s.is_empty()) {
        return Err(QLensError::validation(
            "input",
            "input entries must not be empty",
        ));
    }
    Ok(())
}
