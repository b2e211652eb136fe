//! # Provider Adapters
//!
//! Uniform contract over heterogeneous provider wire protocols. Each
//! adapter owns its provider's request translation, streaming frame
//! assembly, retry policy, error classification, model catalog, and cost
//! table; the router and orchestrator only ever see the
//! [`ProviderAdapter`] trait and [`crate::error::QLensError`] values.
//!
//! Two adapters ship in-tree:
//!
//! - [`azure::AzureOpenAiAdapter`]: Azure-hosted OpenAI deployments over
//!   JSON HTTP with SSE streaming
//! - [`bedrock::BedrockAdapter`]: Claude-family models on AWS Bedrock via
//!   `InvokeModel` / `InvokeModelWithResponseStream` with SigV4 signing
//!   and binary event-stream decoding
//!
//! The variant set is closed: a new provider is a new adapter module plus
//! a new [`crate::models::ProviderId`] variant.

pub mod azure;
pub mod bedrock;
pub mod http;
pub mod retry;
pub mod sigv4;

use crate::error::QLensError;
use crate::models::{
    CompletionRequest, CompletionResponse, EmbeddingRequest, EmbeddingResponse, Model, ProviderId,
    StreamFrame,
};
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Lazy, finite, non-restartable sequence of streaming frames.
///
/// Guarantees every adapter upholds: frames arrive in upstream order,
/// exactly one terminal frame (`Done` or `Error`) is produced, and
/// dropping the stream stops production and releases the connection.
pub type CompletionStream = Pin<Box<dyn Stream<Item = StreamFrame> + Send>>;

/// Static configuration for one provider.
///
/// Created at startup from the gateway config and hot-replaceable through
/// [`ProviderAdapter::configure`]. Azure-shaped providers use `api_key` +
/// `endpoint` + `api_version`; Bedrock uses the AWS credential triple +
/// `region`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub provider: ProviderId,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub api_version: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    #[serde(default)]
    pub session_token: Option<String>,
    pub enabled: bool,
    /// Higher priority providers are preferred by the router.
    pub priority: u32,
    pub timeout: Duration,
    pub retries: u32,
    /// Client-facing model name to provider deployment/model identifier.
    #[serde(default)]
    pub model_map: HashMap<String, String>,
}

impl ProviderConfig {
    pub fn new(provider: ProviderId) -> Self {
        Self {
            provider,
            api_key: String::new(),
            endpoint: None,
            api_version: None,
            region: None,
            access_key_id: None,
            secret_access_key: None,
            session_token: None,
            enabled: true,
            priority: 0,
            timeout: Duration::from_secs(30),
            retries: 3,
            model_map: HashMap::new(),
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_model_mapping(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.model_map.insert(from.into(), to.into());
        self
    }

    /// Resolve a client-facing model name to the provider-side identifier.
    pub fn resolve_model(&self, model: &str) -> String {
        self.model_map
            .get(model)
            .cloned()
            .unwrap_or_else(|| model.to_string())
    }
}

/// Provider health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    /// Whether a provider in this state may receive traffic.
    pub fn is_eligible(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }
}

/// Health observation for one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub status: HealthStatus,
    pub latency_ms: u64,
    pub error_rate: f64,
    pub last_check: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ProviderHealth {
    pub fn unknown() -> Self {
        Self {
            status: HealthStatus::Unknown,
            latency_ms: 0,
            error_rate: 0.0,
            last_check: Utc::now(),
            message: None,
        }
    }

    pub fn healthy(latency_ms: u64) -> Self {
        Self {
            status: HealthStatus::Healthy,
            latency_ms,
            error_rate: 0.0,
            last_check: Utc::now(),
            message: None,
        }
    }

    pub fn degraded(latency_ms: u64, message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Degraded,
            latency_ms,
            error_rate: 0.0,
            last_check: Utc::now(),
            message: Some(message.into()),
        }
    }

    pub fn unhealthy(latency_ms: u64, message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            latency_ms,
            error_rate: 1.0,
            last_check: Utc::now(),
            message: Some(message.into()),
        }
    }
}

/// Uniform adapter contract over provider wire protocols.
#[async_trait::async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> ProviderId;

    /// Catalog check used by the router's capability filter. Synchronous:
    /// model advertisement is adapter-owned static data, never a network
    /// round trip.
    fn supports_model(&self, model: &str) -> bool;

    /// Whether `model` can serve embedding requests.
    fn supports_embeddings(&self, model: &str) -> bool;

    async fn list_models(&self) -> Result<Vec<Model>, QLensError>;

    async fn get_model(&self, id: &str) -> Result<Model, QLensError>;

    async fn health_check(&self) -> Result<ProviderHealth, QLensError>;

    async fn create_completion(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, QLensError>;

    async fn create_completion_stream(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionStream, QLensError>;

    async fn create_embeddings(
        &self,
        request: &EmbeddingRequest,
    ) -> Result<EmbeddingResponse, QLensError>;

    /// Hot-replace this adapter's configuration.
    async fn configure(&self, config: ProviderConfig) -> Result<(), QLensError>;

    async fn close(&self);
}

/// Build the adapter for a provider configuration.
pub fn build_adapter(config: ProviderConfig) -> Result<Arc<dyn ProviderAdapter>, QLensError> {
    match config.provider {
        ProviderId::AzureOpenAi => Ok(Arc::new(azure::AzureOpenAiAdapter::new(config)?)),
        ProviderId::AwsBedrock => Ok(Arc::new(bedrock::BedrockAdapter::new(config)?)),
    }
}
