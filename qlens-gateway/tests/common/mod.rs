//! Shared test fixtures: a scriptable in-process provider adapter.
#![allow(dead_code)]

use qlens_core::error::QLensError;
use qlens_core::models::{
    Choice, CompletionRequest, CompletionResponse, EmbeddingRequest, EmbeddingResponse,
    FinishReason, Message, Model, ModelCapability, ModelStatus, ProviderId, StreamFrame, Tariff,
    Usage,
};
use qlens_core::providers::{
    CompletionStream, ProviderAdapter, ProviderConfig, ProviderHealth,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

pub fn completion_response(provider: ProviderId, id: &str) -> CompletionResponse {
    CompletionResponse {
        id: id.to_string(),
        object: "chat.completion".to_string(),
        created: 1_700_000_000,
        model: "gpt-35-turbo".to_string(),
        provider,
        choices: vec![Choice {
            index: 0,
            message: Message::assistant("stubbed answer"),
            finish_reason: FinishReason::Stop,
        }],
        usage: Usage::new(10, 5, 0.001),
        cache_hit: false,
    }
}

/// Behavior of one `create_completion_stream` call.
pub enum StreamScript {
    Frames(Vec<StreamFrame>),
    SetupError(QLensError),
    /// A stream that never produces a frame.
    Stalled,
}

pub struct StubAdapter {
    provider: ProviderId,
    models: Vec<String>,
    embeddings: bool,
    /// Outcomes consumed one per completion call; afterwards every call
    /// succeeds with a default response.
    scripted: Mutex<VecDeque<Result<CompletionResponse, QLensError>>>,
    stream: Mutex<Option<StreamScript>>,
    pub completion_calls: AtomicU32,
}

impl StubAdapter {
    pub fn healthy(provider: ProviderId, models: &[&str]) -> Self {
        Self {
            provider,
            models: models.iter().map(|s| s.to_string()).collect(),
            embeddings: false,
            scripted: Mutex::new(VecDeque::new()),
            stream: Mutex::new(None),
            completion_calls: AtomicU32::new(0),
        }
    }

    pub fn with_embeddings(mut self) -> Self {
        self.embeddings = true;
        self
    }

    pub fn with_scripted_results(
        self,
        results: Vec<Result<CompletionResponse, QLensError>>,
    ) -> Self {
        *self.scripted.lock().unwrap() = results.into();
        self
    }

    pub fn with_stream(self, script: StreamScript) -> Self {
        *self.stream.lock().unwrap() = Some(script);
        self
    }

    pub fn calls(&self) -> u32 {
        self.completion_calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for StubAdapter {
    fn provider(&self) -> ProviderId {
        self.provider
    }

    fn supports_model(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }

    fn supports_embeddings(&self, model: &str) -> bool {
        self.embeddings && self.supports_model(model)
    }

    async fn list_models(&self) -> Result<Vec<Model>, QLensError> {
        Ok(self
            .models
            .iter()
            .map(|id| Model {
                id: id.clone(),
                provider: self.provider,
                name: id.clone(),
                description: None,
                capabilities: if self.embeddings {
                    vec![ModelCapability::Completion, ModelCapability::Embedding]
                } else {
                    vec![ModelCapability::Completion]
                },
                context_length: 4096,
                pricing: Tariff::free(),
                status: ModelStatus::Available,
                active: true,
            })
            .collect())
    }

    async fn get_model(&self, id: &str) -> Result<Model, QLensError> {
        self.list_models()
            .await?
            .into_iter()
            .find(|m| m.id == id)
            .ok_or_else(|| QLensError::not_found(format!("model {id} not found")))
    }

    async fn health_check(&self) -> Result<ProviderHealth, QLensError> {
        Ok(ProviderHealth::healthy(5))
    }

    async fn create_completion(
        &self,
        _request: &CompletionRequest,
    ) -> Result<CompletionResponse, QLensError> {
        self.completion_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(result) = self.scripted.lock().unwrap().pop_front() {
            return result;
        }
        Ok(completion_response(self.provider, "chatcmpl-stub"))
    }

    async fn create_completion_stream(
        &self,
        _request: &CompletionRequest,
    ) -> Result<CompletionStream, QLensError> {
        match self.stream.lock().unwrap().take() {
            Some(StreamScript::Frames(frames)) => Ok(Box::pin(futures::stream::iter(frames))),
            Some(StreamScript::SetupError(error)) => Err(error),
            Some(StreamScript::Stalled) => Ok(Box::pin(futures::stream::pending())),
            None => Ok(Box::pin(futures::stream::iter(vec![StreamFrame::Done]))),
        }
    }

    async fn create_embeddings(
        &self,
        request: &EmbeddingRequest,
    ) -> Result<EmbeddingResponse, QLensError> {
        Ok(EmbeddingResponse {
            object: "list".to_string(),
            data: vec![qlens_core::models::Embedding {
                object: "embedding".to_string(),
                embedding: vec![0.1, 0.2, 0.3],
                index: 0,
            }],
            model: request.model.clone(),
            provider: self.provider,
            usage: Usage::new(3, 0, 0.0),
            cache_hit: false,
        })
    }

    async fn configure(&self, _config: ProviderConfig) -> Result<(), QLensError> {
        Ok(())
    }

    async fn close(&self) {}
}
