//! Azure-hosted OpenAI adapter.

use crate::error::QLensError;
use crate::models::{
    Choice, CompletionRequest, CompletionResponse, Delta, Embedding, EmbeddingRequest,
    EmbeddingResponse, FinishReason, Message, Model, ModelCapability, ModelStatus, ProviderId,
    Role, StreamChoice, StreamDelta, StreamFrame, Tariff, Usage,
};
use crate::providers::{
    http, retry, retry::RetryPolicy, CompletionStream, ProviderAdapter, ProviderConfig,
    ProviderHealth,
};
use async_stream::stream;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use std::time::Instant;

const DEFAULT_ENDPOINT: &str = "https://api.openai.azure.com";
const DEFAULT_API_VERSION: &str = "2024-02-15-preview";

pub struct AzureOpenAiAdapter {
    unary: Client,
    streaming: Client,
    config: RwLock<ProviderConfig>,
    catalog: Vec<Model>,
}

#[derive(Debug, Clone, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Clone, Serialize)]
struct ChatBody {
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    id: String,
    #[serde(default)]
    created: u64,
    choices: Vec<ChatReplyChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatReplyChoice {
    index: u32,
    message: ChatReplyMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatReplyMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct StreamChunkWire {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    choices: Vec<StreamChoiceWire>,
}

#[derive(Debug, Deserialize)]
struct StreamChoiceWire {
    index: u32,
    delta: DeltaWire,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeltaWire {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct EmbeddingBody {
    input: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    encoding_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingReply {
    data: Vec<EmbeddingReplyItem>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingReplyItem {
    embedding: Vec<f32>,
    index: u32,
}

impl AzureOpenAiAdapter {
    pub fn new(config: ProviderConfig) -> Result<Self, QLensError> {
        Ok(Self {
            unary: http::unary_client()?,
            streaming: http::streaming_client()?,
            config: RwLock::new(config),
            catalog: catalog(),
        })
    }

    fn snapshot(&self) -> ProviderConfig {
        self.config.read().expect("config lock poisoned").clone()
    }

    fn base_url(config: &ProviderConfig) -> String {
        config
            .endpoint
            .clone()
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string())
            .trim_end_matches('/')
            .to_string()
    }

    fn deployment_url(config: &ProviderConfig, deployment: &str, operation: &str) -> String {
        let api_version = config
            .api_version
            .as_deref()
            .unwrap_or(DEFAULT_API_VERSION);
        format!(
            "{}/openai/deployments/{deployment}/{operation}?api-version={api_version}",
            Self::base_url(config)
        )
    }

    fn chat_body(request: &CompletionRequest, stream: bool) -> ChatBody {
        ChatBody {
            messages: wire_messages(&request.messages),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            top_p: request.top_p,
            stop: request.stop.clone(),
            presence_penalty: request.presence_penalty,
            frequency_penalty: request.frequency_penalty,
            user: request.user.clone(),
            stream: stream.then_some(true),
        }
    }

    fn convert_reply(&self, model: &str, reply: ChatReply) -> CompletionResponse {
        let usage = reply
            .usage
            .map(|u| {
                let cost = tariff(model).map_or(0.0, |t| t.cost(u.prompt_tokens, u.completion_tokens));
                Usage::new(u.prompt_tokens, u.completion_tokens, cost)
            })
            .unwrap_or_default();

        CompletionResponse {
            id: reply.id,
            object: "chat.completion".to_string(),
            created: reply.created,
            model: model.to_string(),
            provider: ProviderId::AzureOpenAi,
            choices: reply
                .choices
                .into_iter()
                .map(|c| Choice {
                    index: c.index,
                    message: Message::assistant(c.message.content.unwrap_or_default()),
                    finish_reason: FinishReason::from_provider(
                        c.finish_reason.as_deref().unwrap_or("stop"),
                    ),
                })
                .collect(),
            usage,
            cache_hit: false,
        }
    }
}

fn wire_role(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

/// Collapse each message's content parts to a single text string. The
/// deployments served here are text models, so non-text parts are dropped.
fn wire_messages(messages: &[Message]) -> Vec<WireMessage> {
    messages
        .iter()
        .map(|m| WireMessage {
            role: wire_role(m.role),
            content: m.text(),
        })
        .collect()
}

/// HTTP status to error classification for OpenAI-shaped responses. The
/// provider's own error message, when parseable, replaces ours; the type
/// mapping is fixed.
fn classify_status(status: u16, body: &str) -> QLensError {
    let provider = ProviderId::AzureOpenAi.as_str();
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")?
                .get("message")?
                .as_str()
                .map(|s| s.to_string())
        })
        .unwrap_or_else(|| format!("{provider} returned HTTP {status}"));

    let err = match status {
        400 => QLensError::validation("request", message),
        401 => QLensError::authentication(message),
        403 => QLensError::authorization(message),
        408 => QLensError::timeout(message),
        409 => QLensError::conflict(message),
        429 => QLensError::too_many_requests(message),
        500..=599 => QLensError::provider_error(provider, message),
        _ => QLensError::internal(message),
    };
    err.with_provider(provider)
        .with_internal(truncate(body, 512))
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

fn tariff(model: &str) -> Option<Tariff> {
    match model {
        "gpt-4" => Some(Tariff::per_token(3.0e-5, 6.0e-5)),
        "gpt-4-turbo" => Some(Tariff::per_token(1.0e-5, 3.0e-5)),
        "gpt-35-turbo" => Some(Tariff::per_token(5.0e-7, 1.5e-6)),
        "gpt-35-turbo-16k" => Some(Tariff::per_token(3.0e-6, 4.0e-6)),
        "text-embedding-ada-002" => Some(Tariff::per_token(1.0e-7, 0.0)),
        "text-embedding-3-small" => Some(Tariff::per_token(2.0e-8, 0.0)),
        "text-embedding-3-large" => Some(Tariff::per_token(1.3e-7, 0.0)),
        _ => None,
    }
}

fn catalog() -> Vec<Model> {
    use ModelCapability as Cap;
    let entry = |id: &str, name: &str, capabilities: Vec<ModelCapability>, context_length: u32| {
        Model {
            id: id.to_string(),
            provider: ProviderId::AzureOpenAi,
            name: name.to_string(),
            description: None,
            capabilities,
            context_length,
            pricing: tariff(id).unwrap_or(Tariff::free()),
            status: ModelStatus::Available,
            active: true,
        }
    };
    vec![
        entry(
            "gpt-4",
            "GPT-4",
            vec![Cap::Completion, Cap::FunctionCalling],
            8_192,
        ),
        entry(
            "gpt-4-turbo",
            "GPT-4 Turbo",
            vec![Cap::Completion, Cap::FunctionCalling, Cap::Vision],
            128_000,
        ),
        entry(
            "gpt-35-turbo",
            "GPT-3.5 Turbo",
            vec![Cap::Completion, Cap::FunctionCalling],
            4_096,
        ),
        entry(
            "gpt-35-turbo-16k",
            "GPT-3.5 Turbo 16k",
            vec![Cap::Completion, Cap::FunctionCalling],
            16_384,
        ),
        entry(
            "text-embedding-ada-002",
            "Ada Embedding v2",
            vec![Cap::Embedding],
            8_191,
        ),
        entry(
            "text-embedding-3-small",
            "Embedding v3 Small",
            vec![Cap::Embedding],
            8_191,
        ),
        entry(
            "text-embedding-3-large",
            "Embedding v3 Large",
            vec![Cap::Embedding],
            8_191,
        ),
    ]
}

#[async_trait::async_trait]
impl ProviderAdapter for AzureOpenAiAdapter {
    fn provider(&self) -> ProviderId {
        ProviderId::AzureOpenAi
    }

    fn supports_model(&self, model: &str) -> bool {
        self.catalog.iter().any(|m| m.id == model)
            || self
                .config
                .read()
                .expect("config lock poisoned")
                .model_map
                .contains_key(model)
    }

    fn supports_embeddings(&self, model: &str) -> bool {
        self.catalog
            .iter()
            .any(|m| m.id == model && m.supports(ModelCapability::Embedding))
    }

    async fn list_models(&self) -> Result<Vec<Model>, QLensError> {
        Ok(self.catalog.clone())
    }

    async fn get_model(&self, id: &str) -> Result<Model, QLensError> {
        self.catalog
            .iter()
            .find(|m| m.id == id)
            .cloned()
            .ok_or_else(|| {
                QLensError::not_found(format!("model {id} not found"))
                    .with_model(id)
                    .with_provider(ProviderId::AzureOpenAi.as_str())
            })
    }

    async fn health_check(&self) -> Result<ProviderHealth, QLensError> {
        let config = self.snapshot();
        let api_version = config
            .api_version
            .as_deref()
            .unwrap_or(DEFAULT_API_VERSION);
        let url = format!(
            "{}/openai/models?api-version={api_version}",
            Self::base_url(&config)
        );
        let start = Instant::now();
        let result = self
            .unary
            .get(&url)
            .header("api-key", &config.api_key)
            .send()
            .await;
        let latency_ms = start.elapsed().as_millis() as u64;

        Ok(match result {
            Ok(resp) if resp.status().is_success() => ProviderHealth::healthy(latency_ms),
            Ok(resp) => ProviderHealth::unhealthy(
                latency_ms,
                format!("health probe returned HTTP {}", resp.status().as_u16()),
            ),
            Err(e) => ProviderHealth::unhealthy(latency_ms, e.to_string()),
        })
    }

    async fn create_completion(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, QLensError> {
        let config = self.snapshot();
        let deployment = config.resolve_model(&request.model);
        let url = Self::deployment_url(&config, &deployment, "chat/completions");
        let body = Self::chat_body(request, false);

        let client = self.unary.clone();
        let reply = retry::with_backoff(RetryPolicy::http(config.retries), move |_| {
            let client = client.clone();
            let url = url.clone();
            let api_key = config.api_key.clone();
            let body = body.clone();
            async move {
                let resp = client
                    .post(&url)
                    .header("api-key", api_key)
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| {
                        http::classify_transport_error(ProviderId::AzureOpenAi.as_str(), e)
                    })?;
                let status = resp.status();
                if !status.is_success() {
                    let text = resp.text().await.unwrap_or_default();
                    return Err(classify_status(status.as_u16(), &text));
                }
                resp.json::<ChatReply>().await.map_err(|e| {
                    QLensError::provider_error(
                        ProviderId::AzureOpenAi.as_str(),
                        "unparseable completion response",
                    )
                    .with_internal(e.to_string())
                })
            }
        })
        .await?;

        Ok(self.convert_reply(&request.model, reply))
    }

    async fn create_completion_stream(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionStream, QLensError> {
        let config = self.snapshot();
        let deployment = config.resolve_model(&request.model);
        let url = Self::deployment_url(&config, &deployment, "chat/completions");
        let body = Self::chat_body(request, true);

        let resp = self
            .streaming
            .post(&url)
            .header("api-key", &config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| http::classify_transport_error(ProviderId::AzureOpenAi.as_str(), e))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &text));
        }

        let model = request.model.clone();
        let stream = stream! {
            let mut bytes = resp.bytes_stream();
            let mut buffer = String::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield StreamFrame::Error(http::classify_transport_error(
                            ProviderId::AzureOpenAi.as_str(),
                            e,
                        ));
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim().to_string();
                    buffer = buffer[line_end + 1..].to_string();
                    let Some(payload) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if payload == "[DONE]" {
                        yield StreamFrame::Done;
                        return;
                    }
                    match serde_json::from_str::<StreamChunkWire>(payload) {
                        Ok(chunk) => {
                            let id = chunk.id.unwrap_or_default();
                            for choice in chunk.choices {
                                yield StreamFrame::Delta(StreamDelta {
                                    id: id.clone(),
                                    model: model.clone(),
                                    provider: ProviderId::AzureOpenAi,
                                    choice: StreamChoice {
                                        index: choice.index,
                                        delta: Delta {
                                            role: parse_role(choice.delta.role.as_deref()),
                                            content: choice.delta.content,
                                        },
                                        finish_reason: choice
                                            .finish_reason
                                            .as_deref()
                                            .map(FinishReason::from_provider),
                                    },
                                });
                            }
                        }
                        Err(e) => {
                            yield StreamFrame::Error(
                                QLensError::provider_error(
                                    ProviderId::AzureOpenAi.as_str(),
                                    "unparseable stream chunk",
                                )
                                .with_internal(e.to_string()),
                            );
                            return;
                        }
                    }
                }
            }
            // Upstream closed without [DONE]; terminate cleanly anyway.
            yield StreamFrame::Done;
        };
        Ok(Box::pin(stream))
    }

    async fn create_embeddings(
        &self,
        request: &EmbeddingRequest,
    ) -> Result<EmbeddingResponse, QLensError> {
        let config = self.snapshot();
        let deployment = config.resolve_model(&request.model);
        let url = Self::deployment_url(&config, &deployment, "embeddings");
        let body = EmbeddingBody {
            input: request.input.clone(),
            encoding_format: request.encoding_format.clone(),
            dimensions: request.dimensions,
            user: request.user.clone(),
        };

        let client = self.unary.clone();
        let reply = retry::with_backoff(RetryPolicy::http(config.retries), move |_| {
            let client = client.clone();
            let url = url.clone();
            let api_key = config.api_key.clone();
            let body = body.clone();
            async move {
                let resp = client
                    .post(&url)
                    .header("api-key", api_key)
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| {
                        http::classify_transport_error(ProviderId::AzureOpenAi.as_str(), e)
                    })?;
                let status = resp.status();
                if !status.is_success() {
                    let text = resp.text().await.unwrap_or_default();
                    return Err(classify_status(status.as_u16(), &text));
                }
                resp.json::<EmbeddingReply>().await.map_err(|e| {
                    QLensError::provider_error(
                        ProviderId::AzureOpenAi.as_str(),
                        "unparseable embedding response",
                    )
                    .with_internal(e.to_string())
                })
            }
        })
        .await?;

        let usage = reply
            .usage
            .map(|u| {
                let cost = tariff(&request.model)
                    .map_or(0.0, |t| t.cost(u.prompt_tokens, u.completion_tokens));
                Usage::new(u.prompt_tokens, u.completion_tokens, cost)
            })
            .unwrap_or_default();

        Ok(EmbeddingResponse {
            object: "list".to_string(),
            data: reply
                .data
                .into_iter()
                .map(|e| Embedding {
                    object: "embedding".to_string(),
                    embedding: e.embedding,
                    index: e.index,
                })
                .collect(),
            model: request.model.clone(),
            provider: ProviderId::AzureOpenAi,
            usage,
            cache_hit: false,
        })
    }

    async fn configure(&self, config: ProviderConfig) -> Result<(), QLensError> {
        if config.provider != ProviderId::AzureOpenAi {
            return Err(QLensError::configuration(
                "config provider does not match adapter",
            ));
        }
        *self.config.write().expect("config lock poisoned") = config;
        Ok(())
    }

    async fn close(&self) {}
}

fn parse_role(role: Option<&str>) -> Option<Role> {
    match role {
        Some("assistant") => Some(Role::Assistant),
        Some("system") => Some(Role::System),
        Some("user") => Some(Role::User),
        Some("tool") => Some(Role::Tool),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::models::ContentPart;

    #[test]
    fn multi_part_content_collapses_to_one_string() {
        let messages = vec![Message::new(
            Role::User,
            vec![
                ContentPart::text("first "),
                ContentPart {
                    part_type: crate::models::ContentPartType::ImageUrl,
                    text: None,
                    image_url: Some(serde_json::json!({"url": "x"})),
                },
                ContentPart::text("second"),
            ],
        )];
        let wire = wire_messages(&messages);
        assert_eq!(wire.len(), 1);
        assert_eq!(wire[0].role, "user");
        assert_eq!(wire[0].content, "first second");
    }

    #[test]
    fn role_mapping_covers_the_full_set() {
        assert_eq!(wire_role(Role::System), "system");
        assert_eq!(wire_role(Role::User), "user");
        assert_eq!(wire_role(Role::Assistant), "assistant");
        assert_eq!(wire_role(Role::Tool), "tool");
    }

    #[test]
    fn status_classification_follows_the_table() {
        let cases = [
            (400, ErrorKind::Validation),
            (401, ErrorKind::Authentication),
            (403, ErrorKind::Authorization),
            (408, ErrorKind::Timeout),
            (409, ErrorKind::Conflict),
            (429, ErrorKind::TooManyRequests),
            (500, ErrorKind::ProviderError),
            (502, ErrorKind::ProviderError),
            (503, ErrorKind::ProviderError),
            (418, ErrorKind::Internal),
        ];
        for (status, kind) in cases {
            assert_eq!(classify_status(status, "").kind, kind, "status {status}");
        }
        assert!(classify_status(429, "").retryable);
        assert!(classify_status(503, "").retryable);
        assert!(!classify_status(400, "").retryable);
    }

    #[test]
    fn provider_error_body_overrides_the_message_only() {
        let body = r#"{"error":{"message":"deployment is busy","code":"x"}}"#;
        let err = classify_status(503, body);
        assert_eq!(err.kind, ErrorKind::ProviderError);
        assert_eq!(err.message, "deployment is busy");
    }

    #[test]
    fn unknown_model_costs_nothing() {
        assert!(tariff("gpt-9-experimental").is_none());
        let cost = tariff("gpt-9-experimental").map_or(0.0, |t| t.cost(1000, 1000));
        assert_eq!(cost, 0.0);
    }

    #[test]
    fn known_model_cost_matches_tariff() {
        let t = tariff("gpt-35-turbo").unwrap();
        let cost = t.cost(2000, 1000);
        assert!((cost - (2000.0 * 5.0e-7 + 1000.0 * 1.5e-6)).abs() < 1e-12);
    }

    #[tokio::test]
    async fn configure_replaces_config_for_the_matching_provider() {
        let adapter = AzureOpenAiAdapter::new(
            ProviderConfig::new(ProviderId::AzureOpenAi).with_api_key("old"),
        )
        .unwrap();

        adapter
            .configure(
                ProviderConfig::new(ProviderId::AzureOpenAi)
                    .with_api_key("new")
                    .with_model_mapping("gpt-35-turbo", "prod-gpt35"),
            )
            .await
            .unwrap();
        assert!(adapter.supports_model("gpt-35-turbo"));
        assert_eq!(adapter.snapshot().api_key, "new");

        let err = adapter
            .configure(ProviderConfig::new(ProviderId::AwsBedrock))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Configuration);
    }

    #[test]
    fn catalog_separates_completion_and_embedding_models() {
        let models = catalog();
        let chat = models.iter().find(|m| m.id == "gpt-35-turbo").unwrap();
        assert!(chat.supports(ModelCapability::Completion));
        assert!(!chat.supports(ModelCapability::Embedding));

        let emb = models
            .iter()
            .find(|m| m.id == "text-embedding-ada-002")
            .unwrap();
        assert!(emb.supports(ModelCapability::Embedding));
        assert!(!emb.supports(ModelCapability::Completion));
    }
}
