//! AWS Bedrock adapter for Claude-family models.
//!
//! Unary calls go through `InvokeModel`, streaming through
//! `InvokeModelWithResponseStream`. Requests are signed with SigV4; the
//! response stream is the AWS binary event-stream framing (prelude,
//! headers, payload, CRC) whose payloads wrap base64 `bytes` holding the
//! actual Claude event JSON.

use crate::error::QLensError;
use crate::models::{
    Choice, CompletionRequest, CompletionResponse, Delta, EmbeddingRequest, EmbeddingResponse,
    FinishReason, Message, Model, ModelCapability, ModelStatus, ProviderId, Role, StreamChoice,
    StreamDelta, StreamFrame, Tariff, Usage,
};
use crate::providers::{
    http, retry, retry::RetryPolicy, sigv4::SigV4Signer, CompletionStream, ProviderAdapter,
    ProviderConfig, ProviderHealth,
};
use async_stream::stream;
use base64::Engine as _;
use chrono::Utc;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use std::time::Instant;

const ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";
const DEFAULT_MAX_TOKENS: u32 = 1024;
const SIGNING_SERVICE: &str = "bedrock";

pub struct BedrockAdapter {
    unary: Client,
    streaming: Client,
    config: RwLock<ProviderConfig>,
    catalog: Vec<Model>,
}

#[derive(Debug, Clone, Serialize)]
struct ClaudeMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Clone, Serialize)]
struct ClaudeBody {
    anthropic_version: &'static str,
    max_tokens: u32,
    messages: Vec<ClaudeMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct ClaudeReply {
    id: String,
    content: Vec<ClaudeContent>,
    #[serde(default)]
    stop_reason: Option<String>,
    usage: ClaudeUsage,
}

#[derive(Debug, Deserialize)]
struct ClaudeContent {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct ClaudeUsage {
    input_tokens: u32,
    output_tokens: u32,
}

impl BedrockAdapter {
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

    fn signer(config: &ProviderConfig) -> Result<(SigV4Signer, String), QLensError> {
        let region = config
            .region
            .clone()
            .ok_or_else(|| QLensError::configuration("bedrock region is not configured"))?;
        let access_key = config
            .access_key_id
            .clone()
            .ok_or_else(|| QLensError::configuration("bedrock access key is not configured"))?;
        let secret_key = config
            .secret_access_key
            .clone()
            .ok_or_else(|| QLensError::configuration("bedrock secret key is not configured"))?;
        Ok((
            SigV4Signer::new(
                access_key,
                secret_key,
                config.session_token.clone(),
                region.clone(),
                SIGNING_SERVICE,
            ),
            region,
        ))
    }

    fn runtime_url(config: &ProviderConfig, region: &str, model_id: &str, operation: &str) -> String {
        match &config.endpoint {
            Some(endpoint) => format!(
                "{}/model/{model_id}/{operation}",
                endpoint.trim_end_matches('/')
            ),
            None => format!(
                "https://bedrock-runtime.{region}.amazonaws.com/model/{model_id}/{operation}"
            ),
        }
    }

    fn claude_body(request: &CompletionRequest) -> ClaudeBody {
        let (system, messages) = claude_messages(&request.messages);
        ClaudeBody {
            anthropic_version: ANTHROPIC_VERSION,
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages,
            system,
            temperature: request.temperature,
            top_p: request.top_p,
            stop_sequences: request.stop.clone(),
        }
    }

    async fn signed_send(
        client: &Client,
        signer: &SigV4Signer,
        method: &str,
        url: &str,
        body: Vec<u8>,
    ) -> Result<reqwest::Response, QLensError> {
        let headers = signer.sign(
            method,
            url,
            &[
                ("content-type", "application/json"),
                ("accept", "application/json"),
            ],
            &body,
            Utc::now(),
        )?;
        let mut builder = match method {
            "GET" => client.get(url),
            _ => client.post(url).body(body),
        };
        for (name, value) in &headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder
            .send()
            .await
            .map_err(|e| http::classify_transport_error(ProviderId::AwsBedrock.as_str(), e))
    }

    fn convert_reply(&self, model: &str, reply: ClaudeReply) -> CompletionResponse {
        let text: String = reply.content.into_iter().map(|c| c.text).collect();
        let cost = tariff(model).map_or(0.0, |t| {
            t.cost(reply.usage.input_tokens, reply.usage.output_tokens)
        });
        CompletionResponse {
            id: reply.id,
            object: "chat.completion".to_string(),
            created: Utc::now().timestamp() as u64,
            model: model.to_string(),
            provider: ProviderId::AwsBedrock,
            choices: vec![Choice {
                index: 0,
                message: Message::assistant(text),
                finish_reason: FinishReason::from_provider(
                    reply.stop_reason.as_deref().unwrap_or("end_turn"),
                ),
            }],
            usage: Usage::new(reply.usage.input_tokens, reply.usage.output_tokens, cost),
            cache_hit: false,
        }
    }
}

/// Split a message sequence into Claude's `system` field and the
/// alternating conversation turns. System messages concatenate in order;
/// tool results have no native role here and are carried as user turns.
fn claude_messages(messages: &[Message]) -> (Option<String>, Vec<ClaudeMessage>) {
    let mut system = String::new();
    let mut turns = Vec::new();
    for message in messages {
        let text = message.text();
        match message.role {
            Role::System => {
                if !text.is_empty() {
                    if !system.is_empty() {
                        system.push('\n');
                    }
                    system.push_str(&text);
                }
            }
            Role::Assistant => turns.push(ClaudeMessage {
                role: "assistant",
                content: text,
            }),
            Role::User | Role::Tool => turns.push(ClaudeMessage {
                role: "user",
                content: text,
            }),
        }
    }
    ((!system.is_empty()).then_some(system), turns)
}

/// Resolve friendly Claude names to full Bedrock model identifiers.
fn default_model_alias(model: &str) -> Option<&'static str> {
    match model {
        "claude-3-opus" => Some("anthropic.claude-3-opus-20240229-v1:0"),
        "claude-3-sonnet" => Some("anthropic.claude-3-sonnet-20240229-v1:0"),
        "claude-3-haiku" => Some("anthropic.claude-3-haiku-20240307-v1:0"),
        "claude-3-5-sonnet" => Some("anthropic.claude-3-5-sonnet-20240620-v1:0"),
        _ => None,
    }
}

fn resolve_model(config: &ProviderConfig, model: &str) -> String {
    config
        .model_map
        .get(model)
        .cloned()
        .or_else(|| default_model_alias(model).map(str::to_string))
        .unwrap_or_else(|| model.to_string())
}

fn tariff(model_id: &str) -> Option<Tariff> {
    match model_id {
        "anthropic.claude-3-opus-20240229-v1:0" => Some(Tariff::per_token(1.5e-5, 7.5e-5)),
        "anthropic.claude-3-sonnet-20240229-v1:0" => Some(Tariff::per_token(3.0e-6, 1.5e-5)),
        "anthropic.claude-3-5-sonnet-20240620-v1:0" => Some(Tariff::per_token(3.0e-6, 1.5e-5)),
        "anthropic.claude-3-haiku-20240307-v1:0" => Some(Tariff::per_token(2.5e-7, 1.25e-6)),
        _ => None,
    }
}

fn catalog() -> Vec<Model> {
    let entry = |id: &str, name: &str| Model {
        id: id.to_string(),
        provider: ProviderId::AwsBedrock,
        name: name.to_string(),
        description: None,
        capabilities: vec![ModelCapability::Completion, ModelCapability::Vision],
        context_length: 200_000,
        pricing: tariff(id).unwrap_or(Tariff::free()),
        status: ModelStatus::Available,
        active: true,
    };
    vec![
        entry("anthropic.claude-3-opus-20240229-v1:0", "Claude 3 Opus"),
        entry("anthropic.claude-3-sonnet-20240229-v1:0", "Claude 3 Sonnet"),
        entry(
            "anthropic.claude-3-5-sonnet-20240620-v1:0",
            "Claude 3.5 Sonnet",
        ),
        entry("anthropic.claude-3-haiku-20240307-v1:0", "Claude 3 Haiku"),
    ]
}

/// AWS exception name to error classification. Names arrive in the
/// `x-amzn-errortype` header (possibly suffixed with a URI) or in the
/// body's `__type` field.
fn classify_aws(status: u16, exception: Option<&str>, body: &str, model: &str) -> QLensError {
    let provider = ProviderId::AwsBedrock.as_str();
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message")?.as_str().map(|s| s.to_string()))
        .unwrap_or_else(|| format!("{provider} returned HTTP {status}"));

    // Header values look like "ThrottlingException:" or
    // "com.amazon.coral.validate#ValidationException".
    let exception = exception.map(|e| {
        let e = e.split('#').next_back().unwrap_or(e);
        e.split(':').next().unwrap_or(e).to_string()
    });
    let err = match exception.as_deref() {
        Some("ThrottlingException") => QLensError::too_many_requests(message),
        Some("ValidationException") | Some("InvalidParameterException") => {
            QLensError::validation("request", message)
        }
        Some("ResourceNotFoundException") => QLensError::model_unavailable(model),
        Some("AccessDeniedException") => QLensError::authorization(message),
        Some("UnrecognizedClientException") | Some("InvalidSignatureException") => {
            QLensError::authentication(message)
        }
        Some("ModelTimeoutException") => QLensError::timeout(message),
        Some("ServiceUnavailableException")
        | Some("InternalServerException")
        | Some("ModelNotReadyException") => QLensError::provider_error(provider, message),
        _ => match status {
            400 => QLensError::validation("request", message),
            401 => QLensError::authentication(message),
            403 => QLensError::authorization(message),
            408 => QLensError::timeout(message),
            429 => QLensError::too_many_requests(message),
            500..=599 => QLensError::provider_error(provider, message),
            _ => QLensError::internal(message),
        },
    };
    err.with_provider(provider).with_model(model)
}

fn exception_header(resp: &reqwest::Response) -> Option<String> {
    resp.headers()
        .get("x-amzn-errortype")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// One parse step over the binary event-stream buffer.
enum EventParse {
    /// A complete message: payload bytes plus total consumed length.
    Message(Vec<u8>, usize),
    /// The buffer does not yet hold a complete message.
    Incomplete,
    /// The framing is corrupt; the stream cannot continue.
    Malformed,
}

/// Decode the event-stream prelude (4-byte total length, 4-byte header
/// length, 4-byte CRC), skip the headers, and slice out the payload. The
/// trailing 4 bytes are the message CRC.
fn next_event(buffer: &[u8]) -> EventParse {
    if buffer.len() < 16 {
        return EventParse::Incomplete;
    }
    let total = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
    let header_len = u32::from_be_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]) as usize;
    if total < 16 || 12 + header_len + 4 > total {
        return EventParse::Malformed;
    }
    if buffer.len() < total {
        return EventParse::Incomplete;
    }
    let payload = buffer[12 + header_len..total - 4].to_vec();
    EventParse::Message(payload, total)
}

/// What a decoded Claude stream event means for the frame sequence.
#[derive(Debug, PartialEq)]
enum EventAction {
    Delta { index: u32, text: String },
    Done,
    Skip,
    Unknown(String),
}

fn interpret_event(payload: &[u8]) -> Result<EventAction, QLensError> {
    let value: serde_json::Value = serde_json::from_slice(payload).map_err(|e| {
        QLensError::provider_error(ProviderId::AwsBedrock.as_str(), "unparseable stream event")
            .with_internal(e.to_string())
    })?;

    // Payloads arrive wrapped as {"bytes": "<base64>"} on the wire.
    let value = match value.get("bytes").and_then(|b| b.as_str()) {
        Some(encoded) => {
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| {
                    QLensError::provider_error(
                        ProviderId::AwsBedrock.as_str(),
                        "undecodable stream event payload",
                    )
                    .with_internal(e.to_string())
                })?;
            serde_json::from_slice::<serde_json::Value>(&decoded).map_err(|e| {
                QLensError::provider_error(
                    ProviderId::AwsBedrock.as_str(),
                    "unparseable stream event payload",
                )
                .with_internal(e.to_string())
            })?
        }
        None => value,
    };

    let event_type = value.get("type").and_then(|t| t.as_str()).unwrap_or("");
    match event_type {
        "content_block_delta" => {
            let text = value
                .get("delta")
                .and_then(|d| d.get("text"))
                .and_then(|t| t.as_str())
                .unwrap_or("")
                .to_string();
            let index = value.get("index").and_then(|i| i.as_u64()).unwrap_or(0) as u32;
            Ok(EventAction::Delta { index, text })
        }
        "message_stop" => Ok(EventAction::Done),
        "message_start" | "content_block_start" | "content_block_stop" | "message_delta"
        | "ping" => Ok(EventAction::Skip),
        other => Ok(EventAction::Unknown(other.to_string())),
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for BedrockAdapter {
    fn provider(&self) -> ProviderId {
        ProviderId::AwsBedrock
    }

    fn supports_model(&self, model: &str) -> bool {
        let config = self.config.read().expect("config lock poisoned");
        self.catalog.iter().any(|m| m.id == model)
            || config.model_map.contains_key(model)
            || default_model_alias(model).is_some()
    }

    fn supports_embeddings(&self, _model: &str) -> bool {
        false
    }

    async fn list_models(&self) -> Result<Vec<Model>, QLensError> {
        Ok(self.catalog.clone())
    }

    async fn get_model(&self, id: &str) -> Result<Model, QLensError> {
        let config = self.snapshot();
        let resolved = resolve_model(&config, id);
        self.catalog
            .iter()
            .find(|m| m.id == id || m.id == resolved)
            .cloned()
            .ok_or_else(|| {
                QLensError::not_found(format!("model {id} not found"))
                    .with_model(id)
                    .with_provider(ProviderId::AwsBedrock.as_str())
            })
    }

    async fn health_check(&self) -> Result<ProviderHealth, QLensError> {
        let config = self.snapshot();
        let (signer, region) = Self::signer(&config)?;
        let url = match &config.endpoint {
            Some(endpoint) => format!("{}/foundation-models", endpoint.trim_end_matches('/')),
            None => format!("https://bedrock.{region}.amazonaws.com/foundation-models"),
        };
        let start = Instant::now();
        let result = Self::signed_send(&self.unary, &signer, "GET", &url, Vec::new()).await;
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
        let (signer, region) = Self::signer(&config)?;
        let model_id = resolve_model(&config, &request.model);
        let url = Self::runtime_url(&config, &region, &model_id, "invoke");
        let body = serde_json::to_vec(&Self::claude_body(request)).map_err(|e| {
            QLensError::internal("request serialization failed").with_internal(e.to_string())
        })?;

        let client = self.unary.clone();
        let model_for_err = model_id.clone();
        let reply = retry::with_backoff(RetryPolicy::bedrock(config.retries), move |_| {
            let client = client.clone();
            let signer = signer.clone();
            let url = url.clone();
            let body = body.clone();
            let model = model_for_err.clone();
            async move {
                let resp = Self::signed_send(&client, &signer, "POST", &url, body).await?;
                let status = resp.status();
                if !status.is_success() {
                    let exception = exception_header(&resp);
                    let text = resp.text().await.unwrap_or_default();
                    return Err(classify_aws(
                        status.as_u16(),
                        exception.as_deref(),
                        &text,
                        &model,
                    ));
                }
                resp.json::<ClaudeReply>().await.map_err(|e| {
                    QLensError::provider_error(
                        ProviderId::AwsBedrock.as_str(),
                        "unparseable completion response",
                    )
                    .with_internal(e.to_string())
                })
            }
        })
        .await?;

        Ok(self.convert_reply(&model_id, reply))
    }

    async fn create_completion_stream(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionStream, QLensError> {
        let config = self.snapshot();
        let (signer, region) = Self::signer(&config)?;
        let model_id = resolve_model(&config, &request.model);
        let url = Self::runtime_url(&config, &region, &model_id, "invoke-with-response-stream");
        let body = serde_json::to_vec(&Self::claude_body(request)).map_err(|e| {
            QLensError::internal("request serialization failed").with_internal(e.to_string())
        })?;

        let resp = Self::signed_send(&self.streaming, &signer, "POST", &url, body).await?;
        let status = resp.status();
        if !status.is_success() {
            let exception = exception_header(&resp);
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_aws(
                status.as_u16(),
                exception.as_deref(),
                &text,
                &model_id,
            ));
        }

        let provider = ProviderId::AwsBedrock;
        let stream = stream! {
            let mut bytes = resp.bytes_stream();
            let mut buffer: Vec<u8> = Vec::new();
            loop {
                loop {
                    match next_event(&buffer) {
                        EventParse::Incomplete => break,
                        EventParse::Malformed => {
                            yield StreamFrame::Error(QLensError::provider_error(
                                provider.as_str(),
                                "corrupt event stream framing",
                            ));
                            return;
                        }
                        EventParse::Message(payload, consumed) => {
                            buffer.drain(..consumed);
                            if payload.is_empty() {
                                continue;
                            }
                            match interpret_event(&payload) {
                                Ok(EventAction::Delta { index, text }) => {
                                    yield StreamFrame::Delta(StreamDelta {
                                        id: String::new(),
                                        model: model_id.clone(),
                                        provider,
                                        choice: StreamChoice {
                                            index,
                                            delta: Delta {
                                                role: None,
                                                content: Some(text),
                                            },
                                            finish_reason: None,
                                        },
                                    });
                                }
                                Ok(EventAction::Done) => {
                                    yield StreamFrame::Done;
                                    return;
                                }
                                Ok(EventAction::Skip) => {}
                                Ok(EventAction::Unknown(event_type)) => {
                                    yield StreamFrame::Error(
                                        QLensError::provider_error(
                                            provider.as_str(),
                                            format!("unexpected stream event type {event_type}"),
                                        ),
                                    );
                                    return;
                                }
                                Err(error) => {
                                    yield StreamFrame::Error(error);
                                    return;
                                }
                            }
                        }
                    }
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                    Some(Err(e)) => {
                        yield StreamFrame::Error(http::classify_transport_error(
                            provider.as_str(),
                            e,
                        ));
                        return;
                    }
                    None => {
                        // Upstream closed without message_stop.
                        yield StreamFrame::Done;
                        return;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn create_embeddings(
        &self,
        request: &EmbeddingRequest,
    ) -> Result<EmbeddingResponse, QLensError> {
        Err(QLensError::model_unavailable(request.model.clone())
            .with_provider(ProviderId::AwsBedrock.as_str()))
    }

    async fn configure(&self, config: ProviderConfig) -> Result<(), QLensError> {
        if config.provider != ProviderId::AwsBedrock {
            return Err(QLensError::configuration(
                "config provider does not match adapter",
            ));
        }
        *self.config.write().expect("config lock poisoned") = config;
        Ok(())
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn system_messages_collapse_into_the_system_field() {
        let (system, turns) = claude_messages(&[
            Message::system("be terse"),
            Message::system("answer in french"),
            Message::user("bonjour"),
        ]);
        assert_eq!(system.as_deref(), Some("be terse\nanswer in french"));
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].role, "user");
    }

    #[test]
    fn tool_messages_become_user_turns() {
        let (_, turns) = claude_messages(&[Message::new(
            Role::Tool,
            vec![crate::models::ContentPart::text("tool output")],
        )]);
        assert_eq!(turns[0].role, "user");
        assert_eq!(turns[0].content, "tool output");
    }

    #[test]
    fn friendly_names_resolve_to_bedrock_ids() {
        let config = ProviderConfig::new(ProviderId::AwsBedrock);
        assert_eq!(
            resolve_model(&config, "claude-3-haiku"),
            "anthropic.claude-3-haiku-20240307-v1:0"
        );
        assert_eq!(
            resolve_model(&config, "anthropic.claude-3-opus-20240229-v1:0"),
            "anthropic.claude-3-opus-20240229-v1:0"
        );

        let config = ProviderConfig::new(ProviderId::AwsBedrock)
            .with_model_mapping("fast", "anthropic.claude-3-haiku-20240307-v1:0");
        assert_eq!(
            resolve_model(&config, "fast"),
            "anthropic.claude-3-haiku-20240307-v1:0"
        );
    }

    #[test]
    fn aws_exceptions_classify_by_name_over_status() {
        let err = classify_aws(400, Some("ThrottlingException"), "{}", "m");
        assert_eq!(err.kind, ErrorKind::TooManyRequests);
        assert!(err.retryable);

        let err = classify_aws(
            400,
            Some("com.amazon.coral.validate#ValidationException"),
            r#"{"message":"bad max_tokens"}"#,
            "m",
        );
        assert_eq!(err.kind, ErrorKind::Validation);
        assert_eq!(err.message, "bad max_tokens");
        assert!(!err.retryable);

        let err = classify_aws(404, Some("ResourceNotFoundException"), "{}", "missing-model");
        assert_eq!(err.kind, ErrorKind::ModelUnavailable);

        let err = classify_aws(500, Some("InternalServerException"), "{}", "m");
        assert_eq!(err.kind, ErrorKind::ProviderError);
        assert!(err.retryable);

        let err = classify_aws(503, None, "{}", "m");
        assert_eq!(err.kind, ErrorKind::ProviderError);
    }

    fn frame(payload: &[u8]) -> Vec<u8> {
        let total = 12 + payload.len() + 4;
        let mut out = Vec::new();
        out.extend_from_slice(&(total as u32).to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes()); // prelude crc, unchecked
        out.extend_from_slice(payload);
        out.extend_from_slice(&0u32.to_be_bytes()); // message crc, unchecked
        out
    }

    #[test]
    fn event_framing_roundtrip() {
        let payload = br#"{"type":"ping"}"#;
        let encoded = frame(payload);

        match next_event(&encoded) {
            EventParse::Message(decoded, consumed) => {
                assert_eq!(decoded, payload);
                assert_eq!(consumed, encoded.len());
            }
            _ => panic!("expected a complete message"),
        }

        // A truncated buffer asks for more data instead of failing.
        assert!(matches!(
            next_event(&encoded[..encoded.len() - 2]),
            EventParse::Incomplete
        ));
    }

    #[test]
    fn malformed_prelude_is_rejected() {
        let mut bad = frame(b"{}");
        bad[0..4].copy_from_slice(&4u32.to_be_bytes());
        assert!(matches!(next_event(&bad), EventParse::Malformed));
    }

    #[test]
    fn content_block_delta_yields_text() {
        let action = interpret_event(
            br#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"hel"}}"#,
        )
        .unwrap();
        assert_eq!(
            action,
            EventAction::Delta {
                index: 0,
                text: "hel".into()
            }
        );
    }

    #[test]
    fn base64_wrapped_payloads_are_unwrapped() {
        let inner = r#"{"type":"content_block_delta","index":1,"delta":{"text":"lo"}}"#;
        let wrapped = format!(
            r#"{{"bytes":"{}"}}"#,
            base64::engine::general_purpose::STANDARD.encode(inner)
        );
        let action = interpret_event(wrapped.as_bytes()).unwrap();
        assert_eq!(
            action,
            EventAction::Delta {
                index: 1,
                text: "lo".into()
            }
        );
    }

    #[test]
    fn message_stop_terminates_and_bookkeeping_is_skipped() {
        assert_eq!(
            interpret_event(br#"{"type":"message_stop"}"#).unwrap(),
            EventAction::Done
        );
        for skipped in [
            r#"{"type":"message_start","message":{}}"#,
            r#"{"type":"content_block_start","index":0}"#,
            r#"{"type":"content_block_stop","index":0}"#,
            r#"{"type":"message_delta","delta":{}}"#,
            r#"{"type":"ping"}"#,
        ] {
            assert_eq!(
                interpret_event(skipped.as_bytes()).unwrap(),
                EventAction::Skip,
                "{skipped}"
            );
        }
    }

    #[test]
    fn unknown_event_types_are_surfaced() {
        assert_eq!(
            interpret_event(br#"{"type":"surprise"}"#).unwrap(),
            EventAction::Unknown("surprise".into())
        );
    }

    #[test]
    fn claude_cost_uses_the_resolved_model_tariff() {
        let t = tariff("anthropic.claude-3-haiku-20240307-v1:0").unwrap();
        let cost = t.cost(4000, 2000);
        assert!((cost - (4000.0 * 2.5e-7 + 2000.0 * 1.25e-6)).abs() < 1e-12);
        assert!(tariff("anthropic.titan-embed").is_none());
    }
}
