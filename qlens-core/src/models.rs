//! # Domain Model
//!
//! Request, response, and catalog types shared by every QLens subsystem.
//! The wire shape follows the OpenAI chat-completion and embedding API
//! (`messages`, `choices`, `finish_reason`, `usage`), so clients written
//! against OpenAI-compatible SDKs work unchanged against the gateway.
//!
//! Tenant identity (`tenant_id`, `user_id`, `correlation_id`) travels in
//! HTTP headers, not request bodies; the transport layer fills those fields
//! after deserialization. Optional sampling parameters stay `Option` all the
//! way through the pipeline: absence means "provider default" and must not
//! be replaced with a synthesized value before cache-key computation.
//!
//! ## Providers
//!
//! Two concrete providers are supported:
//!
//! - `azure-openai` (alias `azure`): Azure-hosted OpenAI deployments
//! - `aws-bedrock` (alias `bedrock`): Claude-family models on AWS Bedrock
//!
//! A request may pin one of them or leave `provider` as `auto` to let the
//! router choose.

use crate::error::QLensError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Identifier of a concrete upstream provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderId {
    #[serde(rename = "azure-openai", alias = "azure")]
    AzureOpenAi,
    #[serde(rename = "aws-bedrock", alias = "bedrock")]
    AwsBedrock,
}

impl ProviderId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::AzureOpenAi => "azure-openai",
            ProviderId::AwsBedrock => "aws-bedrock",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider selection requested by the client.
///
/// `auto` delegates the choice to the router; a concrete value pins the
/// request to that provider (subject to health and failover policy).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ProviderChoice {
    #[default]
    #[serde(rename = "auto")]
    Auto,
    #[serde(untagged)]
    Specific(ProviderId),
}

/// Role of a message in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// Kind of a single content part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentPartType {
    Text,
    ImageUrl,
}

/// One element of a message's content sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub part_type: ContentPartType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<serde_json::Value>,
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            part_type: ContentPartType::Text,
            text: Some(text.into()),
            image_url: None,
        }
    }
}

/// A message in a conversation.
///
/// `content` accepts both the bare-string and the part-array form of the
/// OpenAI wire format; a bare string is coerced to a single text part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default, deserialize_with = "content_parts::deserialize")]
    pub content: Vec<ContentPart>,
}

impl Message {
    pub fn new(role: Role, content: Vec<ContentPart>) -> Self {
        Self { role, content }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![ContentPart::text(text)])
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![ContentPart::text(text)])
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![ContentPart::text(text)])
    }

    /// Collapse the content sequence to a single string by concatenating
    /// text parts in order. Non-text parts are dropped.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|p| p.text.as_deref())
            .collect::<Vec<_>>()
            .concat()
    }
}

mod content_parts {
    use super::ContentPart;
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Text(String),
        Parts(Vec<ContentPart>),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<ContentPart>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Repr::deserialize(deserializer)? {
            Repr::Text(s) => Ok(vec![ContentPart::text(s)]),
            Repr::Parts(parts) => Ok(parts),
        }
    }
}

/// Request-level scheduling hint.
///
/// Elevated priorities re-sort the router's candidate set by observed
/// latency instead of configured provider priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RequestPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl RequestPriority {
    pub fn is_elevated(&self) -> bool {
        matches!(self, RequestPriority::High | RequestPriority::Critical)
    }
}

fn default_true() -> bool {
    true
}

/// Chat completion request.
///
/// `tenant_id`, `user_id`, and `correlation_id` are populated from the
/// `X-Tenant-ID`, `X-User-ID`, and `X-Correlation-ID` headers by the
/// transport layer and are never part of the JSON body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    #[serde(default, skip_serializing)]
    pub tenant_id: String,
    #[serde(default, skip_serializing)]
    pub user_id: String,
    #[serde(default, skip_serializing)]
    pub correlation_id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub provider: ProviderChoice,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub priority: RequestPriority,
    #[serde(default = "default_true")]
    pub cache_enabled: bool,
    /// Per-request TTL override in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_ttl: Option<u64>,
}

impl CompletionRequest {
    pub fn cache_ttl(&self) -> Option<Duration> {
        self.cache_ttl.map(Duration::from_secs)
    }
}

impl Default for CompletionRequest {
    fn default() -> Self {
        Self {
            tenant_id: String::new(),
            user_id: String::new(),
            correlation_id: String::new(),
            model: String::new(),
            provider: ProviderChoice::Auto,
            messages: Vec::new(),
            max_tokens: None,
            temperature: None,
            top_p: None,
            stop: None,
            presence_penalty: None,
            frequency_penalty: None,
            user: None,
            stream: false,
            priority: RequestPriority::Normal,
            cache_enabled: true,
            cache_ttl: None,
        }
    }
}

/// Embedding request. Identity fields follow the same header convention as
/// [`CompletionRequest`]. `input` accepts a bare string or an array.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EmbeddingRequest {
    #[serde(default, skip_serializing)]
    pub tenant_id: String,
    #[serde(default, skip_serializing)]
    pub user_id: String,
    #[serde(default, skip_serializing)]
    pub correlation_id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub provider: ProviderChoice,
    #[serde(default, deserialize_with = "string_or_seq::deserialize")]
    pub input: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

mod string_or_seq {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        One(String),
        Many(Vec<String>),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Repr::deserialize(deserializer)? {
            Repr::One(s) => Ok(vec![s]),
            Repr::Many(v) => Ok(v),
        }
    }
}

/// Normalized reason a completion stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    ToolCalls,
}

impl FinishReason {
    /// Map a provider finish reason onto the normalized set. Unrecognized
    /// values collapse to `stop`.
    pub fn from_provider(reason: &str) -> Self {
        match reason {
            "stop" | "end_turn" | "stop_sequence" => FinishReason::Stop,
            "length" | "max_tokens" => FinishReason::Length,
            "content_filter" => FinishReason::ContentFilter,
            "tool_use" | "tool_calls" => FinishReason::ToolCalls,
            _ => FinishReason::Stop,
        }
    }
}

/// Token usage and computed cost for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub cost_usd: f64,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32, cost_usd: f64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            cost_usd,
        }
    }
}

/// A generated completion choice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: Message,
    pub finish_reason: FinishReason,
}

/// Chat completion response, OpenAI-shaped plus the `provider` and
/// `cache_hit` fields the gateway adds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub provider: ProviderId,
    pub choices: Vec<Choice>,
    pub usage: Usage,
    #[serde(default)]
    pub cache_hit: bool,
}

/// One embedding vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub object: String,
    pub embedding: Vec<f32>,
    pub index: u32,
}

/// Embedding response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    pub object: String,
    pub data: Vec<Embedding>,
    pub model: String,
    pub provider: ProviderId,
    pub usage: Usage,
    #[serde(default)]
    pub cache_hit: bool,
}

/// Incremental content for one choice of a streaming completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// One choice of a streaming chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChoice {
    pub index: u32,
    pub delta: Delta,
    pub finish_reason: Option<FinishReason>,
}

/// Payload of a delta frame.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamDelta {
    pub id: String,
    pub model: String,
    pub provider: ProviderId,
    pub choice: StreamChoice,
}

/// One element of a streaming response sequence.
///
/// A well-formed stream consists of zero or more `Delta` frames followed by
/// exactly one terminal frame, either `Done` or `Error`.
#[derive(Debug)]
pub enum StreamFrame {
    Delta(StreamDelta),
    Done,
    Error(QLensError),
}

impl StreamFrame {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamFrame::Done | StreamFrame::Error(_))
    }
}

/// What a model can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelCapability {
    Completion,
    Embedding,
    Vision,
    FunctionCalling,
}

/// Per-token pricing for a model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tariff {
    pub input_cost_per_token: f64,
    pub output_cost_per_token: f64,
    pub unit: TariffUnit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TariffUnit {
    #[default]
    UsdPerToken,
}

impl Tariff {
    pub const fn per_token(input: f64, output: f64) -> Self {
        Self {
            input_cost_per_token: input,
            output_cost_per_token: output,
            unit: TariffUnit::UsdPerToken,
        }
    }

    /// Zero tariff used when a model has no pricing entry. Unknown models
    /// cost nothing rather than failing the request.
    pub const fn free() -> Self {
        Self::per_token(0.0, 0.0)
    }

    pub fn cost(&self, prompt_tokens: u32, completion_tokens: u32) -> f64 {
        prompt_tokens as f64 * self.input_cost_per_token
            + completion_tokens as f64 * self.output_cost_per_token
    }
}

/// Availability of an advertised model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    Available,
    Degraded,
    Unavailable,
}

/// A model advertised by a provider, including capabilities and pricing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    pub provider: ProviderId,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub capabilities: Vec<ModelCapability>,
    pub context_length: u32,
    pub pricing: Tariff,
    pub status: ModelStatus,
    pub active: bool,
}

impl Model {
    pub fn supports(&self, capability: ModelCapability) -> bool {
        self.capabilities.contains(&capability)
    }
}
