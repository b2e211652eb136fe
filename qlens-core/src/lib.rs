//! # QLens Core
//!
//! The in-process request pipeline behind the QLens gateway: domain model,
//! error taxonomy, response cache, provider adapters, and router. The
//! `qlens-gateway` crate binds this pipeline to HTTP; everything here is
//! transport-agnostic and usable as a library.
//!
//! ## Subsystems
//!
//! - [`models`]: OpenAI-shaped request/response types, model catalog
//!   entries, usage accounting, streaming frames
//! - [`error`]: the classified [`error::QLensError`] every operation
//!   returns, with deterministic HTTP mapping and a client-safe projection
//! - [`cache`]: fingerprint-keyed memoization with TTL, LRU eviction, and
//!   an external Redis variant
//! - [`providers`]: the uniform [`providers::ProviderAdapter`] contract
//!   with Azure OpenAI and AWS Bedrock implementations
//! - [`router`]: provider registry, health loop, and selection policy
//! - [`observability`]: metrics sink, clock, and correlation-ID seams
//!
//! ## A minimal pipeline
//!
//! ```rust,ignore
//! use qlens_core::providers::{build_adapter, ProviderConfig};
//! use qlens_core::models::ProviderId;
//! use qlens_core::router::{Router, RouterConfig};
//!
//! let adapter = build_adapter(
//!     ProviderConfig::new(ProviderId::AzureOpenAi)
//!         .with_api_key(std::env::var("AZURE_OPENAI_API_KEY")?)
//!         .with_endpoint("https://my-resource.openai.azure.com"),
//! )?;
//!
//! let router = Router::new(RouterConfig::default());
//! router.register_provider(adapter.clone(), config).await;
//! router.spawn_health_loop();
//!
//! let provider = router.select_provider(&request, &Default::default()).await?;
//! ```

pub mod cache;
pub mod error;
pub mod models;
pub mod observability;
pub mod providers;
pub mod router;

pub use error::{ErrorKind, QLensError, Severity};
pub use models::{
    CompletionRequest, CompletionResponse, EmbeddingRequest, EmbeddingResponse, Message, Model,
    ProviderChoice, ProviderId, StreamFrame, Usage,
};
pub use providers::{ProviderAdapter, ProviderConfig, ProviderHealth};
pub use router::{Router, RouterConfig};
