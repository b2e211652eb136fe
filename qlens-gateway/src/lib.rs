//! # QLens Gateway
//!
//! The deployable half of QLens: configuration, the request orchestrator,
//! metrics aggregation, and the axum HTTP surface over `qlens-core`.
//!
//! Request flow for a completion: headers are validated and folded into
//! the domain request, the orchestrator consults the cache, routes to a
//! healthy provider, invokes the adapter with failover on retryable
//! errors, records usage and cost, and returns an OpenAI-shaped response.
//! Streaming requests get the same front half and a Server-Sent-Events
//! tail with a guaranteed `[DONE]` terminator.

pub mod config;
pub mod gateway;
pub mod handlers;
pub mod metrics;
pub mod server;

pub use config::Config;
pub use gateway::Gateway;
pub use metrics::MetricsAggregator;
pub use server::{build_router, AppState};
