//! Shared HTTP transport discipline for the provider adapters.
//!
//! One connection-pooled client per adapter and purpose, built once at
//! adapter construction. Unary and streaming calls differ only in the
//! overall request timeout; everything else (dial timeout, keep-alive,
//! pool sizing, TLS floor) is identical.

use crate::error::QLensError;
use reqwest::Client;
use std::time::Duration;

pub const USER_AGENT: &str = concat!("qlens/", env!("CARGO_PKG_VERSION"));

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const TCP_KEEPALIVE: Duration = Duration::from_secs(30);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const POOL_MAX_IDLE_PER_HOST: usize = 10;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const STREAM_TIMEOUT: Duration = Duration::from_secs(300);

/// Client for unary provider calls (30 s overall timeout).
pub fn unary_client() -> Result<Client, QLensError> {
    build(REQUEST_TIMEOUT)
}

/// Client for streaming provider calls (5 min overall timeout).
pub fn streaming_client() -> Result<Client, QLensError> {
    build(STREAM_TIMEOUT)
}

fn build(timeout: Duration) -> Result<Client, QLensError> {
    Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(CONNECT_TIMEOUT)
        .tcp_keepalive(TCP_KEEPALIVE)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .min_tls_version(reqwest::tls::Version::TLS_1_2)
        .timeout(timeout)
        .build()
        .map_err(|e| {
            QLensError::configuration("failed to build provider HTTP client")
                .with_internal(e.to_string())
        })
}

/// Classify a transport-level failure. Timeouts and connection failures
/// stay distinguishable so the orchestrator can demote provider health
/// accordingly.
pub fn classify_transport_error(provider: &str, error: reqwest::Error) -> QLensError {
    if error.is_timeout() {
        QLensError::timeout(format!("request to {provider} timed out"))
            .with_provider(provider)
            .with_internal(error.to_string())
    } else if error.is_connect() {
        QLensError::provider_unavailable(provider, format!("connection to {provider} failed"))
            .with_internal(error.to_string())
    } else {
        QLensError::provider_error(provider, "transport failure")
            .with_internal(error.to_string())
    }
}
