//! # Observability Contract
//!
//! The core does not own a metrics backend or a log sink. It emits
//! structured `tracing` events and records measurements through the
//! [`MetricsSink`] trait; the gateway plugs in its aggregator, tests plug
//! in [`NoopMetrics`]. Correlation IDs and the clock are injected the same
//! way so tests can pin both.

use crate::error::ErrorKind;
use crate::models::ProviderId;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Measurement sink consumed by the request pipeline.
///
/// Operations are labeled by a short op name (`"completion"`,
/// `"embedding"`, `"models"`). Provider-labeled counters exist in addition
/// to op-labeled ones so per-provider error and traffic rates survive
/// failover.
pub trait MetricsSink: Send + Sync {
    fn inc_request(&self, op: &str);
    fn inc_error(&self, op: &str, kind: ErrorKind);
    fn observe_latency(&self, op: &str, latency: Duration);
    fn add_tokens(&self, op: &str, tokens: u64);
    fn add_cost(&self, op: &str, usd: f64);
    fn inc_cache_hit(&self, op: &str);
    fn inc_cache_miss(&self, op: &str);
    fn inc_provider_request(&self, provider: ProviderId);
    fn inc_provider_error(&self, provider: ProviderId, kind: ErrorKind);
}

/// Sink that drops every measurement. Default for tests and for embedders
/// that do not care about metrics.
#[derive(Debug, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn inc_request(&self, _op: &str) {}
    fn inc_error(&self, _op: &str, _kind: ErrorKind) {}
    fn observe_latency(&self, _op: &str, _latency: Duration) {}
    fn add_tokens(&self, _op: &str, _tokens: u64) {}
    fn add_cost(&self, _op: &str, _usd: f64) {}
    fn inc_cache_hit(&self, _op: &str) {}
    fn inc_cache_miss(&self, _op: &str) {}
    fn inc_provider_request(&self, _provider: ProviderId) {}
    fn inc_provider_error(&self, _provider: ProviderId, _kind: ErrorKind) {}
}

/// Monotonically increasing ID source.
///
/// Used for generated correlation IDs and for stamping streaming response
/// frames. IDs are unique within a process; the prefix distinguishes the
/// surfaces.
#[derive(Debug)]
pub struct CorrelationIds {
    prefix: &'static str,
    counter: AtomicU64,
}

impl CorrelationIds {
    pub fn new(prefix: &'static str) -> Self {
        Self {
            prefix,
            counter: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{:016x}", self.prefix, n)
    }
}

/// Clock seam. Production uses [`SystemClock`]; cache and health tests pin
/// time with [`ManualClock`].
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    offset_ms: AtomicU64,
    epoch: DateTime<Utc>,
}

impl ManualClock {
    pub fn new(epoch: DateTime<Utc>) -> Self {
        Self {
            offset_ms: AtomicU64::new(0),
            epoch,
        }
    }

    pub fn advance(&self, by: Duration) {
        self.offset_ms
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.epoch + chrono::Duration::milliseconds(self.offset_ms.load(Ordering::SeqCst) as i64)
    }
}

/// Per-request log span. Emits paired start and end events with the
/// correlation context attached to both.
pub struct RequestLog {
    op: &'static str,
    path: &'static str,
    correlation_id: String,
    tenant_id: String,
    started: Instant,
}

impl RequestLog {
    pub fn start(
        op: &'static str,
        path: &'static str,
        correlation_id: &str,
        tenant_id: &str,
        user_id: &str,
    ) -> Self {
        tracing::info!(
            op,
            path,
            correlation_id,
            tenant_id,
            user_id,
            "request started"
        );
        Self {
            op,
            path,
            correlation_id: correlation_id.to_string(),
            tenant_id: tenant_id.to_string(),
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn provider_request(&self, provider: ProviderId, model: &str) {
        tracing::debug!(
            op = self.op,
            correlation_id = %self.correlation_id,
            provider = %provider,
            model,
            "dispatching to provider"
        );
    }

    pub fn provider_response(&self, provider: ProviderId, latency: Duration) {
        tracing::debug!(
            op = self.op,
            correlation_id = %self.correlation_id,
            provider = %provider,
            latency_ms = latency.as_millis() as u64,
            "provider responded"
        );
    }

    pub fn provider_error(&self, provider: ProviderId, error: &crate::error::QLensError) {
        tracing::warn!(
            op = self.op,
            correlation_id = %self.correlation_id,
            provider = %provider,
            kind = %error.kind,
            retryable = error.retryable,
            internal = error.internal_detail().unwrap_or(""),
            "provider call failed"
        );
    }

    pub fn end(self, status: u16) {
        tracing::info!(
            op = self.op,
            path = self.path,
            correlation_id = %self.correlation_id,
            tenant_id = %self.tenant_id,
            status,
            duration_ms = self.started.elapsed().as_millis() as u64,
            "request finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_ids_are_monotonic() {
        let ids = CorrelationIds::new("qlens");
        let a = ids.next();
        let b = ids.next();
        assert!(a.starts_with("qlens-"));
        assert!(b > a);
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(Utc::now());
        let t0 = clock.now();
        clock.advance(Duration::from_secs(90));
        assert_eq!((clock.now() - t0).num_seconds(), 90);
    }
}
