//! # Metrics Aggregator
//!
//! In-process implementation of the core's `MetricsSink`. Counters are
//! lock-free atomics keyed by operation and provider; latency
//! observations keep the most recent 1000 samples per operation behind a
//! short exclusive lock. The aggregator renders both a JSON snapshot and
//! the Prometheus text format served at `/metrics`.

use dashmap::DashMap;
use qlens_core::error::ErrorKind;
use qlens_core::models::ProviderId;
use qlens_core::observability::MetricsSink;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Bounded latency retention per operation.
const LATENCY_SAMPLES: usize = 1000;

#[derive(Default)]
struct OpCounters {
    requests: AtomicU64,
    tokens: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cost_usd: Mutex<f64>,
    errors: DashMap<&'static str, AtomicU64>,
    latencies_ms: Mutex<std::collections::VecDeque<u64>>,
}

#[derive(Default)]
struct ProviderCounters {
    requests: AtomicU64,
    errors: DashMap<&'static str, AtomicU64>,
}

pub struct MetricsAggregator {
    started: Instant,
    ops: DashMap<String, OpCounters>,
    providers: DashMap<ProviderId, ProviderCounters>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OpSnapshot {
    pub requests: u64,
    pub errors: BTreeMap<String, u64>,
    pub average_latency_ms: f64,
    pub tokens: u64,
    pub cost_usd: f64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderSnapshot {
    pub requests: u64,
    pub errors: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_seconds: u64,
    pub requests_per_minute: f64,
    pub ops: BTreeMap<String, OpSnapshot>,
    pub providers: BTreeMap<String, ProviderSnapshot>,
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            ops: DashMap::new(),
            providers: DashMap::new(),
        }
    }

    fn bump(map: &DashMap<&'static str, AtomicU64>, key: &'static str) {
        map.entry(key)
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    fn error_counts(map: &DashMap<&'static str, AtomicU64>) -> BTreeMap<String, u64> {
        map.iter()
            .map(|entry| (entry.key().to_string(), entry.value().load(Ordering::Relaxed)))
            .collect()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let uptime = self.started.elapsed();
        let mut ops = BTreeMap::new();
        let mut total_requests = 0u64;

        for entry in self.ops.iter() {
            let counters = entry.value();
            let requests = counters.requests.load(Ordering::Relaxed);
            total_requests += requests;
            let hits = counters.cache_hits.load(Ordering::Relaxed);
            let misses = counters.cache_misses.load(Ordering::Relaxed);
            let lookups = hits + misses;
            let average_latency_ms = {
                let samples = counters.latencies_ms.lock().expect("latency lock poisoned");
                if samples.is_empty() {
                    0.0
                } else {
                    samples.iter().sum::<u64>() as f64 / samples.len() as f64
                }
            };
            ops.insert(
                entry.key().clone(),
                OpSnapshot {
                    requests,
                    errors: Self::error_counts(&counters.errors),
                    average_latency_ms,
                    tokens: counters.tokens.load(Ordering::Relaxed),
                    cost_usd: *counters.cost_usd.lock().expect("cost lock poisoned"),
                    cache_hits: hits,
                    cache_misses: misses,
                    cache_hit_rate: if lookups == 0 {
                        0.0
                    } else {
                        hits as f64 / lookups as f64
                    },
                },
            );
        }

        let providers = self
            .providers
            .iter()
            .map(|entry| {
                (
                    entry.key().as_str().to_string(),
                    ProviderSnapshot {
                        requests: entry.value().requests.load(Ordering::Relaxed),
                        errors: Self::error_counts(&entry.value().errors),
                    },
                )
            })
            .collect();

        let minutes = uptime.as_secs_f64() / 60.0;
        MetricsSnapshot {
            uptime_seconds: uptime.as_secs(),
            requests_per_minute: if minutes > 0.0 {
                total_requests as f64 / minutes
            } else {
                0.0
            },
            ops,
            providers,
        }
    }

    /// Prometheus text exposition of the current counters.
    pub fn render_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let mut out = String::new();

        let _ = writeln!(out, "# HELP qlens_uptime_seconds Gateway uptime.");
        let _ = writeln!(out, "# TYPE qlens_uptime_seconds gauge");
        let _ = writeln!(out, "qlens_uptime_seconds {}", snapshot.uptime_seconds);

        let _ = writeln!(out, "# HELP qlens_requests_total Requests by operation.");
        let _ = writeln!(out, "# TYPE qlens_requests_total counter");
        for (op, stats) in &snapshot.ops {
            let _ = writeln!(out, "qlens_requests_total{{op=\"{op}\"}} {}", stats.requests);
        }

        let _ = writeln!(out, "# HELP qlens_errors_total Errors by operation and type.");
        let _ = writeln!(out, "# TYPE qlens_errors_total counter");
        for (op, stats) in &snapshot.ops {
            for (kind, count) in &stats.errors {
                let _ = writeln!(
                    out,
                    "qlens_errors_total{{op=\"{op}\",type=\"{kind}\"}} {count}"
                );
            }
        }

        let _ = writeln!(out, "# HELP qlens_latency_ms_avg Mean latency over recent samples.");
        let _ = writeln!(out, "# TYPE qlens_latency_ms_avg gauge");
        for (op, stats) in &snapshot.ops {
            let _ = writeln!(
                out,
                "qlens_latency_ms_avg{{op=\"{op}\"}} {:.3}",
                stats.average_latency_ms
            );
        }

        let _ = writeln!(out, "# HELP qlens_tokens_total Tokens processed.");
        let _ = writeln!(out, "# TYPE qlens_tokens_total counter");
        for (op, stats) in &snapshot.ops {
            let _ = writeln!(out, "qlens_tokens_total{{op=\"{op}\"}} {}", stats.tokens);
        }

        let _ = writeln!(out, "# HELP qlens_cost_usd_total Accumulated provider cost.");
        let _ = writeln!(out, "# TYPE qlens_cost_usd_total counter");
        for (op, stats) in &snapshot.ops {
            let _ = writeln!(
                out,
                "qlens_cost_usd_total{{op=\"{op}\"}} {:.9}",
                stats.cost_usd
            );
        }

        let _ = writeln!(out, "# HELP qlens_cache_hits_total Cache hits by operation.");
        let _ = writeln!(out, "# TYPE qlens_cache_hits_total counter");
        for (op, stats) in &snapshot.ops {
            let _ = writeln!(out, "qlens_cache_hits_total{{op=\"{op}\"}} {}", stats.cache_hits);
        }

        let _ = writeln!(out, "# HELP qlens_cache_misses_total Cache misses by operation.");
        let _ = writeln!(out, "# TYPE qlens_cache_misses_total counter");
        for (op, stats) in &snapshot.ops {
            let _ = writeln!(
                out,
                "qlens_cache_misses_total{{op=\"{op}\"}} {}",
                stats.cache_misses
            );
        }

        let _ = writeln!(out, "# HELP qlens_provider_requests_total Requests served per provider.");
        let _ = writeln!(out, "# TYPE qlens_provider_requests_total counter");
        for (provider, stats) in &snapshot.providers {
            let _ = writeln!(
                out,
                "qlens_provider_requests_total{{provider=\"{provider}\"}} {}",
                stats.requests
            );
        }

        let _ = writeln!(out, "# HELP qlens_provider_errors_total Provider failures by type.");
        let _ = writeln!(out, "# TYPE qlens_provider_errors_total counter");
        for (provider, stats) in &snapshot.providers {
            for (kind, count) in &stats.errors {
                let _ = writeln!(
                    out,
                    "qlens_provider_errors_total{{provider=\"{provider}\",type=\"{kind}\"}} {count}"
                );
            }
        }

        out
    }
}

impl MetricsSink for MetricsAggregator {
    fn inc_request(&self, op: &str) {
        self.ops
            .entry(op.to_string())
            .or_default()
            .requests
            .fetch_add(1, Ordering::Relaxed);
    }

    fn inc_error(&self, op: &str, kind: ErrorKind) {
        let entry = self.ops.entry(op.to_string()).or_default();
        Self::bump(&entry.errors, kind.as_str());
    }

    fn observe_latency(&self, op: &str, latency: Duration) {
        let entry = self.ops.entry(op.to_string()).or_default();
        let mut samples = entry.latencies_ms.lock().expect("latency lock poisoned");
        if samples.len() == LATENCY_SAMPLES {
            samples.pop_front();
        }
        samples.push_back(latency.as_millis() as u64);
    }

    fn add_tokens(&self, op: &str, tokens: u64) {
        self.ops
            .entry(op.to_string())
            .or_default()
            .tokens
            .fetch_add(tokens, Ordering::Relaxed);
    }

    fn add_cost(&self, op: &str, usd: f64) {
        let entry = self.ops.entry(op.to_string()).or_default();
        *entry.cost_usd.lock().expect("cost lock poisoned") += usd;
    }

    fn inc_cache_hit(&self, op: &str) {
        self.ops
            .entry(op.to_string())
            .or_default()
            .cache_hits
            .fetch_add(1, Ordering::Relaxed);
    }

    fn inc_cache_miss(&self, op: &str) {
        self.ops
            .entry(op.to_string())
            .or_default()
            .cache_misses
            .fetch_add(1, Ordering::Relaxed);
    }

    fn inc_provider_request(&self, provider: ProviderId) {
        self.providers
            .entry(provider)
            .or_default()
            .requests
            .fetch_add(1, Ordering::Relaxed);
    }

    fn inc_provider_error(&self, provider: ProviderId, kind: ErrorKind) {
        let entry = self.providers.entry(provider).or_default();
        Self::bump(&entry.errors, kind.as_str());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_per_op() {
        let metrics = MetricsAggregator::new();
        metrics.inc_request("completion");
        metrics.inc_request("completion");
        metrics.inc_request("embedding");
        metrics.inc_error("completion", ErrorKind::ProviderError);
        metrics.add_tokens("completion", 150);
        metrics.add_cost("completion", 0.0025);
        metrics.inc_cache_hit("completion");
        metrics.inc_cache_miss("completion");
        metrics.observe_latency("completion", Duration::from_millis(120));
        metrics.observe_latency("completion", Duration::from_millis(80));

        let snapshot = metrics.snapshot();
        let completion = &snapshot.ops["completion"];
        assert_eq!(completion.requests, 2);
        assert_eq!(completion.errors["provider_error"], 1);
        assert_eq!(completion.tokens, 150);
        assert!((completion.cost_usd - 0.0025).abs() < 1e-12);
        assert!((completion.average_latency_ms - 100.0).abs() < 1e-9);
        assert!((completion.cache_hit_rate - 0.5).abs() < 1e-9);
        assert_eq!(snapshot.ops["embedding"].requests, 1);
    }

    #[test]
    fn provider_counters_are_labeled() {
        let metrics = MetricsAggregator::new();
        metrics.inc_provider_request(ProviderId::AwsBedrock);
        metrics.inc_provider_error(ProviderId::AzureOpenAi, ErrorKind::ProviderError);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.providers["aws-bedrock"].requests, 1);
        assert_eq!(
            snapshot.providers["azure-openai"].errors["provider_error"],
            1
        );
    }

    #[test]
    fn latency_retention_is_bounded() {
        let metrics = MetricsAggregator::new();
        for i in 0..(LATENCY_SAMPLES + 500) {
            metrics.observe_latency("completion", Duration::from_millis(i as u64));
        }
        let entry = metrics.ops.get("completion").unwrap();
        let samples = entry.latencies_ms.lock().unwrap();
        assert_eq!(samples.len(), LATENCY_SAMPLES);
        // The oldest samples were dropped.
        assert_eq!(*samples.front().unwrap(), 500);
    }

    #[test]
    fn prometheus_rendering_includes_labeled_counters() {
        let metrics = MetricsAggregator::new();
        metrics.inc_request("completion");
        metrics.inc_provider_request(ProviderId::AwsBedrock);
        metrics.inc_provider_error(ProviderId::AzureOpenAi, ErrorKind::ProviderError);

        let text = metrics.render_prometheus();
        assert!(text.contains("qlens_requests_total{op=\"completion\"} 1"));
        assert!(text.contains("qlens_provider_requests_total{provider=\"aws-bedrock\"} 1"));
        assert!(text.contains(
            "qlens_provider_errors_total{provider=\"azure-openai\",type=\"provider_error\"} 1"
        ));
        assert!(text.contains("qlens_uptime_seconds"));
    }
}
