//! Orchestrator pipeline scenarios with scripted in-process providers.

mod common;

use common::{StreamScript, StubAdapter};
use futures::StreamExt;
use qlens_core::cache::{CacheConfig, MemoryCache};
use qlens_core::error::{ErrorKind, QLensError};
use qlens_core::models::{
    CompletionRequest, Delta, Message, ProviderId, StreamChoice, StreamDelta, StreamFrame,
};
use qlens_core::observability::NoopMetrics;
use qlens_core::providers::ProviderConfig;
use qlens_core::router::{Router, RouterConfig};
use qlens_gateway::metrics::MetricsAggregator;
use qlens_gateway::Gateway;
use std::sync::Arc;
use std::time::Duration;

fn request(model: &str) -> CompletionRequest {
    CompletionRequest {
        tenant_id: "tenant-1".into(),
        user_id: "user-1".into(),
        correlation_id: "corr-1".into(),
        model: model.into(),
        messages: vec![Message::user("hi")],
        temperature: Some(0.5),
        ..Default::default()
    }
}

fn router_config() -> RouterConfig {
    RouterConfig {
        auto_failover: true,
        load_balancing: false,
        health_check_interval: Duration::from_secs(3600),
        default_provider: None,
    }
}

async fn single_provider_gateway(adapter: Arc<StubAdapter>) -> Gateway {
    let router = Router::new(router_config());
    router
        .register_provider(
            adapter,
            ProviderConfig::new(ProviderId::AzureOpenAi).with_priority(10),
        )
        .await;
    Gateway::new(router, Arc::new(NoopMetrics))
}

fn memory_cache() -> (Arc<MemoryCache>, CacheConfig) {
    let config = CacheConfig {
        enabled: true,
        ttl: Duration::from_secs(900),
        max_size: 100,
        ..Default::default()
    };
    (Arc::new(MemoryCache::new(config.clone())), config)
}

#[tokio::test]
async fn identical_cacheable_requests_hit_the_cache() {
    let adapter = Arc::new(StubAdapter::healthy(
        ProviderId::AzureOpenAi,
        &["gpt-35-turbo"],
    ));
    let (cache, cache_config) = memory_cache();
    let gateway = single_provider_gateway(adapter.clone())
        .await
        .with_cache(cache, cache_config);

    let first = gateway.create_completion(request("gpt-35-turbo")).await.unwrap();
    assert!(!first.cache_hit);

    let second = gateway.create_completion(request("gpt-35-turbo")).await.unwrap();
    assert!(second.cache_hit);
    assert_eq!(second.choices, first.choices);
    assert_eq!(second.usage, first.usage);
    assert_eq!(adapter.calls(), 1);
}

#[tokio::test]
async fn cache_keys_ignore_tenant_identity() {
    let adapter = Arc::new(StubAdapter::healthy(
        ProviderId::AzureOpenAi,
        &["gpt-35-turbo"],
    ));
    let (cache, cache_config) = memory_cache();
    let gateway = single_provider_gateway(adapter.clone())
        .await
        .with_cache(cache, cache_config);

    gateway.create_completion(request("gpt-35-turbo")).await.unwrap();

    let mut other_tenant = request("gpt-35-turbo");
    other_tenant.tenant_id = "tenant-2".into();
    other_tenant.user_id = "user-2".into();
    other_tenant.correlation_id = "corr-2".into();
    let hit = gateway.create_completion(other_tenant).await.unwrap();
    assert!(hit.cache_hit);
    assert_eq!(adapter.calls(), 1);
}

#[tokio::test]
async fn hot_temperature_requests_bypass_the_cache() {
    let adapter = Arc::new(StubAdapter::healthy(
        ProviderId::AzureOpenAi,
        &["gpt-35-turbo"],
    ));
    let (cache, cache_config) = memory_cache();
    let cache_handle = cache.clone();
    let gateway = single_provider_gateway(adapter.clone())
        .await
        .with_cache(cache, cache_config);

    let mut req = request("gpt-35-turbo");
    req.temperature = Some(0.9);
    let first = gateway.create_completion(req.clone()).await.unwrap();
    let second = gateway.create_completion(req).await.unwrap();

    assert!(!first.cache_hit);
    assert!(!second.cache_hit);
    assert_eq!(adapter.calls(), 2);
    assert_eq!(
        qlens_core::cache::ResponseCache::stats(cache_handle.as_ref())
            .await
            .size,
        0
    );
}

#[tokio::test]
async fn retryable_failure_fails_over_to_the_next_provider() {
    let azure = Arc::new(
        StubAdapter::healthy(ProviderId::AzureOpenAi, &["gpt-35-turbo"]).with_scripted_results(
            vec![Err(QLensError::provider_error(
                "azure-openai",
                "upstream 503",
            ))],
        ),
    );
    let bedrock = Arc::new(StubAdapter::healthy(
        ProviderId::AwsBedrock,
        &["gpt-35-turbo"],
    ));

    let router = Router::new(router_config());
    router
        .register_provider(
            azure.clone(),
            ProviderConfig::new(ProviderId::AzureOpenAi).with_priority(10),
        )
        .await;
    router
        .register_provider(
            bedrock.clone(),
            ProviderConfig::new(ProviderId::AwsBedrock).with_priority(5),
        )
        .await;

    let metrics = Arc::new(MetricsAggregator::new());
    let gateway = Gateway::new(router, metrics.clone());

    let response = gateway.create_completion(request("gpt-35-turbo")).await.unwrap();
    assert_eq!(response.provider, ProviderId::AwsBedrock);
    assert_eq!(azure.calls(), 1);
    assert_eq!(bedrock.calls(), 1);

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.providers["azure-openai"].errors["provider_error"], 1);
    assert_eq!(snapshot.providers["aws-bedrock"].requests, 1);
}

#[tokio::test]
async fn permanent_failures_do_not_fail_over() {
    let azure = Arc::new(
        StubAdapter::healthy(ProviderId::AzureOpenAi, &["gpt-35-turbo"]).with_scripted_results(
            vec![Err(QLensError::validation("request", "bad prompt"))],
        ),
    );
    let bedrock = Arc::new(StubAdapter::healthy(
        ProviderId::AwsBedrock,
        &["gpt-35-turbo"],
    ));

    let router = Router::new(router_config());
    router
        .register_provider(
            azure.clone(),
            ProviderConfig::new(ProviderId::AzureOpenAi).with_priority(10),
        )
        .await;
    router
        .register_provider(
            bedrock.clone(),
            ProviderConfig::new(ProviderId::AwsBedrock).with_priority(5),
        )
        .await;

    let gateway = Gateway::new(router, Arc::new(NoopMetrics));
    let err = gateway
        .create_completion(request("gpt-35-turbo"))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Validation);
    assert_eq!(bedrock.calls(), 0);
}

#[tokio::test]
async fn exhausted_failover_surfaces_the_last_provider_error() {
    let azure = Arc::new(
        StubAdapter::healthy(ProviderId::AzureOpenAi, &["gpt-35-turbo"]).with_scripted_results(
            vec![Err(QLensError::provider_error("azure-openai", "boom a"))],
        ),
    );
    let bedrock = Arc::new(
        StubAdapter::healthy(ProviderId::AwsBedrock, &["gpt-35-turbo"]).with_scripted_results(
            vec![Err(QLensError::provider_error("aws-bedrock", "boom b"))],
        ),
    );

    let router = Router::new(router_config());
    router
        .register_provider(
            azure,
            ProviderConfig::new(ProviderId::AzureOpenAi).with_priority(10),
        )
        .await;
    router
        .register_provider(
            bedrock,
            ProviderConfig::new(ProviderId::AwsBedrock).with_priority(5),
        )
        .await;

    let gateway = Gateway::new(router, Arc::new(NoopMetrics));
    let err = gateway
        .create_completion(request("gpt-35-turbo"))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::ProviderError);
    assert_eq!(err.message, "boom b");
}

#[tokio::test]
async fn unserved_model_is_rejected_without_provider_calls() {
    let adapter = Arc::new(StubAdapter::healthy(
        ProviderId::AzureOpenAi,
        &["gpt-35-turbo"],
    ));
    let gateway = single_provider_gateway(adapter.clone()).await;

    let err = gateway
        .create_completion(request("gpt-5-ultra"))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::ModelUnavailable);
    assert_eq!(adapter.calls(), 0);
}

#[tokio::test]
async fn validation_failures_carry_the_field() {
    let adapter = Arc::new(StubAdapter::healthy(
        ProviderId::AzureOpenAi,
        &["gpt-35-turbo"],
    ));
    let gateway = single_provider_gateway(adapter.clone()).await;

    let mut req = request("gpt-35-turbo");
    req.messages.clear();
    let err = gateway.create_completion(req).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Validation);
    assert_eq!(err.details.field.as_deref(), Some("messages"));

    let mut req = request("gpt-35-turbo");
    req.temperature = Some(3.0);
    let err = gateway.create_completion(req).await.unwrap_err();
    assert_eq!(err.details.field.as_deref(), Some("temperature"));
    assert_eq!(adapter.calls(), 0);
}

fn delta(text: &str, index: u32) -> StreamFrame {
    StreamFrame::Delta(StreamDelta {
        id: String::new(),
        model: "gpt-35-turbo".into(),
        provider: ProviderId::AzureOpenAi,
        choice: StreamChoice {
            index,
            delta: Delta {
                role: None,
                content: Some(text.into()),
            },
            finish_reason: None,
        },
    })
}

#[tokio::test]
async fn stream_delivers_deltas_in_order_then_done() {
    let adapter = Arc::new(
        StubAdapter::healthy(ProviderId::AzureOpenAi, &["gpt-35-turbo"]).with_stream(
            StreamScript::Frames(vec![
                delta("a", 0),
                delta("b", 0),
                delta("c", 0),
                StreamFrame::Done,
            ]),
        ),
    );
    let gateway = single_provider_gateway(adapter).await;

    let mut req = request("gpt-35-turbo");
    req.stream = true;
    let mut stream = gateway.create_completion_stream(req).await.unwrap();

    let mut texts = Vec::new();
    let mut stamped_ids = Vec::new();
    let mut terminal = None;
    while let Some(frame) = stream.next().await {
        match frame {
            StreamFrame::Delta(d) => {
                stamped_ids.push(d.id.clone());
                texts.push(d.choice.delta.content.unwrap_or_default());
            }
            other => {
                terminal = Some(other);
                break;
            }
        }
    }

    assert_eq!(texts, vec!["a", "b", "c"]);
    assert!(matches!(terminal, Some(StreamFrame::Done)));
    assert!(stamped_ids.iter().all(|id| id.starts_with("chatcmpl-")));
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn bare_upstream_end_gets_a_synthesized_terminator() {
    let adapter = Arc::new(
        StubAdapter::healthy(ProviderId::AzureOpenAi, &["gpt-35-turbo"])
            .with_stream(StreamScript::Frames(vec![delta("partial", 0)])),
    );
    let gateway = single_provider_gateway(adapter).await;

    let mut req = request("gpt-35-turbo");
    req.stream = true;
    let stream = gateway.create_completion_stream(req).await.unwrap();
    let frames: Vec<StreamFrame> = stream.collect().await;

    assert_eq!(frames.len(), 3);
    assert!(matches!(frames[0], StreamFrame::Delta(_)));
    match &frames[1] {
        StreamFrame::Delta(d) => {
            assert_eq!(
                d.choice.finish_reason,
                Some(qlens_core::models::FinishReason::Stop)
            );
            assert!(d.choice.delta.content.is_none());
        }
        other => panic!("expected synthesized finish delta, got {other:?}"),
    }
    assert!(matches!(frames[2], StreamFrame::Done));
}

#[tokio::test]
async fn upstream_error_frames_pass_through_as_terminal() {
    let adapter = Arc::new(
        StubAdapter::healthy(ProviderId::AzureOpenAi, &["gpt-35-turbo"]).with_stream(
            StreamScript::Frames(vec![
                delta("x", 0),
                StreamFrame::Error(QLensError::provider_error("azure-openai", "mid-stream drop")),
            ]),
        ),
    );
    let gateway = single_provider_gateway(adapter).await;

    let mut req = request("gpt-35-turbo");
    req.stream = true;
    let stream = gateway.create_completion_stream(req).await.unwrap();
    let frames: Vec<StreamFrame> = stream.collect().await;

    assert_eq!(frames.len(), 2);
    match &frames[1] {
        StreamFrame::Error(e) => assert_eq!(e.kind, ErrorKind::ProviderError),
        other => panic!("expected error terminal, got {other:?}"),
    }
}

#[tokio::test]
async fn stream_setup_failure_does_not_fail_over() {
    let azure = Arc::new(
        StubAdapter::healthy(ProviderId::AzureOpenAi, &["gpt-35-turbo"]).with_stream(
            StreamScript::SetupError(QLensError::provider_error("azure-openai", "no stream")),
        ),
    );
    let bedrock = Arc::new(StubAdapter::healthy(
        ProviderId::AwsBedrock,
        &["gpt-35-turbo"],
    ));

    let router = Router::new(router_config());
    router
        .register_provider(
            azure,
            ProviderConfig::new(ProviderId::AzureOpenAi).with_priority(10),
        )
        .await;
    router
        .register_provider(
            bedrock.clone(),
            ProviderConfig::new(ProviderId::AwsBedrock).with_priority(5),
        )
        .await;

    let gateway = Gateway::new(router, Arc::new(NoopMetrics));
    let mut req = request("gpt-35-turbo");
    req.stream = true;
    let err = match gateway.create_completion_stream(req).await {
        Err(e) => e,
        Ok(_) => panic!("expected create_completion_stream to fail"),
    };
    assert_eq!(err.kind, ErrorKind::ProviderError);
    assert_eq!(bedrock.calls(), 0);
}

#[tokio::test]
async fn stalled_streams_time_out() {
    let adapter = Arc::new(
        StubAdapter::healthy(ProviderId::AzureOpenAi, &["gpt-35-turbo"])
            .with_stream(StreamScript::Stalled),
    );
    let gateway = single_provider_gateway(adapter)
        .await
        .with_stream_timeout(Duration::from_millis(50));

    let mut req = request("gpt-35-turbo");
    req.stream = true;
    let stream = gateway.create_completion_stream(req).await.unwrap();
    let frames: Vec<StreamFrame> = stream.collect().await;

    assert_eq!(frames.len(), 1);
    match &frames[0] {
        StreamFrame::Error(e) => assert_eq!(e.kind, ErrorKind::Timeout),
        other => panic!("expected timeout error frame, got {other:?}"),
    }
}

#[tokio::test]
async fn embeddings_route_to_capable_providers_and_cache() {
    let azure = Arc::new(
        StubAdapter::healthy(ProviderId::AzureOpenAi, &["text-embedding-ada-002"])
            .with_embeddings(),
    );
    let bedrock = Arc::new(StubAdapter::healthy(
        ProviderId::AwsBedrock,
        &["text-embedding-ada-002"],
    ));

    let router = Router::new(router_config());
    router
        .register_provider(
            azure,
            ProviderConfig::new(ProviderId::AzureOpenAi).with_priority(5),
        )
        .await;
    router
        .register_provider(
            bedrock,
            ProviderConfig::new(ProviderId::AwsBedrock).with_priority(10),
        )
        .await;

    let (cache, cache_config) = memory_cache();
    let gateway = Gateway::new(router, Arc::new(NoopMetrics)).with_cache(cache, cache_config);

    let req = qlens_core::models::EmbeddingRequest {
        tenant_id: "tenant-1".into(),
        user_id: "user-1".into(),
        correlation_id: "corr-1".into(),
        model: "text-embedding-ada-002".into(),
        input: vec!["hello".into()],
        ..Default::default()
    };

    let first = gateway.create_embeddings(req.clone()).await.unwrap();
    assert_eq!(first.provider, ProviderId::AzureOpenAi);
    assert!(!first.cache_hit);

    let second = gateway.create_embeddings(req).await.unwrap();
    assert!(second.cache_hit);
    assert_eq!(second.data, first.data);
}

#[tokio::test]
async fn list_models_aggregates_all_providers() {
    let azure = Arc::new(StubAdapter::healthy(
        ProviderId::AzureOpenAi,
        &["gpt-35-turbo"],
    ));
    let bedrock = Arc::new(StubAdapter::healthy(
        ProviderId::AwsBedrock,
        &["anthropic.claude-3-haiku-20240307-v1:0"],
    ));

    let router = Router::new(router_config());
    router
        .register_provider(azure, ProviderConfig::new(ProviderId::AzureOpenAi))
        .await;
    router
        .register_provider(bedrock, ProviderConfig::new(ProviderId::AwsBedrock))
        .await;

    let gateway = Gateway::new(router, Arc::new(NoopMetrics));
    let all = gateway.list_models(None).await.unwrap();
    assert_eq!(all.len(), 2);

    let azure_only = gateway
        .list_models(Some(ProviderId::AzureOpenAi))
        .await
        .unwrap();
    assert_eq!(azure_only.len(), 1);
    assert_eq!(azure_only[0].provider, ProviderId::AzureOpenAi);

    let model = gateway.get_model("gpt-35-turbo", None).await.unwrap();
    assert_eq!(model.provider, ProviderId::AzureOpenAi);
    let missing = gateway.get_model("gpt-5-ultra", None).await.unwrap_err();
    assert_eq!(missing.kind, ErrorKind::NotFound);
}

#[tokio::test]
async fn completion_response_equals_cached_payload_except_hit_flag() {
    let adapter = Arc::new(StubAdapter::healthy(
        ProviderId::AzureOpenAi,
        &["gpt-35-turbo"],
    ));
    let (cache, cache_config) = memory_cache();
    let gateway = single_provider_gateway(adapter)
        .await
        .with_cache(cache, cache_config);

    let mut first = gateway.create_completion(request("gpt-35-turbo")).await.unwrap();
    let second = gateway.create_completion(request("gpt-35-turbo")).await.unwrap();

    // Only the hit flag may differ.
    first.cache_hit = true;
    assert_eq!(first, second);
}
