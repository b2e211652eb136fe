use clap::Parser;
use qlens_core::cache::{MemoryCache, RedisCache, ResponseCache};
use qlens_core::providers::build_adapter;
use qlens_core::router::Router;
use qlens_gateway::config::{CacheBackendKind, Config, LogFormat};
use qlens_gateway::metrics::MetricsAggregator;
use qlens_gateway::server::{self, AppState};
use qlens_gateway::Gateway;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "qlens", about = "Multi-tenant LLM gateway", version)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => {
            let mut config = Config::default();
            config.apply_env_overrides();
            config
        }
    };

    init_tracing(&config);

    let router = Router::new(config.router.to_router_config());
    for (provider, settings) in &config.providers {
        if !settings.enabled {
            tracing::info!(provider = %provider, "provider disabled, skipping");
            continue;
        }
        let provider_config = settings.to_provider_config(*provider);
        let adapter = build_adapter(provider_config.clone())
            .map_err(|e| anyhow::anyhow!("cannot build adapter for {provider}: {e}"))?;
        router.register_provider(adapter, provider_config).await;
    }
    router.run_health_probes().await;
    router.spawn_health_loop();

    let metrics = Arc::new(MetricsAggregator::new());
    let cache_config = config.cache.to_cache_config();
    let mut gateway = Gateway::new(router.clone(), metrics.clone());
    if cache_config.enabled {
        let cache: Arc<dyn ResponseCache> = match config.cache.backend {
            CacheBackendKind::Memory => Arc::new(MemoryCache::new(cache_config.clone())),
            CacheBackendKind::Redis => {
                let url = config
                    .cache
                    .redis_url
                    .as_deref()
                    .unwrap_or("redis://127.0.0.1:6379");
                Arc::new(RedisCache::connect(url, cache_config.clone()).await?)
            }
        };
        gateway = gateway.with_cache(cache, cache_config);
    }

    let state = AppState::new(Arc::new(gateway), metrics);
    let result = server::serve(&config.server, state).await;
    router.close().await;
    result
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("qlens={0},qlens_core={0}", config.logging.level)));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.pretty().init(),
        LogFormat::Compact => builder.compact().init(),
    }
}
