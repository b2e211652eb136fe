//! # HTTP Server
//!
//! Route table and server lifecycle. Everything interesting happens in
//! the orchestrator; this module only binds it to axum.

use crate::config::ServerSettings;
use crate::gateway::Gateway;
use crate::handlers;
use crate::metrics::MetricsAggregator;
use axum::routing::{get, post};
use axum::Router;
use qlens_core::observability::CorrelationIds;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub metrics: Arc<MetricsAggregator>,
    pub correlation_ids: Arc<CorrelationIds>,
}

impl AppState {
    pub fn new(gateway: Arc<Gateway>, metrics: Arc<MetricsAggregator>) -> Self {
        Self {
            gateway,
            metrics,
            correlation_ids: Arc::new(CorrelationIds::new("qlens")),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/health/ready", get(handlers::ready))
        .route("/v1/models", get(handlers::list_models))
        .route("/v1/completions", post(handlers::completions))
        .route("/v1/embeddings", post(handlers::embeddings))
        .route("/metrics", get(handlers::metrics_text))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(settings: &ServerSettings, state: AppState) -> anyhow::Result<()> {
    let app = build_router(state).layer(TimeoutLayer::new(settings.timeout));
    let listener =
        tokio::net::TcpListener::bind((settings.host.as_str(), settings.port)).await?;
    tracing::info!(host = %settings.host, port = settings.port, "qlens gateway listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
