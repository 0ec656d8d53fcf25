//! The gateway: HTTP surface, security pipeline, providers, and audit.

use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tracing::info;

pub mod audit;
pub mod handler;
pub mod injection;
pub mod metrics;
pub mod pii;
pub mod pipeline;
pub mod providers;
pub mod ratelimit;
pub mod response;
pub mod stream;

use crate::clients::ClientDirectory;
use crate::config::Settings;
use self::audit::AuditSink;
use self::injection::InjectionScorer;
use self::metrics::GatewayMetrics;
use self::pii::PiiScanner;
use self::pipeline::{build_pipeline, Pipeline};
use self::providers::ProviderRegistry;
use self::ratelimit::RateLimiter;

/// Shared state for all requests.
pub struct GatewayState {
    pub settings: Settings,
    pub directory: ClientDirectory,
    pub pipeline: Pipeline,
    pub scorer: Arc<InjectionScorer>,
    pub scanner: Arc<PiiScanner>,
    pub registry: ProviderRegistry,
    pub audit: Arc<AuditSink>,
    pub metrics: GatewayMetrics,
}

impl GatewayState {
    pub fn new(settings: Settings) -> Result<Self> {
        let directory = ClientDirectory::from_settings(&settings)?;
        let limiter = Arc::new(RateLimiter::new());
        let scorer = Arc::new(InjectionScorer::new());
        let scanner = Arc::new(PiiScanner::new());
        let pipeline = build_pipeline(&settings, limiter, scorer.clone(), scanner.clone());
        let registry = ProviderRegistry::from_settings(&settings)?;
        let audit = Arc::new(AuditSink::new(settings.audit_log_file.as_deref())?);

        Ok(Self {
            settings,
            directory,
            pipeline,
            scorer,
            scanner,
            registry,
            audit,
            metrics: GatewayMetrics::new(),
        })
    }
}

/// Build the gateway router.
pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(handler::chat_completions))
        .route("/health", get(handler::health))
        .route("/metrics", get(handler::metrics))
        .with_state(state)
}

/// Bind and serve until interrupted.
pub async fn run(settings: Settings) -> Result<()> {
    let listen_addr = settings.listen_addr.clone();
    let state = Arc::new(GatewayState::new(settings)?);

    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("failed to bind {listen_addr}"))?;
    info!(addr = %listener.local_addr()?, "gateway listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
