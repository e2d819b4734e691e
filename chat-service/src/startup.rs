//! Application startup and lifecycle management.
//!
//! Everything fallible happens in [`Application::build`]; the caller decides
//! what a failure means for the process.

use crate::config::{ChatConfig, ProviderKind};
use crate::handlers;
use crate::relay::RelaySettings;
use crate::services::metrics;
use crate::services::providers::gemini::{GeminiConfig, GeminiTextProvider};
use crate::services::providers::mock::MockTextProvider;
use crate::services::providers::{GenerationParams, TextProvider};
use axum::{
    routing::{get, post},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::request_id_middleware;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Thinking budget sent upstream: stream tokens without deliberation.
const THINKING_BUDGET: i32 = 0;

/// Shared state handed to every handler. Holds no per-request data.
#[derive(Clone)]
pub struct AppState {
    pub provider: Arc<dyn TextProvider>,
    pub relay: Arc<RelaySettings>,
    pub service_name: Arc<str>,
}

impl AppState {
    pub fn new(config: &ChatConfig, provider: Arc<dyn TextProvider>) -> Self {
        let relay = RelaySettings {
            protocol: config.relay.protocol,
            params: GenerationParams {
                system_instruction: Some(config.relay.system_instruction.clone()),
                thinking_budget: Some(THINKING_BUDGET),
                ..Default::default()
            },
            idle_timeout: config.relay.idle_timeout,
        };

        Self {
            provider,
            relay: Arc::new(relay),
            service_name: Arc::from(config.relay.service_name.as_str()),
        }
    }
}

/// Build the HTTP router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_handler))
        .route("/ai-chat", post(handlers::ai_chat))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Construct the provider selected by configuration.
pub fn build_provider(config: &ChatConfig) -> Result<Arc<dyn TextProvider>, AppError> {
    match config.relay.provider {
        ProviderKind::Gemini => {
            let provider = GeminiTextProvider::new(GeminiConfig {
                api_key: config.google.api_key.clone(),
                model: config.models.text_model.clone(),
                api_base: config.google.api_base.clone(),
            })
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!(e)))?;

            tracing::info!(
                model = %config.models.text_model,
                "Initialized Gemini text provider"
            );
            Ok(Arc::new(provider))
        }
        ProviderKind::Mock => {
            tracing::warn!("Using mock text provider; responses are not generated");
            Ok(Arc::new(MockTextProvider::echo()))
        }
    }
}

pub struct Application {
    port: u16,
    listener: TcpListener,
    router: Router,
}

impl Application {
    pub async fn build(config: ChatConfig) -> Result<Self, AppError> {
        let provider = build_provider(&config)?;
        Self::build_with_provider(config, provider).await
    }

    /// Build around an already constructed provider.
    pub async fn build_with_provider(
        config: ChatConfig,
        provider: Arc<dyn TextProvider>,
    ) -> Result<Self, AppError> {
        metrics::init_metrics().map_err(|e| {
            AppError::InternalError(anyhow::anyhow!("Failed to initialize metrics: {}", e))
        })?;

        let state = AppState::new(&config, provider);
        tracing::info!(
            protocol = state.relay.protocol.as_str(),
            idle_timeout_secs = state.relay.idle_timeout.as_secs(),
            "Relay configured"
        );

        let addr = config.common.bind_addr();
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!("Failed to bind TCP listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!("Listening on {}", port);

        Ok(Self {
            port,
            listener,
            router: router(state),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        axum::serve(self.listener, self.router).await
    }

    /// Serve until `signal` resolves, then let in-flight streams finish.
    pub async fn run_with_graceful_shutdown<F>(self, signal: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(signal)
            .await
    }
}
