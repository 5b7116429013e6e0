//! Application startup and lifecycle management.

use crate::config::BankingConfig;
use crate::handlers::{health_check, metrics_handler, oauth_callback, readiness_check};
use crate::providers::ProviderRegistry;
use crate::services::{
    BankingStore, ConnectionManager, EventSink, OAuthCallbackHandler, PgBankingStore,
    PrometheusEventSink, SyncEngine,
};
use crate::workers::SyncScheduler;
use axum::{routing::get, Router};
use service_core::error::AppError;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub callback: OAuthCallbackHandler,
    pub sync: SyncEngine,
    /// Absent when events go to a sink without a registry.
    pub metrics: Option<PrometheusEventSink>,
    pub app_return_url: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        .route("/banking/callback", get(oauth_callback))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
    scheduler: SyncScheduler,
}

impl Application {
    /// Connect to Postgres, run migrations and bind the HTTP listener.
    pub async fn build(config: BankingConfig) -> Result<Self, AppError> {
        let store = PgBankingStore::connect(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(code = e.code(), "Failed to connect to PostgreSQL");
            e
        })?;

        store.run_migrations().await.map_err(|e| {
            tracing::error!(code = e.code(), "Failed to run migrations");
            e
        })?;

        Self::with_store(config, Arc::new(store)).await
    }

    /// Build on top of an existing store.
    pub async fn with_store(config: BankingConfig, store: Arc<dyn BankingStore>) -> Result<Self, AppError> {
        let metrics = PrometheusEventSink::new()
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("Failed to create metrics registry: {}", e)))?;
        let events: Arc<dyn EventSink> = Arc::new(metrics.clone());

        let providers = ProviderRegistry::from_configs(config.provider_configs()?)?;
        if providers.available().is_empty() {
            tracing::warn!("No banking providers configured; link requests will be refused");
        }
        for (kind, result) in providers.authenticate_all().await {
            match result {
                Ok(()) => tracing::info!(provider = kind.as_str(), "Provider credentials accepted"),
                Err(e) => tracing::warn!(provider = kind.as_str(), code = e.code(), "Provider authentication failed"),
            }
        }

        let manager = ConnectionManager::new(
            store,
            Arc::new(providers),
            Arc::new(config.cipher()?),
            config.link_state_signer(),
            config.link.redirect_uri.clone(),
            events,
        );
        let sync = SyncEngine::new(manager.clone(), config.sync_settings());
        let scheduler = SyncScheduler::new(sync.clone(), config.scheduler_config());

        let state = AppState {
            callback: OAuthCallbackHandler::new(manager),
            sync,
            metrics: Some(metrics),
            app_return_url: config.link.app_return_url.clone(),
        };

        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(port = port, "Banking service listener bound");

        Ok(Self {
            port,
            listener,
            state,
            scheduler,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Cancelling this token stops the sync scheduler.
    pub fn scheduler_token(&self) -> CancellationToken {
        self.scheduler.shutdown_token()
    }

    /// Serve HTTP and run the sync scheduler until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let scheduler_token = self.scheduler.shutdown_token();
        tokio::spawn(self.scheduler.run());

        tracing::info!(
            service = "banking-service",
            version = env!("CARGO_PKG_VERSION"),
            port = self.port,
            "Service ready to accept connections"
        );

        let result = axum::serve(self.listener, router(self.state)).await;
        scheduler_token.cancel();

        result.map_err(|e| {
            tracing::error!(error = %e, "HTTP server error");
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}
