//! Application startup and lifecycle management.

use crate::config::{MatchingConfig, StorageBackend};
use crate::handlers::{self, health_check, metrics_handler, readiness_check};
use crate::matching::{
    AutoMatchCoordinator, BatchOperationCoordinator, CandidateRanker, CandidateScorer,
    GroupCoordinator, MatchLifecycleManager,
};
use crate::services::{init_metrics, InMemoryMatchStore, MatchStore, PgMatchStore, RetryPolicy};
use axum::{
    body::Body,
    middleware,
    routing::{get, post},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::metrics::metrics_middleware;
use service_core::middleware::tracing::{make_request_span, request_id_middleware};
use service_core::observability::install_http_metrics_recorder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<MatchingConfig>,
    pub store: Arc<dyn MatchStore>,
    pub lifecycle: Arc<MatchLifecycleManager>,
    pub auto_match: Arc<AutoMatchCoordinator>,
    pub batch: Arc<BatchOperationCoordinator>,
    pub groups: Arc<GroupCoordinator>,
    /// Parent of every sweep's cancellation token; cancelled on shutdown.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Wire the engine around an already-opened store.
    pub fn new(config: MatchingConfig, store: Arc<dyn MatchStore>) -> Self {
        let retry = RetryPolicy::new(config.workers.storage_retry_max_elapsed);
        let scorer = CandidateScorer::new(config.scoring.clone());

        let lifecycle = Arc::new(MatchLifecycleManager::new(
            store.clone(),
            scorer.clone(),
            retry,
        ));
        let auto_match = Arc::new(AutoMatchCoordinator::new(
            store.clone(),
            CandidateRanker::new(scorer),
            lifecycle.clone(),
            config.workers.auto_match_concurrency,
            retry,
        ));
        let batch = Arc::new(BatchOperationCoordinator::new(
            store.clone(),
            lifecycle.clone(),
            config.workers.batch_concurrency,
            retry,
        ));
        let groups = Arc::new(GroupCoordinator::new(
            store.clone(),
            config.scoring.clone(),
            retry,
        ));

        Self {
            config: Arc::new(config),
            store,
            lifecycle,
            auto_match,
            batch,
            groups,
            shutdown: CancellationToken::new(),
        }
    }
}

/// Full HTTP surface: matching, groups and operational endpoints.
pub fn build_router(state: AppState) -> Router {
    let matching_routes = Router::new()
        .route("/auto", post(handlers::matching::run_auto_match))
        .route("/manual", post(handlers::matching::manual_match))
        .route(
            "/candidates/:receipt_id",
            get(handlers::matching::list_candidates),
        )
        .route("/proposals", get(handlers::matching::list_proposals))
        .route("/batch-approve", post(handlers::matching::batch_approve))
        .route("/batch-reject", post(handlers::matching::batch_reject))
        .route("/stats", get(handlers::matching::stats))
        .route(
            "/:match_id",
            get(handlers::matching::get_match)
                .patch(handlers::matching::update_match)
                .delete(handlers::matching::unmatch),
        )
        .route("/:match_id/confirm", post(handlers::matching::confirm_match))
        .route("/:match_id/reject", post(handlers::matching::reject_match));

    let group_routes = Router::new()
        .route("/", post(handlers::groups::create_group))
        .route(
            "/:group_id",
            get(handlers::groups::get_group).delete(handlers::groups::delete_group),
        )
        .route(
            "/:group_id/transactions",
            post(handlers::groups::add_transaction),
        )
        .route(
            "/:group_id/transactions/:transaction_id",
            axum::routing::delete(handlers::groups::remove_transaction),
        );

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        .nest("/matching", matching_routes)
        .nest("/transaction-groups", group_routes)
        .layer(TraceLayer::new_for_http().make_span_with(make_request_span::<Body>))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

async fn open_store(config: &MatchingConfig, run_migrations: bool) -> Result<Arc<dyn MatchStore>, AppError> {
    match config.storage {
        StorageBackend::Memory => {
            tracing::info!("Using in-memory match store");
            Ok(Arc::new(InMemoryMatchStore::new()))
        }
        StorageBackend::Postgres => {
            let url = config.database.url.as_deref().ok_or_else(|| {
                AppError::ConfigError(anyhow::anyhow!(
                    "DATABASE_URL is required when STORAGE_BACKEND=postgres"
                ))
            })?;
            let store = PgMatchStore::new(
                url,
                config.database.max_connections,
                config.database.min_connections,
            )
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to connect to PostgreSQL");
                e
            })?;

            if run_migrations {
                store.run_migrations().await.map_err(|e| {
                    tracing::error!(error = %e, "Failed to run migrations");
                    e
                })?;
            }
            Ok(Arc::new(store))
        }
    }
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: MatchingConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(config: MatchingConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(config: MatchingConfig, run_migrations: bool) -> Result<Self, AppError> {
        init_metrics();
        install_http_metrics_recorder();

        let store = open_store(&config, run_migrations).await?;
        let state = AppState::new(config, store);

        let addr: SocketAddr = state.config.common.bind_address().parse().map_err(|e| {
            AppError::ConfigError(anyhow::anyhow!("Invalid bind address: {}", e))
        })?;
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(port = port, "Matching service listener bound");

        Ok(Self {
            port,
            listener,
            state,
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Token cancelled on shutdown; running sweeps stop at the next receipt.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.state.shutdown.clone()
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let router = build_router(self.state);

        tracing::info!(
            service = "matching-service",
            version = env!("CARGO_PKG_VERSION"),
            port = self.port,
            "Service ready to accept connections"
        );

        axum::serve(self.listener, router).await.map_err(|e| {
            tracing::error!(error = %e, "HTTP server error");
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}
