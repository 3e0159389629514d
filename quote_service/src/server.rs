//! HTTP server exposing the quote store through the bounded dispatcher.

use anyhow::{Context, Result};
use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    middleware,
    response::Json,
    routing::{delete, get},
    Router,
};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Instant};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

use crate::{
    dispatcher::{Dispatcher, DispatcherStats},
    error::ApiError,
    middleware::{create_body_limit_layer, create_cors_layer, error_logging_middleware},
    model::{Quote, QuoteId, QuoteRequest},
    service::QuoteService,
    settings::{ServerConfig, Settings},
    store::{QuoteStore, StoreStats},
};

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub service: QuoteService,
    pub dispatcher: Arc<Dispatcher>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(service: QuoteService, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            service,
            dispatcher,
            started_at: Instant::now(),
        }
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub store: StoreStats,
    pub dispatcher: DispatcherStats,
}

#[derive(Debug, Deserialize)]
struct ListParams {
    author: Option<String>,
}

/// Create the HTTP router with all endpoints and middleware
pub fn create_router(state: AppState, server: &ServerConfig) -> Router {
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/quotes", get(list_quotes).post(create_quote))
        .route("/quotes/random", get(random_quote).delete(delete_random))
        .route("/quotes/:id", delete(delete_quote))
        .with_state(state)
        .layer(middleware::from_fn(error_logging_middleware))
        .layer(create_body_limit_layer(server.max_request_size_kb))
        .layer(TraceLayer::new_for_http());

    match create_cors_layer(&server.cors_origins) {
        Some(cors) => app.layer(cors),
        None => app,
    }
}

/// Health check endpoint. Reads counters directly so it still answers when
/// the dispatcher is saturated.
#[instrument(skip(state))]
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        store: state.service.stats(),
        dispatcher: state.dispatcher.stats(),
    })
}

#[instrument(skip(state, body))]
async fn create_quote(
    State(state): State<AppState>,
    body: Result<Json<QuoteRequest>, JsonRejection>,
) -> Result<Json<Quote>, ApiError> {
    let Json(request) = body?;
    let service = state.service.clone();

    let quote = state
        .dispatcher
        .submit(move || async move { service.create_quote(request) })
        .await?;

    info!(id = quote.id, author = %quote.author, "Quote created");
    Ok(Json(quote))
}

#[instrument(skip(state, params))]
async fn list_quotes(
    State(state): State<AppState>,
    params: Result<Query<ListParams>, QueryRejection>,
) -> Result<Json<Vec<Quote>>, ApiError> {
    let Query(params) = params.map_err(|e| ApiError::MalformedInput(e.body_text()))?;
    let service = state.service.clone();

    let quotes = state
        .dispatcher
        .submit(move || async move { service.list_quotes(params.author.as_deref()) })
        .await?;

    Ok(Json(quotes))
}

#[instrument(skip(state))]
async fn random_quote(State(state): State<AppState>) -> Result<Json<Quote>, ApiError> {
    let service = state.service.clone();

    let quote = state
        .dispatcher
        .submit(move || async move { service.random_quote() })
        .await??;

    Ok(Json(quote))
}

#[instrument(skip(state))]
async fn delete_quote(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id: QuoteId = raw_id
        .parse()
        .map_err(|_| ApiError::MalformedInput(format!("invalid quote id '{}'", raw_id)))?;
    let service = state.service.clone();

    state
        .dispatcher
        .submit(move || async move { service.delete_quote(id) })
        .await??;

    info!(id, "Quote deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// `random` is not an id; the static route shadows `/quotes/:id` here.
async fn delete_random() -> ApiError {
    ApiError::MalformedInput("invalid quote id 'random'".to_string())
}

/// Start the HTTP server and wait for shutdown signal
pub async fn serve(settings: &Settings) -> Result<()> {
    info!("Starting HTTP server on port {}", settings.server.port);

    let store = Arc::new(QuoteStore::new());
    let service = QuoteService::new(store);
    let dispatcher = Arc::new(Dispatcher::start(settings.dispatcher_config()));
    let state = AppState::new(service, dispatcher.clone());

    let app = create_router(state, &settings.server);

    let addr = settings.socket_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("HTTP server listening on {}", listener.local_addr()?);

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown())
        .await;

    dispatcher.shutdown().await;

    if let Err(e) = result {
        error!("HTTP server error: {}", e);
        return Err(e).context("HTTP server terminated abnormally");
    }

    info!("HTTP server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or Ctrl+C)
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), shutting down gracefully");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        }
    }
}
