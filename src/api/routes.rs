//! HTTP server setup and shared handler plumbing.

use std::sync::Arc;

use axum::middleware;
use serde::de::DeserializeOwned;
use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::error::MarketError;
use crate::market::{spawn_reconciler, Marketplace};
use crate::settlement::{DryRunTransferClient, HttpTransferClient, TransferClient};
use crate::source::{LabelStudioConnector, SourceError};
use crate::store::create_store;

use super::account;
use super::assignments as assignments_api;
use super::auth;
use super::projects as projects_api;
use super::settlements as settlements_api;
use super::tasks as tasks_api;
use super::types::HealthResponse;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub market: Arc<Marketplace>,
}

/// Handler error: status code plus a message for the client.
pub type ApiError = (StatusCode, String);

/// Map a marketplace error to an HTTP response.
pub fn api_error(e: MarketError) -> ApiError {
    let status = match &e {
        MarketError::Validation(_) => StatusCode::BAD_REQUEST,
        MarketError::InvalidState { .. } => StatusCode::CONFLICT,
        MarketError::Forbidden(_) => StatusCode::FORBIDDEN,
        MarketError::AlreadyClaimed(_) => StatusCode::CONFLICT,
        MarketError::Settlement(_) => StatusCode::BAD_GATEWAY,
        MarketError::NotFound(_) => StatusCode::NOT_FOUND,
        MarketError::Source(SourceError::InvalidConnection(_)) => StatusCode::BAD_REQUEST,
        MarketError::Source(_) => StatusCode::BAD_GATEWAY,
        MarketError::Audit(_) | MarketError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!(status = status.as_u16(), error = %e, "Request failed");
    } else {
        tracing::debug!(status = status.as_u16(), error = %e, "Request rejected");
    }
    (status, e.to_string())
}

/// Parse a JSON body that may be left out entirely.
///
/// An empty body yields `T::default()`; anything else must deserialize,
/// otherwise the request is refused with 400.
pub fn optional_json<T: DeserializeOwned + Default>(body: &[u8]) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("Invalid request body: {}", e)))
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let store = create_store(config.store_type, config.data_dir.clone()).await?;
    if !store.is_persistent() {
        tracing::warn!("Using in-memory store; all data is lost on restart");
    }

    let transfers: Arc<dyn TransferClient> = match &config.transfer_gateway {
        Some(gateway) => {
            tracing::info!(url = %gateway.url, "Payouts go through the transfer gateway");
            Arc::new(HttpTransferClient::new(
                &gateway.url,
                gateway.token.clone(),
                config.market.settlement.transfer_timeout,
            )?)
        }
        None => {
            tracing::warn!("TRANSFER_GATEWAY_URL not set; payouts are simulated (dry run)");
            Arc::new(DryRunTransferClient::new())
        }
    };
    let sources = Arc::new(LabelStudioConnector::new(config.source_timeout)?);

    let market = Arc::new(Marketplace::new(
        store,
        transfers,
        sources,
        config.market.clone(),
    ));
    let reconciler = spawn_reconciler(
        Arc::clone(&market),
        config.reconcile_interval,
        config.reconcile_after,
    );

    let state = Arc::new(AppState {
        config: config.clone(),
        market,
    });

    let app = router(Arc::clone(&state));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);

    // Setup graceful shutdown on SIGTERM/SIGINT
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(handle) = reconciler {
        handle.abort();
    }
    Ok(())
}

/// Build the full router around `state`.
pub fn router(state: Arc<AppState>) -> Router {
    let public_routes = Router::new().route("/api/health", get(health));

    let protected_routes = Router::new()
        .nest("/api/projects", projects_api::routes())
        .nest("/api/tasks", tasks_api::routes())
        .nest("/api/assignments", assignments_api::routes())
        .nest("/api/settlements", settlements_api::routes())
        .merge(account::routes())
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_auth,
        ));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        persistent_store: state.market.store().is_persistent(),
        live_transfers: state.config.transfer_gateway.is_some(),
        dev_mode: state.config.dev_mode,
    })
}

/// Wait for SIGTERM/SIGINT.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, draining connections...");
}
