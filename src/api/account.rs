//! Per-user endpoints.
//!
//! - `GET /api/me` - Authenticated identity
//! - `PUT /api/connection` - Connect a labeling tool (researchers)
//! - `GET /api/connection/projects` - Projects visible through that connection
//! - `GET /api/wallet` / `PUT /api/wallet` - Payout wallet
//! - `GET /api/audit` - Audit trail

use axum::{
    extract::{Extension, Query, State},
    routing::{get, put},
    Json, Router,
};
use std::sync::Arc;

use super::routes::{api_error, ApiError, AppState};
use super::types::{
    AuditQuery, ConnectSourceRequest, ConnectionResponse, RegisterWalletRequest, WhoAmIResponse,
};
use crate::audit::AuditEntry;
use crate::error::MarketError;
use crate::identity::Caller;
use crate::model::WalletRecord;
use crate::source::SourceProject;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/me", get(whoami))
        .route("/api/connection", put(connect_source))
        .route("/api/connection/projects", get(list_source_projects))
        .route("/api/wallet", get(get_wallet).put(register_wallet))
        .route("/api/audit", get(list_audit))
}

async fn whoami(Extension(caller): Extension<Caller>) -> Json<WhoAmIResponse> {
    Json(WhoAmIResponse {
        user_id: caller.user_id,
        role: caller.role,
    })
}

async fn connect_source(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Json(req): Json<ConnectSourceRequest>,
) -> Result<Json<ConnectionResponse>, ApiError> {
    let connection = state
        .market
        .save_connection(&caller, &req.base_url, req.credential)
        .await
        .map_err(api_error)?;
    Ok(Json(ConnectionResponse {
        credential_kind: connection.credential.kind().to_string(),
        base_url: connection.base_url,
    }))
}

async fn list_source_projects(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
) -> Result<Json<Vec<SourceProject>>, ApiError> {
    state
        .market
        .list_source_projects(&caller)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn get_wallet(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
) -> Result<Json<WalletRecord>, ApiError> {
    state
        .market
        .wallet_for(&caller.user_id)
        .await
        .and_then(|w| w.ok_or_else(|| MarketError::NotFound("wallet".to_string())))
        .map(Json)
        .map_err(api_error)
}

async fn register_wallet(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Json(req): Json<RegisterWalletRequest>,
) -> Result<Json<WalletRecord>, ApiError> {
    state
        .market
        .register_wallet(&caller, &req.address)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn list_audit(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Vec<AuditEntry>>, ApiError> {
    state
        .market
        .audit_entries(&caller, query.into())
        .await
        .map(Json)
        .map_err(api_error)
}
