//! Settlement endpoints.
//!
//! - `GET /api/settlements?status=` - The caller's payouts
//! - `GET /api/settlements/{id}` - One record (recipient or project owner)
//! - `POST /api/settlements/{id}/retry` - Retry a failed transfer
//! - `POST /api/settlements/{id}/reconcile` - Resolve a pending transfer
//! - `POST /api/settlements/{id}/refund` - Record an out-of-band refund

use axum::{
    body::Bytes,
    extract::{Extension, Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;

use super::routes::{api_error, optional_json, ApiError, AppState};
use super::types::{RefundRequest, SettlementListQuery};
use crate::identity::Caller;
use crate::market::ApprovalOutcome;
use crate::model::{SettlementTransaction, TransactionId};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_payouts))
        .route("/:id", get(get_settlement))
        .route("/:id/retry", post(retry))
        .route("/:id/reconcile", post(reconcile))
        .route("/:id/refund", post(refund))
}

async fn list_payouts(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<SettlementListQuery>,
) -> Result<Json<Vec<SettlementTransaction>>, ApiError> {
    state
        .market
        .list_payouts(&caller, query.status)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn get_settlement(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<TransactionId>,
) -> Result<Json<SettlementTransaction>, ApiError> {
    state.market.get_settlement(&caller, id).await.map(Json).map_err(api_error)
}

async fn retry(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<TransactionId>,
) -> Result<Json<ApprovalOutcome>, ApiError> {
    state
        .market
        .retry_settlement(&caller, id)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn reconcile(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<TransactionId>,
) -> Result<Json<ApprovalOutcome>, ApiError> {
    state
        .market
        .reconcile_settlement(Some(&caller), id)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn refund(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<TransactionId>,
    body: Bytes,
) -> Result<Json<SettlementTransaction>, ApiError> {
    let req: RefundRequest = optional_json(&body)?;
    state
        .market
        .refund_settlement(&caller, id, req.note)
        .await
        .map(Json)
        .map_err(api_error)
}
