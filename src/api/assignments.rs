//! Assignment lifecycle endpoints.
//!
//! Annotators drive an assignment up to `submitted`; the project owner
//! approves (which pays) or rejects it.

use axum::{
    body::Bytes,
    extract::{Extension, Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;

use super::routes::{api_error, optional_json, ApiError, AppState};
use super::types::{RejectRequest, SubmitRequest};
use crate::identity::Caller;
use crate::market::{Approval, ApprovalOutcome, AssignmentQuery};
use crate::model::{Assignment, AssignmentId};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_assignments))
        .route("/:id", get(get_assignment))
        .route("/:id/accept", post(accept))
        .route("/:id/start", post(start))
        .route("/:id/submit", post(submit))
        .route("/:id/cancel", post(cancel))
        .route("/:id/approve", post(approve))
        .route("/:id/reject", post(reject))
}

async fn list_assignments(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<AssignmentQuery>,
) -> Result<Json<Vec<Assignment>>, ApiError> {
    state
        .market
        .list_assignments(&caller, query)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn get_assignment(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<AssignmentId>,
) -> Result<Json<Assignment>, ApiError> {
    state.market.get_assignment(&caller, id).await.map(Json).map_err(api_error)
}

async fn accept(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<AssignmentId>,
) -> Result<Json<Assignment>, ApiError> {
    state.market.accept(&caller, id).await.map(Json).map_err(api_error)
}

async fn start(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<AssignmentId>,
) -> Result<Json<Assignment>, ApiError> {
    state.market.start(&caller, id).await.map(Json).map_err(api_error)
}

async fn submit(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<AssignmentId>,
    Json(req): Json<SubmitRequest>,
) -> Result<Json<Assignment>, ApiError> {
    state
        .market
        .submit(&caller, id, req.result)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn cancel(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<AssignmentId>,
) -> Result<Json<Assignment>, ApiError> {
    state.market.cancel(&caller, id).await.map(Json).map_err(api_error)
}

/// POST /api/assignments/{id}/approve - Pays the annotator. Responds 502 with
/// the settlement reason when the payout did not complete. An empty body
/// pays the task price; a malformed one is a 400.
async fn approve(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<AssignmentId>,
    body: Bytes,
) -> Result<Json<ApprovalOutcome>, ApiError> {
    let approval: Approval = optional_json(&body)?;
    state
        .market
        .approve(&caller, id, approval)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn reject(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<AssignmentId>,
    body: Bytes,
) -> Result<Json<Assignment>, ApiError> {
    let req: RejectRequest = optional_json(&body)?;
    state
        .market
        .reject(&caller, id, req.reason)
        .await
        .map(Json)
        .map_err(api_error)
}
