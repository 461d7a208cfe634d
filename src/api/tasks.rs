//! Task marketplace endpoints.
//!
//! - `GET /api/tasks?project_id=` - Claimable tasks of published projects
//! - `POST /api/tasks/{id}/claim` - Claim a task (annotators)
//! - `DELETE /api/tasks/{id}` - Remove an unclaimed task (project owner)

use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use std::sync::Arc;

use super::routes::{api_error, ApiError, AppState};
use super::types::TaskListQuery;
use crate::identity::Caller;
use crate::model::{Assignment, Task, TaskId};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_available))
        .route("/:id/claim", post(claim_task))
        .route("/:id", delete(remove_task))
}

async fn list_available(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<TaskListQuery>,
) -> Result<Json<Vec<Task>>, ApiError> {
    state
        .market
        .list_available_tasks(&caller, query.project_id)
        .await
        .map(Json)
        .map_err(api_error)
}

/// POST /api/tasks/{id}/claim - 409 with "pick another" when someone was faster.
async fn claim_task(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<TaskId>,
) -> Result<(StatusCode, Json<Assignment>), ApiError> {
    let assignment = state.market.claim(&caller, id).await.map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(assignment)))
}

async fn remove_task(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<TaskId>,
) -> Result<StatusCode, ApiError> {
    state.market.remove_task(&caller, id).await.map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}
