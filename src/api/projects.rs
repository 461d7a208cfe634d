//! Project API endpoints.
//!
//! - `GET /api/projects` - Own projects (researchers) or published ones (annotators)
//! - `POST /api/projects/import` - Import a labeling-tool project
//! - `GET /api/projects/{id}` - Project details
//! - `GET /api/projects/{id}/tasks` - All tasks of an owned project
//! - `POST /api/projects/{id}/sync` - Pull new tasks from the labeling tool
//! - `POST /api/projects/{id}/publish` / `unpublish`
//! - `PUT /api/projects/{id}/budget` - Set budget and reprice open tasks

use axum::{
    extract::{Extension, Path, State},
    routing::{get, post, put},
    Json, Router,
};
use std::sync::Arc;

use super::routes::{api_error, ApiError, AppState};
use super::types::{ImportProjectRequest, SetBudgetRequest};
use crate::identity::Caller;
use crate::market::{ImportOutcome, SyncOutcome};
use crate::model::{Project, ProjectId, Task};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_projects))
        .route("/import", post(import_project))
        .route("/:id", get(get_project))
        .route("/:id/tasks", get(list_project_tasks))
        .route("/:id/sync", post(sync_project))
        .route("/:id/publish", post(publish_project))
        .route("/:id/unpublish", post(unpublish_project))
        .route("/:id/budget", put(set_budget))
}

async fn list_projects(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
) -> Result<Json<Vec<Project>>, ApiError> {
    state.market.list_projects(&caller).await.map(Json).map_err(api_error)
}

async fn import_project(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Json(req): Json<ImportProjectRequest>,
) -> Result<Json<ImportOutcome>, ApiError> {
    state
        .market
        .import_project(&caller, req.source_project_id, req.budget)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn get_project(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<ProjectId>,
) -> Result<Json<Project>, ApiError> {
    state.market.get_project(&caller, id).await.map(Json).map_err(api_error)
}

async fn list_project_tasks(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<ProjectId>,
) -> Result<Json<Vec<Task>>, ApiError> {
    state
        .market
        .list_project_tasks(&caller, id)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn sync_project(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<ProjectId>,
) -> Result<Json<SyncOutcome>, ApiError> {
    state.market.sync_project(&caller, id).await.map(Json).map_err(api_error)
}

async fn publish_project(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<ProjectId>,
) -> Result<Json<Project>, ApiError> {
    state.market.publish(&caller, id).await.map(Json).map_err(api_error)
}

async fn unpublish_project(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<ProjectId>,
) -> Result<Json<Project>, ApiError> {
    state.market.unpublish(&caller, id).await.map(Json).map_err(api_error)
}

async fn set_budget(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<ProjectId>,
    Json(req): Json<SetBudgetRequest>,
) -> Result<Json<Project>, ApiError> {
    state
        .market
        .set_budget(&caller, id, req.budget)
        .await
        .map(Json)
        .map_err(api_error)
}
