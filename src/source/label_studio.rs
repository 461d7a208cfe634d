//! Label Studio REST client.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use super::{AnnotationSource, SourceConnection, SourceConnector, SourceError, SourceProject, SourceTask};

const PAGE_SIZE: usize = 100;
/// Safety cap on task pagination.
const MAX_PAGES: usize = 1000;

/// Creates [`LabelStudioClient`]s sharing one HTTP connection pool.
#[derive(Clone)]
pub struct LabelStudioConnector {
    client: Client,
}

impl LabelStudioConnector {
    pub fn new(timeout: Duration) -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SourceError::Network(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

impl SourceConnector for LabelStudioConnector {
    fn connect(&self, connection: &SourceConnection) -> Result<Arc<dyn AnnotationSource>, SourceError> {
        Ok(Arc::new(LabelStudioClient {
            client: self.client.clone(),
            connection: connection.clone(),
        }))
    }
}

pub struct LabelStudioClient {
    client: Client,
    connection: SourceConnection,
}

#[derive(Debug, Deserialize)]
struct ProjectPayload {
    id: i64,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    task_number: Option<u64>,
}

impl From<ProjectPayload> for SourceProject {
    fn from(p: ProjectPayload) -> Self {
        SourceProject {
            id: p.id,
            title: p.title.unwrap_or_else(|| format!("Project {}", p.id)),
            description: p.description.unwrap_or_default(),
            task_count: p.task_number,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TaskPayload {
    id: i64,
    #[serde(default)]
    data: serde_json::Value,
}

/// Label Studio answers list endpoints either with a bare array or with a
/// paginated envelope, depending on version.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Listing<T> {
    Plain(Vec<T>),
    Paged {
        #[serde(alias = "tasks")]
        results: Vec<T>,
        #[serde(default)]
        next: Option<String>,
    },
}

impl<T> Listing<T> {
    fn into_parts(self) -> (Vec<T>, bool) {
        match self {
            Listing::Plain(items) => (items, false),
            Listing::Paged { results, next } => (results, next.is_some()),
        }
    }
}

impl LabelStudioClient {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.connection.base_url, path)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, SourceError> {
        let response = self
            .client
            .get(self.url(path))
            .header("Authorization", self.connection.credential.authorization_header())
            .query(query)
            .send()
            .await
            .map_err(|e| SourceError::Network(e.to_string()))?;
        let response = check_status(response, path).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| SourceError::Parse(format!("{}: {}", path, e)))
    }

    async fn fetch_project(&self, project_id: i64) -> Result<SourceProject, SourceError> {
        let payload: ProjectPayload = self
            .get_json(&format!("/api/projects/{}/", project_id), &[])
            .await?;
        Ok(payload.into())
    }

    async fn fetch_tasks(&self, project_id: i64) -> Result<Vec<SourceTask>, SourceError> {
        let path = format!("/api/projects/{}/tasks/", project_id);
        let mut tasks = Vec::new();
        for page in 1..=MAX_PAGES {
            let query = [("page", page.to_string()), ("page_size", PAGE_SIZE.to_string())];
            let listing: Listing<TaskPayload> = match self.get_json(&path, &query).await {
                Ok(listing) => listing,
                // Label Studio answers 404 once the page index runs past the end
                Err(SourceError::NotFound(_)) if page > 1 => break,
                Err(e) => return Err(e),
            };
            let (items, has_next) = listing.into_parts();
            let count = items.len();
            tasks.extend(items.into_iter().map(|t| SourceTask { id: t.id, data: t.data }));
            if count == 0 || (!has_next && count < PAGE_SIZE) {
                break;
            }
        }
        tracing::debug!(project_id, count = tasks.len(), "Fetched tasks from Label Studio");
        Ok(tasks)
    }
}

async fn check_status(response: reqwest::Response, path: &str) -> Result<reqwest::Response, SourceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = if body.is_empty() {
        path.to_string()
    } else {
        format!("{}: {}", path, body.chars().take(300).collect::<String>())
    };
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SourceError::Unauthorized(message),
        StatusCode::NOT_FOUND => SourceError::NotFound(message),
        other => SourceError::Http {
            status: other.as_u16(),
            message,
        },
    })
}

#[async_trait]
impl AnnotationSource for LabelStudioClient {
    async fn list_projects(&self) -> Result<Vec<SourceProject>, SourceError> {
        let mut projects = Vec::new();
        for page in 1..=MAX_PAGES {
            let query = [("page", page.to_string()), ("page_size", PAGE_SIZE.to_string())];
            let listing: Listing<ProjectPayload> = self.get_json("/api/projects/", &query).await?;
            let (items, has_next) = listing.into_parts();
            projects.extend(items.into_iter().map(SourceProject::from));
            if !has_next {
                break;
            }
        }
        Ok(projects)
    }

    async fn import_project(&self, project_id: i64) -> Result<(SourceProject, Vec<SourceTask>), SourceError> {
        let project = self.fetch_project(project_id).await?;
        let tasks = self.fetch_tasks(project_id).await?;
        Ok((project, tasks))
    }

    async fn sync_tasks(&self, project_id: i64) -> Result<Vec<SourceTask>, SourceError> {
        self.fetch_tasks(project_id).await
    }

    async fn push_annotation(
        &self,
        task_id: i64,
        result: &serde_json::Value,
        completed_by: Option<&str>,
    ) -> Result<(), SourceError> {
        let path = format!("/api/tasks/{}/annotations/", task_id);
        // Label Studio expects `result` to be a list of regions
        let regions = match result {
            serde_json::Value::Array(_) => result.clone(),
            other => serde_json::Value::Array(vec![other.clone()]),
        };
        let body = serde_json::json!({
            "task": task_id,
            "result": regions,
            "completed_by": completed_by,
        });
        let response = self
            .client
            .post(self.url(&path))
            .header("Authorization", self.connection.credential.authorization_header())
            .json(&body)
            .send()
            .await
            .map_err(|e| SourceError::Network(e.to_string()))?;
        check_status(response, &path).await?;
        Ok(())
    }
}
