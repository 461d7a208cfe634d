//! Labeling-tool integration.
//!
//! The marketplace only needs four things from the labeling tool: list a
//! user's projects, fetch a project with its tasks, fetch tasks again for a
//! sync, and push an approved annotation back. Connections are explicit
//! values owned by a researcher; nothing here keeps process-wide auth state.

mod label_studio;

pub use label_studio::{LabelStudioClient, LabelStudioConnector};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Credential presented to the labeling tool. Both kinds are accepted and
/// neither is preferred.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "secret", rename_all = "snake_case")]
pub enum SourceCredential {
    /// Legacy per-user API token (`Authorization: Token ...`)
    ApiToken(String),
    /// Short-lived access token (`Authorization: Bearer ...`)
    AccessToken(String),
}

impl SourceCredential {
    pub fn authorization_header(&self) -> String {
        match self {
            SourceCredential::ApiToken(token) => format!("Token {}", token),
            SourceCredential::AccessToken(token) => format!("Bearer {}", token),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SourceCredential::ApiToken(_) => "api_token",
            SourceCredential::AccessToken(_) => "access_token",
        }
    }

    fn secret(&self) -> &str {
        match self {
            SourceCredential::ApiToken(s) | SourceCredential::AccessToken(s) => s,
        }
    }
}

impl fmt::Debug for SourceCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(<redacted>)", self.kind())
    }
}

/// A researcher's connection to the labeling tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConnection {
    /// Base URL, e.g. `https://labelstudio.example.com`
    pub base_url: String,
    pub credential: SourceCredential,
}

impl SourceConnection {
    pub fn new(base_url: &str, credential: SourceCredential) -> Result<Self, SourceError> {
        let parsed = url::Url::parse(base_url.trim())
            .map_err(|e| SourceError::InvalidConnection(format!("invalid base URL: {}", e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(SourceError::InvalidConnection(format!(
                "unsupported URL scheme: {}",
                parsed.scheme()
            )));
        }
        if credential.secret().trim().is_empty() {
            return Err(SourceError::InvalidConnection(
                "credential cannot be empty".to_string(),
            ));
        }
        Ok(Self {
            base_url: parsed.as_str().trim_end_matches('/').to_string(),
            credential,
        })
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    #[error("invalid connection: {0}")]
    InvalidConnection(String),

    #[error("labeling tool rejected the credential: {0}")]
    Unauthorized(String),

    #[error("not found in labeling tool: {0}")]
    NotFound(String),

    #[error("labeling tool returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("could not reach labeling tool: {0}")]
    Network(String),

    #[error("unexpected response from labeling tool: {0}")]
    Parse(String),
}

/// Project as the labeling tool describes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceProject {
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub task_count: Option<u64>,
}

/// Task as the labeling tool describes it. `data` is kept opaque.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceTask {
    pub id: i64,
    pub data: serde_json::Value,
}

#[async_trait]
pub trait AnnotationSource: Send + Sync {
    async fn list_projects(&self) -> Result<Vec<SourceProject>, SourceError>;

    async fn import_project(&self, project_id: i64) -> Result<(SourceProject, Vec<SourceTask>), SourceError>;

    async fn sync_tasks(&self, project_id: i64) -> Result<Vec<SourceTask>, SourceError>;

    /// Write an approved annotation back to the labeling tool.
    async fn push_annotation(
        &self,
        task_id: i64,
        result: &serde_json::Value,
        completed_by: Option<&str>,
    ) -> Result<(), SourceError>;
}

/// Builds a client for a stored connection.
pub trait SourceConnector: Send + Sync {
    fn connect(&self, connection: &SourceConnection) -> Result<Arc<dyn AnnotationSource>, SourceError>;
}
