//! API request and response types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::{AuditAction, AuditFilter};
use crate::identity::{Role, UserId};
use crate::model::{ProjectId, SettlementStatus};
use crate::money::Usdc;
use crate::source::SourceCredential;

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Whether the store survives restarts
    pub persistent_store: bool,
    /// Whether payouts go to a real gateway
    pub live_transfers: bool,
    pub dev_mode: bool,
}

/// Who the server thinks the caller is.
#[derive(Debug, Clone, Serialize)]
pub struct WhoAmIResponse {
    pub user_id: UserId,
    pub role: Role,
}

/// Request to connect a labeling tool.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectSourceRequest {
    /// Base URL of the labeling tool
    pub base_url: String,
    /// `{"kind": "api_token" | "access_token", "secret": "..."}`
    pub credential: SourceCredential,
}

/// Stored connection, without the secret.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionResponse {
    pub base_url: String,
    pub credential_kind: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImportProjectRequest {
    /// Project id in the labeling tool
    pub source_project_id: i64,
    /// Total budget; tasks fall back to the default price without one
    #[serde(default)]
    pub budget: Option<Usdc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetBudgetRequest {
    pub budget: Usdc,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskListQuery {
    #[serde(default)]
    pub project_id: Option<ProjectId>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    /// Annotation result; any non-empty JSON value
    pub result: serde_json::Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RejectRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RefundRequest {
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettlementListQuery {
    #[serde(default)]
    pub status: Option<SettlementStatus>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterWalletRequest {
    /// `0x`-prefixed address; mixed case must carry a valid EIP-55 checksum
    pub address: String,
}

/// Query parameters for the audit trail.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditQuery {
    #[serde(default)]
    pub actor: Option<UserId>,
    #[serde(default)]
    pub action: Option<AuditAction>,
    #[serde(default)]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl From<AuditQuery> for AuditFilter {
    fn from(q: AuditQuery) -> Self {
        AuditFilter {
            actor: q.actor,
            action: q.action,
            resource_id: q.resource_id,
            since: q.since,
            until: q.until,
            limit: q.limit,
        }
    }
}
