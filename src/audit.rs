//! Append-only audit trail for marketplace actions.
//!
//! Entries are written through [`AuditLog`] and are never updated or deleted;
//! the store exposes no mutation besides append. Financial actions (approve,
//! reject, settlement attempts, refunds) must not proceed unaudited, so callers
//! use [`AuditLog::record`] and propagate its error. Everything else goes
//! through [`AuditLog::record_or_log`], which reports a failed write at `error`
//! level and lets the operation continue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::identity::UserId;
use crate::model::UnknownStatus;
use crate::store::{AuditStore, MarketStore, StoreError};

/// Kinds of audited actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditAction {
    #[serde(rename = "source.connected")]
    SourceConnected,
    #[serde(rename = "project.import")]
    ProjectImport,
    #[serde(rename = "project.sync")]
    ProjectSync,
    #[serde(rename = "project.publish")]
    ProjectPublish,
    #[serde(rename = "project.unpublish")]
    ProjectUnpublish,
    #[serde(rename = "project.budget")]
    ProjectBudget,
    #[serde(rename = "task.remove")]
    TaskRemove,
    #[serde(rename = "task.claim")]
    TaskClaim,
    #[serde(rename = "task.accept")]
    TaskAccept,
    #[serde(rename = "task.start")]
    TaskStart,
    #[serde(rename = "task.submit")]
    TaskSubmit,
    #[serde(rename = "task.cancel")]
    TaskCancel,
    #[serde(rename = "task.approve")]
    TaskApprove,
    #[serde(rename = "task.reject")]
    TaskReject,
    #[serde(rename = "payment.initiated")]
    PaymentInitiated,
    #[serde(rename = "payment.completed")]
    PaymentCompleted,
    #[serde(rename = "payment.failed")]
    PaymentFailed,
    #[serde(rename = "payment.pending")]
    PaymentPending,
    #[serde(rename = "payment.refund")]
    PaymentRefund,
    #[serde(rename = "wallet.connected")]
    WalletConnected,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::SourceConnected => "source.connected",
            AuditAction::ProjectImport => "project.import",
            AuditAction::ProjectSync => "project.sync",
            AuditAction::ProjectPublish => "project.publish",
            AuditAction::ProjectUnpublish => "project.unpublish",
            AuditAction::ProjectBudget => "project.budget",
            AuditAction::TaskRemove => "task.remove",
            AuditAction::TaskClaim => "task.claim",
            AuditAction::TaskAccept => "task.accept",
            AuditAction::TaskStart => "task.start",
            AuditAction::TaskSubmit => "task.submit",
            AuditAction::TaskCancel => "task.cancel",
            AuditAction::TaskApprove => "task.approve",
            AuditAction::TaskReject => "task.reject",
            AuditAction::PaymentInitiated => "payment.initiated",
            AuditAction::PaymentCompleted => "payment.completed",
            AuditAction::PaymentFailed => "payment.failed",
            AuditAction::PaymentPending => "payment.pending",
            AuditAction::PaymentRefund => "payment.refund",
            AuditAction::WalletConnected => "wallet.connected",
        }
    }

    /// Actions that move or decide money.
    pub fn is_financial(&self) -> bool {
        matches!(
            self,
            AuditAction::TaskApprove
                | AuditAction::TaskReject
                | AuditAction::PaymentInitiated
                | AuditAction::PaymentCompleted
                | AuditAction::PaymentFailed
                | AuditAction::PaymentPending
                | AuditAction::PaymentRefund
        )
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string())).map_err(|_| UnknownStatus {
            kind: "audit action",
            value: s.to_string(),
        })
    }
}

/// A persisted audit entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    /// `None` for system actions (e.g. the background reconciler)
    pub actor: Option<UserId>,
    pub action: AuditAction,
    pub resource_type: String,
    pub resource_id: String,
    pub timestamp: DateTime<Utc>,
    pub details: serde_json::Value,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// An entry about to be appended.
#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub actor: Option<UserId>,
    pub action: AuditAction,
    pub resource_type: &'static str,
    pub resource_id: String,
    pub timestamp: DateTime<Utc>,
    pub details: serde_json::Value,
    pub success: bool,
    pub error_message: Option<String>,
}

impl NewAuditEntry {
    pub fn new(action: AuditAction, resource_type: &'static str, resource_id: impl ToString) -> Self {
        Self {
            actor: None,
            action,
            resource_type,
            resource_id: resource_id.to_string(),
            timestamp: Utc::now(),
            details: serde_json::json!({}),
            success: true,
            error_message: None,
        }
    }

    pub fn actor(mut self, actor: Option<&UserId>) -> Self {
        self.actor = actor.cloned();
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error_message = Some(error.into());
        self
    }
}

/// Read-side filter. All fields are optional and combined with AND.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub actor: Option<UserId>,
    pub action: Option<AuditAction>,
    pub resource_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl AuditFilter {
    pub const DEFAULT_LIMIT: usize = 100;

    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(Self::DEFAULT_LIMIT).clamp(1, 1000)
    }

    pub fn matches(&self, entry: &AuditEntry) -> bool {
        self.actor.as_ref().map_or(true, |a| entry.actor.as_ref() == Some(a))
            && self.action.map_or(true, |a| entry.action == a)
            && self
                .resource_id
                .as_ref()
                .map_or(true, |r| &entry.resource_id == r)
            && self.since.map_or(true, |t| entry.timestamp >= t)
            && self.until.map_or(true, |t| entry.timestamp <= t)
    }
}

#[derive(Clone)]
pub struct AuditLog {
    store: Arc<dyn MarketStore>,
}

impl AuditLog {
    pub fn new(store: Arc<dyn MarketStore>) -> Self {
        Self { store }
    }

    /// Append an entry, surfacing any write failure to the caller.
    pub async fn record(&self, entry: NewAuditEntry) -> Result<AuditEntry, StoreError> {
        let action = entry.action;
        let resource_id = entry.resource_id.clone();
        self.store.append_audit(&entry).await.map_err(|e| {
            tracing::error!(
                action = %action,
                resource_id = %resource_id,
                error = %e,
                "Failed to write audit entry"
            );
            e
        })
    }

    /// Append an entry for a non-financial action. A failed write is logged
    /// at error level; the enclosing operation proceeds.
    pub async fn record_or_log(&self, entry: NewAuditEntry) {
        debug_assert!(!entry.action.is_financial());
        let _ = self.record(entry).await;
    }

    /// Newest entries first.
    pub async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, StoreError> {
        self.store.query_audit(filter).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    #[test]
    fn test_action_names_round_trip() {
        for action in [
            AuditAction::TaskClaim,
            AuditAction::PaymentInitiated,
            AuditAction::WalletConnected,
            AuditAction::PaymentRefund,
        ] {
            assert_eq!(action.as_str().parse::<AuditAction>().unwrap(), action);
            assert_eq!(
                serde_json::to_value(action).unwrap(),
                serde_json::Value::String(action.as_str().to_string())
            );
        }
        assert!("task.explode".parse::<AuditAction>().is_err());
    }

    #[test]
    fn test_financial_classification() {
        assert!(AuditAction::TaskApprove.is_financial());
        assert!(AuditAction::TaskReject.is_financial());
        assert!(AuditAction::PaymentFailed.is_financial());
        assert!(!AuditAction::TaskClaim.is_financial());
        assert!(!AuditAction::WalletConnected.is_financial());
    }

    #[tokio::test]
    async fn test_query_filters_and_orders_newest_first() {
        let log = AuditLog::new(Arc::new(InMemoryStore::new()));
        let alice = UserId::from("alice");
        let bob = UserId::from("bob");

        log.record(NewAuditEntry::new(AuditAction::TaskClaim, "task", "t1").actor(Some(&alice)))
            .await
            .unwrap();
        log.record(NewAuditEntry::new(AuditAction::TaskSubmit, "assignment", "a1").actor(Some(&alice)))
            .await
            .unwrap();
        log.record(
            NewAuditEntry::new(AuditAction::PaymentFailed, "payment", "p1")
                .actor(Some(&bob))
                .failed("gateway down"),
        )
        .await
        .unwrap();

        let all = log.query(&AuditFilter::default()).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].action, AuditAction::PaymentFailed);
        assert!(!all[0].success);

        let alices = log
            .query(&AuditFilter {
                actor: Some(alice.clone()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(alices.len(), 2);

        let claims = log
            .query(&AuditFilter {
                action: Some(AuditAction::TaskClaim),
                resource_id: Some("t1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(claims.len(), 1);

        let future = log
            .query(&AuditFilter {
                since: Some(Utc::now() + chrono::Duration::hours(1)),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(future.is_empty());
    }
}
