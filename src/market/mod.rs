//! Marketplace engine.
//!
//! [`Marketplace`] is the single entry point the HTTP layer talks to. Every
//! operation takes the authenticated [`Caller`] explicitly and performs its
//! own authorization before touching the store.
//!
//! - `catalog`: labeling-tool connections, project import/sync, budgets,
//!   publishing and payout wallets
//! - `assignments`: the claim → submit → approve/reject lifecycle and the
//!   settlement follow-ups (retry, reconcile, refund)
//! - `reconciler`: background loop resolving unconfirmed settlements

mod assignments;
mod catalog;
mod reconciler;

#[cfg(test)]
mod tests;

pub use assignments::{Approval, ApprovalOutcome, AssignmentQuery, ReconcileReport};
pub use catalog::{ImportOutcome, SyncOutcome};
pub use reconciler::spawn_reconciler;

use std::sync::Arc;

use crate::audit::{AuditEntry, AuditFilter, AuditLog};
use crate::error::MarketError;
use crate::identity::Caller;
use crate::model::{Assignment, AssignmentId, Project, ProjectId, Task, TaskId};
use crate::money::Usdc;
use crate::settlement::{SettlementPolicy, SettlementProcessor, TransferClient};
use crate::source::SourceConnector;
use crate::store::{AssignmentStore, MarketStore, ProjectStore, TaskStore};

/// Tunables that are not part of the settlement policy.
#[derive(Debug, Clone)]
pub struct MarketSettings {
    pub settlement: SettlementPolicy,
    /// Price used when a project has no budget to divide
    pub default_task_price: Usdc,
}

impl Default for MarketSettings {
    fn default() -> Self {
        Self {
            settlement: SettlementPolicy::default(),
            default_task_price: Usdc::from_whole(5),
        }
    }
}

pub struct Marketplace {
    store: Arc<dyn MarketStore>,
    audit: AuditLog,
    settlements: SettlementProcessor,
    sources: Arc<dyn SourceConnector>,
    default_task_price: Usdc,
}

impl Marketplace {
    pub fn new(
        store: Arc<dyn MarketStore>,
        transfers: Arc<dyn TransferClient>,
        sources: Arc<dyn SourceConnector>,
        settings: MarketSettings,
    ) -> Self {
        let audit = AuditLog::new(store.clone());
        let settlements =
            SettlementProcessor::new(store.clone(), audit.clone(), transfers, settings.settlement);
        Self {
            store,
            audit,
            settlements,
            sources,
            default_task_price: settings.default_task_price,
        }
    }

    pub fn store(&self) -> &Arc<dyn MarketStore> {
        &self.store
    }

    pub fn settlements(&self) -> &SettlementProcessor {
        &self.settlements
    }

    /// Audit entries visible to the caller, newest first.
    ///
    /// Researchers can read the whole trail; annotators only their own
    /// actions.
    pub async fn audit_entries(
        &self,
        caller: &Caller,
        mut filter: AuditFilter,
    ) -> Result<Vec<AuditEntry>, MarketError> {
        if !caller.is_researcher() {
            filter.actor = Some(caller.user_id.clone());
        }
        Ok(self.audit.query(&filter).await?)
    }

    async fn load_project(&self, id: ProjectId) -> Result<Project, MarketError> {
        self.store
            .get_project(id)
            .await?
            .ok_or_else(|| MarketError::NotFound(format!("project {}", id)))
    }

    async fn load_task(&self, id: TaskId) -> Result<Task, MarketError> {
        self.store
            .get_task(id)
            .await?
            .ok_or_else(|| MarketError::NotFound(format!("task {}", id)))
    }

    async fn load_assignment(&self, id: AssignmentId) -> Result<Assignment, MarketError> {
        self.store
            .get_assignment(id)
            .await?
            .ok_or_else(|| MarketError::NotFound(format!("assignment {}", id)))
    }

    /// Load a project and check that the caller owns it.
    async fn owned_project(&self, caller: &Caller, id: ProjectId) -> Result<Project, MarketError> {
        let project = self.load_project(id).await?;
        if project.owner != caller.user_id {
            return Err(MarketError::forbidden("Only the project owner can do this"));
        }
        Ok(project)
    }
}
