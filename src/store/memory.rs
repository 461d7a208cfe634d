//! In-memory store (non-persistent).
//!
//! All state sits behind one lock, so every trait call is atomic with respect
//! to every other.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{
    AssignmentFilter, AssignmentStore, AuditStore, DirectoryStore, MarketStore, ProjectStore,
    SettlementStore, StoreError, TaskStore,
};
use crate::audit::{AuditEntry, AuditFilter, NewAuditEntry};
use crate::identity::UserId;
use crate::model::{
    Assignment, AssignmentChange, AssignmentId, AssignmentStatus, Project, ProjectId,
    SettlementStatus, SettlementTransaction, SettlementUpdate, Task, TaskId, TaskStatus,
    TransactionId, WalletRecord,
};
use crate::money::Usdc;
use crate::source::SourceConnection;

#[derive(Default)]
struct MemoryState {
    projects: HashMap<ProjectId, Project>,
    tasks: HashMap<TaskId, Task>,
    /// Insertion order of tasks
    task_order: Vec<TaskId>,
    assignments: HashMap<AssignmentId, Assignment>,
    settlements: HashMap<TransactionId, SettlementTransaction>,
    settlement_by_assignment: HashMap<AssignmentId, TransactionId>,
    audit: Vec<AuditEntry>,
    wallets: HashMap<UserId, WalletRecord>,
    connections: HashMap<UserId, SourceConnection>,
    /// Audit appends fail once the log holds this many entries
    #[cfg(test)]
    audit_limit: Option<usize>,
}

impl MemoryState {
    fn task_mut(&mut self, id: TaskId) -> Result<&mut Task, StoreError> {
        self.tasks
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("task", id))
    }

    fn has_active_assignment(&self, task: TaskId) -> bool {
        self.assignments
            .values()
            .any(|a| a.task_id == task && !a.status.is_terminal())
    }

    fn has_any_assignment(&self, task: TaskId) -> bool {
        self.assignments.values().any(|a| a.task_id == task)
    }

    /// Add tasks, skipping source ids the project already has.
    fn add_tasks(&mut self, tasks: &[Task]) -> Result<Vec<Task>, StoreError> {
        if let Some(task) = tasks.iter().find(|t| !self.projects.contains_key(&t.project_id)) {
            return Err(StoreError::not_found("project", task.project_id));
        }
        let mut inserted = Vec::new();
        for task in tasks {
            let exists = self.tasks.values().any(|t| {
                t.project_id == task.project_id && t.source_task_id == task.source_task_id
            });
            if exists {
                continue;
            }
            self.task_order.push(task.id);
            self.tasks.insert(task.id, task.clone());
            inserted.push(task.clone());
        }
        Ok(inserted)
    }

    #[cfg(test)]
    fn audit_full(&self) -> bool {
        self.audit_limit.is_some_and(|limit| self.audit.len() >= limit)
    }

    #[cfg(not(test))]
    fn audit_full(&self) -> bool {
        false
    }

    fn set_task_status(&mut self, id: TaskId, status: TaskStatus) -> Result<(), StoreError> {
        let task = self.task_mut(id)?;
        task.status = status;
        task.updated_at = Utc::now();
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make audit appends fail once `total` entries have been written.
    #[cfg(test)]
    pub(crate) async fn limit_audit_writes(&self, total: usize) {
        self.state.write().await.audit_limit = Some(total);
    }
}

impl MarketStore for InMemoryStore {
    fn is_persistent(&self) -> bool {
        false
    }
}

#[async_trait]
impl ProjectStore for InMemoryStore {
    async fn insert_project(&self, project: &Project, tasks: &[Task]) -> Result<Vec<Task>, StoreError> {
        let mut state = self.state.write().await;
        if let Some(task) = tasks.iter().find(|t| t.project_id != project.id) {
            return Err(StoreError::Backend(format!(
                "task {} belongs to another project",
                task.id
            )));
        }
        if state.projects.values().any(|p| {
            p.owner == project.owner && p.source_project_id == project.source_project_id
        }) {
            return Err(StoreError::Duplicate(format!(
                "source project {} already imported",
                project.source_project_id
            )));
        }
        state.projects.insert(project.id, project.clone());
        state.add_tasks(tasks)
    }

    async fn get_project(&self, id: ProjectId) -> Result<Option<Project>, StoreError> {
        Ok(self.state.read().await.projects.get(&id).cloned())
    }

    async fn list_projects(
        &self,
        owner: Option<&UserId>,
        published_only: bool,
    ) -> Result<Vec<Project>, StoreError> {
        let state = self.state.read().await;
        let mut projects: Vec<Project> = state
            .projects
            .values()
            .filter(|p| owner.map_or(true, |o| &p.owner == o))
            .filter(|p| !published_only || p.published)
            .cloned()
            .collect();
        projects.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(projects)
    }

    async fn update_project(&self, project: &Project) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let stored = state
            .projects
            .get_mut(&project.id)
            .ok_or_else(|| StoreError::not_found("project", project.id))?;
        stored.title = project.title.clone();
        stored.description = project.description.clone();
        stored.budget = project.budget;
        stored.price_per_task = project.price_per_task;
        stored.published = project.published;
        stored.updated_at = project.updated_at;
        Ok(())
    }
}

#[async_trait]
impl TaskStore for InMemoryStore {
    async fn insert_tasks(&self, tasks: &[Task]) -> Result<Vec<Task>, StoreError> {
        self.state.write().await.add_tasks(tasks)
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        Ok(self.state.read().await.tasks.get(&id).cloned())
    }

    async fn list_available(&self, project: Option<ProjectId>) -> Result<Vec<Task>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .task_order
            .iter()
            .filter_map(|id| state.tasks.get(id))
            .filter(|t| t.status == TaskStatus::Available)
            .filter(|t| project.map_or(true, |p| t.project_id == p))
            .cloned()
            .collect())
    }

    async fn list_tasks(&self, project: ProjectId) -> Result<Vec<Task>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .task_order
            .iter()
            .filter_map(|id| state.tasks.get(id))
            .filter(|t| t.project_id == project)
            .cloned()
            .collect())
    }

    async fn count_tasks(&self, project: ProjectId) -> Result<u64, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .tasks
            .values()
            .filter(|t| t.project_id == project)
            .count() as u64)
    }

    async fn mark_claimed(&self, id: TaskId) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let task = state.task_mut(id)?;
        if task.status != TaskStatus::Available {
            return Err(StoreError::TaskUnavailable(id));
        }
        task.status = TaskStatus::Claimed;
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn release(&self, id: TaskId) -> Result<(), StoreError> {
        self.state
            .write()
            .await
            .set_task_status(id, TaskStatus::Available)
    }

    async fn reprice_available(&self, project: ProjectId, price: Usdc) -> Result<u64, StoreError> {
        let mut state = self.state.write().await;
        let now = Utc::now();
        let mut changed = 0;
        for task in state.tasks.values_mut() {
            if task.project_id == project && task.status == TaskStatus::Available {
                task.price = price;
                task.updated_at = now;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn remove_task(&self, id: TaskId) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let task = state
            .tasks
            .get(&id)
            .ok_or_else(|| StoreError::not_found("task", id))?;
        if task.status != TaskStatus::Available || state.has_any_assignment(id) {
            return Err(StoreError::TaskInUse(id));
        }
        state.tasks.remove(&id);
        state.task_order.retain(|t| *t != id);
        Ok(())
    }
}

#[async_trait]
impl AssignmentStore for InMemoryStore {
    async fn claim_task(&self, assignment: &Assignment) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let task_id = assignment.task_id;
        let task = state
            .tasks
            .get(&task_id)
            .ok_or_else(|| StoreError::not_found("task", task_id))?;
        if task.status != TaskStatus::Available || state.has_active_assignment(task_id) {
            return Err(StoreError::TaskUnavailable(task_id));
        }
        state.set_task_status(task_id, TaskStatus::Claimed)?;
        state.assignments.insert(assignment.id, assignment.clone());
        Ok(())
    }

    async fn get_assignment(&self, id: AssignmentId) -> Result<Option<Assignment>, StoreError> {
        Ok(self.state.read().await.assignments.get(&id).cloned())
    }

    async fn list_assignments(&self, filter: &AssignmentFilter) -> Result<Vec<Assignment>, StoreError> {
        let state = self.state.read().await;
        let mut assignments: Vec<Assignment> = state
            .assignments
            .values()
            .filter(|a| filter.annotator.as_ref().map_or(true, |u| &a.annotator == u))
            .filter(|a| filter.project_id.map_or(true, |p| a.project_id == p))
            .filter(|a| filter.task_id.map_or(true, |t| a.task_id == t))
            .filter(|a| {
                filter
                    .statuses
                    .as_ref()
                    .map_or(true, |s| s.contains(&a.status))
            })
            .filter(|a| {
                filter.project_owner.as_ref().map_or(true, |owner| {
                    state
                        .projects
                        .get(&a.project_id)
                        .is_some_and(|p| &p.owner == owner)
                })
            })
            .cloned()
            .collect();
        assignments.sort_by(|a, b| b.assigned_at.cmp(&a.assigned_at));
        Ok(assignments)
    }

    async fn transition_assignment(
        &self,
        id: AssignmentId,
        change: AssignmentChange,
    ) -> Result<Assignment, StoreError> {
        let mut state = self.state.write().await;
        let current = state
            .assignments
            .get(&id)
            .ok_or_else(|| StoreError::not_found("assignment", id))?
            .clone();
        if !change.allowed_from().contains(&current.status) {
            return Err(StoreError::AssignmentState {
                current: current.status,
            });
        }

        match &change {
            AssignmentChange::Approve { settlement_id, .. } => {
                let tx = state
                    .settlements
                    .get(settlement_id)
                    .filter(|tx| tx.assignment_id == id)
                    .ok_or_else(|| StoreError::not_found("settlement", settlement_id))?;
                if tx.status != SettlementStatus::Completed {
                    return Err(StoreError::SettlementState { current: tx.status });
                }
            }
            AssignmentChange::Reject { .. } => {
                let open = state
                    .settlement_by_assignment
                    .get(&id)
                    .and_then(|tx| state.settlements.get(tx))
                    .filter(|tx| tx.status != SettlementStatus::Failed);
                if let Some(existing) = open {
                    return Err(StoreError::SettlementExists(existing.id));
                }
            }
            _ => {}
        }

        let mut next = current;
        change.apply(&mut next, Utc::now());
        if matches!(change, AssignmentChange::Cancel | AssignmentChange::Reject { .. }) {
            state.set_task_status(next.task_id, TaskStatus::Available)?;
        }
        state.assignments.insert(id, next.clone());
        Ok(next)
    }
}

#[async_trait]
impl SettlementStore for InMemoryStore {
    async fn reserve_settlement(&self, tx: &SettlementTransaction) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let assignment = state
            .assignments
            .get(&tx.assignment_id)
            .ok_or_else(|| StoreError::not_found("assignment", tx.assignment_id))?;
        if assignment.status != AssignmentStatus::Submitted {
            return Err(StoreError::AssignmentState {
                current: assignment.status,
            });
        }
        if let Some(existing) = state.settlement_by_assignment.get(&tx.assignment_id) {
            return Err(StoreError::SettlementExists(*existing));
        }
        state.settlement_by_assignment.insert(tx.assignment_id, tx.id);
        state.settlements.insert(tx.id, tx.clone());
        Ok(())
    }

    async fn get_settlement(&self, id: TransactionId) -> Result<Option<SettlementTransaction>, StoreError> {
        Ok(self.state.read().await.settlements.get(&id).cloned())
    }

    async fn settlement_for_assignment(
        &self,
        assignment: AssignmentId,
    ) -> Result<Option<SettlementTransaction>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .settlement_by_assignment
            .get(&assignment)
            .and_then(|id| state.settlements.get(id))
            .cloned())
    }

    async fn list_settlements(
        &self,
        recipient: Option<&UserId>,
        status: Option<SettlementStatus>,
    ) -> Result<Vec<SettlementTransaction>, StoreError> {
        let state = self.state.read().await;
        let mut settlements: Vec<SettlementTransaction> = state
            .settlements
            .values()
            .filter(|tx| recipient.map_or(true, |r| &tx.recipient == r))
            .filter(|tx| status.map_or(true, |s| tx.status == s))
            .cloned()
            .collect();
        settlements.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(settlements)
    }

    async fn update_settlement(
        &self,
        id: TransactionId,
        from: &[SettlementStatus],
        update: SettlementUpdate,
    ) -> Result<SettlementTransaction, StoreError> {
        let mut state = self.state.write().await;
        let state = &mut *state;
        let tx = state
            .settlements
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("settlement", id))?;
        if !from.contains(&tx.status) {
            return Err(StoreError::SettlementState { current: tx.status });
        }
        if matches!(update, SettlementUpdate::Processing) {
            let assignment = state
                .assignments
                .get(&tx.assignment_id)
                .ok_or_else(|| StoreError::not_found("assignment", tx.assignment_id))?;
            if assignment.status != AssignmentStatus::Submitted {
                return Err(StoreError::AssignmentState {
                    current: assignment.status,
                });
            }
        }
        update.apply(tx, Utc::now());
        Ok(tx.clone())
    }

    async fn list_unconfirmed_settlements(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<SettlementTransaction>, StoreError> {
        let state = self.state.read().await;
        let mut settlements: Vec<SettlementTransaction> = state
            .settlements
            .values()
            .filter(|tx| tx.status.is_unconfirmed() && tx.updated_at <= older_than)
            .cloned()
            .collect();
        settlements.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        Ok(settlements)
    }
}

#[async_trait]
impl AuditStore for InMemoryStore {
    async fn append_audit(&self, entry: &NewAuditEntry) -> Result<AuditEntry, StoreError> {
        let mut state = self.state.write().await;
        if state.audit_full() {
            return Err(StoreError::Backend("audit log unavailable".to_string()));
        }
        let stored = AuditEntry {
            id: state.audit.len() as i64 + 1,
            actor: entry.actor.clone(),
            action: entry.action,
            resource_type: entry.resource_type.to_string(),
            resource_id: entry.resource_id.clone(),
            timestamp: entry.timestamp,
            details: entry.details.clone(),
            success: entry.success,
            error_message: entry.error_message.clone(),
        };
        state.audit.push(stored.clone());
        Ok(stored)
    }

    async fn query_audit(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .audit
            .iter()
            .rev()
            .filter(|e| filter.matches(e))
            .take(filter.limit())
            .cloned()
            .collect())
    }
}

#[async_trait]
impl DirectoryStore for InMemoryStore {
    async fn put_wallet(&self, record: &WalletRecord) -> Result<(), StoreError> {
        self.state
            .write()
            .await
            .wallets
            .insert(record.user_id.clone(), record.clone());
        Ok(())
    }

    async fn get_wallet(&self, user: &UserId) -> Result<Option<WalletRecord>, StoreError> {
        Ok(self.state.read().await.wallets.get(user).cloned())
    }

    async fn put_connection(&self, owner: &UserId, connection: &SourceConnection) -> Result<(), StoreError> {
        self.state
            .write()
            .await
            .connections
            .insert(owner.clone(), connection.clone());
        Ok(())
    }

    async fn get_connection(&self, owner: &UserId) -> Result<Option<SourceConnection>, StoreError> {
        Ok(self.state.read().await.connections.get(owner).cloned())
    }
}
