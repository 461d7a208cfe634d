//! Projects, tasks, labeling-tool connections and payout wallets.

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;

use super::Marketplace;
use crate::audit::{AuditAction, NewAuditEntry};
use crate::error::MarketError;
use crate::identity::{Caller, UserId};
use crate::model::{Assignment, Project, ProjectId, Task, TaskId, WalletRecord};
use crate::money::Usdc;
use crate::source::{AnnotationSource, SourceConnection, SourceCredential, SourceProject};
use crate::store::{DirectoryStore, ProjectStore, TaskStore};
use crate::wallet::WalletAddress;

#[derive(Debug, Clone, Serialize)]
pub struct ImportOutcome {
    pub project: Project,
    pub tasks_imported: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncOutcome {
    pub project: Project,
    pub tasks_added: usize,
    pub total_tasks: u64,
    /// Still-available tasks whose price changed
    pub repriced: u64,
}

impl Marketplace {
    /// Store the caller's labeling-tool connection after checking that it
    /// works.
    pub async fn save_connection(
        &self,
        caller: &Caller,
        base_url: &str,
        credential: SourceCredential,
    ) -> Result<SourceConnection, MarketError> {
        require_researcher(caller)?;
        let connection = SourceConnection::new(base_url, credential)?;
        let source = self.sources.connect(&connection)?;
        let projects = source.list_projects().await?;

        self.store.put_connection(&caller.user_id, &connection).await?;
        tracing::info!(
            owner = %caller.user_id,
            base_url = %connection.base_url,
            credential = connection.credential.kind(),
            "Labeling tool connected"
        );
        self.audit
            .record_or_log(
                NewAuditEntry::new(AuditAction::SourceConnected, "connection", &caller.user_id)
                    .actor(Some(&caller.user_id))
                    .details(json!({
                        "base_url": connection.base_url,
                        "credential": connection.credential.kind(),
                        "projects": projects.len(),
                    })),
            )
            .await;
        Ok(connection)
    }

    pub async fn list_source_projects(&self, caller: &Caller) -> Result<Vec<SourceProject>, MarketError> {
        require_researcher(caller)?;
        let source = self.source_for(&caller.user_id).await?;
        Ok(source.list_projects().await?)
    }

    /// Import a labeling-tool project with all of its tasks. The project
    /// starts unpublished.
    pub async fn import_project(
        &self,
        caller: &Caller,
        source_project_id: i64,
        budget: Option<Usdc>,
    ) -> Result<ImportOutcome, MarketError> {
        require_researcher(caller)?;
        let source = self.source_for(&caller.user_id).await?;
        let (remote, remote_tasks) = source.import_project(source_project_id).await?;

        let budget = budget.unwrap_or(Usdc::ZERO);
        let price = self.price_for(budget, remote_tasks.len() as u64)?;
        let now = Utc::now();
        let project = Project {
            id: ProjectId::new(),
            owner: caller.user_id.clone(),
            source_project_id: remote.id,
            title: remote.title,
            description: remote.description,
            budget,
            price_per_task: price,
            published: false,
            created_at: now,
            updated_at: now,
        };
        let tasks: Vec<Task> = remote_tasks
            .into_iter()
            .map(|t| Task::new(project.id, t.id, t.data, price))
            .collect();
        let inserted = self.store.insert_project(&project, &tasks).await?;

        tracing::info!(
            project_id = %project.id,
            source_project_id,
            tasks = inserted.len(),
            price_per_task = %price,
            "Project imported"
        );
        self.audit
            .record_or_log(
                NewAuditEntry::new(AuditAction::ProjectImport, "project", project.id)
                    .actor(Some(&caller.user_id))
                    .details(json!({
                        "source_project_id": source_project_id,
                        "tasks": inserted.len(),
                        "budget": budget,
                    })),
            )
            .await;
        Ok(ImportOutcome {
            project,
            tasks_imported: inserted.len(),
        })
    }

    /// Pull tasks added in the labeling tool since the last import and
    /// spread the budget over the new total.
    pub async fn sync_project(&self, caller: &Caller, id: ProjectId) -> Result<SyncOutcome, MarketError> {
        let mut project = self.owned_project(caller, id).await?;
        let source = self.source_for(&caller.user_id).await?;
        let remote_tasks = source.sync_tasks(project.source_project_id).await?;

        let tasks: Vec<Task> = remote_tasks
            .into_iter()
            .map(|t| Task::new(project.id, t.id, t.data, project.price_per_task))
            .collect();
        let added = self.store.insert_tasks(&tasks).await?;
        let total = self.store.count_tasks(id).await?;

        let mut repriced = 0;
        if project.budget.is_positive() {
            let price = self.price_for(project.budget, total)?;
            if price != project.price_per_task {
                project.price_per_task = price;
                project.updated_at = Utc::now();
                self.store.update_project(&project).await?;
            }
            repriced = self.store.reprice_available(id, price).await?;
        }

        tracing::info!(project_id = %id, added = added.len(), total, "Project synced");
        self.audit
            .record_or_log(
                NewAuditEntry::new(AuditAction::ProjectSync, "project", id)
                    .actor(Some(&caller.user_id))
                    .details(json!({ "added": added.len(), "total": total })),
            )
            .await;
        Ok(SyncOutcome {
            project,
            tasks_added: added.len(),
            total_tasks: total,
            repriced,
        })
    }

    /// Make a project's tasks claimable. Requires a budget.
    pub async fn publish(&self, caller: &Caller, id: ProjectId) -> Result<Project, MarketError> {
        let project = self.owned_project(caller, id).await?;
        if !project.budget.is_positive() {
            return Err(MarketError::validation("Set a budget before publishing the project"));
        }
        self.set_published(caller, project, true).await
    }

    pub async fn unpublish(&self, caller: &Caller, id: ProjectId) -> Result<Project, MarketError> {
        let project = self.owned_project(caller, id).await?;
        self.set_published(caller, project, false).await
    }

    async fn set_published(
        &self,
        caller: &Caller,
        mut project: Project,
        published: bool,
    ) -> Result<Project, MarketError> {
        if project.published == published {
            return Ok(project);
        }
        project.published = published;
        project.updated_at = Utc::now();
        self.store.update_project(&project).await?;

        let action = if published {
            AuditAction::ProjectPublish
        } else {
            AuditAction::ProjectUnpublish
        };
        tracing::info!(project_id = %project.id, published, "Project visibility changed");
        self.audit
            .record_or_log(NewAuditEntry::new(action, "project", project.id).actor(Some(&caller.user_id)))
            .await;
        Ok(project)
    }

    /// Set the total budget and reprice every task nobody has claimed yet.
    pub async fn set_budget(&self, caller: &Caller, id: ProjectId, budget: Usdc) -> Result<Project, MarketError> {
        let mut project = self.owned_project(caller, id).await?;
        if !budget.is_positive() {
            return Err(MarketError::validation("Budget must be greater than zero"));
        }
        let total = self.store.count_tasks(id).await?;
        let price = self.price_for(budget, total)?;

        let previous = project.budget;
        project.budget = budget;
        project.price_per_task = price;
        project.updated_at = Utc::now();
        self.store.update_project(&project).await?;
        let repriced = self.store.reprice_available(id, price).await?;

        tracing::info!(project_id = %id, budget = %budget, price_per_task = %price, repriced, "Budget updated");
        self.audit
            .record_or_log(
                NewAuditEntry::new(AuditAction::ProjectBudget, "project", id)
                    .actor(Some(&caller.user_id))
                    .details(json!({
                        "previous": previous,
                        "budget": budget,
                        "price_per_task": price,
                    })),
            )
            .await;
        Ok(project)
    }

    /// Remove a task nobody is working on.
    pub async fn remove_task(&self, caller: &Caller, task_id: TaskId) -> Result<(), MarketError> {
        let task = self.load_task(task_id).await?;
        self.owned_project(caller, task.project_id).await?;
        self.store.remove_task(task_id).await?;

        tracing::info!(task_id = %task_id, project_id = %task.project_id, "Task removed");
        self.audit
            .record_or_log(
                NewAuditEntry::new(AuditAction::TaskRemove, "task", task_id)
                    .actor(Some(&caller.user_id))
                    .details(json!({
                        "project_id": task.project_id,
                        "source_task_id": task.source_task_id,
                    })),
            )
            .await;
        Ok(())
    }

    /// Researchers see their own projects, annotators every published one.
    pub async fn list_projects(&self, caller: &Caller) -> Result<Vec<Project>, MarketError> {
        let projects = if caller.is_researcher() {
            self.store.list_projects(Some(&caller.user_id), false).await?
        } else {
            self.store.list_projects(None, true).await?
        };
        Ok(projects)
    }

    pub async fn get_project(&self, caller: &Caller, id: ProjectId) -> Result<Project, MarketError> {
        let project = self.load_project(id).await?;
        if !project.published && project.owner != caller.user_id {
            return Err(MarketError::NotFound(format!("project {}", id)));
        }
        Ok(project)
    }

    /// Every task of a project, claimed or not. Owner only.
    pub async fn list_project_tasks(&self, caller: &Caller, id: ProjectId) -> Result<Vec<Task>, MarketError> {
        self.owned_project(caller, id).await?;
        Ok(self.store.list_tasks(id).await?)
    }

    /// Claimable tasks, optionally limited to one project.
    pub async fn list_available_tasks(
        &self,
        caller: &Caller,
        project: Option<ProjectId>,
    ) -> Result<Vec<Task>, MarketError> {
        if let Some(id) = project {
            let project = self.get_project(caller, id).await?;
            if !project.published {
                return Ok(Vec::new());
            }
            return Ok(self.store.list_available(Some(id)).await?);
        }

        let published: HashSet<ProjectId> = self
            .store
            .list_projects(None, true)
            .await?
            .into_iter()
            .map(|p| p.id)
            .collect();
        Ok(self
            .store
            .list_available(None)
            .await?
            .into_iter()
            .filter(|t| published.contains(&t.project_id))
            .collect())
    }

    /// Validate and store the caller's payout address in checksummed form.
    pub async fn register_wallet(&self, caller: &Caller, address: &str) -> Result<WalletRecord, MarketError> {
        let address = WalletAddress::parse(address)?;
        let record = WalletRecord {
            user_id: caller.user_id.clone(),
            address,
            updated_at: Utc::now(),
        };
        self.store.put_wallet(&record).await?;

        tracing::info!(user = %caller.user_id, address = %record.address, "Wallet registered");
        self.audit
            .record_or_log(
                NewAuditEntry::new(AuditAction::WalletConnected, "wallet", &caller.user_id)
                    .actor(Some(&caller.user_id))
                    .details(json!({ "address": record.address })),
            )
            .await;
        Ok(record)
    }

    pub async fn wallet_for(&self, user: &UserId) -> Result<Option<WalletRecord>, MarketError> {
        Ok(self.store.get_wallet(user).await?)
    }

    /// Send an approved result back to the labeling tool in the background.
    /// Failures are logged and never affect the approval.
    pub(super) async fn push_annotation(&self, assignment: &Assignment) {
        let Some(result) = assignment.result.clone() else {
            return;
        };
        let target = async {
            let project = self.load_project(assignment.project_id).await?;
            let task = self.load_task(assignment.task_id).await?;
            let source = self.source_for(&project.owner).await?;
            Ok::<_, MarketError>((source, task.source_task_id))
        }
        .await;
        let (source, source_task_id) = match target {
            Ok(target) => target,
            Err(e) => {
                tracing::warn!(assignment_id = %assignment.id, error = %e, "Skipping annotation push");
                return;
            }
        };

        let assignment_id = assignment.id;
        let annotator = assignment.annotator.clone();
        tokio::spawn(async move {
            match source
                .push_annotation(source_task_id, &result, Some(annotator.as_str()))
                .await
            {
                Ok(()) => tracing::debug!(%assignment_id, source_task_id, "Annotation pushed"),
                Err(e) => tracing::warn!(%assignment_id, source_task_id, error = %e, "Annotation push failed"),
            }
        });
    }

    async fn source_for(&self, owner: &UserId) -> Result<Arc<dyn AnnotationSource>, MarketError> {
        let connection = self
            .store
            .get_connection(owner)
            .await?
            .ok_or_else(|| MarketError::validation("Connect a labeling tool first"))?;
        Ok(self.sources.connect(&connection)?)
    }

    /// Per-task price for a budget spread over `tasks`.
    fn price_for(&self, budget: Usdc, tasks: u64) -> Result<Usdc, MarketError> {
        if budget.is_zero() || tasks == 0 {
            return Ok(self.default_task_price);
        }
        let price = budget.split(tasks);
        if !price.is_positive() {
            return Err(MarketError::validation(format!(
                "A budget of {} USDC is too small for {} tasks",
                budget, tasks
            )));
        }
        Ok(price)
    }
}

fn require_researcher(caller: &Caller) -> Result<(), MarketError> {
    if caller.is_researcher() {
        Ok(())
    } else {
        Err(MarketError::forbidden("Only researchers can manage projects"))
    }
}
