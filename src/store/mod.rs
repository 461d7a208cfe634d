//! Marketplace storage with pluggable backends.
//!
//! Supports:
//! - `memory`: In-memory storage (non-persistent, for testing)
//! - `sqlite`: SQLite database (default)
//!
//! Every operation that has to be atomic (claiming a task, moving an
//! assignment, reserving a settlement) is a single store call, so both
//! backends can enforce it under one lock or one transaction.

mod memory;
mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;

use crate::audit::{AuditEntry, AuditFilter, NewAuditEntry};
use crate::identity::UserId;
use crate::model::{
    Assignment, AssignmentChange, AssignmentId, AssignmentStatus, Project, ProjectId,
    SettlementStatus, SettlementTransaction, SettlementUpdate, Task, TaskId, TransactionId,
    WalletRecord,
};
use crate::money::Usdc;
use crate::source::SourceConnection;

/// Typed storage failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("task {0} is no longer available")]
    TaskUnavailable(TaskId),

    #[error("task {0} has assignments and cannot be removed")]
    TaskInUse(TaskId),

    #[error("assignment is {current}")]
    AssignmentState { current: AssignmentStatus },

    #[error("settlement is {current}")]
    SettlementState { current: SettlementStatus },

    #[error("settlement {0} already exists for this assignment")]
    SettlementExists(TransactionId),

    #[error("duplicate record: {0}")]
    Duplicate(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

/// Selection for [`AssignmentStore::list_assignments`].
#[derive(Debug, Clone, Default)]
pub struct AssignmentFilter {
    pub annotator: Option<UserId>,
    /// Only assignments on projects owned by this researcher
    pub project_owner: Option<UserId>,
    pub project_id: Option<ProjectId>,
    pub task_id: Option<TaskId>,
    /// `None` means any status
    pub statuses: Option<Vec<AssignmentStatus>>,
}

#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Insert a new project together with its initial tasks in one atomic
    /// step. `Duplicate` if the owner already imported the same source
    /// project; nothing is written on any error. Returns the inserted tasks.
    async fn insert_project(&self, project: &Project, tasks: &[Task]) -> Result<Vec<Task>, StoreError>;

    async fn get_project(&self, id: ProjectId) -> Result<Option<Project>, StoreError>;

    /// Newest first.
    async fn list_projects(
        &self,
        owner: Option<&UserId>,
        published_only: bool,
    ) -> Result<Vec<Project>, StoreError>;

    /// Replace the mutable fields (title, description, budget, price, published).
    async fn update_project(&self, project: &Project) -> Result<(), StoreError>;
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert tasks, skipping any whose source id already exists in the
    /// project. Returns the tasks that were actually inserted.
    async fn insert_tasks(&self, tasks: &[Task]) -> Result<Vec<Task>, StoreError>;

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>, StoreError>;

    /// Available tasks in insertion order.
    async fn list_available(&self, project: Option<ProjectId>) -> Result<Vec<Task>, StoreError>;

    /// All tasks of a project in insertion order.
    async fn list_tasks(&self, project: ProjectId) -> Result<Vec<Task>, StoreError>;

    async fn count_tasks(&self, project: ProjectId) -> Result<u64, StoreError>;

    /// `available -> claimed` as one conditional update.
    async fn mark_claimed(&self, id: TaskId) -> Result<(), StoreError>;

    async fn release(&self, id: TaskId) -> Result<(), StoreError>;

    /// Set the price of every still-available task of a project.
    async fn reprice_available(&self, project: ProjectId, price: Usdc) -> Result<u64, StoreError>;

    /// Delete a task that was never claimed. Any task an assignment refers
    /// to, whatever that assignment's state, is `TaskInUse`.
    async fn remove_task(&self, id: TaskId) -> Result<(), StoreError>;
}

#[async_trait]
pub trait AssignmentStore: Send + Sync {
    /// Mark the assignment's task claimed and insert the assignment in one
    /// atomic step. A lost race inserts nothing and yields `TaskUnavailable`.
    async fn claim_task(&self, assignment: &Assignment) -> Result<(), StoreError>;

    async fn get_assignment(&self, id: AssignmentId) -> Result<Option<Assignment>, StoreError>;

    /// Newest first.
    async fn list_assignments(&self, filter: &AssignmentFilter) -> Result<Vec<Assignment>, StoreError>;

    /// Apply `change` if the assignment is still in one of
    /// [`AssignmentChange::allowed_from`]. Side effects land in the same
    /// atomic step:
    /// - `Cancel` and `Reject` put the task back to `available`;
    /// - `Reject` is refused with `SettlementExists` while the assignment has
    ///   a settlement that is not `failed`;
    /// - `Approve` requires the referenced settlement to be `completed`.
    async fn transition_assignment(
        &self,
        id: AssignmentId,
        change: AssignmentChange,
    ) -> Result<Assignment, StoreError>;
}

#[async_trait]
pub trait SettlementStore: Send + Sync {
    /// Insert a `pending` record, only if the assignment is still `submitted`
    /// and has no settlement yet.
    async fn reserve_settlement(&self, tx: &SettlementTransaction) -> Result<(), StoreError>;

    async fn get_settlement(&self, id: TransactionId) -> Result<Option<SettlementTransaction>, StoreError>;

    async fn settlement_for_assignment(
        &self,
        assignment: AssignmentId,
    ) -> Result<Option<SettlementTransaction>, StoreError>;

    /// Newest first.
    async fn list_settlements(
        &self,
        recipient: Option<&UserId>,
        status: Option<SettlementStatus>,
    ) -> Result<Vec<SettlementTransaction>, StoreError>;

    /// Apply `update` if the record is still in one of `from`.
    /// `Processing` additionally requires the paid assignment to still be
    /// `submitted`, so a rejected assignment's settlement is never retried.
    async fn update_settlement(
        &self,
        id: TransactionId,
        from: &[SettlementStatus],
        update: SettlementUpdate,
    ) -> Result<SettlementTransaction, StoreError>;

    /// Pending or processing records last touched at or before `older_than`.
    async fn list_unconfirmed_settlements(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<SettlementTransaction>, StoreError>;
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append_audit(&self, entry: &NewAuditEntry) -> Result<AuditEntry, StoreError>;

    /// Newest first, capped at `filter.limit()`.
    async fn query_audit(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, StoreError>;
}

/// Per-user records: payout wallets and labeling-tool connections.
#[async_trait]
pub trait DirectoryStore: Send + Sync {
    async fn put_wallet(&self, record: &WalletRecord) -> Result<(), StoreError>;

    async fn get_wallet(&self, user: &UserId) -> Result<Option<WalletRecord>, StoreError>;

    async fn put_connection(&self, owner: &UserId, connection: &SourceConnection) -> Result<(), StoreError>;

    async fn get_connection(&self, owner: &UserId) -> Result<Option<SourceConnection>, StoreError>;
}

/// Everything the marketplace needs from storage.
pub trait MarketStore:
    ProjectStore + TaskStore + AssignmentStore + SettlementStore + AuditStore + DirectoryStore
{
    /// Whether this store persists data across restarts.
    fn is_persistent(&self) -> bool;
}

/// Store type selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreType {
    Memory,
    #[default]
    Sqlite,
}

impl StoreType {
    /// Parse from environment variable value.
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "memory" => Self::Memory,
            "sqlite" | "db" => Self::Sqlite,
            _ => Self::default(),
        }
    }
}

/// Create a store based on type and data directory.
pub async fn create_store(
    store_type: StoreType,
    data_dir: PathBuf,
) -> Result<Arc<dyn MarketStore>, StoreError> {
    match store_type {
        StoreType::Memory => Ok(Arc::new(InMemoryStore::new())),
        StoreType::Sqlite => {
            let store = SqliteStore::new(data_dir).await?;
            Ok(Arc::new(store))
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    //! Behaviour every backend must share; run against both stores.

    use super::*;
    use crate::model::{TaskStatus, TransactionId};
    use crate::wallet::WalletAddress;
    use serde_json::json;

    pub fn sample_project(owner: &str) -> Project {
        let now = Utc::now();
        Project {
            id: ProjectId::new(),
            owner: UserId::from(owner),
            source_project_id: 7,
            title: "Bird species".to_string(),
            description: String::new(),
            budget: Usdc::from_whole(100),
            price_per_task: Usdc::from_whole(5),
            published: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn sample_settlement(assignment: &Assignment) -> SettlementTransaction {
        let now = Utc::now();
        SettlementTransaction {
            id: TransactionId::new(),
            assignment_id: assignment.id,
            recipient: assignment.annotator.clone(),
            to_address: WalletAddress::parse("0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed").unwrap(),
            amount: Usdc::from_whole(5),
            platform_fee: "0.5".parse().unwrap(),
            network: "base-sepolia".to_string(),
            status: SettlementStatus::Pending,
            transaction_hash: None,
            from_address: None,
            retry_count: 0,
            error_detail: None,
            metadata: json!({}),
            created_at: now,
            processed_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    async fn seed(store: &dyn MarketStore, count: i64) -> (Project, Vec<Task>) {
        let project = sample_project("researcher-r");
        let tasks: Vec<Task> = (0..count)
            .map(|i| Task::new(project.id, i, json!({"image": format!("img-{}.png", i)}), project.price_per_task))
            .collect();
        let inserted = store.insert_project(&project, &tasks).await.unwrap();
        (project, inserted)
    }

    async fn submitted(store: &dyn MarketStore, task: &Task) -> Assignment {
        let assignment = Assignment::new(task, UserId::from("annotator-a"));
        store.claim_task(&assignment).await.unwrap();
        store
            .transition_assignment(
                assignment.id,
                AssignmentChange::Submit {
                    result: json!({"label": "heron"}),
                },
            )
            .await
            .unwrap()
    }

    pub async fn check_task_listing_and_claim(store: &dyn MarketStore) {
        let (project, tasks) = seed(store, 3).await;
        assert_eq!(tasks.len(), 3);
        assert_eq!(store.list_tasks(project.id).await.unwrap().len(), 3);

        // Re-inserting the same source ids is a no-op
        let again = store.insert_tasks(&tasks).await.unwrap();
        assert!(again.is_empty());
        assert_eq!(store.count_tasks(project.id).await.unwrap(), 3);

        let listed = store.list_available(Some(project.id)).await.unwrap();
        let ids: Vec<TaskId> = listed.iter().map(|t| t.id).collect();
        assert_eq!(ids, tasks.iter().map(|t| t.id).collect::<Vec<_>>());

        store.mark_claimed(tasks[1].id).await.unwrap();
        assert!(matches!(
            store.mark_claimed(tasks[1].id).await,
            Err(StoreError::TaskUnavailable(_))
        ));
        assert!(matches!(
            store.mark_claimed(TaskId::new()).await,
            Err(StoreError::NotFound { .. })
        ));
        assert_eq!(store.list_available(None).await.unwrap().len(), 2);

        store.release(tasks[1].id).await.unwrap();
        let listed = store.list_available(Some(project.id)).await.unwrap();
        assert_eq!(listed[1].id, tasks[1].id, "release keeps insertion order");

        let repriced = store
            .reprice_available(project.id, "2.5".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(repriced, 3);
        let task = store.get_task(tasks[0].id).await.unwrap().unwrap();
        assert_eq!(task.price, "2.5".parse().unwrap());
    }

    pub async fn check_claim_is_exclusive(store: &dyn MarketStore) {
        let (_, tasks) = seed(store, 1).await;
        let task = &tasks[0];

        let first = Assignment::new(task, UserId::from("annotator-a"));
        let second = Assignment::new(task, UserId::from("annotator-b"));
        store.claim_task(&first).await.unwrap();
        assert!(matches!(
            store.claim_task(&second).await,
            Err(StoreError::TaskUnavailable(_))
        ));
        assert!(store.get_assignment(second.id).await.unwrap().is_none());
        assert_eq!(
            store.get_task(task.id).await.unwrap().unwrap().status,
            TaskStatus::Claimed
        );

        // Cancel releases the task in the same step
        let cancelled = store
            .transition_assignment(first.id, AssignmentChange::Cancel)
            .await
            .unwrap();
        assert_eq!(cancelled.status, AssignmentStatus::Cancelled);
        assert!(cancelled.cancelled_at.is_some());
        assert_eq!(
            store.get_task(task.id).await.unwrap().unwrap().status,
            TaskStatus::Available
        );
        store.claim_task(&second).await.unwrap();
        assert!(matches!(
            store.remove_task(task.id).await,
            Err(StoreError::TaskInUse(_))
        ));
    }

    pub async fn check_transitions_are_conditional(store: &dyn MarketStore) {
        let (_, tasks) = seed(store, 1).await;
        let assignment = Assignment::new(&tasks[0], UserId::from("annotator-a"));
        store.claim_task(&assignment).await.unwrap();

        let started = store
            .transition_assignment(assignment.id, AssignmentChange::Start)
            .await
            .unwrap();
        assert_eq!(started.status, AssignmentStatus::InProgress);
        assert!(matches!(
            store
                .transition_assignment(assignment.id, AssignmentChange::Accept)
                .await,
            Err(StoreError::AssignmentState {
                current: AssignmentStatus::InProgress
            })
        ));
        assert!(matches!(
            store
                .transition_assignment(AssignmentId::new(), AssignmentChange::Start)
                .await,
            Err(StoreError::NotFound { .. })
        ));

        let done = store
            .transition_assignment(
                assignment.id,
                AssignmentChange::Submit {
                    result: json!({"label": "gull"}),
                },
            )
            .await
            .unwrap();
        assert_eq!(done.result, Some(json!({"label": "gull"})));
        assert!(matches!(
            store
                .transition_assignment(assignment.id, AssignmentChange::Cancel)
                .await,
            Err(StoreError::AssignmentState {
                current: AssignmentStatus::Submitted
            })
        ));

        let by_annotator = store
            .list_assignments(&AssignmentFilter {
                annotator: Some(UserId::from("annotator-a")),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_annotator.len(), 1);
        let by_owner = store
            .list_assignments(&AssignmentFilter {
                project_owner: Some(UserId::from("someone-else")),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(by_owner.is_empty());
    }

    pub async fn check_settlement_guards(store: &dyn MarketStore) {
        let (_, tasks) = seed(store, 2).await;

        // Reserving needs a submitted assignment
        let open = Assignment::new(&tasks[1], UserId::from("annotator-a"));
        store.claim_task(&open).await.unwrap();
        assert!(matches!(
            store.reserve_settlement(&sample_settlement(&open)).await,
            Err(StoreError::AssignmentState {
                current: AssignmentStatus::Assigned
            })
        ));

        let assignment = submitted(store, &tasks[0]).await;
        let tx = sample_settlement(&assignment);
        store.reserve_settlement(&tx).await.unwrap();
        assert!(matches!(
            store.reserve_settlement(&sample_settlement(&assignment)).await,
            Err(StoreError::SettlementExists(id)) if id == tx.id
        ));

        // Reject is refused once money may be moving
        assert!(matches!(
            store
                .transition_assignment(assignment.id, AssignmentChange::Reject { reason: None })
                .await,
            Err(StoreError::SettlementExists(_))
        ));

        // Approve needs a completed settlement
        let approve = AssignmentChange::Approve {
            settlement_id: tx.id,
            quality_score: Some(9.0),
            feedback: None,
        };
        assert!(matches!(
            store.transition_assignment(assignment.id, approve.clone()).await,
            Err(StoreError::SettlementState {
                current: SettlementStatus::Pending
            })
        ));

        let failed = store
            .update_settlement(
                tx.id,
                &[SettlementStatus::Pending],
                SettlementUpdate::Failed {
                    detail: "insufficient funds".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(failed.retry_count, 1);
        assert!(matches!(
            store
                .update_settlement(tx.id, &[SettlementStatus::Pending], SettlementUpdate::Processing)
                .await,
            Err(StoreError::SettlementState {
                current: SettlementStatus::Failed
            })
        ));
        store
            .update_settlement(tx.id, &[SettlementStatus::Failed], SettlementUpdate::Processing)
            .await
            .unwrap();
        let unconfirmed = store.list_unconfirmed_settlements(Utc::now()).await.unwrap();
        assert_eq!(unconfirmed.len(), 1);

        store
            .update_settlement(
                tx.id,
                &[SettlementStatus::Processing],
                SettlementUpdate::Completed {
                    transaction_hash: "0xfeed".to_string(),
                    from_address: None,
                },
            )
            .await
            .unwrap();
        let approved = store
            .transition_assignment(assignment.id, approve)
            .await
            .unwrap();
        assert_eq!(approved.status, AssignmentStatus::Approved);
        assert_eq!(approved.settlement_id, Some(tx.id));
        assert_eq!(approved.quality_score, Some(9.0));

        let stored = store.settlement_for_assignment(assignment.id).await.unwrap().unwrap();
        assert_eq!(stored.transaction_hash.as_deref(), Some("0xfeed"));
        assert_eq!(
            store
                .list_settlements(Some(&assignment.annotator), Some(SettlementStatus::Completed))
                .await
                .unwrap()
                .len(),
            1
        );
    }

    pub async fn check_reject_relists(store: &dyn MarketStore) {
        let (_, tasks) = seed(store, 1).await;
        let assignment = submitted(store, &tasks[0]).await;
        let rejected = store
            .transition_assignment(
                assignment.id,
                AssignmentChange::Reject {
                    reason: Some("wrong species".to_string()),
                },
            )
            .await
            .unwrap();
        assert_eq!(rejected.status, AssignmentStatus::Rejected);
        assert_eq!(rejected.feedback.as_deref(), Some("wrong species"));
        assert!(store.settlement_for_assignment(assignment.id).await.unwrap().is_none());
        assert_eq!(
            store.get_task(tasks[0].id).await.unwrap().unwrap().status,
            TaskStatus::Available
        );
    }

    pub async fn check_directory(store: &dyn MarketStore) {
        let user = UserId::from("annotator-a");
        assert!(store.get_wallet(&user).await.unwrap().is_none());
        let record = WalletRecord {
            user_id: user.clone(),
            address: WalletAddress::parse("0xfb6916095ca1df60bb79ce92ce3ea74c37c5d359").unwrap(),
            updated_at: Utc::now(),
        };
        store.put_wallet(&record).await.unwrap();
        let loaded = store.get_wallet(&user).await.unwrap().unwrap();
        assert_eq!(loaded.address.as_str(), "0xfB6916095ca1df60bB79Ce92cE3Ea74c37c5d359");

        let project = sample_project("researcher-r");
        store.insert_project(&project, &[]).await.unwrap();
        let mut dup = sample_project("researcher-r");
        dup.source_project_id = project.source_project_id;
        let dup_task = Task::new(dup.id, 1, json!({}), dup.price_per_task);
        assert!(matches!(
            store.insert_project(&dup, std::slice::from_ref(&dup_task)).await,
            Err(StoreError::Duplicate(_))
        ));
        assert!(store.get_task(dup_task.id).await.unwrap().is_none());

        let mut updated = project.clone();
        updated.published = false;
        updated.budget = Usdc::from_whole(40);
        store.update_project(&updated).await.unwrap();
        assert!(store.list_projects(None, true).await.unwrap().is_empty());
        let owned = store
            .list_projects(Some(&UserId::from("researcher-r")), false)
            .await
            .unwrap();
        assert_eq!(owned[0].budget, Usdc::from_whole(40));
    }

    /// A failed import writes neither the project nor any of its tasks.
    pub async fn check_project_import_is_atomic(store: &dyn MarketStore) {
        let project = sample_project("researcher-r");
        let stray = Task::new(ProjectId::new(), 2, json!({}), project.price_per_task);
        let tasks = vec![
            Task::new(project.id, 1, json!({}), project.price_per_task),
            stray,
        ];
        assert!(store.insert_project(&project, &tasks).await.is_err());
        assert!(store.get_project(project.id).await.unwrap().is_none());
        assert!(store.get_task(tasks[0].id).await.unwrap().is_none());

        // The same source project can then be imported cleanly
        let inserted = store.insert_project(&project, &tasks[..1]).await.unwrap();
        assert_eq!(inserted.len(), 1);
    }

    /// Only never-claimed tasks can be deleted; assignments keep their task.
    pub async fn check_remove_task_keeps_history(store: &dyn MarketStore) {
        let (project, tasks) = seed(store, 3).await;

        // Rejected and relisted
        let rejected = submitted(store, &tasks[0]).await;
        store
            .transition_assignment(rejected.id, AssignmentChange::Reject { reason: None })
            .await
            .unwrap();
        // Cancelled and relisted
        let cancelled = Assignment::new(&tasks[1], UserId::from("annotator-b"));
        store.claim_task(&cancelled).await.unwrap();
        store
            .transition_assignment(cancelled.id, AssignmentChange::Cancel)
            .await
            .unwrap();

        for task in &tasks[..2] {
            assert_eq!(
                store.get_task(task.id).await.unwrap().unwrap().status,
                TaskStatus::Available
            );
            assert!(matches!(
                store.remove_task(task.id).await,
                Err(StoreError::TaskInUse(id)) if id == task.id
            ));
        }
        assert!(store.get_assignment(rejected.id).await.unwrap().is_some());
        assert!(store.get_task(tasks[0].id).await.unwrap().is_some());

        store.remove_task(tasks[2].id).await.unwrap();
        assert!(store.get_task(tasks[2].id).await.unwrap().is_none());
        assert!(matches!(
            store.remove_task(tasks[2].id).await,
            Err(StoreError::NotFound { .. })
        ));
        assert_eq!(store.count_tasks(project.id).await.unwrap(), 2);
    }

    /// A failed settlement does not block rejection, and once rejected it can
    /// no longer be claimed for another attempt.
    pub async fn check_failed_settlement_can_be_closed(store: &dyn MarketStore) {
        let (_, tasks) = seed(store, 2).await;

        let paid = submitted(store, &tasks[0]).await;
        let tx = sample_settlement(&paid);
        store.reserve_settlement(&tx).await.unwrap();
        store
            .update_settlement(
                tx.id,
                &[SettlementStatus::Pending],
                SettlementUpdate::Failed {
                    detail: "gateway down".to_string(),
                },
            )
            .await
            .unwrap();

        let rejected = store
            .transition_assignment(paid.id, AssignmentChange::Reject { reason: None })
            .await
            .unwrap();
        assert_eq!(rejected.status, AssignmentStatus::Rejected);
        assert!(matches!(
            store
                .update_settlement(tx.id, &[SettlementStatus::Failed], SettlementUpdate::Processing)
                .await,
            Err(StoreError::AssignmentState {
                current: AssignmentStatus::Rejected
            })
        ));
        let kept = store.get_settlement(tx.id).await.unwrap().unwrap();
        assert_eq!(kept.status, SettlementStatus::Failed);

        // A settlement that may still pay keeps blocking rejection
        let open = submitted(store, &tasks[1]).await;
        let open_tx = sample_settlement(&open);
        store.reserve_settlement(&open_tx).await.unwrap();
        store
            .update_settlement(
                open_tx.id,
                &[SettlementStatus::Pending],
                SettlementUpdate::Failed {
                    detail: "gateway down".to_string(),
                },
            )
            .await
            .unwrap();
        store
            .update_settlement(open_tx.id, &[SettlementStatus::Failed], SettlementUpdate::Processing)
            .await
            .unwrap();
        assert!(matches!(
            store
                .transition_assignment(open.id, AssignmentChange::Reject { reason: None })
                .await,
            Err(StoreError::SettlementExists(id)) if id == open_tx.id
        ));
    }

    /// Many annotators racing for one task: exactly one assignment is created.
    pub async fn check_concurrent_claims(store: Arc<dyn MarketStore>) {
        let (_, tasks) = seed(store.as_ref(), 1).await;
        let task = tasks[0].clone();

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            let task = task.clone();
            handles.push(tokio::spawn(async move {
                let assignment = Assignment::new(&task, UserId::from(format!("annotator-{}", i)));
                store.claim_task(&assignment).await
            }));
        }
        let mut wins = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => wins += 1,
                Err(StoreError::TaskUnavailable(_)) => {}
                Err(other) => panic!("unexpected error: {}", other),
            }
        }
        assert_eq!(wins, 1);
        let held = store
            .list_assignments(&AssignmentFilter {
                task_id: Some(task.id),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(held.len(), 1);
    }

    #[tokio::test]
    async fn test_store_type_parsing() {
        assert_eq!(StoreType::from_str("memory"), StoreType::Memory);
        assert_eq!(StoreType::from_str("SQLite"), StoreType::Sqlite);
        assert_eq!(StoreType::from_str("unknown"), StoreType::Sqlite);
        let store = create_store(StoreType::Memory, PathBuf::from("unused"))
            .await
            .unwrap();
        assert!(!store.is_persistent());
    }
}
