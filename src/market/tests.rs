use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::*;
use crate::audit::AuditAction;
use crate::error::SettlementFailureKind;
use crate::model::{AssignmentStatus, SettlementStatus, TaskStatus};
use crate::settlement::tests::ScriptedTransfers;
use crate::settlement::{SettlementPolicy, TransferReceipt, TransferStatus};
use crate::source::{
    AnnotationSource, SourceConnection, SourceCredential, SourceError, SourceProject, SourceTask,
};
use crate::store::{InMemoryStore, SettlementStore};

/// Labeling tool with a fixed set of projects that records pushed results.
#[derive(Default)]
struct FakeSource {
    projects: Mutex<HashMap<i64, Vec<SourceTask>>>,
    pushed: Mutex<Vec<(i64, Value)>>,
}

impl FakeSource {
    fn add_tasks(&self, project: i64, ids: std::ops::Range<i64>) {
        let mut projects = self.projects.lock().unwrap();
        let tasks = projects.entry(project).or_default();
        tasks.extend(ids.map(|id| SourceTask {
            id,
            data: json!({ "text": format!("sentence {}", id) }),
        }));
    }
}

#[async_trait]
impl AnnotationSource for FakeSource {
    async fn list_projects(&self) -> Result<Vec<SourceProject>, SourceError> {
        Ok(self
            .projects
            .lock()
            .unwrap()
            .iter()
            .map(|(id, tasks)| SourceProject {
                id: *id,
                title: format!("Project {}", id),
                description: String::new(),
                task_count: Some(tasks.len() as u64),
            })
            .collect())
    }

    async fn import_project(&self, project_id: i64) -> Result<(SourceProject, Vec<SourceTask>), SourceError> {
        let tasks = self.sync_tasks(project_id).await?;
        Ok((
            SourceProject {
                id: project_id,
                title: "Sentiment".to_string(),
                description: "Label each sentence".to_string(),
                task_count: Some(tasks.len() as u64),
            },
            tasks,
        ))
    }

    async fn sync_tasks(&self, project_id: i64) -> Result<Vec<SourceTask>, SourceError> {
        self.projects
            .lock()
            .unwrap()
            .get(&project_id)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(format!("project {}", project_id)))
    }

    async fn push_annotation(
        &self,
        task_id: i64,
        result: &Value,
        _completed_by: Option<&str>,
    ) -> Result<(), SourceError> {
        self.pushed.lock().unwrap().push((task_id, result.clone()));
        Ok(())
    }
}

struct FakeConnector(Arc<FakeSource>);

impl crate::source::SourceConnector for FakeConnector {
    fn connect(&self, _connection: &SourceConnection) -> Result<Arc<dyn AnnotationSource>, SourceError> {
        Ok(self.0.clone())
    }
}

struct Harness {
    memory: Arc<InMemoryStore>,
    market: Arc<Marketplace>,
    source: Arc<FakeSource>,
    transfers: Arc<ScriptedTransfers>,
    researcher: Caller,
}

fn harness_with(transfers: ScriptedTransfers, policy: SettlementPolicy) -> Harness {
    let source = Arc::new(FakeSource::default());
    source.add_tasks(1, 1..5);
    let transfers = Arc::new(transfers);
    let memory = Arc::new(InMemoryStore::new());
    let market = Marketplace::new(
        memory.clone(),
        transfers.clone(),
        Arc::new(FakeConnector(source.clone())),
        MarketSettings {
            settlement: policy,
            default_task_price: Usdc::from_whole(5),
        },
    );
    Harness {
        memory,
        market: Arc::new(market),
        source,
        transfers,
        researcher: Caller::researcher("researcher-r"),
    }
}

fn harness(transfers: ScriptedTransfers) -> Harness {
    harness_with(transfers, SettlementPolicy::default())
}

impl Harness {
    /// Connect, import source project 1 with a 20 USDC budget and publish it.
    async fn published_project(&self) -> (Project, Vec<Task>) {
        self.market
            .save_connection(
                &self.researcher,
                "https://ls.example.com",
                SourceCredential::ApiToken("token".into()),
            )
            .await
            .unwrap();
        let imported = self
            .market
            .import_project(&self.researcher, 1, Some(Usdc::from_whole(20)))
            .await
            .unwrap();
        let project = self
            .market
            .publish(&self.researcher, imported.project.id)
            .await
            .unwrap();
        let tasks = self
            .market
            .list_available_tasks(&self.researcher, Some(project.id))
            .await
            .unwrap();
        (project, tasks)
    }

    async fn annotator(&self, name: &str, address: &str) -> Caller {
        let caller = Caller::annotator(name);
        self.market.register_wallet(&caller, address).await.unwrap();
        caller
    }

    async fn submitted(&self, annotator: &Caller, task: &Task) -> Assignment {
        let assignment = self.market.claim(annotator, task.id).await.unwrap();
        self.market
            .submit(annotator, assignment.id, json!({"label": "positive"}))
            .await
            .unwrap()
    }
}

const WALLET_A: &str = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed";
const WALLET_B: &str = "0xfB6916095ca1df60bB79Ce92cE3Ea74c37c5d359";

fn approval(amount: &str) -> Approval {
    Approval {
        amount: Some(amount.parse().unwrap()),
        quality_score: Some(8.5),
        feedback: Some("clean work".to_string()),
    }
}

#[tokio::test]
async fn test_claim_start_submit_approve_pays_once() {
    let h = harness(ScriptedTransfers::with(vec![ScriptedTransfers::confirmed("0xpaid")]));
    let (_, tasks) = h.published_project().await;
    let a = h.annotator("annotator-a", WALLET_A).await;

    let assignment = h.market.claim(&a, tasks[0].id).await.unwrap();
    assert_eq!(assignment.status, AssignmentStatus::Assigned);
    let started = h.market.start(&a, assignment.id).await.unwrap();
    assert_eq!(started.status, AssignmentStatus::InProgress);
    let submitted = h
        .market
        .submit(&a, assignment.id, json!({"text": "ok"}))
        .await
        .unwrap();
    assert_eq!(submitted.status, AssignmentStatus::Submitted);

    let outcome = h
        .market
        .approve(&h.researcher, assignment.id, approval("5.00"))
        .await
        .unwrap();
    assert_eq!(outcome.assignment.status, AssignmentStatus::Approved);
    assert_eq!(outcome.assignment.settlement_id, Some(outcome.settlement.id));
    assert_eq!(outcome.assignment.quality_score, Some(8.5));
    assert_eq!(outcome.assignment.feedback.as_deref(), Some("clean work"));
    assert_eq!(outcome.settlement.status, SettlementStatus::Completed);
    assert_eq!(outcome.settlement.amount, Usdc::from_whole(5));

    let payouts = h.market.list_payouts(&a, None).await.unwrap();
    assert_eq!(payouts.len(), 1);
    assert_eq!(payouts[0].transaction_hash.as_deref(), Some("0xpaid"));
    assert_eq!(h.transfers.calls.lock().await.len(), 1);

    // The result reaches the labeling tool in the background
    for _ in 0..50 {
        if !h.source.pushed.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let pushed = h.source.pushed.lock().unwrap().clone();
    assert_eq!(pushed, vec![(tasks[0].source_task_id, json!({"text": "ok"}))]);
}

#[tokio::test]
async fn test_empty_result_is_rejected_and_state_kept() {
    let h = harness(ScriptedTransfers::default());
    let (_, tasks) = h.published_project().await;
    let b = Caller::annotator("annotator-b");

    let assignment = h.market.claim(&b, tasks[1].id).await.unwrap();
    h.market.start(&b, assignment.id).await.unwrap();

    for blank in [json!(""), json!("   "), Value::Null, json!({}), json!([])] {
        assert!(matches!(
            h.market.submit(&b, assignment.id, blank).await,
            Err(MarketError::Validation(_))
        ));
    }
    let current = h.market.get_assignment(&b, assignment.id).await.unwrap();
    assert_eq!(current.status, AssignmentStatus::InProgress);
}

#[tokio::test]
async fn test_concurrent_claims_have_one_winner() {
    let h = harness(ScriptedTransfers::default());
    let (_, tasks) = h.published_project().await;
    let task_id = tasks[2].id;

    let handles: Vec<_> = ["annotator-c", "annotator-d"]
        .into_iter()
        .map(|name| {
            let market = h.market.clone();
            tokio::spawn(async move { market.claim(&Caller::annotator(name), task_id).await })
        })
        .collect();

    let mut won = 0;
    let mut lost = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => won += 1,
            Err(MarketError::AlreadyClaimed(id)) => {
                assert_eq!(id, task_id);
                lost += 1
            }
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!((won, lost), (1, 1));

    let task = h.market.store().get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Claimed);
}

#[tokio::test]
async fn test_approve_before_submission_is_refused() {
    let h = harness(ScriptedTransfers::default());
    let (_, tasks) = h.published_project().await;
    let a = h.annotator("annotator-a", WALLET_A).await;
    let assignment = h.market.claim(&a, tasks[0].id).await.unwrap();

    match h.market.approve(&h.researcher, assignment.id, approval("5")).await {
        Err(MarketError::InvalidState { current, required, .. }) => {
            assert_eq!(current, "assigned");
            assert_eq!(required, "submitted");
        }
        other => panic!("unexpected: {:?}", other.map(|o| o.assignment.status)),
    }
    assert!(h.transfers.calls.lock().await.is_empty());
    assert!(h
        .market
        .store()
        .settlement_for_assignment(assignment.id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_cancel_relists_task_for_another_claim() {
    let h = harness(ScriptedTransfers::default());
    let (_, tasks) = h.published_project().await;
    let a = Caller::annotator("annotator-a");
    let b = Caller::annotator("annotator-b");

    let first = h.market.claim(&a, tasks[0].id).await.unwrap();
    assert!(matches!(
        h.market.claim(&b, tasks[0].id).await,
        Err(MarketError::AlreadyClaimed(_))
    ));

    // Another annotator cannot cancel someone else's work
    assert!(matches!(
        h.market.cancel(&b, first.id).await,
        Err(MarketError::Forbidden(_))
    ));
    let cancelled = h.market.cancel(&a, first.id).await.unwrap();
    assert_eq!(cancelled.status, AssignmentStatus::Cancelled);

    let second = h.market.claim(&b, tasks[0].id).await.unwrap();
    assert_eq!(second.task_id, tasks[0].id);

    // The owner may cancel too
    h.market.cancel(&h.researcher, second.id).await.unwrap();
    assert!(matches!(
        h.market.cancel(&b, second.id).await,
        Err(MarketError::InvalidState { .. })
    ));

    // Cancelled assignments are hidden from the annotator unless asked for
    let visible = h.market.list_assignments(&a, AssignmentQuery::default()).await.unwrap();
    assert!(visible.is_empty());
    let cancelled_only = h
        .market
        .list_assignments(
            &a,
            AssignmentQuery {
                status: Some(AssignmentStatus::Cancelled),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(cancelled_only.len(), 1);
}

#[tokio::test]
async fn test_failed_settlement_leaves_submitted_until_retry() {
    let h = harness(ScriptedTransfers::with(vec![
        ScriptedTransfers::unreachable("gateway down"),
        ScriptedTransfers::confirmed("0xretried"),
    ]));
    let (_, tasks) = h.published_project().await;
    let a = h.annotator("annotator-a", WALLET_A).await;
    let assignment = h.submitted(&a, &tasks[0]).await;

    let failure = match h.market.approve(&h.researcher, assignment.id, approval("5")).await {
        Err(MarketError::Settlement(failure)) => failure,
        other => panic!("unexpected: {:?}", other.map(|o| o.assignment.status)),
    };
    assert_eq!(failure.kind, SettlementFailureKind::Retryable);
    let current = h.market.get_assignment(&a, assignment.id).await.unwrap();
    assert_eq!(current.status, AssignmentStatus::Submitted);

    // Approving again points at the failed record instead of paying twice
    match h.market.approve(&h.researcher, assignment.id, approval("5")).await {
        Err(MarketError::Settlement(again)) => assert_eq!(again.transaction_id, failure.transaction_id),
        other => panic!("unexpected: {:?}", other.map(|o| o.assignment.status)),
    }
    assert_eq!(h.transfers.calls.lock().await.len(), 1);

    // Only the owner may retry
    assert!(matches!(
        h.market
            .retry_settlement(&Caller::researcher("someone-else"), failure.transaction_id)
            .await,
        Err(MarketError::Forbidden(_))
    ));

    let outcome = h
        .market
        .retry_settlement(&h.researcher, failure.transaction_id)
        .await
        .unwrap();
    assert_eq!(outcome.assignment.status, AssignmentStatus::Approved);
    assert_eq!(outcome.assignment.quality_score, Some(8.5));
    assert_eq!(outcome.settlement.transaction_hash.as_deref(), Some("0xretried"));

    let completed = h
        .market
        .store()
        .list_settlements(None, Some(SettlementStatus::Completed))
        .await
        .unwrap();
    assert_eq!(completed.len(), 1);
}

#[tokio::test]
async fn test_reject_never_settles_and_relists() {
    let h = harness(ScriptedTransfers::default());
    let (_, tasks) = h.published_project().await;
    let a = h.annotator("annotator-a", WALLET_A).await;
    let assignment = h.submitted(&a, &tasks[0]).await;

    let rejected = h
        .market
        .reject(&h.researcher, assignment.id, Some("labels are off".to_string()))
        .await
        .unwrap();
    assert_eq!(rejected.status, AssignmentStatus::Rejected);
    assert_eq!(rejected.feedback.as_deref(), Some("labels are off"));

    assert!(matches!(
        h.market.approve(&h.researcher, assignment.id, approval("5")).await,
        Err(MarketError::InvalidState { .. })
    ));
    assert!(h.transfers.calls.lock().await.is_empty());
    assert!(h
        .market
        .store()
        .settlement_for_assignment(assignment.id)
        .await
        .unwrap()
        .is_none());

    let available = h
        .market
        .list_available_tasks(&a, None)
        .await
        .unwrap();
    assert!(available.iter().any(|t| t.id == tasks[0].id));
}

#[tokio::test]
async fn test_approval_preconditions() {
    let h = harness(ScriptedTransfers::default());
    let (_, tasks) = h.published_project().await;
    let no_wallet = Caller::annotator("annotator-nowallet");
    let assignment = h.submitted(&no_wallet, &tasks[0]).await;

    assert!(matches!(
        h.market
            .approve(&Caller::researcher("other-researcher"), assignment.id, approval("5"))
            .await,
        Err(MarketError::Forbidden(_))
    ));
    assert!(matches!(
        h.market.approve(&h.researcher, assignment.id, approval("5")).await,
        Err(MarketError::Validation(_))
    ));

    h.market.register_wallet(&no_wallet, WALLET_B).await.unwrap();
    for bad in [
        approval("0"),
        approval("10000.01"),
        Approval {
            quality_score: Some(11.0),
            ..approval("5")
        },
    ] {
        assert!(matches!(
            h.market.approve(&h.researcher, assignment.id, bad).await,
            Err(MarketError::Validation(_))
        ));
    }
    assert!(h.transfers.calls.lock().await.is_empty());

    // Without an amount the task price applies
    let outcome = h
        .market
        .approve(&h.researcher, assignment.id, Approval::default())
        .await
        .unwrap();
    assert_eq!(outcome.settlement.amount, tasks[0].price);
}

#[tokio::test]
async fn test_unconfirmed_settlement_is_reconciled_in_background_pass() {
    let policy = SettlementPolicy {
        transfer_timeout: Duration::from_millis(20),
        ..Default::default()
    };
    let transfers = ScriptedTransfers {
        delay: Some(Duration::from_millis(200)),
        ..Default::default()
    };
    let h = harness_with(transfers, policy);
    let (_, tasks) = h.published_project().await;
    let a = h.annotator("annotator-a", WALLET_A).await;
    let assignment = h.submitted(&a, &tasks[0]).await;

    match h.market.approve(&h.researcher, assignment.id, approval("5")).await {
        Err(MarketError::Settlement(failure)) => {
            assert_eq!(failure.kind, SettlementFailureKind::Unconfirmed)
        }
        other => panic!("unexpected: {:?}", other.map(|o| o.assignment.status)),
    }

    h.transfers.lookups.lock().await.push_back(Some(TransferReceipt {
        transaction_hash: Some("0xlanded".to_string()),
        from_address: None,
        status: TransferStatus::Confirmed,
    }));
    let report = h.market.reconcile_stale(chrono::Utc::now()).await.unwrap();
    assert_eq!(
        report,
        ReconcileReport {
            checked: 1,
            completed: 1,
            failed: 0,
            still_pending: 0,
        }
    );

    let approved = h.market.get_assignment(&h.researcher, assignment.id).await.unwrap();
    assert_eq!(approved.status, AssignmentStatus::Approved);
    assert_eq!(approved.feedback.as_deref(), Some("clean work"));
}

#[tokio::test]
async fn test_import_sync_and_budget_pricing() {
    let h = harness(ScriptedTransfers::default());
    let (project, tasks) = h.published_project().await;
    assert_eq!(tasks.len(), 4);
    assert_eq!(project.price_per_task, Usdc::from_whole(5));

    // Importing the same source project twice is refused
    assert!(matches!(
        h.market.import_project(&h.researcher, 1, None).await,
        Err(MarketError::Validation(_))
    ));

    let a = Caller::annotator("annotator-a");
    h.market.claim(&a, tasks[0].id).await.unwrap();

    h.source.add_tasks(1, 5..9);
    let synced = h.market.sync_project(&h.researcher, project.id).await.unwrap();
    assert_eq!(synced.tasks_added, 4);
    assert_eq!(synced.total_tasks, 8);
    assert_eq!(synced.project.price_per_task, "2.5".parse().unwrap());
    assert_eq!(synced.repriced, 7);

    let updated = h
        .market
        .set_budget(&h.researcher, project.id, Usdc::from_whole(40))
        .await
        .unwrap();
    assert_eq!(updated.price_per_task, Usdc::from_whole(5));
    let all = h.market.list_project_tasks(&h.researcher, project.id).await.unwrap();
    let claimed = all.iter().find(|t| t.id == tasks[0].id).unwrap();
    assert_eq!(claimed.price, Usdc::from_whole(5));
    assert!(all
        .iter()
        .filter(|t| t.status == TaskStatus::Available)
        .all(|t| t.price == Usdc::from_whole(5)));

    // Claimed tasks cannot be removed, available ones can
    assert!(matches!(
        h.market.remove_task(&h.researcher, tasks[0].id).await,
        Err(MarketError::InvalidState { .. })
    ));
    h.market.remove_task(&h.researcher, tasks[1].id).await.unwrap();
    assert_eq!(
        h.market.list_project_tasks(&h.researcher, project.id).await.unwrap().len(),
        7
    );
}

#[tokio::test]
async fn test_unpublished_projects_are_not_claimable() {
    let h = harness(ScriptedTransfers::default());
    let (project, tasks) = h.published_project().await;
    let a = Caller::annotator("annotator-a");

    assert!(matches!(
        h.market.claim(&h.researcher, tasks[0].id).await,
        Err(MarketError::Forbidden(_))
    ));

    h.market.unpublish(&h.researcher, project.id).await.unwrap();
    assert!(matches!(
        h.market.claim(&a, tasks[0].id).await,
        Err(MarketError::InvalidState { .. })
    ));
    assert!(h.market.list_available_tasks(&a, None).await.unwrap().is_empty());
    assert!(h.market.list_projects(&a).await.unwrap().is_empty());
    assert_eq!(h.market.list_projects(&h.researcher).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_publish_requires_budget() {
    let h = harness(ScriptedTransfers::default());
    h.market
        .save_connection(
            &h.researcher,
            "https://ls.example.com",
            SourceCredential::AccessToken("jwt".into()),
        )
        .await
        .unwrap();
    let imported = h.market.import_project(&h.researcher, 1, None).await.unwrap();
    assert_eq!(imported.tasks_imported, 4);
    assert_eq!(imported.project.price_per_task, Usdc::from_whole(5));
    assert!(matches!(
        h.market.publish(&h.researcher, imported.project.id).await,
        Err(MarketError::Validation(_))
    ));
}

#[tokio::test]
async fn test_audit_trail_visibility() {
    let h = harness(ScriptedTransfers::default());
    let (_, tasks) = h.published_project().await;
    let a = h.annotator("annotator-a", WALLET_A).await;
    let assignment = h.submitted(&a, &tasks[0]).await;
    h.market
        .approve(&h.researcher, assignment.id, approval("5"))
        .await
        .unwrap();

    let everything = h
        .market
        .audit_entries(&h.researcher, AuditFilter::default())
        .await
        .unwrap();
    let actions: Vec<_> = everything.iter().map(|e| e.action).collect();
    assert!(actions.contains(&AuditAction::TaskApprove));
    assert!(actions.contains(&AuditAction::PaymentCompleted));

    let own = h.market.audit_entries(&a, AuditFilter::default()).await.unwrap();
    assert!(!own.is_empty());
    assert!(own.iter().all(|e| e.actor.as_ref() == Some(&a.user_id)));
}

async fn review_entries(h: &Harness, action: AuditAction) -> Vec<AuditEntry> {
    h.market
        .audit_entries(
            &h.researcher,
            AuditFilter {
                action: Some(action),
                ..Default::default()
            },
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn test_exhausted_settlement_is_closed_by_rejecting() {
    let policy = SettlementPolicy {
        max_attempts: 2,
        ..Default::default()
    };
    let h = harness_with(
        ScriptedTransfers::with(vec![
            ScriptedTransfers::unreachable("gateway down"),
            ScriptedTransfers::unreachable("gateway still down"),
        ]),
        policy,
    );
    let (_, tasks) = h.published_project().await;
    let a = h.annotator("annotator-a", WALLET_A).await;
    let assignment = h.submitted(&a, &tasks[0]).await;

    let failure = match h.market.approve(&h.researcher, assignment.id, approval("5")).await {
        Err(MarketError::Settlement(failure)) => failure,
        other => panic!("unexpected: {:?}", other.map(|o| o.assignment.status)),
    };
    match h.market.retry_settlement(&h.researcher, failure.transaction_id).await {
        Err(MarketError::Settlement(last)) => assert_eq!(last.kind, SettlementFailureKind::Permanent),
        other => panic!("unexpected: {:?}", other.map(|o| o.assignment.status)),
    }

    // Approving again reports the dead end instead of suggesting a retry
    match h.market.approve(&h.researcher, assignment.id, approval("5")).await {
        Err(MarketError::Settlement(again)) => {
            assert_eq!(again.transaction_id, failure.transaction_id);
            assert_eq!(again.kind, SettlementFailureKind::Permanent);
        }
        other => panic!("unexpected: {:?}", other.map(|o| o.assignment.status)),
    }

    let rejected = h
        .market
        .reject(&h.researcher, assignment.id, Some("payout impossible".to_string()))
        .await
        .unwrap();
    assert_eq!(rejected.status, AssignmentStatus::Rejected);
    let available = h.market.list_available_tasks(&a, None).await.unwrap();
    assert!(available.iter().any(|t| t.id == tasks[0].id));

    // The failed record stays for the books and cannot be revived
    let kept = h
        .market
        .store()
        .get_settlement(failure.transaction_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(kept.status, SettlementStatus::Failed);
    assert!(matches!(
        h.market.retry_settlement(&h.researcher, failure.transaction_id).await,
        Err(MarketError::InvalidState { .. })
    ));
    assert_eq!(h.transfers.calls.lock().await.len(), 2);
}

#[tokio::test]
async fn test_review_audit_reflects_outcome() {
    let h = harness(ScriptedTransfers::with(vec![ScriptedTransfers::unreachable(
        "gateway down",
    )]));
    let (_, tasks) = h.published_project().await;
    let a = h.annotator("annotator-a", WALLET_A).await;
    let failed = h.submitted(&a, &tasks[0]).await;
    let open = h.market.claim(&a, tasks[1].id).await.unwrap();

    assert!(h
        .market
        .approve(&h.researcher, failed.id, approval("5"))
        .await
        .is_err());
    // Not submitted yet
    assert!(matches!(
        h.market.reject(&h.researcher, open.id, None).await,
        Err(MarketError::InvalidState { .. })
    ));

    let approvals = review_entries(&h, AuditAction::TaskApprove).await;
    assert_eq!(approvals.len(), 1);
    assert!(!approvals[0].success);
    assert!(approvals[0].error_message.is_some());
    let rejections = review_entries(&h, AuditAction::TaskReject).await;
    assert_eq!(rejections.len(), 1);
    assert!(!rejections[0].success);
    assert_eq!(rejections[0].resource_id, open.id.to_string());
}

#[tokio::test]
async fn test_audit_outage_stops_approval_before_payment() {
    let h = harness(ScriptedTransfers::default());
    let (_, tasks) = h.published_project().await;
    let a = h.annotator("annotator-a", WALLET_A).await;
    let assignment = h.submitted(&a, &tasks[0]).await;
    h.memory.limit_audit_writes(0).await;

    assert!(matches!(
        h.market.approve(&h.researcher, assignment.id, approval("5")).await,
        Err(MarketError::Audit(_))
    ));
    assert!(h.transfers.calls.lock().await.is_empty());
    let current = h.market.get_assignment(&a, assignment.id).await.unwrap();
    assert_eq!(current.status, AssignmentStatus::Submitted);
}

#[tokio::test]
async fn test_tasks_with_history_cannot_be_removed() {
    let h = harness(ScriptedTransfers::default());
    let (_, tasks) = h.published_project().await;
    let a = h.annotator("annotator-a", WALLET_A).await;
    let assignment = h.submitted(&a, &tasks[0]).await;
    h.market.reject(&h.researcher, assignment.id, None).await.unwrap();

    // Relisted, but its rejected assignment still points at it
    assert!(matches!(
        h.market.remove_task(&h.researcher, tasks[0].id).await,
        Err(MarketError::InvalidState { resource: "task", .. })
    ));
    assert!(h.market.get_assignment(&a, assignment.id).await.is_ok());

    h.market.remove_task(&h.researcher, tasks[1].id).await.unwrap();
    let available = h.market.list_available_tasks(&a, None).await.unwrap();
    assert!(available.iter().any(|t| t.id == tasks[0].id));
    assert!(!available.iter().any(|t| t.id == tasks[1].id));
}
