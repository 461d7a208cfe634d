//! Assignment lifecycle and settlement follow-ups.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::Marketplace;
use crate::audit::{AuditAction, NewAuditEntry};
use crate::error::{MarketError, SettlementFailureKind};
use crate::identity::Caller;
use crate::model::{
    Assignment, AssignmentChange, AssignmentId, AssignmentStatus, ProjectId, SettlementStatus,
    SettlementTransaction, TaskId, TaskStatus, TransactionId,
};
use crate::money::Usdc;
use crate::settlement::SettlementRequest;
use crate::store::{
    AssignmentFilter, AssignmentStore, DirectoryStore, SettlementStore, StoreError, TaskStore,
};

/// Review submitted with an approval.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Approval {
    /// Payout; defaults to the task's price
    #[serde(default)]
    pub amount: Option<Usdc>,
    #[serde(default)]
    pub quality_score: Option<f64>,
    #[serde(default)]
    pub feedback: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalOutcome {
    pub assignment: Assignment,
    pub settlement: SettlementTransaction,
}

/// Optional narrowing for [`Marketplace::list_assignments`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AssignmentQuery {
    #[serde(default)]
    pub status: Option<AssignmentStatus>,
    #[serde(default)]
    pub project_id: Option<ProjectId>,
}

/// Summary of one reconciler pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub checked: usize,
    pub completed: usize,
    pub failed: usize,
    pub still_pending: usize,
}

const MAX_QUALITY_SCORE: f64 = 10.0;

fn is_blank(result: &Value) -> bool {
    match result {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(fields) => fields.is_empty(),
        _ => false,
    }
}

/// Review fields carried in the settlement metadata until finalization.
fn review_from(metadata: &Value) -> (Option<f64>, Option<String>) {
    (
        metadata.get("quality_score").and_then(Value::as_f64),
        metadata
            .get("feedback")
            .and_then(Value::as_str)
            .map(str::to_string),
    )
}

impl Marketplace {
    /// Claim an available task of a published project.
    pub async fn claim(&self, caller: &Caller, task_id: TaskId) -> Result<Assignment, MarketError> {
        if !caller.is_annotator() {
            return Err(MarketError::forbidden("Only annotators can claim tasks"));
        }
        let task = self.load_task(task_id).await?;
        let project = self.load_project(task.project_id).await?;
        if !project.published {
            return Err(MarketError::InvalidState {
                resource: "project",
                current: "unpublished".to_string(),
                required: "published".to_string(),
            });
        }
        if task.status != TaskStatus::Available {
            return Err(MarketError::AlreadyClaimed(task_id));
        }

        let assignment = Assignment::new(&task, caller.user_id.clone());
        self.store.claim_task(&assignment).await?;
        tracing::info!(
            task_id = %task_id,
            assignment_id = %assignment.id,
            annotator = %caller.user_id,
            "Task claimed"
        );
        self.audit
            .record_or_log(
                NewAuditEntry::new(AuditAction::TaskClaim, "task", task_id)
                    .actor(Some(&caller.user_id))
                    .details(json!({
                        "assignment_id": assignment.id,
                        "project_id": assignment.project_id,
                    })),
            )
            .await;
        Ok(assignment)
    }

    pub async fn accept(&self, caller: &Caller, id: AssignmentId) -> Result<Assignment, MarketError> {
        self.annotator_step(caller, id, AssignmentChange::Accept, AuditAction::TaskAccept)
            .await
    }

    pub async fn start(&self, caller: &Caller, id: AssignmentId) -> Result<Assignment, MarketError> {
        self.annotator_step(caller, id, AssignmentChange::Start, AuditAction::TaskStart)
            .await
    }

    pub async fn submit(
        &self,
        caller: &Caller,
        id: AssignmentId,
        result: Value,
    ) -> Result<Assignment, MarketError> {
        if is_blank(&result) {
            return Err(MarketError::validation("Annotation result cannot be empty"));
        }
        self.annotator_step(caller, id, AssignmentChange::Submit { result }, AuditAction::TaskSubmit)
            .await
    }

    /// Give up a task before submission. Allowed for the annotator holding
    /// it and for the project owner.
    pub async fn cancel(&self, caller: &Caller, id: AssignmentId) -> Result<Assignment, MarketError> {
        let assignment = self.load_assignment(id).await?;
        let by = if assignment.annotator == caller.user_id {
            "annotator"
        } else {
            let project = self.load_project(assignment.project_id).await?;
            if project.owner != caller.user_id {
                return Err(MarketError::forbidden(
                    "Only the assigned annotator or the project owner can cancel",
                ));
            }
            "owner"
        };

        let change = AssignmentChange::Cancel;
        let required = change.allowed_from();
        let cancelled = self
            .store
            .transition_assignment(id, change)
            .await
            .map_err(|e| MarketError::from_transition(e, required))?;
        tracing::info!(assignment_id = %id, task_id = %cancelled.task_id, by, "Assignment cancelled");
        self.audit
            .record_or_log(
                NewAuditEntry::new(AuditAction::TaskCancel, "assignment", id)
                    .actor(Some(&caller.user_id))
                    .details(json!({ "task_id": cancelled.task_id, "by": by })),
            )
            .await;
        Ok(cancelled)
    }

    /// Pay for a submitted assignment and mark it approved.
    ///
    /// The assignment only becomes `approved` once its settlement reached
    /// `completed`. Any settlement failure leaves it `submitted` and is
    /// returned as [`MarketError::Settlement`]. The audit entry is written
    /// once the outcome is known.
    pub async fn approve(
        &self,
        caller: &Caller,
        id: AssignmentId,
        approval: Approval,
    ) -> Result<ApprovalOutcome, MarketError> {
        let assignment = self.load_assignment(id).await?;
        self.owned_project(caller, assignment.project_id).await?;

        let requested = approval.amount;
        let result = self.pay_and_approve(caller, &assignment, approval).await;
        let entry = NewAuditEntry::new(AuditAction::TaskApprove, "assignment", id)
            .actor(Some(&caller.user_id));
        match result {
            Ok(outcome) => {
                self.audit
                    .record(entry.details(json!({
                        "amount": outcome.settlement.amount,
                        "annotator": assignment.annotator,
                        "quality_score": outcome.assignment.quality_score,
                        "transaction_id": outcome.settlement.id,
                    })))
                    .await
                    .map_err(|e| {
                        MarketError::Audit(format!(
                            "assignment {} approved but its audit entry was not written: {}",
                            id, e
                        ))
                    })?;
                Ok(outcome)
            }
            Err(err) => {
                let entry = entry.details(json!({
                    "amount": requested,
                    "annotator": assignment.annotator,
                }));
                self.audit_refusal(entry, &err).await;
                Err(err)
            }
        }
    }

    async fn pay_and_approve(
        &self,
        caller: &Caller,
        assignment: &Assignment,
        approval: Approval,
    ) -> Result<ApprovalOutcome, MarketError> {
        let id = assignment.id;
        if assignment.status != AssignmentStatus::Submitted {
            return Err(MarketError::assignment_state(
                assignment.status,
                &[AssignmentStatus::Submitted],
            ));
        }

        if let Some(existing) = self.store.settlement_for_assignment(id).await? {
            return self.resume_approval(caller, existing).await;
        }

        let amount = match approval.amount {
            Some(amount) => amount,
            None => self
                .store
                .get_task(assignment.task_id)
                .await?
                .map(|t| t.price)
                .unwrap_or(self.default_task_price),
        };
        self.settlements.validate_amount(amount)?;
        if let Some(score) = approval.quality_score {
            if !score.is_finite() || !(0.0..=MAX_QUALITY_SCORE).contains(&score) {
                return Err(MarketError::validation(format!(
                    "Quality score must be between 0 and {}",
                    MAX_QUALITY_SCORE
                )));
            }
        }
        let feedback = approval
            .feedback
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty());
        let wallet = self.store.get_wallet(&assignment.annotator).await?.ok_or_else(|| {
            MarketError::validation("Annotator has not registered a payout wallet")
        })?;

        let settlement = self
            .settlements
            .settle(
                SettlementRequest {
                    assignment_id: id,
                    recipient: assignment.annotator.clone(),
                    to_address: wallet.address,
                    amount,
                    metadata: json!({
                        "quality_score": approval.quality_score,
                        "feedback": feedback,
                        "approved_by": caller.user_id,
                    }),
                },
                Some(&caller.user_id),
            )
            .await?;

        let assignment = self.finalize_approval(&settlement).await?;
        Ok(ApprovalOutcome {
            assignment,
            settlement,
        })
    }

    /// Approve called again for an assignment that already has a settlement.
    async fn resume_approval(
        &self,
        caller: &Caller,
        existing: SettlementTransaction,
    ) -> Result<ApprovalOutcome, MarketError> {
        match existing.status {
            SettlementStatus::Completed => {
                tracing::info!(
                    transaction_id = %existing.id,
                    assignment_id = %existing.assignment_id,
                    actor = %caller.user_id,
                    "Finalizing approval for completed settlement"
                );
                let assignment = self.finalize_approval(&existing).await?;
                Ok(ApprovalOutcome {
                    assignment,
                    settlement: existing,
                })
            }
            SettlementStatus::Failed if existing.retry_count >= self.settlements.policy().max_attempts => {
                Err(MarketError::settlement(
                    existing.id,
                    SettlementFailureKind::Permanent,
                    "every transfer attempt failed; reject the assignment to close it",
                ))
            }
            SettlementStatus::Failed => Err(MarketError::settlement(
                existing.id,
                SettlementFailureKind::Retryable,
                "a previous settlement attempt failed; retry that settlement instead",
            )),
            SettlementStatus::Pending | SettlementStatus::Processing => Err(MarketError::settlement(
                existing.id,
                SettlementFailureKind::Unconfirmed,
                "a settlement is awaiting confirmation; reconcile it instead",
            )),
            SettlementStatus::Refunded => Err(MarketError::InvalidState {
                resource: "settlement",
                current: existing.status.to_string(),
                required: "no settlement".to_string(),
            }),
        }
    }

    /// Move the assignment to `approved` for a completed settlement.
    /// Idempotent: an already-approved assignment is returned unchanged.
    async fn finalize_approval(&self, tx: &SettlementTransaction) -> Result<Assignment, MarketError> {
        let (quality_score, feedback) = review_from(&tx.metadata);
        let change = AssignmentChange::Approve {
            settlement_id: tx.id,
            quality_score,
            feedback,
        };
        let required = change.allowed_from();
        let approved = match self.store.transition_assignment(tx.assignment_id, change).await {
            Ok(assignment) => assignment,
            Err(StoreError::AssignmentState {
                current: AssignmentStatus::Approved,
            }) => return self.load_assignment(tx.assignment_id).await,
            Err(e) => return Err(MarketError::from_transition(e, required)),
        };
        tracing::info!(
            assignment_id = %approved.id,
            transaction_id = %tx.id,
            amount = %tx.amount,
            "Assignment approved"
        );
        self.push_annotation(&approved).await;
        Ok(approved)
    }

    /// Turn down a submitted assignment and put the task back on the
    /// market. Refused while a settlement may still pay; a `failed`
    /// settlement is left as it is and can no longer be retried.
    pub async fn reject(
        &self,
        caller: &Caller,
        id: AssignmentId,
        reason: Option<String>,
    ) -> Result<Assignment, MarketError> {
        let assignment = self.load_assignment(id).await?;
        self.owned_project(caller, assignment.project_id).await?;
        let reason = reason.map(|r| r.trim().to_string()).filter(|r| !r.is_empty());

        let details = json!({ "annotator": assignment.annotator, "reason": reason });

        let change = AssignmentChange::Reject { reason };
        let required = change.allowed_from();
        let result = self.store.transition_assignment(id, change).await;
        let entry = NewAuditEntry::new(AuditAction::TaskReject, "assignment", id)
            .actor(Some(&caller.user_id))
            .details(details);
        match result {
            Ok(rejected) => {
                tracing::info!(assignment_id = %id, task_id = %rejected.task_id, "Assignment rejected");
                self.audit.record(entry).await.map_err(|e| {
                    MarketError::Audit(format!(
                        "assignment {} rejected but its audit entry was not written: {}",
                        id, e
                    ))
                })?;
                Ok(rejected)
            }
            Err(e) => {
                let err = MarketError::from_transition(e, required);
                self.audit_refusal(entry, &err).await;
                Err(err)
            }
        }
    }

    /// Record a review action that did not go through. The caller's error
    /// wins over a failed audit write, which is only logged.
    async fn audit_refusal(&self, entry: NewAuditEntry, err: &MarketError) {
        if let Err(audit_err) = self.audit.record(entry.failed(err.to_string())).await {
            tracing::error!(
                audit_error = %audit_err,
                error = %err,
                "Refused review action has no audit entry"
            );
        }
    }

    /// Retry a failed settlement and finalize the approval if it completes.
    pub async fn retry_settlement(
        &self,
        caller: &Caller,
        id: TransactionId,
    ) -> Result<ApprovalOutcome, MarketError> {
        self.owned_settlement(caller, id).await?;
        let settlement = self.settlements.retry(id, Some(&caller.user_id)).await?;
        let assignment = self.finalize_approval(&settlement).await?;
        Ok(ApprovalOutcome {
            assignment,
            settlement,
        })
    }

    /// Check a pending settlement with the provider. `caller` is `None` for
    /// the background reconciler.
    pub async fn reconcile_settlement(
        &self,
        caller: Option<&Caller>,
        id: TransactionId,
    ) -> Result<ApprovalOutcome, MarketError> {
        if let Some(caller) = caller {
            self.owned_settlement(caller, id).await?;
        }
        let settlement = self
            .settlements
            .reconcile(id, caller.map(|c| &c.user_id))
            .await?;
        let assignment = self.finalize_approval(&settlement).await?;
        Ok(ApprovalOutcome {
            assignment,
            settlement,
        })
    }

    pub async fn refund_settlement(
        &self,
        caller: &Caller,
        id: TransactionId,
        note: Option<String>,
    ) -> Result<SettlementTransaction, MarketError> {
        self.owned_settlement(caller, id).await?;
        self.settlements.refund(id, Some(&caller.user_id), note).await
    }

    /// Resolve every unconfirmed settlement last touched before `older_than`.
    pub async fn reconcile_stale(&self, older_than: DateTime<Utc>) -> Result<ReconcileReport, MarketError> {
        let mut report = ReconcileReport::default();
        for tx in self.settlements.unconfirmed(older_than).await? {
            report.checked += 1;
            match self.reconcile_settlement(None, tx.id).await {
                Ok(_) => report.completed += 1,
                Err(MarketError::Settlement(failure))
                    if failure.kind == SettlementFailureKind::Unconfirmed =>
                {
                    report.still_pending += 1
                }
                Err(MarketError::Settlement(_)) => report.failed += 1,
                Err(e) => {
                    tracing::warn!(transaction_id = %tx.id, error = %e, "Reconciliation failed");
                    report.still_pending += 1;
                }
            }
        }
        Ok(report)
    }

    pub async fn get_assignment(&self, caller: &Caller, id: AssignmentId) -> Result<Assignment, MarketError> {
        let assignment = self.load_assignment(id).await?;
        if assignment.annotator != caller.user_id {
            self.owned_project(caller, assignment.project_id).await?;
        }
        Ok(assignment)
    }

    /// Annotators see their own assignments (cancelled ones only when asked
    /// for explicitly); researchers see those on their projects.
    pub async fn list_assignments(
        &self,
        caller: &Caller,
        query: AssignmentQuery,
    ) -> Result<Vec<Assignment>, MarketError> {
        let mut filter = AssignmentFilter {
            project_id: query.project_id,
            ..Default::default()
        };
        if caller.is_annotator() {
            filter.annotator = Some(caller.user_id.clone());
            filter.statuses = Some(match query.status {
                Some(status) => vec![status],
                None => {
                    let mut visible = AssignmentStatus::ACTIVE.to_vec();
                    visible.extend([AssignmentStatus::Approved, AssignmentStatus::Rejected]);
                    visible
                }
            });
        } else {
            filter.project_owner = Some(caller.user_id.clone());
            filter.statuses = query.status.map(|s| vec![s]);
        }
        Ok(self.store.list_assignments(&filter).await?)
    }

    /// Settlement visible to its recipient and to the project owner.
    pub async fn get_settlement(
        &self,
        caller: &Caller,
        id: TransactionId,
    ) -> Result<SettlementTransaction, MarketError> {
        let tx = self.load_settlement(id).await?;
        if tx.recipient != caller.user_id {
            self.owned_settlement(caller, id).await?;
        }
        Ok(tx)
    }

    /// Payouts received by the caller, newest first.
    pub async fn list_payouts(
        &self,
        caller: &Caller,
        status: Option<SettlementStatus>,
    ) -> Result<Vec<SettlementTransaction>, MarketError> {
        Ok(self
            .store
            .list_settlements(Some(&caller.user_id), status)
            .await?)
    }

    async fn load_settlement(&self, id: TransactionId) -> Result<SettlementTransaction, MarketError> {
        self.store
            .get_settlement(id)
            .await?
            .ok_or_else(|| MarketError::NotFound(format!("settlement {}", id)))
    }

    /// Check the caller owns the project a settlement pays for.
    async fn owned_settlement(&self, caller: &Caller, id: TransactionId) -> Result<(), MarketError> {
        let tx = self.load_settlement(id).await?;
        let assignment = self.load_assignment(tx.assignment_id).await?;
        self.owned_project(caller, assignment.project_id).await?;
        Ok(())
    }

    async fn annotator_step(
        &self,
        caller: &Caller,
        id: AssignmentId,
        change: AssignmentChange,
        action: AuditAction,
    ) -> Result<Assignment, MarketError> {
        let assignment = self.load_assignment(id).await?;
        if assignment.annotator != caller.user_id {
            return Err(MarketError::forbidden(
                "Only the assigned annotator can work on this assignment",
            ));
        }
        let required = change.allowed_from();
        let updated = self
            .store
            .transition_assignment(id, change)
            .await
            .map_err(|e| MarketError::from_transition(e, required))?;
        tracing::info!(
            assignment_id = %id,
            status = %updated.status,
            annotator = %caller.user_id,
            "Assignment updated"
        );
        self.audit
            .record_or_log(
                NewAuditEntry::new(action, "assignment", id)
                    .actor(Some(&caller.user_id))
                    .details(json!({ "task_id": updated.task_id, "status": updated.status })),
            )
            .await;
        Ok(updated)
    }
}
