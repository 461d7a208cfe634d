//! Settlement processor.
//!
//! # Invariants
//! - A `pending` record is reserved before any transfer call, so every
//!   transfer attempt has a persisted record carrying its idempotency key.
//! - A record only reaches `completed` with a transaction hash.
//! - There is no automatic retry. Definite failures become `failed`; unknown
//!   outcomes stay `pending` until [`SettlementProcessor::reconcile`] asks the
//!   provider.
//! - `retry` claims a `failed` record with a conditional `failed ->
//!   processing` update, so two concurrent retries cannot both transfer.
//!   The claim is refused once the paid assignment is no longer submitted.
//! - Every outcome is audited; an audit write that fails after the store was
//!   updated is reported as [`MarketError::Audit`].

mod transfer;

pub use transfer::{
    DryRunTransferClient, HttpTransferClient, TransferClient, TransferError, TransferErrorKind,
    TransferReceipt, TransferRequest, TransferStatus,
};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::audit::{AuditAction, AuditLog, NewAuditEntry};
use crate::error::{MarketError, SettlementFailureKind};
use crate::identity::UserId;
use crate::model::{
    AssignmentId, AssignmentStatus, SettlementStatus, SettlementTransaction, SettlementUpdate, TransactionId,
};
use crate::money::Usdc;
use crate::store::{MarketStore, SettlementStore, StoreError};
use crate::wallet::WalletAddress;

/// Extra time past the transfer timeout before a record the provider does
/// not know is treated as never sent.
const IN_FLIGHT_GRACE: Duration = Duration::from_secs(5);

/// Limits and constants applied to every settlement.
#[derive(Debug, Clone)]
pub struct SettlementPolicy {
    pub network: String,
    pub max_amount: Usdc,
    /// Platform share recorded alongside each payout
    pub fee_rate: Decimal,
    /// Total transfer attempts allowed per record (first attempt included)
    pub max_attempts: u32,
    pub transfer_timeout: Duration,
}

impl Default for SettlementPolicy {
    fn default() -> Self {
        Self {
            network: "base-sepolia".to_string(),
            max_amount: Usdc::from_whole(10_000),
            fee_rate: Decimal::new(10, 2),
            max_attempts: 3,
            transfer_timeout: Duration::from_secs(30),
        }
    }
}

/// Everything needed to pay one approved assignment.
#[derive(Debug, Clone)]
pub struct SettlementRequest {
    pub assignment_id: AssignmentId,
    pub recipient: UserId,
    pub to_address: WalletAddress,
    pub amount: Usdc,
    /// Review data carried to finalization
    pub metadata: serde_json::Value,
}

/// Result of checking one record against the provider.
enum Outcome {
    Completed {
        transaction_hash: String,
        from_address: Option<String>,
    },
    Failed {
        detail: String,
        transient: bool,
    },
    Unconfirmed {
        detail: String,
    },
}

pub struct SettlementProcessor {
    store: Arc<dyn MarketStore>,
    audit: AuditLog,
    transfers: Arc<dyn TransferClient>,
    policy: SettlementPolicy,
}

impl SettlementProcessor {
    pub fn new(
        store: Arc<dyn MarketStore>,
        audit: AuditLog,
        transfers: Arc<dyn TransferClient>,
        policy: SettlementPolicy,
    ) -> Self {
        Self {
            store,
            audit,
            transfers,
            policy,
        }
    }

    pub fn policy(&self) -> &SettlementPolicy {
        &self.policy
    }

    /// Reject amounts that are zero or above the configured maximum.
    pub fn validate_amount(&self, amount: Usdc) -> Result<(), MarketError> {
        if !amount.is_positive() {
            return Err(MarketError::validation("Payment amount must be greater than zero"));
        }
        if amount > self.policy.max_amount {
            return Err(MarketError::validation(format!(
                "Payment amount cannot exceed {} USDC",
                self.policy.max_amount
            )));
        }
        Ok(())
    }

    /// Reserve a record and attempt the transfer once.
    ///
    /// `Ok` only when the record reached `completed`.
    pub async fn settle(
        &self,
        request: SettlementRequest,
        actor: Option<&UserId>,
    ) -> Result<SettlementTransaction, MarketError> {
        self.validate_amount(request.amount)?;

        let now = Utc::now();
        let tx = SettlementTransaction {
            id: TransactionId::new(),
            assignment_id: request.assignment_id,
            recipient: request.recipient,
            to_address: request.to_address,
            amount: request.amount,
            platform_fee: request.amount.fee(self.policy.fee_rate),
            network: self.policy.network.clone(),
            status: SettlementStatus::Pending,
            transaction_hash: None,
            from_address: None,
            retry_count: 0,
            error_detail: None,
            metadata: request.metadata,
            created_at: now,
            processed_at: None,
            completed_at: None,
            updated_at: now,
        };
        self.store.reserve_settlement(&tx).await?;

        tracing::info!(
            transaction_id = %tx.id,
            assignment_id = %tx.assignment_id,
            amount = %tx.amount,
            platform_fee = %tx.platform_fee,
            "Settlement reserved"
        );

        if let Err(e) = self.audit_initiated(&tx, actor).await {
            // No transfer happens without its audit entry
            self.store
                .update_settlement(
                    tx.id,
                    &[SettlementStatus::Pending],
                    SettlementUpdate::Failed {
                        detail: format!("audit write failed before transfer: {}", e),
                    },
                )
                .await?;
            return Err(MarketError::Audit(e.to_string()));
        }

        self.attempt(tx, SettlementStatus::Pending, actor).await
    }

    /// Re-attempt a `failed` record with its original idempotency key.
    pub async fn retry(
        &self,
        id: TransactionId,
        actor: Option<&UserId>,
    ) -> Result<SettlementTransaction, MarketError> {
        let tx = self.load(id).await?;
        if tx.status != SettlementStatus::Failed {
            return Err(MarketError::InvalidState {
                resource: "settlement",
                current: tx.status.to_string(),
                required: SettlementStatus::Failed.to_string(),
            });
        }
        if tx.retry_count >= self.policy.max_attempts {
            return Err(MarketError::settlement(
                id,
                SettlementFailureKind::Permanent,
                format!(
                    "maximum of {} transfer attempts reached",
                    self.policy.max_attempts
                ),
            ));
        }

        // Only one concurrent retry wins this claim
        let claimed = self
            .store
            .update_settlement(id, &[SettlementStatus::Failed], SettlementUpdate::Processing)
            .await
            .map_err(|e| match e {
                StoreError::SettlementState { current } => MarketError::InvalidState {
                    resource: "settlement",
                    current: current.to_string(),
                    required: SettlementStatus::Failed.to_string(),
                },
                StoreError::AssignmentState { current } => {
                    MarketError::assignment_state(current, &[AssignmentStatus::Submitted])
                }
                other => other.into(),
            })?;

        if let Err(e) = self.audit_initiated(&claimed, actor).await {
            self.store
                .update_settlement(
                    id,
                    &[SettlementStatus::Processing],
                    SettlementUpdate::Failed {
                        detail: format!("audit write failed before transfer: {}", e),
                    },
                )
                .await?;
            return Err(MarketError::Audit(e.to_string()));
        }
        tracing::info!(
            transaction_id = %id,
            attempt = claimed.retry_count + 1,
            "Retrying settlement"
        );
        self.attempt(claimed, SettlementStatus::Processing, actor).await
    }

    /// Resolve a `pending` or `processing` record against the provider.
    ///
    /// Already-completed records are returned as-is.
    pub async fn reconcile(
        &self,
        id: TransactionId,
        actor: Option<&UserId>,
    ) -> Result<SettlementTransaction, MarketError> {
        let tx = self.load(id).await?;
        if tx.status == SettlementStatus::Completed {
            return Ok(tx);
        }
        if !tx.status.is_unconfirmed() {
            return Err(MarketError::InvalidState {
                resource: "settlement",
                current: tx.status.to_string(),
                required: "pending or processing".to_string(),
            });
        }

        let lookup = tokio::time::timeout(
            self.policy.transfer_timeout,
            self.transfers.lookup(&id.idempotency_key()),
        )
        .await;
        let outcome = match lookup {
            Err(_) => Outcome::Unconfirmed {
                detail: "provider lookup timed out".to_string(),
            },
            Ok(Err(e)) => Outcome::Unconfirmed {
                detail: format!("provider lookup failed: {}", e),
            },
            Ok(Ok(Some(receipt))) => Self::classify_receipt(receipt),
            Ok(Ok(None)) => {
                // An attempt may still be in flight for a freshly touched record
                let settle_window =
                    chrono::Duration::from_std(self.policy.transfer_timeout + IN_FLIGHT_GRACE)
                        .unwrap_or_else(|_| chrono::Duration::seconds(35));
                if Utc::now() - tx.updated_at < settle_window {
                    Outcome::Unconfirmed {
                        detail: "transfer may still be in flight".to_string(),
                    }
                } else {
                    Outcome::Failed {
                        detail: "provider has no record of this transfer".to_string(),
                        transient: true,
                    }
                }
            }
        };
        let from = tx.status;
        self.record_outcome(tx, from, outcome, actor).await
    }

    /// Record an out-of-band refund of a completed payout.
    pub async fn refund(
        &self,
        id: TransactionId,
        actor: Option<&UserId>,
        note: Option<String>,
    ) -> Result<SettlementTransaction, MarketError> {
        let tx = self.load(id).await?;
        if tx.status != SettlementStatus::Completed {
            return Err(MarketError::InvalidState {
                resource: "settlement",
                current: tx.status.to_string(),
                required: SettlementStatus::Completed.to_string(),
            });
        }
        self.audit
            .record(
                NewAuditEntry::new(AuditAction::PaymentRefund, "payment", id)
                    .actor(actor)
                    .details(json!({
                        "assignment_id": tx.assignment_id,
                        "amount": tx.amount,
                        "note": note,
                    })),
            )
            .await
            .map_err(|e| MarketError::Audit(e.to_string()))?;

        let refunded = self
            .store
            .update_settlement(
                id,
                &[SettlementStatus::Completed],
                SettlementUpdate::Refunded { note },
            )
            .await?;
        tracing::info!(transaction_id = %id, amount = %refunded.amount, "Settlement refunded");
        Ok(refunded)
    }

    /// Records whose outcome is still unknown, oldest first.
    pub async fn unconfirmed(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<SettlementTransaction>, MarketError> {
        Ok(self.store.list_unconfirmed_settlements(older_than).await?)
    }

    async fn load(&self, id: TransactionId) -> Result<SettlementTransaction, MarketError> {
        self.store
            .get_settlement(id)
            .await?
            .ok_or_else(|| MarketError::NotFound(format!("settlement {}", id)))
    }

    async fn audit_initiated(
        &self,
        tx: &SettlementTransaction,
        actor: Option<&UserId>,
    ) -> Result<(), StoreError> {
        self.audit
            .record(
                NewAuditEntry::new(AuditAction::PaymentInitiated, "payment", tx.id)
                    .actor(actor)
                    .details(json!({
                        "assignment_id": tx.assignment_id,
                        "recipient": tx.recipient,
                        "to_address": tx.to_address,
                        "amount": tx.amount,
                        "platform_fee": tx.platform_fee,
                        "network": tx.network,
                        "attempt": tx.retry_count + 1,
                    })),
            )
            .await
            .map(|_| ())
    }

    /// Write the entry for an outcome that is already persisted.
    async fn audit_outcome(
        &self,
        tx: &SettlementTransaction,
        entry: NewAuditEntry,
    ) -> Result<(), MarketError> {
        self.audit.record(entry).await.map(|_| ()).map_err(|e| {
            MarketError::Audit(format!(
                "settlement {} is {} but its audit entry was not written: {}",
                tx.id, tx.status, e
            ))
        })
    }

    /// One transfer call under the timeout, then persist the outcome.
    async fn attempt(
        &self,
        tx: SettlementTransaction,
        from: SettlementStatus,
        actor: Option<&UserId>,
    ) -> Result<SettlementTransaction, MarketError> {
        let request = TransferRequest {
            idempotency_key: tx.id.idempotency_key(),
            to: tx.to_address.clone(),
            amount: tx.amount,
            network: tx.network.clone(),
        };

        let outcome =
            match tokio::time::timeout(self.policy.transfer_timeout, self.transfers.transfer(&request)).await {
                Err(_) => Outcome::Unconfirmed {
                    detail: format!(
                        "transfer timed out after {}s",
                        self.policy.transfer_timeout.as_secs()
                    ),
                },
                Ok(Ok(receipt)) => Self::classify_receipt(receipt),
                Ok(Err(e)) if e.outcome_unknown() => Outcome::Unconfirmed { detail: e.to_string() },
                Ok(Err(e)) => Outcome::Failed {
                    transient: e.is_transient(),
                    detail: e.to_string(),
                },
            };
        self.record_outcome(tx, from, outcome, actor).await
    }

    fn classify_receipt(receipt: TransferReceipt) -> Outcome {
        match (receipt.status, receipt.transaction_hash) {
            (TransferStatus::Confirmed, Some(hash)) if !hash.is_empty() => Outcome::Completed {
                transaction_hash: hash,
                from_address: receipt.from_address,
            },
            (TransferStatus::Confirmed, _) => Outcome::Unconfirmed {
                detail: "provider confirmed without a transaction hash".to_string(),
            },
            (TransferStatus::Pending, _) => Outcome::Unconfirmed {
                detail: "provider reports the transfer as pending".to_string(),
            },
            (TransferStatus::Failed(reason), _) => Outcome::Failed {
                detail: reason,
                transient: true,
            },
        }
    }

    async fn record_outcome(
        &self,
        tx: SettlementTransaction,
        from: SettlementStatus,
        outcome: Outcome,
        actor: Option<&UserId>,
    ) -> Result<SettlementTransaction, MarketError> {
        let id = tx.id;
        match outcome {
            Outcome::Completed {
                transaction_hash,
                from_address,
            } => {
                let done = self
                    .store
                    .update_settlement(
                        id,
                        &[from],
                        SettlementUpdate::Completed {
                            transaction_hash,
                            from_address,
                        },
                    )
                    .await?;
                tracing::info!(
                    transaction_id = %id,
                    hash = done.transaction_hash.as_deref().unwrap_or_default(),
                    amount = %done.amount,
                    "Settlement completed"
                );
                self.audit_outcome(
                    &done,
                    NewAuditEntry::new(AuditAction::PaymentCompleted, "payment", id)
                        .actor(actor)
                        .details(json!({
                            "assignment_id": done.assignment_id,
                            "transaction_hash": done.transaction_hash,
                            "amount": done.amount,
                        })),
                )
                .await?;
                Ok(done)
            }
            Outcome::Failed { detail, transient } => {
                let failed = self
                    .store
                    .update_settlement(id, &[from], SettlementUpdate::Failed { detail: detail.clone() })
                    .await?;
                tracing::warn!(
                    transaction_id = %id,
                    retry_count = failed.retry_count,
                    error = %detail,
                    "Settlement failed"
                );
                self.audit_outcome(
                    &failed,
                    NewAuditEntry::new(AuditAction::PaymentFailed, "payment", id)
                        .actor(actor)
                        .details(json!({
                            "assignment_id": failed.assignment_id,
                            "retry_count": failed.retry_count,
                        }))
                        .failed(detail.clone()),
                )
                .await?;
                let kind = if transient && failed.retry_count < self.policy.max_attempts {
                    SettlementFailureKind::Retryable
                } else {
                    SettlementFailureKind::Permanent
                };
                Err(MarketError::settlement(id, kind, detail))
            }
            Outcome::Unconfirmed { detail } => {
                let pending = self
                    .store
                    .update_settlement(
                        id,
                        &[from],
                        SettlementUpdate::Unconfirmed { detail: detail.clone() },
                    )
                    .await?;
                tracing::warn!(transaction_id = %id, detail = %detail, "Settlement unconfirmed");
                self.audit_outcome(
                    &pending,
                    NewAuditEntry::new(AuditAction::PaymentPending, "payment", id)
                        .actor(actor)
                        .details(json!({ "assignment_id": tx.assignment_id, "detail": detail })),
                )
                .await?;
                Err(MarketError::settlement(id, SettlementFailureKind::Unconfirmed, detail))
            }
        }
    }
}
