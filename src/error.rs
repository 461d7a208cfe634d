//! Error type returned by every marketplace operation.

use std::fmt;

use crate::model::{AssignmentStatus, TaskId, TransactionId};
use crate::money::AmountError;
use crate::source::SourceError;
use crate::store::StoreError;
use crate::wallet::AddressError;

#[derive(Debug, Clone, thiserror::Error)]
pub enum MarketError {
    #[error("{0}")]
    Validation(String),

    #[error("{resource} is {current}, expected {required}")]
    InvalidState {
        resource: &'static str,
        current: String,
        required: String,
    },

    #[error("{0}")]
    Forbidden(String),

    #[error("task {0} is no longer available, pick another")]
    AlreadyClaimed(TaskId),

    #[error(transparent)]
    Settlement(SettlementFailure),

    #[error("{0} not found")]
    NotFound(String),

    #[error("labeling tool error: {0}")]
    Source(#[from] SourceError),

    #[error("audit log write failed: {0}")]
    Audit(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// How a settlement attempt ended when it did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementFailureKind {
    /// Definitely not paid; `retry` may succeed
    Retryable,
    /// Definitely not paid; retrying will not help
    Permanent,
    /// Outcome unknown; the record stays pending until reconciled
    Unconfirmed,
}

impl fmt::Display for SettlementFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettlementFailureKind::Retryable => f.write_str("failed (retryable)"),
            SettlementFailureKind::Permanent => f.write_str("failed permanently"),
            SettlementFailureKind::Unconfirmed => f.write_str("is unconfirmed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("settlement {transaction_id} {kind}: {reason}")]
pub struct SettlementFailure {
    pub transaction_id: TransactionId,
    pub kind: SettlementFailureKind,
    pub reason: String,
}

impl MarketError {
    pub fn validation(message: impl Into<String>) -> Self {
        MarketError::Validation(message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        MarketError::Forbidden(message.into())
    }

    pub fn settlement(
        transaction_id: TransactionId,
        kind: SettlementFailureKind,
        reason: impl Into<String>,
    ) -> Self {
        MarketError::Settlement(SettlementFailure {
            transaction_id,
            kind,
            reason: reason.into(),
        })
    }

    /// Assignment was not in any of the `required` states.
    pub fn assignment_state(current: AssignmentStatus, required: &[AssignmentStatus]) -> Self {
        MarketError::InvalidState {
            resource: "assignment",
            current: current.to_string(),
            required: required
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(" or "),
        }
    }

    /// Store error raised while moving an assignment out of `required`.
    pub fn from_transition(e: StoreError, required: &[AssignmentStatus]) -> Self {
        match e {
            StoreError::AssignmentState { current } => MarketError::assignment_state(current, required),
            other => other.into(),
        }
    }
}

impl From<StoreError> for MarketError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { entity, id } => MarketError::NotFound(format!("{} {}", entity, id)),
            StoreError::TaskUnavailable(id) => MarketError::AlreadyClaimed(id),
            StoreError::TaskInUse(id) => MarketError::InvalidState {
                resource: "task",
                current: format!("{} (has assignment history)", id),
                required: "never claimed".to_string(),
            },
            StoreError::AssignmentState { current } => MarketError::InvalidState {
                resource: "assignment",
                current: current.to_string(),
                required: "a different state".to_string(),
            },
            StoreError::SettlementState { current } => MarketError::InvalidState {
                resource: "settlement",
                current: current.to_string(),
                required: "a different state".to_string(),
            },
            StoreError::SettlementExists(id) => MarketError::InvalidState {
                resource: "assignment",
                current: format!("held by settlement {}", id),
                required: "no open settlement".to_string(),
            },
            StoreError::Duplicate(message) => MarketError::Validation(message),
            StoreError::Backend(message) => MarketError::Storage(message),
        }
    }
}

impl From<AmountError> for MarketError {
    fn from(e: AmountError) -> Self {
        MarketError::Validation(e.to_string())
    }
}

impl From<AddressError> for MarketError {
    fn from(e: AddressError) -> Self {
        MarketError::Validation(e.to_string())
    }
}
