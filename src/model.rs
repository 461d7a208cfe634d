//! Domain records shared by the stores, the state machine and the HTTP API.
//!
//! # Assignment lifecycle
//! ```text
//! assigned -> accepted -> in_progress -> submitted -> approved
//!     \           \            \                 \-> rejected
//!      \-----------\------------\-> cancelled
//! ```
//! `approved`, `rejected` and `cancelled` are terminal. At most one
//! non-terminal assignment may reference a task at any time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::identity::UserId;
use crate::money::Usdc;
use crate::wallet::WalletAddress;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Create a fresh random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Identifier of an imported project.
    ProjectId
);
uuid_id!(
    /// Identifier of a task.
    TaskId
);
uuid_id!(
    /// Identifier of an assignment.
    AssignmentId
);
uuid_id!(
    /// Identifier of a settlement transaction. Doubles as the idempotency key
    /// handed to the transfer provider, so every replay of the same
    /// transaction carries the same key.
    TransactionId
);

impl TransactionId {
    pub fn idempotency_key(&self) -> String {
        format!("settlement-{}", self.0)
    }
}

/// Raised when a stored status string is not recognised.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown {kind} status: {value}")]
pub struct UnknownStatus {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! status_strings {
    ($ty:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = UnknownStatus;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err(UnknownStatus {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

/// Availability of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Available,
    Claimed,
}

status_strings!(TaskStatus, "task", {
    Available => "available",
    Claimed => "claimed",
});

/// Status of an assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Assigned,
    Accepted,
    InProgress,
    Submitted,
    Approved,
    Rejected,
    Cancelled,
}

status_strings!(AssignmentStatus, "assignment", {
    Assigned => "assigned",
    Accepted => "accepted",
    InProgress => "in_progress",
    Submitted => "submitted",
    Approved => "approved",
    Rejected => "rejected",
    Cancelled => "cancelled",
});

impl AssignmentStatus {
    /// States that still hold the task.
    pub const ACTIVE: &'static [AssignmentStatus] = &[
        AssignmentStatus::Assigned,
        AssignmentStatus::Accepted,
        AssignmentStatus::InProgress,
        AssignmentStatus::Submitted,
    ];

    /// Pre-submission states; the only ones `cancel` may leave.
    pub const CANCELLABLE: &'static [AssignmentStatus] = &[
        AssignmentStatus::Assigned,
        AssignmentStatus::Accepted,
        AssignmentStatus::InProgress,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AssignmentStatus::Approved | AssignmentStatus::Rejected | AssignmentStatus::Cancelled
        )
    }
}

/// Status of a settlement transaction.
///
/// ```text
/// pending -> completed
///        \-> failed -> processing -> completed
///                               \-> failed
/// completed -> refunded
/// ```
/// Records that time out stay `pending` until reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Refunded,
}

status_strings!(SettlementStatus, "settlement", {
    Pending => "pending",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
    Refunded => "refunded",
});

impl SettlementStatus {
    /// A transfer may be in flight or awaiting confirmation.
    pub fn is_unconfirmed(&self) -> bool {
        matches!(self, SettlementStatus::Pending | SettlementStatus::Processing)
    }
}

/// A project imported from the labeling tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    /// Researcher who imported the project
    pub owner: UserId,
    /// Project id in the labeling tool
    pub source_project_id: i64,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Total budget allocated to the project
    pub budget: Usdc,
    /// Budget divided across the project's tasks
    pub price_per_task: Usdc,
    /// Whether annotators may claim tasks of this project
    pub published: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A unit of annotation work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub project_id: ProjectId,
    /// Task id in the labeling tool
    pub source_task_id: i64,
    /// Opaque payload from the labeling tool; never inspected here
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    pub price: Usdc,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        project_id: ProjectId,
        source_task_id: i64,
        payload: serde_json::Value,
        price: Usdc,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            project_id,
            source_task_id,
            payload,
            status: TaskStatus::Available,
            price,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One annotator's attempt at one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub id: AssignmentId,
    pub task_id: TaskId,
    pub project_id: ProjectId,
    pub annotator: UserId,
    pub status: AssignmentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    /// Settlement that paid for this assignment (set on approval)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settlement_id: Option<TransactionId>,
    pub assigned_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub submitted_at: Option<DateTime<Utc>>,
    /// Set when the assignment is approved or rejected
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Assignment {
    /// A fresh assignment in `assigned` for the given task.
    pub fn new(task: &Task, annotator: UserId) -> Self {
        let now = Utc::now();
        Self {
            id: AssignmentId::new(),
            task_id: task.id,
            project_id: task.project_id,
            annotator,
            status: AssignmentStatus::Assigned,
            result: None,
            quality_score: None,
            feedback: None,
            settlement_id: None,
            assigned_at: now,
            accepted_at: None,
            started_at: None,
            submitted_at: None,
            completed_at: None,
            cancelled_at: None,
            updated_at: now,
        }
    }
}

/// A state change applied to a single assignment.
///
/// Stores apply these as conditional updates: the change only lands if the
/// assignment is still in one of the expected source states.
#[derive(Debug, Clone)]
pub enum AssignmentChange {
    Accept,
    Start,
    Submit {
        result: serde_json::Value,
    },
    Approve {
        settlement_id: TransactionId,
        quality_score: Option<f64>,
        feedback: Option<String>,
    },
    Reject {
        reason: Option<String>,
    },
    Cancel,
}

impl AssignmentChange {
    pub fn target(&self) -> AssignmentStatus {
        match self {
            AssignmentChange::Accept => AssignmentStatus::Accepted,
            AssignmentChange::Start => AssignmentStatus::InProgress,
            AssignmentChange::Submit { .. } => AssignmentStatus::Submitted,
            AssignmentChange::Approve { .. } => AssignmentStatus::Approved,
            AssignmentChange::Reject { .. } => AssignmentStatus::Rejected,
            AssignmentChange::Cancel => AssignmentStatus::Cancelled,
        }
    }

    /// Source states this change may leave.
    pub fn allowed_from(&self) -> &'static [AssignmentStatus] {
        use AssignmentStatus::*;
        match self {
            AssignmentChange::Accept => &[Assigned],
            AssignmentChange::Start => &[Assigned, Accepted],
            AssignmentChange::Submit { .. } => &[Assigned, Accepted, InProgress],
            AssignmentChange::Approve { .. } | AssignmentChange::Reject { .. } => &[Submitted],
            AssignmentChange::Cancel => AssignmentStatus::CANCELLABLE,
        }
    }

    /// Write the change into `assignment`. The caller has already checked the
    /// source state.
    pub fn apply(&self, assignment: &mut Assignment, now: DateTime<Utc>) {
        assignment.status = self.target();
        assignment.updated_at = now;
        match self {
            AssignmentChange::Accept => assignment.accepted_at = Some(now),
            AssignmentChange::Start => assignment.started_at = Some(now),
            AssignmentChange::Submit { result } => {
                assignment.result = Some(result.clone());
                assignment.submitted_at = Some(now);
            }
            AssignmentChange::Approve {
                settlement_id,
                quality_score,
                feedback,
            } => {
                assignment.settlement_id = Some(*settlement_id);
                assignment.quality_score = *quality_score;
                assignment.feedback = feedback.clone();
                assignment.completed_at = Some(now);
            }
            AssignmentChange::Reject { reason } => {
                assignment.feedback = reason.clone();
                assignment.completed_at = Some(now);
            }
            AssignmentChange::Cancel => assignment.cancelled_at = Some(now),
        }
    }
}

/// Immutable financial record of one payout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementTransaction {
    pub id: TransactionId,
    /// Never re-pointed once written
    pub assignment_id: AssignmentId,
    pub recipient: UserId,
    pub to_address: WalletAddress,
    pub amount: Usdc,
    /// Platform share recorded alongside the payout (not deducted)
    pub platform_fee: Usdc,
    pub network: String,
    pub status: SettlementStatus,
    /// Only set once the transfer is confirmed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_address: Option<String>,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    /// Review data carried from approval to finalization
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome written back onto a settlement record after a transfer attempt.
#[derive(Debug, Clone)]
pub enum SettlementUpdate {
    /// Retry claimed the record; a transfer is about to be attempted.
    Processing,
    Completed {
        transaction_hash: String,
        from_address: Option<String>,
    },
    /// Definite failure; bumps the retry count.
    Failed { detail: String },
    /// Outcome unknown; stays (or returns to) pending.
    Unconfirmed { detail: String },
    Refunded { note: Option<String> },
}

impl SettlementUpdate {
    pub fn target(&self) -> SettlementStatus {
        match self {
            SettlementUpdate::Processing => SettlementStatus::Processing,
            SettlementUpdate::Completed { .. } => SettlementStatus::Completed,
            SettlementUpdate::Failed { .. } => SettlementStatus::Failed,
            SettlementUpdate::Unconfirmed { .. } => SettlementStatus::Pending,
            SettlementUpdate::Refunded { .. } => SettlementStatus::Refunded,
        }
    }

    pub fn apply(&self, tx: &mut SettlementTransaction, now: DateTime<Utc>) {
        tx.status = self.target();
        tx.updated_at = now;
        match self {
            SettlementUpdate::Processing => {
                tx.processed_at = Some(now);
                tx.error_detail = None;
            }
            SettlementUpdate::Completed {
                transaction_hash,
                from_address,
            } => {
                tx.transaction_hash = Some(transaction_hash.clone());
                tx.from_address = from_address.clone();
                tx.completed_at = Some(now);
                tx.error_detail = None;
            }
            SettlementUpdate::Failed { detail } => {
                tx.error_detail = Some(detail.clone());
                tx.retry_count = tx.retry_count.saturating_add(1);
            }
            SettlementUpdate::Unconfirmed { detail } => {
                tx.error_detail = Some(detail.clone());
            }
            SettlementUpdate::Refunded { note } => {
                if note.is_some() {
                    tx.error_detail = note.clone();
                }
            }
        }
    }
}

/// Payout address registered by an annotator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletRecord {
    pub user_id: UserId,
    pub address: WalletAddress,
    pub updated_at: DateTime<Utc>,
}
