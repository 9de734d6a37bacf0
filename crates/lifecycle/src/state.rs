use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use jobflow_core::DomainError;

/// Lifecycle state of a job execution.
///
/// ```text
/// draft → priced → offer_sent → accepted → worker_assigned → scheduled → in_progress
///                            ↘ rejected  ↘ no_worker_available
/// in_progress → completed → paid → review_pending → closed
///                         ↘ payment_failed → paid
/// ```
///
/// Any non-terminal state may also move to `cancelled` or `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Draft,
    Priced,
    OfferSent,
    Accepted,
    Rejected,
    WorkerAssigned,
    NoWorkerAvailable,
    Scheduled,
    InProgress,
    Completed,
    Paid,
    PaymentFailed,
    ReviewPending,
    Closed,
    Cancelled,
    /// An unrecoverable step failure aborted the execution.
    Failed,
}

impl JobState {
    /// No further transition can leave a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Rejected | Self::NoWorkerAvailable | Self::Closed | Self::Cancelled | Self::Failed
        )
    }

    /// `payment_failed` halts the main timeline but can still be settled out of band.
    pub fn is_recoverable_halt(&self) -> bool {
        matches!(self, Self::PaymentFailed)
    }

    /// States whose only successor on the happy path is produced by an external actor.
    pub fn awaits_external_actor(&self) -> bool {
        matches!(
            self,
            Self::OfferSent | Self::Scheduled | Self::InProgress | Self::ReviewPending
        )
    }

    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;

        if self.is_terminal() {
            return false;
        }
        if matches!(next, Cancelled | Failed) {
            return true;
        }

        matches!(
            (self, next),
            (Draft, Priced)
                | (Priced, OfferSent)
                | (OfferSent, Accepted)
                | (OfferSent, Rejected)
                | (Accepted, WorkerAssigned)
                | (Accepted, NoWorkerAvailable)
                | (WorkerAssigned, Scheduled)
                | (Scheduled, InProgress)
                | (InProgress, Completed)
                | (Completed, Paid)
                | (Completed, PaymentFailed)
                | (PaymentFailed, Paid)
                | (Paid, ReviewPending)
                | (ReviewPending, Closed)
        )
    }

    pub fn ensure_transition(&self, next: JobState) -> Result<(), DomainError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(DomainError::invalid_transition(self, next))
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Priced => "priced",
            Self::OfferSent => "offer_sent",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::WorkerAssigned => "worker_assigned",
            Self::NoWorkerAvailable => "no_worker_available",
            Self::Scheduled => "scheduled",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Paid => "paid",
            Self::PaymentFailed => "payment_failed",
            Self::ReviewPending => "review_pending",
            Self::Closed => "closed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    pub const ALL: [JobState; 16] = [
        Self::Draft,
        Self::Priced,
        Self::OfferSent,
        Self::Accepted,
        Self::Rejected,
        Self::WorkerAssigned,
        Self::NoWorkerAvailable,
        Self::Scheduled,
        Self::InProgress,
        Self::Completed,
        Self::Paid,
        Self::PaymentFailed,
        Self::ReviewPending,
        Self::Closed,
        Self::Cancelled,
        Self::Failed,
    ];
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("invalid job state: {s}")))
    }
}
