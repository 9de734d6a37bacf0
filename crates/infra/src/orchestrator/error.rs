use thiserror::Error;

use jobflow_core::{DomainError, JobId};

use crate::activities::ActivityError;
use crate::escrow::EscrowError;
use crate::event_store::EventStoreError;
use crate::matching::MatchingError;
use crate::retry::RetryStoreError;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("no execution for job {0}")]
    NotFound(JobId),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] EventStoreError),

    /// A stored event could not be decoded into a `JobEvent`.
    #[error("corrupt execution history: {0}")]
    Deserialize(String),

    #[error(transparent)]
    Escrow(#[from] EscrowError),

    #[error(transparent)]
    Activity(#[from] ActivityError),

    #[error(transparent)]
    Matching(#[from] MatchingError),

    #[error(transparent)]
    RetryQueue(#[from] RetryStoreError),

    /// The operation does not apply to the job in its current state.
    #[error("invalid job state: {0}")]
    InvalidState(String),

    #[error("execution of job {0} did not settle after {1} steps")]
    Stalled(JobId, usize),
}

impl OrchestratorError {
    /// Whether repeating the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            OrchestratorError::Store(EventStoreError::Concurrency(_))
            | OrchestratorError::Store(EventStoreError::Storage(_))
            | OrchestratorError::Matching(_)
            | OrchestratorError::RetryQueue(_) => true,
            OrchestratorError::Escrow(e) => e.is_retryable(),
            OrchestratorError::Activity(e) => e.is_retryable(),
            _ => false,
        }
    }
}
