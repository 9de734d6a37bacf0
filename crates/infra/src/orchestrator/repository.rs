//! Execution repository: one event stream per job.
//!
//! ```text
//! load stream → validate ordering → rehydrate JobExecution
//! command → handle (pure) → append with ExpectedVersion::Exact(version) → apply
//! ```
//!
//! The version check makes every step a compare-and-swap on the stream, so two drivers
//! racing on the same job cannot both commit a step.

use tracing::info;
use uuid::Uuid;

use jobflow_core::{Aggregate, AggregateId, AggregateRoot, ExpectedVersion, JobId};
use jobflow_events::Event;
use jobflow_lifecycle::{JobCommand, JobEvent, JobExecution};

use super::error::OrchestratorError;
use crate::event_store::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};

pub const AGGREGATE_TYPE: &str = "job.execution";

#[derive(Debug)]
pub struct ExecutionRepository<S> {
    store: S,
}

impl<S: EventStore> ExecutionRepository<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Rebuild the execution from its stream. An unknown job yields an empty,
    /// not-yet-submitted execution.
    pub fn load(&self, job_id: JobId) -> Result<JobExecution, OrchestratorError> {
        let aggregate_id = AggregateId::from(job_id);
        let history = self.store.load_stream(aggregate_id)?;
        validate_loaded_stream(aggregate_id, &history)?;

        let mut execution = JobExecution::empty(job_id);
        for stored in history {
            let event: JobEvent = serde_json::from_value(stored.payload).map_err(|e| {
                OrchestratorError::Deserialize(format!(
                    "event {} of job {job_id}: {e}",
                    stored.sequence_number
                ))
            })?;
            execution.apply(&event);
        }
        Ok(execution)
    }

    /// Decide, persist and apply one command. A no-op command returns the execution
    /// unchanged without touching the store.
    pub fn execute(
        &self,
        execution: &JobExecution,
        command: &JobCommand,
    ) -> Result<JobExecution, OrchestratorError> {
        let decided = execution.handle(command)?;
        if decided.is_empty() {
            return Ok(execution.clone());
        }

        let aggregate_id = AggregateId::from(execution.id_typed());
        let uncommitted = decided
            .iter()
            .map(|event| {
                UncommittedEvent::from_typed(aggregate_id, AGGREGATE_TYPE, Uuid::now_v7(), event)
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.store
            .append(uncommitted, ExpectedVersion::Exact(execution.version()))?;

        let mut next = execution.clone();
        for event in &decided {
            next.apply(event);
            info!(
                job_id = %next.id_typed(),
                event = event.event_type(),
                state = next.state().as_str(),
                version = next.version(),
                "execution advanced"
            );
        }
        Ok(next)
    }

    /// Every job that has an execution stream, oldest first.
    pub fn job_ids(&self) -> Result<Vec<JobId>, OrchestratorError> {
        Ok(self
            .store
            .list_streams(AGGREGATE_TYPE)?
            .into_iter()
            .map(JobId::from)
            .collect())
    }
}

fn validate_loaded_stream(
    aggregate_id: AggregateId,
    stream: &[StoredEvent],
) -> Result<(), OrchestratorError> {
    let mut last = 0u64;
    for (idx, e) in stream.iter().enumerate() {
        if e.aggregate_id != aggregate_id || e.aggregate_type != AGGREGATE_TYPE {
            return Err(EventStoreError::AggregateTypeMismatch(format!(
                "loaded stream contains a foreign event at index {idx}"
            ))
            .into());
        }
        if e.sequence_number <= last {
            return Err(EventStoreError::InvalidAppend(format!(
                "non-monotonic sequence_number in loaded stream (last={last}, found={})",
                e.sequence_number
            ))
            .into());
        }
        last = e.sequence_number;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::InMemoryEventStore;
    use chrono::Utc;
    use jobflow_core::{ConsumerId, Currency, Money};
    use jobflow_lifecycle::JobState;

    fn submit(repo: &ExecutionRepository<InMemoryEventStore>, job_id: JobId) -> JobExecution {
        repo.execute(
            &JobExecution::empty(job_id),
            &JobCommand::Submit {
                job_id,
                consumer_id: ConsumerId::new(),
                at: Utc::now(),
            },
        )
        .unwrap()
    }

    #[test]
    fn execute_persists_and_load_replays() {
        let repo = ExecutionRepository::new(InMemoryEventStore::new());
        let job_id = JobId::new();
        let submitted = submit(&repo, job_id);
        let priced = repo
            .execute(
                &submitted,
                &JobCommand::RecordPrice {
                    amount: Money::from_minor(10_000, Currency::Usd),
                    at: Utc::now(),
                },
            )
            .unwrap();

        let loaded = repo.load(job_id).unwrap();
        assert_eq!(loaded, priced);
        assert_eq!(loaded.state(), JobState::Priced);
        assert_eq!(loaded.version(), 2);
        assert_eq!(repo.job_ids().unwrap(), vec![job_id]);
    }

    #[test]
    fn stale_execution_cannot_commit() {
        let repo = ExecutionRepository::new(InMemoryEventStore::new());
        let job_id = JobId::new();
        let submitted = submit(&repo, job_id);
        let price = JobCommand::RecordPrice {
            amount: Money::from_minor(500, Currency::Usd),
            at: Utc::now(),
        };
        repo.execute(&submitted, &price).unwrap();

        let err = repo.execute(&submitted, &price).unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Store(EventStoreError::Concurrency(_))
        ));
    }

    #[test]
    fn duplicate_submission_is_rejected() {
        let repo = ExecutionRepository::new(InMemoryEventStore::new());
        let job_id = JobId::new();
        let submitted = submit(&repo, job_id);
        let err = repo
            .execute(
                &submitted,
                &JobCommand::Submit {
                    job_id,
                    consumer_id: ConsumerId::new(),
                    at: Utc::now(),
                },
            )
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Domain(_)));
    }
}
