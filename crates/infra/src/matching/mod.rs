//! Worker matching with bounded retries.
//!
//! One call to [`MatchingLoop::attempt`] is one attempt: rank the free workers, then
//! reserve the best one with a conditional update. Losing a reservation race moves on
//! to the next candidate within the same attempt. An empty attempt yields a retry
//! instant (`attempt × step`) that the execution persists as a backoff timer, so the
//! wait between attempts is a suspension point rather than a sleeping thread.

pub mod policy;
pub mod pool;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};

use jobflow_core::{JobId, WorkerId};
use jobflow_lifecycle::MatchOutcome;

use crate::retry::RetryPolicy;

pub use policy::SelectionPolicy;
pub use pool::{InMemoryWorkerPool, Worker, WorkerDirectory};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MatchingError {
    #[error("unknown worker: {0}")]
    UnknownWorker(WorkerId),

    #[error("worker directory unavailable: {0}")]
    Directory(String),
}

pub struct MatchingLoop<D> {
    directory: D,
    selection: SelectionPolicy,
    retry: RetryPolicy,
}

impl<D: WorkerDirectory> MatchingLoop<D> {
    /// `retry` bounds the attempts and spaces them; the default wiring uses
    /// `RetryPolicy::linear(5, 5 minutes)`.
    pub fn new(directory: D, selection: SelectionPolicy, retry: RetryPolicy) -> Self {
        Self {
            directory,
            selection,
            retry,
        }
    }

    pub fn directory(&self) -> &D {
        &self.directory
    }

    /// Run attempt number `attempt` (1-indexed) for `job_id`.
    ///
    /// Directory failures count as an empty attempt.
    pub fn attempt(&self, job_id: JobId, attempt: u32, now: DateTime<Utc>) -> MatchOutcome {
        match self.find_and_reserve(job_id) {
            Ok(Some(worker_id)) => {
                info!(job_id = %job_id, worker_id = %worker_id, attempt, "worker reserved");
                return MatchOutcome::Assigned { worker_id };
            }
            Ok(None) => {
                warn!(job_id = %job_id, attempt, "no available worker");
            }
            Err(e) => {
                warn!(job_id = %job_id, attempt, error = %e, "matching attempt failed");
            }
        }

        if self.retry.should_retry(attempt) {
            MatchOutcome::RetryAt {
                retry_at: self.retry.retry_at(attempt, now),
            }
        } else {
            MatchOutcome::Exhausted
        }
    }

    /// Return a reserved worker to the pool.
    pub fn release(&self, worker_id: WorkerId, job_id: JobId) -> Result<(), MatchingError> {
        self.directory.release(worker_id, job_id)
    }

    fn find_and_reserve(&self, job_id: JobId) -> Result<Option<WorkerId>, MatchingError> {
        // A reservation made before a crash, but never recorded, is still ours.
        if let Some(held) = self.directory.reserved_for(job_id)? {
            return Ok(Some(held));
        }

        for candidate in self.selection.rank(self.directory.available()?) {
            if self.directory.reserve(candidate.id, job_id)? {
                return Ok(Some(candidate.id));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::collections::HashSet;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    fn matching(pool: Arc<InMemoryWorkerPool>) -> MatchingLoop<Arc<InMemoryWorkerPool>> {
        MatchingLoop::new(
            pool,
            SelectionPolicy::HighestRated,
            RetryPolicy::linear(5, Duration::from_secs(300)),
        )
    }

    #[test]
    fn picks_the_highest_rated_worker() {
        let pool = Arc::new(InMemoryWorkerPool::new());
        let now = Utc::now();
        pool.register(Worker::new(dec!(3.2), now)).unwrap();
        let best = pool.register(Worker::new(dec!(4.8), now)).unwrap();

        let outcome = matching(pool.clone()).attempt(JobId::new(), 1, now);
        assert_eq!(outcome, MatchOutcome::Assigned { worker_id: best });
        assert!(!pool.get(best).unwrap().unwrap().available);
    }

    #[test]
    fn empty_attempts_back_off_linearly_then_exhaust() {
        let pool = Arc::new(InMemoryWorkerPool::new());
        let matching = matching(pool);
        let now = Utc::now();
        let job = JobId::new();

        for attempt in 1..5u32 {
            assert_eq!(
                matching.attempt(job, attempt, now),
                MatchOutcome::RetryAt {
                    retry_at: now + chrono::Duration::minutes(5 * i64::from(attempt))
                }
            );
        }
        assert_eq!(matching.attempt(job, 5, now), MatchOutcome::Exhausted);
    }

    #[test]
    fn an_unrecorded_reservation_is_reused() {
        let pool = Arc::new(InMemoryWorkerPool::new());
        let worker = pool.register(Worker::new(dec!(4.0), Utc::now())).unwrap();
        let job = JobId::new();
        assert!(pool.reserve(worker, job).unwrap());

        let outcome = matching(pool).attempt(job, 2, Utc::now());
        assert_eq!(outcome, MatchOutcome::Assigned { worker_id: worker });
    }

    #[test]
    fn concurrent_jobs_never_share_a_worker() {
        let pool = Arc::new(InMemoryWorkerPool::new());
        let now = Utc::now();
        for rating in [dec!(4.9), dec!(4.1), dec!(3.5)] {
            pool.register(Worker::new(rating, now)).unwrap();
        }
        let matching = Arc::new(matching(pool));
        let jobs = 8;
        let barrier = Arc::new(Barrier::new(jobs));

        let handles: Vec<_> = (0..jobs)
            .map(|_| {
                let matching = matching.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    matching.attempt(JobId::new(), 1, now)
                })
            })
            .collect();

        let assigned: Vec<WorkerId> = handles
            .into_iter()
            .filter_map(|h| match h.join().unwrap() {
                MatchOutcome::Assigned { worker_id } => Some(worker_id),
                _ => None,
            })
            .collect();

        assert_eq!(assigned.len(), 3);
        assert_eq!(assigned.iter().collect::<HashSet<_>>().len(), 3);
    }
}
