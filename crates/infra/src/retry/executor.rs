//! One sweep over the retry queue: run what is due, reschedule failures, dead-letter
//! what is exhausted.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::store::{RetryStoreError, RetryTaskStore};
use super::types::{DeadLetterEntry, PaymentRetryTask, TaskResult, TaskStatus};

/// Work performed for each due task.
pub trait RetryHandler: Send + Sync {
    fn handle(&self, task: &PaymentRetryTask) -> TaskResult;

    /// Called once when a task is dead-lettered.
    fn dead_lettered(&self, _entry: &DeadLetterEntry) {}
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct SweepStats {
    pub tasks_processed: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub tasks_dead_lettered: u64,
    pub tasks_obsolete: u64,
}

/// Run every task due at `now` once. Tasks rescheduled during the sweep are due later
/// than `now`, so the sweep terminates.
pub fn run_due(
    store: &dyn RetryTaskStore,
    handler: &dyn RetryHandler,
    now: DateTime<Utc>,
) -> Result<SweepStats, RetryStoreError> {
    let mut stats = SweepStats::default();
    while let Some(mut task) = store.claim_due(now)? {
        stats.tasks_processed += 1;
        debug!(task_id = %task.id, job_id = %task.job_id, attempt = task.attempt, "running payment retry");

        match handler.handle(&task) {
            TaskResult::Success => {
                stats.tasks_succeeded += 1;
                task.mark_completed(now);
                info!(task_id = %task.id, job_id = %task.job_id, "payment retry settled the job");
            }
            TaskResult::Obsolete => {
                stats.tasks_obsolete += 1;
                task.mark_cancelled(now);
            }
            TaskResult::Failure(reason) => {
                stats.tasks_failed += 1;
                task.mark_failed(reason, now);
            }
            TaskResult::Fatal(reason) => {
                stats.tasks_failed += 1;
                task.mark_dead(reason, now);
            }
        }
        store.update(&task)?;

        let TaskStatus::DeadLettered { error, attempts } = &task.status else {
            continue;
        };
        warn!(task_id = %task.id, job_id = %task.job_id, attempts, error = %error, "payment retry dead-lettered");
        let entry = DeadLetterEntry {
            reason: error.clone(),
            dead_lettered_at: now,
            task: task.clone(),
        };
        store.dead_letter(entry.clone())?;
        handler.dead_lettered(&entry);
        stats.tasks_dead_lettered += 1;
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::store::InMemoryRetryTaskStore;
    use crate::retry::types::RetryPolicy;
    use jobflow_core::{JobId, TransactionId};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct Flaky {
        failures_left: AtomicU32,
        dead: AtomicU32,
    }

    impl RetryHandler for Flaky {
        fn handle(&self, _task: &PaymentRetryTask) -> TaskResult {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left == 0 {
                return TaskResult::Success;
            }
            self.failures_left.store(left - 1, Ordering::SeqCst);
            TaskResult::Failure("gateway 500".into())
        }

        fn dead_lettered(&self, _entry: &DeadLetterEntry) {
            self.dead.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn flaky(failures: u32) -> Flaky {
        Flaky {
            failures_left: AtomicU32::new(failures),
            dead: AtomicU32::new(0),
        }
    }

    #[test]
    fn retries_until_success() {
        let store = InMemoryRetryTaskStore::new();
        let now = Utc::now();
        let policy = RetryPolicy::fixed(5, Duration::from_secs(60));
        let task = PaymentRetryTask::new(JobId::new(), TransactionId::new(), policy, now);
        store.enqueue(task.clone()).unwrap();
        let handler = flaky(2);

        let mut at = now;
        for _ in 0..3 {
            at += chrono::Duration::seconds(60);
            run_due(&store, &handler, at).unwrap();
        }

        let done = store.get(task.id).unwrap().unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.attempt, 3);
        assert!(store.dead_letters().unwrap().is_empty());
    }

    #[test]
    fn exhausted_task_is_dead_lettered_once() {
        let store = InMemoryRetryTaskStore::new();
        let now = Utc::now();
        let policy = RetryPolicy::fixed(2, Duration::from_secs(60));
        let task = PaymentRetryTask::new(JobId::new(), TransactionId::new(), policy, now);
        store.enqueue(task.clone()).unwrap();
        let handler = flaky(10);

        let far = now + chrono::Duration::days(1);
        let first = run_due(&store, &handler, far).unwrap();
        let second = run_due(&store, &handler, far + chrono::Duration::days(1)).unwrap();
        run_due(&store, &handler, far + chrono::Duration::days(2)).unwrap();

        assert_eq!(first.tasks_failed, 1);
        assert_eq!(second.tasks_dead_lettered, 1);
        assert_eq!(store.dead_letters().unwrap().len(), 1);
        assert_eq!(handler.dead.load(Ordering::SeqCst), 1);
    }
}
