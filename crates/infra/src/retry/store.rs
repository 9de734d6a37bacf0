//! Retry task storage.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use jobflow_core::JobId;

use super::types::{DeadLetterEntry, PaymentRetryTask, TaskStatus};

pub trait RetryTaskStore: Send + Sync {
    fn enqueue(&self, task: PaymentRetryTask) -> Result<Uuid, RetryStoreError>;

    fn get(&self, id: Uuid) -> Result<Option<PaymentRetryTask>, RetryStoreError>;

    fn update(&self, task: &PaymentRetryTask) -> Result<(), RetryStoreError>;

    /// Claim the oldest due task and mark it running.
    fn claim_due(&self, now: DateTime<Utc>) -> Result<Option<PaymentRetryTask>, RetryStoreError>;

    fn for_job(&self, job_id: JobId) -> Result<Vec<PaymentRetryTask>, RetryStoreError>;

    fn dead_letter(&self, entry: DeadLetterEntry) -> Result<(), RetryStoreError>;

    fn dead_letters(&self) -> Result<Vec<DeadLetterEntry>, RetryStoreError>;
}

impl<S> RetryTaskStore for Arc<S>
where
    S: RetryTaskStore + ?Sized,
{
    fn enqueue(&self, task: PaymentRetryTask) -> Result<Uuid, RetryStoreError> {
        (**self).enqueue(task)
    }

    fn get(&self, id: Uuid) -> Result<Option<PaymentRetryTask>, RetryStoreError> {
        (**self).get(id)
    }

    fn update(&self, task: &PaymentRetryTask) -> Result<(), RetryStoreError> {
        (**self).update(task)
    }

    fn claim_due(&self, now: DateTime<Utc>) -> Result<Option<PaymentRetryTask>, RetryStoreError> {
        (**self).claim_due(now)
    }

    fn for_job(&self, job_id: JobId) -> Result<Vec<PaymentRetryTask>, RetryStoreError> {
        (**self).for_job(job_id)
    }

    fn dead_letter(&self, entry: DeadLetterEntry) -> Result<(), RetryStoreError> {
        (**self).dead_letter(entry)
    }

    fn dead_letters(&self) -> Result<Vec<DeadLetterEntry>, RetryStoreError> {
        (**self).dead_letters()
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RetryStoreError {
    #[error("retry task not found: {0}")]
    NotFound(Uuid),
    #[error("retry task already exists: {0}")]
    AlreadyExists(Uuid),
    #[error("storage error: {0}")]
    Storage(String),
}

/// In-memory retry task store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryRetryTaskStore {
    tasks: RwLock<HashMap<Uuid, PaymentRetryTask>>,
    dead_letters: RwLock<Vec<DeadLetterEntry>>,
}

impl InMemoryRetryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> RetryStoreError {
    RetryStoreError::Storage("lock poisoned".to_string())
}

impl RetryTaskStore for InMemoryRetryTaskStore {
    fn enqueue(&self, task: PaymentRetryTask) -> Result<Uuid, RetryStoreError> {
        let mut tasks = self.tasks.write().map_err(poisoned)?;
        if tasks.contains_key(&task.id) {
            return Err(RetryStoreError::AlreadyExists(task.id));
        }
        let id = task.id;
        tasks.insert(id, task);
        Ok(id)
    }

    fn get(&self, id: Uuid) -> Result<Option<PaymentRetryTask>, RetryStoreError> {
        Ok(self.tasks.read().map_err(poisoned)?.get(&id).cloned())
    }

    fn update(&self, task: &PaymentRetryTask) -> Result<(), RetryStoreError> {
        let mut tasks = self.tasks.write().map_err(poisoned)?;
        if !tasks.contains_key(&task.id) {
            return Err(RetryStoreError::NotFound(task.id));
        }
        tasks.insert(task.id, task.clone());
        Ok(())
    }

    fn claim_due(&self, now: DateTime<Utc>) -> Result<Option<PaymentRetryTask>, RetryStoreError> {
        let mut tasks = self.tasks.write().map_err(poisoned)?;

        let next = tasks
            .values()
            .filter(|t| t.is_due(now))
            .min_by_key(|t| (t.scheduled_at, t.created_at))
            .map(|t| t.id);

        Ok(next.and_then(|id| {
            tasks.get_mut(&id).map(|task| {
                task.mark_running(now);
                task.clone()
            })
        }))
    }

    fn for_job(&self, job_id: JobId) -> Result<Vec<PaymentRetryTask>, RetryStoreError> {
        let tasks = self.tasks.read().map_err(poisoned)?;
        let mut found: Vec<_> = tasks
            .values()
            .filter(|t| t.job_id == job_id)
            .cloned()
            .collect();
        found.sort_by_key(|t| t.created_at);
        Ok(found)
    }

    fn dead_letter(&self, entry: DeadLetterEntry) -> Result<(), RetryStoreError> {
        self.dead_letters.write().map_err(poisoned)?.push(entry);
        Ok(())
    }

    fn dead_letters(&self) -> Result<Vec<DeadLetterEntry>, RetryStoreError> {
        Ok(self.dead_letters.read().map_err(poisoned)?.clone())
    }
}

/// Open (not yet terminal) tasks for a job.
pub fn open_tasks(
    store: &dyn RetryTaskStore,
    job_id: JobId,
) -> Result<Vec<PaymentRetryTask>, RetryStoreError> {
    Ok(store
        .for_job(job_id)?
        .into_iter()
        .filter(|t| !t.status.is_terminal() && t.status != TaskStatus::Running)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::types::RetryPolicy;
    use jobflow_core::TransactionId;
    use std::time::Duration;

    #[test]
    fn claims_only_due_tasks_oldest_first() {
        let store = InMemoryRetryTaskStore::new();
        let now = Utc::now();
        let policy = RetryPolicy::fixed(3, Duration::from_secs(60));
        let early = PaymentRetryTask::new(JobId::new(), TransactionId::new(), policy.clone(), now);
        let late = PaymentRetryTask::new(
            JobId::new(),
            TransactionId::new(),
            policy,
            now + chrono::Duration::minutes(5),
        );
        store.enqueue(late.clone()).unwrap();
        store.enqueue(early.clone()).unwrap();

        assert!(store.claim_due(now).unwrap().is_none());

        let at = now + chrono::Duration::minutes(10);
        let claimed = store.claim_due(at).unwrap().unwrap();
        assert_eq!(claimed.id, early.id);
        assert_eq!(claimed.status, TaskStatus::Running);
        assert_eq!(store.claim_due(at).unwrap().unwrap().id, late.id);
        assert!(store.claim_due(at).unwrap().is_none());
    }

    #[test]
    fn duplicate_enqueue_is_rejected() {
        let store = InMemoryRetryTaskStore::new();
        let task = PaymentRetryTask::new(
            JobId::new(),
            TransactionId::new(),
            RetryPolicy::default(),
            Utc::now(),
        );
        store.enqueue(task.clone()).unwrap();
        assert!(matches!(
            store.enqueue(task),
            Err(RetryStoreError::AlreadyExists(_))
        ));
    }
}
