use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use jobflow_core::{JobId, WorkerId};

use super::MatchingError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    /// Average review rating, 0–5.
    pub rating: Decimal,
    pub active: bool,
    pub available: bool,
    pub created_at: DateTime<Utc>,
    /// Job currently holding this worker.
    pub reserved_for: Option<JobId>,
}

impl Worker {
    pub fn new(rating: Decimal, created_at: DateTime<Utc>) -> Self {
        Self {
            id: WorkerId::new(),
            rating,
            active: true,
            available: true,
            created_at,
            reserved_for: None,
        }
    }

    fn is_free(&self) -> bool {
        self.active && self.available && self.reserved_for.is_none()
    }
}

/// Worker availability, the one resource shared between executions.
pub trait WorkerDirectory: Send + Sync {
    /// Active, available workers in registration order.
    fn available(&self) -> Result<Vec<Worker>, MatchingError>;

    /// Atomically reserve `worker_id` for `job_id` if it is still free.
    ///
    /// Returns `false` when another job got there first. Reserving a worker the job
    /// already holds succeeds again.
    fn reserve(&self, worker_id: WorkerId, job_id: JobId) -> Result<bool, MatchingError>;

    /// Make the worker available again if `job_id` holds it. Releasing twice is a no-op.
    fn release(&self, worker_id: WorkerId, job_id: JobId) -> Result<(), MatchingError>;

    /// Worker currently reserved for `job_id`, if any.
    fn reserved_for(&self, job_id: JobId) -> Result<Option<WorkerId>, MatchingError>;
}

impl<D> WorkerDirectory for Arc<D>
where
    D: WorkerDirectory + ?Sized,
{
    fn available(&self) -> Result<Vec<Worker>, MatchingError> {
        (**self).available()
    }

    fn reserve(&self, worker_id: WorkerId, job_id: JobId) -> Result<bool, MatchingError> {
        (**self).reserve(worker_id, job_id)
    }

    fn release(&self, worker_id: WorkerId, job_id: JobId) -> Result<(), MatchingError> {
        (**self).release(worker_id, job_id)
    }

    fn reserved_for(&self, job_id: JobId) -> Result<Option<WorkerId>, MatchingError> {
        (**self).reserved_for(job_id)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryWorkerPool {
    inner: Mutex<Pool>,
}

#[derive(Debug, Default)]
struct Pool {
    workers: HashMap<WorkerId, Worker>,
    order: Vec<WorkerId>,
}

impl InMemoryWorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, worker: Worker) -> Result<WorkerId, MatchingError> {
        let mut pool = self.lock()?;
        let id = worker.id;
        if pool.workers.insert(id, worker).is_none() {
            pool.order.push(id);
        }
        Ok(id)
    }

    pub fn get(&self, worker_id: WorkerId) -> Result<Option<Worker>, MatchingError> {
        Ok(self.lock()?.workers.get(&worker_id).cloned())
    }

    pub fn set_active(&self, worker_id: WorkerId, active: bool) -> Result<(), MatchingError> {
        let mut pool = self.lock()?;
        let worker = pool
            .workers
            .get_mut(&worker_id)
            .ok_or(MatchingError::UnknownWorker(worker_id))?;
        worker.active = active;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Pool>, MatchingError> {
        self.inner
            .lock()
            .map_err(|_| MatchingError::Directory("worker pool lock poisoned".to_string()))
    }
}

impl WorkerDirectory for InMemoryWorkerPool {
    fn available(&self) -> Result<Vec<Worker>, MatchingError> {
        let pool = self.lock()?;
        Ok(pool
            .order
            .iter()
            .filter_map(|id| pool.workers.get(id))
            .filter(|w| w.is_free())
            .cloned()
            .collect())
    }

    fn reserve(&self, worker_id: WorkerId, job_id: JobId) -> Result<bool, MatchingError> {
        // Check and write under one lock: the conditional update.
        let mut pool = self.lock()?;
        let worker = pool
            .workers
            .get_mut(&worker_id)
            .ok_or(MatchingError::UnknownWorker(worker_id))?;
        if worker.reserved_for == Some(job_id) {
            return Ok(true);
        }
        if !worker.is_free() {
            return Ok(false);
        }
        worker.available = false;
        worker.reserved_for = Some(job_id);
        Ok(true)
    }

    fn release(&self, worker_id: WorkerId, job_id: JobId) -> Result<(), MatchingError> {
        let mut pool = self.lock()?;
        let worker = pool
            .workers
            .get_mut(&worker_id)
            .ok_or(MatchingError::UnknownWorker(worker_id))?;
        if worker.reserved_for == Some(job_id) {
            worker.reserved_for = None;
            worker.available = true;
        }
        Ok(())
    }

    fn reserved_for(&self, job_id: JobId) -> Result<Option<WorkerId>, MatchingError> {
        let pool = self.lock()?;
        Ok(pool
            .order
            .iter()
            .find(|id| {
                pool.workers
                    .get(id)
                    .is_some_and(|w| w.reserved_for == Some(job_id))
            })
            .copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn reserve_is_exclusive_until_released() {
        let pool = InMemoryWorkerPool::new();
        let worker = pool.register(Worker::new(dec!(4.5), Utc::now())).unwrap();
        let (a, b) = (JobId::new(), JobId::new());

        assert!(pool.reserve(worker, a).unwrap());
        assert!(pool.reserve(worker, a).unwrap());
        assert!(!pool.reserve(worker, b).unwrap());
        assert!(pool.available().unwrap().is_empty());
        assert_eq!(pool.reserved_for(a).unwrap(), Some(worker));

        // Only the holder can release.
        pool.release(worker, b).unwrap();
        assert!(!pool.reserve(worker, b).unwrap());

        pool.release(worker, a).unwrap();
        assert!(pool.reserve(worker, b).unwrap());
    }

    #[test]
    fn inactive_workers_are_not_offered() {
        let pool = InMemoryWorkerPool::new();
        let worker = pool.register(Worker::new(dec!(5), Utc::now())).unwrap();
        pool.set_active(worker, false).unwrap();
        assert!(pool.available().unwrap().is_empty());
        assert!(!pool.reserve(worker, JobId::new()).unwrap());
    }
}
