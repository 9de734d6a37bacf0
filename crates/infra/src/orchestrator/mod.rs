//! Job lifecycle orchestrator.
//!
//! One durable execution per job. Every public operation takes the job's lock, loads
//! the execution from its stream, applies the request and drives the execution
//! forward until it has to wait again:
//!
//! ```text
//! submit / signal / cancel / timer / payment API
//!   ↓
//! lock(job) → load stream → [record request] → drive: decide → append → decide → ... → suspend
//! ```
//!
//! Executions share nothing in memory. Worker availability (reserved through the
//! matching loop) and the payment ledger are the only state touched from more than one
//! execution, and both are guarded by conditional writes.

mod controller;
pub mod error;
pub mod repository;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{error, info, warn};

use jobflow_core::{ConsumerId, JobId, Money, TransactionId, WorkerId};
use jobflow_escrow::{TransactionRecord, TransactionType};
use jobflow_lifecycle::{CancellationRequest, JobCommand, JobExecution, JobState, PendingWait, Signal};

use crate::activities::JobActivities;
use crate::config::OrchestratorConfig;
use crate::coordinator::{Clock, SignalCoordinator};
use crate::escrow::{EscrowError, EscrowManager, PaymentGateway, ReconciliationReport};
use crate::event_store::EventStore;
use crate::ledger::LedgerStore;
use crate::matching::{MatchingLoop, WorkerDirectory};
use crate::retry::{
    DeadLetterEntry, PaymentRetryTask, RetryHandler, RetryTaskStore, SweepStats, TaskResult,
    run_due,
};

pub use error::OrchestratorError;
pub use repository::{AGGREGATE_TYPE, ExecutionRepository};

/// Everything the orchestrator talks to.
pub struct Collaborators<S, L, G> {
    pub store: S,
    pub ledger: L,
    pub gateway: G,
    pub workers: Arc<dyn WorkerDirectory>,
    pub activities: Arc<dyn JobActivities>,
    pub retries: Arc<dyn RetryTaskStore>,
    pub clock: Arc<dyn Clock>,
}

/// Read-only view of one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub state: JobState,
    pub history: Vec<JobState>,
    pub priced_amount: Option<Money>,
    pub worker_id: Option<WorkerId>,
    pub match_attempts: u32,
    pub pending_wait: Option<PendingWait>,
    pub authorization_id: Option<TransactionId>,
    pub paid_amount: Option<Money>,
    pub reviews_received: u32,
    pub failure_reason: Option<String>,
    pub version: u64,
}

impl From<&JobExecution> for JobSnapshot {
    fn from(execution: &JobExecution) -> Self {
        use jobflow_core::AggregateRoot;

        Self {
            job_id: execution.id_typed(),
            state: execution.state(),
            history: execution.history().to_vec(),
            priced_amount: execution.priced_amount(),
            worker_id: execution.worker_id(),
            match_attempts: execution.match_attempts(),
            pending_wait: execution.pending_wait().copied(),
            authorization_id: execution.authorization_id(),
            paid_amount: execution.paid_amount(),
            reviews_received: execution.review_count(),
            failure_reason: execution.failure_reason().map(str::to_string),
            version: execution.version(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    pub reconciliation: ReconciliationReport,
    pub resumed: Vec<JobId>,
    /// `payment_failed` jobs whose retry task had to be queued again.
    pub requeued: Vec<JobId>,
    pub failed: Vec<(JobId, String)>,
}

/// Serializes work on one job. Different jobs never contend.
#[derive(Debug, Default)]
struct JobLocks {
    locks: Mutex<HashMap<JobId, Arc<Mutex<()>>>>,
}

impl JobLocks {
    fn for_job(&self, job_id: JobId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        locks.entry(job_id).or_default().clone()
    }
}

pub struct Orchestrator<S, L, G> {
    repository: ExecutionRepository<S>,
    escrow: EscrowManager<L, G, Arc<dyn Clock>>,
    matching: MatchingLoop<Arc<dyn WorkerDirectory>>,
    activities: Arc<dyn JobActivities>,
    retries: Arc<dyn RetryTaskStore>,
    coordinator: SignalCoordinator,
    clock: Arc<dyn Clock>,
    config: OrchestratorConfig,
    locks: JobLocks,
}

impl<S, L, G> Orchestrator<S, L, G>
where
    S: EventStore,
    L: LedgerStore,
    G: PaymentGateway,
{
    pub fn new(
        parts: Collaborators<S, L, G>,
        config: OrchestratorConfig,
    ) -> Result<Self, OrchestratorError> {
        config
            .validate()
            .map_err(|e| OrchestratorError::InvalidState(e.to_string()))?;
        let escrow = EscrowManager::new(
            parts.ledger,
            parts.gateway,
            parts.clock.clone(),
            config.escrow.clone(),
        )?;
        let matching = MatchingLoop::new(parts.workers, config.selection, config.matching.clone());

        Ok(Self {
            repository: ExecutionRepository::new(parts.store),
            escrow,
            matching,
            activities: parts.activities,
            retries: parts.retries,
            coordinator: SignalCoordinator::new(),
            clock: parts.clock,
            config,
            locks: JobLocks::default(),
        })
    }

    pub fn escrow(&self) -> &EscrowManager<L, G, Arc<dyn Clock>> {
        &self.escrow
    }

    pub fn repository(&self) -> &ExecutionRepository<S> {
        &self.repository
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Start orchestrating a job. At most one execution exists per job id.
    pub fn submit(
        &self,
        job_id: JobId,
        consumer_id: ConsumerId,
    ) -> Result<JobSnapshot, OrchestratorError> {
        self.with_job(job_id, |execution| {
            info!(job_id = %job_id, consumer_id = %consumer_id, "job submitted");
            self.repository.execute(
                &execution,
                &JobCommand::Submit {
                    job_id,
                    consumer_id,
                    at: self.clock.now(),
                },
            )
        })
    }

    /// Deliver an external decision. Redundant deliveries are dropped.
    pub fn signal(&self, job_id: JobId, signal: Signal) -> Result<JobSnapshot, OrchestratorError> {
        self.with_existing_job(job_id, |execution| {
            info!(job_id = %job_id, signal = %signal.kind(), "signal received");
            self.repository.execute(
                &execution,
                &JobCommand::DeliverSignal {
                    signal,
                    at: self.clock.now(),
                },
            )
        })
    }

    /// Administrative cancellation. Captured money is refunded and held money released
    /// before the job becomes `cancelled`.
    pub fn cancel(&self, job_id: JobId, reason: &str) -> Result<JobSnapshot, OrchestratorError> {
        self.with_existing_job(job_id, |execution| {
            warn!(job_id = %job_id, reason, "cancellation requested");
            self.repository.execute(
                &execution,
                &JobCommand::RequestCancellation {
                    request: CancellationRequest {
                        reason: reason.to_string(),
                        refund_transaction_id: None,
                    },
                    at: self.clock.now(),
                },
            )
        })
    }

    /// Capture a job's authorization outside the main timeline (operator or retry
    /// queue). Idempotent; a job waiting in `completed` or `payment_failed` becomes
    /// `paid` and moves on to reviews.
    pub fn capture_payment(
        &self,
        transaction_id: TransactionId,
        amount: Option<Money>,
    ) -> Result<TransactionRecord, OrchestratorError> {
        let job_id = self.job_of(transaction_id)?;
        let lock = self.locks.for_job(job_id);
        let _guard = lock.lock().unwrap_or_else(|p| p.into_inner());

        let execution = self.repository.load(job_id)?;
        let record = self.escrow.capture(transaction_id, amount)?;

        if matches!(
            execution.state(),
            JobState::Completed | JobState::PaymentFailed
        ) {
            let paid = self.repository.execute(
                &execution,
                &JobCommand::MarkPaid {
                    transaction_id,
                    amount: record.capture_amount.unwrap_or(record.amount),
                    at: self.clock.now(),
                },
            )?;
            self.drive(paid)?;
        }
        Ok(record)
    }

    /// Refund captured money. The job, unless already finished, becomes `cancelled`.
    pub fn refund_payment(
        &self,
        transaction_id: TransactionId,
        amount: Option<Money>,
        reason: &str,
    ) -> Result<TransactionRecord, OrchestratorError> {
        let job_id = self.job_of(transaction_id)?;
        let lock = self.locks.for_job(job_id);
        let _guard = lock.lock().unwrap_or_else(|p| p.into_inner());

        let refund = self.escrow.refund(transaction_id, amount, reason)?;

        let execution = self.repository.load(job_id)?;
        if execution.state().is_terminal() {
            info!(job_id = %job_id, state = execution.state().as_str(), "refund on a finished job");
            return Ok(refund);
        }
        let requested = self.repository.execute(
            &execution,
            &JobCommand::RequestCancellation {
                request: CancellationRequest {
                    reason: reason.to_string(),
                    refund_transaction_id: Some(refund.id),
                },
                at: self.clock.now(),
            },
        )?;
        self.drive(requested)?;
        Ok(refund)
    }

    /// Settle a `payment_failed` job: authorize if needed, then capture.
    pub fn retry_payment(&self, job_id: JobId) -> Result<JobSnapshot, OrchestratorError> {
        self.with_existing_job(job_id, |execution| {
            if execution.state() != JobState::PaymentFailed {
                return Err(OrchestratorError::InvalidState(format!(
                    "job {job_id} is {}, not payment_failed",
                    execution.state()
                )));
            }

            let (transaction_id, execution) = match execution.authorization_id() {
                Some(id) => (id, execution),
                None => {
                    let (id, amount) = self.authorize(&execution)?;
                    let recorded = self.repository.execute(
                        &execution,
                        &JobCommand::RecordAuthorization {
                            transaction_id: id,
                            amount,
                            at: self.clock.now(),
                        },
                    )?;
                    (id, recorded)
                }
            };

            let record = self.escrow.capture(transaction_id, None)?;
            info!(job_id = %job_id, transaction_id = %transaction_id, "payment settled out of band");
            self.repository.execute(
                &execution,
                &JobCommand::MarkPaid {
                    transaction_id,
                    amount: record.capture_amount.unwrap_or(record.amount),
                    at: self.clock.now(),
                },
            )
        })
    }

    /// Run every payment retry task that is due now.
    pub fn run_payment_retries(&self) -> Result<SweepStats, OrchestratorError> {
        Ok(run_due(self.retries.as_ref(), self, self.clock.now())?)
    }

    /// Resume every execution whose timer or signal deadline has passed.
    ///
    /// Scans all streams; a production deployment would index wake-up instants.
    pub fn fire_due_timers(&self) -> Result<Vec<JobId>, OrchestratorError> {
        let now = self.clock.now();
        let mut resumed = Vec::new();
        for job_id in self.repository.job_ids()? {
            let execution = self.repository.load(job_id)?;
            if !self.coordinator.is_due(&execution, now) {
                continue;
            }
            match self.resume(job_id) {
                Ok(_) => resumed.push(job_id),
                Err(e) => error!(job_id = %job_id, error = %e, "failed to resume execution"),
            }
        }
        Ok(resumed)
    }

    /// After a restart: reconcile payment attempts, then re-drive every execution that
    /// is still active or owes a finalizer.
    ///
    /// The retry queue may not have survived the restart, so every `payment_failed`
    /// execution that has already run its finalizer gets its capture retry queued again
    /// if none is open.
    pub fn recover(&self) -> Result<RecoveryReport, OrchestratorError> {
        let reconciliation = self.escrow.reconcile()?;
        let mut report = RecoveryReport {
            reconciliation,
            ..Default::default()
        };

        for job_id in self.repository.job_ids()? {
            let execution = self.repository.load(job_id)?;
            if execution.state() == JobState::PaymentFailed
                && execution.pending_finalizer().is_none()
            {
                match self.enqueue_payment_retry(&execution, self.clock.now()) {
                    Ok(true) => report.requeued.push(job_id),
                    Ok(false) => {}
                    Err(e) => {
                        error!(job_id = %job_id, error = %e, "failed to queue payment retry");
                        report.failed.push((job_id, e.to_string()));
                    }
                }
                continue;
            }
            if !execution.is_active() && execution.pending_finalizer().is_none() {
                continue;
            }
            match self.resume(job_id) {
                Ok(_) => report.resumed.push(job_id),
                Err(e) => {
                    error!(job_id = %job_id, error = %e, "recovery failed");
                    report.failed.push((job_id, e.to_string()));
                }
            }
        }
        info!(
            resumed = report.resumed.len(),
            requeued = report.requeued.len(),
            failed = report.failed.len(),
            reconciled = report.reconciliation.applied.len(),
            "recovery finished"
        );
        Ok(report)
    }

    pub fn snapshot(&self, job_id: JobId) -> Result<JobSnapshot, OrchestratorError> {
        let execution = self.repository.load(job_id)?;
        if !execution.exists() {
            return Err(OrchestratorError::NotFound(job_id));
        }
        Ok(JobSnapshot::from(&execution))
    }

    pub fn transactions_for_job(
        &self,
        job_id: JobId,
    ) -> Result<Vec<TransactionRecord>, OrchestratorError> {
        Ok(self.escrow.transactions_for_job(job_id)?)
    }

    fn resume(&self, job_id: JobId) -> Result<JobSnapshot, OrchestratorError> {
        self.with_existing_job(job_id, Ok)
    }

    fn job_of(&self, transaction_id: TransactionId) -> Result<JobId, OrchestratorError> {
        let record = self
            .escrow
            .transaction(transaction_id)?
            .ok_or(EscrowError::NotFound(transaction_id))?;
        if record.transaction_type != TransactionType::Authorization {
            return Err(EscrowError::InvalidState(format!(
                "{transaction_id} is a {}, not an authorization",
                record.transaction_type.as_str()
            ))
            .into());
        }
        Ok(record.job_id)
    }

    fn with_job(
        &self,
        job_id: JobId,
        apply: impl FnOnce(JobExecution) -> Result<JobExecution, OrchestratorError>,
    ) -> Result<JobSnapshot, OrchestratorError> {
        let lock = self.locks.for_job(job_id);
        let _guard = lock.lock().unwrap_or_else(|p| p.into_inner());

        let execution = apply(self.repository.load(job_id)?)?;
        let execution = self.drive(execution)?;
        Ok(JobSnapshot::from(&execution))
    }

    fn with_existing_job(
        &self,
        job_id: JobId,
        apply: impl FnOnce(JobExecution) -> Result<JobExecution, OrchestratorError>,
    ) -> Result<JobSnapshot, OrchestratorError> {
        self.with_job(job_id, |execution| {
            if !execution.exists() {
                return Err(OrchestratorError::NotFound(job_id));
            }
            apply(execution)
        })
    }
}

impl<S, L, G> RetryHandler for Orchestrator<S, L, G>
where
    S: EventStore,
    L: LedgerStore,
    G: PaymentGateway,
{
    fn handle(&self, task: &PaymentRetryTask) -> TaskResult {
        match self.repository.load(task.job_id) {
            Ok(execution) if execution.state() != JobState::PaymentFailed => {
                return TaskResult::Obsolete;
            }
            Ok(_) => {}
            Err(e) => return TaskResult::Failure(e.to_string()),
        }

        match self.retry_payment(task.job_id) {
            Ok(snapshot) => {
                info!(job_id = %task.job_id, state = snapshot.state.as_str(), attempt = task.attempt, "payment retry settled the job");
                TaskResult::Success
            }
            Err(e) if e.is_retryable() => TaskResult::Failure(e.to_string()),
            Err(e) => TaskResult::Fatal(e.to_string()),
        }
    }

    fn dead_lettered(&self, entry: &DeadLetterEntry) {
        let task = &entry.task;
        if let Err(e) = self.activities.handle_payment_retries_exhausted(
            task.job_id,
            task.transaction_id,
            &entry.reason,
        ) {
            error!(job_id = %task.job_id, error = %e, "failed to send final payment failure notice");
        }
    }
}
