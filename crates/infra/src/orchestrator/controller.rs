//! The job state machine controller.
//!
//! [`Orchestrator::decide`] looks at a rehydrated execution and either runs the side
//! effect of the next step and returns the command recording its outcome, or reports
//! that the execution must wait. The drive loop appends each command before deciding
//! again, so a crash between steps resumes at the first unrecorded step.

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use jobflow_core::{Money, TransactionId};
use jobflow_escrow::{TransactionRecord, TransactionStatus};
use jobflow_lifecycle::{
    CancellationRequest, Finalizer, JobCommand, JobExecution, JobState, PendingWait, RetryStep,
    Signal, SignalKind, TimerPurpose,
};

use super::{Orchestrator, OrchestratorError};
use crate::activities::{ActivityError, run_finalizer};
use crate::coordinator::{Clock, SignalPoll, TimerPoll};
use crate::escrow::{AuthorizationRequest, EscrowError, PaymentGateway};
use crate::event_store::EventStore;
use crate::ledger::LedgerStore;
use crate::retry::{PaymentRetryTask, RetryPolicy, open_tasks};

/// Upper bound on steps per drive, far above the longest uninterrupted run.
pub(super) const MAX_STEPS: usize = 64;

pub(super) enum Step {
    Apply(JobCommand),
    Suspend,
}

impl<S, L, G> Orchestrator<S, L, G>
where
    S: EventStore,
    L: LedgerStore,
    G: PaymentGateway,
{
    /// Advance the execution until it has to wait. Caller holds the job lock.
    pub(super) fn drive(&self, mut execution: JobExecution) -> Result<JobExecution, OrchestratorError> {
        let job_id = execution.id_typed();
        for _ in 0..MAX_STEPS {
            match self.decide(&execution, self.clock.now())? {
                Step::Apply(command) => {
                    execution = self.repository.execute(&execution, &command)?;
                }
                Step::Suspend => {
                    debug!(job_id = %job_id, state = execution.state().as_str(), "execution suspended");
                    return Ok(execution);
                }
            }
        }
        error!(job_id = %job_id, state = execution.state().as_str(), "execution did not settle");
        Err(OrchestratorError::Stalled(job_id, MAX_STEPS))
    }

    pub(super) fn decide(
        &self,
        execution: &JobExecution,
        now: DateTime<Utc>,
    ) -> Result<Step, OrchestratorError> {
        if !execution.exists() {
            return Ok(Step::Suspend);
        }

        if let Some(finalizer) = execution.pending_finalizer() {
            self.finalize(execution, finalizer, now)?;
            return Ok(Step::Apply(JobCommand::RecordFinalization { finalizer, at: now }));
        }
        if execution.state().is_terminal() {
            return Ok(Step::Suspend);
        }
        if let Some(request) = execution.cancellation() {
            return self.compensate(execution, request, now);
        }

        let job_id = execution.id_typed();
        let command = match execution.state() {
            JobState::Draft => match self.activities.price_job(job_id) {
                Ok(amount) => JobCommand::RecordPrice { amount, at: now },
                Err(e) => JobCommand::Fail {
                    reason: e.to_string(),
                    at: now,
                },
            },

            JobState::Priced => {
                if self.retry_timer_pending(execution, now) {
                    return Ok(Step::Suspend);
                }
                let amount = self.priced(execution)?;
                match self.activities.send_job_offer(job_id, amount) {
                    Ok(()) => JobCommand::RecordOfferSent { at: now },
                    Err(e) => self.activity_failure(execution, RetryStep::SendOffer, e, now),
                }
            }

            JobState::OfferSent => {
                let deadline = match execution.pending_wait() {
                    Some(PendingWait::Signal {
                        kind: SignalKind::OfferResponse,
                        deadline,
                    }) => *deadline,
                    _ => Some(self.coordinator.deadline(now, self.offer_timeout()?)),
                };
                match self
                    .coordinator
                    .await_signal(execution, SignalKind::OfferResponse, deadline, now)
                {
                    SignalPoll::Delivered(Signal::OfferResponse { accepted }) => {
                        JobCommand::ResolveOffer {
                            accepted,
                            timed_out: false,
                            at: now,
                        }
                    }
                    SignalPoll::TimedOut => {
                        info!(job_id = %job_id, "offer expired without a decision");
                        JobCommand::ResolveOffer {
                            accepted: false,
                            timed_out: true,
                            at: now,
                        }
                    }
                    poll => return Ok(self.wait(poll, now)),
                }
            }

            JobState::Accepted => match self.coordinator.poll_timer(execution, now) {
                TimerPoll::Pending { .. } => return Ok(Step::Suspend),
                TimerPoll::Due(_) | TimerPoll::Idle => {
                    let attempt = execution.match_attempts() + 1;
                    let outcome = self.matching.attempt(job_id, attempt, now);
                    JobCommand::RecordMatchAttempt {
                        attempt,
                        outcome,
                        at: now,
                    }
                }
            },

            JobState::WorkerAssigned => {
                if self.retry_timer_pending(execution, now) {
                    return Ok(Step::Suspend);
                }
                let worker_id = execution.worker_id().ok_or_else(|| {
                    OrchestratorError::InvalidState("assigned job has no worker".into())
                })?;
                match self.activities.schedule_job(job_id, worker_id) {
                    Ok(()) => JobCommand::MarkScheduled { at: now },
                    Err(e) => self.activity_failure(execution, RetryStep::Schedule, e, now),
                }
            }

            JobState::Scheduled => {
                match self
                    .coordinator
                    .await_signal(execution, SignalKind::JobStarted, None, now)
                {
                    SignalPoll::Delivered(_) => JobCommand::MarkStarted { at: now },
                    poll => return Ok(self.wait(poll, now)),
                }
            }

            JobState::InProgress => {
                match self
                    .coordinator
                    .await_signal(execution, SignalKind::JobCompleted, None, now)
                {
                    SignalPoll::Delivered(_) => JobCommand::MarkCompleted { at: now },
                    poll => return Ok(self.wait(poll, now)),
                }
            }

            JobState::Completed => {
                if self.retry_timer_pending(execution, now) {
                    return Ok(Step::Suspend);
                }
                self.settle_payment(execution, now)?
            }

            // Waits for the out-of-band retry path or an operator.
            JobState::PaymentFailed => return Ok(Step::Suspend),

            JobState::Paid => {
                let deadline = self.coordinator.deadline(now, self.review_window()?);
                if let Err(e) = self.activities.request_reviews(job_id, deadline) {
                    warn!(job_id = %job_id, error = %e, "review request failed; continuing");
                }
                JobCommand::RequestReviews { deadline, at: now }
            }

            JobState::ReviewPending => {
                if execution.review_count() >= self.config.review_target {
                    JobCommand::Close {
                        deadline_elapsed: false,
                        at: now,
                    }
                } else {
                    match self.coordinator.await_signal(
                        execution,
                        SignalKind::ReviewSubmitted,
                        execution.review_deadline(),
                        now,
                    ) {
                        SignalPoll::Delivered(Signal::ReviewSubmitted(review)) => {
                            JobCommand::RecordReview { review, at: now }
                        }
                        SignalPoll::TimedOut => JobCommand::Close {
                            deadline_elapsed: true,
                            at: now,
                        },
                        poll => return Ok(self.wait(poll, now)),
                    }
                }
            }

            JobState::Rejected
            | JobState::NoWorkerAvailable
            | JobState::Closed
            | JobState::Cancelled
            | JobState::Failed => return Ok(Step::Suspend),
        };

        Ok(Step::Apply(command))
    }

    /// Authorize if the job holds no authorization yet, then capture.
    fn settle_payment(
        &self,
        execution: &JobExecution,
        now: DateTime<Utc>,
    ) -> Result<JobCommand, OrchestratorError> {
        let Some(transaction_id) = execution.authorization_id() else {
            return match self.authorize(execution) {
                Ok((transaction_id, amount)) => Ok(JobCommand::RecordAuthorization {
                    transaction_id,
                    amount,
                    at: now,
                }),
                Err(e) => Ok(self.payment_failure(execution, RetryStep::Authorize, e, now)),
            };
        };

        match self.escrow.capture(transaction_id, None) {
            Ok(record) => Ok(JobCommand::MarkPaid {
                transaction_id,
                amount: record.capture_amount.unwrap_or(record.amount),
                at: now,
            }),
            Err(e) => Ok(self.payment_failure(
                execution,
                RetryStep::Capture,
                OrchestratorError::Escrow(e),
                now,
            )),
        }
    }

    pub(super) fn authorize(
        &self,
        execution: &JobExecution,
    ) -> Result<(TransactionId, Money), OrchestratorError> {
        let job_id = execution.id_typed();
        let party = self.activities.payment_party(job_id)?;
        let caller = execution
            .consumer_id()
            .ok_or_else(|| OrchestratorError::InvalidState("execution has no consumer".into()))?;
        let record = self.escrow.authorize(AuthorizationRequest {
            job_id,
            job_consumer: party.consumer_id,
            caller,
            worker_id: execution.worker_id(),
            amount: self.priced(execution)?,
            source: party.source,
        })?;
        Ok((record.id, record.amount))
    }

    /// Retry a transient payment failure on a durable timer; give up into `payment_failed`.
    fn payment_failure(
        &self,
        execution: &JobExecution,
        step: RetryStep,
        error: OrchestratorError,
        now: DateTime<Utc>,
    ) -> JobCommand {
        warn!(
            job_id = %execution.id_typed(),
            step = ?step,
            attempt = execution.step_attempts() + 1,
            retryable = error.is_retryable(),
            error = %error,
            "payment step failed"
        );
        let give_up = JobCommand::MarkPaymentFailed {
            reason: error.to_string(),
            at: now,
        };
        if error.is_retryable() {
            self.retry_or(execution, step, &self.config.payment_step_retry, error.to_string(), now, give_up)
        } else {
            give_up
        }
    }

    fn activity_failure(
        &self,
        execution: &JobExecution,
        step: RetryStep,
        error: ActivityError,
        now: DateTime<Utc>,
    ) -> JobCommand {
        warn!(job_id = %execution.id_typed(), step = ?step, error = %error, "activity failed");
        let give_up = JobCommand::Fail {
            reason: error.to_string(),
            at: now,
        };
        if error.is_retryable() {
            self.retry_or(execution, step, &self.config.activity_retry, error.to_string(), now, give_up)
        } else {
            give_up
        }
    }

    fn retry_or(
        &self,
        execution: &JobExecution,
        step: RetryStep,
        policy: &RetryPolicy,
        error: String,
        now: DateTime<Utc>,
        give_up: JobCommand,
    ) -> JobCommand {
        let attempt = execution.step_attempts() + 1;
        if policy.should_retry(attempt) {
            JobCommand::ScheduleStepRetry {
                step,
                retry_at: policy.retry_at(attempt, now),
                error,
                at: now,
            }
        } else {
            warn!(job_id = %execution.id_typed(), step = ?step, attempts = attempt, "retries exhausted");
            give_up
        }
    }

    /// Undo whatever money moved, then cancel.
    fn compensate(
        &self,
        execution: &JobExecution,
        request: &CancellationRequest,
        now: DateTime<Utc>,
    ) -> Result<Step, OrchestratorError> {
        let cancel = Step::Apply(JobCommand::Cancel { at: now });
        // A refund already issued through the payment API settles the cancellation.
        if request.refund_transaction_id.is_some() {
            return Ok(cancel);
        }
        let transaction_id = match execution.authorization_id() {
            Some(id) => id,
            // The gateway may hold funds the stream never recorded.
            None => match self.escrow.authorization_for_job(execution.id_typed())? {
                Some(record) => {
                    warn!(job_id = %execution.id_typed(), transaction_id = %record.id, "compensating an authorization missing from the execution");
                    record.id
                }
                None => return Ok(cancel),
            },
        };
        if let TimerPoll::Pending { .. } = self.coordinator.poll_timer(execution, now) {
            if matches!(
                execution.pending_wait(),
                Some(PendingWait::Timer {
                    purpose: TimerPurpose::StepRetry {
                        step: RetryStep::CancellationRefund,
                        ..
                    },
                    ..
                })
            ) {
                return Ok(Step::Suspend);
            }
        }

        let result = self
            .escrow
            .settle_outstanding(transaction_id)
            .and_then(|record| self.return_funds(execution, &record, &request.reason));
        Ok(match result {
            Ok(()) => cancel,
            Err(e) => {
                let give_up = JobCommand::Fail {
                    reason: format!("cancellation could not return funds: {e}"),
                    at: now,
                };
                if e.is_retryable() {
                    Step::Apply(self.retry_or(
                        execution,
                        RetryStep::CancellationRefund,
                        &self.config.payment_step_retry,
                        e.to_string(),
                        now,
                        give_up,
                    ))
                } else {
                    Step::Apply(give_up)
                }
            }
        })
    }

    /// Refund what was captured, or release a hold that never was.
    fn return_funds(
        &self,
        execution: &JobExecution,
        record: &TransactionRecord,
        reason: &str,
    ) -> Result<(), EscrowError> {
        if record.is_captured() {
            if !record.refundable().is_zero() {
                let refund = self.escrow.refund(record.id, None, reason)?;
                info!(job_id = %execution.id_typed(), refund_id = %refund.id, "captured payment refunded on cancellation");
            }
        } else if record.status == TransactionStatus::Pending && record.gateway.intent_id.is_some() {
            self.escrow.void_authorization(record.id, reason)?;
            info!(job_id = %execution.id_typed(), transaction_id = %record.id, "authorization hold released on cancellation");
        }
        Ok(())
    }

    /// Run a finalizer's side effects. Recording it is the caller's job.
    fn finalize(
        &self,
        execution: &JobExecution,
        finalizer: Finalizer,
        now: DateTime<Utc>,
    ) -> Result<(), OrchestratorError> {
        let job_id = execution.id_typed();

        if matches!(
            finalizer,
            Finalizer::Close | Finalizer::Cancellation | Finalizer::Failure
        ) {
            if let Some(worker_id) = execution.worker_id() {
                self.matching.release(worker_id, job_id)?;
            }
        }
        if finalizer == Finalizer::PaymentFailure {
            self.enqueue_payment_retry(execution, now)?;
        }

        let reason = execution
            .cancellation()
            .map(|c| c.reason.as_str())
            .or(execution.failure_reason())
            .unwrap_or_default();
        run_finalizer(
            self.activities.as_ref(),
            job_id,
            finalizer,
            execution.review_count(),
            reason,
        )?;
        info!(job_id = %job_id, finalizer = ?finalizer, state = execution.state().as_str(), "execution finalized");
        Ok(())
    }

    /// Queue an out-of-band capture retry unless one is already open. Returns whether a
    /// task was queued.
    pub(super) fn enqueue_payment_retry(
        &self,
        execution: &JobExecution,
        now: DateTime<Utc>,
    ) -> Result<bool, OrchestratorError> {
        let job_id = execution.id_typed();
        let Some(transaction_id) = execution.authorization_id() else {
            // Nothing to capture; the job waits for an operator to retry the payment.
            warn!(job_id = %job_id, "payment failed before authorization; no retry queued");
            return Ok(false);
        };
        if !open_tasks(self.retries.as_ref(), job_id)?.is_empty() {
            return Ok(false);
        }
        let task = PaymentRetryTask::new(
            job_id,
            transaction_id,
            self.config.payment_retry.clone(),
            now,
        );
        info!(job_id = %job_id, task_id = %task.id, scheduled_at = ?task.scheduled_at, "payment retry queued");
        self.retries.enqueue(task)?;
        Ok(true)
    }

    fn wait(&self, poll: SignalPoll, now: DateTime<Utc>) -> Step {
        match poll {
            SignalPoll::Register(PendingWait::Signal { kind, deadline }) => {
                Step::Apply(JobCommand::AwaitSignal {
                    kind,
                    deadline,
                    at: now,
                })
            }
            _ => Step::Suspend,
        }
    }

    fn retry_timer_pending(&self, execution: &JobExecution, now: DateTime<Utc>) -> bool {
        matches!(
            self.coordinator.poll_timer(execution, now),
            TimerPoll::Pending { .. }
        )
    }

    fn priced(&self, execution: &JobExecution) -> Result<Money, OrchestratorError> {
        execution
            .priced_amount()
            .ok_or_else(|| OrchestratorError::InvalidState("job has not been priced".into()))
    }

    fn offer_timeout(&self) -> Result<chrono::Duration, OrchestratorError> {
        to_chrono(self.config.offer_timeout)
    }

    fn review_window(&self) -> Result<chrono::Duration, OrchestratorError> {
        to_chrono(self.config.review_window)
    }
}

fn to_chrono(duration: std::time::Duration) -> Result<chrono::Duration, OrchestratorError> {
    chrono::Duration::from_std(duration)
        .map_err(|e| OrchestratorError::InvalidState(format!("duration out of range: {e}")))
}
