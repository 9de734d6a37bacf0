//! `JobExecution`: the event-sourced state of one job's orchestration.
//!
//! Every field needed to resume a suspended execution (pending waits, buffered signals,
//! retry counters, the authorization reference) is derived from the event stream, so an
//! execution can be unloaded at any suspension point and rebuilt by replay.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use jobflow_core::{
    Aggregate, AggregateRoot, ConsumerId, DomainError, JobId, Money, TransactionId, WorkerId,
};
use jobflow_events::Event;

use crate::signal::{ReviewSubmission, Signal, SignalKind};
use crate::state::JobState;

/// Steps whose transient failures are retried on a durable timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStep {
    SendOffer,
    Schedule,
    Authorize,
    Capture,
    CancellationRefund,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "purpose", rename_all = "snake_case")]
pub enum TimerPurpose {
    MatchBackoff { attempt: u32 },
    StepRetry { step: RetryStep, attempt: u32 },
}

/// What a suspended execution is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "wait", rename_all = "snake_case")]
pub enum PendingWait {
    /// A signal, optionally raced against a deadline.
    Signal {
        kind: SignalKind,
        deadline: Option<DateTime<Utc>>,
    },
    Timer {
        purpose: TimerPurpose,
        fire_at: DateTime<Utc>,
    },
}

impl PendingWait {
    /// The instant at which the execution must be resumed even without a signal.
    pub fn wake_at(&self) -> Option<DateTime<Utc>> {
        match self {
            PendingWait::Signal { deadline, .. } => *deadline,
            PendingWait::Timer { fire_at, .. } => Some(*fire_at),
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.wake_at().is_some_and(|at| at <= now)
    }
}

/// Finalization activity run once when a terminal (or halted) state is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Finalizer {
    Close,
    Rejection,
    NoWorkerAvailable,
    PaymentFailure,
    Cancellation,
    Failure,
}

impl Finalizer {
    pub fn for_state(state: JobState) -> Option<Finalizer> {
        match state {
            JobState::Closed => Some(Finalizer::Close),
            JobState::Rejected => Some(Finalizer::Rejection),
            JobState::NoWorkerAvailable => Some(Finalizer::NoWorkerAvailable),
            JobState::PaymentFailed => Some(Finalizer::PaymentFailure),
            JobState::Cancelled => Some(Finalizer::Cancellation),
            JobState::Failed => Some(Finalizer::Failure),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationRequest {
    pub reason: String,
    /// Set when the cancellation is the consequence of a refund that already happened.
    pub refund_transaction_id: Option<TransactionId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MatchOutcome {
    Assigned { worker_id: WorkerId },
    RetryAt { retry_at: DateTime<Utc> },
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobCommand {
    Submit {
        job_id: JobId,
        consumer_id: ConsumerId,
        at: DateTime<Utc>,
    },
    RecordPrice {
        amount: Money,
        at: DateTime<Utc>,
    },
    RecordOfferSent {
        at: DateTime<Utc>,
    },
    AwaitSignal {
        kind: SignalKind,
        deadline: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    },
    DeliverSignal {
        signal: Signal,
        at: DateTime<Utc>,
    },
    ResolveOffer {
        accepted: bool,
        timed_out: bool,
        at: DateTime<Utc>,
    },
    RecordMatchAttempt {
        attempt: u32,
        outcome: MatchOutcome,
        at: DateTime<Utc>,
    },
    ScheduleStepRetry {
        step: RetryStep,
        retry_at: DateTime<Utc>,
        error: String,
        at: DateTime<Utc>,
    },
    MarkScheduled {
        at: DateTime<Utc>,
    },
    MarkStarted {
        at: DateTime<Utc>,
    },
    MarkCompleted {
        at: DateTime<Utc>,
    },
    RecordAuthorization {
        transaction_id: TransactionId,
        amount: Money,
        at: DateTime<Utc>,
    },
    MarkPaid {
        transaction_id: TransactionId,
        amount: Money,
        at: DateTime<Utc>,
    },
    MarkPaymentFailed {
        reason: String,
        at: DateTime<Utc>,
    },
    RequestReviews {
        deadline: DateTime<Utc>,
        at: DateTime<Utc>,
    },
    RecordReview {
        review: ReviewSubmission,
        at: DateTime<Utc>,
    },
    Close {
        deadline_elapsed: bool,
        at: DateTime<Utc>,
    },
    RequestCancellation {
        request: CancellationRequest,
        at: DateTime<Utc>,
    },
    Cancel {
        at: DateTime<Utc>,
    },
    Fail {
        reason: String,
        at: DateTime<Utc>,
    },
    RecordFinalization {
        finalizer: Finalizer,
        at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobChange {
    Submitted { consumer_id: ConsumerId },
    Priced { amount: Money },
    OfferSent,
    WaitRegistered { wait: PendingWait },
    SignalReceived { signal: Signal },
    OfferResolved { accepted: bool, timed_out: bool },
    MatchAttemptFailed { attempt: u32, retry_at: DateTime<Utc> },
    WorkerAssigned { worker_id: WorkerId, attempt: u32 },
    NoWorkerAvailable { attempts: u32 },
    StepRetryScheduled {
        step: RetryStep,
        attempt: u32,
        retry_at: DateTime<Utc>,
        error: String,
    },
    Scheduled,
    Started,
    Completed,
    PaymentAuthorized { transaction_id: TransactionId, amount: Money },
    Paid { transaction_id: TransactionId, amount: Money },
    PaymentFailed { reason: String },
    ReviewsRequested { deadline: DateTime<Utc> },
    ReviewRecorded { review: ReviewSubmission },
    Closed { reviews_received: u32, deadline_elapsed: bool },
    CancellationRequested { request: CancellationRequest },
    Cancelled { reason: String },
    Failed { reason: String },
    Finalized { finalizer: Finalizer },
}

impl JobChange {
    fn name(&self) -> &'static str {
        match self {
            JobChange::Submitted { .. } => "job.execution.submitted",
            JobChange::Priced { .. } => "job.execution.priced",
            JobChange::OfferSent => "job.execution.offer_sent",
            JobChange::WaitRegistered { .. } => "job.execution.wait_registered",
            JobChange::SignalReceived { .. } => "job.execution.signal_received",
            JobChange::OfferResolved { .. } => "job.execution.offer_resolved",
            JobChange::MatchAttemptFailed { .. } => "job.execution.match_attempt_failed",
            JobChange::WorkerAssigned { .. } => "job.execution.worker_assigned",
            JobChange::NoWorkerAvailable { .. } => "job.execution.no_worker_available",
            JobChange::StepRetryScheduled { .. } => "job.execution.step_retry_scheduled",
            JobChange::Scheduled => "job.execution.scheduled",
            JobChange::Started => "job.execution.started",
            JobChange::Completed => "job.execution.completed",
            JobChange::PaymentAuthorized { .. } => "job.execution.payment_authorized",
            JobChange::Paid { .. } => "job.execution.paid",
            JobChange::PaymentFailed { .. } => "job.execution.payment_failed",
            JobChange::ReviewsRequested { .. } => "job.execution.reviews_requested",
            JobChange::ReviewRecorded { .. } => "job.execution.review_recorded",
            JobChange::Closed { .. } => "job.execution.closed",
            JobChange::CancellationRequested { .. } => "job.execution.cancellation_requested",
            JobChange::Cancelled { .. } => "job.execution.cancelled",
            JobChange::Failed { .. } => "job.execution.failed",
            JobChange::Finalized { .. } => "job.execution.finalized",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub occurred_at: DateTime<Utc>,
    pub change: JobChange,
}

impl Event for JobEvent {
    fn event_type(&self) -> &'static str {
        self.change.name()
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

/// Aggregate root: one job's orchestration state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobExecution {
    id: JobId,
    created: bool,
    consumer_id: Option<ConsumerId>,
    state: JobState,
    history: Vec<JobState>,
    priced_amount: Option<Money>,
    worker_id: Option<WorkerId>,
    match_attempts: u32,
    step_attempts: u32,
    pending_wait: Option<PendingWait>,
    inbox: Vec<Signal>,
    seen_signals: BTreeSet<String>,
    authorization: Option<(TransactionId, Money)>,
    paid_amount: Option<Money>,
    review_deadline: Option<DateTime<Utc>>,
    reviews: Vec<ReviewSubmission>,
    cancellation: Option<CancellationRequest>,
    finalized: Vec<Finalizer>,
    failure_reason: Option<String>,
    version: u64,
}

impl JobExecution {
    /// Create an empty, not-yet-submitted instance for rehydration.
    pub fn empty(id: JobId) -> Self {
        Self {
            id,
            created: false,
            consumer_id: None,
            state: JobState::Draft,
            history: Vec::new(),
            priced_amount: None,
            worker_id: None,
            match_attempts: 0,
            step_attempts: 0,
            pending_wait: None,
            inbox: Vec::new(),
            seen_signals: BTreeSet::new(),
            authorization: None,
            paid_amount: None,
            review_deadline: None,
            reviews: Vec::new(),
            cancellation: None,
            finalized: Vec::new(),
            failure_reason: None,
            version: 0,
        }
    }

    pub fn rehydrate<'a>(id: JobId, events: impl IntoIterator<Item = &'a JobEvent>) -> Self {
        let mut execution = Self::empty(id);
        for event in events {
            execution.apply(event);
        }
        execution
    }

    pub fn id_typed(&self) -> JobId {
        self.id
    }

    pub fn exists(&self) -> bool {
        self.created
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Every state visited, in order, ending with the current one.
    pub fn history(&self) -> &[JobState] {
        &self.history
    }

    pub fn consumer_id(&self) -> Option<ConsumerId> {
        self.consumer_id
    }

    pub fn priced_amount(&self) -> Option<Money> {
        self.priced_amount
    }

    pub fn worker_id(&self) -> Option<WorkerId> {
        self.worker_id
    }

    pub fn match_attempts(&self) -> u32 {
        self.match_attempts
    }

    /// Retries spent on the current step; reset by every state transition.
    pub fn step_attempts(&self) -> u32 {
        self.step_attempts
    }

    pub fn pending_wait(&self) -> Option<&PendingWait> {
        self.pending_wait.as_ref()
    }

    pub fn authorization_id(&self) -> Option<TransactionId> {
        self.authorization.map(|(id, _)| id)
    }

    pub fn paid_amount(&self) -> Option<Money> {
        self.paid_amount
    }

    pub fn review_deadline(&self) -> Option<DateTime<Utc>> {
        self.review_deadline
    }

    pub fn reviews(&self) -> &[ReviewSubmission] {
        &self.reviews
    }

    pub fn review_count(&self) -> u32 {
        self.reviews.len() as u32
    }

    pub fn cancellation(&self) -> Option<&CancellationRequest> {
        self.cancellation.as_ref()
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn is_active(&self) -> bool {
        self.created && !self.state.is_terminal()
    }

    /// The finalizer owed by the current state, if it has not run yet.
    pub fn pending_finalizer(&self) -> Option<Finalizer> {
        Finalizer::for_state(self.state).filter(|f| !self.finalized.contains(f))
    }

    pub fn has_finalized(&self, finalizer: Finalizer) -> bool {
        self.finalized.contains(&finalizer)
    }

    /// Oldest buffered, unconsumed delivery of `kind`.
    pub fn next_signal(&self, kind: SignalKind) -> Option<&Signal> {
        self.inbox.iter().find(|s| s.kind() == kind)
    }

    fn transition(&mut self, to: JobState) {
        self.state = to;
        self.history.push(to);
        self.step_attempts = 0;
        self.pending_wait = None;
    }

    fn consume(&mut self, key: &str) {
        if let Some(pos) = self.inbox.iter().position(|s| s.dedup_key() == key) {
            self.inbox.remove(pos);
        }
    }

    fn consume_first(&mut self, kind: SignalKind) {
        if let Some(pos) = self.inbox.iter().position(|s| s.kind() == kind) {
            self.inbox.remove(pos);
        }
    }
}

impl AggregateRoot for JobExecution {
    type Id = JobId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

impl Aggregate for JobExecution {
    type Command = JobCommand;
    type Event = JobEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match &event.change {
            JobChange::Submitted { consumer_id } => {
                self.id = event.job_id;
                self.created = true;
                self.consumer_id = Some(*consumer_id);
                self.state = JobState::Draft;
                self.history = vec![JobState::Draft];
            }
            JobChange::Priced { amount } => {
                self.priced_amount = Some(*amount);
                self.transition(JobState::Priced);
            }
            JobChange::OfferSent => self.transition(JobState::OfferSent),
            JobChange::WaitRegistered { wait } => self.pending_wait = Some(*wait),
            JobChange::SignalReceived { signal } => {
                self.seen_signals.insert(signal.dedup_key());
                self.inbox.push(signal.clone());
            }
            JobChange::OfferResolved { accepted, timed_out } => {
                if !timed_out {
                    self.consume_first(SignalKind::OfferResponse);
                }
                self.transition(if *accepted {
                    JobState::Accepted
                } else {
                    JobState::Rejected
                });
            }
            JobChange::MatchAttemptFailed { attempt, retry_at } => {
                self.match_attempts = *attempt;
                self.pending_wait = Some(PendingWait::Timer {
                    purpose: TimerPurpose::MatchBackoff { attempt: *attempt },
                    fire_at: *retry_at,
                });
            }
            JobChange::WorkerAssigned { worker_id, attempt } => {
                self.match_attempts = *attempt;
                self.worker_id = Some(*worker_id);
                self.transition(JobState::WorkerAssigned);
            }
            JobChange::NoWorkerAvailable { attempts } => {
                self.match_attempts = *attempts;
                self.transition(JobState::NoWorkerAvailable);
            }
            JobChange::StepRetryScheduled {
                step,
                attempt,
                retry_at,
                ..
            } => {
                self.step_attempts = *attempt;
                self.pending_wait = Some(PendingWait::Timer {
                    purpose: TimerPurpose::StepRetry {
                        step: *step,
                        attempt: *attempt,
                    },
                    fire_at: *retry_at,
                });
            }
            JobChange::Scheduled => self.transition(JobState::Scheduled),
            JobChange::Started => {
                self.consume_first(SignalKind::JobStarted);
                self.transition(JobState::InProgress);
            }
            JobChange::Completed => {
                self.consume_first(SignalKind::JobCompleted);
                self.transition(JobState::Completed);
            }
            JobChange::PaymentAuthorized {
                transaction_id,
                amount,
            } => {
                self.authorization = Some((*transaction_id, *amount));
                self.step_attempts = 0;
                self.pending_wait = None;
            }
            JobChange::Paid { amount, .. } => {
                self.paid_amount = Some(*amount);
                self.transition(JobState::Paid);
            }
            JobChange::PaymentFailed { reason } => {
                self.failure_reason = Some(reason.clone());
                self.transition(JobState::PaymentFailed);
            }
            JobChange::ReviewsRequested { deadline } => {
                self.review_deadline = Some(*deadline);
                self.transition(JobState::ReviewPending);
                self.pending_wait = Some(PendingWait::Signal {
                    kind: SignalKind::ReviewSubmitted,
                    deadline: Some(*deadline),
                });
            }
            JobChange::ReviewRecorded { review } => {
                self.consume(&Signal::ReviewSubmitted(review.clone()).dedup_key());
                self.reviews.push(review.clone());
            }
            JobChange::Closed { .. } => self.transition(JobState::Closed),
            JobChange::CancellationRequested { request } => {
                self.cancellation = Some(request.clone());
            }
            JobChange::Cancelled { .. } => self.transition(JobState::Cancelled),
            JobChange::Failed { reason } => {
                self.failure_reason = Some(reason.clone());
                self.transition(JobState::Failed);
            }
            JobChange::Finalized { finalizer } => self.finalized.push(*finalizer),
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        if !self.created && !matches!(command, JobCommand::Submit { .. }) {
            return Err(DomainError::not_found());
        }

        let (change, at) = match command {
            JobCommand::Submit {
                job_id,
                consumer_id,
                at,
            } => {
                if self.created {
                    return Err(DomainError::conflict(format!(
                        "job {job_id} already has an execution"
                    )));
                }
                return Ok(vec![JobEvent {
                    job_id: *job_id,
                    occurred_at: *at,
                    change: JobChange::Submitted {
                        consumer_id: *consumer_id,
                    },
                }]);
            }
            JobCommand::RecordPrice { amount, at } => {
                self.state.ensure_transition(JobState::Priced)?;
                if amount.is_zero() {
                    return Err(DomainError::validation("priced amount must be positive"));
                }
                (JobChange::Priced { amount: *amount }, at)
            }
            JobCommand::RecordOfferSent { at } => {
                self.state.ensure_transition(JobState::OfferSent)?;
                (JobChange::OfferSent, at)
            }
            JobCommand::AwaitSignal { kind, deadline, at } => {
                self.ensure_active()?;
                let wait = PendingWait::Signal {
                    kind: *kind,
                    deadline: *deadline,
                };
                if self.pending_wait == Some(wait) {
                    return Ok(vec![]);
                }
                (JobChange::WaitRegistered { wait }, at)
            }
            JobCommand::DeliverSignal { signal, at } => {
                if self.state.is_terminal() || self.seen_signals.contains(&signal.dedup_key()) {
                    return Ok(vec![]);
                }
                if let Signal::ReviewSubmitted(review) = signal {
                    review.validate()?;
                    if review.job_id != self.id {
                        return Err(DomainError::validation("review targets a different job"));
                    }
                }
                (
                    JobChange::SignalReceived {
                        signal: signal.clone(),
                    },
                    at,
                )
            }
            JobCommand::ResolveOffer {
                accepted,
                timed_out,
                at,
            } => {
                let to = if *accepted {
                    JobState::Accepted
                } else {
                    JobState::Rejected
                };
                self.state.ensure_transition(to)?;
                if *timed_out && *accepted {
                    return Err(DomainError::validation("a timed-out offer cannot be accepted"));
                }
                if !timed_out
                    && self.next_signal(SignalKind::OfferResponse)
                        != Some(&Signal::OfferResponse {
                            accepted: *accepted,
                        })
                {
                    return Err(DomainError::invariant(
                        "offer decision does not match the delivered response",
                    ));
                }
                (
                    JobChange::OfferResolved {
                        accepted: *accepted,
                        timed_out: *timed_out,
                    },
                    at,
                )
            }
            JobCommand::RecordMatchAttempt {
                attempt,
                outcome,
                at,
            } => {
                if self.state != JobState::Accepted {
                    return Err(DomainError::invalid_transition(self.state, "matching"));
                }
                if *attempt != self.match_attempts + 1 {
                    return Err(DomainError::invariant(format!(
                        "match attempt {attempt} out of order (last was {})",
                        self.match_attempts
                    )));
                }
                let change = match outcome {
                    MatchOutcome::Assigned { worker_id } => JobChange::WorkerAssigned {
                        worker_id: *worker_id,
                        attempt: *attempt,
                    },
                    MatchOutcome::RetryAt { retry_at } => JobChange::MatchAttemptFailed {
                        attempt: *attempt,
                        retry_at: *retry_at,
                    },
                    MatchOutcome::Exhausted => JobChange::NoWorkerAvailable { attempts: *attempt },
                };
                (change, at)
            }
            JobCommand::ScheduleStepRetry {
                step,
                retry_at,
                error,
                at,
            } => {
                self.ensure_active()?;
                (
                    JobChange::StepRetryScheduled {
                        step: *step,
                        attempt: self.step_attempts + 1,
                        retry_at: *retry_at,
                        error: error.clone(),
                    },
                    at,
                )
            }
            JobCommand::MarkScheduled { at } => {
                self.state.ensure_transition(JobState::Scheduled)?;
                (JobChange::Scheduled, at)
            }
            JobCommand::MarkStarted { at } => {
                self.state.ensure_transition(JobState::InProgress)?;
                if self.next_signal(SignalKind::JobStarted).is_none() {
                    return Err(DomainError::invariant("job-started signal not delivered"));
                }
                (JobChange::Started, at)
            }
            JobCommand::MarkCompleted { at } => {
                self.state.ensure_transition(JobState::Completed)?;
                if self.next_signal(SignalKind::JobCompleted).is_none() {
                    return Err(DomainError::invariant("job-completed signal not delivered"));
                }
                (JobChange::Completed, at)
            }
            JobCommand::RecordAuthorization {
                transaction_id,
                amount,
                at,
            } => {
                if !matches!(self.state, JobState::Completed | JobState::PaymentFailed) {
                    return Err(DomainError::invalid_transition(self.state, "authorized"));
                }
                match self.authorization {
                    Some((existing, _)) if existing == *transaction_id => return Ok(vec![]),
                    Some((existing, _)) => {
                        return Err(DomainError::conflict(format!(
                            "job already holds authorization {existing}"
                        )));
                    }
                    None => {}
                }
                (
                    JobChange::PaymentAuthorized {
                        transaction_id: *transaction_id,
                        amount: *amount,
                    },
                    at,
                )
            }
            JobCommand::MarkPaid {
                transaction_id,
                amount,
                at,
            } => {
                self.state.ensure_transition(JobState::Paid)?;
                if let Some((authorized, _)) = self.authorization {
                    if authorized != *transaction_id {
                        return Err(DomainError::invariant(
                            "captured transaction is not the job's authorization",
                        ));
                    }
                }
                (
                    JobChange::Paid {
                        transaction_id: *transaction_id,
                        amount: *amount,
                    },
                    at,
                )
            }
            JobCommand::MarkPaymentFailed { reason, at } => {
                self.state.ensure_transition(JobState::PaymentFailed)?;
                (
                    JobChange::PaymentFailed {
                        reason: reason.clone(),
                    },
                    at,
                )
            }
            JobCommand::RequestReviews { deadline, at } => {
                self.state.ensure_transition(JobState::ReviewPending)?;
                (
                    JobChange::ReviewsRequested {
                        deadline: *deadline,
                    },
                    at,
                )
            }
            JobCommand::RecordReview { review, at } => {
                if self.state != JobState::ReviewPending {
                    return Err(DomainError::invalid_transition(self.state, "review_recorded"));
                }
                let key = Signal::ReviewSubmitted(review.clone()).dedup_key();
                if !self.inbox.iter().any(|s| s.dedup_key() == key) {
                    return Err(DomainError::invariant("review was not delivered"));
                }
                (
                    JobChange::ReviewRecorded {
                        review: review.clone(),
                    },
                    at,
                )
            }
            JobCommand::Close {
                deadline_elapsed,
                at,
            } => {
                self.state.ensure_transition(JobState::Closed)?;
                (
                    JobChange::Closed {
                        reviews_received: self.review_count(),
                        deadline_elapsed: *deadline_elapsed,
                    },
                    at,
                )
            }
            JobCommand::RequestCancellation { request, at } => {
                if self.state.is_terminal() {
                    return Err(DomainError::conflict(format!(
                        "job is already {} and cannot be cancelled",
                        self.state
                    )));
                }
                if self.cancellation.is_some() {
                    return Ok(vec![]);
                }
                (
                    JobChange::CancellationRequested {
                        request: request.clone(),
                    },
                    at,
                )
            }
            JobCommand::Cancel { at } => {
                self.state.ensure_transition(JobState::Cancelled)?;
                let request = self
                    .cancellation
                    .as_ref()
                    .ok_or_else(|| DomainError::invariant("cancellation was not requested"))?;
                (
                    JobChange::Cancelled {
                        reason: request.reason.clone(),
                    },
                    at,
                )
            }
            JobCommand::Fail { reason, at } => {
                self.state.ensure_transition(JobState::Failed)?;
                (
                    JobChange::Failed {
                        reason: reason.clone(),
                    },
                    at,
                )
            }
            JobCommand::RecordFinalization { finalizer, at } => {
                if self.finalized.contains(finalizer) {
                    return Ok(vec![]);
                }
                if Finalizer::for_state(self.state) != Some(*finalizer) {
                    return Err(DomainError::invariant(format!(
                        "finalizer {finalizer:?} does not belong to state {}",
                        self.state
                    )));
                }
                (
                    JobChange::Finalized {
                        finalizer: *finalizer,
                    },
                    at,
                )
            }
        };

        Ok(vec![JobEvent {
            job_id: self.id,
            occurred_at: *at,
            change,
        }])
    }
}

impl JobExecution {
    fn ensure_active(&self) -> Result<(), DomainError> {
        if self.state.is_terminal() {
            return Err(DomainError::conflict(format!("job is already {}", self.state)));
        }
        Ok(())
    }
}
