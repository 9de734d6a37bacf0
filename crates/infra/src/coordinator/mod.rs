//! Signal/timeout coordination.
//!
//! Waits are not threads. A wait is a [`PendingWait`] persisted in the job's stream;
//! the coordinator only answers "can this execution move on now?" from the
//! execution's buffered signals, its registered wait and the current time. When the
//! answer is no, the execution is simply left alone until a signal is delivered or a
//! timer sweep finds its wake-up instant has passed.

pub mod clock;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use jobflow_lifecycle::{JobExecution, PendingWait, Signal, SignalKind, TimerPurpose};

pub use clock::{Clock, ManualClock, SystemClock};

/// Result of racing a signal against an optional deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalPoll {
    /// An unconsumed delivery is buffered; act on it.
    Delivered(Signal),
    /// The deadline passed with nothing delivered.
    TimedOut,
    /// Nothing yet, and the wait is not registered. Persist it before suspending.
    Register(PendingWait),
    /// Nothing yet; the wait is already registered.
    Suspended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerPoll {
    /// No timer is pending.
    Idle,
    Due(TimerPurpose),
    Pending { fire_at: DateTime<Utc> },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SignalCoordinator;

impl SignalCoordinator {
    pub fn new() -> Self {
        Self
    }

    /// Race the next delivery of `kind` against `deadline`.
    ///
    /// A delivery wins over an elapsed deadline: if both are true at the same
    /// instant the signal is returned. Consumed deliveries are no longer buffered,
    /// so calling this again after acting on one waits for the next delivery.
    pub fn await_signal(
        &self,
        execution: &JobExecution,
        kind: SignalKind,
        deadline: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> SignalPoll {
        if let Some(signal) = execution.next_signal(kind) {
            return SignalPoll::Delivered(signal.clone());
        }
        if deadline.is_some_and(|at| at <= now) {
            debug!(job_id = %execution.id_typed(), signal = %kind, "signal wait timed out");
            return SignalPoll::TimedOut;
        }

        let wait = PendingWait::Signal { kind, deadline };
        if execution.pending_wait() == Some(&wait) {
            SignalPoll::Suspended
        } else {
            SignalPoll::Register(wait)
        }
    }

    pub fn poll_timer(&self, execution: &JobExecution, now: DateTime<Utc>) -> TimerPoll {
        match execution.pending_wait() {
            Some(PendingWait::Timer { purpose, fire_at }) if *fire_at <= now => {
                TimerPoll::Due(*purpose)
            }
            Some(PendingWait::Timer { fire_at, .. }) => TimerPoll::Pending { fire_at: *fire_at },
            _ => TimerPoll::Idle,
        }
    }

    /// Whether a sweep at `now` should resume this execution.
    pub fn is_due(&self, execution: &JobExecution, now: DateTime<Utc>) -> bool {
        execution.is_active() && execution.pending_wait().is_some_and(|w| w.is_due(now))
    }

    pub fn deadline(&self, now: DateTime<Utc>, after: Duration) -> DateTime<Utc> {
        now + after
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobflow_core::{Aggregate, ConsumerId, Currency, JobId, Money};
    use jobflow_lifecycle::{JobCommand, ReviewSubmission};
    use uuid::Uuid;

    fn exec(commands: &[JobCommand]) -> JobExecution {
        let mut execution = JobExecution::empty(JobId::new());
        for command in commands {
            for event in execution.handle(command).unwrap() {
                execution.apply(&event);
            }
        }
        execution
    }

    fn offered(job_id: JobId, at: DateTime<Utc>) -> JobExecution {
        let mut execution = JobExecution::empty(job_id);
        let commands = [
            JobCommand::Submit {
                job_id,
                consumer_id: ConsumerId::new(),
                at,
            },
            JobCommand::RecordPrice {
                amount: Money::from_minor(10_000, Currency::Usd),
                at,
            },
            JobCommand::RecordOfferSent { at },
        ];
        for command in &commands {
            for event in execution.handle(command).unwrap() {
                execution.apply(&event);
            }
        }
        execution
    }

    fn step(execution: &mut JobExecution, command: JobCommand) {
        for event in execution.handle(&command).unwrap() {
            execution.apply(&event);
        }
    }

    #[test]
    fn registers_then_suspends_then_times_out() {
        let now = Utc::now();
        let deadline = now + Duration::hours(24);
        let coordinator = SignalCoordinator::new();
        let mut execution = offered(JobId::new(), now);

        let poll = coordinator.await_signal(&execution, SignalKind::OfferResponse, Some(deadline), now);
        let SignalPoll::Register(wait) = poll else {
            panic!("expected a registration, got {poll:?}");
        };
        step(
            &mut execution,
            JobCommand::AwaitSignal {
                kind: SignalKind::OfferResponse,
                deadline: wait.wake_at(),
                at: now,
            },
        );

        assert_eq!(
            coordinator.await_signal(&execution, SignalKind::OfferResponse, Some(deadline), now),
            SignalPoll::Suspended
        );
        assert!(!coordinator.is_due(&execution, now + Duration::hours(23)));
        assert!(coordinator.is_due(&execution, deadline));
        assert_eq!(
            coordinator.await_signal(&execution, SignalKind::OfferResponse, Some(deadline), deadline),
            SignalPoll::TimedOut
        );
    }

    #[test]
    fn delivery_wins_over_an_elapsed_deadline() {
        let now = Utc::now();
        let mut execution = offered(JobId::new(), now);
        step(
            &mut execution,
            JobCommand::DeliverSignal {
                signal: Signal::OfferResponse { accepted: true },
                at: now,
            },
        );

        let poll = SignalCoordinator::new().await_signal(
            &execution,
            SignalKind::OfferResponse,
            Some(now),
            now + Duration::days(1),
        );
        assert_eq!(poll, SignalPoll::Delivered(Signal::OfferResponse { accepted: true }));
    }

    #[test]
    fn reentrant_wait_sees_the_next_review_not_the_first() {
        let now = Utc::now();
        let job_id = JobId::new();
        let review = |rating| ReviewSubmission {
            job_id,
            reviewer_id: Uuid::now_v7(),
            rating,
            comment: None,
        };
        let (first, second) = (review(5), review(4));

        // Only the buffering/consumption rules matter here, so drive the stream to
        // review_pending the short way.
        let mut execution = offered(job_id, now);
        for command in [
            JobCommand::DeliverSignal { signal: Signal::OfferResponse { accepted: true }, at: now },
            JobCommand::ResolveOffer { accepted: true, timed_out: false, at: now },
            JobCommand::RecordMatchAttempt {
                attempt: 1,
                outcome: jobflow_lifecycle::MatchOutcome::Assigned {
                    worker_id: jobflow_core::WorkerId::new(),
                },
                at: now,
            },
            JobCommand::MarkScheduled { at: now },
            JobCommand::DeliverSignal { signal: Signal::JobStarted, at: now },
            JobCommand::MarkStarted { at: now },
            JobCommand::DeliverSignal { signal: Signal::JobCompleted, at: now },
            JobCommand::MarkCompleted { at: now },
            JobCommand::MarkPaid {
                transaction_id: jobflow_core::TransactionId::new(),
                amount: Money::from_minor(10_000, Currency::Usd),
                at: now,
            },
            JobCommand::RequestReviews { deadline: now + Duration::days(7), at: now },
            JobCommand::DeliverSignal { signal: Signal::ReviewSubmitted(first.clone()), at: now },
            JobCommand::DeliverSignal { signal: Signal::ReviewSubmitted(second.clone()), at: now },
        ] {
            step(&mut execution, command);
        }

        let coordinator = SignalCoordinator::new();
        let deadline = execution.review_deadline();
        let poll = coordinator.await_signal(&execution, SignalKind::ReviewSubmitted, deadline, now);
        assert_eq!(poll, SignalPoll::Delivered(Signal::ReviewSubmitted(first.clone())));

        step(&mut execution, JobCommand::RecordReview { review: first, at: now });
        let poll = coordinator.await_signal(&execution, SignalKind::ReviewSubmitted, deadline, now);
        assert_eq!(poll, SignalPoll::Delivered(Signal::ReviewSubmitted(second.clone())));

        step(&mut execution, JobCommand::RecordReview { review: second, at: now });
        assert_eq!(
            coordinator.await_signal(&execution, SignalKind::ReviewSubmitted, deadline, now),
            SignalPoll::Suspended
        );
    }

    #[test]
    fn timer_poll_reports_due_purpose() {
        let now = Utc::now();
        let coordinator = SignalCoordinator::new();
        assert_eq!(coordinator.poll_timer(&exec(&[]), now), TimerPoll::Idle);

        let mut execution = offered(JobId::new(), now);
        step(
            &mut execution,
            JobCommand::DeliverSignal { signal: Signal::OfferResponse { accepted: true }, at: now },
        );
        step(&mut execution, JobCommand::ResolveOffer { accepted: true, timed_out: false, at: now });
        let retry_at = now + Duration::minutes(5);
        step(
            &mut execution,
            JobCommand::RecordMatchAttempt {
                attempt: 1,
                outcome: jobflow_lifecycle::MatchOutcome::RetryAt { retry_at },
                at: now,
            },
        );

        assert_eq!(coordinator.poll_timer(&execution, now), TimerPoll::Pending { fire_at: retry_at });
        assert_eq!(
            coordinator.poll_timer(&execution, retry_at),
            TimerPoll::Due(TimerPurpose::MatchBackoff { attempt: 1 })
        );
    }
}
