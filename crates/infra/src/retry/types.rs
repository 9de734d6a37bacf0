//! Retry policies and out-of-band payment retry tasks.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use jobflow_core::{JobId, TransactionId};

/// How the wait grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    /// `base × attempt`: matching waits 5, 10, 15 minutes.
    Linear,
    /// `base × 2^(attempt - 1)`, capped at `max_delay`.
    #[default]
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts in total, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(5, Duration::from_secs(30), Duration::from_secs(60 * 60))
    }
}

impl RetryPolicy {
    /// A single attempt, never retried.
    pub fn no_retry() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    pub fn linear(max_attempts: u32, step: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: step,
            max_delay: step.saturating_mul(max_attempts.max(1)),
            strategy: BackoffStrategy::Linear,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Wait after failed attempt number `attempt` (1-indexed); zero before the first.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let Some(steps) = attempt.checked_sub(1) else {
            return Duration::ZERO;
        };
        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
            BackoffStrategy::Exponential => self
                .base_delay
                .saturating_mul(2u32.checked_pow(steps).unwrap_or(u32::MAX)),
        };
        delay.min(self.max_delay)
    }

    pub fn retry_at(&self, attempt: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay_for_attempt(attempt))
            .unwrap_or(chrono::Duration::MAX);
        now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Whether another attempt may follow attempt number `attempt`.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    /// Failed, will be retried at `scheduled_at`.
    Failed { error: String, attempt: u32 },
    /// Exhausted retries.
    DeadLettered { error: String, attempts: u32 },
    /// Settled by another path before the task ran.
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::DeadLettered { .. } | TaskStatus::Cancelled
        )
    }
}

/// Re-drive of a failed capture, decoupled from the job's main timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRetryTask {
    pub id: Uuid,
    pub job_id: JobId,
    /// Authorization to capture.
    pub transaction_id: TransactionId,
    pub status: TaskStatus,
    pub retry_policy: RetryPolicy,
    /// Attempts started so far.
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub history: Vec<AttemptRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
}

impl PaymentRetryTask {
    /// A task whose first attempt runs one backoff step after `now`.
    pub fn new(
        job_id: JobId,
        transaction_id: TransactionId,
        retry_policy: RetryPolicy,
        now: DateTime<Utc>,
    ) -> Self {
        let scheduled_at = retry_policy.retry_at(1, now);
        Self {
            id: Uuid::now_v7(),
            job_id,
            transaction_id,
            status: TaskStatus::Pending,
            retry_policy,
            attempt: 0,
            created_at: now,
            updated_at: now,
            scheduled_at: Some(scheduled_at),
            history: Vec::new(),
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, TaskStatus::Pending | TaskStatus::Failed { .. })
            && self.scheduled_at.is_none_or(|at| at <= now)
    }

    pub fn mark_running(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Running;
        self.attempt += 1;
        self.updated_at = now;
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Completed;
        self.updated_at = now;
        self.scheduled_at = None;
        self.history.push(AttemptRecord {
            attempt: self.attempt,
            started_at: now,
            success: true,
            error: None,
        });
    }

    /// Record a failure; schedules the next attempt or dead-letters the task.
    pub fn mark_failed(&mut self, error: String, now: DateTime<Utc>) {
        if self.retry_policy.should_retry(self.attempt) {
            self.record_failure(&error, now);
            self.scheduled_at = Some(self.retry_policy.retry_at(self.attempt + 1, now));
            self.status = TaskStatus::Failed {
                error,
                attempt: self.attempt,
            };
        } else {
            self.mark_dead(error, now);
        }
    }

    /// Give up now; used for outcomes a retry cannot change.
    pub fn mark_dead(&mut self, error: String, now: DateTime<Utc>) {
        self.record_failure(&error, now);
        self.scheduled_at = None;
        self.status = TaskStatus::DeadLettered {
            error,
            attempts: self.attempt,
        };
    }

    fn record_failure(&mut self, error: &str, now: DateTime<Utc>) {
        self.updated_at = now;
        self.history.push(AttemptRecord {
            attempt: self.attempt,
            started_at: now,
            success: false,
            error: Some(error.to_owned()),
        });
    }

    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Cancelled;
        self.scheduled_at = None;
        self.updated_at = now;
    }
}

/// Outcome of one task run.
#[derive(Debug)]
pub enum TaskResult {
    Success,
    /// Transient failure; retried per policy.
    Failure(String),
    /// Permanent failure; dead-lettered now.
    Fatal(String),
    /// Nothing left to do (the payment was settled elsewhere).
    Obsolete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub task: PaymentRetryTask,
    pub dead_lettered_at: DateTime<Utc>,
    pub reason: String,
}
