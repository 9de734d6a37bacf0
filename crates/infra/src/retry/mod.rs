//! Retry policies and the out-of-band payment retry queue.
//!
//! A job that lands in `payment_failed` is not re-driven by its own execution. A
//! [`PaymentRetryTask`] is queued instead and swept by [`run_due`] on its own
//! backoff schedule; an exhausted task is dead-lettered and triggers the final failure
//! notification.
//!
//! [`RetryPolicy`] is shared with the matching loop (linear backoff) and the in-execution
//! step retries.

pub mod executor;
pub mod store;
pub mod types;

pub use executor::{RetryHandler, SweepStats, run_due};
pub use store::{InMemoryRetryTaskStore, RetryStoreError, RetryTaskStore, open_tasks};
pub use types::{
    AttemptRecord, BackoffStrategy, DeadLetterEntry, PaymentRetryTask, RetryPolicy, TaskResult,
    TaskStatus,
};
