//! Job lifecycle domain module (event-sourced).
//!
//! The state graph, the `JobExecution` aggregate, signal payloads and pricing rules,
//! implemented as deterministic domain logic (no IO, no clocks, no storage).

pub mod execution;
pub mod pricing;
pub mod signal;
pub mod state;

pub use execution::{
    CancellationRequest, Finalizer, JobChange, JobCommand, JobEvent, JobExecution, MatchOutcome,
    PendingWait, RetryStep, TimerPurpose,
};
pub use pricing::{PricingInput, Urgency};
pub use signal::{ReviewSubmission, Signal, SignalKind};
pub use state::JobState;
