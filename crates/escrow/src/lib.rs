//! Payment domain for settling jobs.
//!
//! Transaction records, the append-only payment event log and the rules that keep
//! capture and refund amounts consistent. Gateway calls and persistence live in
//! `jobflow-infra`.

pub mod event;
pub mod fees;
pub mod transaction;

pub use event::{
    GatewayMetadata, PaymentEvent, PaymentOperation, PaymentOutcome, idempotency_key,
    unresolved_attempts,
};
pub use fees::{FeeBreakdown, FeeSchedule};
pub use transaction::{
    GatewayRefs, PaymentRuleError, TransactionRecord, TransactionStatus, TransactionType,
};
