//! Identifiers, money, errors and the aggregate contract shared by the job lifecycle
//! and escrow crates. No IO lives here.

pub mod aggregate;
pub mod error;
pub mod id;
pub mod money;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion};
pub use error::{DomainError, DomainResult};
pub use id::{AggregateId, ConsumerId, JobId, TransactionId, WorkerId};
pub use money::{Currency, Money};
