//! Transaction ledger: transaction records plus the payment event log.
//!
//! Every escrow write goes through [`LedgerStore::commit`], which persists record
//! inserts/updates and payment events as one all-or-nothing unit.

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use thiserror::Error;

use jobflow_core::{JobId, TransactionId};
use jobflow_escrow::{PaymentEvent, TransactionRecord};

pub use in_memory::InMemoryLedger;
pub use postgres::PostgresLedger;

/// One atomic ledger write.
///
/// A record with `revision == 0` is inserted and must not exist yet. Any other record
/// replaces the stored one only if the stored revision still equals `revision`. The
/// ledger bumps the revision of every record it writes.
#[derive(Debug, Clone, Default)]
pub struct LedgerBatch {
    pub records: Vec<TransactionRecord>,
    pub events: Vec<PaymentEvent>,
}

impl LedgerBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(mut self, record: TransactionRecord) -> Self {
        self.records.push(record);
        self
    }

    pub fn event(mut self, event: PaymentEvent) -> Self {
        self.events.push(event);
        self
    }
}

#[derive(Debug, Error)]
pub enum LedgerError {
    /// Stale revision or duplicate insert; nothing from the batch was written.
    #[error("ledger conflict: {0}")]
    Conflict(String),

    #[error("ledger storage failure: {0}")]
    Storage(String),
}

pub trait LedgerStore: Send + Sync {
    /// Persist the batch atomically; returns the written records with their new revisions.
    fn commit(&self, batch: LedgerBatch) -> Result<Vec<TransactionRecord>, LedgerError>;

    fn get(&self, id: TransactionId) -> Result<Option<TransactionRecord>, LedgerError>;

    /// Records for a job, oldest first.
    fn by_job(&self, job_id: JobId) -> Result<Vec<TransactionRecord>, LedgerError>;

    /// Records carrying `reference` as any of their gateway ids.
    fn by_gateway_reference(&self, reference: &str)
    -> Result<Vec<TransactionRecord>, LedgerError>;

    fn events_for_transaction(&self, id: TransactionId) -> Result<Vec<PaymentEvent>, LedgerError>;

    fn events_for_job(&self, job_id: JobId) -> Result<Vec<PaymentEvent>, LedgerError>;

    /// `attempted` events with no `succeeded`/`failed` counterpart, oldest first.
    fn unresolved_attempts(&self) -> Result<Vec<PaymentEvent>, LedgerError>;
}

impl<S> LedgerStore for Arc<S>
where
    S: LedgerStore + ?Sized,
{
    fn commit(&self, batch: LedgerBatch) -> Result<Vec<TransactionRecord>, LedgerError> {
        (**self).commit(batch)
    }

    fn get(&self, id: TransactionId) -> Result<Option<TransactionRecord>, LedgerError> {
        (**self).get(id)
    }

    fn by_job(&self, job_id: JobId) -> Result<Vec<TransactionRecord>, LedgerError> {
        (**self).by_job(job_id)
    }

    fn by_gateway_reference(
        &self,
        reference: &str,
    ) -> Result<Vec<TransactionRecord>, LedgerError> {
        (**self).by_gateway_reference(reference)
    }

    fn events_for_transaction(&self, id: TransactionId) -> Result<Vec<PaymentEvent>, LedgerError> {
        (**self).events_for_transaction(id)
    }

    fn events_for_job(&self, job_id: JobId) -> Result<Vec<PaymentEvent>, LedgerError> {
        (**self).events_for_job(job_id)
    }

    fn unresolved_attempts(&self) -> Result<Vec<PaymentEvent>, LedgerError> {
        (**self).unresolved_attempts()
    }
}
