use std::collections::HashMap;
use std::sync::RwLock;

use jobflow_core::{JobId, TransactionId};
use jobflow_escrow::{PaymentEvent, TransactionRecord};

use super::{LedgerBatch, LedgerError, LedgerStore};

/// In-memory ledger for tests/dev. One write lock makes every batch atomic.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    inner: RwLock<Ledger>,
}

#[derive(Debug, Default)]
struct Ledger {
    records: HashMap<TransactionId, TransactionRecord>,
    /// Insertion order of records.
    order: Vec<TransactionId>,
    events: Vec<PaymentEvent>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Ledger>, LedgerError> {
        self.inner
            .read()
            .map_err(|_| LedgerError::Storage("lock poisoned".to_string()))
    }

    fn records_where(
        &self,
        pred: impl Fn(&TransactionRecord) -> bool,
    ) -> Result<Vec<TransactionRecord>, LedgerError> {
        let ledger = self.read()?;
        Ok(ledger
            .order
            .iter()
            .filter_map(|id| ledger.records.get(id))
            .filter(|r| pred(r))
            .cloned()
            .collect())
    }

    fn events_where(
        &self,
        pred: impl Fn(&PaymentEvent) -> bool,
    ) -> Result<Vec<PaymentEvent>, LedgerError> {
        Ok(self.read()?.events.iter().filter(|e| pred(e)).cloned().collect())
    }
}

impl LedgerStore for InMemoryLedger {
    fn commit(&self, batch: LedgerBatch) -> Result<Vec<TransactionRecord>, LedgerError> {
        let mut ledger = self
            .inner
            .write()
            .map_err(|_| LedgerError::Storage("lock poisoned".to_string()))?;

        // Validate everything before touching state.
        for record in &batch.records {
            match ledger.records.get(&record.id) {
                None if record.revision == 0 => {}
                None => {
                    return Err(LedgerError::Conflict(format!(
                        "transaction {} does not exist (revision {})",
                        record.id, record.revision
                    )));
                }
                Some(_) if record.revision == 0 => {
                    return Err(LedgerError::Conflict(format!(
                        "transaction {} already exists",
                        record.id
                    )));
                }
                Some(stored) if stored.revision != record.revision => {
                    return Err(LedgerError::Conflict(format!(
                        "transaction {} is at revision {}, write expected {}",
                        record.id, stored.revision, record.revision
                    )));
                }
                Some(_) => {}
            }
        }

        let mut written = Vec::with_capacity(batch.records.len());
        for mut record in batch.records {
            if record.revision == 0 {
                ledger.order.push(record.id);
            }
            record.revision += 1;
            ledger.records.insert(record.id, record.clone());
            written.push(record);
        }
        ledger.events.extend(batch.events);

        Ok(written)
    }

    fn get(&self, id: TransactionId) -> Result<Option<TransactionRecord>, LedgerError> {
        Ok(self.read()?.records.get(&id).cloned())
    }

    fn by_job(&self, job_id: JobId) -> Result<Vec<TransactionRecord>, LedgerError> {
        self.records_where(|r| r.job_id == job_id)
    }

    fn by_gateway_reference(
        &self,
        reference: &str,
    ) -> Result<Vec<TransactionRecord>, LedgerError> {
        self.records_where(|r| r.gateway.contains(reference))
    }

    fn events_for_transaction(&self, id: TransactionId) -> Result<Vec<PaymentEvent>, LedgerError> {
        self.events_where(|e| e.transaction_id == id)
    }

    fn events_for_job(&self, job_id: JobId) -> Result<Vec<PaymentEvent>, LedgerError> {
        self.events_where(|e| e.job_id == job_id)
    }

    fn unresolved_attempts(&self) -> Result<Vec<PaymentEvent>, LedgerError> {
        let ledger = self.read()?;
        Ok(jobflow_escrow::unresolved_attempts(&ledger.events)
            .into_iter()
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use jobflow_core::{ConsumerId, Currency, Money};
    use jobflow_escrow::PaymentOperation;

    fn auth() -> TransactionRecord {
        TransactionRecord::authorization(
            JobId::new(),
            ConsumerId::new(),
            None,
            Money::from_minor(10_000, Currency::Usd),
            "tok_visa",
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn commit_bumps_revisions_and_rejects_stale_writes() {
        let ledger = InMemoryLedger::new();
        let written = ledger.commit(LedgerBatch::new().record(auth())).unwrap();
        let record = written[0].clone();
        assert_eq!(record.revision, 1);

        let mut update = record.clone();
        update.reason = Some("first".into());
        ledger.commit(LedgerBatch::new().record(update)).unwrap();

        let mut stale = record;
        stale.reason = Some("second".into());
        let err = ledger.commit(LedgerBatch::new().record(stale)).unwrap_err();
        assert!(matches!(err, LedgerError::Conflict(_)));
    }

    #[test]
    fn rejected_batch_writes_nothing() {
        let ledger = InMemoryLedger::new();
        let existing = ledger.commit(LedgerBatch::new().record(auth())).unwrap()[0].clone();

        let fresh = auth();
        let event = PaymentEvent::attempted(
            fresh.id,
            fresh.job_id,
            PaymentOperation::Authorize,
            1,
            fresh.amount,
            Utc::now(),
        );
        let mut duplicate = existing.clone();
        duplicate.revision = 0;

        let batch = LedgerBatch::new().record(fresh.clone()).record(duplicate).event(event);
        assert!(ledger.commit(batch).is_err());
        assert!(ledger.get(fresh.id).unwrap().is_none());
        assert!(ledger.unresolved_attempts().unwrap().is_empty());
    }

    #[test]
    fn lookups_by_job_and_gateway_reference() {
        let ledger = InMemoryLedger::new();
        let mut record = auth();
        record.gateway.intent_id = Some("pi_42".into());
        let job_id = record.job_id;
        ledger.commit(LedgerBatch::new().record(record.clone())).unwrap();
        ledger.commit(LedgerBatch::new().record(auth())).unwrap();

        assert_eq!(ledger.by_job(job_id).unwrap().len(), 1);
        assert_eq!(ledger.by_gateway_reference("pi_42").unwrap()[0].id, record.id);
        assert!(ledger.by_gateway_reference("pi_0").unwrap().is_empty());
    }
}
