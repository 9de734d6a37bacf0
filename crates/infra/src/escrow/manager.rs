//! Escrow manager: authorize, capture, refund and void against the card gateway.
//!
//! Every gateway-mutating call follows the same write-ahead protocol:
//!
//! ```text
//! 1. commit  { record insert (if new) + `attempted` event }
//! 2. call the gateway with the idempotency key "<operation>:<transaction id>"
//! 3. commit  { record changes + `succeeded` event }   or   { `failed` event (+ record failed) }
//!                                                      or   { `ambiguous` event }
//! ```
//!
//! A crash between 2 and 3 leaves an `attempted` event without an outcome. A timeout or
//! dropped connection leaves an `ambiguous` one. Both stay unresolved:
//! [`EscrowManager::reconcile`] finds them and asks the gateway what happened under the
//! same key, applying the success path or recording the failure.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use jobflow_core::{ConsumerId, DomainError, JobId, Money, TransactionId, WorkerId};
use jobflow_escrow::{
    FeeSchedule, PaymentEvent, PaymentOperation, PaymentOutcome, PaymentRuleError,
    TransactionRecord, TransactionStatus, TransactionType,
};

use super::gateway::{AuthorizeRequest, GatewayError, GatewayResponse, PaymentGateway};
use crate::coordinator::Clock;
use crate::ledger::{LedgerBatch, LedgerError, LedgerStore};

/// Attempts at committing a gateway success when the record moved underneath us.
const SETTLE_ATTEMPTS: usize = 3;

/// What the gateway turned out to have done with an unresolved attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Applied,
    NotExecuted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscrowConfig {
    /// How long an authorization hold stays capturable.
    pub authorization_validity: Duration,
    pub fees: FeeSchedule,
}

impl Default for EscrowConfig {
    fn default() -> Self {
        Self {
            authorization_validity: Duration::from_secs(7 * 24 * 60 * 60),
            fees: FeeSchedule::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum EscrowError {
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("not authorized: {0}")]
    Authorization(String),

    #[error("invalid transaction state: {0}")]
    InvalidState(String),

    #[error("requested {requested} exceeds the available {available}")]
    AmountExceeded { requested: Money, available: Money },

    #[error("transaction {id} was already captured for {captured}")]
    AlreadyCaptured { id: TransactionId, captured: Money },

    #[error("transaction not found: {0}")]
    NotFound(TransactionId),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl EscrowError {
    /// Transient failures worth another attempt. Business-rule violations never are.
    pub fn is_retryable(&self) -> bool {
        match self {
            EscrowError::Gateway(e) => e.is_retryable(),
            EscrowError::Ledger(_) => true,
            _ => false,
        }
    }
}

impl From<PaymentRuleError> for EscrowError {
    fn from(value: PaymentRuleError) -> Self {
        match value {
            PaymentRuleError::AlreadyCaptured { id, captured } => {
                EscrowError::AlreadyCaptured { id, captured }
            }
            PaymentRuleError::AmountExceeded {
                requested,
                available,
            } => EscrowError::AmountExceeded {
                requested,
                available,
            },
            PaymentRuleError::InvalidAmount(msg) => EscrowError::Validation(msg),
            other @ (PaymentRuleError::WrongType { .. } | PaymentRuleError::InvalidState { .. }) => {
                EscrowError::InvalidState(other.to_string())
            }
        }
    }
}

impl From<DomainError> for EscrowError {
    fn from(value: DomainError) -> Self {
        EscrowError::Validation(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRequest {
    pub job_id: JobId,
    /// The consumer who owns the job.
    pub job_consumer: ConsumerId,
    /// Who is asking for the hold.
    pub caller: ConsumerId,
    pub worker_id: Option<WorkerId>,
    pub amount: Money,
    /// Payment source token.
    pub source: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconciliationReport {
    pub examined: usize,
    /// Attempts the gateway had executed; their success path is now committed.
    pub applied: Vec<TransactionId>,
    /// Attempts the gateway never executed; recorded as failed.
    pub not_executed: Vec<TransactionId>,
    /// Attempts left unresolved because the lookup or the commit failed.
    pub unresolved: Vec<TransactionId>,
}

pub struct EscrowManager<L, G, C> {
    ledger: L,
    gateway: G,
    clock: C,
    config: EscrowConfig,
}

impl<L, G, C> EscrowManager<L, G, C>
where
    L: LedgerStore,
    G: PaymentGateway,
    C: Clock,
{
    pub fn new(ledger: L, gateway: G, clock: C, config: EscrowConfig) -> Result<Self, EscrowError> {
        config.fees.validate()?;
        Ok(Self {
            ledger,
            gateway,
            clock,
            config,
        })
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    /// Place a hold for the job's price.
    ///
    /// Returns the existing authorization if the job already holds a confirmed one. A
    /// pending authorization left by an interrupted attempt is retried under its
    /// original idempotency key.
    #[instrument(skip(self, request), fields(job_id = %request.job_id, amount = %request.amount), err)]
    pub fn authorize(
        &self,
        request: AuthorizationRequest,
    ) -> Result<TransactionRecord, EscrowError> {
        if request.caller != request.job_consumer {
            return Err(EscrowError::Authorization(format!(
                "consumer {} does not own job {}",
                request.caller, request.job_id
            )));
        }

        let existing = self.authorization_for_job(request.job_id)?;
        let (record, insert) = match existing {
            Some(record) if record.amount != request.amount => {
                return Err(EscrowError::InvalidState(format!(
                    "job {} already holds authorization {} for {}",
                    request.job_id, record.id, record.amount
                )));
            }
            Some(record) if record.gateway.intent_id.is_some() => {
                debug!(transaction_id = %record.id, "authorization already confirmed");
                return Ok(record);
            }
            Some(record) => (record, false),
            None => {
                let record = TransactionRecord::authorization(
                    request.job_id,
                    request.job_consumer,
                    request.worker_id,
                    request.amount,
                    request.source.clone(),
                    self.clock.now(),
                )?;
                (record, true)
            }
        };

        let attempt = self.begin(&record, PaymentOperation::Authorize, record.amount)?;
        let gateway_request = AuthorizeRequest {
            job_id: request.job_id,
            amount_minor: record.amount.minor_units(),
            currency: record.amount.currency(),
            source: record.source.clone().unwrap_or(request.source),
            capture: false,
            idempotency_key: attempt.idempotency_key.clone(),
        };

        self.execute(attempt, insert.then_some(record), |_| {
            self.gateway.authorize(&gateway_request)
        })
    }

    /// Capture a held authorization, fully or partially.
    ///
    /// Idempotent by transaction id: capturing an already-captured authorization with no
    /// amount or the same amount returns the captured record unchanged. A gateway failure
    /// leaves the record untouched, so the call can simply be repeated.
    #[instrument(skip(self), err)]
    pub fn capture(
        &self,
        transaction_id: TransactionId,
        amount: Option<Money>,
    ) -> Result<TransactionRecord, EscrowError> {
        let record = self.require(transaction_id)?;
        let Some(amount) = record.plan_capture(amount, self.clock.now())? else {
            debug!(transaction_id = %record.id, "already captured");
            return Ok(record);
        };
        let intent_id = record
            .gateway
            .intent_id
            .clone()
            .ok_or_else(|| EscrowError::InvalidState("authorization has no gateway hold".into()))?;

        let attempt = self.begin(&record, PaymentOperation::Capture, amount)?;
        self.execute(attempt, None, |key| {
            self.gateway.capture(&intent_id, amount.minor_units(), key)
        })
    }

    /// Refund part (or, with no amount, all) of what was captured.
    ///
    /// Creates a `refund` record pointing at the original; on success the original
    /// becomes `refunded`. A refund interrupted by a transient failure is retried under
    /// the same record and key when requested again with the same amount.
    #[instrument(skip(self, reason), err)]
    pub fn refund(
        &self,
        transaction_id: TransactionId,
        amount: Option<Money>,
        reason: &str,
    ) -> Result<TransactionRecord, EscrowError> {
        let original = self.require(transaction_id)?;
        let amount = original.plan_refund(amount)?;
        let charge_id = original
            .gateway
            .charge_id
            .clone()
            .ok_or_else(|| EscrowError::InvalidState("captured authorization has no charge id".into()))?;

        let (refund, insert) = match self.pending_child(&original, TransactionType::Refund)? {
            Some(pending) if pending.amount == amount => (pending, false),
            Some(pending) => {
                return Err(EscrowError::InvalidState(format!(
                    "refund {} for {} is still in flight",
                    pending.id, pending.amount
                )));
            }
            None => (
                TransactionRecord::refund_of(&original, amount, reason, self.clock.now()),
                true,
            ),
        };

        let attempt = self.begin(&refund, PaymentOperation::Refund, amount)?;
        self.execute(attempt, insert.then_some(refund), |key| {
            self.gateway.refund(&charge_id, amount.minor_units(), key)
        })
    }

    /// Release an uncaptured hold. Recorded as an `adjustment` against the authorization.
    ///
    /// A capture whose outcome is still unknown is resolved first; if the gateway did
    /// capture, the hold is gone and the call fails with `AlreadyCaptured`.
    #[instrument(skip(self, reason), err)]
    pub fn void_authorization(
        &self,
        transaction_id: TransactionId,
        reason: &str,
    ) -> Result<TransactionRecord, EscrowError> {
        let authorization = self.settle_outstanding(transaction_id)?;
        if let Some(captured) = authorization.capture_amount {
            return Err(EscrowError::AlreadyCaptured {
                id: authorization.id,
                captured,
            });
        }
        authorization.ensure_voidable()?;
        let intent_id = authorization
            .gateway
            .intent_id
            .clone()
            .ok_or_else(|| EscrowError::InvalidState("authorization has no gateway hold".into()))?;

        let (adjustment, insert) =
            match self.pending_child(&authorization, TransactionType::Adjustment)? {
                Some(pending) => (pending, false),
                None => (
                    TransactionRecord::void_of(&authorization, reason, self.clock.now()),
                    true,
                ),
            };

        let attempt = self.begin(&adjustment, PaymentOperation::Void, authorization.amount)?;
        self.execute(attempt, insert.then_some(adjustment), |key| {
            self.gateway.cancel(&intent_id, key)
        })
    }

    /// Resolve write-ahead attempts whose outcome is unknown.
    ///
    /// Meant for recovery, when no payment call is in flight.
    #[instrument(skip(self), err)]
    pub fn reconcile(&self) -> Result<ReconciliationReport, EscrowError> {
        let mut report = ReconciliationReport::default();

        for attempt in self.ledger.unresolved_attempts()? {
            report.examined += 1;
            let id = attempt.transaction_id;
            match self.resolve(&attempt) {
                Ok(Resolution::Applied) => report.applied.push(id),
                Ok(Resolution::NotExecuted) => report.not_executed.push(id),
                Err(e) => {
                    warn!(transaction_id = %id, error = %e, "leaving attempt unresolved");
                    report.unresolved.push(id);
                }
            }
        }

        Ok(report)
    }

    /// Resolve the unknown outcomes left on one record and return it as it now stands.
    ///
    /// Callers about to act on a record's status (voiding a hold, say) use this so they
    /// never trust a ledger that lags the gateway. Fails if the gateway cannot be asked.
    #[instrument(skip(self), err)]
    pub fn settle_outstanding(
        &self,
        transaction_id: TransactionId,
    ) -> Result<TransactionRecord, EscrowError> {
        let events = self.ledger.events_for_transaction(transaction_id)?;
        for attempt in jobflow_escrow::unresolved_attempts(&events) {
            self.resolve(attempt)?;
        }
        self.require(transaction_id)
    }

    pub fn transaction(&self, id: TransactionId) -> Result<Option<TransactionRecord>, EscrowError> {
        Ok(self.ledger.get(id)?)
    }

    pub fn transactions_for_job(&self, job_id: JobId) -> Result<Vec<TransactionRecord>, EscrowError> {
        Ok(self.ledger.by_job(job_id)?)
    }

    pub fn transactions_by_gateway_reference(
        &self,
        reference: &str,
    ) -> Result<Vec<TransactionRecord>, EscrowError> {
        Ok(self.ledger.by_gateway_reference(reference)?)
    }

    pub fn payment_events_for_job(&self, job_id: JobId) -> Result<Vec<PaymentEvent>, EscrowError> {
        Ok(self.ledger.events_for_job(job_id)?)
    }

    /// The job's latest authorization that has not failed.
    pub fn authorization_for_job(
        &self,
        job_id: JobId,
    ) -> Result<Option<TransactionRecord>, EscrowError> {
        Ok(self
            .ledger
            .by_job(job_id)?
            .into_iter()
            .filter(|r| {
                r.transaction_type == TransactionType::Authorization
                    && r.status != TransactionStatus::Failed
            })
            .last())
    }

    /// Ask the gateway what it did under the attempt's key and commit the answer.
    fn resolve(&self, attempt: &PaymentEvent) -> Result<Resolution, EscrowError> {
        let id = attempt.transaction_id;
        match self.gateway.lookup(&attempt.idempotency_key)? {
            Some(response) => {
                self.settle(attempt, &response)?;
                info!(transaction_id = %id, operation = attempt.operation.as_str(), "reconciled gateway success");
                Ok(Resolution::Applied)
            }
            None => {
                let failed = attempt.failed("not executed by the gateway", None, self.clock.now());
                self.ledger.commit(LedgerBatch::new().event(failed))?;
                info!(transaction_id = %id, operation = attempt.operation.as_str(), "attempt was never executed");
                Ok(Resolution::NotExecuted)
            }
        }
    }

    fn require(&self, id: TransactionId) -> Result<TransactionRecord, EscrowError> {
        self.ledger.get(id)?.ok_or(EscrowError::NotFound(id))
    }

    fn pending_child(
        &self,
        parent: &TransactionRecord,
        transaction_type: TransactionType,
    ) -> Result<Option<TransactionRecord>, EscrowError> {
        Ok(self.ledger.by_job(parent.job_id)?.into_iter().find(|r| {
            r.transaction_type == transaction_type
                && r.parent_transaction_id == Some(parent.id)
                && r.status == TransactionStatus::Pending
        }))
    }

    /// Build the `attempted` event for the next attempt of `operation` on `record`.
    fn begin(
        &self,
        record: &TransactionRecord,
        operation: PaymentOperation,
        amount: Money,
    ) -> Result<PaymentEvent, EscrowError> {
        let previous = self
            .ledger
            .events_for_transaction(record.id)?
            .iter()
            .filter(|e| e.operation == operation && e.outcome == PaymentOutcome::Attempted)
            .count() as u32;
        Ok(PaymentEvent::attempted(
            record.id,
            record.job_id,
            operation,
            previous + 1,
            amount,
            self.clock.now(),
        ))
    }

    fn execute(
        &self,
        attempt: PaymentEvent,
        insert: Option<TransactionRecord>,
        call: impl FnOnce(&str) -> Result<GatewayResponse, GatewayError>,
    ) -> Result<TransactionRecord, EscrowError> {
        let mut batch = LedgerBatch::new().event(attempt.clone());
        if let Some(record) = insert {
            batch = batch.record(record);
        }
        self.ledger.commit(batch)?;

        debug!(
            transaction_id = %attempt.transaction_id,
            operation = attempt.operation.as_str(),
            attempt = attempt.attempt,
            "calling gateway"
        );
        match call(&attempt.idempotency_key) {
            Ok(response) => {
                let record = self.settle(&attempt, &response)?;
                info!(
                    transaction_id = %record.id,
                    job_id = %record.job_id,
                    operation = attempt.operation.as_str(),
                    status = record.status.as_str(),
                    "payment operation succeeded"
                );
                Ok(record)
            }
            Err(err) => Err(self.record_failure(&attempt, err)),
        }
    }

    /// Commit the success path for `attempt`. Safe to run more than once.
    fn settle(
        &self,
        attempt: &PaymentEvent,
        response: &GatewayResponse,
    ) -> Result<TransactionRecord, EscrowError> {
        let mut last_conflict = None;
        for _ in 0..SETTLE_ATTEMPTS {
            let batch = self.success_batch(attempt, response)?;
            match self.ledger.commit(batch) {
                Ok(_) => return self.require(attempt.transaction_id),
                Err(LedgerError::Conflict(msg)) => {
                    debug!(transaction_id = %attempt.transaction_id, conflict = %msg, "retrying settle");
                    last_conflict = Some(msg);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(LedgerError::Conflict(last_conflict.unwrap_or_default()).into())
    }

    fn success_batch(
        &self,
        attempt: &PaymentEvent,
        response: &GatewayResponse,
    ) -> Result<LedgerBatch, EscrowError> {
        let now = self.clock.now();
        let mut batch = LedgerBatch::new().event(attempt.succeeded(response.metadata(), now));
        let mut record = self.require(attempt.transaction_id)?;

        match attempt.operation {
            PaymentOperation::Authorize => {
                if record.status == TransactionStatus::Pending && record.gateway.intent_id.is_none() {
                    let validity = chrono::Duration::from_std(self.config.authorization_validity)
                        .map_err(|e| EscrowError::Validation(e.to_string()))?;
                    record.mark_authorized(response.reference_id.clone(), validity, now)?;
                    batch = batch.record(record);
                }
            }
            PaymentOperation::Capture => {
                if !record.is_captured() {
                    let captured = Money::from_minor(response.amount_minor, record.amount.currency());
                    let fees = self.config.fees.compute(captured)?;
                    record.mark_captured(captured, Some(response.reference_id.clone()), fees, now)?;
                    batch = batch.record(record);
                }
            }
            PaymentOperation::Refund | PaymentOperation::Void => {
                if record.status == TransactionStatus::Pending {
                    let parent_id = record.parent_transaction_id.ok_or_else(|| {
                        EscrowError::InvalidState(format!("{} has no parent transaction", record.id))
                    })?;
                    let mut parent = self.require(parent_id)?;
                    if attempt.operation == PaymentOperation::Refund {
                        parent.apply_refund(record.amount, now)?;
                    } else {
                        parent.apply_void(now)?;
                    }
                    record.mark_reversal_completed(Some(response.reference_id.clone()), now)?;
                    batch = batch.record(record).record(parent);
                }
            }
        }
        Ok(batch)
    }

    /// Log the failed attempt. A retryable failure is logged as ambiguous and stays open
    /// for reconciliation. A non-retryable one also fails the pending record, except for
    /// captures, which never mutate the authorization on failure.
    fn record_failure(&self, attempt: &PaymentEvent, err: GatewayError) -> EscrowError {
        let now = self.clock.now();
        warn!(
            transaction_id = %attempt.transaction_id,
            operation = attempt.operation.as_str(),
            attempt = attempt.attempt,
            retryable = err.is_retryable(),
            error = %err,
            "payment operation failed"
        );

        let outcome = if err.is_retryable() {
            attempt.ambiguous(err.to_string(), Some(err.metadata()), now)
        } else {
            attempt.failed(err.to_string(), Some(err.metadata()), now)
        };
        let mut batch = LedgerBatch::new().event(outcome);
        if !err.is_retryable() && attempt.operation != PaymentOperation::Capture {
            match self.ledger.get(attempt.transaction_id) {
                Ok(Some(mut record)) if record.status == TransactionStatus::Pending => {
                    if record.mark_failed(err.to_string()).is_ok() {
                        batch = batch.record(record);
                    }
                }
                Ok(_) => {}
                Err(e) => error!(transaction_id = %attempt.transaction_id, error = %e, "failed to load record"),
            }
        }

        if let Err(e) = self.ledger.commit(batch) {
            // The attempt stays unresolved and is picked up by reconciliation.
            error!(transaction_id = %attempt.transaction_id, error = %e, "failed to record payment failure");
        }
        EscrowError::Gateway(err)
    }
}
