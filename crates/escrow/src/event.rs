//! Append-only payment event log.
//!
//! Every gateway-mutating call is bracketed by events sharing one idempotency key:
//! an `attempted` event committed before the call, then a `succeeded` or `failed`
//! event committed with the resulting record changes. An attempt with no outcome
//! means the process stopped mid-call and must be reconciled against the gateway.
//! So does an `ambiguous` one: the call failed in a way (timeout, dropped connection,
//! 5xx) that says nothing about whether the gateway acted.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use jobflow_core::{JobId, Money, TransactionId};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentOperation {
    Authorize,
    Capture,
    Refund,
    Void,
}

impl PaymentOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Authorize => "authorize",
            Self::Capture => "capture",
            Self::Refund => "refund",
            Self::Void => "void",
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentOutcome {
    Attempted,
    Succeeded,
    Failed,
    /// The call failed without telling whether the gateway executed it.
    Ambiguous,
}

impl PaymentOutcome {
    /// Whether the outcome settles what the gateway did under the attempt's key.
    pub fn is_definitive(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Gateway response details worth keeping. `raw` holds the full response body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayMetadata {
    pub reference_id: Option<String>,
    pub status: Option<String>,
    pub http_status: Option<u16>,
    pub error_code: Option<String>,
    pub raw: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentEvent {
    pub id: Uuid,
    /// The record the operation mutates (the refund record for refunds).
    pub transaction_id: TransactionId,
    pub job_id: JobId,
    pub operation: PaymentOperation,
    pub idempotency_key: String,
    pub attempt: u32,
    pub outcome: PaymentOutcome,
    pub amount: Money,
    pub gateway: Option<GatewayMetadata>,
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl PaymentEvent {
    pub fn attempted(
        transaction_id: TransactionId,
        job_id: JobId,
        operation: PaymentOperation,
        attempt: u32,
        amount: Money,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            transaction_id,
            job_id,
            operation,
            idempotency_key: idempotency_key(operation, transaction_id),
            attempt,
            outcome: PaymentOutcome::Attempted,
            amount,
            gateway: None,
            error: None,
            recorded_at: now,
        }
    }

    pub fn succeeded(&self, gateway: GatewayMetadata, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            outcome: PaymentOutcome::Succeeded,
            gateway: Some(gateway),
            error: None,
            recorded_at: now,
            ..self.clone()
        }
    }

    pub fn failed(
        &self,
        error: impl Into<String>,
        gateway: Option<GatewayMetadata>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            outcome: PaymentOutcome::Failed,
            gateway,
            error: Some(error.into()),
            recorded_at: now,
            ..self.clone()
        }
    }

    /// Like [`PaymentEvent::failed`], but the gateway may still have acted.
    pub fn ambiguous(
        &self,
        error: impl Into<String>,
        gateway: Option<GatewayMetadata>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            outcome: PaymentOutcome::Ambiguous,
            ..self.failed(error, gateway, now)
        }
    }
}

/// Idempotency key sent to the gateway for `operation` on `transaction_id`.
///
/// Retries of the same operation reuse the key so the gateway can collapse them.
pub fn idempotency_key(operation: PaymentOperation, transaction_id: TransactionId) -> String {
    format!("{}:{}", operation.as_str(), transaction_id)
}

/// Attempts whose effect at the gateway is still unknown, oldest first.
///
/// All attempts of one operation share an idempotency key, so a definitive outcome for
/// attempt `n` also settles every earlier attempt under that key. Only the latest open
/// attempt per key is returned.
pub fn unresolved_attempts(events: &[PaymentEvent]) -> Vec<&PaymentEvent> {
    let mut settled: HashMap<&str, u32> = HashMap::new();
    let mut latest: HashMap<&str, &PaymentEvent> = HashMap::new();
    for event in events {
        let key = event.idempotency_key.as_str();
        if event.outcome.is_definitive() {
            let high = settled.entry(key).or_default();
            *high = (*high).max(event.attempt);
        } else if event.outcome == PaymentOutcome::Attempted
            && latest.get(key).is_none_or(|e| e.attempt < event.attempt)
        {
            latest.insert(key, event);
        }
    }

    let mut open: Vec<&PaymentEvent> = latest
        .into_values()
        .filter(|e| {
            settled
                .get(e.idempotency_key.as_str())
                .is_none_or(|high| *high < e.attempt)
        })
        .collect();
    open.sort_by_key(|e| (e.recorded_at, e.id));
    open
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobflow_core::Currency;

    fn attempt(tx: TransactionId, attempt: u32) -> PaymentEvent {
        PaymentEvent::attempted(
            tx,
            JobId::new(),
            PaymentOperation::Capture,
            attempt,
            Money::from_minor(100, Currency::Usd),
            Utc::now(),
        )
    }

    #[test]
    fn keys_are_stable_per_operation_and_transaction() {
        let tx = TransactionId::new();
        assert_eq!(
            idempotency_key(PaymentOperation::Capture, tx),
            attempt(tx, 2).idempotency_key
        );
        assert_ne!(
            idempotency_key(PaymentOperation::Capture, tx),
            idempotency_key(PaymentOperation::Refund, tx)
        );
    }

    #[test]
    fn only_attempts_without_outcome_are_unresolved() {
        let tx = TransactionId::new();
        let first = attempt(tx, 1);
        let first_failed = first.failed("gateway 500", None, Utc::now());
        let second = attempt(tx, 2);

        let log = vec![first, first_failed, second.clone()];
        let open = unresolved_attempts(&log);
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].attempt, 2);

        let mut log = log;
        log.push(second.succeeded(GatewayMetadata::default(), Utc::now()));
        assert!(unresolved_attempts(&log).is_empty());
    }

    #[test]
    fn ambiguous_failures_stay_open_until_a_later_attempt_settles_the_key() {
        let tx = TransactionId::new();
        let first = attempt(tx, 1);
        let lost = first.ambiguous("connection reset", None, Utc::now());

        let mut log = vec![first, lost];
        let open = unresolved_attempts(&log);
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].attempt, 1);

        // A second attempt under the same key replaces the first as the one to resolve.
        let second = attempt(tx, 2);
        log.push(second.clone());
        let open = unresolved_attempts(&log);
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].attempt, 2);

        log.push(second.failed("not executed by the gateway", None, Utc::now()));
        assert!(unresolved_attempts(&log).is_empty());
    }
}
