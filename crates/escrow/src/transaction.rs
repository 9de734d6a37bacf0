//! Transaction records: one row per financial operation.
//!
//! An `authorization` record follows the hold through its life: it stays `pending`
//! while the funds are only held, becomes `completed` once captured and `refunded`
//! after any refund (or a void of the uncaptured hold). Refunds and voids get their own
//! `refund` / `adjustment` records pointing back at the authorization.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use jobflow_core::{ConsumerId, JobId, Money, TransactionId, WorkerId};

use crate::fees::FeeBreakdown;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Authorization,
    Capture,
    Refund,
    Adjustment,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Authorization => "authorization",
            Self::Capture => "capture",
            Self::Refund => "refund",
            Self::Adjustment => "adjustment",
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Refunded => "refunded",
        }
    }

    /// Status only moves forward: pending → completed → refunded, or pending → failed.
    pub fn can_become(&self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (Pending, Pending)
                | (Pending, Completed)
                | (Pending, Failed)
                | (Pending, Refunded)
                | (Completed, Completed)
                | (Completed, Refunded)
                | (Refunded, Refunded)
                | (Failed, Failed)
        )
    }
}

/// Violations of the capture/refund rules. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PaymentRuleError {
    #[error("transaction {id} is a {actual:?}, expected {expected:?}")]
    WrongType {
        id: TransactionId,
        expected: TransactionType,
        actual: TransactionType,
    },

    #[error("transaction {id} is {status:?}: {reason}")]
    InvalidState {
        id: TransactionId,
        status: TransactionStatus,
        reason: String,
    },

    #[error("transaction {id} was already captured for {captured}")]
    AlreadyCaptured { id: TransactionId, captured: Money },

    #[error("requested {requested} exceeds the available {available}")]
    AmountExceeded { requested: Money, available: Money },

    #[error("invalid amount: {0}")]
    InvalidAmount(String),
}

/// External identifiers returned by the card gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayRefs {
    /// Hold / payment-intent id returned by authorization.
    pub intent_id: Option<String>,
    /// Charge id returned by capture.
    pub charge_id: Option<String>,
    /// Refund or cancellation id.
    pub refund_id: Option<String>,
}

impl GatewayRefs {
    pub fn contains(&self, reference: &str) -> bool {
        [&self.intent_id, &self.charge_id, &self.refund_id]
            .into_iter()
            .any(|r| r.as_deref() == Some(reference))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: TransactionId,
    pub job_id: JobId,
    pub consumer_id: ConsumerId,
    pub worker_id: Option<WorkerId>,
    pub transaction_type: TransactionType,
    pub status: TransactionStatus,
    /// Authorized amount for authorizations, the refunded amount for refunds.
    pub amount: Money,
    pub gateway: GatewayRefs,
    /// Opaque payment source token (card/customer reference).
    pub source: Option<String>,
    pub reason: Option<String>,
    pub parent_transaction_id: Option<TransactionId>,

    pub created_at: DateTime<Utc>,
    pub authorized_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub captured_at: Option<DateTime<Utc>>,
    pub capture_amount: Option<Money>,
    pub escrow_released_at: Option<DateTime<Utc>>,
    pub refunded_at: Option<DateTime<Utc>>,
    /// Cumulative amount refunded against this record.
    pub refunded_amount: Option<Money>,
    pub fees: Option<FeeBreakdown>,
    pub failure_reason: Option<String>,

    /// Optimistic-concurrency revision, bumped by the ledger on every write.
    pub revision: u64,
}

impl TransactionRecord {
    /// A new authorization, pending until the gateway confirms the hold.
    pub fn authorization(
        job_id: JobId,
        consumer_id: ConsumerId,
        worker_id: Option<WorkerId>,
        amount: Money,
        source: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Self, PaymentRuleError> {
        if amount.is_zero() {
            return Err(PaymentRuleError::InvalidAmount(
                "authorization amount must be positive".into(),
            ));
        }
        Ok(Self::new(
            TransactionType::Authorization,
            job_id,
            consumer_id,
            worker_id,
            amount,
            Some(source.into()),
            None,
            None,
            now,
        ))
    }

    /// A new refund against `parent`, pending until the gateway confirms it.
    pub fn refund_of(
        parent: &TransactionRecord,
        amount: Money,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self::new(
            TransactionType::Refund,
            parent.job_id,
            parent.consumer_id,
            parent.worker_id,
            amount,
            None,
            Some(reason.into()),
            Some(parent.id),
            now,
        )
    }

    /// An adjustment recording the release of an uncaptured hold, pending until the
    /// gateway confirms the cancellation.
    pub fn void_of(
        parent: &TransactionRecord,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self::new(
            TransactionType::Adjustment,
            parent.job_id,
            parent.consumer_id,
            parent.worker_id,
            parent.amount,
            None,
            Some(reason.into()),
            Some(parent.id),
            now,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        transaction_type: TransactionType,
        job_id: JobId,
        consumer_id: ConsumerId,
        worker_id: Option<WorkerId>,
        amount: Money,
        source: Option<String>,
        reason: Option<String>,
        parent_transaction_id: Option<TransactionId>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TransactionId::new(),
            job_id,
            consumer_id,
            worker_id,
            transaction_type,
            status: TransactionStatus::Pending,
            amount,
            gateway: GatewayRefs::default(),
            source,
            reason,
            parent_transaction_id,
            created_at: now,
            authorized_at: None,
            expires_at: None,
            captured_at: None,
            capture_amount: None,
            escrow_released_at: None,
            refunded_at: None,
            refunded_amount: None,
            fees: None,
            failure_reason: None,
            revision: 0,
        }
    }

    pub fn is_captured(&self) -> bool {
        self.capture_amount.is_some()
    }

    /// Captured amount not yet refunded.
    pub fn refundable(&self) -> Money {
        let captured = self
            .capture_amount
            .unwrap_or_else(|| Money::zero(self.amount.currency()));
        let refunded = self
            .refunded_amount
            .unwrap_or_else(|| Money::zero(self.amount.currency()));
        captured
            .checked_sub(refunded)
            .unwrap_or_else(|_| Money::zero(self.amount.currency()))
    }

    fn ensure_type(&self, expected: TransactionType) -> Result<(), PaymentRuleError> {
        if self.transaction_type != expected {
            return Err(PaymentRuleError::WrongType {
                id: self.id,
                expected,
                actual: self.transaction_type,
            });
        }
        Ok(())
    }

    fn invalid_state(&self, reason: impl Into<String>) -> PaymentRuleError {
        PaymentRuleError::InvalidState {
            id: self.id,
            status: self.status,
            reason: reason.into(),
        }
    }

    /// Decide what a capture request means for this record.
    ///
    /// Returns `Ok(None)` when the capture already happened with a compatible amount,
    /// so the caller can hand back the existing record unchanged.
    pub fn plan_capture(
        &self,
        requested: Option<Money>,
        now: DateTime<Utc>,
    ) -> Result<Option<Money>, PaymentRuleError> {
        self.ensure_type(TransactionType::Authorization)?;

        if let Some(captured) = self.capture_amount {
            return match requested {
                None => Ok(None),
                Some(amount) if amount == captured => Ok(None),
                Some(_) => Err(PaymentRuleError::AlreadyCaptured {
                    id: self.id,
                    captured,
                }),
            };
        }

        if self.status != TransactionStatus::Pending {
            return Err(self.invalid_state("only a held authorization can be captured"));
        }
        if self.gateway.intent_id.is_none() {
            return Err(self.invalid_state("authorization was never confirmed by the gateway"));
        }
        if self.expires_at.is_some_and(|at| now >= at) {
            return Err(self.invalid_state("authorization has expired"));
        }

        let amount = requested.unwrap_or(self.amount);
        if amount.currency() != self.amount.currency() {
            return Err(PaymentRuleError::InvalidAmount(format!(
                "capture currency {} does not match authorization {}",
                amount.currency(),
                self.amount.currency()
            )));
        }
        if amount.is_zero() {
            return Err(PaymentRuleError::InvalidAmount(
                "capture amount must be positive".into(),
            ));
        }
        if amount.minor_units() > self.amount.minor_units() {
            return Err(PaymentRuleError::AmountExceeded {
                requested: amount,
                available: self.amount,
            });
        }
        Ok(Some(amount))
    }

    /// Validate a refund request against this (captured) record; returns the amount to refund.
    pub fn plan_refund(&self, requested: Option<Money>) -> Result<Money, PaymentRuleError> {
        self.ensure_type(TransactionType::Authorization)?;
        if !self.is_captured() {
            return Err(self.invalid_state("nothing has been captured"));
        }

        let available = self.refundable();
        if available.is_zero() {
            return Err(self.invalid_state("captured amount is already fully refunded"));
        }

        let amount = requested.unwrap_or(available);
        if amount.currency() != available.currency() {
            return Err(PaymentRuleError::InvalidAmount(format!(
                "refund currency {} does not match {}",
                amount.currency(),
                available.currency()
            )));
        }
        if amount.is_zero() {
            return Err(PaymentRuleError::InvalidAmount(
                "refund amount must be positive".into(),
            ));
        }
        if amount.minor_units() > available.minor_units() {
            return Err(PaymentRuleError::AmountExceeded {
                requested: amount,
                available,
            });
        }
        Ok(amount)
    }

    pub fn ensure_voidable(&self) -> Result<(), PaymentRuleError> {
        self.ensure_type(TransactionType::Authorization)?;
        if self.is_captured() || self.status != TransactionStatus::Pending {
            return Err(self.invalid_state("only an uncaptured hold can be voided"));
        }
        Ok(())
    }

    fn set_status(&mut self, next: TransactionStatus) -> Result<(), PaymentRuleError> {
        if !self.status.can_become(next) {
            return Err(self.invalid_state(format!("cannot become {}", next.as_str())));
        }
        self.status = next;
        Ok(())
    }

    pub fn mark_authorized(
        &mut self,
        intent_id: String,
        validity: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), PaymentRuleError> {
        self.set_status(TransactionStatus::Pending)?;
        self.gateway.intent_id = Some(intent_id);
        self.authorized_at = Some(now);
        self.expires_at = Some(now + validity);
        Ok(())
    }

    pub fn mark_captured(
        &mut self,
        amount: Money,
        charge_id: Option<String>,
        fees: FeeBreakdown,
        now: DateTime<Utc>,
    ) -> Result<(), PaymentRuleError> {
        if amount.minor_units() > self.amount.minor_units() {
            return Err(PaymentRuleError::AmountExceeded {
                requested: amount,
                available: self.amount,
            });
        }
        self.set_status(TransactionStatus::Completed)?;
        self.capture_amount = Some(amount);
        self.captured_at = Some(now);
        self.escrow_released_at = Some(now);
        self.gateway.charge_id = charge_id;
        self.fees = Some(fees);
        Ok(())
    }

    /// Record a successful refund of `amount` against this authorization.
    pub fn apply_refund(&mut self, amount: Money, now: DateTime<Utc>) -> Result<(), PaymentRuleError> {
        let available = self.refundable();
        if amount.minor_units() > available.minor_units() {
            return Err(PaymentRuleError::AmountExceeded {
                requested: amount,
                available,
            });
        }
        self.set_status(TransactionStatus::Refunded)?;
        let previous = self
            .refunded_amount
            .unwrap_or_else(|| Money::zero(amount.currency()));
        self.refunded_amount = Some(
            previous
                .checked_add(amount)
                .map_err(|e| PaymentRuleError::InvalidAmount(e.to_string()))?,
        );
        self.refunded_at = Some(now);
        Ok(())
    }

    /// Record the release of an uncaptured hold.
    pub fn apply_void(&mut self, now: DateTime<Utc>) -> Result<(), PaymentRuleError> {
        self.ensure_voidable()?;
        self.set_status(TransactionStatus::Refunded)?;
        self.refunded_at = Some(now);
        self.escrow_released_at = Some(now);
        Ok(())
    }

    /// A refund or void adjustment confirmed by the gateway.
    pub fn mark_reversal_completed(
        &mut self,
        refund_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), PaymentRuleError> {
        if !matches!(
            self.transaction_type,
            TransactionType::Refund | TransactionType::Adjustment
        ) {
            return Err(PaymentRuleError::WrongType {
                id: self.id,
                expected: TransactionType::Refund,
                actual: self.transaction_type,
            });
        }
        self.set_status(TransactionStatus::Completed)?;
        self.gateway.refund_id = refund_id;
        self.refunded_at = Some(now);
        Ok(())
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) -> Result<(), PaymentRuleError> {
        self.set_status(TransactionStatus::Failed)?;
        self.failure_reason = Some(reason.into());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fees::FeeSchedule;
    use jobflow_core::Currency;
    use proptest::prelude::*;

    fn usd(minor: u64) -> Money {
        Money::from_minor(minor, Currency::Usd)
    }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn held(amount: u64) -> TransactionRecord {
        let mut record = TransactionRecord::authorization(
            JobId::new(),
            ConsumerId::new(),
            Some(WorkerId::new()),
            usd(amount),
            "tok_visa",
            now(),
        )
        .unwrap();
        record
            .mark_authorized("pi_1".into(), Duration::days(7), now())
            .unwrap();
        record
    }

    fn captured(amount: u64) -> TransactionRecord {
        let mut record = held(amount);
        let fees = FeeSchedule::default().compute(usd(amount)).unwrap();
        record
            .mark_captured(usd(amount), Some("ch_1".into()), fees, now())
            .unwrap();
        record
    }

    #[test]
    fn capture_defaults_to_the_authorized_amount() {
        assert_eq!(held(10_000).plan_capture(None, now()).unwrap(), Some(usd(10_000)));
    }

    #[test]
    fn capture_above_authorization_is_rejected() {
        let err = held(10_000).plan_capture(Some(usd(10_001)), now()).unwrap_err();
        assert!(matches!(err, PaymentRuleError::AmountExceeded { .. }));
    }

    #[test]
    fn second_capture_is_idempotent_or_rejected() {
        let record = captured(10_000);
        assert_eq!(record.plan_capture(None, now()).unwrap(), None);
        assert_eq!(record.plan_capture(Some(usd(10_000)), now()).unwrap(), None);
        assert!(matches!(
            record.plan_capture(Some(usd(5_000)), now()),
            Err(PaymentRuleError::AlreadyCaptured { .. })
        ));
    }

    #[test]
    fn expired_hold_cannot_be_captured() {
        let err = held(500)
            .plan_capture(None, now() + Duration::days(8))
            .unwrap_err();
        assert!(matches!(err, PaymentRuleError::InvalidState { .. }));
    }

    #[test]
    fn partial_refunds_accumulate_up_to_the_capture() {
        let mut record = captured(10_000);
        assert_eq!(record.plan_refund(Some(usd(4_000))).unwrap(), usd(4_000));
        record.apply_refund(usd(4_000), now()).unwrap();
        assert_eq!(record.status, TransactionStatus::Refunded);
        assert_eq!(record.refundable(), usd(6_000));

        assert!(matches!(
            record.plan_refund(Some(usd(6_001))),
            Err(PaymentRuleError::AmountExceeded { .. })
        ));
        assert_eq!(record.plan_refund(None).unwrap(), usd(6_000));
        record.apply_refund(usd(6_000), now()).unwrap();
        assert!(record.plan_refund(None).is_err());
    }

    #[test]
    fn refund_requires_a_capture() {
        assert!(matches!(
            held(100).plan_refund(None),
            Err(PaymentRuleError::InvalidState { .. })
        ));
    }

    #[test]
    fn status_never_leaves_failed_or_refunded() {
        let mut record = held(100);
        record.mark_failed("declined").unwrap();
        assert!(record.mark_captured(usd(100), None, FeeSchedule::default().compute(usd(100)).unwrap(), now()).is_err());

        let mut record = captured(100);
        record.apply_refund(usd(100), now()).unwrap();
        assert!(record.mark_failed("late").is_err());
    }

    #[test]
    fn void_only_applies_to_uncaptured_holds() {
        let mut record = held(100);
        record.apply_void(now()).unwrap();
        assert_eq!(record.status, TransactionStatus::Refunded);
        assert!(captured(100).ensure_voidable().is_err());
    }

    #[test]
    fn reversal_records_complete_once_confirmed() {
        let parent = captured(100);
        let mut refund = TransactionRecord::refund_of(&parent, usd(40), "customer request", now());
        assert_eq!(refund.status, TransactionStatus::Pending);
        assert_eq!(refund.parent_transaction_id, Some(parent.id));
        refund.mark_reversal_completed(Some("re_1".into()), now()).unwrap();
        assert_eq!(refund.status, TransactionStatus::Completed);

        let mut void = TransactionRecord::void_of(&held(100), "cancelled", now());
        void.mark_reversal_completed(Some("pi_1".into()), now()).unwrap();
        assert_eq!(void.transaction_type, TransactionType::Adjustment);

        assert!(held(100).mark_reversal_completed(None, now()).is_err());
    }

    #[test]
    fn gateway_reference_lookup_matches_any_ref() {
        let record = captured(100);
        assert!(record.gateway.contains("pi_1"));
        assert!(record.gateway.contains("ch_1"));
        assert!(!record.gateway.contains("re_1"));
    }

    proptest! {
        /// Whatever amount is requested, an accepted capture never exceeds the hold.
        #[test]
        fn accepted_capture_never_exceeds_authorization(
            authorized in 1u64..1_000_000,
            requested in 0u64..2_000_000,
        ) {
            let record = held(authorized);
            if let Ok(Some(amount)) = record.plan_capture(Some(usd(requested)), now()) {
                prop_assert!(amount.minor_units() <= authorized);
            }
        }

        /// Refund plans never exceed what is left of the capture.
        #[test]
        fn accepted_refunds_never_exceed_capture(
            captured_minor in 1u64..1_000_000,
            requests in prop::collection::vec(1u64..500_000, 1..8),
        ) {
            let mut record = captured(captured_minor);
            for requested in requests {
                if let Ok(amount) = record.plan_refund(Some(usd(requested))) {
                    record.apply_refund(amount, now()).unwrap();
                }
            }
            let refunded = record.refunded_amount.map(|m| m.minor_units()).unwrap_or(0);
            prop_assert!(refunded <= captured_minor);
        }
    }
}
