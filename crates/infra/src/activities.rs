//! Activity adapters: the small side-effecting steps the controller invokes.
//!
//! Each activity either succeeds, fails transiently (the controller retries it on a
//! durable timer) or fails fatally (the execution aborts into `failed`). The standard
//! implementation looks jobs up in a [`JobCatalog`] and talks to people through a
//! [`Notifier`]; both are swappable.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use jobflow_core::{ConsumerId, JobId, Money, TransactionId, WorkerId};
use jobflow_lifecycle::{Finalizer, PricingInput};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActivityError {
    #[error("transient activity failure: {0}")]
    Retryable(String),

    #[error("activity failed: {0}")]
    Fatal(String),
}

impl ActivityError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ActivityError::Retryable(_))
    }
}

/// What the marketplace knows about a job before orchestration starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobListing {
    pub job_id: JobId,
    /// The consumer who posted (and pays for) the job.
    pub consumer_id: ConsumerId,
    pub pricing: PricingInput,
    /// Tokenized payment source used for the authorization.
    pub payment_source: String,
}

pub trait JobCatalog: Send + Sync {
    fn listing(&self, job_id: JobId) -> Result<Option<JobListing>, ActivityError>;
}

impl<C> JobCatalog for std::sync::Arc<C>
where
    C: JobCatalog + ?Sized,
{
    fn listing(&self, job_id: JobId) -> Result<Option<JobListing>, ActivityError> {
        (**self).listing(job_id)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryJobCatalog {
    listings: RwLock<HashMap<JobId, JobListing>>,
}

impl InMemoryJobCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, listing: JobListing) {
        if let Ok(mut listings) = self.listings.write() {
            listings.insert(listing.job_id, listing);
        }
    }
}

impl JobCatalog for InMemoryJobCatalog {
    fn listing(&self, job_id: JobId) -> Result<Option<JobListing>, ActivityError> {
        self.listings
            .read()
            .map(|l| l.get(&job_id).cloned())
            .map_err(|_| ActivityError::Retryable("job catalog lock poisoned".into()))
    }
}

/// Outbound messages to consumers, workers and operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    OfferSent { job_id: JobId, amount: Money },
    JobScheduled { job_id: JobId, worker_id: WorkerId },
    ReviewsRequested { job_id: JobId, deadline: DateTime<Utc> },
    JobClosed { job_id: JobId, reviews_received: u32 },
    JobRejected { job_id: JobId },
    NoWorkerAvailable { job_id: JobId },
    PaymentFailed { job_id: JobId, reason: String },
    PaymentRetriesExhausted {
        job_id: JobId,
        transaction_id: TransactionId,
        reason: String,
    },
    JobCancelled { job_id: JobId, reason: String },
    JobFailed { job_id: JobId, reason: String },
}

impl Notification {
    pub fn job_id(&self) -> JobId {
        match self {
            Notification::OfferSent { job_id, .. }
            | Notification::JobScheduled { job_id, .. }
            | Notification::ReviewsRequested { job_id, .. }
            | Notification::JobClosed { job_id, .. }
            | Notification::JobRejected { job_id }
            | Notification::NoWorkerAvailable { job_id }
            | Notification::PaymentFailed { job_id, .. }
            | Notification::PaymentRetriesExhausted { job_id, .. }
            | Notification::JobCancelled { job_id, .. }
            | Notification::JobFailed { job_id, .. } => *job_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Notification::OfferSent { .. } => "offer_sent",
            Notification::JobScheduled { .. } => "job_scheduled",
            Notification::ReviewsRequested { .. } => "reviews_requested",
            Notification::JobClosed { .. } => "job_closed",
            Notification::JobRejected { .. } => "job_rejected",
            Notification::NoWorkerAvailable { .. } => "no_worker_available",
            Notification::PaymentFailed { .. } => "payment_failed",
            Notification::PaymentRetriesExhausted { .. } => "payment_retries_exhausted",
            Notification::JobCancelled { .. } => "job_cancelled",
            Notification::JobFailed { .. } => "job_failed",
        }
    }
}

/// Delivery channel for [`Notification`]s (email, push, ops pager...).
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &Notification) -> Result<(), ActivityError>;
}

impl<N> Notifier for std::sync::Arc<N>
where
    N: Notifier + ?Sized,
{
    fn notify(&self, notification: &Notification) -> Result<(), ActivityError> {
        (**self).notify(notification)
    }
}

/// Writes notifications to the log. The default when no delivery channel is wired.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notification: &Notification) -> Result<(), ActivityError> {
        let payload = serde_json::to_string(notification)
            .map_err(|e| ActivityError::Fatal(format!("unserializable notification: {e}")))?;
        info!(
            job_id = %notification.job_id(),
            kind = notification.kind(),
            payload = %payload,
            "notification"
        );
        Ok(())
    }
}

/// Keeps every notification in memory; can be told to fail the next deliveries.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    failures: Mutex<HashMap<&'static str, u32>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` notifications of `kind` with a retryable error.
    pub fn fail_next(&self, kind: &'static str, times: u32) {
        if let Ok(mut failures) = self.failures.lock() {
            *failures.entry(kind).or_default() += times;
        }
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn kinds_for(&self, job_id: JobId) -> Vec<&'static str> {
        self.sent()
            .iter()
            .filter(|n| n.job_id() == job_id)
            .map(Notification::kind)
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: &Notification) -> Result<(), ActivityError> {
        let mut failures = self
            .failures
            .lock()
            .map_err(|_| ActivityError::Retryable("notifier lock poisoned".into()))?;
        if let Some(left) = failures.get_mut(notification.kind()) {
            if *left > 0 {
                *left -= 1;
                return Err(ActivityError::Retryable(format!(
                    "{} delivery unavailable",
                    notification.kind()
                )));
            }
        }
        drop(failures);

        self.sent
            .lock()
            .map_err(|_| ActivityError::Retryable("notifier lock poisoned".into()))?
            .push(notification.clone());
        Ok(())
    }
}

/// Who pays for a job and with what.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentParty {
    pub consumer_id: ConsumerId,
    pub source: String,
}

/// The activity contracts the controller depends on.
pub trait JobActivities: Send + Sync {
    /// Fatal on lookup failure.
    fn price_job(&self, job_id: JobId) -> Result<Money, ActivityError>;

    fn send_job_offer(&self, job_id: JobId, amount: Money) -> Result<(), ActivityError>;

    fn schedule_job(&self, job_id: JobId, worker_id: WorkerId) -> Result<(), ActivityError>;

    fn payment_party(&self, job_id: JobId) -> Result<PaymentParty, ActivityError>;

    /// Failures are logged by the caller and never block the review window.
    fn request_reviews(&self, job_id: JobId, deadline: DateTime<Utc>)
    -> Result<(), ActivityError>;

    fn close_job(&self, job_id: JobId, reviews_received: u32) -> Result<(), ActivityError>;

    fn handle_job_rejection(&self, job_id: JobId) -> Result<(), ActivityError>;

    fn handle_no_worker_available(&self, job_id: JobId) -> Result<(), ActivityError>;

    fn handle_payment_failure(&self, job_id: JobId, reason: &str) -> Result<(), ActivityError>;

    fn handle_cancellation(&self, job_id: JobId, reason: &str) -> Result<(), ActivityError>;

    fn handle_failure(&self, job_id: JobId, reason: &str) -> Result<(), ActivityError>;

    /// Final notice once out-of-band payment retries gave up.
    fn handle_payment_retries_exhausted(
        &self,
        job_id: JobId,
        transaction_id: TransactionId,
        reason: &str,
    ) -> Result<(), ActivityError>;
}

impl<A> JobActivities for std::sync::Arc<A>
where
    A: JobActivities + ?Sized,
{
    fn price_job(&self, job_id: JobId) -> Result<Money, ActivityError> {
        (**self).price_job(job_id)
    }

    fn send_job_offer(&self, job_id: JobId, amount: Money) -> Result<(), ActivityError> {
        (**self).send_job_offer(job_id, amount)
    }

    fn schedule_job(&self, job_id: JobId, worker_id: WorkerId) -> Result<(), ActivityError> {
        (**self).schedule_job(job_id, worker_id)
    }

    fn payment_party(&self, job_id: JobId) -> Result<PaymentParty, ActivityError> {
        (**self).payment_party(job_id)
    }

    fn request_reviews(
        &self,
        job_id: JobId,
        deadline: DateTime<Utc>,
    ) -> Result<(), ActivityError> {
        (**self).request_reviews(job_id, deadline)
    }

    fn close_job(&self, job_id: JobId, reviews_received: u32) -> Result<(), ActivityError> {
        (**self).close_job(job_id, reviews_received)
    }

    fn handle_job_rejection(&self, job_id: JobId) -> Result<(), ActivityError> {
        (**self).handle_job_rejection(job_id)
    }

    fn handle_no_worker_available(&self, job_id: JobId) -> Result<(), ActivityError> {
        (**self).handle_no_worker_available(job_id)
    }

    fn handle_payment_failure(&self, job_id: JobId, reason: &str) -> Result<(), ActivityError> {
        (**self).handle_payment_failure(job_id, reason)
    }

    fn handle_cancellation(&self, job_id: JobId, reason: &str) -> Result<(), ActivityError> {
        (**self).handle_cancellation(job_id, reason)
    }

    fn handle_failure(&self, job_id: JobId, reason: &str) -> Result<(), ActivityError> {
        (**self).handle_failure(job_id, reason)
    }

    fn handle_payment_retries_exhausted(
        &self,
        job_id: JobId,
        transaction_id: TransactionId,
        reason: &str,
    ) -> Result<(), ActivityError> {
        (**self).handle_payment_retries_exhausted(job_id, transaction_id, reason)
    }
}

/// Run the finalizer owed by a terminal (or halted) state.
pub fn run_finalizer(
    activities: &dyn JobActivities,
    job_id: JobId,
    finalizer: Finalizer,
    reviews_received: u32,
    reason: &str,
) -> Result<(), ActivityError> {
    match finalizer {
        Finalizer::Close => activities.close_job(job_id, reviews_received),
        Finalizer::Rejection => activities.handle_job_rejection(job_id),
        Finalizer::NoWorkerAvailable => activities.handle_no_worker_available(job_id),
        Finalizer::PaymentFailure => activities.handle_payment_failure(job_id, reason),
        Finalizer::Cancellation => activities.handle_cancellation(job_id, reason),
        Finalizer::Failure => activities.handle_failure(job_id, reason),
    }
}

pub struct StandardActivities<C, N> {
    catalog: C,
    notifier: N,
}

impl<C, N> StandardActivities<C, N>
where
    C: JobCatalog,
    N: Notifier,
{
    pub fn new(catalog: C, notifier: N) -> Self {
        Self { catalog, notifier }
    }

    pub fn notifier(&self) -> &N {
        &self.notifier
    }

    fn listing(&self, job_id: JobId) -> Result<JobListing, ActivityError> {
        self.catalog
            .listing(job_id)?
            .ok_or_else(|| ActivityError::Fatal(format!("job {job_id} is not listed")))
    }
}

impl<C, N> JobActivities for StandardActivities<C, N>
where
    C: JobCatalog,
    N: Notifier,
{
    fn price_job(&self, job_id: JobId) -> Result<Money, ActivityError> {
        // Pricing is never retried: a missing listing or bad rate is a fatal error.
        let listing = self.listing(job_id).map_err(|e| match e {
            ActivityError::Retryable(msg) => ActivityError::Fatal(msg),
            fatal => fatal,
        })?;
        let amount = listing
            .pricing
            .price()
            .map_err(|e| ActivityError::Fatal(format!("pricing failed: {e}")))?;
        info!(job_id = %job_id, amount = %amount, "job priced");
        Ok(amount)
    }

    fn send_job_offer(&self, job_id: JobId, amount: Money) -> Result<(), ActivityError> {
        self.notifier
            .notify(&Notification::OfferSent { job_id, amount })
    }

    fn schedule_job(&self, job_id: JobId, worker_id: WorkerId) -> Result<(), ActivityError> {
        self.notifier
            .notify(&Notification::JobScheduled { job_id, worker_id })
    }

    fn payment_party(&self, job_id: JobId) -> Result<PaymentParty, ActivityError> {
        let listing = self.listing(job_id)?;
        Ok(PaymentParty {
            consumer_id: listing.consumer_id,
            source: listing.payment_source,
        })
    }

    fn request_reviews(
        &self,
        job_id: JobId,
        deadline: DateTime<Utc>,
    ) -> Result<(), ActivityError> {
        self.notifier
            .notify(&Notification::ReviewsRequested { job_id, deadline })
    }

    fn close_job(&self, job_id: JobId, reviews_received: u32) -> Result<(), ActivityError> {
        self.notifier.notify(&Notification::JobClosed {
            job_id,
            reviews_received,
        })
    }

    fn handle_job_rejection(&self, job_id: JobId) -> Result<(), ActivityError> {
        self.notifier.notify(&Notification::JobRejected { job_id })
    }

    fn handle_no_worker_available(&self, job_id: JobId) -> Result<(), ActivityError> {
        warn!(job_id = %job_id, "no worker available");
        self.notifier
            .notify(&Notification::NoWorkerAvailable { job_id })
    }

    fn handle_payment_failure(&self, job_id: JobId, reason: &str) -> Result<(), ActivityError> {
        self.notifier.notify(&Notification::PaymentFailed {
            job_id,
            reason: reason.to_string(),
        })
    }

    fn handle_cancellation(&self, job_id: JobId, reason: &str) -> Result<(), ActivityError> {
        self.notifier.notify(&Notification::JobCancelled {
            job_id,
            reason: reason.to_string(),
        })
    }

    fn handle_failure(&self, job_id: JobId, reason: &str) -> Result<(), ActivityError> {
        self.notifier.notify(&Notification::JobFailed {
            job_id,
            reason: reason.to_string(),
        })
    }

    fn handle_payment_retries_exhausted(
        &self,
        job_id: JobId,
        transaction_id: TransactionId,
        reason: &str,
    ) -> Result<(), ActivityError> {
        self.notifier.notify(&Notification::PaymentRetriesExhausted {
            job_id,
            transaction_id,
            reason: reason.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobflow_core::Currency;
    use jobflow_lifecycle::Urgency;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn listing(job_id: JobId) -> JobListing {
        JobListing {
            job_id,
            consumer_id: ConsumerId::new(),
            pricing: PricingInput {
                base_rate: dec!(40),
                duration_hours: dec!(2),
                urgency: Urgency::Priority,
                currency: Currency::Usd,
            },
            payment_source: "tok_visa".into(),
        }
    }

    fn activities() -> (
        StandardActivities<Arc<InMemoryJobCatalog>, Arc<RecordingNotifier>>,
        Arc<InMemoryJobCatalog>,
        Arc<RecordingNotifier>,
    ) {
        let catalog = Arc::new(InMemoryJobCatalog::new());
        let notifier = Arc::new(RecordingNotifier::new());
        (
            StandardActivities::new(catalog.clone(), notifier.clone()),
            catalog,
            notifier,
        )
    }

    #[test]
    fn prices_from_the_listing() {
        let (activities, catalog, _) = activities();
        let job = JobId::new();
        catalog.insert(listing(job));

        assert_eq!(
            activities.price_job(job).unwrap(),
            Money::from_minor(10_000, Currency::Usd)
        );
    }

    #[test]
    fn pricing_an_unknown_job_is_fatal() {
        let (activities, _, _) = activities();
        let err = activities.price_job(JobId::new()).unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn notifier_outage_is_retryable() {
        let (activities, _, notifier) = activities();
        let job = JobId::new();
        notifier.fail_next("offer_sent", 1);

        let amount = Money::from_minor(500, Currency::Usd);
        assert!(activities.send_job_offer(job, amount).unwrap_err().is_retryable());
        activities.send_job_offer(job, amount).unwrap();
        assert_eq!(notifier.kinds_for(job), vec!["offer_sent"]);
    }

    #[test]
    fn finalizers_map_to_their_handlers() {
        let (activities, _, notifier) = activities();
        let job = JobId::new();
        for finalizer in [
            Finalizer::Rejection,
            Finalizer::NoWorkerAvailable,
            Finalizer::PaymentFailure,
            Finalizer::Close,
        ] {
            run_finalizer(&activities, job, finalizer, 2, "gateway down").unwrap();
        }
        assert_eq!(
            notifier.kinds_for(job),
            vec!["job_rejected", "no_worker_available", "payment_failed", "job_closed"]
        );
    }
}
