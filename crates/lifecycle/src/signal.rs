//! Signals: asynchronous decisions delivered into a running execution.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use jobflow_core::{DomainError, JobId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    OfferResponse,
    JobStarted,
    JobCompleted,
    ReviewSubmitted,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::OfferResponse => "offer-response",
            SignalKind::JobStarted => "job-started",
            SignalKind::JobCompleted => "job-completed",
            SignalKind::ReviewSubmitted => "review-submitted",
        }
    }
}

impl core::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Review payload. Not persisted beyond the execution stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewSubmission {
    pub job_id: JobId,
    pub reviewer_id: Uuid,
    /// 1..=5
    pub rating: u8,
    pub comment: Option<String>,
}

impl ReviewSubmission {
    pub fn validate(&self) -> Result<(), DomainError> {
        if !(1..=5).contains(&self.rating) {
            return Err(DomainError::validation(format!(
                "review rating must be between 1 and 5, got {}",
                self.rating
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "kebab-case")]
pub enum Signal {
    OfferResponse { accepted: bool },
    JobStarted,
    JobCompleted,
    ReviewSubmitted(ReviewSubmission),
}

impl Signal {
    pub fn kind(&self) -> SignalKind {
        match self {
            Signal::OfferResponse { .. } => SignalKind::OfferResponse,
            Signal::JobStarted => SignalKind::JobStarted,
            Signal::JobCompleted => SignalKind::JobCompleted,
            Signal::ReviewSubmitted(_) => SignalKind::ReviewSubmitted,
        }
    }

    /// Natural deduplication key for at-least-once delivery.
    ///
    /// Offer, start and completion happen once per job, so their kind is the key.
    /// Reviews are keyed per reviewer: one review per reviewer per job.
    pub fn dedup_key(&self) -> String {
        match self {
            Signal::ReviewSubmitted(review) => {
                format!("{}:{}", SignalKind::ReviewSubmitted, review.reviewer_id)
            }
            other => other.kind().as_str().to_string(),
        }
    }
}
