//! Card gateway port.
//!
//! Amounts cross this boundary as integer minor units. Every mutating call carries an
//! idempotency key; a gateway receiving a key it has already processed returns the
//! original response instead of acting twice.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use jobflow_core::{Currency, JobId};
use jobflow_escrow::GatewayMetadata;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizeRequest {
    pub job_id: JobId,
    pub amount_minor: u64,
    pub currency: Currency,
    pub source: String,
    /// Always `false`: funds are held, then captured separately.
    pub capture: bool,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayResponse {
    /// Id of the intent, charge or refund the gateway created or updated.
    pub reference_id: String,
    pub status: String,
    pub amount_minor: u64,
    pub raw: serde_json::Value,
}

impl GatewayResponse {
    pub fn metadata(&self) -> GatewayMetadata {
        GatewayMetadata {
            reference_id: Some(self.reference_id.clone()),
            status: Some(self.status.clone()),
            http_status: Some(200),
            error_code: None,
            raw: Some(self.raw.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// The card or token was rejected. Not retryable.
    #[error("declined ({code}): {message}")]
    Declined { code: String, message: String },

    #[error("gateway timeout: {0}")]
    Timeout(String),

    #[error("network failure: {0}")]
    Network(String),

    #[error("gateway server error {status}: {message}")]
    Server { status: u16, message: String },

    /// Malformed request or an operation the gateway refuses in the current state.
    #[error("invalid gateway request: {0}")]
    InvalidRequest(String),
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::Timeout(_) | GatewayError::Network(_) | GatewayError::Server { .. }
        )
    }

    pub fn metadata(&self) -> GatewayMetadata {
        let (http_status, code) = match self {
            GatewayError::Declined { code, .. } => (Some(402), Some(code.clone())),
            GatewayError::Timeout(_) => (None, Some("timeout".to_string())),
            GatewayError::Network(_) => (None, Some("network".to_string())),
            GatewayError::Server { status, .. } => (Some(*status), Some("server_error".to_string())),
            GatewayError::InvalidRequest(_) => (Some(400), Some("invalid_request".to_string())),
        };
        GatewayMetadata {
            reference_id: None,
            status: Some("failed".to_string()),
            http_status,
            error_code: code,
            raw: None,
        }
    }
}

/// External card-processing gateway.
pub trait PaymentGateway: Send + Sync {
    /// Place a hold (`capture = false`). Returns the intent id.
    fn authorize(&self, request: &AuthorizeRequest) -> Result<GatewayResponse, GatewayError>;

    /// Capture `amount_minor` of a held intent. Returns the charge id.
    fn capture(
        &self,
        intent_id: &str,
        amount_minor: u64,
        idempotency_key: &str,
    ) -> Result<GatewayResponse, GatewayError>;

    /// Refund part or all of a captured charge. Returns the refund id.
    fn refund(
        &self,
        charge_id: &str,
        amount_minor: u64,
        idempotency_key: &str,
    ) -> Result<GatewayResponse, GatewayError>;

    /// Release an uncaptured hold.
    fn cancel(&self, intent_id: &str, idempotency_key: &str)
    -> Result<GatewayResponse, GatewayError>;

    /// The response previously produced for `idempotency_key`, if the gateway executed it.
    fn lookup(&self, idempotency_key: &str) -> Result<Option<GatewayResponse>, GatewayError>;
}

impl<G> PaymentGateway for std::sync::Arc<G>
where
    G: PaymentGateway + ?Sized,
{
    fn authorize(&self, request: &AuthorizeRequest) -> Result<GatewayResponse, GatewayError> {
        (**self).authorize(request)
    }

    fn capture(
        &self,
        intent_id: &str,
        amount_minor: u64,
        idempotency_key: &str,
    ) -> Result<GatewayResponse, GatewayError> {
        (**self).capture(intent_id, amount_minor, idempotency_key)
    }

    fn refund(
        &self,
        charge_id: &str,
        amount_minor: u64,
        idempotency_key: &str,
    ) -> Result<GatewayResponse, GatewayError> {
        (**self).refund(charge_id, amount_minor, idempotency_key)
    }

    fn cancel(
        &self,
        intent_id: &str,
        idempotency_key: &str,
    ) -> Result<GatewayResponse, GatewayError> {
        (**self).cancel(intent_id, idempotency_key)
    }

    fn lookup(&self, idempotency_key: &str) -> Result<Option<GatewayResponse>, GatewayError> {
        (**self).lookup(idempotency_key)
    }
}
