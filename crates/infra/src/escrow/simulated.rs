//! In-process card gateway for tests and local runs.
//!
//! Tracks intents/charges/refunds in memory, honors idempotency keys and can be
//! scripted to fail the next N calls of an operation.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use serde_json::json;

use jobflow_escrow::PaymentOperation;

use super::gateway::{AuthorizeRequest, GatewayError, GatewayResponse, PaymentGateway};

/// Source token the simulated gateway always declines.
pub const DECLINED_SOURCE: &str = "tok_chargeDeclined";

#[derive(Debug, Clone)]
struct Intent {
    amount_minor: u64,
    captured_minor: Option<u64>,
    charge_id: Option<String>,
    refunded_minor: u64,
    cancelled: bool,
}

#[derive(Debug, Default)]
struct State {
    intents: HashMap<String, Intent>,
    /// charge id → intent id
    charges: HashMap<String, String>,
    responses: HashMap<String, GatewayResponse>,
    scripted: HashMap<PaymentOperation, VecDeque<Script>>,
    calls: HashMap<PaymentOperation, u32>,
    next_id: u64,
}

#[derive(Debug, Clone)]
enum Script {
    /// Fail before doing anything.
    Fail(GatewayError),
    /// Perform the operation, then lose the response.
    SucceedThenFail(GatewayError),
}

#[derive(Debug, Default)]
pub struct SimulatedGateway {
    state: Mutex<State>,
}

impl SimulatedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` calls of `operation` fail with `error`.
    pub fn fail_next(&self, operation: PaymentOperation, times: u32, error: GatewayError) {
        if let Ok(mut state) = self.state.lock() {
            let queue = state.scripted.entry(operation).or_default();
            for _ in 0..times {
                queue.push_back(Script::Fail(error.clone()));
            }
        }
    }

    /// Execute the next call of `operation` but report `error` to the caller.
    pub fn lose_next_response(&self, operation: PaymentOperation, error: GatewayError) {
        if let Ok(mut state) = self.state.lock() {
            state
                .scripted
                .entry(operation)
                .or_default()
                .push_back(Script::SucceedThenFail(error));
        }
    }

    /// Number of calls received for `operation`, including failed ones.
    pub fn calls(&self, operation: PaymentOperation) -> u32 {
        self.state
            .lock()
            .map(|s| s.calls.get(&operation).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Amount captured on an intent, if any.
    pub fn captured_amount(&self, intent_id: &str) -> Option<u64> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.intents.get(intent_id).and_then(|i| i.captured_minor))
    }

    fn call(
        &self,
        operation: PaymentOperation,
        idempotency_key: &str,
        execute: impl FnOnce(&mut State) -> Result<GatewayResponse, GatewayError>,
    ) -> Result<GatewayResponse, GatewayError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| GatewayError::Server {
                status: 500,
                message: "simulated gateway poisoned".to_string(),
            })?;
        *state.calls.entry(operation).or_default() += 1;

        let script = state
            .scripted
            .get_mut(&operation)
            .and_then(|q| q.pop_front());
        if let Some(Script::Fail(error)) = &script {
            return Err(error.clone());
        }

        let response = match state.responses.get(idempotency_key) {
            Some(previous) => previous.clone(),
            None => {
                let response = execute(&mut state)?;
                state
                    .responses
                    .insert(idempotency_key.to_string(), response.clone());
                response
            }
        };

        match script {
            Some(Script::SucceedThenFail(error)) => Err(error),
            _ => Ok(response),
        }
    }
}

impl State {
    fn id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}_{:06}", self.next_id)
    }

    fn intent_mut(&mut self, intent_id: &str) -> Result<&mut Intent, GatewayError> {
        self.intents
            .get_mut(intent_id)
            .ok_or_else(|| GatewayError::InvalidRequest(format!("no such intent: {intent_id}")))
    }
}

impl PaymentGateway for SimulatedGateway {
    fn authorize(&self, request: &AuthorizeRequest) -> Result<GatewayResponse, GatewayError> {
        self.call(PaymentOperation::Authorize, &request.idempotency_key, |state| {
            if request.source == DECLINED_SOURCE {
                return Err(GatewayError::Declined {
                    code: "card_declined".to_string(),
                    message: "Your card was declined.".to_string(),
                });
            }
            if request.amount_minor == 0 {
                return Err(GatewayError::InvalidRequest("amount must be positive".into()));
            }
            let id = state.id("pi");
            state.intents.insert(
                id.clone(),
                Intent {
                    amount_minor: request.amount_minor,
                    captured_minor: None,
                    charge_id: None,
                    refunded_minor: 0,
                    cancelled: false,
                },
            );
            Ok(GatewayResponse {
                reference_id: id.clone(),
                status: "requires_capture".to_string(),
                amount_minor: request.amount_minor,
                raw: json!({
                    "id": id,
                    "object": "payment_intent",
                    "amount": request.amount_minor,
                    "currency": request.currency.code().to_ascii_lowercase(),
                    "capture_method": if request.capture { "automatic" } else { "manual" },
                    "metadata": { "job_id": request.job_id.to_string() },
                    "status": "requires_capture",
                }),
            })
        })
    }

    fn capture(
        &self,
        intent_id: &str,
        amount_minor: u64,
        idempotency_key: &str,
    ) -> Result<GatewayResponse, GatewayError> {
        self.call(PaymentOperation::Capture, idempotency_key, |state| {
            let charge_id = state.id("ch");
            let intent = state.intent_mut(intent_id)?;
            if intent.cancelled || intent.captured_minor.is_some() {
                return Err(GatewayError::InvalidRequest(format!(
                    "intent {intent_id} cannot be captured"
                )));
            }
            if amount_minor > intent.amount_minor {
                return Err(GatewayError::InvalidRequest(
                    "amount_to_capture exceeds the authorized amount".into(),
                ));
            }
            intent.captured_minor = Some(amount_minor);
            intent.charge_id = Some(charge_id.clone());
            state.charges.insert(charge_id.clone(), intent_id.to_string());
            Ok(GatewayResponse {
                reference_id: charge_id.clone(),
                status: "succeeded".to_string(),
                amount_minor,
                raw: json!({
                    "id": charge_id,
                    "object": "charge",
                    "payment_intent": intent_id,
                    "amount_captured": amount_minor,
                    "status": "succeeded",
                }),
            })
        })
    }

    fn refund(
        &self,
        charge_id: &str,
        amount_minor: u64,
        idempotency_key: &str,
    ) -> Result<GatewayResponse, GatewayError> {
        self.call(PaymentOperation::Refund, idempotency_key, |state| {
            let intent_id = state
                .charges
                .get(charge_id)
                .cloned()
                .ok_or_else(|| GatewayError::InvalidRequest(format!("no such charge: {charge_id}")))?;
            let refund_id = state.id("re");
            let intent = state.intent_mut(&intent_id)?;
            let captured = intent.captured_minor.unwrap_or(0);
            if intent.refunded_minor + amount_minor > captured {
                return Err(GatewayError::InvalidRequest(
                    "refund exceeds the captured amount".into(),
                ));
            }
            intent.refunded_minor += amount_minor;
            Ok(GatewayResponse {
                reference_id: refund_id.clone(),
                status: "succeeded".to_string(),
                amount_minor,
                raw: json!({
                    "id": refund_id,
                    "object": "refund",
                    "charge": charge_id,
                    "amount": amount_minor,
                    "status": "succeeded",
                }),
            })
        })
    }

    fn cancel(
        &self,
        intent_id: &str,
        idempotency_key: &str,
    ) -> Result<GatewayResponse, GatewayError> {
        self.call(PaymentOperation::Void, idempotency_key, |state| {
            let intent = state.intent_mut(intent_id)?;
            if intent.captured_minor.is_some() {
                return Err(GatewayError::InvalidRequest(format!(
                    "intent {intent_id} was already captured"
                )));
            }
            intent.cancelled = true;
            let amount = intent.amount_minor;
            Ok(GatewayResponse {
                reference_id: intent_id.to_string(),
                status: "canceled".to_string(),
                amount_minor: amount,
                raw: json!({
                    "id": intent_id,
                    "object": "payment_intent",
                    "status": "canceled",
                }),
            })
        })
    }

    fn lookup(&self, idempotency_key: &str) -> Result<Option<GatewayResponse>, GatewayError> {
        let state = self.state.lock().map_err(|_| GatewayError::Server {
            status: 500,
            message: "simulated gateway poisoned".to_string(),
        })?;
        Ok(state.responses.get(idempotency_key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobflow_core::{Currency, JobId};

    fn authorize(gateway: &SimulatedGateway, key: &str) -> Result<GatewayResponse, GatewayError> {
        gateway.authorize(&AuthorizeRequest {
            job_id: JobId::new(),
            amount_minor: 10_000,
            currency: Currency::Usd,
            source: "tok_visa".into(),
            capture: false,
            idempotency_key: key.into(),
        })
    }

    #[test]
    fn repeated_key_returns_the_original_response() {
        let gateway = SimulatedGateway::new();
        let first = authorize(&gateway, "authorize:1").unwrap();
        let second = authorize(&gateway, "authorize:1").unwrap();
        assert_eq!(first, second);

        let charge = gateway.capture(&first.reference_id, 10_000, "capture:1").unwrap();
        let again = gateway.capture(&first.reference_id, 10_000, "capture:1").unwrap();
        assert_eq!(charge.reference_id, again.reference_id);
        assert_eq!(gateway.captured_amount(&first.reference_id), Some(10_000));
    }

    #[test]
    fn scripted_failures_are_consumed_in_order() {
        let gateway = SimulatedGateway::new();
        gateway.fail_next(
            PaymentOperation::Authorize,
            2,
            GatewayError::Server { status: 503, message: "unavailable".into() },
        );
        assert!(authorize(&gateway, "a").is_err());
        assert!(authorize(&gateway, "a").is_err());
        assert!(authorize(&gateway, "a").is_ok());
        assert_eq!(gateway.calls(PaymentOperation::Authorize), 3);
    }

    #[test]
    fn lost_response_still_executes() {
        let gateway = SimulatedGateway::new();
        let intent = authorize(&gateway, "a").unwrap();
        gateway.lose_next_response(PaymentOperation::Capture, GatewayError::Timeout("read timed out".into()));

        assert!(gateway.capture(&intent.reference_id, 500, "capture:x").is_err());
        assert_eq!(gateway.captured_amount(&intent.reference_id), Some(500));
        assert!(gateway.lookup("capture:x").unwrap().is_some());
    }

    #[test]
    fn refunds_cannot_exceed_capture() {
        let gateway = SimulatedGateway::new();
        let intent = authorize(&gateway, "a").unwrap();
        let charge = gateway.capture(&intent.reference_id, 6_000, "c").unwrap();
        gateway.refund(&charge.reference_id, 4_000, "r1").unwrap();
        assert!(gateway.refund(&charge.reference_id, 2_001, "r2").is_err());
    }
}
