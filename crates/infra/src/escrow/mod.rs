//! Payment escrow: the gateway port, a simulated gateway and the escrow manager.

pub mod gateway;
pub mod manager;
pub mod simulated;

pub use gateway::{AuthorizeRequest, GatewayError, GatewayResponse, PaymentGateway};
pub use manager::{
    AuthorizationRequest, EscrowConfig, EscrowError, EscrowManager, ReconciliationReport,
};
pub use simulated::{DECLINED_SOURCE, SimulatedGateway};
