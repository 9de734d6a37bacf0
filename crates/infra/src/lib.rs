//! Infrastructure layer: persistence, the payment gateway boundary, worker matching,
//! timers and the orchestrator that ties a job's lifecycle to its payments.

pub mod activities;
pub mod config;
pub mod coordinator;
pub mod escrow;
pub mod event_store;
pub mod ledger;
pub mod matching;
pub mod orchestrator;
pub mod retry;
