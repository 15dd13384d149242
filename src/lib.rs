//! spendguard: the financial safety core for the spend pipeline.
//!
//! Authorizes, tracks and durably records spend decisions so that a restart
//! cannot double-spend, a retried request cannot double-charge, and an
//! emergency stop halts everything regardless of other component state.
//! Every spend decision is authorized exactly once, fsync'd to the event
//! log before it is final, and vetoable by a safety layer that itself
//! survives restarts.
//!
//! Entry point: [`gateway::SpendGateway`]. Upstream pipelines must call it
//! exclusively; the vault's reservation is only callable with a token the
//! safety gate issues, so bypassing the gate is a type error.

pub mod config;
pub mod gateway;
pub mod idempotency;
pub mod ledger;
pub mod logging;
pub mod safety;
pub mod storage;
pub mod types;
pub mod vault;

#[cfg(test)]
pub mod test_support;
