//! Mock worker node for testing the coordination core
//!
//! This crate provides a mock worker that binds a real TCP listener and
//! speaks the lattice wire protocol, allowing the non-blocking connection
//! driver and the transaction recovery engine to be exercised end to end
//! without a full cluster.

mod worker;

pub use worker::{MockWorker, ScriptedFailure};
