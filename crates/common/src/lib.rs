//! Common types for the lattice transaction-coordination core
//!
//! This crate defines:
//! - Prepared-transaction naming (format and parse)
//! - The SQL LIKE pattern matcher shared by command logging and tests
//! - The cooperative interrupt signal
//! - The supervisor-liveness handle

mod interrupt;
mod like;
mod supervisor;
mod transaction_name;

pub use interrupt::InterruptSignal;
pub use like::like_match;
pub use supervisor::{Supervisor, SupervisorGuard};
pub use transaction_name::{
    PreparedTransactionId, TRANSACTION_NAME_PREFIX, transaction_name_prefix_pattern,
};
