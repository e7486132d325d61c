//! Two-phase-commit recovery
//!
//! When a coordinator crashes or loses its network between preparing a
//! transaction on a worker and committing it, the worker is left holding an
//! in-doubt prepared transaction. This crate keeps the durable log of every
//! prepared transaction this coordinator is responsible for, and resolves
//! stale ones by reconciling three time-ordered observations: the worker's
//! live prepared-transaction list, the process's active transaction-number
//! set, and the log itself.

mod error;
mod log;
mod manager;

pub use error::{RecoveryError, Result};
pub use log::{LogError, RecoveryLog, RecoveryRecord};
pub use manager::RecoveryManager;
