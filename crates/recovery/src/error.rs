//! Error types for recovery

use crate::log::LogError;
use lattice_remote::Abort;
use thiserror::Error;

/// Failures that abort a recovery pass.
///
/// Per-worker failures never appear here; they are downgraded to warnings
/// so the pass can continue with the remaining workers and retry later.
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// Cancellation or supervisor exit, propagated from the I/O driver
    #[error(transparent)]
    Aborted(#[from] Abort),

    /// Local recovery-log failure
    #[error(transparent)]
    Log(#[from] LogError),
}

pub type Result<T> = std::result::Result<T, RecoveryError>;
