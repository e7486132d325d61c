//! Supervisor liveness
//!
//! The I/O driver must abort outright if the supervising process goes away:
//! there is no one left to hand results to and no safe way to continue. The
//! guard half lives with the supervisor; every watcher half can wait for the
//! guard to be dropped.

use tokio::sync::watch;

/// Held by the supervising process. Dropping it signals every watcher.
#[derive(Debug)]
pub struct SupervisorGuard {
    _alive: watch::Sender<()>,
}

/// Watcher half of the liveness pair.
#[derive(Debug, Clone)]
pub struct Supervisor {
    alive: watch::Receiver<()>,
}

impl Supervisor {
    /// Create a liveness pair.
    pub fn new() -> (SupervisorGuard, Supervisor) {
        let (tx, rx) = watch::channel(());
        (SupervisorGuard { _alive: tx }, Supervisor { alive: rx })
    }

    /// Whether the supervisor has already exited.
    pub fn exited(&self) -> bool {
        self.alive.has_changed().is_err()
    }

    /// Resolve once the supervisor exits. Pends forever while it is alive.
    pub async fn wait_exited(&self) {
        let mut alive = self.alive.clone();
        while alive.changed().await.is_ok() {}
    }
}
