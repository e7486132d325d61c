//! Connection pool for worker nodes
//!
//! The pool lends out owned [`Connection`] handles. The coordination core
//! never destroys a connection itself; callers check handles back in when
//! every pending result has been drained, and the pool drops any handle
//! that came back broken or with a failed transaction.

use lattice_remote::{Connection, RemoteError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

pub struct ConnectionPool {
    user: String,
    next_connection_id: AtomicU64,
    idle: Mutex<HashMap<(String, u16), Vec<Connection>>>,
}

impl ConnectionPool {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            next_connection_id: AtomicU64::new(1),
            idle: Mutex::new(HashMap::new()),
        }
    }

    /// Check out a connection to the given worker, reusing an idle healthy
    /// one when available.
    pub async fn get_connection(&self, host: &str, port: u16) -> Result<Connection, RemoteError> {
        loop {
            let idle = self
                .idle
                .lock()
                .get_mut(&(host.to_string(), port))
                .and_then(Vec::pop);
            match idle {
                Some(connection) if connection.is_connected() => return Ok(connection),
                Some(_) => continue,
                None => break,
            }
        }

        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        Connection::connect(host, port, self.user.clone(), connection_id)
            .await
            .map_err(|error| RemoteError::Connection {
                user: self.user.clone(),
                host: host.to_string(),
                port,
                message: error.to_string(),
            })
    }

    /// Check a connection back in. Broken or transaction-failed handles are
    /// dropped rather than cached.
    pub fn return_connection(&self, connection: Connection) {
        if !connection.is_connected() || connection.transaction_failed() {
            return;
        }
        self.idle
            .lock()
            .entry((connection.host().to_string(), connection.port()))
            .or_default()
            .push(connection);
    }

    /// Number of idle cached connections, across all workers.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().values().map(Vec::len).sum()
    }
}
