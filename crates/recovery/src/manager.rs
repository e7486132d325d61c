//! Recovery engine for two-phase commits
//!
//! Resolves prepared transactions left behind when a coordinator failed
//! between prepare and commit/abort. One pass walks every active primary
//! worker; ambiguity is always resolved by leaving the transaction for the
//! next pass, so a pass is safe to retry on a schedule until it reaches a
//! fixed point.

use crate::error::Result;
use crate::log::{RecoveryLog, RecoveryRecord};
use lattice_cluster::{
    ConnectionPool, NodeDirectory, OuterTransactionState, TransactionRegistry, WorkerNode,
};
use lattice_common::{PreparedTransactionId, transaction_name_prefix_pattern};
use lattice_remote::{
    Connection, Dispatcher, RemoteError, connection_error, is_response_ok,
    read_first_column_text, result_error,
};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct RecoveryManager {
    log: Arc<RecoveryLog>,
    directory: Arc<NodeDirectory>,
    pool: Arc<ConnectionPool>,
    registry: Arc<TransactionRegistry>,
    dispatcher: Arc<Dispatcher>,

    /// Serializes whole recovery passes within this process
    recovery_lock: Mutex<()>,
}

impl RecoveryManager {
    pub fn new(
        log: Arc<RecoveryLog>,
        directory: Arc<NodeDirectory>,
        pool: Arc<ConnectionPool>,
        registry: Arc<TransactionRegistry>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            log,
            directory,
            pool,
            registry,
            dispatcher,
            recovery_lock: Mutex::new(()),
        }
    }

    /// Recover any pending prepared transactions started by this
    /// coordinator on the cluster's workers. Returns how many were resolved
    /// (committed or rolled back).
    pub async fn recover_prepared_transactions(&self) -> Result<usize> {
        // take the lock first to avoid running concurrently
        let _guard = self.recovery_lock.lock().await;

        let workers = self.directory.active_primary_nodes();

        // Establish every worker connection before the first log access.
        // Recovery then always acquires the connection cache and the log in
        // the same order no matter how many workers there are, which keeps
        // it from deadlocking against operations taking the same pair in
        // sequence. Connection health is not checked here; the per-worker
        // pass does that.
        let mut connections: Vec<(WorkerNode, Option<Connection>)> =
            Vec::with_capacity(workers.len());
        for node in workers {
            let connection = self.pool.get_connection(&node.host, node.port).await.ok();
            connections.push((node, connection));
        }

        let mut recovered = 0;
        for (node, connection) in &mut connections {
            match connection {
                Some(connection) if connection.is_connected() => {
                    recovered += self.recover_worker_transactions(node, connection).await?;
                }
                _ => {
                    tracing::warn!(
                        "transaction recovery cannot connect to {}:{}",
                        node.host,
                        node.port
                    );
                }
            }
        }

        for (_, connection) in connections {
            if let Some(connection) = connection {
                self.pool.return_connection(connection);
            }
        }

        Ok(recovered)
    }

    /// Delete every log record for a node group; called when the group's
    /// node is removed from the cluster.
    pub fn delete_worker_transactions(&self, group_id: i32) -> Result<usize> {
        Ok(self.log.delete_group(group_id)?)
    }

    /// Recover the pending prepared transactions on one worker.
    async fn recover_worker_transactions(
        &self,
        node: &WorkerNode,
        connection: &mut Connection,
    ) -> Result<usize> {
        let mut recovered = 0;
        let group_id = node.group_id;

        // Some of the prepared transactions on the worker belong to
        // distributed transactions that are still running, and none of the
        // observations below can be taken as one atomic snapshot. The pass
        // therefore reads in a fixed order:
        //
        //   1) P = prepared transactions on the worker
        //   2) A = active distributed transaction numbers
        //   3) T = recovery log snapshot for this group
        //   4) Q = prepared transactions on the worker, again
        //
        // Reading A after P settles which of the transactions in P are still
        // in progress; the rest can be recovered from the presence of a
        // record in T. A record with no prepared transaction normally means
        // the transaction committed, but a transaction may also have
        // prepared and committed between steps 1 and 2. Those names show up
        // in Q but not in P and are left for the next pass.

        let Some(mut pending) = self.try_pending_worker_transactions(node, connection).await?
        else {
            return Ok(0);
        };

        let active = self.registry.active_transaction_numbers();

        let records = self.log.scan_group(group_id)?;

        let Some(recheck) = self.try_pending_worker_transactions(node, connection).await? else {
            return Ok(0);
        };

        let mut recovery_failed = false;
        for record in &records {
            let name = record.transaction_name.as_str();

            if is_transaction_in_progress(&active, name) {
                // do not touch in-progress transactions: this might commit a
                // transaction that is actually in the middle of aborting, or
                // vice versa
                continue;
            }

            if let Some(outer) = record.outer_transaction_id {
                match self.registry.outer_transaction_state(outer) {
                    Some(OuterTransactionState::InProgress) => {
                        // the outer transaction has not committed yet, so the
                        // prepared transaction must not be committed either;
                        // take the name out of `pending` so the abort loop
                        // below leaves it alone
                        pending.remove(name);
                        continue;
                    }
                    Some(OuterTransactionState::Aborted) | None => {
                        // the outer transaction finished without committing;
                        // the prepared transaction is aborted like any other
                        // transaction without a committed record
                        continue;
                    }
                    Some(OuterTransactionState::Committed) => {
                        // safe to try committing the prepared transaction
                    }
                }
            }

            // remove the name from the pending set so that only transactions
            // needing an abort remain in it at the end
            let found_before = pending.remove(name);
            let found_after = recheck.contains(name);

            if found_before && found_after {
                // The transaction committed, but its prepared transaction is
                // still on the worker. The name was present on both sides of
                // the active-set observation, so it cannot be one that
                // prepared and committed in between.
                if !self
                    .recover_prepared_transaction_on_worker(connection, name, true)
                    .await?
                {
                    // Failed to commit on this worker. Stop here, keeping the
                    // record, so recovery can continue with other workers and
                    // retry this one later.
                    recovery_failed = true;
                    break;
                }
                recovered += 1;
                // committed and confirmed; the record deletion below is safe
            } else if found_after {
                // A record whose prepared transaction was absent at first but
                // present on the recheck: the owning transaction prepared and
                // committed (or is still committing) between the two
                // listings. Deleting the record now could leave its prepared
                // transaction to be wrongly rolled back on the next pass, so
                // leave both untouched.
                continue;
            } else {
                // A record without any prepared transaction must have been
                // committed already; transactions that committed their
                // prepared transactions before the active-set observation
                // are indistinguishable from ones that committed long ago,
                // and deleting the record is safe for both.
            }

            self.log.remove(record)?;
        }

        if !recovery_failed {
            // Everything left in the pending set has no recovery record,
            // which means the distributed transaction aborted: roll back,
            // skipping anything still in progress.
            for name in &pending {
                if is_transaction_in_progress(&active, name) {
                    continue;
                }
                if !self
                    .recover_prepared_transaction_on_worker(connection, name, false)
                    .await?
                {
                    break;
                }
                recovered += 1;
            }
        }

        Ok(recovered)
    }

    /// List the stale prepared transactions on a worker that carry this
    /// coordinator's naming prefix. Soft-fails to `None` with a warning so
    /// one worker cannot stall recovery of the others.
    async fn try_pending_worker_transactions(
        &self,
        node: &WorkerNode,
        connection: &mut Connection,
    ) -> Result<Option<HashSet<String>>> {
        match self.pending_worker_transactions(connection).await {
            Ok(names) => Ok(Some(names)),
            Err(RemoteError::Aborted(abort)) => Err(abort.into()),
            Err(error) => {
                tracing::warn!(
                    "failed to list prepared transactions on {}: {}",
                    node,
                    error
                );
                Ok(None)
            }
        }
    }

    async fn pending_worker_transactions(
        &self,
        connection: &mut Connection,
    ) -> std::result::Result<HashSet<String>, RemoteError> {
        let pattern = transaction_name_prefix_pattern(self.registry.local_group_id());
        let command = format!(
            "SELECT gid FROM prepared_transactions WHERE gid LIKE '{}'",
            pattern
        );

        self.dispatcher.send_command(connection, &command)?;
        let result = self.dispatcher.get_result(connection, true).await?;
        let Some(result) = result else {
            return Err(connection_error(connection));
        };
        if !is_response_ok(&result) {
            return Err(result_error(connection, &result));
        }

        let names = read_first_column_text(&result);
        self.dispatcher.forget_results(connection).await?;
        Ok(names.into_iter().collect())
    }

    /// Commit or roll back a single prepared transaction on the worker.
    /// Returns whether the command succeeded; failures have already been
    /// reported as warnings.
    async fn recover_prepared_transaction_on_worker(
        &self,
        connection: &mut Connection,
        transaction_name: &str,
        should_commit: bool,
    ) -> Result<bool> {
        let command = if should_commit {
            format!("COMMIT PREPARED {}", quote_literal(transaction_name))
        } else {
            format!("ROLLBACK PREPARED {}", quote_literal(transaction_name))
        };

        match self
            .dispatcher
            .execute_optional_command(connection, &command)
            .await
        {
            Ok(Some(_)) => {
                tracing::info!(
                    command = command.as_str(),
                    "recovered a prepared transaction on {}:{}",
                    connection.host(),
                    connection.port()
                );
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(RemoteError::Aborted(abort)) => Err(abort.into()),
            Err(error) => {
                tracing::warn!("{}", error);
                Ok(false)
            }
        }
    }
}

/// Whether the distributed transaction a prepared-transaction name belongs
/// to is still in progress. Unparsable names are never in progress; log
/// rows can be inserted by hand.
fn is_transaction_in_progress(active: &HashSet<u64>, transaction_name: &str) -> bool {
    match PreparedTransactionId::parse(transaction_name) {
        Some(id) => active.contains(&id.transaction_number),
        None => false,
    }
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
