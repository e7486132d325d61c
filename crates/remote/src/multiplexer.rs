//! Multiplexed waiting over non-blocking connections
//!
//! [`wait_for_all`] blocks until every connection in a set has either
//! completed its outstanding command or failed, driving flush/consume-input
//! cycles as sockets become ready. [`finish_connection_io`] is the
//! single-connection variant used by result fetches and copy backpressure.
//!
//! Both honor the same two out-of-band signals: the cooperative interrupt
//! latch and the supervisor-liveness watch. Supervisor exit always aborts;
//! a cancellation either aborts (caller opted in) or downgrades to
//! per-connection failure flags.

use crate::connection::{Connection, FlushProgress};
use crate::error::Abort;
use futures::stream::{FuturesUnordered, StreamExt};
use lattice_common::{InterruptSignal, Supervisor};
use tokio::io::{Interest, Ready};

/// Block until every connection is no longer busy, meaning the pending
/// command has either finished or failed.
///
/// Connections that fail mid-wait are marked broken and treated as done;
/// the caller inspects each handle afterwards. Only cancellation (when
/// `raise_interrupts` is set) and supervisor exit abort the wait itself.
pub async fn wait_for_all(
    connections: &mut [Connection],
    raise_interrupts: bool,
    interrupts: &InterruptSignal,
    supervisor: &Supervisor,
) -> Result<(), Abort> {
    // Start polling every pending socket for both readability and
    // writability; a completed flush downgrades to readable-only.
    let mut interest: Vec<Interest> = vec![Interest::READABLE | Interest::WRITABLE;
        connections.len()];

    // Initial partition: bad or idle connections are already done.
    let mut pending: Vec<usize> = (0..connections.len())
        .filter(|&index| connections[index].is_connected() && connections[index].is_busy())
        .collect();

    while !pending.is_empty() {
        if interrupts.is_pending() {
            if raise_interrupts {
                return Err(Abort::Interrupted);
            }
            // caller opted out of raising: fail the connections still in
            // flight and hand control back
            for &index in &pending {
                connections[index].mark_transaction_failed();
            }
            return Ok(());
        }

        enum Fired {
            Socket(usize, std::io::Result<Ready>),
            Wakeup,
            SupervisorExit,
        }

        // The readiness set borrows the connections shared; it is dropped
        // before any of them is mutated, and rebuilt on the next iteration
        // from whatever is still pending.
        let fired = {
            let shared: &[Connection] = connections;
            let mut ready_set: FuturesUnordered<_> = pending
                .iter()
                .map(|&index| {
                    let connection = &shared[index];
                    let want = interest[index];
                    async move { (index, connection.ready(want).await) }
                })
                .collect();

            tokio::select! {
                biased;
                _ = supervisor.wait_exited() => Fired::SupervisorExit,
                _ = interrupts.wakeup() => Fired::Wakeup,
                Some((index, readiness)) = ready_set.next() => Fired::Socket(index, readiness),
            }
        };

        match fired {
            Fired::SupervisorExit => return Err(Abort::SupervisorExit),
            Fired::Wakeup => {
                // loop around; the check at the top decides what a pending
                // cancellation means for this caller
                continue;
            }
            Fired::Socket(index, readiness) => {
                let connection = &mut connections[index];
                let done = match readiness {
                    Err(error) => {
                        connection.mark_broken(error.to_string());
                        true
                    }
                    Ok(event) => drive_connection(connection, event, &mut interest[index]),
                };
                if done {
                    if let Some(position) = pending.iter().position(|&p| p == index) {
                        pending.swap_remove(position);
                    }
                }
            }
        }
    }

    Ok(())
}

/// One flush/consume cycle for a connection whose socket fired. Returns
/// whether the connection is done (result received or failed).
fn drive_connection(connection: &mut Connection, event: Ready, interest: &mut Interest) -> bool {
    if event.is_writable() {
        match connection.flush() {
            Err(_) => {
                // send failed, done with this connection
                return true;
            }
            Ok(FlushProgress::Flushed) => {
                // done writing, only wait for read events from here on
                *interest = Interest::READABLE;
            }
            Ok(FlushProgress::Blocked) => {}
        }
    }

    // Always try to consume input, even on a pure write event: the flush
    // above may have been the last I/O the socket reports for a while, and
    // buffered input would otherwise go unnoticed.
    if event.is_readable()
        || event.is_writable()
        || event.is_read_closed()
        || event.is_write_closed()
    {
        if connection.consume_input().is_err() {
            return true;
        }
        if !connection.is_busy() {
            return true;
        }
    }

    false
}

/// Perform the I/O needed to finish the current command cycle on a single
/// connection.
///
/// Returns `Ok(true)` when no more I/O is necessary, `Ok(false)` on a
/// connection failure (the handle is marked broken) or on a cancellation
/// the caller opted out of raising (the transaction-failed flag is set).
pub(crate) async fn finish_connection_io(
    connection: &mut Connection,
    raise_interrupts: bool,
    interrupts: &InterruptSignal,
    supervisor: &Supervisor,
) -> Result<bool, Abort> {
    loop {
        let mut want: Option<Interest> = None;

        match connection.flush() {
            Err(_) => return Ok(false),
            Ok(FlushProgress::Blocked) => want = Some(Interest::WRITABLE),
            Ok(FlushProgress::Flushed) => {}
        }

        if connection.consume_input().is_err() {
            return Ok(false);
        }
        if connection.is_busy() {
            want = Some(match want {
                Some(interest) => interest | Interest::READABLE,
                None => Interest::READABLE,
            });
        }

        let Some(want) = want else {
            // no I/O necessary anymore
            return Ok(true);
        };

        if interrupts.is_pending() {
            if raise_interrupts {
                return Err(Abort::Interrupted);
            }
            connection.mark_transaction_failed();
            return Ok(false);
        }

        enum Fired {
            Socket(std::io::Result<Ready>),
            Wakeup,
            SupervisorExit,
        }

        let fired = tokio::select! {
            biased;
            _ = supervisor.wait_exited() => Fired::SupervisorExit,
            _ = interrupts.wakeup() => Fired::Wakeup,
            readiness = connection.ready(want) => Fired::Socket(readiness),
        };

        match fired {
            Fired::SupervisorExit => return Err(Abort::SupervisorExit),
            Fired::Wakeup => {
                // re-check the latch at the top of the loop
            }
            Fired::Socket(Err(error)) => {
                connection.mark_broken(error.to_string());
                return Ok(false);
            }
            Fired::Socket(Ok(_)) => {}
        }
    }
}
