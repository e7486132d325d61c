//! Command execution over worker connections
//!
//! The dispatcher owns the policy side of remote execution: command logging,
//! result classification, error reporting, drain loops, and copy-stream
//! backpressure. All socket waiting is delegated to the multiplexer.

use crate::connection::{BufferedResult, Connection, ConnectionStatus};
use crate::error::{Abort, RemoteError, Result, ResultFailure};
use crate::multiplexer;
use lattice_common::{InterruptSignal, Supervisor, like_match};
use lattice_protocol::{ClientFrame, CommandResult, ErrorFields, ResultStatus};

/// Default for how many bytes of copy data may be buffered before a flush is
/// forced. Lower values cost throughput in networking system calls; this one
/// keeps internal buffering bounded without measurable slowdown.
pub const DEFAULT_COPY_FLUSH_THRESHOLD: u64 = 8 * 1024 * 1024;

/// Settings governing remote command execution.
#[derive(Debug, Clone)]
pub struct RemoteCommandSettings {
    /// Echo outgoing commands to the log
    pub log_remote_commands: bool,

    /// SQL LIKE filter for echoed commands; an empty pattern matches
    /// every command
    pub grep_remote_commands: String,

    /// Bytes of copy data buffered before a forced flush
    pub copy_flush_threshold: u64,
}

impl Default for RemoteCommandSettings {
    fn default() -> Self {
        Self {
            log_remote_commands: false,
            grep_remote_commands: String::new(),
            copy_flush_threshold: DEFAULT_COPY_FLUSH_THRESHOLD,
        }
    }
}

/// Sends commands over connection handles and retrieves their results.
pub struct Dispatcher {
    settings: RemoteCommandSettings,
    interrupts: InterruptSignal,
    supervisor: Supervisor,
}

impl Dispatcher {
    pub fn new(
        settings: RemoteCommandSettings,
        interrupts: InterruptSignal,
        supervisor: Supervisor,
    ) -> Self {
        Self {
            settings,
            interrupts,
            supervisor,
        }
    }

    pub fn settings(&self) -> &RemoteCommandSettings {
        &self.settings
    }

    /// Submit a command for asynchronous execution. Never blocks; a flush is
    /// attempted opportunistically and any leftover output is written by the
    /// next wait.
    pub fn send_command(&self, connection: &mut Connection, command: &str) -> Result<()> {
        self.log_command(connection, command);

        if !connection.is_connected() {
            return Err(connection_error(connection));
        }
        connection.queue_frame(&ClientFrame::Query {
            sql: command.to_string(),
        });
        if !connection.is_connected() {
            return Err(connection_error(connection));
        }
        connection.note_query_sent();

        // a failure here surfaces on the next result fetch
        let _ = connection.flush();
        Ok(())
    }

    /// Return the next completed result, or `None` when no more results are
    /// pending.
    ///
    /// If producing the result requires socket I/O, waits through the
    /// multiplexer. With `raise_interrupts` set, a cancellation request
    /// aborts with [`Abort::Interrupted`]; without it, the connection's
    /// transaction-failed flag is set and `None` is returned instead.
    pub async fn get_result(
        &self,
        connection: &mut Connection,
        raise_interrupts: bool,
    ) -> Result<Option<CommandResult>> {
        if !connection.is_busy() {
            return Ok(buffered_result(connection));
        }

        let completed = multiplexer::finish_connection_io(
            connection,
            raise_interrupts,
            &self.interrupts,
            &self.supervisor,
        )
        .await?;

        if !completed && connection.status() != ConnectionStatus::Bad {
            // a cancellation the caller opted out of raising
            return Ok(None);
        }
        // On failure, results decoded before the connection broke are still
        // handed out, followed by a single synthesized fatal result.
        Ok(buffered_result(connection))
    }

    /// Drain every pending result, discarding them. Any in-progress copy is
    /// terminated; any non-OK result marks the transaction failed.
    pub async fn clear_results(
        &self,
        connection: &mut Connection,
        raise_errors: bool,
    ) -> Result<bool> {
        self.clear_results_internal(connection, raise_errors, false)
            .await
    }

    /// Like [`Dispatcher::clear_results`] but without emitting warnings for
    /// failed results.
    pub async fn clear_results_discard_warnings(
        &self,
        connection: &mut Connection,
        raise_errors: bool,
    ) -> Result<bool> {
        self.clear_results_internal(connection, raise_errors, true)
            .await
    }

    /// Drain pending results, ignoring failures. Use after taking the result
    /// you care about; the connection is ready for the next command when
    /// this returns.
    pub async fn forget_results(&self, connection: &mut Connection) -> Result<()> {
        self.clear_results(connection, false).await?;
        Ok(())
    }

    async fn clear_results_internal(
        &self,
        connection: &mut Connection,
        raise_errors: bool,
        discard_warnings: bool,
    ) -> Result<bool> {
        let mut success = true;

        loop {
            let Some(result) = self.get_result(connection, raise_errors).await? else {
                break;
            };

            // end any pending copy operation; the failure handling below
            // marks the transaction failed
            if result.status == ResultStatus::CopyIn {
                connection.end_copy(None);
            }

            if !is_response_ok(&result) {
                connection.mark_transaction_failed();
                let failure = result_failure(connection, &result);
                if raise_errors {
                    return Err(RemoteError::Result(failure));
                }
                if !discard_warnings {
                    tracing::warn!("{}", failure);
                }
                success = false;

                // an error happened, there is nothing we can do more
                if result.status == ResultStatus::FatalError {
                    break;
                }
            }
        }

        Ok(success)
    }

    /// Drain pending results only if doing so needs no socket waiting.
    ///
    /// Returns true when the connection is fully drained. Returns false the
    /// moment draining would block, and on copy statuses, which cannot be
    /// cleared without blocking.
    pub fn clear_results_if_ready(&self, connection: &mut Connection) -> bool {
        if !connection.is_connected() {
            return false;
        }

        loop {
            // results may already be buffered by the network stack; poll the
            // socket without blocking before giving up
            if connection.is_busy() {
                if connection.flush().is_err() {
                    return false;
                }
                if connection.consume_input().is_err() {
                    return false;
                }
            }
            if connection.is_busy() {
                // clearing would require blocking I/O
                return false;
            }

            match connection.take_buffered_result() {
                BufferedResult::Drained => return true,
                BufferedResult::WouldBlock => return false,
                BufferedResult::Result(result) => match result.status {
                    // in copy, can't reliably recover without blocking
                    ResultStatus::CopyIn | ResultStatus::CopyOut => return false,
                    _ if !is_response_ok(&result) => return false,
                    _ => {}
                },
            }
        }
    }

    /// Append a chunk to an in-progress copy stream.
    ///
    /// Output is allowed to accumulate up to the configured flush threshold;
    /// crossing it forces a full flush-and-wait cycle so internal buffering
    /// stays bounded during bulk loads.
    pub async fn put_copy_data(&self, connection: &mut Connection, data: &[u8]) -> Result<()> {
        if !connection.is_connected() {
            return Err(connection_error(connection));
        }
        connection.queue_frame(&ClientFrame::CopyData {
            data: data.to_vec(),
        });
        if !connection.is_connected() {
            return Err(connection_error(connection));
        }

        let written = connection.add_copy_bytes(data.len() as u64);
        if written > self.settings.copy_flush_threshold {
            connection.reset_copy_counter();
            let completed = multiplexer::finish_connection_io(
                connection,
                true,
                &self.interrupts,
                &self.supervisor,
            )
            .await?;
            if !completed {
                return Err(connection_error(connection));
            }
        }
        Ok(())
    }

    /// Finish (or, with an error message, abort) a copy stream and flush.
    pub async fn put_copy_end(
        &self,
        connection: &mut Connection,
        error: Option<&str>,
    ) -> Result<()> {
        if !connection.is_connected() {
            return Err(connection_error(connection));
        }
        connection.end_copy(error);
        connection.reset_copy_counter();

        let completed = multiplexer::finish_connection_io(
            connection,
            true,
            &self.interrupts,
            &self.supervisor,
        )
        .await?;
        if !completed {
            return Err(connection_error(connection));
        }
        Ok(())
    }

    /// Execute a command whose failure must abort the enclosing operation.
    pub async fn execute_critical_command(
        &self,
        connection: &mut Connection,
        command: &str,
    ) -> Result<()> {
        self.send_command(connection, command)?;

        let result = self.get_result(connection, true).await?;
        let Some(result) = result else {
            return Err(connection_error(connection));
        };
        if !is_response_ok(&result) {
            return Err(result_error(connection, &result));
        }
        self.forget_results(connection).await?;
        Ok(())
    }

    /// Execute every command in the list as a critical command.
    pub async fn execute_critical_commands(
        &self,
        connection: &mut Connection,
        commands: &[&str],
    ) -> Result<()> {
        for command in commands {
            self.execute_critical_command(connection, command).await?;
        }
        Ok(())
    }

    /// Execute a command on every connection in the list, overlapping the
    /// waits, and fail on the first non-OK result.
    pub async fn execute_command_on_all(
        &self,
        connections: &mut [Connection],
        command: &str,
    ) -> Result<()> {
        for connection in connections.iter_mut() {
            self.send_command(connection, command)?;
        }

        self.wait_for_all(connections, true).await?;

        for connection in connections.iter_mut() {
            let result = self.get_result(connection, true).await?;
            let Some(result) = result else {
                return Err(connection_error(connection));
            };
            if !is_response_ok(&result) {
                return Err(result_error(connection, &result));
            }
            self.forget_results(connection).await?;
        }
        Ok(())
    }

    /// Block until every connection has completed or failed. See
    /// [`multiplexer::wait_for_all`].
    pub async fn wait_for_all(
        &self,
        connections: &mut [Connection],
        raise_interrupts: bool,
    ) -> std::result::Result<(), Abort> {
        multiplexer::wait_for_all(
            connections,
            raise_interrupts,
            &self.interrupts,
            &self.supervisor,
        )
        .await
    }

    /// Execute a command, downgrading failures to warnings. Returns the
    /// result on success and `None` on any failure; only cancellation and
    /// supervisor exit propagate as errors.
    pub async fn execute_optional_command(
        &self,
        connection: &mut Connection,
        command: &str,
    ) -> Result<Option<CommandResult>> {
        if let Err(error) = self.send_command(connection, command) {
            tracing::warn!("{}", error);
            return Ok(None);
        }

        match self.get_result(connection, true).await? {
            None => {
                tracing::warn!("{}", connection_error(connection));
                Ok(None)
            }
            Some(result) if !is_response_ok(&result) => {
                connection.mark_transaction_failed();
                tracing::warn!("{}", result_failure(connection, &result));
                self.forget_results(connection).await?;
                Ok(None)
            }
            Some(result) => {
                self.forget_results(connection).await?;
                Ok(Some(result))
            }
        }
    }

    /// Execute a command and compare its single-value result against
    /// `expected`. A failure to send is reported as a warning and `false`;
    /// a non-OK result is a hard error.
    pub async fn execute_command_and_check_result(
        &self,
        connection: &mut Connection,
        command: &str,
        expected: &str,
    ) -> Result<bool> {
        if let Err(error) = self.send_command(connection, command) {
            tracing::warn!("{}", error);
            return Ok(false);
        }

        let result = self.get_result(connection, true).await?;
        let Some(result) = result else {
            return Err(connection_error(connection));
        };
        if !is_response_ok(&result) {
            return Err(result_error(connection, &result));
        }

        let mut value = String::new();
        let success = evaluate_single_query_result(connection, &result, &mut value);
        self.forget_results(connection).await?;
        Ok(success && value == expected)
    }

    fn log_command(&self, connection: &Connection, command: &str) {
        if !self.settings.log_remote_commands {
            return;
        }
        if !self.command_matches_log_grep_pattern(command) {
            return;
        }
        tracing::info!(
            user = connection.user(),
            host = connection.host(),
            port = connection.port(),
            connection_id = connection.connection_id(),
            "issuing {}",
            command
        );
    }

    /// Whether a command passes the log grep filter. An empty pattern
    /// matches every command.
    pub fn command_matches_log_grep_pattern(&self, command: &str) -> bool {
        if self.settings.grep_remote_commands.is_empty() {
            return true;
        }
        like_match(&self.settings.grep_remote_commands, command)
    }
}

/// Whether the result is a successful one.
pub fn is_response_ok(result: &CommandResult) -> bool {
    matches!(
        result.status,
        ResultStatus::SingleTuple | ResultStatus::TuplesOk | ResultStatus::CommandOk
    )
}

/// Build the error for a failure that has no associated result.
pub fn connection_error(connection: &Connection) -> RemoteError {
    let message = match connection.error_message() {
        Some(text) if !text.is_empty() => text.to_string(),
        _ => "connection not open".to_string(),
    };
    RemoteError::Connection {
        user: connection.user().to_string(),
        host: connection.host().to_string(),
        port: connection.port(),
        message,
    }
}

/// Build the error for a non-OK result.
pub fn result_error(connection: &Connection, result: &CommandResult) -> RemoteError {
    RemoteError::Result(result_failure(connection, result))
}

pub(crate) fn result_failure(connection: &Connection, result: &CommandResult) -> ResultFailure {
    let fields = result.error.clone().unwrap_or_default();

    let sqlstate = match fields.sqlstate {
        Some(code) if code.len() == 5 => code,
        _ => "XX000".to_string(),
    };

    // if the result carried no message, the connection may have a suitable
    // top-level one
    let message = fields
        .message
        .or_else(|| connection.error_message().map(String::from))
        .unwrap_or_else(|| "internal error".to_string());

    ResultFailure {
        sqlstate,
        message,
        detail: fields.detail,
        hint: fields.hint,
        context: fields.context,
        host: connection.host().to_string(),
        port: connection.port(),
    }
}

fn fatal_connection_result(connection: &Connection) -> CommandResult {
    CommandResult::fatal(ErrorFields {
        message: connection.error_message().map(String::from),
        ..ErrorFields::default()
    })
}

fn buffered_result(connection: &mut Connection) -> Option<CommandResult> {
    match connection.take_buffered_result() {
        BufferedResult::Result(result) => Some(result),
        BufferedResult::Drained => None,
        BufferedResult::WouldBlock => {
            if connection.status() == ConnectionStatus::Bad && connection.take_fatal_report() {
                Some(fatal_connection_result(connection))
            } else {
                None
            }
        }
    }
}

/// Render a single-row, single-column result (or a command tag) to text.
/// On failure the error message is rendered instead and `false` returned.
pub fn evaluate_single_query_result(
    connection: &Connection,
    result: &CommandResult,
    output: &mut String,
) -> bool {
    match result.status {
        ResultStatus::CommandOk => {
            output.push_str(result.command_tag.as_deref().unwrap_or(""));
            true
        }
        ResultStatus::TuplesOk => {
            if result.columns.len() != 1 {
                output.push_str("expected a single column in query target");
                false
            } else if result.row_count() > 1 {
                output.push_str("expected a single row in query result");
                false
            } else {
                if let Some(value) = result.value(0, 0) {
                    output.push_str(value);
                }
                true
            }
        }
        _ => {
            store_error_message(connection, result, output);
            false
        }
    }
}

/// Render the error message of a failed result, trimmed at the first line
/// break, falling back to the connection error and then to a default.
fn store_error_message(connection: &Connection, result: &CommandResult, output: &mut String) {
    let message = result
        .error
        .as_ref()
        .and_then(|fields| fields.message.as_deref())
        .or_else(|| connection.error_message());

    match message {
        Some(text) if !text.is_empty() => {
            output.push_str(text.lines().next().unwrap_or(text));
        }
        _ => output.push_str("An error occurred while running the query"),
    }
}

/// First column of a row-set result as text; NULLs become empty strings.
pub fn read_first_column_text(result: &CommandResult) -> Vec<String> {
    if result.status != ResultStatus::TuplesOk {
        return Vec::new();
    }
    result
        .rows
        .iter()
        .map(|row| row.first().and_then(|value| value.clone()).unwrap_or_default())
        .collect()
}
