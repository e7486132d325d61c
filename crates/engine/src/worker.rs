//! Mock worker implementation
//!
//! The worker understands the small command vocabulary the coordination
//! core issues: prepared-transaction management, the recovery listing
//! query, copy-in streams, and a `WAITPOINT` command that parks a response
//! until released, which tests use to hold connections busy.

use bytes::BytesMut;
use lattice_common::like_match;
use lattice_protocol::{ClientFrame, CommandResult, ErrorFields, ResultStatus, ServerFrame, codec};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// A failure to inject into the next command matching a pattern.
#[derive(Debug, Clone)]
pub struct ScriptedFailure {
    /// SQL LIKE pattern selecting the command; an empty pattern matches any
    pub command_pattern: String,
    pub sqlstate: String,
    pub message: String,
    /// Report the failure as fatal and drop the connection afterwards
    pub fatal: bool,
}

impl ScriptedFailure {
    pub fn new(
        command_pattern: impl Into<String>,
        sqlstate: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            command_pattern: command_pattern.into(),
            sqlstate: sqlstate.into(),
            message: message.into(),
            fatal: false,
        }
    }

    pub fn fatal(mut self) -> Self {
        self.fatal = true;
        self
    }
}

/// Park the next command matching a pattern on a waitpoint before running it.
#[derive(Debug, Clone)]
struct ScriptedHold {
    command_pattern: String,
    waitpoint: String,
}

#[derive(Default)]
struct WorkerState {
    prepared: Mutex<BTreeSet<String>>,
    failures: Mutex<Vec<ScriptedFailure>>,
    holds: Mutex<Vec<ScriptedHold>>,
    waitpoints: Mutex<HashMap<String, Arc<Notify>>>,
    copied_bytes: AtomicU64,
}

impl WorkerState {
    fn waitpoint(&self, name: &str) -> Arc<Notify> {
        self.waitpoints
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn take_failure(&self, command: &str) -> Option<ScriptedFailure> {
        let mut failures = self.failures.lock();
        let position = failures.iter().position(|failure| {
            failure.command_pattern.is_empty() || like_match(&failure.command_pattern, command)
        })?;
        Some(failures.remove(position))
    }

    fn take_hold(&self, command: &str) -> Option<ScriptedHold> {
        let mut holds = self.holds.lock();
        let position = holds.iter().position(|hold| {
            hold.command_pattern.is_empty() || like_match(&hold.command_pattern, command)
        })?;
        Some(holds.remove(position))
    }
}

/// Mock worker node listening on a loopback port.
pub struct MockWorker {
    addr: SocketAddr,
    state: Arc<WorkerState>,
    accept_task: JoinHandle<()>,
}

impl MockWorker {
    /// Bind a listener on an ephemeral loopback port and start serving.
    pub async fn spawn() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(WorkerState::default());

        let accept_state = state.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let state = accept_state.clone();
                        tokio::spawn(async move {
                            if let Err(error) = serve_connection(stream, state).await {
                                tracing::debug!("mock worker connection ended: {}", error);
                            }
                        });
                    }
                    Err(error) => {
                        tracing::warn!("mock worker accept failed: {}", error);
                        break;
                    }
                }
            }
        });

        Ok(Self {
            addr,
            state,
            accept_task,
        })
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Install a prepared transaction directly, as if a coordinator had
    /// prepared it in an earlier life.
    pub fn add_prepared(&self, name: impl Into<String>) {
        self.state.prepared.lock().insert(name.into());
    }

    pub fn prepared_transactions(&self) -> Vec<String> {
        self.state.prepared.lock().iter().cloned().collect()
    }

    pub fn has_prepared(&self, name: &str) -> bool {
        self.state.prepared.lock().contains(name)
    }

    /// Fail the next command matching the failure's pattern.
    pub fn fail_next_matching(&self, failure: ScriptedFailure) {
        self.state.failures.lock().push(failure);
    }

    /// Park the next command matching `command_pattern` on the named
    /// waitpoint before executing it.
    pub fn hold_next_matching(
        &self,
        command_pattern: impl Into<String>,
        waitpoint: impl Into<String>,
    ) {
        self.state.holds.lock().push(ScriptedHold {
            command_pattern: command_pattern.into(),
            waitpoint: waitpoint.into(),
        });
    }

    /// Release one command parked on `WAITPOINT '<name>'`. Releasing before
    /// the command arrives is safe; the permit is kept.
    pub fn release_waitpoint(&self, name: &str) {
        self.state.waitpoint(name).notify_one();
    }

    /// Total copy-data bytes received across all connections.
    pub fn copied_bytes(&self) -> u64 {
        self.state.copied_bytes.load(Ordering::SeqCst)
    }
}

impl Drop for MockWorker {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve_connection(mut stream: TcpStream, state: Arc<WorkerState>) -> io::Result<()> {
    let mut inbound = BytesMut::new();
    let mut scratch = BytesMut::new();

    loop {
        let Some(frame) = read_frame(&mut stream, &mut inbound).await? else {
            return Ok(());
        };

        match frame {
            ClientFrame::Query { sql } => {
                let statements: Vec<String> = sql
                    .split(';')
                    .map(str::trim)
                    .filter(|statement| !statement.is_empty())
                    .map(str::to_string)
                    .collect();

                let mut fatal = false;
                if statements.is_empty() {
                    write_frame(&mut stream, &mut scratch, &CommandResult::command_ok("")).await?;
                }
                for statement in statements {
                    let result = if is_copy_from_stdin(&statement) {
                        run_copy_in(&mut stream, &mut scratch, &mut inbound, &state).await?
                    } else {
                        execute_statement(&statement, &state).await
                    };
                    let is_fatal = result.status == ResultStatus::FatalError;
                    write_frame(&mut stream, &mut scratch, &result).await?;
                    if is_fatal {
                        fatal = true;
                        break;
                    }
                }

                write_ready(&mut stream, &mut scratch).await?;
                if fatal {
                    return Ok(());
                }
            }

            // copy frames outside a copy cycle are protocol slack; ignore
            ClientFrame::CopyData { .. } | ClientFrame::CopyDone | ClientFrame::CopyFail { .. } => {
            }
        }
    }
}

/// Drive one copy-in cycle: announce copy-in, absorb data frames, and
/// produce the final result.
async fn run_copy_in(
    stream: &mut TcpStream,
    scratch: &mut BytesMut,
    inbound: &mut BytesMut,
    state: &WorkerState,
) -> io::Result<CommandResult> {
    write_frame(stream, scratch, &CommandResult::copy_in()).await?;

    let mut chunks: u64 = 0;
    loop {
        let Some(frame) = read_frame(stream, inbound).await? else {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed during copy",
            ));
        };
        match frame {
            ClientFrame::CopyData { data } => {
                chunks += 1;
                state
                    .copied_bytes
                    .fetch_add(data.len() as u64, Ordering::SeqCst);
            }
            ClientFrame::CopyDone => {
                return Ok(CommandResult::command_ok(format!("COPY {}", chunks)));
            }
            ClientFrame::CopyFail { message } => {
                return Ok(CommandResult::error(ErrorFields {
                    sqlstate: Some("57014".to_string()),
                    message: Some(format!("COPY from stdin failed: {}", message)),
                    ..ErrorFields::default()
                }));
            }
            ClientFrame::Query { .. } => {
                return Ok(CommandResult::error(ErrorFields {
                    sqlstate: Some("08P01".to_string()),
                    message: Some("unexpected query during copy".to_string()),
                    ..ErrorFields::default()
                }));
            }
        }
    }
}

async fn execute_statement(statement: &str, state: &WorkerState) -> CommandResult {
    if let Some(hold) = state.take_hold(statement) {
        state.waitpoint(&hold.waitpoint).notified().await;
    }

    if let Some(failure) = state.take_failure(statement) {
        let fields = ErrorFields {
            sqlstate: Some(failure.sqlstate),
            message: Some(failure.message),
            ..ErrorFields::default()
        };
        return if failure.fatal {
            CommandResult::fatal(fields)
        } else {
            CommandResult::error(fields)
        };
    }

    if let Some(name) = command_argument(statement, "WAITPOINT") {
        state.waitpoint(&name).notified().await;
        return CommandResult::command_ok("WAITPOINT");
    }

    if let Some(name) = command_argument(statement, "PREPARE TRANSACTION") {
        state.prepared.lock().insert(name);
        return CommandResult::command_ok("PREPARE TRANSACTION");
    }

    if let Some(name) = command_argument(statement, "COMMIT PREPARED") {
        return finish_prepared(state, &name, "COMMIT PREPARED");
    }

    if let Some(name) = command_argument(statement, "ROLLBACK PREPARED") {
        return finish_prepared(state, &name, "ROLLBACK PREPARED");
    }

    if statement.starts_with("SELECT gid FROM prepared_transactions") {
        let rows = match like_pattern(statement) {
            Some(pattern) => state
                .prepared
                .lock()
                .iter()
                .filter(|name| like_match(&pattern, name))
                .map(|name| vec![Some(name.clone())])
                .collect(),
            None => Vec::new(),
        };
        return CommandResult::tuples(vec!["gid".to_string()], rows);
    }

    if statement.starts_with("SELECT") {
        return CommandResult::tuples(
            vec!["?column?".to_string()],
            vec![vec![Some("1".to_string())]],
        );
    }

    if statement.starts_with("COPY") && statement.contains("TO STDOUT") {
        return CommandResult::copy_out();
    }

    let tag = statement
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_uppercase();
    CommandResult::command_ok(tag)
}

fn finish_prepared(state: &WorkerState, name: &str, tag: &str) -> CommandResult {
    if state.prepared.lock().remove(name) {
        CommandResult::command_ok(tag)
    } else {
        CommandResult::error(ErrorFields {
            sqlstate: Some("42704".to_string()),
            message: Some(format!(
                "prepared transaction with identifier \"{}\" does not exist",
                name
            )),
            ..ErrorFields::default()
        })
    }
}

fn is_copy_from_stdin(statement: &str) -> bool {
    statement.starts_with("COPY") && statement.contains("FROM STDIN")
}

/// Parse `<KEYWORD> '<literal>'`, unescaping doubled quotes.
fn command_argument(statement: &str, keyword: &str) -> Option<String> {
    let rest = statement.strip_prefix(keyword)?.trim_start();
    parse_quoted_literal(rest)
}

fn like_pattern(statement: &str) -> Option<String> {
    let position = statement.find("LIKE")?;
    parse_quoted_literal(statement[position + 4..].trim_start())
}

fn parse_quoted_literal(text: &str) -> Option<String> {
    let rest = text.strip_prefix('\'')?;
    let mut value = String::new();
    let mut chars = rest.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\'' {
            if chars.peek() == Some(&'\'') {
                chars.next();
                value.push('\'');
            } else {
                return Some(value);
            }
        } else {
            value.push(c);
        }
    }
    None
}

async fn read_frame(
    stream: &mut TcpStream,
    inbound: &mut BytesMut,
) -> io::Result<Option<ClientFrame>> {
    loop {
        if let Some(frame) = codec::decode_frame(inbound)
            .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))?
        {
            return Ok(Some(frame));
        }
        let read = stream.read_buf(inbound).await?;
        if read == 0 {
            return Ok(None);
        }
    }
}

async fn write_frame(
    stream: &mut TcpStream,
    scratch: &mut BytesMut,
    result: &CommandResult,
) -> io::Result<()> {
    let frame = ServerFrame::Result {
        result: result.clone(),
    };
    scratch.clear();
    codec::encode_frame(&frame, scratch)
        .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))?;
    stream.write_all(scratch).await
}

async fn write_ready(stream: &mut TcpStream, scratch: &mut BytesMut) -> io::Result<()> {
    scratch.clear();
    codec::encode_frame(&ServerFrame::Ready, scratch)
        .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))?;
    stream.write_all(scratch).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_quoted_literal() {
        assert_eq!(parse_quoted_literal("'abc'"), Some("abc".to_string()));
        assert_eq!(parse_quoted_literal("'a''b'"), Some("a'b".to_string()));
        assert_eq!(parse_quoted_literal("abc"), None);
        assert_eq!(parse_quoted_literal("'unterminated"), None);
    }

    #[test]
    fn test_command_argument() {
        assert_eq!(
            command_argument("COMMIT PREPARED 'lattice_1_2_3_4'", "COMMIT PREPARED"),
            Some("lattice_1_2_3_4".to_string())
        );
        assert_eq!(command_argument("COMMIT", "COMMIT PREPARED"), None);
    }

    #[test]
    fn test_like_pattern_extraction() {
        let statement = "SELECT gid FROM prepared_transactions WHERE gid LIKE 'lattice\\_5\\_%'";
        assert_eq!(like_pattern(statement), Some("lattice\\_5\\_%".to_string()));
    }
}
