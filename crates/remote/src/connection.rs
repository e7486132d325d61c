//! Non-blocking connection handle to a worker node
//!
//! A connection owns one socket in non-blocking use: all I/O goes through
//! `try_read`/`try_write`, and readiness is discovered by the multiplexer
//! through [`Connection::ready`]. The handle buffers unsent frames, decodes
//! incoming frames incrementally, and tracks the failure state the
//! dispatcher and the recovery engine key off.

use bytes::{Buf, BytesMut};
use lattice_protocol::{ClientFrame, CommandResult, ResultStatus, ServerFrame, codec};
use std::collections::VecDeque;
use std::io;
use tokio::io::{Interest, Ready};
use tokio::net::TcpStream;

const READ_CHUNK: usize = 8 * 1024;

/// Liveness of the underlying socket as seen by the I/O driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Ok,
    Bad,
}

/// Progress of a non-blocking flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushProgress {
    /// The outbound buffer is empty
    Flushed,
    /// The socket would block; wait for writability
    Blocked,
}

/// Outcome of fetching a result from the local buffers only.
#[derive(Debug)]
pub(crate) enum BufferedResult {
    Result(CommandResult),
    /// All results of every sent query have been consumed
    Drained,
    /// Producing the next result needs socket input
    WouldBlock,
}

pub struct Connection {
    host: String,
    port: u16,
    user: String,
    connection_id: u64,
    stream: TcpStream,
    status: ConnectionStatus,
    /// Sticky per-transaction failure flag; never cleared once set
    transaction_failed: bool,
    /// A synthesized fatal result has been handed out for this breakage
    fatal_reported: bool,
    /// Worker entered copy-in mode and the stream has not been finished
    in_copy: bool,
    outbound: BytesMut,
    inbound: BytesMut,
    received: VecDeque<ServerFrame>,
    /// Queries sent whose `Ready` frame has not been consumed yet
    outstanding_queries: usize,
    copy_bytes_since_flush: u64,
    last_error: Option<String>,
}

impl Connection {
    /// Open a connection to a worker node.
    pub async fn connect(
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        connection_id: u64,
    ) -> io::Result<Self> {
        let host = host.into();
        let stream = TcpStream::connect((host.as_str(), port)).await?;
        stream.set_nodelay(true)?;

        Ok(Self {
            host,
            port,
            user: user.into(),
            connection_id,
            stream,
            status: ConnectionStatus::Ok,
            transaction_failed: false,
            fatal_reported: false,
            in_copy: false,
            outbound: BytesMut::new(),
            inbound: BytesMut::new(),
            received: VecDeque::new(),
            outstanding_queries: 0,
            copy_bytes_since_flush: 0,
            last_error: None,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Ok
    }

    /// The first error that broke this connection, if any.
    pub fn error_message(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Record a socket-level failure. The first message wins; later failures
    /// are consequences of the original one.
    pub fn mark_broken(&mut self, message: impl Into<String>) {
        if self.status == ConnectionStatus::Bad {
            return;
        }
        self.status = ConnectionStatus::Bad;
        self.last_error = Some(message.into());
    }

    pub fn transaction_failed(&self) -> bool {
        self.transaction_failed
    }

    pub fn mark_transaction_failed(&mut self) {
        self.transaction_failed = true;
    }

    /// Whether the caller should synthesize a fatal result for a broken
    /// connection. True exactly once per breakage; afterwards the connection
    /// reads as drained.
    pub(crate) fn take_fatal_report(&mut self) -> bool {
        if self.fatal_reported {
            return false;
        }
        self.fatal_reported = true;
        true
    }

    /// Whether producing the next result would need socket input.
    pub fn is_busy(&self) -> bool {
        if self.status == ConnectionStatus::Bad || self.in_copy {
            return false;
        }
        self.received.is_empty() && self.outstanding_queries > 0
    }

    pub(crate) fn queue_frame(&mut self, frame: &ClientFrame) {
        if let Err(error) = codec::encode_frame(frame, &mut self.outbound) {
            self.mark_broken(error.to_string());
        }
    }

    pub(crate) fn note_query_sent(&mut self) {
        self.outstanding_queries += 1;
    }

    /// Finish (or abort) the current copy stream.
    pub(crate) fn end_copy(&mut self, error: Option<&str>) {
        let frame = match error {
            None => ClientFrame::CopyDone,
            Some(message) => ClientFrame::CopyFail {
                message: message.to_string(),
            },
        };
        self.queue_frame(&frame);
        self.in_copy = false;
    }

    pub(crate) fn add_copy_bytes(&mut self, count: u64) -> u64 {
        self.copy_bytes_since_flush += count;
        self.copy_bytes_since_flush
    }

    pub(crate) fn reset_copy_counter(&mut self) {
        self.copy_bytes_since_flush = 0;
    }

    /// Copy bytes written since the last forced flush.
    pub fn copy_bytes_since_flush(&self) -> u64 {
        self.copy_bytes_since_flush
    }

    /// Write as much buffered output as the socket accepts right now.
    pub fn flush(&mut self) -> io::Result<FlushProgress> {
        if self.status == ConnectionStatus::Bad {
            return Err(self.broken_error());
        }
        while !self.outbound.is_empty() {
            match self.stream.try_write(&self.outbound) {
                Ok(0) => {
                    self.mark_broken("connection closed while sending");
                    return Err(self.broken_error());
                }
                Ok(written) => {
                    self.outbound.advance(written);
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(FlushProgress::Blocked);
                }
                Err(error) => {
                    self.mark_broken(error.to_string());
                    return Err(error);
                }
            }
        }
        Ok(FlushProgress::Flushed)
    }

    /// Read whatever the socket has buffered and decode complete frames.
    pub fn consume_input(&mut self) -> io::Result<()> {
        if self.status == ConnectionStatus::Bad {
            return Err(self.broken_error());
        }
        let mut chunk = [0u8; READ_CHUNK];
        let mut closed = false;
        loop {
            match self.stream.try_read(&mut chunk) {
                Ok(0) => {
                    closed = true;
                    break;
                }
                Ok(read) => {
                    self.inbound.extend_from_slice(&chunk[..read]);
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) => {
                    self.mark_broken(error.to_string());
                    return Err(error);
                }
            }
        }

        // Decode before reporting a close: a worker that sends a fatal result
        // and hangs up delivers both in the same read, and the result must
        // stay retrievable.
        loop {
            match codec::decode_frame::<ServerFrame>(&mut self.inbound) {
                Ok(Some(frame)) => self.received.push_back(frame),
                Ok(None) => break,
                Err(error) => {
                    self.mark_broken(error.to_string());
                    return Err(io::Error::new(io::ErrorKind::InvalidData, error));
                }
            }
        }

        if closed {
            self.mark_broken("connection closed by remote node");
            return Err(self.broken_error());
        }
        Ok(())
    }

    /// Fetch the next result from the local buffers without touching the
    /// socket. Consumes `Ready` markers along the way.
    pub(crate) fn take_buffered_result(&mut self) -> BufferedResult {
        loop {
            match self.received.pop_front() {
                Some(ServerFrame::Result { result }) => {
                    if result.status == ResultStatus::CopyIn {
                        self.in_copy = true;
                    }
                    return BufferedResult::Result(result);
                }
                Some(ServerFrame::Ready) => {
                    self.outstanding_queries = self.outstanding_queries.saturating_sub(1);
                    self.in_copy = false;
                }
                None if self.in_copy => {
                    // a copy stream accepts data; re-announce copy-in rather
                    // than block, the way the next result fetch would
                    return BufferedResult::Result(CommandResult::copy_in());
                }
                None if self.outstanding_queries == 0 => return BufferedResult::Drained,
                None => return BufferedResult::WouldBlock,
            }
        }
    }

    /// Wait for the socket to become ready for `interest`.
    pub(crate) async fn ready(&self, interest: Interest) -> io::Result<Ready> {
        self.stream.ready(interest).await
    }

    fn broken_error(&self) -> io::Error {
        io::Error::new(
            io::ErrorKind::NotConnected,
            self.last_error
                .clone()
                .unwrap_or_else(|| "connection not open".to_string()),
        )
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("connection_id", &self.connection_id)
            .field("status", &self.status)
            .field("transaction_failed", &self.transaction_failed)
            .field("outstanding_queries", &self.outstanding_queries)
            .finish_non_exhaustive()
    }
}
