//! Non-blocking remote command execution
//!
//! This crate drives many worker-node connections without ever blocking the
//! calling task outside a single multiplexed wait:
//! - [`Connection`] wraps one non-blocking socket to a worker
//! - [`Dispatcher`] sends commands and retrieves results, with optional
//!   command logging and copy-stream backpressure
//! - [`multiplexer::wait_for_all`] blocks until every connection in a set
//!   has completed or failed, while honoring cancellation and a
//!   supervisor-liveness check

mod connection;
mod dispatcher;
mod error;
pub mod multiplexer;

pub use connection::{Connection, ConnectionStatus, FlushProgress};
pub use dispatcher::{
    DEFAULT_COPY_FLUSH_THRESHOLD, Dispatcher, RemoteCommandSettings, connection_error,
    evaluate_single_query_result, is_response_ok, read_first_column_text, result_error,
};
pub use error::{Abort, RemoteError, Result, ResultFailure};
