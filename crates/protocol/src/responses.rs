//! Frames and result types sent by the worker side of a connection

use serde::{Deserialize, Serialize};

/// Classification of a command's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    /// A single row returned in row-by-row mode
    SingleTuple,
    /// A query completed and returned its full row set
    TuplesOk,
    /// A non-query command completed
    CommandOk,
    /// The worker is ready to receive bulk-copy data
    CopyIn,
    /// The worker is about to send bulk-copy data
    CopyOut,
    /// The command failed
    Error,
    /// The command failed and the connection can make no further progress
    FatalError,
}

/// Structured error fields carried by a failed result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFields {
    /// Five-character SQL state code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sqlstate: Option<String>,

    /// Primary human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// One command's completed response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub status: ResultStatus,

    /// Tag describing a completed command ("COMMIT PREPARED", "COPY 10", ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_tag: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<String>,

    /// Row data; `None` cells are SQL NULLs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rows: Vec<Vec<Option<String>>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorFields>,
}

impl Default for ResultStatus {
    fn default() -> Self {
        ResultStatus::CommandOk
    }
}

impl CommandResult {
    /// A completed non-query command.
    pub fn command_ok(tag: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::CommandOk,
            command_tag: Some(tag.into()),
            ..Self::default()
        }
    }

    /// A completed query with its full row set.
    pub fn tuples(columns: Vec<String>, rows: Vec<Vec<Option<String>>>) -> Self {
        Self {
            status: ResultStatus::TuplesOk,
            columns,
            rows,
            ..Self::default()
        }
    }

    /// The copy-in handshake result.
    pub fn copy_in() -> Self {
        Self {
            status: ResultStatus::CopyIn,
            ..Self::default()
        }
    }

    /// The copy-out handshake result.
    pub fn copy_out() -> Self {
        Self {
            status: ResultStatus::CopyOut,
            ..Self::default()
        }
    }

    /// A failed command.
    pub fn error(fields: ErrorFields) -> Self {
        Self {
            status: ResultStatus::Error,
            error: Some(fields),
            ..Self::default()
        }
    }

    /// A failure after which the connection can make no further progress.
    pub fn fatal(fields: ErrorFields) -> Self {
        Self {
            status: ResultStatus::FatalError,
            error: Some(fields),
            ..Self::default()
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Cell value at (row, column); `None` for NULL or out of range.
    pub fn value(&self, row: usize, column: usize) -> Option<&str> {
        self.rows.get(row)?.get(column)?.as_deref()
    }
}

/// Worker-to-coordinator frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// One command's completed response
    Result { result: CommandResult },

    /// All results for the current query cycle have been sent
    Ready,
}
