//! Frames sent by the coordinator side of a worker connection

use serde::{Deserialize, Serialize};

/// Coordinator-to-worker frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// One or more semicolon-separated SQL statements. The worker answers
    /// with one `Result` frame per statement followed by a single `Ready`.
    Query { sql: String },

    /// A chunk of an in-progress bulk-copy stream.
    CopyData { data: Vec<u8> },

    /// Finish the current copy stream normally.
    CopyDone,

    /// Abort the current copy stream with an error message.
    CopyFail { message: String },
}
