//! Wire protocol for coordinator-to-worker connections
//!
//! This crate defines the text-based command/response protocol spoken over a
//! worker connection: the frames each side sends, the result status
//! classification, structured error fields, and the incremental codec used
//! by the non-blocking I/O driver.

pub mod codec;
pub mod messages;
pub mod responses;

pub use codec::{CodecError, decode_frame, encode_frame};
pub use messages::ClientFrame;
pub use responses::{CommandResult, ErrorFields, ResultStatus, ServerFrame};
