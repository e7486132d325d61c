//! Incremental frame codec
//!
//! Frames travel as newline-delimited JSON. Decoding consumes exactly one
//! complete line when available and otherwise leaves the buffer untouched,
//! which is what the non-blocking consume-input path needs: partial frames
//! accumulate across reads until a newline arrives.

use bytes::{BufMut, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Upper bound on a single encoded frame. A buffer that grows past this
/// without a newline indicates a corrupt peer.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame encoding failed: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("frame decoding failed: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("frame exceeds {MAX_FRAME_LEN} bytes without a terminator")]
    FrameTooLarge,
}

/// Append one encoded frame to `buf`.
pub fn encode_frame<T: Serialize>(frame: &T, buf: &mut BytesMut) -> Result<(), CodecError> {
    let encoded = serde_json::to_vec(frame).map_err(CodecError::Encode)?;
    buf.reserve(encoded.len() + 1);
    buf.put_slice(&encoded);
    buf.put_u8(b'\n');
    Ok(())
}

/// Decode one frame from `buf` if a complete line is buffered.
///
/// Returns `Ok(None)` when no full frame has arrived yet.
pub fn decode_frame<T: DeserializeOwned>(buf: &mut BytesMut) -> Result<Option<T>, CodecError> {
    let Some(newline) = buf.iter().position(|&b| b == b'\n') else {
        if buf.len() > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge);
        }
        return Ok(None);
    };

    let line = buf.split_to(newline + 1);
    let frame = serde_json::from_slice(&line[..newline]).map_err(CodecError::Decode)?;
    Ok(Some(frame))
}
