//! Wire codec and framing.
//!
//! Messages are serialized with bincode. When several container messages
//! answer one request (a chunked `LS`), each serialized payload is prefixed
//! by a `[XXXXXXXX]` header where `XXXXXXXX` is the payload length in eight
//! hex digits.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::heartbeat::Heartbeat;
use crate::md::MdRequest;

/// Length of the `[XXXXXXXX]` frame header in bytes.
pub const FRAME_HEADER_LEN: usize = 10;

/// Errors of the wire codec.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// bincode failed to encode or decode a message.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A frame header was malformed or truncated.
    #[error("bad frame header: {0}")]
    BadFrame(String),
}

/// Top-level message arriving from a client connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RequestEnvelope {
    /// A metadata request.
    Md(MdRequest),
    /// A heartbeat.
    Heartbeat(Heartbeat),
}

/// Serialize any message to bytes.
pub fn serialize_message<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtoError> {
    bincode::serialize(msg).map_err(|e| ProtoError::Serialization(e.to_string()))
}

/// Deserialize bytes into a message.
pub fn deserialize_message<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtoError> {
    bincode::deserialize(data).map_err(|e| ProtoError::Serialization(e.to_string()))
}

/// The `[XXXXXXXX]` header for a payload of `len` bytes.
pub fn frame_header(len: usize) -> String {
    format!("[{:08x}]", len as u32)
}

/// A complete frame: header followed by the payload.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    out.extend_from_slice(frame_header(payload.len()).as_bytes());
    out.extend_from_slice(payload);
    out
}

/// Split a byte stream of consecutive frames into payload slices.
pub fn split_frames(mut data: &[u8]) -> Result<Vec<&[u8]>, ProtoError> {
    let mut frames = Vec::new();

    while !data.is_empty() {
        if data.len() < FRAME_HEADER_LEN {
            return Err(ProtoError::BadFrame("truncated header".to_string()));
        }

        let header = &data[..FRAME_HEADER_LEN];

        if header[0] != b'[' || header[FRAME_HEADER_LEN - 1] != b']' {
            return Err(ProtoError::BadFrame("missing brackets".to_string()));
        }

        let hex = std::str::from_utf8(&header[1..FRAME_HEADER_LEN - 1])
            .map_err(|e| ProtoError::BadFrame(e.to_string()))?;
        let len = usize::from_str_radix(hex, 16)
            .map_err(|e| ProtoError::BadFrame(format!("bad length '{hex}': {e}")))?;

        if data.len() < FRAME_HEADER_LEN + len {
            return Err(ProtoError::BadFrame("truncated payload".to_string()));
        }

        frames.push(&data[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len]);
        data = &data[FRAME_HEADER_LEN + len..];
    }

    Ok(frames)
}
