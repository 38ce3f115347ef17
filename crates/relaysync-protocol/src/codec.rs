//! Codec for encoding and decoding relay frames.
//!
//! Frames travel as UTF-8 JSON text, one frame per transport message.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::frames::{ClientMessage, RelayMessage};

/// Maximum frame size (512 KiB).
pub const MAX_FRAME_SIZE: usize = 512 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Frame is not valid UTF-8.
    #[error("Frame is not valid UTF-8")]
    NotUtf8,

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode a frame to bytes.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode<T: Serialize>(frame: &T) -> Result<Bytes, ProtocolError> {
    let payload = serde_json::to_vec(frame)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    Ok(Bytes::from(payload))
}

/// Decode a frame from bytes.
///
/// # Errors
///
/// Returns an error if the data is too large, not UTF-8, or not a valid frame.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtocolError> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(data.len()));
    }
    let text = std::str::from_utf8(data).map_err(|_| ProtocolError::NotUtf8)?;
    Ok(serde_json::from_str(text)?)
}

/// Encode a client frame.
///
/// # Errors
///
/// Returns an error if the frame is too large.
pub fn encode_client(frame: &ClientMessage) -> Result<Bytes, ProtocolError> {
    encode(frame)
}

/// Decode a relay frame.
///
/// # Errors
///
/// Returns an error if the data is not a valid relay frame.
pub fn decode_relay(data: &[u8]) -> Result<RelayMessage, ProtocolError> {
    decode(data)
}
