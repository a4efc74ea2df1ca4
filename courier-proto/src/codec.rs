//! Serialization for the Courier wire protocol.
//!
//! Binary WebSocket frames carry postcard-encoded events; text frames carry
//! JSON. Both encodings describe the same [`ClientEvent`](crate::event::ClientEvent)
//! and [`ServerEvent`](crate::event::ServerEvent) types.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Binary serialization or deserialization failed.
    #[error("binary codec error: {0}")]
    Binary(#[from] postcard::Error),
    /// JSON serialization or deserialization failed.
    #[error("json codec error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encoding chosen by a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WireFormat {
    /// postcard over binary frames.
    #[default]
    Binary,
    /// JSON over text frames.
    Json,
}

/// An encoded frame, ready to be wrapped in a WebSocket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Binary frame payload.
    Binary(Vec<u8>),
    /// Text frame payload.
    Text(String),
}

impl Frame {
    /// The format this frame was encoded with.
    #[must_use]
    pub const fn format(&self) -> WireFormat {
        match self {
            Self::Binary(_) => WireFormat::Binary,
            Self::Text(_) => WireFormat::Json,
        }
    }
}

/// Encodes a value into bytes using postcard.
///
/// # Errors
///
/// Returns [`CodecError::Binary`] if the value cannot be serialized.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    Ok(postcard::to_allocvec(value)?)
}

/// Decodes a value from postcard bytes.
///
/// # Errors
///
/// Returns [`CodecError::Binary`] if the bytes are not a valid encoding.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    Ok(postcard::from_bytes(bytes)?)
}

/// Encodes a value as JSON text.
///
/// # Errors
///
/// Returns [`CodecError::Json`] if the value cannot be serialized.
pub fn encode_json<T: Serialize>(value: &T) -> Result<String, CodecError> {
    Ok(serde_json::to_string(value)?)
}

/// Decodes a value from JSON text.
///
/// # Errors
///
/// Returns [`CodecError::Json`] if the text is not a valid encoding.
pub fn decode_json<T: DeserializeOwned>(text: &str) -> Result<T, CodecError> {
    Ok(serde_json::from_str(text)?)
}

/// Encodes a value into a frame of the given format.
///
/// # Errors
///
/// Returns a [`CodecError`] if serialization fails.
pub fn encode_frame<T: Serialize>(value: &T, format: WireFormat) -> Result<Frame, CodecError> {
    match format {
        WireFormat::Binary => encode(value).map(Frame::Binary),
        WireFormat::Json => encode_json(value).map(Frame::Text),
    }
}

/// Decodes a frame, picking the decoder from the frame kind.
///
/// # Errors
///
/// Returns a [`CodecError`] if the payload is not a valid encoding.
pub fn decode_frame<T: DeserializeOwned>(frame: &Frame) -> Result<T, CodecError> {
    match frame {
        Frame::Binary(bytes) => decode(bytes),
        Frame::Text(text) => decode_json(text),
    }
}
