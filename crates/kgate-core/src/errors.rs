//! Wire-protocol parse errors.

use thiserror::Error;

/// Errors raised while decoding or encoding a wire message.
///
/// The inbound read loop logs these and drops the frame; they never end
/// the loop.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame was not valid JSON or did not match the envelope shape.
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),

    /// The frame carried no usable header.
    #[error("message has no header")]
    MissingHeader,

    /// The content did not match the shape required by its `msg_type`.
    #[error("invalid {msg_type} content: {reason}")]
    InvalidContent {
        /// The message type whose content failed to decode.
        msg_type: String,
        /// Decoder message.
        reason: String,
    },

    /// The frame was not UTF-8 text.
    #[error("frame is not valid UTF-8")]
    NotUtf8,
}
