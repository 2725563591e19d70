//! Transport, comm and engine error types.

use kgate_core::{CommId, MsgId, ProtocolError};
use thiserror::Error;

/// Errors from a kernel transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The WebSocket handshake failed.
    #[error("failed to connect to {url}: {reason}")]
    Connect {
        /// Endpoint being dialled.
        url: String,
        /// Handshake error.
        reason: String,
    },

    /// The handshake did not finish in time.
    #[error("connecting to {url} timed out after {timeout_ms}ms")]
    ConnectTimeout {
        /// Endpoint being dialled.
        url: String,
        /// How long we waited.
        timeout_ms: u64,
    },

    /// The connection is closed, locally or by the peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// Any other WebSocket failure.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// The outbound message could not be encoded.
    #[error(transparent)]
    Encode(#[from] ProtocolError),
}

impl TransportError {
    /// Whether the connection is gone for good.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed)
    }
}

/// Errors from comm operations.
#[derive(Debug, Error)]
pub enum CommError {
    /// The comm was already closed.
    #[error("comm {comm_id} is closed")]
    Closed {
        /// Closed comm.
        comm_id: CommId,
    },

    /// The manager was shut down; nothing more can be emitted.
    #[error("comm manager is closed")]
    ManagerClosed,
}

/// Errors from the channel protocol engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// `stop()` was called.
    #[error("channel engine is stopped")]
    Stopped,

    /// The caller's deadline passed before the reply arrived.
    #[error("no {msg_type} for request {msg_id} within {timeout_ms}ms")]
    Timeout {
        /// Request id.
        msg_id: MsgId,
        /// Reply type we were waiting for.
        msg_type: String,
        /// Deadline.
        timeout_ms: u64,
    },

    /// The connection died while the request was outstanding.
    #[error("connection lost while waiting for reply to {msg_id}")]
    Disconnected {
        /// Request id.
        msg_id: MsgId,
    },

    /// A request with this id is already outstanding.
    #[error("request {msg_id} is already pending")]
    DuplicateRequest {
        /// Request id.
        msg_id: MsgId,
    },

    /// The message type has no reply, so it cannot be awaited.
    #[error("{msg_type} has no reply to wait for")]
    NoReply {
        /// Offending message type.
        msg_type: String,
    },

    /// `input_reply` without a preceding `input_request`.
    #[error("no input request is pending")]
    NoInputRequest,

    /// Sending failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl EngineError {
    /// Whether this is a caller-side deadline expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
