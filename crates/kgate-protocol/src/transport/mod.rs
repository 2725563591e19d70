//! One physical connection to one kernel.
//!
//! The engine only sees the [`Transport`] trait. [`WsTransport`] talks to a
//! real gateway; [`MemoryTransport`] is an in-process pair for tests and
//! embedding.

pub mod memory;
pub mod ws;

pub use memory::{MemoryPeer, MemoryTransport};
pub use ws::{WsConfig, WsTransport};

use async_trait::async_trait;
use bytes::Bytes;
use kgate_core::Message;

use crate::errors::TransportError;

/// Duplex message pipe to a kernel.
///
/// `send` and `receive` may be called concurrently from different tasks.
/// Implementations never reconnect; once closed they stay closed.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Encode and send one message.
    ///
    /// Fails with [`TransportError::ConnectionClosed`] after `close`.
    async fn send(&self, msg: &Message) -> Result<(), TransportError>;

    /// Next inbound data frame. Control frames are handled internally.
    async fn receive(&self) -> Result<Bytes, TransportError>;

    /// Close the connection. Idempotent.
    async fn close(&self);

    /// Whether the connection is closed.
    fn is_closed(&self) -> bool;
}
