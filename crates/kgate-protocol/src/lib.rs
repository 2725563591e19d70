//! # kgate-protocol
//!
//! Everything that happens on one kernel connection:
//!
//! - [`transport`]: the [`Transport`] trait, the WebSocket implementation
//!   and an in-process pair
//! - [`comm`]: the comm sub-protocol (widget channels)
//! - [`engine`]: channel demultiplexing, reply correlation and subscriber
//!   fan-out

#![deny(unsafe_code)]

pub mod comm;
pub mod engine;
pub mod errors;
pub mod transport;

pub use comm::{Comm, CommManager};
pub use engine::{ChannelEngine, ChannelSubscriber, EngineConfig};
pub use errors::{CommError, EngineError, TransportError};
pub use transport::{MemoryPeer, MemoryTransport, Transport, WsConfig, WsTransport};
