//! # kgate-core
//!
//! Foundation types for driving remote Jupyter kernels.
//!
//! This crate provides the shared vocabulary every other kgate crate depends on:
//!
//! - **Branded IDs**: `KernelId`, `SessionId`, `MsgId`, `CommId` newtypes
//! - **Messages**: [`Message`] with a typed [`Content`] union keyed by `msg_type`
//! - **Channels**: the fixed `msg_type` → [`Channel`] classification table
//! - **Envelope**: [`OutputEnvelope`], the stable shape handed to frontends
//! - **Errors**: [`ProtocolError`] for malformed inbound frames
//! - **Logging**: `tracing` subscriber setup and in-memory capture for tests

#![deny(unsafe_code)]

pub mod constants;
pub mod errors;
pub mod ids;
pub mod logging;
pub mod messages;

pub use errors::ProtocolError;
pub use ids::{CommId, KernelId, MsgId, SessionId};
pub use messages::{
    Channel, Content, ExecutionState, Header, Message, MsgType, OutputEnvelope, Route, RouteKind,
    Session,
};
