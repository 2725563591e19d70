//! Jupyter messaging protocol model.
//!
//! - [`Header`] and [`Session`] build outbound messages
//! - [`Content`] is the typed union keyed by `msg_type`
//! - [`MsgType::route`] is the classification table every inbound frame goes through
//! - [`OutputEnvelope`] is the flattened form given to output listeners

pub mod content;
pub mod envelope;
pub mod header;
pub mod message;
pub mod msg_type;

pub use content::{
    ClearOutput, CommClose, CommInfoReply, CommInfoRequest, CommMsg, CommOpen, CompleteReply,
    CompleteRequest, CompletenessStatus, Content, DisplayData, ErrorContent, ExecuteInput,
    ExecuteReply, ExecuteRequest, ExecuteResult, HistoryReply, HistoryRequest, InputReply,
    InputRequest, InspectReply, InspectRequest, InterruptReply, IsCompleteReply,
    IsCompleteRequest, KernelInfoReply, MimeBundle, ReplyStatus, ShutdownReply, ShutdownRequest,
    StatusContent, StreamContent, StreamName,
};
pub use envelope::OutputEnvelope;
pub use header::{Header, Session};
pub use message::Message;
pub use msg_type::{Channel, ExecutionState, MsgType, Route, RouteKind, UNKNOWN_ROUTE, classify};
