//! Frontend-facing output envelope.
//!
//! This is the one shape handed to output listeners and live viewers. Keep
//! it stable when the internal message model changes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::messages::message::Message;
use crate::messages::msg_type::{Channel, ExecutionState};

/// Simplified view of a kernel message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutputEnvelope {
    /// Id of this message.
    pub msg_id: String,
    /// Message type name.
    pub msg_type: String,
    /// `msg_id` of the request that caused it.
    pub parent_id: Option<String>,
    /// Content as JSON.
    pub content: Value,
    /// Metadata as JSON.
    pub metadata: Value,
    /// Channel the message arrived on.
    pub channel: Channel,
}

impl OutputEnvelope {
    /// Flatten a message into an envelope.
    pub fn from_message(msg: &Message) -> Self {
        Self {
            msg_id: msg.header.msg_id.to_string(),
            msg_type: msg.header.msg_type.clone(),
            parent_id: msg.parent_msg_id().map(ToString::to_string),
            content: msg.content.to_value().unwrap_or_default(),
            metadata: Value::Object(msg.metadata.clone()),
            channel: msg.channel,
        }
    }

    /// Whether this envelope was caused by request `msg_id`.
    pub fn is_child_of(&self, msg_id: &str) -> bool {
        self.parent_id.as_deref() == Some(msg_id)
    }

    /// State reported when this is a `status` envelope.
    pub fn execution_state(&self) -> Option<ExecutionState> {
        if self.msg_type != "status" {
            return None;
        }
        self.content
            .get("execution_state")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

impl From<&Message> for OutputEnvelope {
    fn from(msg: &Message) -> Self {
        Self::from_message(msg)
    }
}
