//! The wire message and its JSON codec.
//!
//! Jupyter-over-WebSocket frames are JSON objects of the form
//! `{header, parent_header, metadata, content, buffers, channel}`. The
//! channel carried on the wire is advisory; the local classification table
//! is authoritative.

use std::str::FromStr;

use serde::de::Error as _;
use serde::ser::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use tracing::warn;

use crate::errors::ProtocolError;
use crate::ids::MsgId;
use crate::messages::content::Content;
use crate::messages::header::Header;
use crate::messages::msg_type::{Channel, ExecutionState, MsgType, Route, classify};

/// A single protocol message.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    /// This message's header.
    pub header: Header,
    /// Header of the message this one answers, if any.
    pub parent_header: Option<Header>,
    /// Free-form metadata.
    pub metadata: Map<String, Value>,
    /// Typed content.
    pub content: Content,
    /// Binary buffers, carried opaquely.
    pub buffers: Vec<Value>,
    /// Channel the message travels on.
    pub channel: Channel,
}

impl Message {
    /// Assemble a message; the channel comes from the classification table.
    pub fn new(header: Header, parent_header: Option<Header>, content: Content) -> Self {
        let channel = classify(&header.msg_type).channel;
        Self {
            header,
            parent_header,
            metadata: Map::new(),
            content,
            buffers: Vec::new(),
            channel,
        }
    }

    /// Decode a raw frame.
    ///
    /// An unrecognised `msg_type` is not an error: the content is kept as
    /// [`Content::Unknown`] and the message is routed to iopub.
    pub fn parse(raw: &[u8]) -> Result<Self, ProtocolError> {
        let wire: WireMessage = serde_json::from_slice(raw)?;
        Self::from_wire(wire)
    }

    /// Encode for the wire.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        let wire = self.to_wire()?;
        Ok(serde_json::to_string(&wire)?)
    }

    /// Message id.
    pub fn msg_id(&self) -> &MsgId {
        &self.header.msg_id
    }

    /// Raw message type name.
    pub fn msg_type(&self) -> &str {
        &self.header.msg_type
    }

    /// Parsed message type, `None` when unrecognised.
    pub fn kind(&self) -> Option<MsgType> {
        self.header.kind()
    }

    /// Correlation id: the `msg_id` of the request this message answers.
    pub fn parent_msg_id(&self) -> Option<&MsgId> {
        self.parent_header.as_ref().map(|h| &h.msg_id)
    }

    /// Whether this is a reply to a request.
    pub fn is_reply(&self) -> bool {
        self.kind().is_some_and(MsgType::is_reply)
    }

    /// Routing decision for this message.
    pub fn route(&self) -> Route {
        classify(&self.header.msg_type)
    }

    /// State carried by a `status` message.
    pub fn execution_state(&self) -> Option<ExecutionState> {
        match &self.content {
            Content::Status(s) => Some(s.execution_state),
            _ => None,
        }
    }

    fn from_wire(wire: WireMessage) -> Result<Self, ProtocolError> {
        let header: Header = match wire.header {
            Value::Object(map) if !map.is_empty() => serde_json::from_value(Value::Object(map))?,
            _ => return Err(ProtocolError::MissingHeader),
        };

        let parent_header = match wire.parent_header {
            Value::Object(map) if !map.is_empty() => {
                Some(serde_json::from_value(Value::Object(map))?)
            }
            _ => None,
        };

        let (content, channel) = match header.kind() {
            Some(kind) => (Content::from_value(kind, wire.content)?, kind.route().channel),
            None => {
                warn!(msg_type = %header.msg_type, msg_id = %header.msg_id, "unknown msg_type, forwarding as opaque iopub content");
                let content = Content::Unknown {
                    msg_type: header.msg_type.clone(),
                    content: wire.content,
                };
                (content, Channel::IoPub)
            }
        };

        let metadata = match wire.metadata {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let buffers = match wire.buffers {
            Value::Array(items) => items,
            _ => Vec::new(),
        };

        Ok(Self {
            header,
            parent_header,
            metadata,
            content,
            buffers,
            channel,
        })
    }

    fn to_wire(&self) -> Result<WireMessageRef<'_>, ProtocolError> {
        let parent_header = match &self.parent_header {
            Some(h) => serde_json::to_value(h)?,
            None => Value::Object(Map::new()),
        };
        Ok(WireMessageRef {
            header: &self.header,
            parent_header,
            metadata: &self.metadata,
            content: self.content.to_value()?,
            buffers: &self.buffers,
            channel: self.channel,
        })
    }
}

impl FromStr for Message {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s.as_bytes())
    }
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    header: Value,
    #[serde(default)]
    parent_header: Value,
    #[serde(default)]
    metadata: Value,
    #[serde(default)]
    content: Value,
    #[serde(default)]
    buffers: Value,
}

#[derive(Serialize)]
struct WireMessageRef<'a> {
    header: &'a Header,
    parent_header: Value,
    metadata: &'a Map<String, Value>,
    content: Value,
    buffers: &'a [Value],
    channel: Channel,
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_wire()
            .map_err(S::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = WireMessage::deserialize(deserializer)?;
        Self::from_wire(wire).map_err(D::Error::custom)
    }
}
