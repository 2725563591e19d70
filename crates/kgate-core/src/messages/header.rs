//! Message headers and the client session that stamps them.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_USERNAME, PROTOCOL_VERSION};
use crate::ids::{MsgId, SessionId};
use crate::messages::content::Content;
use crate::messages::message::Message;
use crate::messages::msg_type::MsgType;

/// Header of a Jupyter message.
///
/// Inbound headers are decoded leniently: only `msg_id` and `msg_type` are
/// required, everything else defaults to empty.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Unique id of this message.
    pub msg_id: MsgId,
    /// User that produced the message.
    #[serde(default)]
    pub username: String,
    /// Session that produced the message.
    #[serde(default)]
    pub session: String,
    /// Creation time, ISO 8601.
    #[serde(default)]
    pub date: String,
    /// Message type name.
    pub msg_type: String,
    /// Messaging protocol version.
    #[serde(rename = "version", default)]
    pub protocol_version: String,
}

impl Header {
    /// Build a fresh header for an outbound message.
    pub fn new(msg_type: &str, session: &Session) -> Self {
        Self {
            msg_id: MsgId::new(),
            username: session.username.clone(),
            session: session.id.to_string(),
            date: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            msg_type: msg_type.to_owned(),
            protocol_version: PROTOCOL_VERSION.to_owned(),
        }
    }

    /// Parsed message type, if recognised.
    pub fn kind(&self) -> Option<MsgType> {
        MsgType::parse(&self.msg_type)
    }
}

/// Client-side identity used to build outbound messages.
///
/// One session per kernel connection; the same id is passed to the gateway
/// as `session_id` when the WebSocket is opened.
#[derive(Clone, Debug)]
pub struct Session {
    id: SessionId,
    username: String,
}

impl Session {
    /// New session with a random id.
    pub fn new(username: impl Into<String>) -> Self {
        Self::with_id(SessionId::new(), username)
    }

    /// Session with a known id.
    pub fn with_id(id: SessionId, username: impl Into<String>) -> Self {
        let username = username.into();
        let username = if username.is_empty() {
            DEFAULT_USERNAME.to_owned()
        } else {
            username
        };
        Self { id, username }
    }

    /// Session id.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Username stamped into headers.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Build a top-level message (no parent) carrying `content`.
    pub fn message(&self, content: impl Into<Content>) -> Message {
        let content = content.into();
        let header = Header::new(content.msg_type_str(), self);
        Message::new(header, None, content)
    }

    /// Build a reply to `parent`; the reply's `parent_header` is the
    /// triggering message's header.
    pub fn reply_to(&self, parent: &Message, content: impl Into<Content>) -> Message {
        let content = content.into();
        let header = Header::new(content.msg_type_str(), self);
        Message::new(header, Some(parent.header.clone()), content)
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new(DEFAULT_USERNAME)
    }
}
