//! Typed message content, one shape per `msg_type`.
//!
//! Structs are decoded leniently (`#[serde(default)]`) because kernels in
//! the wild omit optional fields. Rich output payloads (`data`, `metadata`)
//! stay as JSON maps so they round-trip untouched.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::ProtocolError;
use crate::ids::CommId;
use crate::messages::msg_type::{ExecutionState, MsgType};

/// MIME type → payload mapping used by display outputs.
pub type MimeBundle = Map<String, Value>;

/// Status field common to every reply.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    /// Request succeeded.
    #[default]
    Ok,
    /// Request raised an error.
    Error,
    /// Request was aborted (an earlier cell failed).
    #[serde(rename = "aborted", alias = "abort")]
    Abort,
}

/// `execute_request` content.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecuteRequest {
    /// Source to run.
    pub code: String,
    /// Run without broadcasting outputs or incrementing the counter.
    pub silent: bool,
    /// Record in history.
    pub store_history: bool,
    /// Expressions evaluated after the code runs.
    pub user_expressions: Map<String, Value>,
    /// Whether the kernel may prompt on stdin.
    pub allow_stdin: bool,
    /// Abort queued executions if this one fails.
    pub stop_on_error: bool,
}

impl ExecuteRequest {
    /// Request with protocol defaults for `code`.
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            ..Self::default()
        }
    }
}

impl Default for ExecuteRequest {
    fn default() -> Self {
        Self {
            code: String::new(),
            silent: false,
            store_history: true,
            user_expressions: Map::new(),
            allow_stdin: true,
            stop_on_error: true,
        }
    }
}

/// `execute_reply` content.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecuteReply {
    /// Outcome.
    pub status: ReplyStatus,
    /// Execution counter after this request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_count: Option<u64>,
    /// Exception name when `status == error`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ename: Option<String>,
    /// Exception value when `status == error`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evalue: Option<String>,
    /// Formatted traceback lines.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub traceback: Vec<String>,
    /// Deprecated pager/next-input payloads.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub payload: Vec<Value>,
    /// Results of `user_expressions`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_expressions: Option<Map<String, Value>>,
}

/// `inspect_request` content.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InspectRequest {
    /// Source containing the object.
    pub code: String,
    /// Cursor offset in unicode code points.
    pub cursor_pos: usize,
    /// 0 for summary, 1 for source.
    pub detail_level: u8,
}

/// `inspect_reply` content.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InspectReply {
    /// Outcome.
    pub status: ReplyStatus,
    /// Whether an object was found.
    pub found: bool,
    /// Inspection output.
    pub data: MimeBundle,
    /// Output metadata.
    pub metadata: Map<String, Value>,
}

/// `complete_request` content.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompleteRequest {
    /// Source being completed.
    pub code: String,
    /// Cursor offset in unicode code points.
    pub cursor_pos: usize,
}

/// `complete_reply` content.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompleteReply {
    /// Outcome.
    pub status: ReplyStatus,
    /// Candidate completions.
    pub matches: Vec<String>,
    /// Start of the replaced range.
    pub cursor_start: usize,
    /// End of the replaced range.
    pub cursor_end: usize,
    /// Extra completion info.
    pub metadata: Map<String, Value>,
}

/// `history_request` content.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryRequest {
    /// Include outputs.
    pub output: bool,
    /// Return raw input.
    pub raw: bool,
    /// `range`, `tail` or `search`.
    pub hist_access_type: String,
    /// Session number for `range`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<i64>,
    /// First line for `range`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<i64>,
    /// Last line for `range`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<i64>,
    /// Entry count for `tail` and `search`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,
    /// Glob for `search`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// Deduplicate `search` results.
    pub unique: bool,
}

impl HistoryRequest {
    /// Last `n` entries.
    pub fn tail(n: u32) -> Self {
        Self {
            n: Some(n),
            ..Self::default()
        }
    }
}

impl Default for HistoryRequest {
    fn default() -> Self {
        Self {
            output: false,
            raw: true,
            hist_access_type: "tail".to_owned(),
            session: None,
            start: None,
            stop: None,
            n: None,
            pattern: None,
            unique: false,
        }
    }
}

/// `history_reply` content.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryReply {
    /// Outcome.
    pub status: ReplyStatus,
    /// `(session, line, input[, output])` tuples.
    pub history: Vec<Value>,
}

/// `is_complete_request` content.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IsCompleteRequest {
    /// Source to check.
    pub code: String,
}

/// Verdict in an `is_complete_reply`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletenessStatus {
    /// Ready to execute.
    Complete,
    /// Needs more lines.
    Incomplete,
    /// Will raise a syntax error.
    Invalid,
    /// Kernel cannot tell.
    #[default]
    Unknown,
}

/// `is_complete_reply` content.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IsCompleteReply {
    /// Verdict.
    pub status: CompletenessStatus,
    /// Suggested indent for the next line when incomplete.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub indent: Option<String>,
}

/// `kernel_info_reply` content.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelInfoReply {
    /// Outcome.
    pub status: ReplyStatus,
    /// Protocol version the kernel speaks.
    pub protocol_version: String,
    /// Kernel implementation name.
    pub implementation: String,
    /// Kernel implementation version.
    pub implementation_version: String,
    /// Language details (`name`, `version`, `mimetype`, ...).
    pub language_info: Value,
    /// Startup banner.
    pub banner: String,
    /// Documentation links.
    pub help_links: Vec<Value>,
    /// Whether the kernel supports the debug protocol.
    pub debugger: bool,
}

/// `comm_info_request` content.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommInfoRequest {
    /// Restrict to comms of this target.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_name: Option<String>,
}

/// `comm_info_reply` content.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommInfoReply {
    /// Outcome.
    pub status: ReplyStatus,
    /// comm id → `{target_name}`.
    pub comms: Map<String, Value>,
}

/// Which standard stream a `stream` message belongs to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamName {
    /// Standard output.
    #[default]
    Stdout,
    /// Standard error.
    Stderr,
}

/// `stream` content.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamContent {
    /// Stream name.
    pub name: StreamName,
    /// Text chunk.
    pub text: String,
}

/// `display_data` / `update_display_data` content.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayData {
    /// MIME bundle.
    pub data: MimeBundle,
    /// Per-MIME metadata.
    pub metadata: Map<String, Value>,
    /// Not persisted (carries `display_id`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transient: Option<Map<String, Value>>,
}

/// `execute_input` content.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecuteInput {
    /// Code being run.
    pub code: String,
    /// Counter for this execution.
    pub execution_count: u64,
}

/// `execute_result` content.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecuteResult {
    /// Counter for this execution.
    pub execution_count: u64,
    /// MIME bundle of the value.
    pub data: MimeBundle,
    /// Per-MIME metadata.
    pub metadata: Map<String, Value>,
    /// Not persisted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transient: Option<Map<String, Value>>,
}

/// `error` content.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorContent {
    /// Exception name.
    pub ename: String,
    /// Exception value.
    pub evalue: String,
    /// Formatted traceback lines.
    pub traceback: Vec<String>,
}

/// `status` content.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusContent {
    /// New state.
    pub execution_state: ExecutionState,
}

/// `clear_output` content.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClearOutput {
    /// Defer clearing until new output arrives.
    pub wait: bool,
}

/// `input_request` content.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputRequest {
    /// Prompt text.
    pub prompt: String,
    /// Hide typed characters.
    pub password: bool,
}

/// `input_reply` content.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputReply {
    /// Text the user entered.
    pub value: String,
}

/// `shutdown_request` / `shutdown_reply` content.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownRequest {
    /// Whether a restart follows.
    pub restart: bool,
}

/// `shutdown_reply` content.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownReply {
    /// Outcome.
    pub status: ReplyStatus,
    /// Echo of the request flag.
    pub restart: bool,
}

/// `interrupt_reply` content.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterruptReply {
    /// Outcome.
    pub status: ReplyStatus,
}

/// `comm_open` content.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommOpen {
    /// Id chosen by the opening side.
    pub comm_id: CommId,
    /// Registered target the comm binds to.
    pub target_name: String,
    /// Initial state.
    #[serde(default)]
    pub data: Value,
    /// Module holding the target (kernel side only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_module: Option<String>,
}

/// `comm_msg` content.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommMsg {
    /// Target comm.
    pub comm_id: CommId,
    /// Payload.
    #[serde(default)]
    pub data: Value,
}

/// `comm_close` content.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommClose {
    /// Comm being closed.
    pub comm_id: CommId,
    /// Final payload.
    #[serde(default)]
    pub data: Value,
}

/// Content of a message, tagged by its `msg_type`.
#[derive(Clone, Debug, PartialEq)]
#[allow(missing_docs)]
pub enum Content {
    ExecuteRequest(ExecuteRequest),
    ExecuteReply(ExecuteReply),
    InspectRequest(InspectRequest),
    InspectReply(InspectReply),
    CompleteRequest(CompleteRequest),
    CompleteReply(CompleteReply),
    HistoryRequest(HistoryRequest),
    HistoryReply(HistoryReply),
    IsCompleteRequest(IsCompleteRequest),
    IsCompleteReply(IsCompleteReply),
    KernelInfoRequest,
    KernelInfoReply(KernelInfoReply),
    CommInfoRequest(CommInfoRequest),
    CommInfoReply(CommInfoReply),
    Stream(StreamContent),
    DisplayData(DisplayData),
    UpdateDisplayData(DisplayData),
    ExecuteInput(ExecuteInput),
    ExecuteResult(ExecuteResult),
    Error(ErrorContent),
    Status(StatusContent),
    ClearOutput(ClearOutput),
    DebugEvent(Value),
    InputRequest(InputRequest),
    InputReply(InputReply),
    ShutdownRequest(ShutdownRequest),
    ShutdownReply(ShutdownReply),
    InterruptRequest,
    InterruptReply(InterruptReply),
    DebugRequest(Value),
    DebugReply(Value),
    CommOpen(CommOpen),
    CommMsg(CommMsg),
    CommClose(CommClose),
    /// A `msg_type` this crate does not model; content kept verbatim.
    Unknown {
        msg_type: String,
        content: Value,
    },
}

fn decode<T: DeserializeOwned>(msg_type: MsgType, value: Value) -> Result<T, ProtocolError> {
    // Kernels send `{}` for empty content but some proxies send null.
    let value = if value.is_null() {
        Value::Object(Map::new())
    } else {
        value
    };
    serde_json::from_value(value).map_err(|e| ProtocolError::InvalidContent {
        msg_type: msg_type.as_str().to_owned(),
        reason: e.to_string(),
    })
}

fn encode<T: Serialize>(value: &T) -> Result<Value, ProtocolError> {
    Ok(serde_json::to_value(value)?)
}

impl Content {
    /// Decode `value` as the content of `msg_type`.
    pub fn from_value(msg_type: MsgType, value: Value) -> Result<Self, ProtocolError> {
        use MsgType as T;
        Ok(match msg_type {
            T::ExecuteRequest => Self::ExecuteRequest(decode(msg_type, value)?),
            T::ExecuteReply => Self::ExecuteReply(decode(msg_type, value)?),
            T::InspectRequest => Self::InspectRequest(decode(msg_type, value)?),
            T::InspectReply => Self::InspectReply(decode(msg_type, value)?),
            T::CompleteRequest => Self::CompleteRequest(decode(msg_type, value)?),
            T::CompleteReply => Self::CompleteReply(decode(msg_type, value)?),
            T::HistoryRequest => Self::HistoryRequest(decode(msg_type, value)?),
            T::HistoryReply => Self::HistoryReply(decode(msg_type, value)?),
            T::IsCompleteRequest => Self::IsCompleteRequest(decode(msg_type, value)?),
            T::IsCompleteReply => Self::IsCompleteReply(decode(msg_type, value)?),
            T::KernelInfoRequest => Self::KernelInfoRequest,
            T::KernelInfoReply => Self::KernelInfoReply(decode(msg_type, value)?),
            T::CommInfoRequest => Self::CommInfoRequest(decode(msg_type, value)?),
            T::CommInfoReply => Self::CommInfoReply(decode(msg_type, value)?),
            T::Stream => Self::Stream(decode(msg_type, value)?),
            T::DisplayData => Self::DisplayData(decode(msg_type, value)?),
            T::UpdateDisplayData => Self::UpdateDisplayData(decode(msg_type, value)?),
            T::ExecuteInput => Self::ExecuteInput(decode(msg_type, value)?),
            T::ExecuteResult => Self::ExecuteResult(decode(msg_type, value)?),
            T::Error => Self::Error(decode(msg_type, value)?),
            T::Status => Self::Status(decode(msg_type, value)?),
            T::ClearOutput => Self::ClearOutput(decode(msg_type, value)?),
            T::DebugEvent => Self::DebugEvent(value),
            T::InputRequest => Self::InputRequest(decode(msg_type, value)?),
            T::InputReply => Self::InputReply(decode(msg_type, value)?),
            T::ShutdownRequest => Self::ShutdownRequest(decode(msg_type, value)?),
            T::ShutdownReply => Self::ShutdownReply(decode(msg_type, value)?),
            T::InterruptRequest => Self::InterruptRequest,
            T::InterruptReply => Self::InterruptReply(decode(msg_type, value)?),
            T::DebugRequest => Self::DebugRequest(value),
            T::DebugReply => Self::DebugReply(value),
            T::CommOpen => Self::CommOpen(decode(msg_type, value)?),
            T::CommMsg => Self::CommMsg(decode(msg_type, value)?),
            T::CommClose => Self::CommClose(decode(msg_type, value)?),
        })
    }

    /// Encode back to the JSON object that goes on the wire.
    pub fn to_value(&self) -> Result<Value, ProtocolError> {
        match self {
            Self::ExecuteRequest(c) => encode(c),
            Self::ExecuteReply(c) => encode(c),
            Self::InspectRequest(c) => encode(c),
            Self::InspectReply(c) => encode(c),
            Self::CompleteRequest(c) => encode(c),
            Self::CompleteReply(c) => encode(c),
            Self::HistoryRequest(c) => encode(c),
            Self::HistoryReply(c) => encode(c),
            Self::IsCompleteRequest(c) => encode(c),
            Self::IsCompleteReply(c) => encode(c),
            Self::KernelInfoRequest | Self::InterruptRequest => Ok(Value::Object(Map::new())),
            Self::KernelInfoReply(c) => encode(c),
            Self::CommInfoRequest(c) => encode(c),
            Self::CommInfoReply(c) => encode(c),
            Self::Stream(c) => encode(c),
            Self::DisplayData(c) | Self::UpdateDisplayData(c) => encode(c),
            Self::ExecuteInput(c) => encode(c),
            Self::ExecuteResult(c) => encode(c),
            Self::Error(c) => encode(c),
            Self::Status(c) => encode(c),
            Self::ClearOutput(c) => encode(c),
            Self::InputRequest(c) => encode(c),
            Self::InputReply(c) => encode(c),
            Self::ShutdownRequest(c) => encode(c),
            Self::ShutdownReply(c) => encode(c),
            Self::InterruptReply(c) => encode(c),
            Self::CommOpen(c) => encode(c),
            Self::CommMsg(c) => encode(c),
            Self::CommClose(c) => encode(c),
            Self::DebugEvent(v) | Self::DebugRequest(v) | Self::DebugReply(v) => Ok(v.clone()),
            Self::Unknown { content, .. } => Ok(content.clone()),
        }
    }

    /// Message type this content belongs to, `None` for [`Content::Unknown`].
    pub fn msg_type(&self) -> Option<MsgType> {
        use MsgType as T;
        Some(match self {
            Self::ExecuteRequest(_) => T::ExecuteRequest,
            Self::ExecuteReply(_) => T::ExecuteReply,
            Self::InspectRequest(_) => T::InspectRequest,
            Self::InspectReply(_) => T::InspectReply,
            Self::CompleteRequest(_) => T::CompleteRequest,
            Self::CompleteReply(_) => T::CompleteReply,
            Self::HistoryRequest(_) => T::HistoryRequest,
            Self::HistoryReply(_) => T::HistoryReply,
            Self::IsCompleteRequest(_) => T::IsCompleteRequest,
            Self::IsCompleteReply(_) => T::IsCompleteReply,
            Self::KernelInfoRequest => T::KernelInfoRequest,
            Self::KernelInfoReply(_) => T::KernelInfoReply,
            Self::CommInfoRequest(_) => T::CommInfoRequest,
            Self::CommInfoReply(_) => T::CommInfoReply,
            Self::Stream(_) => T::Stream,
            Self::DisplayData(_) => T::DisplayData,
            Self::UpdateDisplayData(_) => T::UpdateDisplayData,
            Self::ExecuteInput(_) => T::ExecuteInput,
            Self::ExecuteResult(_) => T::ExecuteResult,
            Self::Error(_) => T::Error,
            Self::Status(_) => T::Status,
            Self::ClearOutput(_) => T::ClearOutput,
            Self::DebugEvent(_) => T::DebugEvent,
            Self::InputRequest(_) => T::InputRequest,
            Self::InputReply(_) => T::InputReply,
            Self::ShutdownRequest(_) => T::ShutdownRequest,
            Self::ShutdownReply(_) => T::ShutdownReply,
            Self::InterruptRequest => T::InterruptRequest,
            Self::InterruptReply(_) => T::InterruptReply,
            Self::DebugRequest(_) => T::DebugRequest,
            Self::DebugReply(_) => T::DebugReply,
            Self::CommOpen(_) => T::CommOpen,
            Self::CommMsg(_) => T::CommMsg,
            Self::CommClose(_) => T::CommClose,
            Self::Unknown { .. } => return None,
        })
    }

    /// Wire name of the message type, including unknown ones.
    pub fn msg_type_str(&self) -> &str {
        match self {
            Self::Unknown { msg_type, .. } => msg_type,
            known => known.msg_type().map_or("", MsgType::as_str),
        }
    }
}

macro_rules! content_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Content {
                fn from(c: $ty) -> Self {
                    Self::$variant(c)
                }
            }
        )*
    };
}

content_from! {
    ExecuteRequest => ExecuteRequest,
    ExecuteReply => ExecuteReply,
    InspectRequest => InspectRequest,
    InspectReply => InspectReply,
    CompleteRequest => CompleteRequest,
    CompleteReply => CompleteReply,
    HistoryRequest => HistoryRequest,
    HistoryReply => HistoryReply,
    IsCompleteRequest => IsCompleteRequest,
    IsCompleteReply => IsCompleteReply,
    KernelInfoReply => KernelInfoReply,
    CommInfoRequest => CommInfoRequest,
    CommInfoReply => CommInfoReply,
    StreamContent => Stream,
    ExecuteInput => ExecuteInput,
    ExecuteResult => ExecuteResult,
    ErrorContent => Error,
    StatusContent => Status,
    ClearOutput => ClearOutput,
    InputRequest => InputRequest,
    InputReply => InputReply,
    ShutdownRequest => ShutdownRequest,
    ShutdownReply => ShutdownReply,
    InterruptReply => InterruptReply,
    CommOpen => CommOpen,
    CommMsg => CommMsg,
    CommClose => CommClose,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn execute_request_defaults() {
        let req = ExecuteRequest::new("1+1");
        assert!(req.store_history);
        assert!(req.allow_stdin);
        assert!(req.stop_on_error);
        assert!(!req.silent);
    }

    #[test]
    fn execute_request_partial_json_gets_defaults() {
        let c = Content::from_value(MsgType::ExecuteRequest, json!({"code": "x"})).unwrap();
        assert_matches!(c, Content::ExecuteRequest(r) if r.code == "x" && r.store_history);
    }

    #[test]
    fn execute_reply_error_fields() {
        let c = Content::from_value(
            MsgType::ExecuteReply,
            json!({
                "status": "error",
                "execution_count": 3,
                "ename": "NameError",
                "evalue": "name 'x' is not defined",
                "traceback": ["line 1"]
            }),
        )
        .unwrap();
        let Content::ExecuteReply(reply) = c else {
            panic!("expected execute_reply");
        };
        assert_eq!(reply.status, ReplyStatus::Error);
        assert_eq!(reply.execution_count, Some(3));
        assert_eq!(reply.ename.as_deref(), Some("NameError"));
    }

    #[test]
    fn aborted_status_is_kept_as_sent() {
        let c = Content::from_value(MsgType::ExecuteReply, json!({"status": "aborted"})).unwrap();
        assert_matches!(&c, Content::ExecuteReply(r) if r.status == ReplyStatus::Abort);
        assert_eq!(c.to_value().unwrap()["status"], "aborted");

        let legacy = Content::from_value(MsgType::ExecuteReply, json!({"status": "abort"})).unwrap();
        assert_matches!(legacy, Content::ExecuteReply(r) if r.status == ReplyStatus::Abort);
    }

    #[test]
    fn stream_content_decodes() {
        let c = Content::from_value(MsgType::Stream, json!({"name": "stderr", "text": "oops"}))
            .unwrap();
        assert_matches!(c, Content::Stream(s) if s.name == StreamName::Stderr && s.text == "oops");
    }

    #[test]
    fn empty_requests_encode_as_empty_object() {
        assert_eq!(Content::KernelInfoRequest.to_value().unwrap(), json!({}));
        assert_eq!(Content::InterruptRequest.to_value().unwrap(), json!({}));
    }

    #[test]
    fn null_content_is_treated_as_empty() {
        let c = Content::from_value(MsgType::Status, Value::Null).unwrap();
        assert_matches!(c, Content::Status(s) if s.execution_state == ExecutionState::Starting);
    }

    #[test]
    fn comm_open_requires_comm_id() {
        let err = Content::from_value(MsgType::CommOpen, json!({"target_name": "t"})).unwrap_err();
        assert_matches!(err, ProtocolError::InvalidContent { msg_type, .. } if msg_type == "comm_open");
    }

    #[test]
    fn wrong_field_type_is_invalid_content() {
        let err = Content::from_value(MsgType::Stream, json!({"text": 42})).unwrap_err();
        assert_matches!(err, ProtocolError::InvalidContent { .. });
    }

    #[test]
    fn display_data_preserves_mime_bundle() {
        let value = json!({
            "data": {"text/html": "<b>x</b>", "image/png": "iVBORw0KGgo="},
            "metadata": {"image/png": {"width": 10}},
            "transient": {"display_id": "d1"}
        });
        let c = Content::from_value(MsgType::DisplayData, value.clone()).unwrap();
        assert_eq!(c.to_value().unwrap(), value);
    }

    #[test]
    fn debug_content_is_opaque() {
        let value = json!({"seq": 1, "type": "request", "command": "initialize"});
        let c = Content::from_value(MsgType::DebugRequest, value.clone()).unwrap();
        assert_eq!(c.to_value().unwrap(), value);
    }

    #[test]
    fn msg_type_matches_variant() {
        for t in MsgType::ALL {
            let c = Content::from_value(
                *t,
                json!({"comm_id": "c", "target_name": "t"}),
            )
            .unwrap();
            assert_eq!(c.msg_type(), Some(*t));
            assert_eq!(c.msg_type_str(), t.as_str());
        }
    }

    #[test]
    fn unknown_content_keeps_its_type_name() {
        let c = Content::Unknown {
            msg_type: "x_custom".into(),
            content: json!({"a": 1}),
        };
        assert_eq!(c.msg_type(), None);
        assert_eq!(c.msg_type_str(), "x_custom");
        assert_eq!(c.to_value().unwrap(), json!({"a": 1}));
    }
}
