//! Message types, protocol channels and the routing table that binds them.
//!
//! Every inbound frame is classified exactly once through [`MsgType::route`].
//! Adding a message type means adding a variant and one row to that table.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One of the four logical streams multiplexed over a kernel connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Request/reply traffic (execute, inspect, complete, ...).
    Shell,
    /// Broadcast side effects (streams, results, status, comms).
    #[serde(rename = "iopub")]
    IoPub,
    /// Kernel-initiated input prompts and their answers.
    Stdin,
    /// Out-of-band requests (interrupt, shutdown, debug).
    Control,
}

impl Channel {
    /// All channels, in fan-out worker order.
    pub const ALL: [Channel; 4] = [Channel::Shell, Channel::IoPub, Channel::Stdin, Channel::Control];

    /// Wire name of the channel.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Shell => "shell",
            Self::IoPub => "iopub",
            Self::Stdin => "stdin",
            Self::Control => "control",
        }
    }

    /// Stable index in `0..4`, used to address per-channel queues.
    pub fn index(self) -> usize {
        match self {
            Self::Shell => 0,
            Self::IoPub => 1,
            Self::Stdin => 2,
            Self::Control => 3,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kernel execution state as reported by `status` messages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    /// Kernel process is booting.
    #[default]
    Starting,
    /// Waiting for work.
    Idle,
    /// Processing a request.
    Busy,
    /// Anything a kernel reports outside the three states above.
    #[serde(other)]
    Unknown,
}

impl ExecutionState {
    /// Wire name of the state.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the engine does with a message beyond forwarding it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteKind {
    /// Correlate with a pending request through `parent_header.msg_id`.
    Reply,
    /// Update the engine's execution state.
    Status,
    /// Hand to the comm manager.
    Comm,
    /// Remember the header so `input_reply` can be parented.
    InputRequest,
    /// Forward only.
    Forward,
}

/// Classification result for a message type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Route {
    /// Channel the message is delivered on.
    pub channel: Channel,
    /// Side effect applied before delivery.
    pub kind: RouteKind,
}

impl Route {
    const fn new(channel: Channel, kind: RouteKind) -> Self {
        Self { channel, kind }
    }
}

/// Route applied to message types this crate does not recognise.
pub const UNKNOWN_ROUTE: Route = Route::new(Channel::IoPub, RouteKind::Forward);

macro_rules! msg_types {
    ($( $(#[$meta:meta])* $variant:ident => $wire:literal, $channel:ident, $kind:ident; )*) => {
        /// Every message type of the Jupyter messaging protocol kgate understands.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum MsgType {
            $( $(#[$meta])* $variant, )*
        }

        impl MsgType {
            /// All known message types.
            pub const ALL: &'static [MsgType] = &[ $( MsgType::$variant, )* ];

            /// Wire name (`header.msg_type`).
            pub fn as_str(self) -> &'static str {
                match self {
                    $( Self::$variant => $wire, )*
                }
            }

            /// Look up a wire name. Returns `None` for unrecognised types.
            pub fn parse(value: &str) -> Option<Self> {
                match value {
                    $( $wire => Some(Self::$variant), )*
                    _ => None,
                }
            }

            /// Fixed classification table.
            pub fn route(self) -> Route {
                match self {
                    $( Self::$variant => Route::new(Channel::$channel, RouteKind::$kind), )*
                }
            }
        }
    };
}

msg_types! {
    /// Run code.
    ExecuteRequest => "execute_request", Shell, Forward;
    /// Result of `execute_request`.
    ExecuteReply => "execute_reply", Shell, Reply;
    /// Introspect an object at a cursor position.
    InspectRequest => "inspect_request", Shell, Forward;
    /// Result of `inspect_request`.
    InspectReply => "inspect_reply", Shell, Reply;
    /// Ask for completions.
    CompleteRequest => "complete_request", Shell, Forward;
    /// Result of `complete_request`.
    CompleteReply => "complete_reply", Shell, Reply;
    /// Fetch execution history.
    HistoryRequest => "history_request", Shell, Forward;
    /// Result of `history_request`.
    HistoryReply => "history_reply", Shell, Reply;
    /// Ask whether code is a complete statement.
    IsCompleteRequest => "is_complete_request", Shell, Forward;
    /// Result of `is_complete_request`.
    IsCompleteReply => "is_complete_reply", Shell, Reply;
    /// Ask for kernel metadata.
    KernelInfoRequest => "kernel_info_request", Shell, Forward;
    /// Result of `kernel_info_request`.
    KernelInfoReply => "kernel_info_reply", Shell, Reply;
    /// List open comms.
    CommInfoRequest => "comm_info_request", Shell, Forward;
    /// Result of `comm_info_request`.
    CommInfoReply => "comm_info_reply", Shell, Reply;
    /// stdout/stderr text.
    Stream => "stream", IoPub, Forward;
    /// Rich display output.
    DisplayData => "display_data", IoPub, Forward;
    /// Replace a previously displayed output.
    UpdateDisplayData => "update_display_data", IoPub, Forward;
    /// Echo of the code being executed.
    ExecuteInput => "execute_input", IoPub, Forward;
    /// Value of the last expression.
    ExecuteResult => "execute_result", IoPub, Forward;
    /// Exception raised during execution.
    Error => "error", IoPub, Forward;
    /// Execution state change.
    Status => "status", IoPub, Status;
    /// Clear the output area.
    ClearOutput => "clear_output", IoPub, Forward;
    /// Debugger event.
    DebugEvent => "debug_event", IoPub, Forward;
    /// Kernel asks the frontend for input.
    InputRequest => "input_request", Stdin, InputRequest;
    /// Frontend answers an input prompt.
    InputReply => "input_reply", Stdin, Forward;
    /// Stop (or restart) the kernel.
    ShutdownRequest => "shutdown_request", Control, Forward;
    /// Result of `shutdown_request`.
    ShutdownReply => "shutdown_reply", Control, Reply;
    /// Interrupt the running execution.
    InterruptRequest => "interrupt_request", Control, Forward;
    /// Result of `interrupt_request`.
    InterruptReply => "interrupt_reply", Control, Reply;
    /// Debug adapter request.
    DebugRequest => "debug_request", Control, Forward;
    /// Debug adapter reply.
    DebugReply => "debug_reply", Control, Reply;
    /// Open a comm.
    CommOpen => "comm_open", IoPub, Comm;
    /// Message on an open comm.
    CommMsg => "comm_msg", IoPub, Comm;
    /// Close a comm.
    CommClose => "comm_close", IoPub, Comm;
}

impl MsgType {
    /// Whether this type answers a request and carries a correlation id.
    pub fn is_reply(self) -> bool {
        self.route().kind == RouteKind::Reply
    }

    /// Whether this type belongs to the comm sub-protocol.
    pub fn is_comm(self) -> bool {
        self.route().kind == RouteKind::Comm
    }

    /// Reply type that answers this request, if it has one.
    pub fn reply_type(self) -> Option<MsgType> {
        Some(match self {
            Self::ExecuteRequest => Self::ExecuteReply,
            Self::InspectRequest => Self::InspectReply,
            Self::CompleteRequest => Self::CompleteReply,
            Self::HistoryRequest => Self::HistoryReply,
            Self::IsCompleteRequest => Self::IsCompleteReply,
            Self::KernelInfoRequest => Self::KernelInfoReply,
            Self::CommInfoRequest => Self::CommInfoReply,
            Self::ShutdownRequest => Self::ShutdownReply,
            Self::InterruptRequest => Self::InterruptReply,
            Self::DebugRequest => Self::DebugReply,
            _ => return None,
        })
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a raw `msg_type` string, falling back to [`UNKNOWN_ROUTE`].
pub fn classify(msg_type: &str) -> Route {
    MsgType::parse(msg_type).map_or(UNKNOWN_ROUTE, MsgType::route)
}
