//! Lifecycle and REST errors.

use kgate_core::KernelId;
use kgate_protocol::{EngineError, TransportError};
use thiserror::Error;

/// Errors surfaced by the kernel manager and the gateway client.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No kernel with this id is registered.
    #[error("kernel {kernel_id} not found")]
    KernelNotFound {
        /// Requested kernel.
        kernel_id: KernelId,
    },

    /// The kernel exists but its protocol connection is not up.
    #[error("kernel {kernel_id} has no active connection")]
    EngineNotInitialized {
        /// Affected kernel.
        kernel_id: KernelId,
    },

    /// The kernel's connection died; it accepts no more work.
    #[error("kernel {kernel_id} is dead")]
    KernelDead {
        /// Affected kernel.
        kernel_id: KernelId,
    },

    /// The gateway answered with a non-2xx status.
    #[error("{method} {url} returned {status}: {body}")]
    Http {
        /// HTTP method.
        method: &'static str,
        /// Request URL.
        url: String,
        /// Response status code.
        status: u16,
        /// Response body, verbatim.
        body: String,
    },

    /// The request never got a response.
    #[error("request to gateway failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The response body was not what the gateway API promises.
    #[error("unexpected response from {url}: {reason}")]
    Decode {
        /// Request URL.
        url: String,
        /// Parse error.
        reason: String,
    },

    /// Client setup failed (bad certificate, invalid header, ...).
    #[error("invalid gateway configuration: {reason}")]
    Config {
        /// What was wrong.
        reason: String,
    },

    /// The kernel WebSocket failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The protocol engine rejected or gave up on a request.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Result alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    /// HTTP status an adapter should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::KernelNotFound { .. } => 404,
            Self::KernelDead { .. } => 410,
            Self::EngineNotInitialized { .. } | Self::Engine(EngineError::Stopped) => 503,
            Self::Config { .. } => 500,
            _ if self.is_timeout() => 408,
            Self::Http { .. }
            | Self::Request(_)
            | Self::Decode { .. }
            | Self::Transport(_)
            | Self::Engine(_) => 502,
        }
    }

    /// Whether a caller deadline or connect timeout expired.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Engine(e) => e.is_timeout(),
            Self::Request(e) => e.is_timeout(),
            Self::Transport(TransportError::ConnectTimeout { .. }) => true,
            _ => false,
        }
    }

    /// Whether the gateway answered 404.
    pub fn is_remote_not_found(&self) -> bool {
        matches!(self, Self::Http { status: 404, .. })
    }
}
