//! Kernel lifecycle, channel and logging settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Kernel lifecycle and channel engine tuning.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KernelSettings {
    /// Kernel spec used when none is given.
    pub default_spec: String,
    /// Username stamped into message headers.
    pub username: String,
    /// How long to wait for a new kernel to report ready.
    pub launch_timeout_ms: u64,
    /// Poll interval while waiting for readiness.
    pub ready_poll_interval_ms: u64,
    /// WebSocket handshake timeout.
    pub connect_timeout_ms: u64,
    /// Keep-alive ping interval.
    pub keepalive_interval_ms: u64,
    /// Default timeout for synchronous requests.
    pub execute_timeout_ms: u64,
    /// Capacity of each per-channel internal queue.
    pub channel_capacity: usize,
    /// Capacity of each subscriber's per-channel queue.
    pub subscriber_capacity: usize,
    /// Capacity of each output listener queue.
    pub listener_capacity: usize,
}

impl KernelSettings {
    /// Launch timeout.
    pub fn launch_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_timeout_ms)
    }

    /// Readiness poll interval.
    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms)
    }

    /// Handshake timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Keep-alive interval.
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    /// Default sync request timeout.
    pub fn execute_timeout(&self) -> Duration {
        Duration::from_millis(self.execute_timeout_ms)
    }
}

impl Default for KernelSettings {
    fn default() -> Self {
        Self {
            default_spec: "python3".to_string(),
            username: "kgate".to_string(),
            launch_timeout_ms: 60_000,
            ready_poll_interval_ms: 500,
            connect_timeout_ms: 10_000,
            keepalive_interval_ms: 30_000,
            execute_timeout_ms: 60_000,
            channel_capacity: 1024,
            subscriber_capacity: 256,
            listener_capacity: 256,
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
