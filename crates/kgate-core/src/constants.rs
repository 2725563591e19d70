//! Protocol-wide constants.

/// Jupyter messaging protocol version stamped on every outbound header.
pub const PROTOCOL_VERSION: &str = "5.3";

/// Username used when the caller does not supply one.
pub const DEFAULT_USERNAME: &str = "kgate";

/// Environment variable the gateway forwards to the kernel process to
/// identify the owning user.
pub const KERNEL_USERNAME_ENV: &str = "KERNEL_USERNAME";
