//! Settings types.
//!
//! Every struct uses `#[serde(rename_all = "camelCase", default)]` so a
//! partial settings file only has to name what it changes.

mod gateway;
mod kernel;

pub use gateway::{BasicAuth, GatewaySettings};
pub use kernel::{KernelSettings, LoggingSettings};

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KgateSettings {
    /// Gateway connection.
    pub gateway: GatewaySettings,
    /// Kernel lifecycle and channel tuning.
    pub kernel: KernelSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl KgateSettings {
    /// Reject settings the runtime cannot work with.
    pub fn validate(&self) -> Result<()> {
        check_url("gateway.baseUrl", &self.gateway.base_url, &["http", "https"])?;
        if let Some(ws) = &self.gateway.ws_url {
            check_url("gateway.wsUrl", ws, &["ws", "wss"])?;
        }
        if self.gateway.client_cert_path.is_some() != self.gateway.client_key_path.is_some() {
            return Err(SettingsError::InvalidValue {
                key: "gateway.clientCertPath",
                reason: "client certificate and key must be set together".into(),
            });
        }

        let k = &self.kernel;
        non_zero("gateway.requestTimeoutMs", self.gateway.request_timeout_ms)?;
        non_zero("kernel.launchTimeoutMs", k.launch_timeout_ms)?;
        non_zero("kernel.readyPollIntervalMs", k.ready_poll_interval_ms)?;
        non_zero("kernel.connectTimeoutMs", k.connect_timeout_ms)?;
        non_zero("kernel.keepaliveIntervalMs", k.keepalive_interval_ms)?;
        non_zero("kernel.executeTimeoutMs", k.execute_timeout_ms)?;
        non_zero("kernel.channelCapacity", k.channel_capacity as u64)?;
        non_zero("kernel.subscriberCapacity", k.subscriber_capacity as u64)?;
        non_zero("kernel.listenerCapacity", k.listener_capacity as u64)?;
        if k.default_spec.is_empty() {
            return Err(SettingsError::InvalidValue {
                key: "kernel.defaultSpec",
                reason: "must not be empty".into(),
            });
        }
        Ok(())
    }
}

fn non_zero(key: &'static str, value: u64) -> Result<()> {
    if value == 0 {
        return Err(SettingsError::InvalidValue {
            key,
            reason: "must be greater than zero".into(),
        });
    }
    Ok(())
}

fn check_url(key: &'static str, value: &str, schemes: &[&str]) -> Result<()> {
    let parsed = url::Url::parse(value).map_err(|e| SettingsError::InvalidValue {
        key,
        reason: format!("{value:?}: {e}"),
    })?;
    if !schemes.contains(&parsed.scheme()) {
        return Err(SettingsError::InvalidValue {
            key,
            reason: format!("scheme must be one of {}", schemes.join(", ")),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn defaults_are_valid() {
        KgateSettings::default().validate().unwrap();
    }

    #[test]
    fn zero_capacity_rejected() {
        let mut s = KgateSettings::default();
        s.kernel.subscriber_capacity = 0;
        assert_matches!(
            s.validate(),
            Err(SettingsError::InvalidValue { key: "kernel.subscriberCapacity", .. })
        );
    }

    #[test]
    fn zero_interval_rejected() {
        let mut s = KgateSettings::default();
        s.kernel.keepalive_interval_ms = 0;
        assert_matches!(
            s.validate(),
            Err(SettingsError::InvalidValue { key: "kernel.keepaliveIntervalMs", .. })
        );
    }

    #[test]
    fn bad_base_url_rejected() {
        let mut s = KgateSettings::default();
        s.gateway.base_url = "not a url".into();
        assert_matches!(
            s.validate(),
            Err(SettingsError::InvalidValue { key: "gateway.baseUrl", .. })
        );

        s.gateway.base_url = "ftp://gw".into();
        assert!(s.validate().is_err());
    }

    #[test]
    fn ws_url_must_be_websocket() {
        let mut s = KgateSettings::default();
        s.gateway.ws_url = Some("http://gw:8888".into());
        assert_matches!(
            s.validate(),
            Err(SettingsError::InvalidValue { key: "gateway.wsUrl", .. })
        );
    }

    #[test]
    fn client_cert_needs_key() {
        let mut s = KgateSettings::default();
        s.gateway.client_cert_path = Some("/etc/kgate/client.pem".into());
        assert!(s.validate().is_err());
        s.gateway.client_key_path = Some("/etc/kgate/client.key".into());
        s.validate().unwrap();
    }
}
