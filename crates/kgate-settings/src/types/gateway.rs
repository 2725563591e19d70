//! Remote gateway connection settings.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// HTTP basic credentials.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BasicAuth {
    /// User name.
    pub username: String,
    /// Password.
    pub password: String,
}

/// How to reach the Jupyter gateway.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewaySettings {
    /// Base URL for REST calls.
    pub base_url: String,
    /// WebSocket base URL; derived from `base_url` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_url: Option<String>,
    /// Bearer token, sent as `Authorization: token <..>`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    /// Basic credentials, used when no token is set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub basic_auth: Option<BasicAuth>,
    /// Extra headers on every REST call and WebSocket handshake.
    pub headers: BTreeMap<String, String>,
    /// PEM client certificate for mutual TLS.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_cert_path: Option<String>,
    /// PEM private key for `client_cert_path`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_key_path: Option<String>,
    /// Extra PEM root certificate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_cert_path: Option<String>,
    /// Verify the gateway's TLS certificate.
    pub validate_cert: bool,
    /// Per-request REST timeout in milliseconds.
    pub request_timeout_ms: u64,
}

impl GatewaySettings {
    /// WebSocket base URL, trailing slash removed.
    ///
    /// `http` becomes `ws` and `https` becomes `wss` when no explicit
    /// `wsUrl` is configured.
    pub fn ws_base_url(&self) -> String {
        let url = match &self.ws_url {
            Some(ws) => ws.clone(),
            None => {
                if let Some(rest) = self.base_url.strip_prefix("https://") {
                    format!("wss://{rest}")
                } else if let Some(rest) = self.base_url.strip_prefix("http://") {
                    format!("ws://{rest}")
                } else {
                    self.base_url.clone()
                }
            }
        };
        url.trim_end_matches('/').to_owned()
    }

    /// REST base URL, trailing slash removed.
    pub fn rest_base_url(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    /// REST timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8888".to_string(),
            ws_url: None,
            auth_token: None,
            basic_auth: None,
            headers: BTreeMap::new(),
            client_cert_path: None,
            client_key_path: None,
            ca_cert_path: None,
            validate_cert: true,
            request_timeout_ms: 30_000,
        }
    }
}
