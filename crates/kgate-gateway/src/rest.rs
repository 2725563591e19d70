//! REST client for the gateway's kernel API.

use std::collections::BTreeMap;
use std::time::Instant;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use kgate_core::{KernelId, SessionId};
use kgate_settings::GatewaySettings;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Certificate, Identity, Method, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::errors::{GatewayError, Result};
use crate::models::{CreateKernelRequest, KernelModel, KernelSpecs};

/// HTTP client bound to one gateway.
#[derive(Clone, Debug)]
pub struct GatewayClient {
    http: reqwest::Client,
    rest_base: String,
    ws_base: String,
    ws_headers: Vec<(String, String)>,
}

impl GatewayClient {
    /// Build a client from settings: auth, custom headers, TLS material and
    /// request timeout.
    pub fn new(settings: &GatewaySettings) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let mut ws_headers = Vec::new();

        for (name, value) in &settings.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| config(format!("header {name:?}: {e}")))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|e| config(format!("header {name:?}: {e}")))?;
            let _ = headers.insert(header_name, header_value);
            ws_headers.push((name.clone(), value.clone()));
        }

        if let Some(auth) = authorization(settings) {
            let mut value =
                HeaderValue::from_str(&auth).map_err(|e| config(format!("authorization: {e}")))?;
            value.set_sensitive(true);
            let _ = headers.insert(AUTHORIZATION, value);
            ws_headers.push((AUTHORIZATION.as_str().to_owned(), auth));
        }

        let mut builder = reqwest::Client::builder()
            .timeout(settings.request_timeout())
            .user_agent(concat!("kgate/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers);

        match (&settings.client_cert_path, &settings.client_key_path) {
            (Some(cert), Some(key)) => {
                let mut pem = read_pem(cert)?;
                pem.extend(read_pem(key)?);
                let identity = Identity::from_pem(&pem)
                    .map_err(|e| config(format!("client certificate: {e}")))?;
                builder = builder.identity(identity);
            }
            (None, None) => {}
            _ => return Err(config("client certificate and key must be set together")),
        }
        if let Some(ca) = &settings.ca_cert_path {
            let cert = Certificate::from_pem(&read_pem(ca)?)
                .map_err(|e| config(format!("CA certificate {ca}: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        if !settings.validate_cert {
            warn!("gateway TLS certificate validation disabled");
            builder = builder.danger_accept_invalid_certs(true);
        }

        let http = builder
            .build()
            .map_err(|e| config(format!("http client: {e}")))?;

        Ok(Self {
            http,
            rest_base: settings.rest_base_url().to_owned(),
            ws_base: settings.ws_base_url(),
            ws_headers,
        })
    }

    /// REST base URL without trailing slash.
    pub fn base_url(&self) -> &str {
        &self.rest_base
    }

    /// Headers to send on the WebSocket handshake.
    pub fn ws_headers(&self) -> &[(String, String)] {
        &self.ws_headers
    }

    /// WebSocket URL of a kernel's channels endpoint.
    pub fn channels_url(&self, kernel_id: &KernelId, session_id: &SessionId) -> String {
        format!(
            "{}/api/kernels/{kernel_id}/channels?session_id={session_id}",
            self.ws_base
        )
    }

    /// `GET /api/kernelspecs`
    pub async fn list_kernel_specs(&self) -> Result<KernelSpecs> {
        self.call(Method::GET, "api/kernelspecs", None::<&()>).await
    }

    /// `GET /api/kernels`
    pub async fn list_kernels(&self) -> Result<Vec<KernelModel>> {
        self.call(Method::GET, "api/kernels", None::<&()>).await
    }

    /// `POST /api/kernels`
    pub async fn create_kernel(
        &self,
        spec_name: &str,
        env: BTreeMap<String, String>,
    ) -> Result<KernelModel> {
        let body = CreateKernelRequest {
            name: spec_name.to_owned(),
            env,
        };
        self.call(Method::POST, "api/kernels", Some(&body)).await
    }

    /// `GET /api/kernels/:id`
    pub async fn get_kernel(&self, kernel_id: &KernelId) -> Result<KernelModel> {
        self.call(Method::GET, &format!("api/kernels/{kernel_id}"), None::<&()>)
            .await
    }

    /// `DELETE /api/kernels/:id`
    pub async fn delete_kernel(&self, kernel_id: &KernelId) -> Result<()> {
        let _ = self
            .send(Method::DELETE, &format!("api/kernels/{kernel_id}"), None::<&()>)
            .await?;
        Ok(())
    }

    /// `POST /api/kernels/:id/interrupt`
    pub async fn interrupt_kernel(&self, kernel_id: &KernelId) -> Result<()> {
        let _ = self
            .send(
                Method::POST,
                &format!("api/kernels/{kernel_id}/interrupt"),
                None::<&()>,
            )
            .await?;
        Ok(())
    }

    /// `POST /api/kernels/:id/restart`
    pub async fn restart_kernel(&self, kernel_id: &KernelId) -> Result<KernelModel> {
        self.call(
            Method::POST,
            &format!("api/kernels/{kernel_id}/restart"),
            None::<&()>,
        )
        .await
    }

    async fn call<T, B>(&self, method: Method, path: &str, body: Option<&B>) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let (url, response) = self.send(method, path, body).await?;
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| GatewayError::Decode {
            url,
            reason: e.to_string(),
        })
    }

    async fn send<B>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<(String, Response)>
    where
        B: Serialize + ?Sized,
    {
        let url = format!("{}/{path}", self.rest_base);
        let method_name = method_name(&method);
        let mut request = self.http.request(method, &url);
        if let Some(body) = body {
            request = request.json(body);
        }

        let started = Instant::now();
        let response = request.send().await?;
        let status = response.status();
        debug!(
            method = method_name,
            url = %url,
            status = status.as_u16(),
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "gateway request"
        );

        if status.is_success() {
            return Ok((url, response));
        }
        let body = response.text().await.unwrap_or_default();
        Err(GatewayError::Http {
            method: method_name,
            url,
            status: status.as_u16(),
            body,
        })
    }
}

fn authorization(settings: &GatewaySettings) -> Option<String> {
    if let Some(token) = settings.auth_token.as_deref().filter(|t| !t.is_empty()) {
        return Some(format!("token {token}"));
    }
    settings.basic_auth.as_ref().map(|basic| {
        let encoded = STANDARD.encode(format!("{}:{}", basic.username, basic.password));
        format!("Basic {encoded}")
    })
}

fn method_name(method: &Method) -> &'static str {
    match *method {
        Method::GET => "GET",
        Method::POST => "POST",
        Method::DELETE => "DELETE",
        Method::PUT => "PUT",
        Method::PATCH => "PATCH",
        _ => "OTHER",
    }
}

fn read_pem(path: &str) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| config(format!("reading {path}: {e}")))
}

fn config(reason: impl Into<String>) -> GatewayError {
    GatewayError::Config {
        reason: reason.into(),
    }
}
