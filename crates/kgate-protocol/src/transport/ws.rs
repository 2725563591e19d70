//! WebSocket transport over `tokio-tungstenite`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use kgate_core::Message;
use parking_lot::Mutex as SyncMutex;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, trace};

use super::Transport;
use crate::errors::TransportError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;

/// Dial options for [`WsTransport::connect`].
#[derive(Clone, Debug)]
pub struct WsConfig {
    /// Handshake deadline.
    pub connect_timeout: Duration,
    /// Interval between keep-alive pings.
    pub keepalive_interval: Duration,
    /// Extra handshake headers (auth, routing).
    pub headers: Vec<(String, String)>,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(30),
            headers: Vec::new(),
        }
    }
}

/// A kernel connection over one WebSocket.
pub struct WsTransport {
    url: String,
    sink: Arc<Mutex<WsSink>>,
    stream: Mutex<SplitStream<WsStream>>,
    closed: AtomicBool,
    cancel: CancellationToken,
    keepalive: SyncMutex<Option<JoinHandle<()>>>,
}

impl WsTransport {
    /// Dial `url` and start the keep-alive task.
    ///
    /// The keep-alive task runs inside `span`.
    pub async fn connect(url: &str, config: &WsConfig, span: Span) -> Result<Self, TransportError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::Connect {
                url: url.to_owned(),
                reason: e.to_string(),
            })?;
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                TransportError::Connect {
                    url: url.to_owned(),
                    reason: format!("invalid header name {name:?}: {e}"),
                }
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| TransportError::Connect {
                url: url.to_owned(),
                reason: format!("invalid value for header {name}: {e}"),
            })?;
            let _ = request.headers_mut().insert(name, value);
        }

        let (ws, _response) = tokio::time::timeout(config.connect_timeout, connect_async(request))
            .await
            .map_err(|_| TransportError::ConnectTimeout {
                url: url.to_owned(),
                timeout_ms: duration_ms(config.connect_timeout),
            })?
            .map_err(|e| TransportError::Connect {
                url: url.to_owned(),
                reason: e.to_string(),
            })?;

        span.in_scope(|| info!(url, "websocket connected"));

        let (sink, stream) = ws.split();
        let transport = Self {
            url: url.to_owned(),
            sink: Arc::new(Mutex::new(sink)),
            stream: Mutex::new(stream),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            keepalive: SyncMutex::new(None),
        };

        let handle = tokio::spawn(
            keepalive_loop(
                Arc::clone(&transport.sink),
                config.keepalive_interval,
                transport.cancel.clone(),
            )
            .instrument(span),
        );
        *transport.keepalive.lock() = Some(handle);

        Ok(transport)
    }

    /// Endpoint this transport is connected to.
    pub fn url(&self) -> &str {
        &self.url
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
        self.cancel.cancel();
    }

    fn map_ws_error(&self, err: tungstenite::Error) -> TransportError {
        match err {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                self.mark_closed();
                TransportError::ConnectionClosed
            }
            tungstenite::Error::Io(e) => {
                self.mark_closed();
                debug!(error = %e, "websocket io error");
                TransportError::ConnectionClosed
            }
            other => TransportError::WebSocket(other.to_string()),
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&self, msg: &Message) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        let json = msg.to_json()?;
        let mut sink = self.sink.lock().await;
        sink.send(WsMessage::Text(json.into()))
            .await
            .map_err(|e| self.map_ws_error(e))
    }

    async fn receive(&self) -> Result<Bytes, TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        let mut stream = self.stream.lock().await;
        loop {
            let frame = tokio::select! {
                () = self.cancel.cancelled() => return Err(TransportError::ConnectionClosed),
                frame = stream.next() => frame,
            };
            match frame {
                None => {
                    self.mark_closed();
                    return Err(TransportError::ConnectionClosed);
                }
                Some(Err(e)) => return Err(self.map_ws_error(e)),
                Some(Ok(WsMessage::Text(text))) => return Ok(Bytes::copy_from_slice(text.as_bytes())),
                Some(Ok(WsMessage::Binary(data))) => return Ok(data),
                Some(Ok(WsMessage::Close(frame))) => {
                    debug!(?frame, "peer closed websocket");
                    self.mark_closed();
                    return Err(TransportError::ConnectionClosed);
                }
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_))) => {
                    trace!("control frame");
                }
            }
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        if let Some(handle) = self.keepalive.lock().take() {
            handle.abort();
        }
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.close().await {
            debug!(error = %e, "websocket close handshake failed");
        }
        info!(url = %self.url, "websocket closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Send a ping every `interval` until cancelled or the peer is gone.
async fn keepalive_loop(sink: Arc<Mutex<WsSink>>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately.
    let _ = ticker.tick().await;
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let result = sink.lock().await.send(WsMessage::Ping(Bytes::new())).await;
                if let Err(e) = result {
                    debug!(error = %e, "keep-alive ping failed, stopping");
                    break;
                }
                trace!("keep-alive ping sent");
            }
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn duration_ms(d: Duration) -> u64 {
    d.as_millis() as u64
}
