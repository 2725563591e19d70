//! In-process transport pair.
//!
//! [`MemoryTransport`] is handed to the engine; the matching [`MemoryPeer`]
//! plays the kernel. Messages are JSON-encoded on the way through so the
//! codec is exercised exactly as on a socket.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use kgate_core::{Message, ProtocolError};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use super::Transport;
use crate::errors::TransportError;

/// Engine side of an in-process connection.
pub struct MemoryTransport {
    inbound: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    outbound: mpsc::UnboundedSender<Bytes>,
    closed: AtomicBool,
    cancel: CancellationToken,
}

/// Kernel side of an in-process connection.
pub struct MemoryPeer {
    to_engine: Option<mpsc::UnboundedSender<Bytes>>,
    from_engine: mpsc::UnboundedReceiver<Bytes>,
}

impl MemoryTransport {
    /// A connected transport/peer pair.
    pub fn pair() -> (Self, MemoryPeer) {
        let (to_engine, inbound) = mpsc::unbounded_channel();
        let (outbound, from_engine) = mpsc::unbounded_channel();
        let transport = Self {
            inbound: Mutex::new(inbound),
            outbound,
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        };
        let peer = MemoryPeer {
            to_engine: Some(to_engine),
            from_engine,
        };
        (transport, peer)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, msg: &Message) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        let json = msg.to_json()?;
        self.outbound
            .send(Bytes::from(json))
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn receive(&self) -> Result<Bytes, TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            () = self.cancel.cancelled() => Err(TransportError::ConnectionClosed),
            frame = inbound.recv() => match frame {
                Some(frame) => Ok(frame),
                None => {
                    self.closed.store(true, Ordering::Release);
                    Err(TransportError::ConnectionClosed)
                }
            },
        }
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.cancel.cancel();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl MemoryPeer {
    /// Deliver `msg` to the engine.
    ///
    /// Returns `false` once the peer has disconnected or the engine side is
    /// gone.
    pub fn push(&self, msg: &Message) -> Result<bool, ProtocolError> {
        Ok(self.push_raw(msg.to_json()?))
    }

    /// Deliver a raw frame, valid or not.
    pub fn push_raw(&self, frame: impl Into<Bytes>) -> bool {
        self.to_engine
            .as_ref()
            .is_some_and(|tx| tx.send(frame.into()).is_ok())
    }

    /// Next message the engine sent.
    ///
    /// Returns `None` when the engine side was dropped. Frames that fail to
    /// decode are skipped.
    pub async fn recv(&mut self) -> Option<Message> {
        while let Some(frame) = self.from_engine.recv().await {
            if let Ok(msg) = Message::parse(&frame) {
                return Some(msg);
            }
        }
        None
    }

    /// Next message the engine sent, without waiting.
    pub fn try_recv(&mut self) -> Option<Message> {
        while let Ok(frame) = self.from_engine.try_recv() {
            if let Ok(msg) = Message::parse(&frame) {
                return Some(msg);
            }
        }
        None
    }

    /// Simulate the kernel dropping the connection.
    pub fn disconnect(&mut self) {
        self.to_engine = None;
    }
}
