//! Output listeners and the per-connection forwarder.
//!
//! Listeners receive [`OutputEnvelope`]s, never raw protocol messages, so
//! HTTP execute handlers and live viewers stay independent of the engine's
//! subscriber API.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use kgate_core::{Channel, KernelId, OutputEnvelope};
use kgate_protocol::{ChannelEngine, ChannelSubscriber};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::kernel::GatewayKernel;

/// Sending half of an output listener queue.
pub type OutputSender = mpsc::Sender<OutputEnvelope>;

/// Receiving half of an output listener queue.
pub type OutputReceiver = mpsc::Receiver<OutputEnvelope>;

/// Listener queues of one kernel, keyed by listener id.
#[derive(Default)]
pub struct OutputListeners {
    queues: RwLock<HashMap<String, OutputSender>>,
    dropped: AtomicU64,
}

impl OutputListeners {
    /// Add or replace a listener. Returns whether one was replaced.
    pub fn register(&self, listener_id: impl Into<String>, queue: OutputSender) -> bool {
        self.queues
            .write()
            .insert(listener_id.into(), queue)
            .is_some()
    }

    /// Remove a listener; its receiver ends once drained.
    pub fn unregister(&self, listener_id: &str) -> bool {
        self.queues.write().remove(listener_id).is_some()
    }

    /// Offer `envelope` to every listener without waiting.
    ///
    /// A full queue loses this envelope; a closed queue is removed.
    pub fn publish(&self, kernel_id: &KernelId, envelope: &OutputEnvelope) {
        let mut closed = Vec::new();
        {
            let queues = self.queues.read();
            for (id, tx) in queues.iter() {
                match tx.try_send(envelope.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            %kernel_id,
                            listener_id = %id,
                            msg_type = %envelope.msg_type,
                            "listener queue full, dropping output"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(id.clone()),
                }
            }
        }
        if !closed.is_empty() {
            let mut queues = self.queues.write();
            for id in closed {
                // A listener re-registered under the same id keeps its slot.
                if queues.get(&id).is_some_and(mpsc::Sender::is_closed) {
                    let _ = queues.remove(&id);
                    debug!(%kernel_id, listener_id = %id, "listener gone, removed");
                }
            }
        }
    }

    /// Drop every listener queue.
    pub fn clear(&self) -> usize {
        let mut queues = self.queues.write();
        let n = queues.len();
        queues.clear();
        n
    }

    /// Registered listeners.
    pub fn len(&self) -> usize {
        self.queues.read().len()
    }

    /// Whether no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.queues.read().is_empty()
    }

    /// Envelopes lost to full queues.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Republish everything `engine` delivers into the kernel's listeners.
///
/// Ends when the engine is stopped or its connection dies. A death that
/// was not caused by `stop()` marks the kernel dead.
pub(crate) async fn forward(
    kernel: Weak<GatewayKernel>,
    kernel_id: KernelId,
    engine: Arc<ChannelEngine>,
    mut subscriber: ChannelSubscriber,
    listeners: Arc<OutputListeners>,
) {
    loop {
        tokio::select! {
            biased;
            msg = subscriber.recv_any() => match msg {
                Some(msg) => {
                    trace!(msg_type = %msg.msg_type(), "forwarding");
                    listeners.publish(&kernel_id, &OutputEnvelope::from_message(&msg));
                }
                None => return,
            },
            () = engine.disconnected() => break,
        }
    }

    for channel in Channel::ALL {
        while let Some(msg) = subscriber.try_recv(channel) {
            listeners.publish(&kernel_id, &OutputEnvelope::from_message(&msg));
        }
    }
    if engine.is_stopped() {
        return;
    }
    if let Some(kernel) = kernel.upgrade() {
        kernel.connection_lost(&engine);
    }
}
