//! Subscriber registry and per-subscriber channel queues.
//!
//! Broadcast holds the registry read lock and only uses `try_send`, so a
//! slow subscriber loses messages but never stalls the others. Unsubscribe
//! takes the write lock, which waits out any broadcast in progress.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use kgate_core::{Channel, Message};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::debug;

type Queue = mpsc::Sender<Arc<Message>>;

struct Slot {
    generation: u64,
    queues: [Queue; 4],
    active: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
}

struct Registry {
    slots: RwLock<HashMap<String, Slot>>,
    capacity: usize,
    next_generation: AtomicU64,
}

impl Registry {
    fn remove_if(&self, id: &str, generation: Option<u64>) -> bool {
        let mut slots = self.slots.write();
        let matches = slots
            .get(id)
            .is_some_and(|s| generation.is_none_or(|g| g == s.generation));
        if !matches {
            return false;
        }
        if let Some(slot) = slots.remove(id) {
            slot.active.store(false, Ordering::Release);
        }
        true
    }
}

/// Registered listeners of one engine.
pub(crate) struct SubscriberRegistry {
    inner: Arc<Registry>,
}

impl SubscriberRegistry {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Registry {
                slots: RwLock::new(HashMap::new()),
                capacity: capacity.max(1),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Register `id`, replacing (and deactivating) any earlier subscriber
    /// with the same id.
    pub(crate) fn subscribe(&self, id: impl Into<String>) -> ChannelSubscriber {
        let id = id.into();
        let capacity = self.inner.capacity;
        let (shell_tx, shell) = mpsc::channel(capacity);
        let (iopub_tx, iopub) = mpsc::channel(capacity);
        let (stdin_tx, stdin) = mpsc::channel(capacity);
        let (control_tx, control) = mpsc::channel(capacity);
        let active = Arc::new(AtomicBool::new(true));
        let dropped = Arc::new(AtomicU64::new(0));
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);

        let slot = Slot {
            generation,
            queues: [shell_tx, iopub_tx, stdin_tx, control_tx],
            active: Arc::clone(&active),
            dropped: Arc::clone(&dropped),
        };
        if let Some(old) = self.inner.slots.write().insert(id.clone(), slot) {
            old.active.store(false, Ordering::Release);
            debug!(subscriber_id = %id, "subscriber replaced");
        }

        ChannelSubscriber {
            id,
            receivers: [shell, iopub, stdin, control],
            active,
            dropped,
            generation,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Remove `id`. Once this returns nothing more reaches that subscriber.
    pub(crate) fn unsubscribe(&self, id: &str) -> bool {
        self.inner.remove_if(id, None)
    }

    /// Offer `msg` to every subscriber's `channel` queue without blocking.
    pub(crate) fn broadcast(&self, channel: Channel, msg: &Arc<Message>) {
        let slots = self.inner.slots.read();
        for (id, slot) in slots.iter() {
            match slot.queues[channel.index()].try_send(Arc::clone(msg)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let total = slot.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    debug!(
                        subscriber_id = %id,
                        %channel,
                        msg_type = %msg.msg_type(),
                        dropped_total = total,
                        "subscriber queue full, dropping message"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.slots.read().len()
    }

    /// Remove every subscriber.
    pub(crate) fn clear(&self) {
        let mut slots = self.inner.slots.write();
        for slot in slots.values() {
            slot.active.store(false, Ordering::Release);
        }
        slots.clear();
    }
}

/// One listener's view of the four channels.
///
/// Dropping the subscriber unregisters it.
pub struct ChannelSubscriber {
    id: String,
    receivers: [mpsc::Receiver<Arc<Message>>; 4],
    active: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    generation: u64,
    registry: Weak<Registry>,
}

impl ChannelSubscriber {
    /// Subscriber id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the subscriber is still registered.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Messages dropped because a queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Next message on `channel`. `None` once unsubscribed.
    pub async fn recv(&mut self, channel: Channel) -> Option<Arc<Message>> {
        if !self.is_active() {
            return None;
        }
        let msg = self.receivers[channel.index()].recv().await?;
        self.is_active().then_some(msg)
    }

    /// Next message on `channel`, without waiting.
    pub fn try_recv(&mut self, channel: Channel) -> Option<Arc<Message>> {
        if !self.is_active() {
            return None;
        }
        self.receivers[channel.index()].try_recv().ok()
    }

    /// Next message on any channel. `None` once unsubscribed.
    ///
    /// Order is preserved within a channel, not across channels.
    pub async fn recv_any(&mut self) -> Option<Arc<Message>> {
        if !self.is_active() {
            return None;
        }
        let [shell, iopub, stdin, control] = &mut self.receivers;
        let msg = tokio::select! {
            Some(m) = shell.recv() => m,
            Some(m) = iopub.recv() => m,
            Some(m) = stdin.recv() => m,
            Some(m) = control.recv() => m,
            else => return None,
        };
        self.is_active().then_some(msg)
    }
}

impl Drop for ChannelSubscriber {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            let _ = registry.remove_if(&self.id, Some(self.generation));
        }
    }
}
