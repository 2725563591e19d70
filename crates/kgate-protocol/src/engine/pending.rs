//! Outstanding request table.
//!
//! One entry per request awaited through a sync call, keyed by the
//! request's `msg_id`. Each entry owns a reply slot with room for exactly
//! one message; the waiter removes the entry, the reader only fills the
//! slot.

use std::collections::HashMap;
use std::time::Instant;

use kgate_core::{Message, MsgId, MsgType};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::errors::EngineError;

struct PendingRequest {
    expected: MsgType,
    reply_tx: mpsc::Sender<Message>,
    created_at: Instant,
}

/// Result of trying to hand a reply to its waiter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Delivery {
    /// The waiter's slot took the reply.
    Delivered,
    /// No request with that id is pending (timed out, cancelled or never sent).
    Unknown,
    /// The slot already holds a reply.
    Duplicate,
    /// The waiter went away before removing its entry.
    Abandoned,
}

#[derive(Default)]
pub(crate) struct PendingTable {
    entries: Mutex<HashMap<MsgId, PendingRequest>>,
}

impl PendingTable {
    /// Add an entry and return its reply slot.
    pub(crate) fn register(
        &self,
        msg_id: &MsgId,
        expected: MsgType,
    ) -> Result<mpsc::Receiver<Message>, EngineError> {
        let mut entries = self.entries.lock();
        if entries.contains_key(msg_id) {
            return Err(EngineError::DuplicateRequest {
                msg_id: msg_id.clone(),
            });
        }
        let (reply_tx, reply_rx) = mpsc::channel(1);
        let _ = entries.insert(
            msg_id.clone(),
            PendingRequest {
                expected,
                reply_tx,
                created_at: Instant::now(),
            },
        );
        Ok(reply_rx)
    }

    /// Offer `reply` to the request named by its parent header.
    ///
    /// Never blocks. The entry stays in place; its waiter removes it.
    pub(crate) fn deliver(&self, reply: &Message) -> Delivery {
        let Some(parent) = reply.parent_msg_id() else {
            return Delivery::Unknown;
        };
        let entries = self.entries.lock();
        let Some(entry) = entries.get(parent) else {
            return Delivery::Unknown;
        };
        if reply.kind() != Some(entry.expected) {
            tracing::debug!(
                msg_id = %parent,
                expected = %entry.expected,
                got = %reply.msg_type(),
                waited_ms = u64::try_from(entry.created_at.elapsed().as_millis()).unwrap_or(u64::MAX),
                "reply type differs from expected"
            );
        }
        match entry.reply_tx.try_send(reply.clone()) {
            Ok(()) => Delivery::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::Duplicate,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Abandoned,
        }
    }

    /// Remove an entry. Returns whether it existed.
    pub(crate) fn remove(&self, msg_id: &MsgId) -> bool {
        self.entries.lock().remove(msg_id).is_some()
    }

    /// Drop every entry; waiters see their slot close.
    pub(crate) fn clear(&self) -> usize {
        let mut entries = self.entries.lock();
        let n = entries.len();
        entries.clear();
        n
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Removes a pending entry when dropped, whichever way the wait ended.
pub(crate) struct PendingGuard<'a> {
    table: &'a PendingTable,
    msg_id: MsgId,
}

impl<'a> PendingGuard<'a> {
    pub(crate) fn new(table: &'a PendingTable, msg_id: MsgId) -> Self {
        Self { table, msg_id }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let _ = self.table.remove(&self.msg_id);
    }
}
