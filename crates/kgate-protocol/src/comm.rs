//! Comm sub-protocol: named, bidirectional widget channels layered on top
//! of iopub/shell traffic.
//!
//! Every outbound comm message goes through one unbounded queue that the
//! engine drains into the transport, so comm messages keep their relative
//! order no matter which task emitted them. Callbacks are never invoked
//! while a registry lock is held.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use kgate_core::messages::{CommClose, CommMsg, CommOpen};
use kgate_core::{Channel, CommId, Content, Message, Session};
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::errors::CommError;

/// Called when the kernel opens a comm on a registered target.
pub type TargetHandler = Arc<dyn Fn(Arc<Comm>, &CommOpen) + Send + Sync>;

/// Called with the `data` of each `comm_msg`, or the final `data` on close.
pub type DataCallback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Receiving end of the comm outbound queue.
pub type CommOutbound = mpsc::UnboundedReceiver<Message>;

struct Shared {
    session: Session,
    targets: RwLock<HashMap<String, TargetHandler>>,
    comms: RwLock<HashMap<CommId, Arc<Comm>>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
}

impl Shared {
    fn emit(&self, mut msg: Message) -> Result<(), CommError> {
        // Frontend-to-kernel comm traffic travels on shell.
        msg.channel = Channel::Shell;
        let guard = self.outbound.lock();
        let tx = guard.as_ref().ok_or(CommError::ManagerClosed)?;
        tx.send(msg).map_err(|_| CommError::ManagerClosed)
    }
}

/// An open comm.
pub struct Comm {
    id: CommId,
    target_name: String,
    data: Value,
    closed: AtomicBool,
    on_msg: RwLock<Option<DataCallback>>,
    on_close: RwLock<Option<DataCallback>>,
    shared: Weak<Shared>,
}

impl Comm {
    fn new(id: CommId, target_name: String, data: Value, shared: &Arc<Shared>) -> Self {
        Self {
            id,
            target_name,
            data,
            closed: AtomicBool::new(false),
            on_msg: RwLock::new(None),
            on_close: RwLock::new(None),
            shared: Arc::downgrade(shared),
        }
    }

    /// Comm id.
    pub fn id(&self) -> &CommId {
        &self.id
    }

    /// Target this comm is bound to.
    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    /// `data` from the `comm_open`.
    pub fn data(&self) -> &Value {
        &self.data
    }

    /// Whether the comm has been closed from either side.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Set the message callback.
    pub fn on_msg(&self, callback: impl Fn(&Value) + Send + Sync + 'static) {
        *self.on_msg.write() = Some(Arc::new(callback));
    }

    /// Set the close callback.
    pub fn on_close(&self, callback: impl Fn(&Value) + Send + Sync + 'static) {
        *self.on_close.write() = Some(Arc::new(callback));
    }

    /// Send `data` to the kernel side of this comm.
    pub fn send(&self, data: Value) -> Result<(), CommError> {
        if self.is_closed() {
            return Err(CommError::Closed {
                comm_id: self.id.clone(),
            });
        }
        let shared = self.shared.upgrade().ok_or(CommError::ManagerClosed)?;
        let msg = shared.session.message(CommMsg {
            comm_id: self.id.clone(),
            data,
        });
        shared.emit(msg)
    }

    /// Close from this side. Emits `comm_close` once; later calls are no-ops.
    pub fn close(&self, data: Value) -> Result<(), CommError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let emitted = match self.shared.upgrade() {
            Some(shared) => {
                let _ = shared.comms.write().remove(&self.id);
                shared.emit(shared.session.message(CommClose {
                    comm_id: self.id.clone(),
                    data: data.clone(),
                }))
            }
            None => Err(CommError::ManagerClosed),
        };
        self.fire_close(&data);
        emitted
    }

    fn dispatch_msg(&self, data: &Value) {
        let callback = self.on_msg.read().clone();
        match callback {
            Some(cb) => cb(data),
            None => debug!(comm_id = %self.id, "comm_msg with no handler"),
        }
    }

    /// Mark closed by the remote side. Returns `false` if already closed.
    fn close_remote(&self, data: &Value) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.fire_close(data);
        true
    }

    fn fire_close(&self, data: &Value) {
        let callback = self.on_close.write().take();
        let _ = self.on_msg.write().take();
        if let Some(cb) = callback {
            cb(data);
        }
    }
}

impl fmt::Debug for Comm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Comm")
            .field("id", &self.id)
            .field("target_name", &self.target_name)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Registry of comm targets and open comms for one kernel connection.
pub struct CommManager {
    shared: Arc<Shared>,
}

impl CommManager {
    /// New manager emitting messages built from `session`.
    ///
    /// The returned receiver is the outbound queue; whoever owns the
    /// transport must drain it.
    pub fn new(session: Session) -> (Self, CommOutbound) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            session,
            targets: RwLock::new(HashMap::new()),
            comms: RwLock::new(HashMap::new()),
            outbound: Mutex::new(Some(tx)),
        });
        (Self { shared }, rx)
    }

    /// Accept `comm_open`s for `name`, handing each new comm to `handler`.
    pub fn register_target(
        &self,
        name: impl Into<String>,
        handler: impl Fn(Arc<Comm>, &CommOpen) + Send + Sync + 'static,
    ) {
        let name = name.into();
        debug!(target_name = %name, "comm target registered");
        let _ = self.shared.targets.write().insert(name, Arc::new(handler));
    }

    /// Stop accepting `comm_open`s for `name`.
    pub fn unregister_target(&self, name: &str) -> bool {
        self.shared.targets.write().remove(name).is_some()
    }

    /// Open a comm from this side.
    pub fn open(&self, target_name: impl Into<String>, data: Value) -> Result<Arc<Comm>, CommError> {
        let target_name = target_name.into();
        let comm = Arc::new(Comm::new(
            CommId::new(),
            target_name.clone(),
            data.clone(),
            &self.shared,
        ));
        let msg = self.shared.session.message(CommOpen {
            comm_id: comm.id.clone(),
            target_name,
            data,
            target_module: None,
        });
        self.shared.emit(msg)?;
        let _ = self
            .shared
            .comms
            .write()
            .insert(comm.id.clone(), Arc::clone(&comm));
        Ok(comm)
    }

    /// Dispatch an inbound comm message. Non-comm messages are ignored.
    pub fn handle_message(&self, msg: &Message) {
        match &msg.content {
            Content::CommOpen(open) => self.handle_open(msg, open),
            Content::CommMsg(m) => self.handle_msg(m),
            Content::CommClose(close) => self.handle_close(close),
            _ => {}
        }
    }

    fn handle_open(&self, msg: &Message, open: &CommOpen) {
        let handler = self.shared.targets.read().get(&open.target_name).cloned();
        let Some(handler) = handler else {
            warn!(
                comm_id = %open.comm_id,
                target_name = %open.target_name,
                "comm_open for unregistered target, rejecting"
            );
            let reject = self.shared.session.reply_to(
                msg,
                CommClose {
                    comm_id: open.comm_id.clone(),
                    data: json!({}),
                },
            );
            if let Err(e) = self.shared.emit(reject) {
                debug!(comm_id = %open.comm_id, error = %e, "could not send comm rejection");
            }
            return;
        };

        let comm = Arc::new(Comm::new(
            open.comm_id.clone(),
            open.target_name.clone(),
            open.data.clone(),
            &self.shared,
        ));
        let replaced = self
            .shared
            .comms
            .write()
            .insert(comm.id.clone(), Arc::clone(&comm));
        if replaced.is_some() {
            warn!(comm_id = %open.comm_id, "comm_open reused an open comm id, replacing");
        }
        info!(comm_id = %open.comm_id, target_name = %open.target_name, "comm opened");
        handler(comm, open);
    }

    fn handle_msg(&self, m: &CommMsg) {
        let comm = self.shared.comms.read().get(&m.comm_id).cloned();
        match comm {
            Some(comm) => comm.dispatch_msg(&m.data),
            None => debug!(comm_id = %m.comm_id, "comm_msg for unknown comm, dropping"),
        }
    }

    fn handle_close(&self, close: &CommClose) {
        let comm = self.shared.comms.write().remove(&close.comm_id);
        match comm {
            Some(comm) => {
                if comm.close_remote(&close.data) {
                    info!(comm_id = %close.comm_id, "comm closed by kernel");
                }
            }
            None => debug!(comm_id = %close.comm_id, "comm_close for unknown comm"),
        }
    }

    /// Open comm by id.
    pub fn get(&self, id: &str) -> Option<Arc<Comm>> {
        self.shared.comms.read().get(id).cloned()
    }

    /// Ids of all open comms.
    pub fn comm_ids(&self) -> Vec<CommId> {
        self.shared.comms.read().keys().cloned().collect()
    }

    /// Number of open comms.
    pub fn len(&self) -> usize {
        self.shared.comms.read().len()
    }

    /// Whether no comm is open.
    pub fn is_empty(&self) -> bool {
        self.shared.comms.read().is_empty()
    }

    /// Close the outbound queue and drop every comm. Safe to call twice.
    pub fn close(&self) {
        let Some(tx) = self.shared.outbound.lock().take() else {
            return;
        };
        drop(tx);
        let comms: Vec<_> = self.shared.comms.write().drain().map(|(_, c)| c).collect();
        for comm in &comms {
            let _ = comm.close_remote(&Value::Null);
        }
        debug!(closed = comms.len(), "comm manager closed");
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.shared.outbound.lock().is_none()
    }
}
