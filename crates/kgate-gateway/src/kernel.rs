//! One live remote kernel and its protocol connection.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use kgate_core::{ExecutionState, KernelId, SessionId};
use kgate_protocol::{ChannelEngine, Transport};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::errors::{GatewayError, Result};
use crate::listeners::OutputListeners;
use crate::models::KernelModel;

/// Lifecycle status of a managed kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KernelStatus {
    /// Created on the gateway, connection not yet up.
    Starting,
    /// Connected and accepting requests.
    Running,
    /// Restart in progress.
    Restarting,
    /// The connection died or a restart failed.
    Dead,
}

/// Transport, engine and forwarder of one connection.
///
/// Held behind a single pointer so a restart replaces all three at once.
pub(crate) struct KernelConnection {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) engine: Arc<ChannelEngine>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl KernelConnection {
    pub(crate) fn new(transport: Arc<dyn Transport>, engine: Arc<ChannelEngine>) -> Self {
        Self {
            transport,
            engine,
            forwarder: Mutex::new(None),
        }
    }

    pub(crate) fn set_forwarder(&self, handle: JoinHandle<()>) {
        *self.forwarder.lock() = Some(handle);
    }

    /// Stop the engine, close the transport and end the forwarder.
    pub(crate) async fn shutdown(&self) {
        self.engine.stop().await;
        self.transport.close().await;
        if let Some(handle) = self.forwarder.lock().take() {
            handle.abort();
        }
    }
}

/// Serializable view of a kernel for status and listing calls.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelSnapshot {
    /// Kernel id.
    pub id: KernelId,
    /// Kernel spec name.
    pub name: String,
    /// Owner.
    pub user_id: String,
    /// Lifecycle status.
    pub status: KernelStatus,
    /// Execution state.
    pub execution_state: ExecutionState,
    /// Last activity seen by the gateway or the connection.
    pub last_activity: DateTime<Utc>,
    /// Session of the current connection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    /// Registered output listeners.
    pub listeners: usize,
}

/// A kernel owned by the [`KernelManager`](crate::KernelManager).
pub struct GatewayKernel {
    id: KernelId,
    name: String,
    user_id: String,
    status: RwLock<KernelStatus>,
    remote_state: RwLock<ExecutionState>,
    remote_activity: RwLock<DateTime<Utc>>,
    connection: RwLock<Option<Arc<KernelConnection>>>,
    listeners: Arc<OutputListeners>,
    pub(crate) lifecycle: tokio::sync::Mutex<()>,
}

impl GatewayKernel {
    pub(crate) fn new(model: &KernelModel, user_id: impl Into<String>) -> Self {
        Self {
            id: model.id.clone(),
            name: model.name.clone(),
            user_id: user_id.into(),
            status: RwLock::new(KernelStatus::Starting),
            remote_state: RwLock::new(model.execution_state),
            remote_activity: RwLock::new(model.last_activity.unwrap_or_else(Utc::now)),
            connection: RwLock::new(None),
            listeners: Arc::new(OutputListeners::default()),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Kernel id.
    pub fn id(&self) -> &KernelId {
        &self.id
    }

    /// Kernel spec name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owner.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Lifecycle status.
    pub fn status(&self) -> KernelStatus {
        *self.status.read()
    }

    pub(crate) fn set_status(&self, status: KernelStatus) {
        *self.status.write() = status;
    }

    /// Execution state from the connection, or the gateway's last report
    /// when there is none.
    pub fn execution_state(&self) -> ExecutionState {
        match self.connection() {
            Some(conn) => conn.engine.execution_state(),
            None => *self.remote_state.read(),
        }
    }

    /// Latest activity from either source.
    pub fn last_activity(&self) -> DateTime<Utc> {
        let remote = *self.remote_activity.read();
        self.connection()
            .map_or(remote, |conn| remote.max(conn.engine.last_activity()))
    }

    /// Session of the current connection.
    pub fn session_id(&self) -> Option<SessionId> {
        self.connection()
            .map(|conn| conn.engine.session().id().clone())
    }

    /// Output listener queues.
    pub fn listeners(&self) -> &Arc<OutputListeners> {
        &self.listeners
    }

    /// Take in a gateway report (create, status poll, restart).
    pub(crate) fn refresh(&self, model: &KernelModel) {
        *self.remote_state.write() = model.execution_state;
        *self.remote_activity.write() = model.last_activity.unwrap_or_else(Utc::now);
    }

    pub(crate) fn connection(&self) -> Option<Arc<KernelConnection>> {
        self.connection.read().clone()
    }

    /// Replace the connection in one write; returns the previous one.
    pub(crate) fn swap_connection(
        &self,
        next: Option<Arc<KernelConnection>>,
    ) -> Option<Arc<KernelConnection>> {
        std::mem::replace(&mut *self.connection.write(), next)
    }

    /// The engine to send requests through.
    pub(crate) fn engine(&self) -> Result<Arc<ChannelEngine>> {
        if self.status() == KernelStatus::Dead {
            return Err(GatewayError::KernelDead {
                kernel_id: self.id.clone(),
            });
        }
        let conn = self
            .connection()
            .ok_or_else(|| GatewayError::EngineNotInitialized {
                kernel_id: self.id.clone(),
            })?;
        if conn.engine.is_disconnected() && !conn.engine.is_stopped() {
            self.connection_lost(&conn.engine);
            return Err(GatewayError::KernelDead {
                kernel_id: self.id.clone(),
            });
        }
        Ok(Arc::clone(&conn.engine))
    }

    /// Mark the kernel dead if `engine` is still its current engine.
    pub(crate) fn connection_lost(&self, engine: &Arc<ChannelEngine>) {
        let current = self
            .connection()
            .is_some_and(|conn| Arc::ptr_eq(&conn.engine, engine));
        if !current {
            return;
        }
        {
            let mut status = self.status.write();
            if *status == KernelStatus::Dead {
                return;
            }
            *status = KernelStatus::Dead;
        }
        let dropped = self.listeners.clear();
        warn!(kernel_id = %self.id, listeners = dropped, "kernel connection lost, marked dead");
    }

    /// Current state as a serializable value.
    pub fn snapshot(&self) -> KernelSnapshot {
        KernelSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            user_id: self.user_id.clone(),
            status: self.status(),
            execution_state: self.execution_state(),
            last_activity: self.last_activity(),
            session_id: self.session_id(),
            listeners: self.listeners.len(),
        }
    }
}
