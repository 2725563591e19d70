//! Kernel lifecycle manager: the facade the rest of the backend calls.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use kgate_core::constants::KERNEL_USERNAME_ENV;
use kgate_core::messages::{ExecuteReply, ExecuteRequest, ReplyStatus, StreamName};
use kgate_core::{
    Channel, Content, ExecutionState, KernelId, Message, MsgId, OutputEnvelope, Session,
};
use kgate_protocol::{
    ChannelEngine, EngineConfig, EngineError, Transport, WsConfig, WsTransport,
};
use kgate_settings::{KernelSettings, KgateSettings};
use serde_json::Value;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::errors::{GatewayError, Result};
use crate::kernel::{GatewayKernel, KernelConnection, KernelSnapshot, KernelStatus};
use crate::listeners::{OutputReceiver, OutputSender, forward};
use crate::models::{KernelModel, KernelSpecs};
use crate::rest::GatewayClient;

const FORWARDER_ID: &str = "kgate-forwarder";

/// Result of [`KernelManager::execute_sync`].
#[derive(Clone, Debug)]
pub struct ExecutionOutcome {
    /// Id of the `execute_request`.
    pub msg_id: MsgId,
    /// The `execute_reply`.
    pub reply: Message,
    /// IOPub output caused by the request, in arrival order, without
    /// `status` messages.
    pub outputs: Vec<OutputEnvelope>,
}

impl ExecutionOutcome {
    fn execute_reply(&self) -> Option<&ExecuteReply> {
        match &self.reply.content {
            Content::ExecuteReply(reply) => Some(reply),
            _ => None,
        }
    }

    /// Reply status; `None` if the reply could not be decoded as one.
    pub fn status(&self) -> Option<ReplyStatus> {
        self.execute_reply().map(|r| r.status)
    }

    /// Execution counter from the reply.
    pub fn execution_count(&self) -> Option<u64> {
        self.execute_reply().and_then(|r| r.execution_count)
    }

    /// `text/plain` of the first `execute_result`.
    pub fn result_text(&self) -> Option<&str> {
        self.outputs
            .iter()
            .find(|o| o.msg_type == "execute_result")
            .and_then(|o| o.content.pointer("/data/text~1plain"))
            .and_then(Value::as_str)
    }

    /// Concatenated text of `stream` outputs named `name`.
    pub fn stream_text(&self, name: StreamName) -> String {
        let name = match name {
            StreamName::Stdout => "stdout",
            StreamName::Stderr => "stderr",
        };
        self.outputs
            .iter()
            .filter(|o| o.msg_type == "stream" && o.content["name"] == name)
            .filter_map(|o| o.content["text"].as_str())
            .collect()
    }

    /// The `error` output, if the code raised.
    pub fn error(&self) -> Option<&OutputEnvelope> {
        self.outputs.iter().find(|o| o.msg_type == "error")
    }
}

/// Deletes a just-created remote kernel unless disarmed.
///
/// Covers both explicit failure and the start future being dropped.
struct CreatedKernel {
    client: GatewayClient,
    kernel_id: Option<KernelId>,
}

impl CreatedKernel {
    fn disarm(mut self) {
        self.kernel_id = None;
    }

    async fn cleanup(mut self) {
        if let Some(kernel_id) = self.kernel_id.take() {
            delete_quietly(&self.client, &kernel_id).await;
        }
    }
}

impl Drop for CreatedKernel {
    fn drop(&mut self) {
        let Some(kernel_id) = self.kernel_id.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(%kernel_id, "start abandoned outside a runtime, remote kernel left running");
            return;
        };
        let client = self.client.clone();
        drop(handle.spawn(async move { delete_quietly(&client, &kernel_id).await }));
    }
}

async fn delete_quietly(client: &GatewayClient, kernel_id: &KernelId) {
    match client.delete_kernel(kernel_id).await {
        Ok(()) => debug!(%kernel_id, "remote kernel deleted"),
        Err(e) => warn!(%kernel_id, error = %e, "failed to delete remote kernel"),
    }
}

/// Registry of live kernels plus every lifecycle and execution operation.
///
/// Safe to share across tasks; operations on different kernels never
/// contend, and restart/stop on one kernel are serialized.
pub struct KernelManager {
    client: GatewayClient,
    settings: KernelSettings,
    kernels: DashMap<KernelId, Arc<GatewayKernel>>,
}

impl KernelManager {
    /// Manager over an existing client.
    pub fn new(client: GatewayClient, settings: KernelSettings) -> Self {
        Self {
            client,
            settings,
            kernels: DashMap::new(),
        }
    }

    /// Build the client and manager from loaded settings.
    pub fn from_settings(settings: &KgateSettings) -> Result<Self> {
        let client = GatewayClient::new(&settings.gateway)?;
        Ok(Self::new(client, settings.kernel.clone()))
    }

    /// The REST client.
    pub fn client(&self) -> &GatewayClient {
        &self.client
    }

    /// Registered kernel by id.
    pub fn kernel(&self, kernel_id: &KernelId) -> Option<Arc<GatewayKernel>> {
        self.kernels.get(kernel_id).map(|k| Arc::clone(k.value()))
    }

    fn lookup(&self, kernel_id: &KernelId) -> Result<Arc<GatewayKernel>> {
        self.kernel(kernel_id)
            .ok_or_else(|| GatewayError::KernelNotFound {
                kernel_id: kernel_id.clone(),
            })
    }

    fn is_registered(&self, kernel: &Arc<GatewayKernel>) -> bool {
        self.kernels
            .get(kernel.id())
            .is_some_and(|k| Arc::ptr_eq(k.value(), kernel))
    }

    /// Number of registered kernels.
    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    /// Whether no kernel is registered.
    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }

    // ── Discovery ───────────────────────────────────────────────────────

    /// Kernel specs installed on the gateway.
    pub async fn list_kernel_specs(&self) -> Result<KernelSpecs> {
        self.client.list_kernel_specs().await
    }

    /// Kernels managed here, optionally only those owned by `user_id`.
    pub fn list_kernels(&self, user_id: Option<&str>) -> Vec<KernelSnapshot> {
        let mut kernels: Vec<_> = self
            .kernels
            .iter()
            .filter(|k| user_id.is_none_or(|u| k.user_id() == u))
            .map(|k| k.snapshot())
            .collect();
        kernels.sort_by(|a, b| a.id.cmp(&b.id));
        kernels
    }

    /// Every kernel the gateway is running, managed here or not.
    pub async fn list_remote_kernels(&self) -> Result<Vec<KernelModel>> {
        self.client.list_kernels().await
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Launch a kernel on the gateway and connect to it.
    ///
    /// `spec_name` defaults to the configured spec. The readiness wait is
    /// bounded by the launch timeout and is not fatal.
    pub async fn start_kernel(
        &self,
        spec_name: Option<&str>,
        user_id: &str,
    ) -> Result<KernelSnapshot> {
        let spec_name = spec_name.unwrap_or(&self.settings.default_spec);
        let mut env = BTreeMap::new();
        let _ = env.insert(
            KERNEL_USERNAME_ENV.to_owned(),
            self.username_for(user_id).to_owned(),
        );

        let model = self.client.create_kernel(spec_name, env).await?;
        let created = CreatedKernel {
            client: self.client.clone(),
            kernel_id: Some(model.id.clone()),
        };
        info!(kernel_id = %model.id, spec = spec_name, user_id, "kernel created");

        let kernel = Arc::new(GatewayKernel::new(&model, user_id));
        self.wait_ready(&kernel).await;

        let conn = match self.connect(&kernel).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(kernel_id = %kernel.id(), error = %e, "connect failed, deleting kernel");
                created.cleanup().await;
                return Err(e);
            }
        };
        let _ = kernel.swap_connection(Some(conn));
        kernel.set_status(KernelStatus::Running);
        let _ = self
            .kernels
            .insert(kernel.id().clone(), Arc::clone(&kernel));
        created.disarm();

        info!(kernel_id = %kernel.id(), session_id = ?kernel.session_id(), "kernel started");
        Ok(kernel.snapshot())
    }

    /// Stop the connection, delete the remote kernel and forget it.
    ///
    /// A failed remote delete is logged, not returned.
    pub async fn stop_kernel(&self, kernel_id: &KernelId) -> Result<()> {
        let kernel = self.lookup(kernel_id)?;
        let _lifecycle = kernel.lifecycle.lock().await;
        if !self.is_registered(&kernel) {
            return Err(GatewayError::KernelNotFound {
                kernel_id: kernel_id.clone(),
            });
        }

        if let Some(conn) = kernel.swap_connection(None) {
            conn.shutdown().await;
        }
        kernel.set_status(KernelStatus::Dead);
        delete_quietly(&self.client, kernel_id).await;
        let _ = self.kernels.remove(kernel_id);
        let listeners = kernel.listeners().clear();
        info!(%kernel_id, listeners, "kernel stopped");
        Ok(())
    }

    /// Restart the remote kernel and reconnect with a fresh session.
    ///
    /// The kernel id and registry entry are kept. Requests issued while the
    /// restart runs fail with [`GatewayError::EngineNotInitialized`].
    pub async fn restart_kernel(&self, kernel_id: &KernelId) -> Result<KernelSnapshot> {
        let kernel = self.lookup(kernel_id)?;
        let _lifecycle = kernel.lifecycle.lock().await;
        if !self.is_registered(&kernel) {
            return Err(GatewayError::KernelNotFound {
                kernel_id: kernel_id.clone(),
            });
        }

        kernel.set_status(KernelStatus::Restarting);
        if let Some(old) = kernel.swap_connection(None) {
            old.shutdown().await;
        }

        let result = async {
            let model = self.client.restart_kernel(kernel_id).await?;
            kernel.refresh(&model);
            self.connect(&kernel).await
        }
        .await;

        match result {
            Ok(conn) => {
                let _ = kernel.swap_connection(Some(conn));
                kernel.set_status(KernelStatus::Running);
                info!(%kernel_id, session_id = ?kernel.session_id(), "kernel restarted");
                Ok(kernel.snapshot())
            }
            Err(e) => {
                kernel.set_status(KernelStatus::Dead);
                let _ = kernel.listeners().clear();
                warn!(%kernel_id, error = %e, "restart failed, kernel marked dead");
                Err(e)
            }
        }
    }

    /// Interrupt running code.
    ///
    /// Sends `interrupt_request` on the control channel; uses the REST
    /// endpoint only when there is no usable connection or the send fails.
    pub async fn interrupt_kernel(&self, kernel_id: &KernelId) -> Result<()> {
        let kernel = self.lookup(kernel_id)?;
        match kernel.engine() {
            Ok(engine) => match engine.interrupt().await {
                Ok(msg_id) => {
                    debug!(%kernel_id, %msg_id, "interrupt sent on control channel");
                    return Ok(());
                }
                Err(e) => warn!(%kernel_id, error = %e, "protocol interrupt failed, using REST"),
            },
            Err(e) => debug!(%kernel_id, reason = %e, "no connection, using REST interrupt"),
        }
        self.client.interrupt_kernel(kernel_id).await
    }

    /// Current state, refreshed from the gateway when it answers.
    ///
    /// A 404 from the gateway marks the kernel dead.
    pub async fn get_kernel_status(&self, kernel_id: &KernelId) -> Result<KernelSnapshot> {
        let kernel = self.lookup(kernel_id)?;
        match self.client.get_kernel(kernel_id).await {
            Ok(model) => kernel.refresh(&model),
            Err(e) if e.is_remote_not_found() => {
                if kernel.status() != KernelStatus::Dead {
                    warn!(%kernel_id, "gateway no longer knows the kernel, marking dead");
                    kernel.set_status(KernelStatus::Dead);
                    let _ = kernel.listeners().clear();
                }
            }
            Err(e) => debug!(%kernel_id, error = %e, "status refresh failed"),
        }
        Ok(kernel.snapshot())
    }

    /// Stop every kernel. Used on shutdown.
    pub async fn shutdown_all(&self) {
        let ids: Vec<KernelId> = self.kernels.iter().map(|k| k.key().clone()).collect();
        let count = ids.len();
        let stops = ids.iter().map(|id| self.stop_kernel(id));
        for (id, result) in ids.iter().zip(futures::future::join_all(stops).await) {
            if let Err(e) = result {
                debug!(kernel_id = %id, error = %e, "stop during shutdown failed");
            }
        }
        info!(count, "all kernels stopped");
    }

    // ── Execution ───────────────────────────────────────────────────────

    /// Run `code` and return the request id at once.
    ///
    /// Output reaches registered output listeners.
    pub async fn execute_code(&self, kernel_id: &KernelId, code: &str) -> Result<MsgId> {
        let kernel = self.lookup(kernel_id)?;
        let engine = kernel.engine()?;
        engine
            .execute(code)
            .await
            .map_err(|e| engine_failure(&kernel, &engine, e))
    }

    /// Run `code` and wait for the reply and every output it caused.
    ///
    /// Returns once the reply has arrived and the kernel went idle for this
    /// request, or the reply has arrived and `timeout` expired. Without a
    /// reply before `timeout` the call fails with a timeout error.
    pub async fn execute_sync(
        &self,
        kernel_id: &KernelId,
        code: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecutionOutcome> {
        let kernel = self.lookup(kernel_id)?;
        let engine = kernel.engine()?;
        let timeout = timeout.unwrap_or_else(|| self.settings.execute_timeout());
        // `sleep` saturates on overflow, so `Duration::MAX` means no limit.
        let idle_wait = tokio::time::sleep(timeout);
        tokio::pin!(idle_wait);

        let request = engine.session().message(ExecuteRequest::new(code));
        let msg_id = request.msg_id().clone();
        // Subscribe before sending so no output is missed. Dropping the
        // subscriber unregisters it on every exit path.
        let mut outputs_sub = engine.subscribe(format!("execute-{msg_id}"));

        let reply_wait = engine.request_sync(request, timeout);
        tokio::pin!(reply_wait);

        let mut reply = None;
        let mut idle = false;
        let mut outputs = Vec::new();
        while reply.is_none() || !idle {
            tokio::select! {
                result = &mut reply_wait, if reply.is_none() => {
                    reply = Some(result.map_err(|e| engine_failure(&kernel, &engine, e))?);
                }
                msg = outputs_sub.recv(Channel::IoPub) => {
                    let Some(msg) = msg else { break };
                    let envelope = OutputEnvelope::from_message(&msg);
                    if !envelope.is_child_of(msg_id.as_str()) {
                        continue;
                    }
                    match envelope.execution_state() {
                        Some(ExecutionState::Idle) => idle = true,
                        Some(_) => {}
                        None => outputs.push(envelope),
                    }
                }
                () = &mut idle_wait, if reply.is_some() => {
                    debug!(%kernel_id, %msg_id, "idle status not seen before deadline");
                    break;
                }
            }
        }

        match reply {
            Some(reply) => Ok(ExecutionOutcome {
                msg_id,
                reply,
                outputs,
            }),
            None => Err(if engine.is_stopped() {
                GatewayError::EngineNotInitialized {
                    kernel_id: kernel_id.clone(),
                }
            } else {
                GatewayError::KernelDead {
                    kernel_id: kernel_id.clone(),
                }
            }),
        }
    }

    /// Answer the kernel's pending `input_request`.
    pub async fn input_reply(&self, kernel_id: &KernelId, value: &str) -> Result<MsgId> {
        let kernel = self.lookup(kernel_id)?;
        let engine = kernel.engine()?;
        engine
            .input_reply(value)
            .await
            .map_err(|e| engine_failure(&kernel, &engine, e))
    }

    // ── Output listeners ────────────────────────────────────────────────

    /// Receive normalized output of `kernel_id` on `queue`.
    ///
    /// Re-using a listener id replaces the earlier queue.
    pub fn register_output_channel(
        &self,
        kernel_id: &KernelId,
        listener_id: &str,
        queue: OutputSender,
    ) -> Result<()> {
        let kernel = self.lookup(kernel_id)?;
        if kernel.status() == KernelStatus::Dead {
            return Err(GatewayError::KernelDead {
                kernel_id: kernel_id.clone(),
            });
        }
        if kernel.listeners().register(listener_id, queue) {
            debug!(%kernel_id, listener_id, "output listener replaced");
        } else {
            debug!(%kernel_id, listener_id, "output listener registered");
        }
        Ok(())
    }

    /// [`register_output_channel`](Self::register_output_channel) with a
    /// queue of the configured capacity.
    pub fn open_output_channel(
        &self,
        kernel_id: &KernelId,
        listener_id: &str,
    ) -> Result<OutputReceiver> {
        let (tx, rx) = tokio::sync::mpsc::channel(self.settings.listener_capacity.max(1));
        self.register_output_channel(kernel_id, listener_id, tx)?;
        Ok(rx)
    }

    /// Stop sending output to `listener_id`.
    pub fn unregister_output_channel(
        &self,
        kernel_id: &KernelId,
        listener_id: &str,
    ) -> Result<bool> {
        let kernel = self.lookup(kernel_id)?;
        let removed = kernel.listeners().unregister(listener_id);
        if removed {
            debug!(%kernel_id, listener_id, "output listener unregistered");
        }
        Ok(removed)
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn username_for<'a>(&'a self, user_id: &'a str) -> &'a str {
        if user_id.is_empty() {
            &self.settings.username
        } else {
            user_id
        }
    }

    async fn wait_ready(&self, kernel: &GatewayKernel) {
        let poll = async {
            loop {
                match self.client.get_kernel(kernel.id()).await {
                    Ok(model) => {
                        kernel.refresh(&model);
                        if matches!(
                            model.execution_state,
                            ExecutionState::Idle | ExecutionState::Busy
                        ) {
                            return model.execution_state;
                        }
                    }
                    Err(e) => debug!(kernel_id = %kernel.id(), error = %e, "status poll failed"),
                }
                tokio::time::sleep(self.settings.ready_poll_interval()).await;
            }
        };
        match tokio::time::timeout(self.settings.launch_timeout(), poll).await {
            Ok(state) => debug!(kernel_id = %kernel.id(), %state, "kernel ready"),
            Err(_) => warn!(
                kernel_id = %kernel.id(),
                timeout_ms = self.settings.launch_timeout_ms,
                "kernel not ready before launch timeout, connecting anyway"
            ),
        }
    }

    async fn connect(&self, kernel: &Arc<GatewayKernel>) -> Result<Arc<KernelConnection>> {
        let session = Session::new(self.username_for(kernel.user_id()));
        let span = info_span!("kernel", kernel_id = %kernel.id(), session_id = %session.id());
        let url = self.client.channels_url(kernel.id(), session.id());
        let config = WsConfig {
            connect_timeout: self.settings.connect_timeout(),
            keepalive_interval: self.settings.keepalive_interval(),
            headers: self.client.ws_headers().to_vec(),
        };

        let transport: Arc<dyn Transport> =
            Arc::new(WsTransport::connect(&url, &config, span.clone()).await?);
        let engine = Arc::new(ChannelEngine::start(
            Arc::clone(&transport),
            session,
            EngineConfig {
                channel_capacity: self.settings.channel_capacity,
                subscriber_capacity: self.settings.subscriber_capacity,
            },
            span.clone(),
        ));

        let subscriber = engine.subscribe(FORWARDER_ID);
        let conn = Arc::new(KernelConnection::new(transport, Arc::clone(&engine)));
        let handle = tokio::spawn(
            forward(
                Arc::downgrade(kernel),
                kernel.id().clone(),
                engine,
                subscriber,
                Arc::clone(kernel.listeners()),
            )
            .instrument(span),
        );
        conn.set_forwarder(handle);
        Ok(conn)
    }
}

/// Turn an engine failure into the error callers should see.
///
/// A connection that died under the request means the kernel is dead; a
/// stopped engine means a restart or stop raced the request.
fn engine_failure(
    kernel: &GatewayKernel,
    engine: &Arc<ChannelEngine>,
    err: EngineError,
) -> GatewayError {
    match err {
        EngineError::Disconnected { .. } | EngineError::Transport(_)
            if engine.is_disconnected() && !engine.is_stopped() =>
        {
            kernel.connection_lost(engine);
            GatewayError::KernelDead {
                kernel_id: kernel.id().clone(),
            }
        }
        EngineError::Stopped => GatewayError::EngineNotInitialized {
            kernel_id: kernel.id().clone(),
        },
        other => GatewayError::Engine(other),
    }
}
