//! Channel protocol engine: one per live kernel connection.
//!
//! A single read loop owns the transport's inbound side. Each frame is
//! parsed, classified, given its side effect (reply correlation, execution
//! state, comm dispatch, input-request bookkeeping) and pushed onto the
//! internal queue of its channel. One fan-out worker per channel drains
//! that queue into every subscriber without blocking.

mod pending;
mod subscribers;

pub use subscribers::ChannelSubscriber;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kgate_core::messages::{
    CommInfoRequest, CompleteRequest, ExecuteRequest, HistoryRequest, InputReply, InspectRequest,
    IsCompleteRequest, ShutdownRequest,
};
use kgate_core::{
    Channel, Content, ExecutionState, Header, Message, MsgId, MsgType, RouteKind, Session,
};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, warn};

use crate::comm::{CommManager, CommOutbound};
use crate::errors::EngineError;
use crate::transport::Transport;
use pending::{Delivery, PendingGuard, PendingTable};
use subscribers::SubscriberRegistry;

/// Queue sizes for one engine.
#[derive(Clone, Copy, Debug)]
pub struct EngineConfig {
    /// Capacity of each internal per-channel queue.
    pub channel_capacity: usize,
    /// Capacity of each subscriber's per-channel queue.
    pub subscriber_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            subscriber_capacity: 256,
        }
    }
}

struct Inner {
    transport: Arc<dyn Transport>,
    session: Session,
    comm: CommManager,
    pending: PendingTable,
    subscribers: SubscriberRegistry,
    state: RwLock<ExecutionState>,
    last_activity: Mutex<DateTime<Utc>>,
    last_input_request: Mutex<Option<Header>>,
    stopped: Mutex<bool>,
    cancel: CancellationToken,
    disconnected: CancellationToken,
}

impl Inner {
    fn dispatch(&self, msg: &Message) {
        let route = msg.route();
        match route.kind {
            RouteKind::Reply => self.deliver_reply(msg),
            RouteKind::Status => {
                if let Some(state) = msg.execution_state() {
                    *self.state.write() = state;
                }
            }
            RouteKind::Comm => self.comm.handle_message(msg),
            RouteKind::InputRequest => {
                *self.last_input_request.lock() = Some(msg.header.clone());
            }
            RouteKind::Forward => {}
        }
    }

    fn deliver_reply(&self, msg: &Message) {
        let parent = msg.parent_msg_id().map(MsgId::as_str).unwrap_or_default();
        match self.pending.deliver(msg) {
            Delivery::Delivered => {}
            Delivery::Unknown => debug!(
                msg_type = %msg.msg_type(),
                parent_msg_id = parent,
                "reply for unknown request, dropping"
            ),
            Delivery::Duplicate => warn!(
                msg_type = %msg.msg_type(),
                parent_msg_id = parent,
                "duplicate reply for answered request, dropping"
            ),
            Delivery::Abandoned => debug!(
                msg_type = %msg.msg_type(),
                parent_msg_id = parent,
                "reply arrived after waiter left, dropping"
            ),
        }
    }

    fn is_stopped(&self) -> bool {
        *self.stopped.lock()
    }
}

/// Demultiplexer, correlator and fan-out for one kernel connection.
pub struct ChannelEngine {
    inner: Arc<Inner>,
    span: Span,
}

impl ChannelEngine {
    /// Start the engine's tasks on `transport`.
    ///
    /// Every spawned task is instrumented with `span`. Must be called from
    /// within a tokio runtime.
    pub fn start(
        transport: Arc<dyn Transport>,
        session: Session,
        config: EngineConfig,
        span: Span,
    ) -> Self {
        let (comm, comm_rx) = CommManager::new(session.clone());
        let capacity = config.channel_capacity.max(1);
        let mut receivers = Vec::with_capacity(Channel::ALL.len());
        let queues = Channel::ALL.map(|_| {
            let (tx, rx) = mpsc::channel(capacity);
            receivers.push(rx);
            tx
        });

        let inner = Arc::new(Inner {
            transport,
            session,
            comm,
            pending: PendingTable::default(),
            subscribers: SubscriberRegistry::new(config.subscriber_capacity),
            state: RwLock::new(ExecutionState::Starting),
            last_activity: Mutex::new(Utc::now()),
            last_input_request: Mutex::new(None),
            stopped: Mutex::new(false),
            cancel: CancellationToken::new(),
            disconnected: CancellationToken::new(),
        });

        let workers: Vec<_> = Channel::ALL
            .into_iter()
            .zip(receivers)
            .map(|(channel, rx)| {
                tokio::spawn(fan_out(Arc::clone(&inner), channel, rx).instrument(span.clone()))
            })
            .collect();
        drop(tokio::spawn(
            drain_comm(Arc::clone(&inner), comm_rx).instrument(span.clone()),
        ));
        drop(tokio::spawn(
            read_loop(Arc::clone(&inner), queues, workers).instrument(span.clone()),
        ));

        span.in_scope(|| debug!(session_id = %inner.session.id(), "channel engine started"));
        Self { inner, span }
    }

    // --- subscribers ---

    /// Register a listener on all four channels.
    ///
    /// Re-using an id replaces the previous subscriber.
    pub fn subscribe(&self, id: impl Into<String>) -> ChannelSubscriber {
        let sub = self.inner.subscribers.subscribe(id);
        debug!(parent: &self.span, subscriber_id = %sub.id(), "subscribed");
        sub
    }

    /// Remove a listener. No message reaches it after this returns.
    pub fn unsubscribe(&self, id: &str) -> bool {
        let removed = self.inner.subscribers.unsubscribe(id);
        if removed {
            debug!(parent: &self.span, subscriber_id = id, "unsubscribed");
        }
        removed
    }

    // --- low-level requests ---

    /// Send a prebuilt message and return its id without waiting.
    pub async fn request(&self, msg: Message) -> Result<MsgId, EngineError> {
        self.ensure_running()?;
        self.inner.transport.send(&msg).await?;
        debug!(
            parent: &self.span,
            msg_id = %msg.msg_id(),
            msg_type = %msg.msg_type(),
            "request sent"
        );
        Ok(msg.header.msg_id)
    }

    /// Send a prebuilt request and wait up to `timeout` for its reply.
    ///
    /// The pending entry is removed however the wait ends, including when
    /// the returned future is dropped.
    pub async fn request_sync(
        &self,
        msg: Message,
        timeout: Duration,
    ) -> Result<Message, EngineError> {
        self.ensure_running()?;
        let expected = msg
            .kind()
            .and_then(MsgType::reply_type)
            .ok_or_else(|| EngineError::NoReply {
                msg_type: msg.msg_type().to_owned(),
            })?;
        let msg_id = msg.msg_id().clone();

        let mut slot = self.inner.pending.register(&msg_id, expected)?;
        let _guard = PendingGuard::new(&self.inner.pending, msg_id.clone());
        // stop() and the read loop clear the table after flagging; re-check
        // so an entry registered after the clear is not left waiting.
        self.ensure_running()?;
        if self.inner.disconnected.is_cancelled() {
            return Err(EngineError::Disconnected { msg_id });
        }

        self.inner.transport.send(&msg).await?;
        debug!(
            parent: &self.span,
            msg_id = %msg_id,
            msg_type = %msg.msg_type(),
            "request sent, awaiting reply"
        );

        match tokio::time::timeout(timeout, slot.recv()).await {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) if self.inner.is_stopped() => Err(EngineError::Stopped),
            Ok(None) => Err(EngineError::Disconnected { msg_id }),
            Err(_) => {
                let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                debug!(parent: &self.span, msg_id = %msg_id, timeout_ms, "request timed out");
                Err(EngineError::Timeout {
                    msg_id,
                    msg_type: expected.as_str().to_owned(),
                    timeout_ms,
                })
            }
        }
    }

    fn build(&self, content: impl Into<Content>) -> Message {
        self.inner.session.message(content)
    }

    // --- request API ---

    /// Run `code`.
    pub async fn execute(&self, code: impl Into<String>) -> Result<MsgId, EngineError> {
        self.request(self.build(ExecuteRequest::new(code))).await
    }

    /// Run `code` and wait for its `execute_reply`.
    pub async fn execute_sync(
        &self,
        code: impl Into<String>,
        timeout: Duration,
    ) -> Result<Message, EngineError> {
        self.request_sync(self.build(ExecuteRequest::new(code)), timeout)
            .await
    }

    /// Ask for documentation of the object at `cursor_pos`.
    pub async fn inspect(
        &self,
        code: impl Into<String>,
        cursor_pos: usize,
        detail_level: u8,
    ) -> Result<MsgId, EngineError> {
        self.request(self.build(inspect_request(code, cursor_pos, detail_level)))
            .await
    }

    /// [`inspect`](Self::inspect), waiting for the reply.
    pub async fn inspect_sync(
        &self,
        code: impl Into<String>,
        cursor_pos: usize,
        detail_level: u8,
        timeout: Duration,
    ) -> Result<Message, EngineError> {
        self.request_sync(
            self.build(inspect_request(code, cursor_pos, detail_level)),
            timeout,
        )
        .await
    }

    /// Ask for completions at `cursor_pos`.
    pub async fn complete(
        &self,
        code: impl Into<String>,
        cursor_pos: usize,
    ) -> Result<MsgId, EngineError> {
        self.request(self.build(CompleteRequest {
            code: code.into(),
            cursor_pos,
        }))
        .await
    }

    /// [`complete`](Self::complete), waiting for the reply.
    pub async fn complete_sync(
        &self,
        code: impl Into<String>,
        cursor_pos: usize,
        timeout: Duration,
    ) -> Result<Message, EngineError> {
        let msg = self.build(CompleteRequest {
            code: code.into(),
            cursor_pos,
        });
        self.request_sync(msg, timeout).await
    }

    /// Query execution history.
    pub async fn history(&self, request: HistoryRequest) -> Result<MsgId, EngineError> {
        self.request(self.build(request)).await
    }

    /// [`history`](Self::history), waiting for the reply.
    pub async fn history_sync(
        &self,
        request: HistoryRequest,
        timeout: Duration,
    ) -> Result<Message, EngineError> {
        self.request_sync(self.build(request), timeout).await
    }

    /// Ask whether `code` is a complete statement.
    pub async fn is_complete(&self, code: impl Into<String>) -> Result<MsgId, EngineError> {
        self.request(self.build(IsCompleteRequest { code: code.into() }))
            .await
    }

    /// [`is_complete`](Self::is_complete), waiting for the reply.
    pub async fn is_complete_sync(
        &self,
        code: impl Into<String>,
        timeout: Duration,
    ) -> Result<Message, EngineError> {
        self.request_sync(self.build(IsCompleteRequest { code: code.into() }), timeout)
            .await
    }

    /// Request kernel info.
    pub async fn kernel_info(&self) -> Result<MsgId, EngineError> {
        self.request(self.build(Content::KernelInfoRequest)).await
    }

    /// [`kernel_info`](Self::kernel_info), waiting for the reply.
    pub async fn kernel_info_sync(&self, timeout: Duration) -> Result<Message, EngineError> {
        self.request_sync(self.build(Content::KernelInfoRequest), timeout)
            .await
    }

    /// List the kernel's open comms, optionally for one target.
    pub async fn comm_info(&self, target_name: Option<String>) -> Result<MsgId, EngineError> {
        self.request(self.build(CommInfoRequest { target_name }))
            .await
    }

    /// [`comm_info`](Self::comm_info), waiting for the reply.
    pub async fn comm_info_sync(
        &self,
        target_name: Option<String>,
        timeout: Duration,
    ) -> Result<Message, EngineError> {
        self.request_sync(self.build(CommInfoRequest { target_name }), timeout)
            .await
    }

    /// Ask the kernel to shut down (or restart in place).
    pub async fn shutdown(&self, restart: bool) -> Result<MsgId, EngineError> {
        self.request(self.build(ShutdownRequest { restart })).await
    }

    /// [`shutdown`](Self::shutdown), waiting for the reply.
    pub async fn shutdown_sync(
        &self,
        restart: bool,
        timeout: Duration,
    ) -> Result<Message, EngineError> {
        self.request_sync(self.build(ShutdownRequest { restart }), timeout)
            .await
    }

    /// Send `interrupt_request` on the control channel.
    pub async fn interrupt(&self) -> Result<MsgId, EngineError> {
        self.request(self.build(Content::InterruptRequest)).await
    }

    /// [`interrupt`](Self::interrupt), waiting for the reply.
    pub async fn interrupt_sync(&self, timeout: Duration) -> Result<Message, EngineError> {
        self.request_sync(self.build(Content::InterruptRequest), timeout)
            .await
    }

    /// Answer the most recent `input_request`.
    ///
    /// `input_reply` has no reply of its own, so there is no sync variant.
    pub async fn input_reply(&self, value: impl Into<String>) -> Result<MsgId, EngineError> {
        self.ensure_running()?;
        let parent = self
            .inner
            .last_input_request
            .lock()
            .take()
            .ok_or(EngineError::NoInputRequest)?;
        let content = Content::from(InputReply {
            value: value.into(),
        });
        let header = Header::new(content.msg_type_str(), &self.inner.session);
        self.request(Message::new(header, Some(parent), content))
            .await
    }

    // --- lifecycle ---

    /// Stop every task, close the comm manager and the transport.
    ///
    /// Only the first call does anything.
    pub async fn stop(&self) {
        {
            let mut stopped = self.inner.stopped.lock();
            if *stopped {
                return;
            }
            *stopped = true;
        }
        self.inner.cancel.cancel();
        self.inner.comm.close();
        let abandoned = self.inner.pending.clear();
        self.inner.subscribers.clear();
        self.inner.transport.close().await;
        info!(parent: &self.span, abandoned, "channel engine stopped");
    }

    /// Wait until the read loop has ended, by `stop()` or connection loss.
    ///
    /// After a connection loss this resolves only once everything read
    /// before the loss has been offered to the subscribers.
    pub async fn disconnected(&self) {
        self.inner.disconnected.cancelled().await;
    }

    /// Whether the read loop has ended.
    pub fn is_disconnected(&self) -> bool {
        self.inner.disconnected.is_cancelled()
    }

    /// Whether [`stop`](Self::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.inner.is_stopped()
    }

    fn ensure_running(&self) -> Result<(), EngineError> {
        if self.inner.is_stopped() {
            Err(EngineError::Stopped)
        } else {
            Ok(())
        }
    }

    // --- observability ---

    /// Last execution state reported by the kernel.
    pub fn execution_state(&self) -> ExecutionState {
        *self.inner.state.read()
    }

    /// When the last inbound message arrived.
    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.inner.last_activity.lock()
    }

    /// Header of the `input_request` awaiting an answer, if any.
    pub fn last_input_request(&self) -> Option<Header> {
        self.inner.last_input_request.lock().clone()
    }

    /// Registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    /// Sync requests still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// The comm manager bound to this connection.
    pub fn comm(&self) -> &CommManager {
        &self.inner.comm
    }

    /// Session stamped on outgoing messages.
    pub fn session(&self) -> &Session {
        &self.inner.session
    }
}

impl fmt::Debug for ChannelEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelEngine")
            .field("session_id", &self.inner.session.id())
            .field("execution_state", &self.execution_state())
            .field("subscribers", &self.subscriber_count())
            .field("stopped", &self.is_stopped())
            .field("disconnected", &self.is_disconnected())
            .finish_non_exhaustive()
    }
}

impl Drop for ChannelEngine {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

fn inspect_request(code: impl Into<String>, cursor_pos: usize, detail_level: u8) -> InspectRequest {
    InspectRequest {
        code: code.into(),
        cursor_pos,
        detail_level,
    }
}

async fn read_loop(
    inner: Arc<Inner>,
    queues: [mpsc::Sender<Arc<Message>>; 4],
    workers: Vec<JoinHandle<()>>,
) {
    loop {
        let frame = tokio::select! {
            () = inner.cancel.cancelled() => break,
            frame = inner.transport.receive() => frame,
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                if !inner.cancel.is_cancelled() {
                    warn!(error = %e, "kernel connection lost");
                }
                break;
            }
        };
        let msg = match Message::parse(&frame) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, len = frame.len(), "dropping malformed frame");
                continue;
            }
        };

        *inner.last_activity.lock() = Utc::now();
        inner.dispatch(&msg);

        let channel = msg.channel;
        let queue = &queues[channel.index()];
        tokio::select! {
            () = inner.cancel.cancelled() => break,
            sent = queue.send(Arc::new(msg)) => if sent.is_err() { break },
        }
    }

    // Closing the queues lets each worker broadcast what is still buffered
    // and exit.
    drop(queues);
    for worker in workers {
        let _ = worker.await;
    }

    inner.disconnected.cancel();
    let abandoned = inner.pending.clear();
    debug!(abandoned, "read loop exited");
}

async fn fan_out(inner: Arc<Inner>, channel: Channel, mut rx: mpsc::Receiver<Arc<Message>>) {
    loop {
        let msg = tokio::select! {
            () = inner.cancel.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        inner.subscribers.broadcast(channel, &msg);
    }
    debug!(%channel, "fan-out worker exited");
}

async fn drain_comm(inner: Arc<Inner>, mut rx: CommOutbound) {
    loop {
        let msg = tokio::select! {
            () = inner.cancel.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        if let Err(e) = inner.transport.send(&msg).await {
            debug!(msg_type = %msg.msg_type(), error = %e, "comm message not sent");
            if e.is_closed() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::EngineError;
    use crate::transport::{MemoryPeer, MemoryTransport};
    use assert_matches::assert_matches;
    use kgate_core::CommId;
    use kgate_core::logging::capture_logs;
    use kgate_core::messages::{
        CommOpen, ExecuteReply, InputRequest, KernelInfoReply, StatusContent, StreamContent,
        StreamName,
    };
    use serde_json::json;

    const LONG: Duration = Duration::from_secs(30);

    fn start() -> (ChannelEngine, MemoryPeer) {
        let (transport, peer) = MemoryTransport::pair();
        let engine = ChannelEngine::start(
            Arc::new(transport),
            Session::default(),
            EngineConfig::default(),
            Span::none(),
        );
        (engine, peer)
    }

    fn kernel() -> Session {
        Session::new("kernel")
    }

    fn status(state: ExecutionState) -> Message {
        kernel().message(StatusContent {
            execution_state: state,
        })
    }

    fn stdout(text: &str) -> Message {
        kernel().message(StreamContent {
            name: StreamName::Stdout,
            text: text.into(),
        })
    }

    #[tokio::test]
    async fn sync_reply_matches_request_id() {
        let (engine, mut peer) = start();
        let kernel_side = tokio::spawn(async move {
            let req = peer.recv().await.unwrap();
            assert_eq!(req.msg_type(), "kernel_info_request");
            // a reply for someone else first
            let stray = kernel().message(ExecuteRequest::new("x"));
            peer.push(&kernel().reply_to(&stray, KernelInfoReply::default()))
                .unwrap();
            let reply = KernelInfoReply {
                implementation: "ipython".into(),
                ..KernelInfoReply::default()
            };
            peer.push(&kernel().reply_to(&req, reply)).unwrap();
            (peer, req)
        });

        let reply = engine.kernel_info_sync(LONG).await.unwrap();
        let (_peer, req) = kernel_side.await.unwrap();
        assert_eq!(reply.parent_msg_id(), Some(req.msg_id()));
        assert_matches!(&reply.content, Content::KernelInfoReply(r) if r.implementation == "ipython");
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_distinct_and_leaves_no_entry() {
        let (engine, _peer) = start();
        let err = engine
            .execute_sync("while True: pass", Duration::from_millis(200))
            .await
            .unwrap_err();
        assert_matches!(&err, EngineError::Timeout { timeout_ms: 200, msg_type, .. } if msg_type == "execute_reply");
        assert!(err.is_timeout());
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_wait_cleans_up() {
        let (engine, mut peer) = start();
        let outer = tokio::time::timeout(Duration::from_millis(50), engine.execute_sync("1", LONG)).await;
        assert!(outer.is_err());
        assert!(peer.recv().await.is_some());
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn debug_output_shows_connection_state() {
        let (engine, _peer) = start();
        let _sub = engine.subscribe("s");
        let text = format!("{engine:?}");
        assert!(text.starts_with("ChannelEngine"));
        assert!(text.contains("subscribers: 1"));
        assert!(text.contains("stopped: false"));
    }

    #[tokio::test]
    async fn status_updates_execution_state() {
        let (engine, peer) = start();
        let mut sub = engine.subscribe("watcher");
        assert_eq!(engine.execution_state(), ExecutionState::Starting);

        peer.push(&status(ExecutionState::Busy)).unwrap();
        let _ = sub.recv(Channel::IoPub).await.unwrap();
        assert_eq!(engine.execution_state(), ExecutionState::Busy);

        peer.push(&status(ExecutionState::Idle)).unwrap();
        let _ = sub.recv(Channel::IoPub).await.unwrap();
        assert_eq!(engine.execution_state(), ExecutionState::Idle);
    }

    #[tokio::test]
    async fn unregistered_comm_target_rejected_but_still_visible() {
        let (engine, mut peer) = start();
        let mut sub = engine.subscribe("watcher");
        let open = kernel().message(CommOpen {
            comm_id: CommId::from("w1"),
            target_name: "jupyter.widget".into(),
            data: json!({}),
            target_module: None,
        });
        peer.push(&open).unwrap();

        let seen = sub.recv(Channel::IoPub).await.unwrap();
        assert_eq!(seen.msg_type(), "comm_open");

        let reject = peer.recv().await.unwrap();
        assert_matches!(&reject.content, Content::CommClose(c) if c.comm_id.as_str() == "w1");
        let extra = tokio::time::timeout(Duration::from_millis(50), peer.recv()).await;
        assert!(extra.is_err());
        assert!(engine.comm().is_empty());
    }

    #[tokio::test]
    async fn backend_comm_goes_out_on_transport() {
        let (engine, mut peer) = start();
        let comm = engine.comm().open("kgate.echo", json!({"v": 1})).unwrap();
        comm.send(json!({"n": 2})).unwrap();

        let open = peer.recv().await.unwrap();
        let msg = peer.recv().await.unwrap();
        assert_eq!(open.msg_type(), "comm_open");
        assert_eq!(msg.msg_type(), "comm_msg");
    }

    #[tokio::test]
    async fn unsubscribed_listener_gets_nothing() {
        let (engine, peer) = start();
        let mut gone = engine.subscribe("gone");
        let mut stays = engine.subscribe("stays");
        assert!(engine.unsubscribe("gone"));
        assert_eq!(engine.subscriber_count(), 1);

        peer.push(&stdout("hello")).unwrap();
        assert!(stays.recv(Channel::IoPub).await.is_some());
        assert!(gone.recv_any().await.is_none());
    }

    #[tokio::test]
    async fn double_stop_is_noop_and_requests_fail_cleanly() {
        let (engine, _peer) = start();
        let mut sub = engine.subscribe("s");
        engine.stop().await;
        engine.stop().await;

        assert!(engine.is_stopped());
        assert!(engine.comm().is_closed());
        assert!(sub.recv_any().await.is_none());
        assert_matches!(engine.execute("1").await, Err(EngineError::Stopped));
        assert_matches!(engine.kernel_info_sync(LONG).await, Err(EngineError::Stopped));
        engine.disconnected().await;
    }

    #[tokio::test]
    async fn stop_wakes_waiters() {
        let (engine, mut peer) = start();
        let engine = Arc::new(engine);
        let waiter = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.execute_sync("1", LONG).await })
        };
        let _ = peer.recv().await.unwrap();
        engine.stop().await;
        assert_matches!(waiter.await.unwrap(), Err(EngineError::Stopped));
    }

    #[tokio::test]
    async fn peer_loss_fails_waiters_with_disconnected() {
        let (engine, mut peer) = start();
        let engine = Arc::new(engine);
        let waiter = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.execute_sync("1", LONG).await })
        };
        let _ = peer.recv().await.unwrap();
        peer.disconnect();

        assert_matches!(waiter.await.unwrap(), Err(EngineError::Disconnected { .. }));
        engine.disconnected().await;
        assert!(engine.is_disconnected());
        assert!(!engine.is_stopped());
        assert_matches!(
            engine.execute_sync("2", LONG).await,
            Err(EngineError::Disconnected { .. })
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn output_before_loss_is_queued_when_disconnected_resolves() {
        for i in 0..100 {
            let (engine, mut peer) = start();
            let mut sub = engine.subscribe("s");
            peer.push(&stdout(&i.to_string())).unwrap();
            peer.disconnect();

            engine.disconnected().await;
            let msg = sub.try_recv(Channel::IoPub).expect("output lost on disconnect");
            assert_matches!(&msg.content, Content::Stream(s) if s.text == i.to_string());
        }
    }

    #[tokio::test]
    async fn unknown_type_forwarded_on_iopub() {
        let (engine, peer) = start();
        let mut sub = engine.subscribe("s");
        let frame = json!({
            "header": {
                "msg_id": "v1", "username": "k", "session": "s",
                "date": "2024-01-01T00:00:00Z", "msg_type": "x_vendor_event", "version": "5.3"
            },
            "parent_header": {},
            "metadata": {},
            "content": {"anything": true},
        });
        assert!(peer.push_raw(frame.to_string()));

        let msg = sub.recv(Channel::IoPub).await.unwrap();
        assert_matches!(&msg.content, Content::Unknown { msg_type, .. } if msg_type == "x_vendor_event");
    }

    #[tokio::test]
    async fn malformed_frame_does_not_stop_the_loop() {
        let (logs, _guard) = capture_logs();
        let (engine, peer) = start();
        let mut sub = engine.subscribe("s");

        assert!(peer.push_raw("{not json"));
        peer.push(&stdout("still alive")).unwrap();

        let msg = sub.recv(Channel::IoPub).await.unwrap();
        assert_eq!(msg.msg_type(), "stream");
        assert!(logs.has_message("dropping malformed frame"));
        assert!(!engine.is_disconnected());
    }

    #[tokio::test]
    async fn input_reply_parented_to_last_request() {
        let (engine, mut peer) = start();
        let mut sub = engine.subscribe("s");
        assert_matches!(engine.input_reply("x").await, Err(EngineError::NoInputRequest));

        let exec = Session::default().message(ExecuteRequest::new("input()"));
        let ask = kernel().reply_to(
            &exec,
            InputRequest {
                prompt: "name? ".into(),
                password: false,
            },
        );
        peer.push(&ask).unwrap();
        let seen = sub.recv(Channel::Stdin).await.unwrap();
        assert_eq!(seen.msg_id(), ask.msg_id());

        let _ = engine.input_reply("ada").await.unwrap();
        let answer = peer.recv().await.unwrap();
        assert_eq!(answer.parent_msg_id(), Some(ask.msg_id()));
        assert_eq!(answer.channel, Channel::Stdin);
        assert_matches!(engine.input_reply("again").await, Err(EngineError::NoInputRequest));
    }

    #[tokio::test]
    async fn per_channel_order_is_preserved() {
        let (engine, peer) = start();
        let mut sub = engine.subscribe("s");
        for i in 0..50 {
            peer.push(&stdout(&i.to_string())).unwrap();
        }
        for i in 0..50 {
            let msg = sub.recv(Channel::IoPub).await.unwrap();
            assert_matches!(&msg.content, Content::Stream(s) if s.text == i.to_string());
        }
    }

    #[tokio::test]
    async fn late_reply_after_timeout_is_forwarded_not_delivered() {
        let (engine, mut peer) = start();
        let mut sub = engine.subscribe("s");
        let err = engine
            .execute_sync("1", Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        let req = peer.recv().await.unwrap();
        peer.push(&kernel().reply_to(&req, ExecuteReply::default()))
            .unwrap();
        let msg = sub.recv(Channel::Shell).await.unwrap();
        assert_eq!(msg.parent_msg_id(), Some(req.msg_id()));
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn messages_without_reply_cannot_be_awaited() {
        let (engine, _peer) = start();
        let msg = Session::default().message(StatusContent::default());
        assert_matches!(
            engine.request_sync(msg, LONG).await,
            Err(EngineError::NoReply { msg_type }) if msg_type == "status"
        );
    }
}
