//! In-process fake Jupyter gateway: kernel REST routes plus a channels
//! WebSocket that behaves like a tiny Python kernel.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use kgate_core::messages::{
    ErrorContent, ExecuteInput, ExecuteReply, ExecuteResult, InputRequest, InterruptReply,
    KernelInfoReply, ReplyStatus, ShutdownReply, StatusContent, StreamContent, StreamName,
};
use kgate_core::{Content, ExecutionState, Message, MsgType, Session};
use kgate_gateway::{GatewayClient, KernelManager};
use kgate_settings::{GatewaySettings, KernelSettings};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::broadcast;

pub const WAIT: Duration = Duration::from_secs(5);

struct KernelRecord {
    name: String,
    env: BTreeMap<String, String>,
    polls: u32,
    restarts: u32,
}

/// Shared state of the fake gateway; tests inspect it after the fact.
pub struct FakeGateway {
    kernels: Mutex<HashMap<String, KernelRecord>>,
    calls: Mutex<Vec<String>>,
    next_id: AtomicUsize,
    pub interrupts: AtomicUsize,
    pub refuse_ws: AtomicBool,
    pub last_ws_auth: Mutex<Option<String>>,
    kill: broadcast::Sender<()>,
}

impl FakeGateway {
    fn new() -> Self {
        let (kill, _) = broadcast::channel(4);
        Self {
            kernels: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(1),
            interrupts: AtomicUsize::new(0),
            refuse_ws: AtomicBool::new(false),
            last_ws_auth: Mutex::new(None),
            kill,
        }
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }

    /// Every REST/WS call seen, as `"METHOD path"`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn calls_matching(&self, prefix: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn kernel_count(&self) -> usize {
        self.kernels.lock().len()
    }

    pub fn kernel_env(&self, id: &str) -> Option<BTreeMap<String, String>> {
        self.kernels.lock().get(id).map(|k| k.env.clone())
    }

    pub fn restarts(&self, id: &str) -> u32 {
        self.kernels.lock().get(id).map_or(0, |k| k.restarts)
    }

    /// Drop every open channels socket, as if the kernel died.
    pub fn kill_connections(&self) {
        let _ = self.kill.send(());
    }

    /// Remove a kernel without telling anyone.
    pub fn forget(&self, id: &str) {
        let _ = self.kernels.lock().remove(id);
    }

    fn model(id: &str, record: &KernelRecord) -> Value {
        json!({
            "id": id,
            "name": record.name,
            "last_activity": chrono::Utc::now().to_rfc3339(),
            "execution_state": if record.polls == 0 { "starting" } else { "idle" },
            "connections": 0,
        })
    }
}

type Gw = State<Arc<FakeGateway>>;

async fn kernelspecs(State(gw): Gw) -> Json<Value> {
    gw.record("GET /api/kernelspecs".into());
    Json(json!({
        "default": "python3",
        "kernelspecs": {
            "python3": {
                "name": "python3",
                "spec": {"display_name": "Python 3", "language": "python", "argv": ["python3"]},
                "resources": {}
            }
        }
    }))
}

async fn list_kernels(State(gw): Gw) -> Json<Value> {
    gw.record("GET /api/kernels".into());
    let kernels = gw.kernels.lock();
    Json(Value::Array(
        kernels
            .iter()
            .map(|(id, k)| FakeGateway::model(id, k))
            .collect(),
    ))
}

async fn create_kernel(State(gw): Gw, Json(body): Json<Value>) -> Response {
    gw.record("POST /api/kernels".into());
    let id = format!("fake-{}", gw.next_id.fetch_add(1, Ordering::SeqCst));
    let env = body
        .get("env")
        .cloned()
        .and_then(|e| serde_json::from_value(e).ok())
        .unwrap_or_default();
    let record = KernelRecord {
        name: body["name"].as_str().unwrap_or("python3").to_owned(),
        env,
        polls: 0,
        restarts: 0,
    };
    let model = FakeGateway::model(&id, &record);
    let _ = gw.kernels.lock().insert(id, record);
    (StatusCode::CREATED, Json(model)).into_response()
}

async fn get_kernel(State(gw): Gw, Path(id): Path<String>) -> Response {
    gw.record(format!("GET /api/kernels/{id}"));
    let mut kernels = gw.kernels.lock();
    match kernels.get_mut(&id) {
        Some(record) => {
            let model = FakeGateway::model(&id, record);
            record.polls += 1;
            Json(model).into_response()
        }
        None => not_found(&id),
    }
}

async fn delete_kernel(State(gw): Gw, Path(id): Path<String>) -> Response {
    gw.record(format!("DELETE /api/kernels/{id}"));
    match gw.kernels.lock().remove(&id) {
        Some(_) => StatusCode::NO_CONTENT.into_response(),
        None => not_found(&id),
    }
}

async fn interrupt_kernel(State(gw): Gw, Path(id): Path<String>) -> Response {
    gw.record(format!("POST /api/kernels/{id}/interrupt"));
    if gw.kernels.lock().contains_key(&id) {
        StatusCode::NO_CONTENT.into_response()
    } else {
        not_found(&id)
    }
}

async fn restart_kernel(State(gw): Gw, Path(id): Path<String>) -> Response {
    gw.record(format!("POST /api/kernels/{id}/restart"));
    let mut kernels = gw.kernels.lock();
    match kernels.get_mut(&id) {
        Some(record) => {
            record.restarts += 1;
            record.polls = 1;
            Json(FakeGateway::model(&id, record)).into_response()
        }
        None => not_found(&id),
    }
}

fn not_found(id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"message": format!("Kernel does not exist: {id}")})),
    )
        .into_response()
}

async fn channels(
    ws: WebSocketUpgrade,
    Path(id): Path<String>,
    headers: HeaderMap,
    State(gw): Gw,
) -> Response {
    gw.record(format!("WS /api/kernels/{id}/channels"));
    *gw.last_ws_auth.lock() = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    if gw.refuse_ws.load(Ordering::SeqCst) || !gw.kernels.lock().contains_key(&id) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let kill = gw.kill.subscribe();
    ws.on_upgrade(move |socket| run_kernel(socket, gw, kill))
        .into_response()
}

async fn run_kernel(socket: WebSocket, gw: Arc<FakeGateway>, mut kill: broadcast::Receiver<()>) {
    let (mut tx, mut rx) = socket.split();
    let mut kernel = FakeKernel::default();
    loop {
        let frame = tokio::select! {
            _ = kill.recv() => break,
            frame = rx.next() => frame,
        };
        let text = match frame {
            Some(Ok(WsMessage::Text(text))) => text,
            Some(Ok(WsMessage::Close(_)) | Err(_)) | None => return,
            Some(Ok(_)) => continue,
        };
        let Ok(request) = Message::parse(text.as_str().as_bytes()) else {
            continue;
        };
        for msg in kernel.respond(&request, &gw) {
            let json = msg.to_json().unwrap();
            if tx.send(WsMessage::Text(json.into())).await.is_err() {
                return;
            }
        }
    }
    let _ = tx.send(WsMessage::Close(None)).await;
}

#[derive(Default)]
struct FakeKernel {
    session: Session,
    execution_count: u64,
    awaiting_input: Option<Message>,
}

impl FakeKernel {
    fn status(&self, parent: &Message, state: ExecutionState) -> Message {
        self.session.reply_to(
            parent,
            StatusContent {
                execution_state: state,
            },
        )
    }

    fn stream(&self, parent: &Message, text: String) -> Message {
        self.session.reply_to(
            parent,
            StreamContent {
                name: StreamName::Stdout,
                text,
            },
        )
    }

    fn finish(&self, parent: &Message, status: ReplyStatus) -> Vec<Message> {
        vec![
            self.session.reply_to(
                parent,
                ExecuteReply {
                    status,
                    execution_count: Some(self.execution_count),
                    ..ExecuteReply::default()
                },
            ),
            self.status(parent, ExecutionState::Idle),
        ]
    }

    fn respond(&mut self, req: &Message, gw: &FakeGateway) -> Vec<Message> {
        match (req.kind(), &req.content) {
            (Some(MsgType::ExecuteRequest), Content::ExecuteRequest(exec)) => {
                self.execute(req, exec.code.trim())
            }
            (Some(MsgType::InputReply), Content::InputReply(answer)) => {
                let Some(exec) = self.awaiting_input.take() else {
                    return Vec::new();
                };
                let mut out = vec![self.stream(&exec, format!("{}\n", answer.value))];
                out.extend(self.finish(&exec, ReplyStatus::Ok));
                out
            }
            (Some(MsgType::KernelInfoRequest), _) => vec![self.session.reply_to(
                req,
                KernelInfoReply {
                    protocol_version: "5.3".into(),
                    implementation: "fake".into(),
                    ..KernelInfoReply::default()
                },
            )],
            (Some(MsgType::InterruptRequest), _) => {
                let _ = gw.interrupts.fetch_add(1, Ordering::SeqCst);
                vec![self.session.reply_to(req, InterruptReply::default())]
            }
            (Some(MsgType::ShutdownRequest), _) => {
                vec![self.session.reply_to(req, ShutdownReply::default())]
            }
            _ => Vec::new(),
        }
    }

    fn execute(&mut self, req: &Message, code: &str) -> Vec<Message> {
        let mut out = vec![self.status(req, ExecutionState::Busy)];
        if code == "sleep" {
            return out;
        }
        self.execution_count += 1;
        out.push(self.session.reply_to(
            req,
            ExecuteInput {
                code: code.into(),
                execution_count: self.execution_count,
            },
        ));

        if code == "input()" {
            self.awaiting_input = Some(req.clone());
            out.push(self.session.reply_to(
                req,
                InputRequest {
                    prompt: "> ".into(),
                    password: false,
                },
            ));
            return out;
        }

        let mut status = ReplyStatus::Ok;
        if code == "1+1" {
            let mut data = serde_json::Map::new();
            let _ = data.insert("text/plain".into(), json!("2"));
            out.push(self.session.reply_to(
                req,
                ExecuteResult {
                    execution_count: self.execution_count,
                    data,
                    ..ExecuteResult::default()
                },
            ));
        } else if let Some(arg) = code
            .strip_prefix("print('")
            .and_then(|rest| rest.strip_suffix("')"))
        {
            out.push(self.stream(req, format!("{arg}\n")));
        } else if code.starts_with("raise") {
            status = ReplyStatus::Error;
            out.push(self.session.reply_to(
                req,
                ErrorContent {
                    ename: "ValueError".into(),
                    evalue: "boom".into(),
                    traceback: vec!["ValueError: boom".into()],
                },
            ));
        }
        out.extend(self.finish(req, status));
        out
    }
}

/// Start the fake gateway on an ephemeral port.
pub async fn spawn_gateway() -> (Arc<FakeGateway>, String) {
    let gw = Arc::new(FakeGateway::new());
    let router = Router::new()
        .route("/api/kernelspecs", get(kernelspecs))
        .route("/api/kernels", get(list_kernels).post(create_kernel))
        .route("/api/kernels/{id}", get(get_kernel).delete(delete_kernel))
        .route("/api/kernels/{id}/interrupt", post(interrupt_kernel))
        .route("/api/kernels/{id}/restart", post(restart_kernel))
        .route("/api/kernels/{id}/channels", get(channels))
        .with_state(Arc::clone(&gw));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    }));
    (gw, format!("http://{addr}"))
}

pub fn kernel_settings() -> KernelSettings {
    KernelSettings {
        launch_timeout_ms: 2_000,
        ready_poll_interval_ms: 10,
        connect_timeout_ms: 2_000,
        execute_timeout_ms: 5_000,
        ..KernelSettings::default()
    }
}

pub fn manager_for(base_url: &str, token: Option<&str>) -> KernelManager {
    let settings = GatewaySettings {
        base_url: base_url.to_owned(),
        auth_token: token.map(str::to_owned),
        ..GatewaySettings::default()
    };
    KernelManager::new(GatewayClient::new(&settings).unwrap(), kernel_settings())
}

/// Fake gateway plus a manager pointed at it.
pub async fn setup() -> (Arc<FakeGateway>, KernelManager) {
    let (gw, url) = spawn_gateway().await;
    (gw, manager_for(&url, None))
}
