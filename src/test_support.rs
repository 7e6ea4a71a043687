//! Scripted in-process CLI server for tests.
//!
//! Listens on a local TCP port and speaks the framed JSON-RPC protocol:
//! canned replies for the request surface, scripted per-turn event
//! sequences for `session.send`, and mid-turn server-initiated requests
//! (`tool.call`, `permission.request`) that wait for the client's reply
//! before the turn continues.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::framing;

/// One step of a scripted turn.
#[derive(Debug, Clone)]
pub(crate) enum Step {
    /// Emit a `session.event` notification with this event object.
    Event(Value),
    /// Send a server->client request (sessionId injected) and wait for the
    /// client's response before continuing the turn.
    Request { method: String, params: Value },
}

impl Step {
    pub(crate) fn event(kind: &str, data: Value) -> Self {
        Self::Event(json!({"type": kind, "data": data}))
    }

    pub(crate) fn message(content: &str) -> Self {
        Self::event("assistant.message", json!({"content": content}))
    }

    pub(crate) fn delta(content: &str) -> Self {
        Self::event("assistant.message_delta", json!({"content": content}))
    }

    pub(crate) fn idle() -> Self {
        Self::event("session.idle", json!({}))
    }

    pub(crate) fn error(message: &str) -> Self {
        Self::event("session.error", json!({"message": message}))
    }

    pub(crate) fn tool_call(tool_name: &str, arguments: Value) -> Self {
        Self::Request {
            method: "tool.call".into(),
            params: json!({
                "toolCallId": "tc-1",
                "toolName": tool_name,
                "arguments": arguments
            }),
        }
    }

    pub(crate) fn permission_request(request: Value) -> Self {
        Self::Request {
            method: "permission.request".into(),
            params: json!({ "permissionRequest": request }),
        }
    }
}

struct ServerState {
    protocol_version: u64,
    models: Vec<Value>,
    session_list: Vec<Value>,
    messages: Vec<Value>,
    turns: Mutex<VecDeque<Vec<Step>>>,
    requests: Mutex<Vec<Value>>,
    responses: Mutex<Vec<Value>>,
    injectors: Mutex<Vec<mpsc::UnboundedSender<Value>>>,
    conn_tokens: Mutex<Vec<CancellationToken>>,
    next_session: AtomicU64,
    next_server_id: AtomicU64,
    next_message: AtomicU64,
    connections: AtomicU64,
    current_model: Mutex<String>,
    last_session: Mutex<Option<String>>,
    foreground: Mutex<Option<String>>,
}

pub(crate) struct FakeCliBuilder {
    protocol_version: u64,
    models: Vec<Value>,
    session_list: Vec<Value>,
    messages: Vec<Value>,
    turns: VecDeque<Vec<Step>>,
}

impl FakeCliBuilder {
    pub(crate) fn protocol_version(mut self, version: u64) -> Self {
        self.protocol_version = version;
        self
    }

    pub(crate) fn models(mut self, models: Vec<Value>) -> Self {
        self.models = models;
        self
    }

    pub(crate) fn session_list(mut self, sessions: Vec<Value>) -> Self {
        self.session_list = sessions;
        self
    }

    pub(crate) fn messages(mut self, messages: Vec<Value>) -> Self {
        self.messages = messages;
        self
    }

    /// Queue the event script for the next `session.send`.
    pub(crate) fn turn(mut self, steps: Vec<Step>) -> Self {
        self.turns.push_back(steps);
        self
    }

    pub(crate) async fn spawn(self) -> FakeCli {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let state = Arc::new(ServerState {
            protocol_version: self.protocol_version,
            models: self.models,
            session_list: self.session_list,
            messages: self.messages,
            turns: Mutex::new(self.turns),
            requests: Mutex::new(Vec::new()),
            responses: Mutex::new(Vec::new()),
            injectors: Mutex::new(Vec::new()),
            conn_tokens: Mutex::new(Vec::new()),
            next_session: AtomicU64::new(1),
            next_server_id: AtomicU64::new(1000),
            next_message: AtomicU64::new(1),
            connections: AtomicU64::new(0),
            current_model: Mutex::new("m-default".into()),
            last_session: Mutex::new(None),
            foreground: Mutex::new(None),
        });

        let accept_state = Arc::clone(&state);
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                accept_state.connections.fetch_add(1, Ordering::SeqCst);
                let state = Arc::clone(&accept_state);
                tokio::spawn(serve_connection(stream, state));
            }
        });

        FakeCli {
            state,
            address: address.to_string(),
            accept_task,
        }
    }
}

pub(crate) struct FakeCli {
    state: Arc<ServerState>,
    address: String,
    accept_task: JoinHandle<()>,
}

impl FakeCli {
    pub(crate) fn builder() -> FakeCliBuilder {
        FakeCliBuilder {
            protocol_version: 2,
            models: vec![json!({"id": "m1", "name": "Model One"})],
            session_list: Vec::new(),
            messages: Vec::new(),
            turns: VecDeque::new(),
        }
    }

    /// Address in `HOST:PORT` form, usable as a `cli_url`.
    pub(crate) fn url(&self) -> String {
        self.address.clone()
    }

    /// Every request the client sent for `method`, in arrival order.
    pub(crate) fn requests(&self, method: &str) -> Vec<Value> {
        self.state
            .requests
            .lock()
            .unwrap()
            .iter()
            .filter(|request| request["method"] == method)
            .cloned()
            .collect()
    }

    /// Every response the client sent to server-initiated requests.
    pub(crate) fn responses(&self) -> Vec<Value> {
        self.state.responses.lock().unwrap().clone()
    }

    /// Push a raw notification to every live connection.
    pub(crate) fn notify(&self, method: &str, params: Value) {
        let message = json!({"jsonrpc": "2.0", "method": method, "params": params});
        let mut injectors = self.state.injectors.lock().unwrap();
        injectors.retain(|tx| tx.send(message.clone()).is_ok());
    }

    pub(crate) fn connection_count(&self) -> u64 {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Close every live connection server-side (simulates a lost server).
    pub(crate) fn drop_connections(&self) {
        let mut tokens = self.state.conn_tokens.lock().unwrap();
        for token in tokens.drain(..) {
            token.cancel();
        }
    }
}

impl Drop for FakeCli {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve_connection(stream: TcpStream, state: Arc<ServerState>) {
    let (read_half, mut write_half) = stream.into_split();

    let (frame_tx, mut frames) = mpsc::unbounded_channel::<Value>();
    tokio::spawn(async move {
        let mut reader = BufReader::new(read_half);
        while let Ok(Some(body)) = framing::read_frame(&mut reader).await {
            let Ok(value) = serde_json::from_slice::<Value>(&body) else {
                continue;
            };
            if frame_tx.send(value).is_err() {
                break;
            }
        }
    });

    let (inject_tx, mut injected) = mpsc::unbounded_channel::<Value>();
    state.injectors.lock().unwrap().push(inject_tx);
    let close_token = CancellationToken::new();
    state.conn_tokens.lock().unwrap().push(close_token.clone());

    // Per-session scripts currently running, and the server request ids a
    // script is parked on.
    let mut scripts: HashMap<String, VecDeque<Step>> = HashMap::new();
    let mut awaiting: HashMap<u64, String> = HashMap::new();

    loop {
        let message = tokio::select! {
            _ = close_token.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => Inbound::Frame(frame),
                None => break,
            },
            notification = injected.recv() => match notification {
                Some(notification) => Inbound::Inject(notification),
                None => break,
            },
        };

        match message {
            Inbound::Inject(notification) => {
                write_message(&mut write_half, &notification).await;
            }
            Inbound::Frame(frame) => {
                let has_method = frame.get("method").is_some();
                let id = frame.get("id").and_then(Value::as_u64);
                match (id, has_method) {
                    (Some(id), true) => {
                        handle_client_request(
                            &state,
                            &mut write_half,
                            &mut scripts,
                            &mut awaiting,
                            id,
                            frame,
                        )
                        .await;
                    }
                    (Some(id), false) => {
                        state.responses.lock().unwrap().push(frame);
                        if let Some(session_id) = awaiting.remove(&id) {
                            advance_script(
                                &state,
                                &mut write_half,
                                &mut scripts,
                                &mut awaiting,
                                &session_id,
                            )
                            .await;
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}

enum Inbound {
    Frame(Value),
    Inject(Value),
}

async fn write_message(writer: &mut tokio::net::tcp::OwnedWriteHalf, message: &Value) {
    let bytes = serde_json::to_vec(message).unwrap();
    let _ = framing::write_frame(writer, &bytes).await;
}

async fn handle_client_request(
    state: &Arc<ServerState>,
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
    scripts: &mut HashMap<String, VecDeque<Step>>,
    awaiting: &mut HashMap<u64, String>,
    id: u64,
    frame: Value,
) {
    state.requests.lock().unwrap().push(frame.clone());

    let method = frame["method"].as_str().unwrap_or_default().to_string();
    let params = frame.get("params").cloned().unwrap_or(Value::Null);

    let mut started_turn: Option<String> = None;
    let result = match method.as_str() {
        "ping" => json!({
            "protocolVersion": state.protocol_version,
            "message": params.get("message").cloned().unwrap_or(Value::Null)
        }),
        "session.create" => {
            let number = state.next_session.fetch_add(1, Ordering::SeqCst);
            let session_id = format!("s-{number}");
            if let Some(model) = params.get("model").and_then(Value::as_str) {
                *state.current_model.lock().unwrap() = model.to_string();
            }
            *state.last_session.lock().unwrap() = Some(session_id.clone());
            json!({
                "sessionId": session_id,
                "workspacePath": format!("/workspace/{session_id}")
            })
        }
        "session.resume" => {
            let session_id = params["sessionId"].as_str().unwrap_or("s-resumed");
            *state.last_session.lock().unwrap() = Some(session_id.to_string());
            json!({
                "sessionId": session_id,
                "workspacePath": format!("/workspace/{session_id}")
            })
        }
        "session.send" => {
            let session_id = params["sessionId"].as_str().unwrap_or_default().to_string();
            let number = state.next_message.fetch_add(1, Ordering::SeqCst);
            if let Some(steps) = state.turns.lock().unwrap().pop_front() {
                scripts.insert(session_id.clone(), steps.into_iter().collect());
                started_turn = Some(session_id);
            }
            json!({ "messageId": format!("m-{number}") })
        }
        "models.list" => json!({ "models": state.models }),
        "tools.list" => json!({ "tools": [] }),
        "status.get" => json!({ "status": "ok" }),
        "auth.getStatus" => json!({ "authenticated": true }),
        "account.getQuota" => json!({ "quota": { "chat": 100 } }),
        "session.getMessages" => json!({ "messages": state.messages }),
        "session.list" => json!({ "sessions": state.session_list }),
        "session.getLastId" => json!({
            "sessionId": state.last_session.lock().unwrap().clone()
        }),
        "session.getForeground" => json!({
            "sessionId": state.foreground.lock().unwrap().clone()
        }),
        "session.setForeground" => {
            *state.foreground.lock().unwrap() =
                params["sessionId"].as_str().map(|s| s.to_string());
            json!({})
        }
        "session.model.getCurrent" => json!({
            "model": state.current_model.lock().unwrap().clone()
        }),
        "session.model.switchTo" => {
            if let Some(model) = params["model"].as_str() {
                *state.current_model.lock().unwrap() = model.to_string();
            }
            json!({})
        }
        _ => json!({}),
    };

    write_message(
        writer,
        &json!({"jsonrpc": "2.0", "id": id, "result": result}),
    )
    .await;

    if let Some(session_id) = started_turn {
        advance_script(state, writer, scripts, awaiting, &session_id).await;
    }
}

/// Emit script steps until the turn parks on a server request or ends.
async fn advance_script(
    state: &Arc<ServerState>,
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
    scripts: &mut HashMap<String, VecDeque<Step>>,
    awaiting: &mut HashMap<u64, String>,
    session_id: &str,
) {
    loop {
        let step = match scripts.get_mut(session_id).and_then(VecDeque::pop_front) {
            Some(step) => step,
            None => {
                scripts.remove(session_id);
                return;
            }
        };

        match step {
            Step::Event(event) => {
                write_message(
                    writer,
                    &json!({
                        "jsonrpc": "2.0",
                        "method": "session.event",
                        "params": { "sessionId": session_id, "event": event }
                    }),
                )
                .await;
            }
            Step::Request { method, params } => {
                let server_id = state.next_server_id.fetch_add(1, Ordering::SeqCst);
                let mut params = params;
                if let Value::Object(map) = &mut params {
                    map.insert("sessionId".into(), Value::String(session_id.to_string()));
                }
                write_message(
                    writer,
                    &json!({
                        "jsonrpc": "2.0",
                        "id": server_id,
                        "method": method,
                        "params": params
                    }),
                )
                .await;
                awaiting.insert(server_id, session_id.to_string());
                return;
            }
        }
    }
}
