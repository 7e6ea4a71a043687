//! Session registry and the per-session conversation handle.
//!
//! The registry tracks every session the client owns: its handler tables,
//! its event broadcast, and its send lock. [`CopilotSession`] is the
//! caller-facing handle; all of its collecting operations subscribe to the
//! session's event broadcast *before* sending, and hold the per-session
//! send lock so that concurrent sends on one session are serialized while
//! different sessions proceed in parallel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::time;
use tracing::{debug, trace, warn};

use crate::client::ClientCore;
use crate::config::DEFAULT_TOOL_TIMEOUT;
use crate::error::{CopilotError, Result};
use crate::events::{EventKind, SessionEvent};
use crate::handlers::{HookHandler, PermissionHandler, ToolHandler, UserInputHandler};
use crate::protocol::{
    Attachment, CurrentModelResult, GetMessagesResult, Message, SendParams, SendResult,
    SessionIdParams, SwitchModelParams, METHOD_MODEL_GET_CURRENT, METHOD_MODEL_SWITCH_TO,
    METHOD_SESSION_ABORT, METHOD_SESSION_DESTROY, METHOD_SESSION_GET_MESSAGES,
    METHOD_SESSION_SEND,
};

/// How long `destroy` waits for the server before giving up and marking
/// the record destroyed anyway.
const DESTROY_TIMEOUT: Duration = Duration::from_secs(5);

/// Immutable per-session state: handler tables and requested config.
/// Mutated only by registration (at creation) and destruction.
pub(crate) struct SessionRecord {
    destroyed: AtomicBool,
    tools: HashMap<String, Arc<dyn ToolHandler>>,
    permission: Option<Arc<dyn PermissionHandler>>,
    user_input: Option<Arc<dyn UserInputHandler>>,
    hooks: HashMap<String, Arc<dyn HookHandler>>,
    requested_model: Option<String>,
    tool_timeout: Duration,
}

impl SessionRecord {
    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    fn mark_destroyed(&self) {
        self.destroyed.store(true, Ordering::Release);
    }

    pub(crate) fn tool(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.tools.get(name).cloned()
    }

    pub(crate) fn permission_handler(&self) -> Option<Arc<dyn PermissionHandler>> {
        self.permission.clone()
    }

    pub(crate) fn user_input_handler(&self) -> Option<Arc<dyn UserInputHandler>> {
        self.user_input.clone()
    }

    pub(crate) fn hook(&self, kind: &str) -> Option<Arc<dyn HookHandler>> {
        self.hooks.get(kind).cloned()
    }

    pub(crate) fn requested_model(&self) -> Option<&str> {
        self.requested_model.as_deref()
    }

    pub(crate) fn tool_timeout(&self) -> Duration {
        self.tool_timeout
    }
}

/// Builder for [`SessionRecord`].
#[derive(Default)]
pub(crate) struct SessionRecordBuilder {
    tools: HashMap<String, Arc<dyn ToolHandler>>,
    permission: Option<Arc<dyn PermissionHandler>>,
    user_input: Option<Arc<dyn UserInputHandler>>,
    hooks: HashMap<String, Arc<dyn HookHandler>>,
    requested_model: Option<String>,
    tool_timeout: Option<Duration>,
}

impl SessionRecordBuilder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn tool(mut self, name: impl Into<String>, handler: Arc<dyn ToolHandler>) -> Self {
        self.tools.insert(name.into(), handler);
        self
    }

    pub(crate) fn permission_handler(mut self, handler: Arc<dyn PermissionHandler>) -> Self {
        self.permission = Some(handler);
        self
    }

    pub(crate) fn user_input_handler(mut self, handler: Arc<dyn UserInputHandler>) -> Self {
        self.user_input = Some(handler);
        self
    }

    pub(crate) fn hook(mut self, kind: impl Into<String>, handler: Arc<dyn HookHandler>) -> Self {
        self.hooks.insert(kind.into(), handler);
        self
    }

    pub(crate) fn requested_model(mut self, model: Option<String>) -> Self {
        self.requested_model = model;
        self
    }

    pub(crate) fn tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = Some(timeout);
        self
    }

    pub(crate) fn build(self) -> SessionRecord {
        SessionRecord {
            destroyed: AtomicBool::new(false),
            tools: self.tools,
            permission: self.permission,
            user_input: self.user_input,
            hooks: self.hooks,
            requested_model: self.requested_model,
            tool_timeout: self.tool_timeout.unwrap_or(DEFAULT_TOOL_TIMEOUT),
        }
    }
}

/// Per-session IO: the event broadcast and the send lock.
struct SessionIo {
    events: broadcast::Sender<SessionEvent>,
    send_lock: Arc<Mutex<()>>,
}

struct SessionEntry {
    record: Arc<SessionRecord>,
    /// Dropped when the session is destroyed, which closes every
    /// subscriber's receiver.
    io: Option<SessionIo>,
}

/// Tracks all sessions owned by one client.
pub(crate) struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionEntry>>,
    event_capacity: usize,
}

impl SessionRegistry {
    pub(crate) fn new(event_capacity: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            event_capacity,
        }
    }

    pub(crate) async fn insert(&self, session_id: String, record: SessionRecord) {
        let (events, _) = broadcast::channel(self.event_capacity);
        let entry = SessionEntry {
            record: Arc::new(record),
            io: Some(SessionIo {
                events,
                send_lock: Arc::new(Mutex::new(())),
            }),
        };
        let mut sessions = self.sessions.write().await;
        sessions.insert(session_id, entry);
    }

    pub(crate) async fn record(&self, session_id: &str) -> Option<Arc<SessionRecord>> {
        let sessions = self.sessions.read().await;
        sessions.get(session_id).map(|entry| Arc::clone(&entry.record))
    }

    pub(crate) async fn subscribe(
        &self,
        session_id: &str,
    ) -> Option<broadcast::Receiver<SessionEvent>> {
        let sessions = self.sessions.read().await;
        sessions
            .get(session_id)
            .and_then(|entry| entry.io.as_ref())
            .map(|io| io.events.subscribe())
    }

    pub(crate) async fn send_lock(&self, session_id: &str) -> Option<Arc<Mutex<()>>> {
        let sessions = self.sessions.read().await;
        sessions
            .get(session_id)
            .and_then(|entry| entry.io.as_ref())
            .map(|io| Arc::clone(&io.send_lock))
    }

    /// Publish an event on the session's broadcast. Returns false for
    /// unknown or destroyed sessions, whose events are dropped.
    pub(crate) async fn publish(&self, session_id: &str, event: SessionEvent) -> bool {
        let sessions = self.sessions.read().await;
        match sessions.get(session_id).and_then(|entry| entry.io.as_ref()) {
            Some(io) => {
                // A send error only means no subscriber is currently
                // listening, which is fine.
                let _ = io.events.send(event);
                true
            }
            None => false,
        }
    }

    pub(crate) async fn requested_model(&self, session_id: &str) -> Option<String> {
        let sessions = self.sessions.read().await;
        sessions
            .get(session_id)
            .and_then(|entry| entry.record.requested_model().map(|m| m.to_string()))
    }

    /// Mark a session destroyed and close its event broadcast.
    pub(crate) async fn mark_destroyed(&self, session_id: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(entry) = sessions.get_mut(session_id) {
            entry.record.mark_destroyed();
            entry.io = None;
        }
    }

    /// Remove a session entirely (explicit delete).
    pub(crate) async fn remove(&self, session_id: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(entry) = sessions.get_mut(session_id) {
            entry.record.mark_destroyed();
        }
        sessions.remove(session_id);
    }

    /// Ids of sessions that have not been destroyed yet.
    pub(crate) async fn live_ids(&self) -> Vec<String> {
        let sessions = self.sessions.read().await;
        sessions
            .iter()
            .filter(|(_, entry)| !entry.record.is_destroyed())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Destroy every record locally and drop the table.
    pub(crate) async fn clear(&self) {
        let mut sessions = self.sessions.write().await;
        for entry in sessions.values_mut() {
            entry.record.mark_destroyed();
            entry.io = None;
        }
        sessions.clear();
    }
}

/// Options for one prompt send.
#[derive(Debug, Clone)]
pub struct SendOptions {
    pub prompt: String,
    pub attachments: Option<Vec<Attachment>>,
    pub mode: Option<String>,
}

impl SendOptions {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            attachments: None,
            mode: None,
        }
    }

    pub fn attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = Some(attachments);
        self
    }

    pub fn mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = Some(mode.into());
        self
    }
}

impl From<&str> for SendOptions {
    fn from(prompt: &str) -> Self {
        Self::new(prompt)
    }
}

impl From<String> for SendOptions {
    fn from(prompt: String) -> Self {
        Self::new(prompt)
    }
}

/// An active conversation session on the CLI server.
///
/// Handles are cheap to clone; every clone refers to the same server-side
/// session. After [`destroy`](Self::destroy), all operations fail with
/// [`CopilotError::SessionDestroyed`] without touching the wire.
#[derive(Clone)]
pub struct CopilotSession {
    core: Arc<ClientCore>,
    session_id: String,
    workspace_path: Option<String>,
}

impl CopilotSession {
    pub(crate) fn new(
        core: Arc<ClientCore>,
        session_id: String,
        workspace_path: Option<String>,
    ) -> Self {
        Self {
            core,
            session_id,
            workspace_path,
        }
    }

    /// The server-assigned session id.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The workspace path the server allocated for this session, if any.
    pub fn workspace_path(&self) -> Option<&str> {
        self.workspace_path.as_deref()
    }

    async fn ensure_live(&self) -> Result<Arc<SessionRecord>> {
        match self.core.registry().record(&self.session_id).await {
            Some(record) if !record.is_destroyed() => Ok(record),
            _ => Err(CopilotError::SessionDestroyed(self.session_id.clone())),
        }
    }

    async fn acquire_send_lock(&self) -> Result<Arc<Mutex<()>>> {
        self.core
            .registry()
            .send_lock(&self.session_id)
            .await
            .ok_or_else(|| CopilotError::SessionDestroyed(self.session_id.clone()))
    }

    fn send_params(&self, options: &SendOptions) -> Result<Value> {
        let params = SendParams {
            session_id: self.session_id.clone(),
            prompt: options.prompt.clone(),
            attachments: options.attachments.clone(),
            mode: options.mode.clone(),
        };
        Ok(serde_json::to_value(params)?)
    }

    /// Fire-and-forget send. Returns the server-assigned message id without
    /// waiting for any events.
    pub async fn send(&self, options: impl Into<SendOptions>) -> Result<String> {
        let options = options.into();
        self.ensure_live().await?;
        let lock = self.acquire_send_lock().await?;
        let _guard = lock.lock().await;

        let rpc = self.core.rpc().await?;
        let result = rpc
            .request_value(
                METHOD_SESSION_SEND,
                Some(self.send_params(&options)?),
                self.core.request_timeout(),
            )
            .await?;
        let result: SendResult = serde_json::from_value(result)?;
        Ok(result.message_id)
    }

    /// Send a prompt and collect events until the turn ends, returning the
    /// *last* `assistant.message` envelope seen before `session.idle`
    /// (agentic turns produce several). Uses the client's configured send
    /// deadline.
    pub async fn send_and_wait(
        &self,
        options: impl Into<SendOptions>,
    ) -> Result<Option<SessionEvent>> {
        let timeout = self.core.send_timeout();
        self.send_and_wait_with_timeout(options, timeout).await
    }

    /// As [`send_and_wait`](Self::send_and_wait) with an explicit deadline.
    pub async fn send_and_wait_with_timeout(
        &self,
        options: impl Into<SendOptions>,
        timeout: Duration,
    ) -> Result<Option<SessionEvent>> {
        let options = options.into();
        let record = self.ensure_live().await?;
        let lock = self.acquire_send_lock().await?;
        let _guard = lock.lock().await;

        // Subscribe before sending so no event can slip past.
        let mut events = self
            .core
            .registry()
            .subscribe(&self.session_id)
            .await
            .ok_or_else(|| CopilotError::SessionDestroyed(self.session_id.clone()))?;

        let rpc = self.core.rpc().await?;
        rpc.request_value(
            METHOD_SESSION_SEND,
            Some(self.send_params(&options)?),
            self.core.request_timeout(),
        )
        .await?;

        let deadline = Instant::now() + timeout;
        let mut last_message: Option<SessionEvent> = None;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(CopilotError::Timeout(timeout));
            }

            let event = match time::timeout(remaining, events.recv()).await {
                Ok(Ok(event)) => event,
                Ok(Err(broadcast::error::RecvError::Lagged(missed))) => {
                    warn!(
                        "Session {} subscriber lagged, {missed} events dropped",
                        self.session_id
                    );
                    continue;
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return if record.is_destroyed() {
                        Err(CopilotError::SessionDestroyed(self.session_id.clone()))
                    } else {
                        Err(CopilotError::ConnectionClosed)
                    };
                }
                Err(_) => return Err(CopilotError::Timeout(timeout)),
            };

            match event.kind {
                EventKind::AssistantMessage => last_message = Some(event),
                EventKind::SessionIdle => return Ok(last_message),
                EventKind::SessionError => {
                    return Err(CopilotError::Session(event.error_message()))
                }
                _ => trace!("Ignoring event type: {}", event.kind.as_wire()),
            }
        }
    }

    /// Send a prompt and return a channel of the turn's events. The channel
    /// yields every event up to and including `session.idle` /
    /// `session.error`, after which the subscription and send lock are
    /// released.
    pub async fn send_async(
        &self,
        options: impl Into<SendOptions>,
    ) -> Result<mpsc::Receiver<SessionEvent>> {
        let options = options.into();
        self.ensure_live().await?;
        let lock = self.acquire_send_lock().await?;
        let guard = lock.lock_owned().await;

        let mut events = self
            .core
            .registry()
            .subscribe(&self.session_id)
            .await
            .ok_or_else(|| CopilotError::SessionDestroyed(self.session_id.clone()))?;

        let rpc = self.core.rpc().await?;
        // If the send itself fails, the guard and subscription drop here.
        rpc.request_value(
            METHOD_SESSION_SEND,
            Some(self.send_params(&options)?),
            self.core.request_timeout(),
        )
        .await?;

        let (tx, rx) = mpsc::channel(self.core.event_buffer());
        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            // The guard lives until the terminal event so a concurrent
            // send_and_wait cannot interleave with this turn.
            let _guard = guard;
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Session {session_id} subscriber lagged, {missed} events dropped");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let terminal = event.kind.is_terminal();
                if tx.send(event).await.is_err() {
                    // Consumer dropped the channel; stop forwarding.
                    break;
                }
                if terminal {
                    break;
                }
            }
        });

        Ok(rx)
    }

    /// Send a prompt and return the assistant's final text. The `<`-style
    /// cooperative variant of [`send_and_wait`](Self::send_and_wait).
    pub async fn ask(&self, prompt: impl Into<SendOptions>) -> Result<String> {
        self.ask_streaming(prompt, |_| {}).await
    }

    /// Sends a prompt and streams the response, calling `on_chunk` for each
    /// `assistant.message_delta` piece before returning the full text.
    pub async fn ask_streaming<F>(
        &self,
        prompt: impl Into<SendOptions>,
        mut on_chunk: F,
    ) -> Result<String>
    where
        F: FnMut(&str) + Send,
    {
        let mut receiver = self.send_async(prompt).await?;
        let timeout = self.core.send_timeout();
        let deadline = Instant::now() + timeout;

        let mut streamed = String::new();
        let mut last_message: Option<String> = None;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(CopilotError::Timeout(timeout));
            }

            let event = match time::timeout(remaining, receiver.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => return Err(CopilotError::ConnectionClosed),
                Err(_) => return Err(CopilotError::Timeout(timeout)),
            };

            match event.kind {
                EventKind::AssistantMessageDelta => {
                    if let Some(content) = event.content() {
                        if !content.is_empty() {
                            on_chunk(content);
                            streamed.push_str(content);
                        }
                    }
                }
                EventKind::AssistantMessage => {
                    last_message = event.content().map(|c| c.to_string());
                }
                EventKind::SessionIdle => {
                    // Deltas win when present; otherwise fall back to the
                    // last complete assistant message of the turn.
                    if !streamed.is_empty() {
                        return Ok(streamed);
                    }
                    return Ok(last_message.unwrap_or_default());
                }
                EventKind::SessionError => {
                    return Err(CopilotError::Session(event.error_message()))
                }
                _ => {}
            }
        }
    }

    /// Abort the in-flight turn, if any. Safe to call repeatedly.
    pub async fn abort(&self) -> Result<()> {
        self.ensure_live().await?;
        let rpc = self.core.rpc().await?;
        let params = serde_json::to_value(SessionIdParams {
            session_id: self.session_id.clone(),
        })?;
        rpc.request_value(
            METHOD_SESSION_ABORT,
            Some(params),
            self.core.request_timeout(),
        )
        .await?;
        Ok(())
    }

    /// Fetch the session's message history.
    pub async fn get_messages(&self) -> Result<Vec<Message>> {
        self.ensure_live().await?;
        let rpc = self.core.rpc().await?;
        let params = serde_json::to_value(SessionIdParams {
            session_id: self.session_id.clone(),
        })?;
        let result = rpc
            .request_value(
                METHOD_SESSION_GET_MESSAGES,
                Some(params),
                self.core.request_timeout(),
            )
            .await?;
        let result: GetMessagesResult = serde_json::from_value(result)?;
        Ok(result.messages)
    }

    /// The model currently serving this session.
    pub async fn current_model(&self) -> Result<String> {
        self.ensure_live().await?;
        let rpc = self.core.rpc().await?;
        let params = serde_json::to_value(SessionIdParams {
            session_id: self.session_id.clone(),
        })?;
        let result = rpc
            .request_value(
                METHOD_MODEL_GET_CURRENT,
                Some(params),
                self.core.request_timeout(),
            )
            .await?;
        let result: CurrentModelResult = serde_json::from_value(result)?;
        Ok(result.model)
    }

    /// Switch this session to another model.
    pub async fn switch_model(&self, model: impl Into<String>) -> Result<()> {
        self.ensure_live().await?;
        let rpc = self.core.rpc().await?;
        let params = serde_json::to_value(SwitchModelParams {
            session_id: self.session_id.clone(),
            model: model.into(),
        })?;
        rpc.request_value(
            METHOD_MODEL_SWITCH_TO,
            Some(params),
            self.core.request_timeout(),
        )
        .await?;
        Ok(())
    }

    /// Destroy the session. Attempts `session.destroy` with a short
    /// deadline, then marks the record destroyed and closes the event
    /// broadcast regardless of the server's answer.
    pub async fn destroy(&self) -> Result<()> {
        self.ensure_live().await?;

        if let Ok(rpc) = self.core.rpc().await {
            let params = serde_json::to_value(SessionIdParams {
                session_id: self.session_id.clone(),
            })?;
            if let Err(error) = rpc
                .request_value(METHOD_SESSION_DESTROY, Some(params), DESTROY_TIMEOUT)
                .await
            {
                warn!("session.destroy for {} failed: {error}", self.session_id);
            }
        }

        self.core.registry().mark_destroyed(&self.session_id).await;
        debug!("Session {} destroyed", self.session_id);
        Ok(())
    }
}
