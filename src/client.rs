//! Client façade: connection lifecycle, handshake, auto-restart, and the
//! top-level RPC surface.
//!
//! One [`CopilotClient`] owns one live connection to the CLI at a time:
//! either a managed child process (stdio or announced TCP port) or an
//! external server reached via `cli_url`. `start` performs the handshake
//! race (first of ping reply, child exit, or deadline wins) and `stop`
//! tears everything down, collecting per-step errors instead of aborting
//! cleanup.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, SessionConfig};
use crate::error::{CopilotError, Result};
use crate::events::LifecycleEvent;
use crate::handlers::SessionRequestDispatcher;
use crate::process::{wait_for_port_announcement, CliProcess, ExitState, SpawnOptions};
use crate::protocol::{
    CreateSessionResult, JsonRpcNotification, ListModelsResult, ListSessionsParams,
    ListSessionsResult, ModelInfo, PingParams, PingResult, SessionSummary, METHOD_ACCOUNT_GET_QUOTA,
    METHOD_AUTH_GET_STATUS, METHOD_MODELS_LIST, METHOD_PING, METHOD_SESSION_CREATE,
    METHOD_SESSION_DELETE, METHOD_SESSION_DESTROY, METHOD_SESSION_GET_FOREGROUND,
    METHOD_SESSION_GET_LAST_ID, METHOD_SESSION_LIST, METHOD_SESSION_RESUME,
    METHOD_SESSION_SET_FOREGROUND, METHOD_STATUS_GET, METHOD_TOOLS_LIST, PROTOCOL_VERSION,
};
use crate::router::{spawn_router, LifecycleRegistry, LifecycleSubscription};
use crate::rpc::RpcClient;
use crate::session::{CopilotSession, SessionRecordBuilder, SessionRegistry};
use crate::transport::{parse_cli_url, CliAddress, Transport};

/// Deadline for the polite `session.destroy` calls issued during `stop`.
const STOP_DESTROY_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection status of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[derive(Default)]
struct ConnectionState {
    rpc: Option<Arc<RpcClient>>,
    process: Option<Arc<CliProcess>>,
    router: Option<JoinHandle<()>>,
    /// Bumped on every connect/teardown so stale monitors cannot trigger
    /// a restart against a newer connection.
    generation: u64,
}

/// Shared client internals; sessions hold an `Arc` of this.
pub(crate) struct ClientCore {
    config: ClientConfig,
    state: Mutex<ConnectionState>,
    status: std::sync::RwLock<ClientStatus>,
    registry: Arc<SessionRegistry>,
    lifecycle: Arc<LifecycleRegistry>,
    restarting: AtomicBool,
    stopping: AtomicBool,
    models: Mutex<Option<Vec<ModelInfo>>>,
    other_notifications: std::sync::Mutex<Option<mpsc::Receiver<JsonRpcNotification>>>,
}

impl ClientCore {
    pub(crate) fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub(crate) async fn rpc(&self) -> Result<Arc<RpcClient>> {
        let state = self.state.lock().await;
        match &state.rpc {
            Some(rpc) if rpc.is_connected() => Ok(Arc::clone(rpc)),
            _ => Err(CopilotError::ConnectionClosed),
        }
    }

    pub(crate) fn request_timeout(&self) -> Duration {
        self.config.request_timeout
    }

    pub(crate) fn send_timeout(&self) -> Duration {
        self.config.send_timeout
    }

    pub(crate) fn event_buffer(&self) -> usize {
        self.config.event_buffer
    }

    fn set_status(&self, status: ClientStatus) {
        let mut cell = self
            .status
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *cell = status;
    }

    fn status(&self) -> ClientStatus {
        *self
            .status
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Client for a Copilot CLI server.
///
/// Create with [`CopilotClient::new`], then [`start`](Self::start) to
/// connect. Sessions are created with
/// [`create_session`](Self::create_session) and remain valid until
/// destroyed or the client stops.
#[derive(Clone)]
pub struct CopilotClient {
    core: Arc<ClientCore>,
}

impl CopilotClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            core: Arc::new(ClientCore {
                registry: Arc::new(SessionRegistry::new(config.event_buffer)),
                config,
                state: Mutex::new(ConnectionState::default()),
                status: std::sync::RwLock::new(ClientStatus::Disconnected),
                lifecycle: Arc::new(LifecycleRegistry::default()),
                restarting: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                models: Mutex::new(None),
                other_notifications: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Current connection status.
    pub fn status(&self) -> ClientStatus {
        self.core.status()
    }

    /// Connect to the CLI: spawn the child if managed, open the transport,
    /// and run the handshake race. Not safe to call concurrently with
    /// [`stop`](Self::stop) from user code.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.core.state.lock().await;
        if state.rpc.is_some() {
            return Err(CopilotError::startup("client is already started"));
        }
        self.core.set_status(ClientStatus::Connecting);

        match connect(&self.core, &mut state).await {
            Ok(()) => {
                self.core.set_status(ClientStatus::Connected);
                info!("Copilot CLI connected");
                Ok(())
            }
            Err(error) => {
                teardown(&mut state, true).await;
                self.core.set_status(ClientStatus::Error);
                Err(error)
            }
        }
    }

    /// Graceful, idempotent shutdown. Destroys every live session
    /// (collecting errors rather than raising), closes the transport,
    /// which unblocks the reader and fails the pending requests, and asks
    /// the child to exit. Returns every error encountered along the way.
    pub async fn stop(&self) -> Vec<CopilotError> {
        self.shutdown(false).await
    }

    /// As [`stop`](Self::stop) but skips the polite per-session destroy
    /// requests and kills the child immediately.
    pub async fn force_stop(&self) -> Vec<CopilotError> {
        self.shutdown(true).await
    }

    async fn shutdown(&self, force: bool) -> Vec<CopilotError> {
        let core = &self.core;
        core.stopping.store(true, Ordering::Release);
        let mut errors = Vec::new();

        let mut state = core.state.lock().await;
        if state.rpc.is_none() && state.process.is_none() {
            core.set_status(ClientStatus::Disconnected);
            core.stopping.store(false, Ordering::Release);
            return errors;
        }

        if !force {
            if let Some(rpc) = state.rpc.clone() {
                for session_id in core.registry.live_ids().await {
                    let params = json!({ "sessionId": session_id });
                    if let Err(error) = rpc
                        .request_value(METHOD_SESSION_DESTROY, Some(params), STOP_DESTROY_TIMEOUT)
                        .await
                    {
                        errors.push(error);
                    }
                    core.registry.mark_destroyed(&session_id).await;
                }
            }
        }
        core.registry.clear().await;

        teardown(&mut state, force).await;
        core.lifecycle.clear();
        *core.models.lock().await = None;
        core.other_notifications
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        core.set_status(ClientStatus::Disconnected);
        drop(state);
        core.stopping.store(false, Ordering::Release);
        errors
    }

    /// Round-trip a ping through the server.
    pub async fn ping(&self, message: Option<String>) -> Result<PingResult> {
        let rpc = self.core.rpc().await?;
        let params = serde_json::to_value(PingParams { message })?;
        let value = rpc
            .request_value(METHOD_PING, Some(params), self.core.request_timeout())
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Server status (`status.get`), returned verbatim.
    pub async fn server_status(&self) -> Result<Value> {
        self.raw_request(METHOD_STATUS_GET, None).await
    }

    /// Authentication status (`auth.getStatus`), returned verbatim.
    pub async fn auth_status(&self) -> Result<Value> {
        self.raw_request(METHOD_AUTH_GET_STATUS, None).await
    }

    /// Account quota (`account.getQuota`), returned verbatim.
    pub async fn quota(&self) -> Result<Value> {
        self.raw_request(METHOD_ACCOUNT_GET_QUOTA, None).await
    }

    /// Tools available server-side, optionally for a specific model.
    pub async fn list_tools(&self, model: Option<&str>) -> Result<Value> {
        let params = model.map(|model| json!({ "model": model }));
        self.raw_request(METHOD_TOOLS_LIST, params).await
    }

    /// List the models the server offers. The first caller fetches;
    /// concurrent callers wait on the same in-flight fetch; the result is
    /// cached until [`stop`](Self::stop).
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let mut cache = self.core.models.lock().await;
        if let Some(models) = cache.as_ref() {
            return Ok(models.clone());
        }
        let rpc = self.core.rpc().await?;
        let value = rpc
            .request_value(METHOD_MODELS_LIST, None, self.core.request_timeout())
            .await?;
        let result: ListModelsResult = serde_json::from_value(value)?;
        *cache = Some(result.models.clone());
        Ok(result.models)
    }

    /// Create a new session from a validated [`SessionConfig`].
    pub async fn create_session(&self, config: SessionConfig) -> Result<CopilotSession> {
        let wire = config.to_wire()?;
        self.open_session(METHOD_SESSION_CREATE, wire, config).await
    }

    /// Resume a server-side session by id, reattaching local handlers.
    pub async fn resume_session(
        &self,
        session_id: impl Into<String>,
        config: SessionConfig,
    ) -> Result<CopilotSession> {
        let mut wire = config.to_wire()?;
        if let Value::Object(params) = &mut wire {
            params.insert("sessionId".into(), Value::String(session_id.into()));
        }
        self.open_session(METHOD_SESSION_RESUME, wire, config).await
    }

    async fn open_session(
        &self,
        method: &str,
        wire: Value,
        config: SessionConfig,
    ) -> Result<CopilotSession> {
        let rpc = self.core.rpc().await?;
        let value = rpc
            .request_value(method, Some(wire), self.core.request_timeout())
            .await?;
        let result: CreateSessionResult = serde_json::from_value(value)?;

        let mut record = SessionRecordBuilder::new()
            .requested_model(config.model.clone())
            .tool_timeout(config.tool_timeout.unwrap_or(self.core.config.tool_timeout));
        for tool in &config.tools {
            record = record.tool(tool.name.clone(), Arc::clone(&tool.handler));
        }
        if let Some(handler) = &config.permission_handler {
            record = record.permission_handler(Arc::clone(handler));
        }
        if let Some(handler) = &config.user_input_handler {
            record = record.user_input_handler(Arc::clone(handler));
        }
        for (kind, handler) in &config.hooks {
            record = record.hook(kind.clone(), Arc::clone(handler));
        }

        self.core
            .registry
            .insert(result.session_id.clone(), record.build())
            .await;
        debug!("Session created: {}", result.session_id);

        Ok(CopilotSession::new(
            Arc::clone(&self.core),
            result.session_id,
            result.workspace_path,
        ))
    }

    /// List server-side sessions, optionally filtered. The filter is sent
    /// on the wire and also applied client-side for servers that return
    /// unfiltered lists.
    pub async fn list_sessions(
        &self,
        filter: Option<SessionFilter>,
    ) -> Result<Vec<SessionSummary>> {
        let params = serde_json::to_value(ListSessionsParams {
            filter: filter.as_ref().map(SessionFilter::to_map),
        })?;
        let value = self.raw_request(METHOD_SESSION_LIST, Some(params)).await?;
        let result: ListSessionsResult = serde_json::from_value(value)?;
        let sessions = match &filter {
            Some(filter) => result
                .sessions
                .into_iter()
                .filter(|summary| filter.matches(summary))
                .collect(),
            None => result.sessions,
        };
        Ok(sessions)
    }

    /// Delete a server-side session and drop its local record.
    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        self.raw_request(
            METHOD_SESSION_DELETE,
            Some(json!({ "sessionId": session_id })),
        )
        .await?;
        self.core.registry.remove(session_id).await;
        Ok(())
    }

    /// Id of the most recently active server-side session, if any.
    pub async fn last_session_id(&self) -> Result<Option<String>> {
        let value = self.raw_request(METHOD_SESSION_GET_LAST_ID, None).await?;
        Ok(extract_session_id(&value))
    }

    /// The server's current foreground session, if any.
    pub async fn foreground_session(&self) -> Result<Option<String>> {
        let value = self.raw_request(METHOD_SESSION_GET_FOREGROUND, None).await?;
        Ok(extract_session_id(&value))
    }

    /// Make a session the server's foreground session.
    pub async fn set_foreground_session(&self, session_id: &str) -> Result<()> {
        self.raw_request(
            METHOD_SESSION_SET_FOREGROUND,
            Some(json!({ "sessionId": session_id })),
        )
        .await?;
        Ok(())
    }

    /// Register a lifecycle handler, optionally for one event type only.
    /// The returned subscription unsubscribes the handler.
    pub fn on_lifecycle<F>(&self, filter: Option<&str>, handler: F) -> LifecycleSubscription
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.core
            .lifecycle
            .register(filter.map(|f| f.to_string()), Arc::new(handler))
    }

    /// Take the queue of notifications that are neither session events nor
    /// lifecycle broadcasts. Available once per connection.
    pub fn take_other_notifications(&self) -> Option<mpsc::Receiver<JsonRpcNotification>> {
        self.core
            .other_notifications
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    async fn raw_request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let rpc = self.core.rpc().await?;
        rpc.request_value(method, params, self.core.request_timeout())
            .await
    }
}

/// Filter for [`CopilotClient::list_sessions`].
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub repository: Option<String>,
}

impl SessionFilter {
    pub fn repository(repository: impl Into<String>) -> Self {
        Self {
            repository: Some(repository.into()),
        }
    }

    fn to_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        if let Some(repository) = &self.repository {
            map.insert("repository".into(), repository.clone());
        }
        map
    }

    fn matches(&self, summary: &SessionSummary) -> bool {
        match &self.repository {
            None => true,
            Some(repository) => summary
                .context
                .as_ref()
                .and_then(|context| context.get("repository"))
                .and_then(Value::as_str)
                .map(|value| value == repository)
                .unwrap_or(false),
        }
    }
}

fn extract_session_id(value: &Value) -> Option<String> {
    value
        .get("sessionId")
        .and_then(Value::as_str)
        .map(|s| s.to_string())
}

fn resolve_binary(config: &ClientConfig) -> Result<PathBuf> {
    if let Some(path) = &config.cli_path {
        return Ok(path.clone());
    }
    if let Ok(path) = std::env::var("COPILOT_CLI_PATH") {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    which::which("copilot").map_err(|_| {
        CopilotError::startup(
            "could not find `copilot` on PATH; set cli_path or COPILOT_CLI_PATH",
        )
    })
}

fn build_env(config: &ClientConfig) -> HashMap<String, String> {
    let mut env = config.env.clone();
    if config.use_logged_in_user {
        debug!("Using the CLI's logged-in user credentials");
    } else if let Some(token) = &config.github_token {
        env.insert("GITHUB_TOKEN".into(), token.clone());
    }
    env
}

/// Open the transport and run the handshake; on success the new connection
/// is installed into `state` and its monitors are spawned.
async fn connect(core: &Arc<ClientCore>, state: &mut ConnectionState) -> Result<()> {
    let config = &core.config;

    let (transport, process) = if let Some(url) = &config.cli_url {
        let address = parse_cli_url(url)?;
        let transport = Transport::tcp(&address).await.map_err(|error| {
            CopilotError::startup(format!("could not connect to {url}: {error}"))
        })?;
        (transport, None)
    } else {
        let binary = resolve_binary(config)?;
        let mut args = config.cli_args.clone();
        args.push("--server".into());
        if config.use_stdio {
            args.push("--stdio".into());
        }

        let mut process = CliProcess::spawn(SpawnOptions {
            binary,
            args,
            env: build_env(config),
            working_dir: config.working_dir.clone(),
        })?;

        if config.use_stdio {
            let (stdout, stdin) = process.take_stdio()?;
            (Transport::stdio(stdout, stdin), Some(Arc::new(process)))
        } else {
            let stdout = process.take_stdout()?;
            let announced = wait_for_port_announcement(
                stdout,
                process.exit_watch(),
                config.startup_timeout,
                || process.stderr_tail(),
            )
            .await;
            let port = match announced {
                Ok(port) => port,
                Err(error) => {
                    process.terminate_forced().await;
                    return Err(error);
                }
            };
            let address = CliAddress {
                host: "127.0.0.1".into(),
                port,
            };
            match Transport::tcp(&address).await {
                Ok(transport) => (transport, Some(Arc::new(process))),
                Err(error) => {
                    process.terminate_forced().await;
                    return Err(error);
                }
            }
        }
    };

    let (notification_tx, notification_rx) = mpsc::channel(config.notification_queue);
    let (other_tx, other_rx) = mpsc::channel(config.other_notification_queue);
    let dispatcher = Arc::new(SessionRequestDispatcher::new(Arc::clone(&core.registry)));
    let rpc = RpcClient::spawn(transport, dispatcher, notification_tx, config.writer_queue);
    let router = spawn_router(
        notification_rx,
        Arc::clone(&core.registry),
        Arc::clone(&core.lifecycle),
        other_tx,
    );

    if let Err(error) = handshake(core, &rpc, process.as_ref()).await {
        rpc.close();
        if let Some(process) = &process {
            process.terminate_forced().await;
        }
        return Err(error);
    }

    *core
        .other_notifications
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(other_rx);

    state.generation += 1;
    let generation = state.generation;
    state.rpc = Some(Arc::clone(&rpc));
    state.process = process.clone();
    state.router = Some(router);

    spawn_connection_monitor(Arc::clone(core), rpc, process, generation);
    Ok(())
}

/// Handshake racing: first-to-complete among ping reply, child exit, and
/// the startup deadline decides the outcome.
async fn handshake(
    core: &Arc<ClientCore>,
    rpc: &Arc<RpcClient>,
    process: Option<&Arc<CliProcess>>,
) -> Result<()> {
    if let Some(process) = process {
        if let ExitState::Exited(_) = process.exit_state() {
            return Err(startup_failure(Some(process), "CLI exited before handshake").await);
        }
    }

    let params = serde_json::to_value(PingParams {
        message: Some("init".into()),
    })?;
    let (_, response) = match rpc.request(METHOD_PING, Some(params)).await {
        Ok(pair) => pair,
        Err(_) => {
            return Err(startup_failure(process, "connection closed during handshake").await);
        }
    };

    let child_exit = async {
        match process {
            Some(process) => {
                let mut exit_rx = process.exit_watch();
                loop {
                    if matches!(*exit_rx.borrow(), ExitState::Exited(_)) {
                        return;
                    }
                    if exit_rx.changed().await.is_err() {
                        return;
                    }
                }
            }
            None => std::future::pending().await,
        }
    };

    let response = tokio::select! {
        biased;
        response = response => response,
        _ = child_exit => {
            return Err(startup_failure(process, "CLI exited before handshake").await);
        }
        _ = tokio::time::sleep(core.config.startup_timeout) => {
            return Err(CopilotError::Startup {
                message: format!(
                    "handshake timed out after {:?}",
                    core.config.startup_timeout
                ),
                stderr: process.map(|p| p.stderr_tail()),
            });
        }
    };

    let value = match response {
        Ok(Ok(value)) => value,
        Ok(Err(CopilotError::ConnectionClosed)) | Err(_) => {
            return Err(startup_failure(process, "connection closed during handshake").await);
        }
        Ok(Err(error)) => {
            return Err(CopilotError::Startup {
                message: format!("handshake failed: {error}"),
                stderr: process.map(|p| p.stderr_tail()),
            })
        }
    };

    let ping: PingResult = serde_json::from_value(value)?;
    match ping.protocol_version {
        Some(PROTOCOL_VERSION) => Ok(()),
        actual => Err(CopilotError::ProtocolVersionMismatch {
            expected: PROTOCOL_VERSION,
            actual,
        }),
    }
}

/// Build the startup error for a handshake that died under us. When a
/// managed child exited, wait briefly for its exit code and stderr tail so
/// the diagnostic carries both.
async fn startup_failure(process: Option<&Arc<CliProcess>>, fallback: &str) -> CopilotError {
    let Some(process) = process else {
        return CopilotError::startup(fallback);
    };

    let mut exit_rx = process.exit_watch();
    let exited = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let ExitState::Exited(code) = *exit_rx.borrow() {
                return code;
            }
            if exit_rx.changed().await.is_err() {
                return None;
            }
        }
    })
    .await;

    let Ok(code) = exited else {
        return CopilotError::Startup {
            message: fallback.to_string(),
            stderr: Some(process.stderr_tail()),
        };
    };

    // The stderr task races the exit; poll briefly so the tail is there.
    let mut tail = process.stderr_tail();
    for _ in 0..20 {
        if !tail.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
        tail = process.stderr_tail();
    }

    CopilotError::Startup {
        message: format!(
            "CLI exited{} before handshake",
            code.map(|c| format!(" with code {c}")).unwrap_or_default()
        ),
        stderr: Some(tail),
    }
}

/// Watch for connection loss (reader gone) or child exit and trigger the
/// auto-restart worker when enabled.
fn spawn_connection_monitor(
    core: Arc<ClientCore>,
    rpc: Arc<RpcClient>,
    process: Option<Arc<CliProcess>>,
    generation: u64,
) {
    tokio::spawn(async move {
        let connection_closed = rpc.closed();
        let child_exit = async {
            match &process {
                Some(process) => {
                    let mut exit_rx = process.exit_watch();
                    loop {
                        if matches!(*exit_rx.borrow(), ExitState::Exited(_)) {
                            return;
                        }
                        if exit_rx.changed().await.is_err() {
                            return;
                        }
                    }
                }
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = connection_closed => debug!("Connection closed (generation {generation})"),
            _ = child_exit => debug!("Copilot CLI exited (generation {generation})"),
        }

        maybe_auto_restart(core, generation).await;
    });
}

async fn maybe_auto_restart(core: Arc<ClientCore>, generation: u64) {
    if core.stopping.load(Ordering::Acquire) {
        debug!("Connection ended while stopping; no restart");
        return;
    }
    if !core.config.auto_restart {
        return;
    }
    {
        let state = core.state.lock().await;
        if state.generation != generation {
            return;
        }
    }
    if core.status() != ClientStatus::Connected {
        return;
    }
    if core
        .restarting
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }

    warn!("Copilot CLI connection lost, restarting");
    let client = CopilotClient {
        core: Arc::clone(&core),
    };
    tokio::spawn(async move {
        let errors = client.stop().await;
        for error in &errors {
            debug!("Error during restart stop: {error}");
        }
        if let Err(error) = client.start().await {
            warn!("Auto-restart failed: {error}");
        }
        core.restarting.store(false, Ordering::Release);
    });
}

/// Drop the connection objects out of `state`, closing the transport and
/// terminating the child.
async fn teardown(state: &mut ConnectionState, force: bool) {
    state.generation += 1;

    if let Some(rpc) = state.rpc.take() {
        rpc.close();
    }
    if let Some(router) = state.router.take() {
        // The router drains and exits once the reader drops the
        // notification sender; don't wait forever for it.
        if tokio::time::timeout(Duration::from_secs(2), router).await.is_err() {
            debug!("Router did not stop in time");
        }
    }
    if let Some(process) = state.process.take() {
        if force {
            process.terminate_forced().await;
        } else {
            process.terminate_graceful().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::error::CopilotError;
    use crate::events::EventKind;
    use crate::handlers::{approve_all, tool_fn};
    use crate::test_support::{FakeCli, Step};
    use serde_json::json;
    use tokio::time::sleep;

    async fn connected_client(fake: &FakeCli) -> CopilotClient {
        let config = ClientConfig::builder()
            .cli_url(fake.url())
            .auto_restart(false)
            .build()
            .unwrap();
        let client = CopilotClient::new(config);
        client.start().await.unwrap();
        client
    }

    #[tokio::test]
    async fn basic_turn_returns_the_assistant_message() {
        let fake = FakeCli::builder()
            .turn(vec![Step::message("hello"), Step::idle()])
            .spawn()
            .await;
        let client = connected_client(&fake).await;

        let session = client
            .create_session(SessionConfig::builder().model("m1").build().unwrap())
            .await
            .unwrap();
        assert_eq!(session.session_id(), "s-1");
        assert_eq!(session.workspace_path(), Some("/workspace/s-1"));

        let event = session.send_and_wait("hi").await.unwrap().unwrap();
        assert_eq!(event.kind, EventKind::AssistantMessage);
        assert_eq!(event.content(), Some("hello"));

        let send = &fake.requests("session.send")[0];
        assert_eq!(send["params"]["sessionId"], "s-1");
        assert_eq!(send["params"]["prompt"], "hi");

        // Fire-and-forget returns the message id without waiting on events.
        let message_id = session.send("and another thing").await.unwrap();
        assert_eq!(message_id, "m-2");

        client.stop().await;
    }

    #[tokio::test]
    async fn session_create_wire_payload_advertises_request_channels() {
        let fake = FakeCli::builder().spawn().await;
        let client = connected_client(&fake).await;

        client
            .create_session(SessionConfig::builder().model("m1").build().unwrap())
            .await
            .unwrap();

        let create = &fake.requests("session.create")[0];
        assert_eq!(create["params"]["model"], "m1");
        assert_eq!(create["params"]["requestPermission"], true);
        assert_eq!(create["params"]["requestUserInput"], true);
        assert_eq!(create["params"]["hooks"], false);
        assert_eq!(create["params"]["envValueMode"], "direct");

        client.stop().await;
    }

    #[tokio::test]
    async fn agentic_turn_returns_the_last_assistant_message() {
        let fake = FakeCli::builder()
            .turn(vec![
                Step::message(""),
                Step::event("tool.execution_start", json!({"toolName": "grep"})),
                Step::event("tool.execution_complete", json!({"toolName": "grep"})),
                Step::message("thinking"),
                Step::event("tool.execution_start", json!({"toolName": "read"})),
                Step::event("tool.execution_complete", json!({"toolName": "read"})),
                Step::message("final answer"),
                Step::idle(),
            ])
            .spawn()
            .await;
        let client = connected_client(&fake).await;

        let session = client
            .create_session(SessionConfig::builder().model("m1").build().unwrap())
            .await
            .unwrap();
        let event = session.send_and_wait("go").await.unwrap().unwrap();
        assert_eq!(event.content(), Some("final answer"));

        client.stop().await;
    }

    #[tokio::test]
    async fn tool_call_is_answered_with_the_nested_wrapper() {
        let fake = FakeCli::builder()
            .turn(vec![
                Step::tool_call("echo", json!({"x": 1})),
                Step::message("done"),
                Step::idle(),
            ])
            .spawn()
            .await;
        let client = connected_client(&fake).await;

        let config = SessionConfig::builder()
            .model("m1")
            .tool(
                "echo",
                "echoes arguments",
                None,
                tool_fn(|arguments| async move { Ok(arguments) }),
            )
            .build()
            .unwrap();
        let session = client.create_session(config).await.unwrap();

        let event = session.send_and_wait("use the tool").await.unwrap().unwrap();
        assert_eq!(event.content(), Some("done"));

        let responses = fake.responses();
        assert_eq!(responses.len(), 1);
        let result = &responses[0]["result"]["result"];
        assert_eq!(result["textResultForLlm"], "{\"x\":1}");
        assert_eq!(result["resultType"], "success");
        assert_eq!(result["toolTelemetry"], json!({}));

        client.stop().await;
    }

    #[tokio::test]
    async fn permission_requests_are_denied_by_default() {
        let fake = FakeCli::builder()
            .turn(vec![
                Step::permission_request(json!({"kind": "shell"})),
                Step::message("ok"),
                Step::idle(),
            ])
            .spawn()
            .await;
        let client = connected_client(&fake).await;

        let session = client
            .create_session(SessionConfig::builder().model("m1").build().unwrap())
            .await
            .unwrap();
        session.send_and_wait("try something").await.unwrap();

        let responses = fake.responses();
        assert_eq!(
            responses[0]["result"]["kind"],
            "denied-no-approval-rule-and-could-not-request-from-user"
        );

        client.stop().await;
    }

    #[tokio::test]
    async fn approve_all_handler_approves_every_permission_request() {
        let fake = FakeCli::builder()
            .turn(vec![
                Step::permission_request(json!({"kind": "shell"})),
                Step::permission_request(json!({"kind": "write"})),
                Step::message("ok"),
                Step::idle(),
            ])
            .spawn()
            .await;
        let client = connected_client(&fake).await;

        let config = SessionConfig::builder()
            .model("m1")
            .permission_handler(approve_all())
            .build()
            .unwrap();
        let session = client.create_session(config).await.unwrap();
        session.send_and_wait("go").await.unwrap();

        let responses = fake.responses();
        assert_eq!(responses.len(), 2);
        for response in &responses {
            assert_eq!(response["result"]["kind"], "approved");
        }

        client.stop().await;
    }

    #[tokio::test]
    async fn startup_failure_embeds_exit_code_and_stderr() {
        let config = ClientConfig::builder()
            .cli_path("/bin/sh")
            .cli_args(["-c", "echo bad flag >&2; exit 2"])
            .auto_restart(false)
            .build()
            .unwrap();
        let client = CopilotClient::new(config);

        match client.start().await {
            Err(CopilotError::Startup { message, stderr }) => {
                assert!(message.contains("code 2"), "message: {message}");
                assert!(
                    stderr.as_deref().unwrap_or_default().contains("bad flag"),
                    "stderr: {stderr:?}"
                );
            }
            other => panic!("expected startup error, got {other:?}"),
        }
        assert_eq!(client.status(), ClientStatus::Error);
    }

    #[tokio::test]
    async fn protocol_version_mismatch_is_fatal() {
        let fake = FakeCli::builder().protocol_version(1).spawn().await;
        let config = ClientConfig::builder()
            .cli_url(fake.url())
            .auto_restart(false)
            .build()
            .unwrap();
        let client = CopilotClient::new(config);

        match client.start().await {
            Err(CopilotError::ProtocolVersionMismatch { expected, actual }) => {
                assert_eq!(expected, 2);
                assert_eq!(actual, Some(1));
            }
            other => panic!("expected version mismatch, got {other:?}"),
        }
        assert_eq!(client.status(), ClientStatus::Error);
    }

    #[tokio::test]
    async fn starting_twice_is_an_error() {
        let fake = FakeCli::builder().spawn().await;
        let client = connected_client(&fake).await;
        assert!(client.start().await.is_err());
        client.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_destroys_sessions() {
        let fake = FakeCli::builder().spawn().await;
        let client = connected_client(&fake).await;

        let session = client
            .create_session(SessionConfig::builder().model("m1").build().unwrap())
            .await
            .unwrap();

        let errors = client.stop().await;
        assert!(errors.is_empty(), "stop errors: {errors:?}");
        assert_eq!(client.status(), ClientStatus::Disconnected);
        assert_eq!(fake.requests("session.destroy").len(), 1);

        // Idempotent second stop.
        assert!(client.stop().await.is_empty());

        // Operations on the session now fail locally.
        assert!(matches!(
            session.send("hi").await,
            Err(CopilotError::SessionDestroyed(_))
        ));

        // list_models cache was cleared with everything else.
        assert!(matches!(
            client.list_models().await,
            Err(CopilotError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn destroyed_session_does_no_rpc() {
        let fake = FakeCli::builder().spawn().await;
        let client = connected_client(&fake).await;

        let session = client
            .create_session(SessionConfig::builder().model("m1").build().unwrap())
            .await
            .unwrap();
        session.destroy().await.unwrap();
        assert_eq!(fake.requests("session.destroy").len(), 1);

        assert!(matches!(
            session.send("hi").await,
            Err(CopilotError::SessionDestroyed(_))
        ));
        assert!(matches!(
            session.abort().await,
            Err(CopilotError::SessionDestroyed(_))
        ));
        assert!(matches!(
            session.get_messages().await,
            Err(CopilotError::SessionDestroyed(_))
        ));
        assert!(matches!(
            session.destroy().await,
            Err(CopilotError::SessionDestroyed(_))
        ));

        // No RPC left the client for any of the failed operations.
        assert!(fake.requests("session.send").is_empty());
        assert!(fake.requests("session.abort").is_empty());
        assert_eq!(fake.requests("session.destroy").len(), 1);

        client.stop().await;
    }

    #[tokio::test]
    async fn concurrent_sends_on_one_session_are_serialized() {
        let fake = FakeCli::builder()
            .turn(vec![Step::message("one"), Step::idle()])
            .turn(vec![Step::message("two"), Step::idle()])
            .spawn()
            .await;
        let client = connected_client(&fake).await;

        let session = client
            .create_session(SessionConfig::builder().model("m1").build().unwrap())
            .await
            .unwrap();

        let first = session.clone();
        let task_a = tokio::spawn(async move { first.send_and_wait("first").await });
        sleep(Duration::from_millis(50)).await;
        let second = session.clone();
        let task_b = tokio::spawn(async move { second.send_and_wait("second").await });

        let a = task_a.await.unwrap().unwrap().unwrap();
        let b = task_b.await.unwrap().unwrap().unwrap();
        assert_eq!(a.content(), Some("one"));
        assert_eq!(b.content(), Some("two"));

        client.stop().await;
    }

    #[tokio::test]
    async fn sends_on_different_sessions_run_in_parallel() {
        // Session A's turn parks on a tool call whose handler only
        // completes after session B's whole turn has finished. If sends
        // were serialized across sessions this would deadlock.
        let fake = FakeCli::builder()
            .turn(vec![
                Step::tool_call("unblock", json!({})),
                Step::message("A"),
                Step::idle(),
            ])
            .turn(vec![Step::message("B"), Step::idle()])
            .spawn()
            .await;
        let client = connected_client(&fake).await;

        let gate = Arc::new(tokio::sync::Notify::new());
        let opened = Arc::clone(&gate);
        let config_a = SessionConfig::builder()
            .model("m1")
            .tool(
                "unblock",
                "waits for the gate",
                None,
                tool_fn(move |_| {
                    let opened = Arc::clone(&opened);
                    async move {
                        opened.notified().await;
                        Ok(json!("released"))
                    }
                }),
            )
            .build()
            .unwrap();
        let session_a = client.create_session(config_a).await.unwrap();
        let session_b = client
            .create_session(SessionConfig::builder().model("m1").build().unwrap())
            .await
            .unwrap();

        let waiting_a = tokio::spawn(async move { session_a.send_and_wait("start A").await });
        sleep(Duration::from_millis(100)).await;

        let b = session_b.send_and_wait("start B").await.unwrap().unwrap();
        assert_eq!(b.content(), Some("B"));
        gate.notify_one();

        let a = waiting_a.await.unwrap().unwrap().unwrap();
        assert_eq!(a.content(), Some("A"));

        client.stop().await;
    }

    #[tokio::test]
    async fn send_and_wait_times_out_and_surfaces_session_errors() {
        let fake = FakeCli::builder()
            // First turn never reaches idle; second turn reports an error.
            .turn(vec![Step::message("stuck")])
            .turn(vec![Step::error("boom")])
            .spawn()
            .await;
        let client = connected_client(&fake).await;

        let session = client
            .create_session(SessionConfig::builder().model("m1").build().unwrap())
            .await
            .unwrap();

        let result = session
            .send_and_wait_with_timeout("hang", Duration::from_millis(200))
            .await;
        assert!(matches!(result, Err(CopilotError::Timeout(_))));

        match session.send_and_wait("fail").await {
            Err(CopilotError::Session(message)) => assert_eq!(message, "boom"),
            other => panic!("expected session error, got {other:?}"),
        }

        client.stop().await;
    }

    #[tokio::test]
    async fn send_async_streams_the_turn_and_closes_after_idle() {
        let fake = FakeCli::builder()
            .turn(vec![
                Step::delta("he"),
                Step::delta("llo"),
                Step::message("hello"),
                Step::idle(),
            ])
            .spawn()
            .await;
        let client = connected_client(&fake).await;

        let session = client
            .create_session(SessionConfig::builder().model("m1").build().unwrap())
            .await
            .unwrap();

        let mut events = session.send_async("hi").await.unwrap();
        let mut kinds = Vec::new();
        while let Some(event) = events.recv().await {
            kinds.push(event.kind.clone());
        }
        assert_eq!(
            kinds,
            vec![
                EventKind::AssistantMessageDelta,
                EventKind::AssistantMessageDelta,
                EventKind::AssistantMessage,
                EventKind::SessionIdle,
            ]
        );

        client.stop().await;
    }

    #[tokio::test]
    async fn ask_streaming_returns_deltas_and_invokes_the_chunk_callback() {
        let fake = FakeCli::builder()
            .turn(vec![
                Step::delta("he"),
                Step::delta("llo"),
                Step::message("hello"),
                Step::idle(),
            ])
            .turn(vec![Step::message("no deltas here"), Step::idle()])
            .spawn()
            .await;
        let client = connected_client(&fake).await;

        let session = client
            .create_session(SessionConfig::builder().model("m1").build().unwrap())
            .await
            .unwrap();

        let mut chunks = Vec::new();
        let text = session
            .ask_streaming("hi", |chunk| chunks.push(chunk.to_string()))
            .await
            .unwrap();
        assert_eq!(text, "hello");
        assert_eq!(chunks, vec!["he".to_string(), "llo".to_string()]);

        // Without deltas, ask falls back to the last assistant message.
        let text = session.ask("again").await.unwrap();
        assert_eq!(text, "no deltas here");

        client.stop().await;
    }

    #[tokio::test]
    async fn list_models_fetches_once_and_caches() {
        let fake = FakeCli::builder()
            .models(vec![json!({"id": "m1"}), json!({"id": "m2"})])
            .spawn()
            .await;
        let client = connected_client(&fake).await;

        let (a, b) = tokio::join!(client.list_models(), client.list_models());
        let a = a.unwrap();
        let b = b.unwrap();
        assert_eq!(a.len(), 2);
        assert_eq!(a[0].id, "m1");
        assert_eq!(b[1].id, "m2");

        let c = client.list_models().await.unwrap();
        assert_eq!(c.len(), 2);

        // One fetch served all three calls.
        assert_eq!(fake.requests("models.list").len(), 1);

        client.stop().await;
    }

    #[tokio::test]
    async fn list_sessions_applies_the_repository_filter() {
        let fake = FakeCli::builder()
            .session_list(vec![
                json!({"sessionId": "s-a", "context": {"repository": "o/a"}}),
                json!({"sessionId": "s-b", "context": {"repository": "o/b"}}),
            ])
            .spawn()
            .await;
        let client = connected_client(&fake).await;

        let all = client.list_sessions(None).await.unwrap();
        assert_eq!(all.len(), 2);

        let filtered = client
            .list_sessions(Some(SessionFilter::repository("o/a")))
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].session_id, "s-a");

        client.stop().await;
    }

    #[tokio::test]
    async fn model_wrappers_round_trip() {
        let fake = FakeCli::builder().spawn().await;
        let client = connected_client(&fake).await;

        let session = client
            .create_session(SessionConfig::builder().model("m1").build().unwrap())
            .await
            .unwrap();
        assert_eq!(session.current_model().await.unwrap(), "m1");
        session.switch_model("m2").await.unwrap();
        assert_eq!(session.current_model().await.unwrap(), "m2");

        client.stop().await;
    }

    #[tokio::test]
    async fn resume_session_reattaches_by_id() {
        let fake = FakeCli::builder().spawn().await;
        let client = connected_client(&fake).await;

        let session = client
            .resume_session("s-9", SessionConfig::builder().model("m1").build().unwrap())
            .await
            .unwrap();
        assert_eq!(session.session_id(), "s-9");
        assert_eq!(
            fake.requests("session.resume")[0]["params"]["sessionId"],
            "s-9"
        );

        client.stop().await;
    }

    #[tokio::test]
    async fn session_helpers_and_raw_surfaces_work() {
        let fake = FakeCli::builder()
            .messages(vec![
                json!({"role": "user", "content": "hi"}),
                json!({"role": "assistant", "content": "hello"}),
            ])
            .spawn()
            .await;
        let client = connected_client(&fake).await;

        let pong = client.ping(Some("hi".into())).await.unwrap();
        assert_eq!(pong.protocol_version, Some(2));
        assert_eq!(pong.message.as_deref(), Some("hi"));

        assert_eq!(client.server_status().await.unwrap()["status"], "ok");
        assert_eq!(client.auth_status().await.unwrap()["authenticated"], true);
        assert_eq!(client.quota().await.unwrap()["quota"]["chat"], 100);
        assert!(client.list_tools(Some("m1")).await.unwrap()["tools"]
            .as_array()
            .unwrap()
            .is_empty());

        let session = client
            .create_session(SessionConfig::builder().model("m1").build().unwrap())
            .await
            .unwrap();
        let history = session.get_messages().await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].content, "hello");
        assert_eq!(
            client.last_session_id().await.unwrap().as_deref(),
            Some(session.session_id())
        );
        client
            .set_foreground_session(session.session_id())
            .await
            .unwrap();
        assert_eq!(
            client.foreground_session().await.unwrap().as_deref(),
            Some(session.session_id())
        );

        client.delete_session(session.session_id()).await.unwrap();
        assert_eq!(fake.requests("session.delete").len(), 1);
        assert!(matches!(
            session.send("hi").await,
            Err(CopilotError::SessionDestroyed(_))
        ));

        client.stop().await;
    }

    #[tokio::test]
    async fn lifecycle_handlers_fire_and_unsubscribe() {
        let fake = FakeCli::builder().spawn().await;
        let client = connected_client(&fake).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = client.on_lifecycle(Some("created"), move |event| {
            let _ = tx.send(event.session_id.clone());
        });

        fake.notify(
            "session.lifecycle",
            json!({"type": "created", "sessionId": "s-9"}),
        );
        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.as_deref(), Some("s-9"));

        subscription.unsubscribe();
        fake.notify(
            "session.lifecycle",
            json!({"type": "created", "sessionId": "s-10"}),
        );
        sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());

        client.stop().await;
    }

    #[tokio::test]
    async fn unclassified_notifications_are_pollable() {
        let fake = FakeCli::builder().spawn().await;
        let client = connected_client(&fake).await;

        let mut other = client.take_other_notifications().unwrap();
        assert!(client.take_other_notifications().is_none());

        fake.notify("server.telemetry", json!({"cpu": 5}));
        let notification = tokio::time::timeout(Duration::from_secs(5), other.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notification.method, "server.telemetry");
        assert_eq!(notification.params.unwrap()["cpu"], 5);

        client.stop().await;
    }

    #[tokio::test]
    async fn auto_restart_reconnects_after_connection_loss() {
        let fake = FakeCli::builder().spawn().await;
        let config = ClientConfig::builder()
            .cli_url(fake.url())
            .auto_restart(true)
            .build()
            .unwrap();
        let client = CopilotClient::new(config);
        client.start().await.unwrap();
        assert_eq!(fake.connection_count(), 1);

        fake.drop_connections();

        let mut reconnected = false;
        for _ in 0..200 {
            if fake.connection_count() >= 2 && client.status() == ClientStatus::Connected {
                reconnected = true;
                break;
            }
            sleep(Duration::from_millis(50)).await;
        }
        assert!(reconnected, "client did not reconnect");
        client.ping(None).await.unwrap();

        client.stop().await;
        assert_eq!(client.status(), ClientStatus::Disconnected);
    }
}
