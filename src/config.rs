//! Typed client and session configuration.
//!
//! Configuration is built programmatically and validated at construction
//! time; there are no loose maps, and the wire translation lives next to
//! the types it serialises. `session.create` params always advertise the
//! permission / user-input / hooks request channels and
//! `envValueMode: "direct"`, because the server rejects payloads that
//! omit them.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CopilotError, Result};
use crate::handlers::{HookHandler, PermissionHandler, ToolHandler, UserInputHandler};
use crate::transport::parse_cli_url;

/// Default deadline for the startup handshake race.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);
/// Default deadline for plain request/response RPCs.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Default deadline for `send_and_wait` / `ask` turns.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(180);
/// Default deadline for a single tool handler invocation.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);

const DEFAULT_WRITER_QUEUE: usize = 1024;
const DEFAULT_NOTIFICATION_QUEUE: usize = 4096;
const DEFAULT_OTHER_NOTIFICATION_QUEUE: usize = 4096;
const DEFAULT_EVENT_BUFFER: usize = 1024;

/// Validated client options. Build with [`ClientConfig::builder`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub(crate) cli_path: Option<PathBuf>,
    pub(crate) cli_args: Vec<String>,
    pub(crate) cli_url: Option<String>,
    pub(crate) use_stdio: bool,
    pub(crate) auto_restart: bool,
    pub(crate) env: HashMap<String, String>,
    pub(crate) github_token: Option<String>,
    pub(crate) use_logged_in_user: bool,
    pub(crate) working_dir: Option<PathBuf>,
    pub(crate) startup_timeout: Duration,
    pub(crate) request_timeout: Duration,
    pub(crate) send_timeout: Duration,
    pub(crate) tool_timeout: Duration,
    pub(crate) writer_queue: usize,
    pub(crate) notification_queue: usize,
    pub(crate) other_notification_queue: usize,
    pub(crate) event_buffer: usize,
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }
}

/// Builder for [`ClientConfig`].
#[derive(Debug, Clone)]
pub struct ClientConfigBuilder {
    cli_path: Option<PathBuf>,
    cli_args: Vec<String>,
    cli_url: Option<String>,
    use_stdio: Option<bool>,
    auto_restart: bool,
    env: HashMap<String, String>,
    github_token: Option<String>,
    use_logged_in_user: bool,
    working_dir: Option<PathBuf>,
    startup_timeout: Duration,
    request_timeout: Duration,
    send_timeout: Duration,
    tool_timeout: Duration,
    writer_queue: usize,
    notification_queue: usize,
    other_notification_queue: usize,
    event_buffer: usize,
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        Self {
            cli_path: None,
            cli_args: Vec::new(),
            cli_url: None,
            use_stdio: None,
            auto_restart: true,
            env: HashMap::new(),
            github_token: None,
            use_logged_in_user: false,
            working_dir: None,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            writer_queue: DEFAULT_WRITER_QUEUE,
            notification_queue: DEFAULT_NOTIFICATION_QUEUE,
            other_notification_queue: DEFAULT_OTHER_NOTIFICATION_QUEUE,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl ClientConfigBuilder {
    /// Path to the CLI binary. Defaults to `COPILOT_CLI_PATH`, then
    /// `copilot` on `PATH`.
    pub fn cli_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cli_path = Some(path.into());
        self
    }

    /// Extra arguments passed to the CLI ahead of the server flags.
    pub fn cli_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cli_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Connect to an already-running CLI server instead of spawning one.
    /// Accepts `PORT`, `HOST:PORT`, or `scheme://HOST:PORT`.
    pub fn cli_url(mut self, url: impl Into<String>) -> Self {
        self.cli_url = Some(url.into());
        self
    }

    /// Whether a managed child speaks JSON-RPC over its stdio pipes
    /// (default) or announces a TCP port instead.
    pub fn use_stdio(mut self, use_stdio: bool) -> Self {
        self.use_stdio = Some(use_stdio);
        self
    }

    /// Restart the CLI automatically after an unexpected exit or
    /// connection loss. Defaults to `true`.
    pub fn auto_restart(mut self, auto_restart: bool) -> Self {
        self.auto_restart = auto_restart;
        self
    }

    /// Add an environment variable for the child process.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// GitHub token exported to the child as `GITHUB_TOKEN`.
    pub fn github_token(mut self, token: impl Into<String>) -> Self {
        self.github_token = Some(token.into());
        self
    }

    /// Authenticate as the locally logged-in user.
    pub fn use_logged_in_user(mut self, enable: bool) -> Self {
        self.use_logged_in_user = enable;
        self
    }

    /// Working directory for the child process.
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Default deadline for `send_and_wait` / `ask`.
    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Default deadline for a single tool handler invocation.
    pub fn tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn writer_queue(mut self, size: usize) -> Self {
        self.writer_queue = size;
        self
    }

    pub fn notification_queue(mut self, size: usize) -> Self {
        self.notification_queue = size;
        self
    }

    pub fn other_notification_queue(mut self, size: usize) -> Self {
        self.other_notification_queue = size;
        self
    }

    /// Capacity of each per-session event broadcast buffer.
    pub fn event_buffer(mut self, size: usize) -> Self {
        self.event_buffer = size;
        self
    }

    pub fn build(self) -> Result<ClientConfig> {
        if let Some(url) = &self.cli_url {
            parse_cli_url(url)?;
            if self.cli_path.is_some() {
                return Err(CopilotError::InvalidConfig(
                    "cli_url and cli_path are mutually exclusive".into(),
                ));
            }
            if self.use_stdio == Some(true) {
                return Err(CopilotError::InvalidConfig(
                    "cli_url cannot be combined with use_stdio".into(),
                ));
            }
            if self.github_token.is_some() || self.use_logged_in_user {
                return Err(CopilotError::InvalidConfig(
                    "cli_url cannot be combined with github_token or use_logged_in_user: \
                     authentication is owned by the external server"
                        .into(),
                ));
            }
        }

        if self.github_token.is_some() && self.use_logged_in_user {
            return Err(CopilotError::InvalidConfig(
                "github_token and use_logged_in_user are mutually exclusive".into(),
            ));
        }

        for (name, timeout) in [
            ("startup_timeout", self.startup_timeout),
            ("request_timeout", self.request_timeout),
            ("send_timeout", self.send_timeout),
            ("tool_timeout", self.tool_timeout),
        ] {
            if timeout.is_zero() {
                return Err(CopilotError::InvalidConfig(format!(
                    "{name} must be greater than zero"
                )));
            }
        }

        for (name, size) in [
            ("writer_queue", self.writer_queue),
            ("notification_queue", self.notification_queue),
            ("other_notification_queue", self.other_notification_queue),
            ("event_buffer", self.event_buffer),
        ] {
            if size == 0 {
                return Err(CopilotError::InvalidConfig(format!(
                    "{name} must be greater than zero"
                )));
            }
        }

        Ok(ClientConfig {
            cli_path: self.cli_path,
            cli_args: self.cli_args,
            cli_url: self.cli_url,
            use_stdio: self.use_stdio.unwrap_or(true),
            auto_restart: self.auto_restart,
            env: self.env,
            github_token: self.github_token,
            use_logged_in_user: self.use_logged_in_user,
            working_dir: self.working_dir,
            startup_timeout: self.startup_timeout,
            request_timeout: self.request_timeout,
            send_timeout: self.send_timeout,
            tool_timeout: self.tool_timeout,
            writer_queue: self.writer_queue,
            notification_queue: self.notification_queue,
            other_notification_queue: self.other_notification_queue,
            event_buffer: self.event_buffer,
        })
    }
}

/// How a custom system message combines with the server's default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemMessageMode {
    Append,
    Replace,
}

/// Custom system message for a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SystemMessage {
    pub mode: SystemMessageMode,
    pub content: String,
}

/// Reasoning effort hint passed through to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

/// Bring-your-own-key provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProviderConfig {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
}

/// MCP server transport kind, serialised as a lowercase string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum McpServerType {
    Local,
    Stdio,
    Http,
    Sse,
}

/// One MCP server a session may use.
///
/// The wire keys here are the single exception to the generic camelCase
/// mapping: the API's `mcp-command` / `mcp-args` / `mcp-tools` /
/// `mcp-server-type` / `mcp-timeout` / `mcp-url` / `mcp-headers` names lose
/// their prefix on the wire, and `type` is always a plain string.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum McpServerConfig {
    Local {
        command: String,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        env: Option<HashMap<String, String>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tools: Option<Vec<String>>,
        #[serde(rename = "type")]
        server_type: McpServerType,
        #[serde(skip_serializing_if = "Option::is_none")]
        timeout: Option<u64>,
    },
    Remote {
        #[serde(rename = "type")]
        server_type: McpServerType,
        url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        headers: Option<HashMap<String, String>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tools: Option<Vec<String>>,
    },
}

impl McpServerConfig {
    /// A local server launched via `command`.
    pub fn local(command: impl Into<String>) -> Self {
        Self::Local {
            command: command.into(),
            args: Vec::new(),
            env: None,
            tools: None,
            server_type: McpServerType::Local,
            timeout: None,
        }
    }

    /// A remote server reached over HTTP.
    pub fn http(url: impl Into<String>) -> Self {
        Self::Remote {
            server_type: McpServerType::Http,
            url: url.into(),
            headers: None,
            tools: None,
        }
    }

    /// A remote server reached over SSE.
    pub fn sse(url: impl Into<String>) -> Self {
        Self::Remote {
            server_type: McpServerType::Sse,
            url: url.into(),
            headers: None,
            tools: None,
        }
    }

    pub fn args<I, S>(mut self, new_args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Self::Local { args, .. } = &mut self {
            *args = new_args.into_iter().map(Into::into).collect();
        }
        self
    }

    pub fn tools<I, S>(mut self, allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let allowed = Some(allowed.into_iter().map(Into::into).collect());
        match &mut self {
            Self::Local { tools, .. } | Self::Remote { tools, .. } => *tools = allowed,
        }
        self
    }

    pub fn env_vars(mut self, vars: HashMap<String, String>) -> Self {
        if let Self::Local { env, .. } = &mut self {
            *env = Some(vars);
        }
        self
    }

    pub fn headers(mut self, extra: HashMap<String, String>) -> Self {
        if let Self::Remote { headers, .. } = &mut self {
            *headers = Some(extra);
        }
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        if let Self::Local { timeout, .. } = &mut self {
            *timeout = Some(ms);
        }
        self
    }

    fn validate(&self, name: &str) -> Result<()> {
        match self {
            Self::Local { command, .. } => {
                if command.trim().is_empty() {
                    return Err(CopilotError::InvalidConfig(format!(
                        "MCP server `{name}` has an empty command"
                    )));
                }
            }
            Self::Remote {
                url, server_type, ..
            } => {
                if url.trim().is_empty() {
                    return Err(CopilotError::InvalidConfig(format!(
                        "MCP server `{name}` has an empty url"
                    )));
                }
                if !matches!(server_type, McpServerType::Http | McpServerType::Sse) {
                    return Err(CopilotError::InvalidConfig(format!(
                        "MCP server `{name}` must use http or sse, got {server_type:?}"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// A custom agent definition advertised to the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CustomAgent {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,
}

/// Thresholds for server-side infinite-session management.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct InfiniteSessionConfig {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_compaction_threshold: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer_exhaustion_threshold: Option<u64>,
}

/// A tool registered for a session: the wire spec plus the local handler.
#[derive(Clone)]
pub struct ToolRegistration {
    pub(crate) name: String,
    pub(crate) description: String,
    pub(crate) input_schema: Option<Value>,
    pub(crate) handler: Arc<dyn ToolHandler>,
}

impl fmt::Debug for ToolRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistration")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Validated session options. Build with [`SessionConfig::builder`].
#[derive(Clone, Default)]
pub struct SessionConfig {
    pub(crate) model: Option<String>,
    pub(crate) tools: Vec<ToolRegistration>,
    pub(crate) permission_handler: Option<Arc<dyn PermissionHandler>>,
    pub(crate) user_input_handler: Option<Arc<dyn UserInputHandler>>,
    pub(crate) hooks: HashMap<String, Arc<dyn HookHandler>>,
    pub(crate) system_message: Option<SystemMessage>,
    pub(crate) available_tools: Option<Vec<String>>,
    pub(crate) excluded_tools: Option<Vec<String>>,
    pub(crate) provider: Option<ProviderConfig>,
    pub(crate) mcp_servers: HashMap<String, McpServerConfig>,
    pub(crate) custom_agents: Vec<CustomAgent>,
    pub(crate) config_dir: Option<PathBuf>,
    pub(crate) skill_dirs: Vec<PathBuf>,
    pub(crate) reasoning_effort: Option<ReasoningEffort>,
    pub(crate) streaming: Option<bool>,
    pub(crate) infinite_sessions: Option<InfiniteSessionConfig>,
    pub(crate) working_dir: Option<PathBuf>,
    pub(crate) disable_resume: bool,
    pub(crate) tool_timeout: Option<Duration>,
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("model", &self.model)
            .field("tools", &self.tools)
            .field("system_message", &self.system_message)
            .field("mcp_servers", &self.mcp_servers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl SessionConfig {
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }

    /// Translate to the `session.create` / `session.resume` wire shape.
    pub(crate) fn to_wire(&self) -> Result<Value> {
        let tools: Vec<Value> = self
            .tools
            .iter()
            .map(|tool| {
                let mut spec = serde_json::Map::new();
                spec.insert("name".into(), Value::String(tool.name.clone()));
                spec.insert("description".into(), Value::String(tool.description.clone()));
                if let Some(schema) = &tool.input_schema {
                    spec.insert("inputSchema".into(), schema.clone());
                }
                Value::Object(spec)
            })
            .collect();

        let mut params = serde_json::Map::new();
        if let Some(model) = &self.model {
            params.insert("model".into(), Value::String(model.clone()));
        }
        if !tools.is_empty() {
            params.insert("tools".into(), Value::Array(tools));
        }
        if let Some(system_message) = &self.system_message {
            params.insert("systemMessage".into(), serde_json::to_value(system_message)?);
        }
        if let Some(available) = &self.available_tools {
            params.insert("availableTools".into(), serde_json::to_value(available)?);
        }
        if let Some(excluded) = &self.excluded_tools {
            params.insert("excludedTools".into(), serde_json::to_value(excluded)?);
        }
        if let Some(provider) = &self.provider {
            params.insert("provider".into(), serde_json::to_value(provider)?);
        }
        if !self.mcp_servers.is_empty() {
            params.insert("mcpServers".into(), serde_json::to_value(&self.mcp_servers)?);
        }
        if !self.custom_agents.is_empty() {
            params.insert("customAgents".into(), serde_json::to_value(&self.custom_agents)?);
        }
        if let Some(dir) = &self.config_dir {
            params.insert("configDir".into(), Value::String(dir.display().to_string()));
        }
        if !self.skill_dirs.is_empty() {
            let dirs: Vec<String> = self
                .skill_dirs
                .iter()
                .map(|dir| dir.display().to_string())
                .collect();
            params.insert("skillDirectories".into(), serde_json::to_value(dirs)?);
        }
        if let Some(effort) = &self.reasoning_effort {
            params.insert("reasoningEffort".into(), serde_json::to_value(effort)?);
        }
        if let Some(streaming) = self.streaming {
            params.insert("streaming".into(), Value::Bool(streaming));
        }
        if let Some(infinite) = &self.infinite_sessions {
            params.insert("infiniteSessions".into(), serde_json::to_value(infinite)?);
        }
        if let Some(dir) = &self.working_dir {
            params.insert("workingDir".into(), Value::String(dir.display().to_string()));
        }
        if self.disable_resume {
            params.insert("disableResume".into(), Value::Bool(true));
        }

        // Always advertised, even when false: omitting any of these makes
        // the server reject the request.
        params.insert("requestPermission".into(), Value::Bool(true));
        params.insert("requestUserInput".into(), Value::Bool(true));
        params.insert("hooks".into(), Value::Bool(!self.hooks.is_empty()));
        params.insert("envValueMode".into(), Value::String("direct".into()));

        Ok(Value::Object(params))
    }
}

/// Builder for [`SessionConfig`].
#[derive(Clone, Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    /// Register a tool the server may invoke during a turn.
    pub fn tool(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Option<Value>,
        handler: Arc<dyn ToolHandler>,
    ) -> Self {
        self.config.tools.push(ToolRegistration {
            name: name.into(),
            description: description.into(),
            input_schema,
            handler,
        });
        self
    }

    pub fn permission_handler(mut self, handler: Arc<dyn PermissionHandler>) -> Self {
        self.config.permission_handler = Some(handler);
        self
    }

    pub fn user_input_handler(mut self, handler: Arc<dyn UserInputHandler>) -> Self {
        self.config.user_input_handler = Some(handler);
        self
    }

    /// Register a handler for one hook kind (e.g. `preToolUse`).
    pub fn hook(mut self, kind: impl Into<String>, handler: Arc<dyn HookHandler>) -> Self {
        self.config.hooks.insert(kind.into(), handler);
        self
    }

    pub fn system_message(mut self, mode: SystemMessageMode, content: impl Into<String>) -> Self {
        self.config.system_message = Some(SystemMessage {
            mode,
            content: content.into(),
        });
        self
    }

    pub fn available_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.available_tools = Some(tools.into_iter().map(Into::into).collect());
        self
    }

    pub fn excluded_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.excluded_tools = Some(tools.into_iter().map(Into::into).collect());
        self
    }

    pub fn provider(mut self, provider: ProviderConfig) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn mcp_server(mut self, name: impl Into<String>, server: McpServerConfig) -> Self {
        self.config.mcp_servers.insert(name.into(), server);
        self
    }

    pub fn custom_agent(mut self, agent: CustomAgent) -> Self {
        self.config.custom_agents.push(agent);
        self
    }

    pub fn config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.config_dir = Some(dir.into());
        self
    }

    pub fn skill_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.skill_dirs.push(dir.into());
        self
    }

    pub fn reasoning_effort(mut self, effort: ReasoningEffort) -> Self {
        self.config.reasoning_effort = Some(effort);
        self
    }

    pub fn streaming(mut self, streaming: bool) -> Self {
        self.config.streaming = Some(streaming);
        self
    }

    pub fn infinite_sessions(mut self, config: InfiniteSessionConfig) -> Self {
        self.config.infinite_sessions = Some(config);
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.working_dir = Some(dir.into());
        self
    }

    pub fn disable_resume(mut self, disable: bool) -> Self {
        self.config.disable_resume = disable;
        self
    }

    /// Per-session override of the tool invocation deadline.
    pub fn tool_timeout(mut self, timeout: Duration) -> Self {
        self.config.tool_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<SessionConfig> {
        let config = self.config;

        if config.provider.is_some() && config.model.is_none() {
            return Err(CopilotError::InvalidConfig(
                "model is required when a provider is configured".into(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for tool in &config.tools {
            if tool.name.trim().is_empty() {
                return Err(CopilotError::InvalidConfig(
                    "tool names must not be empty".into(),
                ));
            }
            if !seen.insert(tool.name.as_str()) {
                return Err(CopilotError::InvalidConfig(format!(
                    "duplicate tool name: {}",
                    tool.name
                )));
            }
        }

        for (name, server) in &config.mcp_servers {
            server.validate(name)?;
        }

        if let Some(timeout) = config.tool_timeout {
            if timeout.is_zero() {
                return Err(CopilotError::InvalidConfig(
                    "tool_timeout must be greater than zero".into(),
                ));
            }
        }

        Ok(config)
    }
}
