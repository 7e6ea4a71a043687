//! JSON-RPC protocol types for Copilot CLI communication

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version this client implements. The `ping` handshake must
/// report exactly this value; there is no negotiation.
pub const PROTOCOL_VERSION: u64 = 2;

static REQUEST_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_id() -> u64 {
    REQUEST_ID.fetch_add(1, Ordering::SeqCst)
}

// Client -> server request methods.
pub(crate) const METHOD_PING: &str = "ping";
pub(crate) const METHOD_STATUS_GET: &str = "status.get";
pub(crate) const METHOD_AUTH_GET_STATUS: &str = "auth.getStatus";
pub(crate) const METHOD_MODELS_LIST: &str = "models.list";
pub(crate) const METHOD_TOOLS_LIST: &str = "tools.list";
pub(crate) const METHOD_ACCOUNT_GET_QUOTA: &str = "account.getQuota";
pub(crate) const METHOD_SESSION_CREATE: &str = "session.create";
pub(crate) const METHOD_SESSION_RESUME: &str = "session.resume";
pub(crate) const METHOD_SESSION_SEND: &str = "session.send";
pub(crate) const METHOD_SESSION_ABORT: &str = "session.abort";
pub(crate) const METHOD_SESSION_DESTROY: &str = "session.destroy";
pub(crate) const METHOD_SESSION_GET_MESSAGES: &str = "session.getMessages";
pub(crate) const METHOD_SESSION_LIST: &str = "session.list";
pub(crate) const METHOD_SESSION_DELETE: &str = "session.delete";
pub(crate) const METHOD_SESSION_GET_LAST_ID: &str = "session.getLastId";
pub(crate) const METHOD_SESSION_GET_FOREGROUND: &str = "session.getForeground";
pub(crate) const METHOD_SESSION_SET_FOREGROUND: &str = "session.setForeground";
pub(crate) const METHOD_MODEL_GET_CURRENT: &str = "session.model.getCurrent";
pub(crate) const METHOD_MODEL_SWITCH_TO: &str = "session.model.switchTo";

// Server -> client request methods.
pub(crate) const METHOD_TOOL_CALL: &str = "tool.call";
pub(crate) const METHOD_PERMISSION_REQUEST: &str = "permission.request";
pub(crate) const METHOD_USER_INPUT_REQUEST: &str = "userInput.request";
pub(crate) const METHOD_HOOKS_INVOKE: &str = "hooks.invoke";

// Server -> client notification methods.
pub(crate) const METHOD_SESSION_EVENT: &str = "session.event";
pub(crate) const METHOD_SESSION_LIFECYCLE: &str = "session.lifecycle";

/// JSON-RPC request
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id: next_id(),
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC response
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[allow(dead_code)]
    pub jsonrpc: Option<String>,
    pub id: Option<u64>,
    pub result: Option<Value>,
    pub error: Option<RpcError>,
}

/// JSON-RPC error object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// Notification from server (session.event, session.lifecycle, etc.)
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcNotification {
    #[allow(dead_code)]
    pub jsonrpc: Option<String>,
    pub method: String,
    pub params: Option<Value>,
}

/// Outgoing JSON-RPC response (SDK -> CLI), used to answer server-initiated
/// requests such as `tool.call` on the same request id.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcResponseOut {
    pub jsonrpc: &'static str,
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl JsonRpcResponseOut {
    pub fn result(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: u64, error: RpcError) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// Classification of an incoming JSON-RPC message.
#[derive(Debug, PartialEq, Eq)]
pub enum MessageKind {
    /// A response to a request we sent (has `id`, no `method`).
    Response,
    /// An incoming request from the CLI (has `id` + `method`).
    IncomingRequest { id: u64 },
    /// A notification (has `method`, no `id`).
    Notification,
}

/// Classify a JSON-RPC message by its structure.
pub fn classify_message(json: &Value) -> MessageKind {
    let has_id = json.get("id").and_then(|v| v.as_u64());
    let has_method = json.get("method").and_then(|v| v.as_str());

    match (has_id, has_method) {
        (Some(id), Some(_)) => MessageKind::IncomingRequest { id },
        (Some(_), None) => MessageKind::Response,
        _ => MessageKind::Notification,
    }
}

/// `ping` parameters; the server echoes the payload back.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PingParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// `ping` result. `protocol_version` gates the handshake.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingResult {
    #[serde(default)]
    pub protocol_version: Option<u64>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Session creation result
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResult {
    pub session_id: String,
    #[serde(default)]
    pub workspace_path: Option<String>,
}

/// Prompt attachment for `session.send`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Send parameters (for session.send)
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendParams {
    pub session_id: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<Attachment>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

/// Send result
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResult {
    pub message_id: String,
}

/// Params carrying only a session id (abort, destroy, getMessages, ...).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionIdParams {
    pub session_id: String,
}

/// Chat message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Chat message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

/// `session.getMessages` result
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetMessagesResult {
    #[serde(default)]
    pub messages: Vec<Message>,
}

/// A model known to the server.
///
/// Only `id` is behaviourally significant; everything else the server
/// reports is kept verbatim so that serialising back yields the wire shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// `models.list` result
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListModelsResult {
    #[serde(default)]
    pub models: Vec<ModelInfo>,
}

/// `session.model.getCurrent` result
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentModelResult {
    pub model: String,
}

/// `session.model.switchTo` parameters
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchModelParams {
    pub session_id: String,
    pub model: String,
}

/// One entry of a `session.list` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// `session.list` result
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListSessionsResult {
    #[serde(default)]
    pub sessions: Vec<SessionSummary>,
}

/// Incoming `tool.call` request parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallParams {
    pub session_id: String,
    pub tool_call_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Normalised result type of a tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolResultType {
    Success,
    Failure,
    Denied,
    Rejected,
}

/// Normalised tool invocation result sent back on the `tool.call` id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResult {
    pub text_result_for_llm: String,
    pub result_type: ToolResultType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub tool_telemetry: Value,
}

impl ToolCallResult {
    pub fn success(text: impl Into<String>) -> Self {
        Self {
            text_result_for_llm: text.into(),
            result_type: ToolResultType::Success,
            error: None,
            tool_telemetry: Value::Object(Default::default()),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            text_result_for_llm: message.clone(),
            result_type: ToolResultType::Failure,
            error: Some(message),
            tool_telemetry: Value::Object(Default::default()),
        }
    }

    pub fn denied(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            text_result_for_llm: message.clone(),
            result_type: ToolResultType::Denied,
            error: Some(message),
            tool_telemetry: Value::Object(Default::default()),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            text_result_for_llm: message.clone(),
            result_type: ToolResultType::Rejected,
            error: Some(message),
            tool_telemetry: Value::Object(Default::default()),
        }
    }
}

/// Incoming `permission.request` parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequestParams {
    pub session_id: String,
    #[serde(default)]
    pub permission_request: Value,
}

/// Outcome of a permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PermissionDecisionKind {
    #[serde(rename = "approved")]
    Approved,
    #[serde(rename = "denied-by-rules")]
    DeniedByRules,
    #[serde(rename = "denied-interactively-by-user")]
    DeniedInteractivelyByUser,
    #[serde(rename = "denied-no-approval-rule-and-could-not-request-from-user")]
    DeniedNoApprovalRule,
}

/// Reply sent back on a `permission.request` id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionDecision {
    pub kind: PermissionDecisionKind,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl PermissionDecision {
    pub fn approved() -> Self {
        Self {
            kind: PermissionDecisionKind::Approved,
            extra: Default::default(),
        }
    }

    pub fn denied_by_rules() -> Self {
        Self {
            kind: PermissionDecisionKind::DeniedByRules,
            extra: Default::default(),
        }
    }

    pub fn denied_interactively() -> Self {
        Self {
            kind: PermissionDecisionKind::DeniedInteractivelyByUser,
            extra: Default::default(),
        }
    }

    /// The deny-by-default reply used when no handler is registered.
    pub fn denied_no_approval_rule() -> Self {
        Self {
            kind: PermissionDecisionKind::DeniedNoApprovalRule,
            extra: Default::default(),
        }
    }
}

/// Incoming `userInput.request` parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInputRequestParams {
    pub session_id: String,
    #[serde(default)]
    pub request: Value,
}

/// Incoming `hooks.invoke` parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HooksInvokeParams {
    pub session_id: String,
    #[serde(default)]
    pub hook_type: String,
    #[serde(default)]
    pub input: Value,
}

/// `session.list` request parameters.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListSessionsParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<HashMap<String, String>>,
}
