//! Callback handlers the CLI can invoke mid-turn, and their dispatcher.
//!
//! While a send is in flight the server issues its own requests back to the
//! client: `tool.call`, `permission.request`, `userInput.request`, and
//! `hooks.invoke`. The [`SessionRequestDispatcher`] is the single entry
//! point the RPC layer installs; it resolves the target session's handler
//! tables and normalises every outcome (handler errors, panics, and
//! timeouts included) into a structured reply on the same request id.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Value};
use tokio::time;
use tracing::{debug, warn};

use crate::error::UNKNOWN_SESSION_CODE;
use crate::protocol::{
    HooksInvokeParams, PermissionDecision, PermissionRequestParams, RpcError, ToolCallParams,
    ToolCallResult, UserInputRequestParams, METHOD_HOOKS_INVOKE, METHOD_PERMISSION_REQUEST,
    METHOD_TOOL_CALL, METHOD_USER_INPUT_REQUEST,
};
use crate::rpc::ServerRequestHandler;
use crate::session::{SessionRecord, SessionRegistry};

/// One `tool.call` invocation as handed to a [`ToolHandler`].
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub session_id: String,
    pub tool_call_id: String,
    pub tool_name: String,
    pub arguments: Value,
}

/// A named tool the server may invoke during a turn.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, invocation: ToolInvocation) -> ToolCallResult;
}

struct FnTool<F> {
    f: F,
}

#[async_trait]
impl<F> ToolHandler for FnTool<F>
where
    F: Fn(Value) -> BoxFuture<'static, std::result::Result<Value, String>> + Send + Sync,
{
    async fn call(&self, invocation: ToolInvocation) -> ToolCallResult {
        match (self.f)(invocation.arguments).await {
            Ok(value) => ToolCallResult::success(value_as_llm_text(&value)),
            Err(message) => ToolCallResult::failure(message),
        }
    }
}

/// Wrap an async closure as a [`ToolHandler`].
///
/// `Ok` values become a `success` result whose LLM text is the value itself
/// for strings and its JSON serialisation otherwise; `Err` becomes a
/// normalised `failure` result.
pub fn tool_fn<F, Fut>(f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = std::result::Result<Value, String>> + Send + 'static,
{
    Arc::new(FnTool {
        f: move |arguments| f(arguments).boxed(),
    })
}

fn value_as_llm_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Decides whether a potentially-dangerous operation may proceed.
#[async_trait]
pub trait PermissionHandler: Send + Sync {
    async fn decide(&self, session_id: &str, request: Value) -> PermissionDecision;
}

struct ApproveAll;

#[async_trait]
impl PermissionHandler for ApproveAll {
    async fn decide(&self, _session_id: &str, _request: Value) -> PermissionDecision {
        PermissionDecision::approved()
    }
}

/// A permission handler that approves every request.
pub fn approve_all() -> Arc<dyn PermissionHandler> {
    Arc::new(ApproveAll)
}

/// Answers `userInput.request` prompts from the server.
#[async_trait]
pub trait UserInputHandler: Send + Sync {
    async fn request(
        &self,
        session_id: &str,
        request: Value,
    ) -> std::result::Result<Value, String>;
}

/// Answers `hooks.invoke` callbacks for one hook kind.
#[async_trait]
pub trait HookHandler: Send + Sync {
    async fn invoke(&self, session_id: &str, input: Value) -> Value;
}

/// Single entry point for server-initiated requests, installed into the
/// RPC multiplexer. Runs on handler tasks, never on the reader.
pub(crate) struct SessionRequestDispatcher {
    registry: Arc<SessionRegistry>,
}

impl SessionRequestDispatcher {
    pub(crate) fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    async fn live_record(
        &self,
        session_id: &str,
    ) -> std::result::Result<Arc<SessionRecord>, RpcError> {
        match self.registry.record(session_id).await {
            Some(record) if !record.is_destroyed() => Ok(record),
            _ => Err(RpcError::new(
                UNKNOWN_SESSION_CODE,
                format!("unknown session: {session_id}"),
            )),
        }
    }

    async fn handle_tool_call(&self, params: Value) -> std::result::Result<Value, RpcError> {
        let params: ToolCallParams = parse_params(params)?;
        let record = self.live_record(&params.session_id).await?;

        let Some(handler) = record.tool(&params.tool_name) else {
            // Unknown tool is a normalised failure result, not an RPC error:
            // the model should see the problem and recover.
            let result = ToolCallResult::failure(format!("unknown tool: {}", params.tool_name));
            return Ok(json!({ "result": result }));
        };

        let timeout = record.tool_timeout();
        let tool_name = params.tool_name.clone();
        let invocation = ToolInvocation {
            session_id: params.session_id,
            tool_call_id: params.tool_call_id,
            tool_name: params.tool_name,
            arguments: params.arguments,
        };

        let call = AssertUnwindSafe(handler.call(invocation)).catch_unwind();
        let result = match time::timeout(timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                warn!("Tool handler `{tool_name}` panicked");
                ToolCallResult::failure(format!("tool `{tool_name}` panicked"))
            }
            Err(_) => {
                warn!("Tool handler `{tool_name}` timed out after {timeout:?}");
                ToolCallResult::failure(format!("tool `{tool_name}` timed out after {timeout:?}"))
            }
        };

        Ok(json!({ "result": result }))
    }

    async fn handle_permission_request(
        &self,
        params: Value,
    ) -> std::result::Result<Value, RpcError> {
        let params: PermissionRequestParams = parse_params(params)?;
        let record = self.live_record(&params.session_id).await?;

        let decision = match record.permission_handler() {
            None => PermissionDecision::denied_no_approval_rule(),
            Some(handler) => {
                let decide = AssertUnwindSafe(
                    handler.decide(&params.session_id, params.permission_request),
                )
                .catch_unwind();
                match decide.await {
                    Ok(decision) => decision,
                    Err(_) => {
                        warn!("Permission handler panicked, denying");
                        PermissionDecision::denied_no_approval_rule()
                    }
                }
            }
        };

        serde_json::to_value(&decision)
            .map_err(|error| RpcError::new(-32603, format!("internal error: {error}")))
    }

    async fn handle_user_input_request(
        &self,
        params: Value,
    ) -> std::result::Result<Value, RpcError> {
        let params: UserInputRequestParams = parse_params(params)?;
        let record = self.live_record(&params.session_id).await?;

        let Some(handler) = record.user_input_handler() else {
            return Err(RpcError::new(
                -32002,
                format!(
                    "no user-input handler registered for session {}",
                    params.session_id
                ),
            ));
        };

        let request = AssertUnwindSafe(handler.request(&params.session_id, params.request))
            .catch_unwind();
        match request.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(RpcError::new(-32002, message)),
            Err(_) => {
                warn!("User-input handler panicked");
                Err(RpcError::new(-32002, "user-input handler panicked"))
            }
        }
    }

    async fn handle_hooks_invoke(&self, params: Value) -> std::result::Result<Value, RpcError> {
        let params: HooksInvokeParams = parse_params(params)?;
        let record = self.live_record(&params.session_id).await?;

        let Some(handler) = record.hook(&params.hook_type) else {
            debug!("No handler for hook `{}`, continuing", params.hook_type);
            return Ok(json!({}));
        };

        let invoke =
            AssertUnwindSafe(handler.invoke(&params.session_id, params.input)).catch_unwind();
        match invoke.await {
            Ok(value) => Ok(value),
            Err(_) => {
                warn!("Hook handler `{}` panicked, continuing", params.hook_type);
                Ok(json!({}))
            }
        }
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(
    params: Value,
) -> std::result::Result<T, RpcError> {
    serde_json::from_value(params)
        .map_err(|error| RpcError::new(-32602, format!("invalid params: {error}")))
}

#[async_trait]
impl ServerRequestHandler for SessionRequestDispatcher {
    async fn handle(&self, method: &str, params: Value) -> std::result::Result<Value, RpcError> {
        match method {
            METHOD_TOOL_CALL => self.handle_tool_call(params).await,
            METHOD_PERMISSION_REQUEST => self.handle_permission_request(params).await,
            METHOD_USER_INPUT_REQUEST => self.handle_user_input_request(params).await,
            METHOD_HOOKS_INVOKE => self.handle_hooks_invoke(params).await,
            other => Err(RpcError::new(
                -32601,
                format!("unsupported method: {other}"),
            )),
        }
    }
}
