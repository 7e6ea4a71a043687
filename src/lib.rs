//! Client SDK for the Copilot CLI's server mode.
//!
//! Drives a long-running `copilot` process (or an already-running server
//! reached over TCP) through Content-Length-framed JSON-RPC 2.0, and
//! exposes sessions, event streams, and callback-style tools and
//! permission handlers on top of it.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use copilot_sdk::{ClientConfig, CopilotClient, SessionConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = CopilotClient::new(ClientConfig::builder().build()?);
//! client.start().await?;
//!
//! let session = client
//!     .create_session(SessionConfig::builder().model("gpt-5").build()?)
//!     .await?;
//! let answer = session.ask("Summarize this repository").await?;
//! println!("{answer}");
//!
//! client.stop().await;
//! # Ok(()) }
//! ```
//!
//! # Architecture
//!
//! One connection runs exactly one reader task and one writer task.
//! Responses complete pending request slots; server-initiated requests
//! (`tool.call`, `permission.request`, `userInput.request`,
//! `hooks.invoke`) are answered on worker tasks so the reader never blocks
//! on user code; notifications flow through a bounded queue into the
//! router, which fans session events out on per-session broadcasts with
//! per-subscriber sliding buffers. Sends on one session are serialized by
//! a per-session lock; different sessions proceed in parallel.

mod client;
mod config;
mod error;
mod events;
mod framing;
mod handlers;
mod process;
mod protocol;
mod router;
mod rpc;
mod session;
mod transport;

#[cfg(test)]
mod test_support;

pub use client::{ClientStatus, CopilotClient, SessionFilter};
pub use config::{
    ClientConfig, ClientConfigBuilder, CustomAgent, InfiniteSessionConfig, McpServerConfig,
    McpServerType, ProviderConfig, ReasoningEffort, SessionConfig, SessionConfigBuilder,
    SystemMessage, SystemMessageMode, ToolRegistration, DEFAULT_REQUEST_TIMEOUT,
    DEFAULT_SEND_TIMEOUT, DEFAULT_STARTUP_TIMEOUT, DEFAULT_TOOL_TIMEOUT,
};
pub use error::{CopilotError, Result, CONNECTION_CLOSED_CODE, UNKNOWN_SESSION_CODE};
pub use events::{EventKind, LifecycleEvent, SessionEvent};
pub use handlers::{
    approve_all, tool_fn, HookHandler, PermissionHandler, ToolHandler, ToolInvocation,
    UserInputHandler,
};
pub use protocol::{
    Attachment, JsonRpcNotification, Message, ModelInfo, PermissionDecision,
    PermissionDecisionKind, PingResult, Role, SessionSummary, ToolCallResult, ToolResultType,
    PROTOCOL_VERSION,
};
pub use router::LifecycleSubscription;
pub use session::{CopilotSession, SendOptions};
