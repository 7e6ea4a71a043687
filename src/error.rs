//! Error types for the Copilot SDK

use std::time::Duration;

use thiserror::Error;

/// JSON-RPC error code delivered to pending requests when the connection
/// is lost before their response arrives.
pub const CONNECTION_CLOSED_CODE: i64 = -32000;

/// JSON-RPC error code returned to the CLI when a server-initiated request
/// names a session this client does not know.
pub const UNKNOWN_SESSION_CODE: i64 = -32001;

/// Result type alias for SDK operations
pub type Result<T> = std::result::Result<T, CopilotError>;

/// Errors that can occur when communicating with the Copilot CLI
#[derive(Error, Debug)]
pub enum CopilotError {
    /// Invalid client or session configuration. Raised before any I/O
    /// happens; the offending option is named in the message.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The CLI could not be started or did not complete the handshake.
    /// Carries the tail of the child's stderr when one was captured.
    #[error("failed to start Copilot CLI: {message}{}", stderr_suffix(.stderr))]
    Startup {
        message: String,
        stderr: Option<String>,
    },

    /// The server answered the handshake with an unexpected protocol version.
    #[error("protocol version mismatch: expected {expected}, server reported {}", reported_version(.actual))]
    ProtocolVersionMismatch { expected: u64, actual: Option<u64> },

    /// The connection to the CLI was closed while requests were pending,
    /// or an operation was attempted after disconnect.
    #[error("connection closed (code {CONNECTION_CLOSED_CODE})")]
    ConnectionClosed,

    /// A wait exceeded its deadline. The pending entry and any event
    /// subscription are released before this is raised.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The server returned a JSON-RPC error object.
    #[error("JSON-RPC error (code {code}): {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Operation attempted on a session that has been destroyed.
    #[error("session {0} has been destroyed")]
    SessionDestroyed(String),

    /// The session reported a `session.error` event while a send was
    /// being collected.
    #[error("session error: {0}")]
    Session(String),

    /// Malformed framing or an unparseable protocol message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A message body was valid framing but not the expected JSON shape.
    #[error("failed to parse message: {error}\nRaw message: {raw}")]
    Parse { error: String, raw: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn stderr_suffix(stderr: &Option<String>) -> String {
    match stderr {
        Some(tail) if !tail.trim().is_empty() => format!("\nCLI stderr:\n{tail}"),
        _ => String::new(),
    }
}

fn reported_version(actual: &Option<u64>) -> String {
    match actual {
        Some(version) => version.to_string(),
        None => "none".into(),
    }
}

impl CopilotError {
    /// Build a startup error without captured stderr.
    pub(crate) fn startup(message: impl Into<String>) -> Self {
        Self::Startup {
            message: message.into(),
            stderr: None,
        }
    }
}
