//! Session event envelope and the canonical event-type enumeration.
//!
//! The CLI reports everything that happens inside a session as
//! `session.event` notifications. The envelope shape is stable; the set of
//! event types grows with the server, so unknown types are carried through
//! as [`EventKind::Other`] rather than rejected.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Canonical event types emitted by the CLI.
///
/// Types not in this enumeration are preserved verbatim in
/// [`EventKind::Other`] and forwarded to subscribers unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    SessionStart,
    SessionIdle,
    SessionError,
    SessionCompactionStart,
    SessionCompactionComplete,
    SessionSnapshotRewind,
    UserMessage,
    AssistantTurnStart,
    AssistantMessage,
    AssistantMessageDelta,
    AssistantTurnEnd,
    ToolExecutionStart,
    ToolExecutionProgress,
    ToolExecutionComplete,
    SubagentStart,
    SubagentComplete,
    HookStart,
    HookComplete,
    SkillInvoked,
    /// An event type this SDK does not enumerate; kept verbatim.
    Other(String),
}

impl EventKind {
    /// Parse a wire `type` string into the canonical enumeration.
    pub fn from_wire(raw: &str) -> Self {
        match raw {
            "session.start" => Self::SessionStart,
            "session.idle" => Self::SessionIdle,
            "session.error" => Self::SessionError,
            "session.compaction_start" => Self::SessionCompactionStart,
            "session.compaction_complete" => Self::SessionCompactionComplete,
            "session.snapshot_rewind" => Self::SessionSnapshotRewind,
            "user.message" => Self::UserMessage,
            "assistant.turn_start" => Self::AssistantTurnStart,
            "assistant.message" => Self::AssistantMessage,
            "assistant.message_delta" => Self::AssistantMessageDelta,
            "assistant.turn_end" => Self::AssistantTurnEnd,
            "tool.execution_start" => Self::ToolExecutionStart,
            "tool.execution_progress" => Self::ToolExecutionProgress,
            "tool.execution_complete" => Self::ToolExecutionComplete,
            "subagent.start" => Self::SubagentStart,
            "subagent.complete" => Self::SubagentComplete,
            "hook.start" => Self::HookStart,
            "hook.complete" => Self::HookComplete,
            "skill.invoked" => Self::SkillInvoked,
            other => Self::Other(other.to_string()),
        }
    }

    /// The wire `type` string for this event kind.
    pub fn as_wire(&self) -> &str {
        match self {
            Self::SessionStart => "session.start",
            Self::SessionIdle => "session.idle",
            Self::SessionError => "session.error",
            Self::SessionCompactionStart => "session.compaction_start",
            Self::SessionCompactionComplete => "session.compaction_complete",
            Self::SessionSnapshotRewind => "session.snapshot_rewind",
            Self::UserMessage => "user.message",
            Self::AssistantTurnStart => "assistant.turn_start",
            Self::AssistantMessage => "assistant.message",
            Self::AssistantMessageDelta => "assistant.message_delta",
            Self::AssistantTurnEnd => "assistant.turn_end",
            Self::ToolExecutionStart => "tool.execution_start",
            Self::ToolExecutionProgress => "tool.execution_progress",
            Self::ToolExecutionComplete => "tool.execution_complete",
            Self::SubagentStart => "subagent.start",
            Self::SubagentComplete => "subagent.complete",
            Self::HookStart => "hook.start",
            Self::HookComplete => "hook.complete",
            Self::SkillInvoked => "skill.invoked",
            Self::Other(raw) => raw,
        }
    }

    /// Whether this event ends a turn (`session.idle` or `session.error`).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::SessionIdle | Self::SessionError)
    }
}

impl Serialize for EventKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_wire())
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw.is_empty() {
            return Err(D::Error::custom("event type must not be empty"));
        }
        Ok(Self::from_wire(&raw))
    }
}

/// One session event as delivered by the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral: Option<bool>,
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default)]
    pub data: Value,
    /// Envelope fields this SDK does not enumerate; kept verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl SessionEvent {
    /// The `data.content` string, if present. Assistant message and delta
    /// events carry their text here.
    pub fn content(&self) -> Option<&str> {
        self.data.get("content").and_then(Value::as_str)
    }

    /// A human-readable message for `session.error` events.
    pub fn error_message(&self) -> String {
        self.data
            .get("message")
            .or_else(|| self.data.get("error"))
            .and_then(Value::as_str)
            .unwrap_or("session reported an error")
            .to_string()
    }
}

/// `session.event` notification parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEventParams {
    pub session_id: String,
    pub event: SessionEvent,
}

/// A `session.lifecycle` broadcast (session created / deleted /
/// foreground change), distinct from in-session events.
#[derive(Debug, Clone)]
pub struct LifecycleEvent {
    /// The lifecycle event type (e.g. `created`, `deleted`).
    pub kind: String,
    /// The session the broadcast refers to, when one is named.
    pub session_id: Option<String>,
    /// The raw notification params.
    pub params: Value,
}

impl LifecycleEvent {
    pub(crate) fn from_params(params: Value) -> Self {
        let kind = params
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let session_id = params
            .get("sessionId")
            .and_then(Value::as_str)
            .map(|s| s.to_string());
        Self {
            kind,
            session_id,
            params,
        }
    }
}
