//! Chat event payloads
//!
//! The `chat` broadcast event carries the streaming sub-protocol for one
//! assistant turn: `thinking → delta* → (tool_call_start → tool_call_end)*
//! → final | error`, plus side notices (`auto_compact`, `notice`, …).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The `state` discriminant of a chat event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatState {
    Thinking,
    ThinkingText,
    ToolCallStart,
    ToolCallEnd,
    ChannelUser,
    Delta,
    Final,
    AutoCompact,
    Error,
    Notice,
    VoicePending,
    QueueCleared,
    Retrying,
    /// States added by newer gateways; carried but not interpreted.
    #[serde(other)]
    Unknown,
}

/// Phase of an `auto_compact` notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactPhase {
    Start,
    Done,
    Error,
}

/// Payload of one `chat` event.
///
/// `session_key` is absent for events scoped to the active session;
/// `message_index` is present on events that correspond to a persisted
/// history entry and drives duplicate suppression.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatEvent {
    pub state: Option<ChatState>,
    #[serde(rename = "sessionKey", skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    #[serde(rename = "runId", skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(rename = "messageIndex", skip_serializing_if = "Option::is_none")]
    pub message_index: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(rename = "toolCallId", skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(rename = "toolName", skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<CompactPhase>,
    #[serde(rename = "retryAfterMs", skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ChatEvent {
    /// Parse a raw event payload. Unknown fields are ignored.
    pub fn from_payload(payload: &Value) -> Option<Self> {
        serde_json::from_value(payload.clone()).ok()
    }

    /// The tool stdout carried by a `tool_call_end`, if any.
    pub fn tool_stdout(&self) -> Option<&str> {
        self.result
            .as_ref()
            .and_then(|r| r.get("stdout"))
            .and_then(Value::as_str)
    }

    /// Human-readable error text, preferring `detail` over `title`.
    pub fn error_text(&self) -> Option<&str> {
        self.error.as_ref().and_then(|e| {
            e.get("detail")
                .or_else(|| e.get("title"))
                .or_else(|| e.get("message"))
                .and_then(Value::as_str)
                .or_else(|| e.as_str())
        })
    }
}
