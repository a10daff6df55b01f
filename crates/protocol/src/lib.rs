//! Skybridge gateway protocol
//!
//! Protocol version 3. All communication is JSON frames over a single
//! WebSocket connection:
//! - `Frame::Request`: client to gateway RPC call (`"req"`)
//! - `Frame::Response`: gateway to client RPC result (`"res"`)
//! - `Frame::Event`: gateway to client server-push (`"event"`)
//!
//! RPC methods use dotted names (`sessions.list`, `chat.send`). The first
//! request on every connection is `connect`, answered by a `hello-ok`
//! payload carrying the negotiated protocol and server identity.

use serde::{Deserialize, Serialize};

pub mod chat;
pub mod connect;
pub mod frames;

pub use chat::{ChatEvent, ChatState, CompactPhase};
pub use connect::{ClientInfo, ConnectParams, Features, HelloOk, ServerInfo};
pub use frames::{decode_frame, encode_frame, DecodeError, Frame};

/// Protocol version this client speaks (both minimum and maximum).
pub const PROTOCOL_VERSION: u32 = 3;

/// How long the client waits for the `hello-ok` response.
pub const HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

/// Error codes used in `ErrorShape.code`.
pub mod error_codes {
    /// The connection dropped while the request was pending.
    pub const DISCONNECTED: &str = "DISCONNECTED";
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const UNAVAILABLE: &str = "UNAVAILABLE";
}

/// Error payload attached to failed responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    #[serde(rename = "retryAfterMs", skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ErrorShape {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            retryable: None,
            retry_after_ms: None,
        }
    }

    /// The synthetic error used when a disconnect force-rejects pending RPCs.
    pub fn disconnected() -> Self {
        Self::new(error_codes::DISCONNECTED, "connection closed")
    }
}
