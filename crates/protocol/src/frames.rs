//! Frame envelope and codec
//!
//! One JSON message on the wire is one `Frame`, discriminated by its `type`
//! field. The codec is stateless; a frame that fails to decode is reported
//! as a `DecodeError` and the connection stays up.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ErrorShape;

/// Discriminated union of all wire frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    #[serde(rename = "req")]
    Request(RequestFrame),
    #[serde(rename = "res")]
    Response(ResponseFrame),
    #[serde(rename = "event")]
    Event(EventFrame),
}

/// Client → gateway RPC request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Gateway → client RPC response, matched to its request by `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

impl ResponseFrame {
    /// Synthetic failure used when a disconnect force-rejects a pending call.
    pub fn disconnected(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(ErrorShape::disconnected()),
        }
    }

    /// The error message, or a placeholder when the gateway sent none.
    pub fn error_message(&self) -> String {
        self.error
            .as_ref()
            .map(|e| e.message.clone())
            .unwrap_or_else(|| "unknown error".into())
    }
}

/// Gateway → client server-push event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrame {
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

/// A frame that could not be decoded. The transport drops these.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing or unknown frame discriminant")]
    Discriminant,
}

/// Serialize a frame to wire text.
pub fn encode_frame(frame: &Frame) -> String {
    // Frames contain only JSON-representable data; serialization cannot fail.
    serde_json::to_string(frame).unwrap_or_default()
}

/// Parse wire text into a frame.
pub fn decode_frame(text: &str) -> Result<Frame, DecodeError> {
    let value: Value = serde_json::from_str(text)?;
    if value.get("type").and_then(Value::as_str).is_none() {
        return Err(DecodeError::Discriminant);
    }
    serde_json::from_value(value).map_err(|_| DecodeError::Discriminant)
}
