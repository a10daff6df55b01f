use skybridge_protocol::ErrorShape;

/// Errors surfaced by the gateway client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("handshake rejected: {0}")]
    Handshake(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    /// The connection dropped while this call was pending.
    #[error("disconnected: {0}")]
    Disconnected(String),

    /// The gateway answered `ok:false` for this specific call.
    #[error("{} ({})", .0.message, .0.code)]
    Rpc(ErrorShape),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error came from the disconnect-forced mass rejection.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::Disconnected(_) => true,
            Error::Rpc(shape) => shape.code == skybridge_protocol::error_codes::DISCONNECTED,
            _ => false,
        }
    }
}
