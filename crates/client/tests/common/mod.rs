//! Mock gateway for integration tests: an axum WebSocket endpoint that the
//! test drives frame by frame.

use std::future::Future;

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    routing::any,
    Router,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;

/// Start a mock gateway; every accepted WebSocket runs `handler`. Returns
/// the `ws://` URL to connect to.
pub async fn serve<F, Fut>(handler: F) -> String
where
    F: Fn(WebSocket) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let app = Router::new().route(
        "/ws",
        any(move |ws: WebSocketUpgrade| {
            let handler = handler.clone();
            async move { ws.on_upgrade(move |socket| handler(socket)) }
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("ws://{addr}/ws")
}

/// Read frames until a text frame arrives; returns its parsed JSON.
pub async fn recv_json(socket: &mut WebSocket) -> Option<Value> {
    while let Some(msg) = socket.recv().await {
        match msg.ok()? {
            Message::Text(text) => return serde_json::from_str(text.as_str()).ok(),
            Message::Close(_) => return None,
            _ => continue,
        }
    }
    None
}

pub async fn send_json(socket: &mut WebSocket, value: &Value) {
    let text = value.to_string();
    socket
        .send(Message::Text(text.into()))
        .await
        .expect("send frame");
}

/// Consume the `connect` request and answer with `hello-ok`. Returns the
/// connect request frame.
pub async fn accept_handshake(socket: &mut WebSocket) -> Value {
    let frame = recv_json(socket).await.expect("connect frame");
    assert_eq!(frame["type"], "req");
    assert_eq!(frame["method"], "connect");
    assert_eq!(frame["params"]["minProtocol"], 3);
    send_json(
        socket,
        &json!({
            "type": "res",
            "id": frame["id"],
            "ok": true,
            "payload": {
                "type": "hello-ok",
                "protocol": 3,
                "server": {"version": "0.0.0-mock", "connId": "c-test"}
            }
        }),
    )
    .await;
    frame
}

/// Push a broadcast event frame.
pub async fn send_event(socket: &mut WebSocket, event: &str, payload: Value) {
    send_json(
        socket,
        &json!({"type": "event", "event": event, "payload": payload}),
    )
    .await;
}
