//! Connection lifecycle
//!
//! Owns the single WebSocket connection to the gateway: handshake,
//! auto-reconnect with backoff, frame classification, and the built-in
//! handling of chat and session events. Collaborators hold a
//! `GatewayClient`; the connection itself runs in a background task.
//!
//! State machine: `disconnected → connecting → handshaking → connected →
//! disconnected`. Exactly one connection is live at a time; a new attempt
//! only starts after the previous one's cleanup has completed.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use skybridge_protocol::{
    chat::ChatEvent,
    decode_frame, encode_frame,
    frames::{EventFrame, Frame},
    ClientInfo, ConnectParams, ErrorShape, HelloOk, HANDSHAKE_TIMEOUT_MS, PROTOCOL_VERSION,
};

use crate::backoff::{ReconnectPolicy, DEFAULT_CEILING, DEFAULT_FLOOR};
use crate::error::Error;
use crate::events::EventRouter;
use crate::rpc::RpcCorrelator;
use crate::sessions::SessionDirectory;
use crate::stream::{route, session_effects, ChatStream};

/// Timeout for individual RPC calls.
const RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Client configuration for one gateway connection.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL, e.g. `ws://127.0.0.1:4180/ws`.
    pub url: String,
    /// Bearer token attached to the handshake, if any.
    pub token: Option<String>,
    /// Client id presented in the handshake.
    pub client_id: String,
    /// Client mode presented in the handshake.
    pub mode: String,
    /// Session shown at startup.
    pub initial_session: String,
    pub reconnect_floor: Duration,
    pub reconnect_ceiling: Duration,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            client_id: "skybridge".into(),
            mode: "operator".into(),
            initial_session: "main".into(),
            reconnect_floor: DEFAULT_FLOOR,
            reconnect_ceiling: DEFAULT_CEILING,
        }
    }
}

/// Lifecycle notifications delivered to the owner of the client.
#[derive(Debug)]
pub enum ClientEvent {
    Connected(Box<HelloOk>),
    Disconnected,
    /// A visible system notice (handshake rejection, server shutdown).
    Notice(String),
    /// The transcript or session directory changed; re-render.
    ViewChanged,
}

/// Coarse connection state, readable without locking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Handshaking,
    Connected {
        protocol: u32,
        server_version: String,
    },
}

/// Transcript and session-list state owned by the connection, readable by
/// the page layer under a short lock.
pub struct ClientView {
    stream: ChatStream,
    directory: SessionDirectory,
    switching: bool,
}

impl ClientView {
    pub fn transcript(&self) -> &[crate::stream::TranscriptEntry] {
        self.stream.transcript()
    }

    /// The transient working indicator, when the viewed session is thinking.
    pub fn thinking(&self) -> Option<&str> {
        self.stream.thinking()
    }

    pub fn directory(&self) -> &SessionDirectory {
        &self.directory
    }

    /// Mutable transcript access for history loading during a session switch.
    pub fn stream_mut(&mut self) -> &mut ChatStream {
        &mut self.stream
    }
}

type ConnectedHook = Arc<dyn Fn(&HelloOk) + Send + Sync>;

/// Post-connect hooks plus the handshake of the live connection, guarded by
/// one lock so registration and handshake delivery cannot interleave: a hook
/// either makes the handshake's snapshot or observes `current` and runs at
/// registration, never both and never neither.
#[derive(Default)]
struct HookRegistry {
    hooks: Vec<ConnectedHook>,
    /// `hello-ok` of the live connection; `None` while disconnected.
    current: Option<HelloOk>,
}

enum Outbound {
    Frame(String),
    Shutdown,
}

struct Shared {
    config: ClientConfig,
    rpc: RpcCorrelator,
    router: Mutex<EventRouter>,
    view: Mutex<ClientView>,
    status: ArcSwap<ConnectionStatus>,
    wake: Notify,
    hooks: Mutex<HookRegistry>,
    write_tx: mpsc::UnboundedSender<Outbound>,
    event_tx: mpsc::UnboundedSender<ClientEvent>,
}

/// Handle to the gateway connection. Cheap to clone; the connection task
/// keeps running until `shutdown()` is called.
#[derive(Clone)]
pub struct GatewayClient {
    shared: Arc<Shared>,
}

impl GatewayClient {
    /// Spawn the connection task. Returns immediately; lifecycle events
    /// arrive on `event_tx`.
    pub fn spawn(config: ClientConfig, event_tx: mpsc::UnboundedSender<ClientEvent>) -> Self {
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            view: Mutex::new(ClientView {
                stream: ChatStream::new(),
                directory: SessionDirectory::new(config.initial_session.clone()),
                switching: false,
            }),
            config,
            rpc: RpcCorrelator::new(),
            router: Mutex::new(EventRouter::new()),
            status: ArcSwap::from_pointee(ConnectionStatus::Disconnected),
            wake: Notify::new(),
            hooks: Mutex::new(HookRegistry::default()),
            write_tx,
            event_tx,
        });

        tokio::spawn(connection_loop(shared.clone(), write_rx));

        Self { shared }
    }

    /// Issue an RPC and wait for the matching response.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, Error> {
        call_on(&self.shared, method, params).await
    }

    /// Send an RPC without waiting for a response.
    pub fn notify(&self, method: &str, params: Value) {
        let frame = self.shared.rpc.begin_notify(method, Some(params));
        let text = encode_frame(&Frame::Request(frame));
        let _ = self.shared.write_tx.send(Outbound::Frame(text));
    }

    /// Register an external listener for a broadcast event.
    pub fn on(&self, event: &str, listener: impl FnMut(&Value) + Send + 'static) {
        self.shared.router.lock().unwrap().on(event, listener);
    }

    /// Register a hook invoked exactly once per successful handshake
    /// (session-list refresh, model-list refresh, …). A hook registered
    /// while a connection is already up runs immediately for it, so the
    /// handshake that won the registration race is not missed.
    pub fn on_connected(&self, hook: impl Fn(&HelloOk) + Send + Sync + 'static) {
        let hook: ConnectedHook = Arc::new(hook);
        let live = {
            let mut registry = self.shared.hooks.lock().unwrap();
            registry.hooks.push(hook.clone());
            registry.current.clone()
        };
        if let Some(hello) = live {
            hook(&hello);
        }
    }

    /// Re-fetch the session list from the gateway in the background.
    pub fn refresh_sessions(&self) {
        spawn_directory_refresh(self.shared.clone());
    }

    /// Force an immediate reconnect attempt (tab became visible again),
    /// cancelling any pending backoff timer.
    pub fn force_reconnect(&self) {
        self.shared.wake.notify_one();
    }

    /// Current connection status, lock-free.
    pub fn status(&self) -> ConnectionStatus {
        self.shared.status.load().as_ref().clone()
    }

    /// Read the transcript/session view under a short lock.
    pub fn with_view<R>(&self, f: impl FnOnce(&ClientView) -> R) -> R {
        let view = self.shared.view.lock().unwrap();
        f(&view)
    }

    /// Mutate the view (history loading during a session switch).
    pub fn with_view_mut<R>(&self, f: impl FnOnce(&mut ClientView) -> R) -> R {
        let mut view = self.shared.view.lock().unwrap();
        f(&mut view)
    }

    /// Start switching to `key`: suppress chat-event rendering until the
    /// session's history has been loaded via `finish_session_switch`.
    pub fn begin_session_switch(&self, key: &str) {
        let mut view = self.shared.view.lock().unwrap();
        view.switching = true;
        view.directory.set_active(key);
        view.directory.mark_read(key);
        view.stream.reset();
    }

    /// Finish a session switch after history loading. `last_history_index`
    /// is the highest message index materialized from persisted history.
    pub fn finish_session_switch(&self, last_history_index: Option<u64>) {
        let mut view = self.shared.view.lock().unwrap();
        if let Some(index) = last_history_index {
            let key = view.directory.active().to_string();
            view.directory.set_progress(&key, index);
        }
        view.switching = false;
    }

    /// Tear the connection down for good.
    pub fn shutdown(&self) {
        let _ = self.shared.write_tx.send(Outbound::Shutdown);
        self.shared.wake.notify_one();
    }
}

async fn call_on(shared: &Arc<Shared>, method: &str, params: Value) -> Result<Value, Error> {
    let (frame, rx) = shared.rpc.begin(method, Some(params));
    let id = frame.id.clone();
    let text = encode_frame(&Frame::Request(frame));
    if shared.write_tx.send(Outbound::Frame(text)).is_err() {
        shared.rpc.forget(&id);
        return Err(Error::Disconnected("connection task has exited".into()));
    }

    match tokio::time::timeout(RPC_TIMEOUT, rx).await {
        Ok(Ok(response)) => {
            if response.ok {
                Ok(response.payload.unwrap_or(Value::Null))
            } else {
                let shape = response
                    .error
                    .unwrap_or_else(|| ErrorShape::new("UNKNOWN", "unknown RPC error"));
                Err(Error::Rpc(shape))
            }
        }
        Ok(Err(_)) => Err(Error::Disconnected("completion dropped".into())),
        Err(_) => {
            shared.rpc.forget(&id);
            Err(Error::Protocol(format!(
                "RPC '{method}' timed out after {}s",
                RPC_TIMEOUT.as_secs()
            )))
        }
    }
}

fn build_connect_params(config: &ClientConfig) -> ConnectParams {
    ConnectParams {
        min_protocol: PROTOCOL_VERSION,
        max_protocol: PROTOCOL_VERSION,
        client: ClientInfo {
            id: config.client_id.clone(),
            version: env!("CARGO_PKG_VERSION").into(),
            platform: std::env::consts::OS.into(),
            mode: config.mode.clone(),
            instance_id: Some(uuid::Uuid::new_v4().to_string()),
        },
        auth: config.token.clone().map(|token| {
            skybridge_protocol::connect::ConnectAuth { token: Some(token) }
        }),
        user_agent: Some(format!(
            "{}/{}",
            config.client_id,
            env!("CARGO_PKG_VERSION")
        )),
    }
}

enum RunEnd {
    ServerClosed,
    Shutdown,
}

/// Main connection loop with auto-reconnect.
async fn connection_loop(shared: Arc<Shared>, mut write_rx: mpsc::UnboundedReceiver<Outbound>) {
    let mut policy = ReconnectPolicy::new(
        shared.config.reconnect_floor,
        shared.config.reconnect_ceiling,
    );

    loop {
        shared
            .status
            .store(Arc::new(ConnectionStatus::Connecting));
        info!(
            component = "connection",
            event = "conn.attempt",
            url = %shared.config.url,
            "connecting to gateway"
        );

        let mut shutdown = false;
        match connect_and_run(&shared, &mut write_rx, &mut policy).await {
            Ok(RunEnd::ServerClosed) => {
                debug!(
                    component = "connection",
                    event = "conn.closed",
                    "connection closed by server"
                );
            }
            Ok(RunEnd::Shutdown) => shutdown = true,
            Err(e) => {
                error!(
                    component = "connection",
                    event = "conn.error",
                    error = %e,
                    "connection error"
                );
                if let Error::Handshake(message) = &e {
                    let _ = shared
                        .event_tx
                        .send(ClientEvent::Notice(format!("Connection rejected: {message}")));
                }
            }
        }

        // Disconnect cleanup: no pending call may outlive the connection,
        // and per-turn stream state never survives a reconnect.
        shared.hooks.lock().unwrap().current = None;
        shared.rpc.reject_all();
        shared.view.lock().unwrap().stream.clear_stream_state();
        shared
            .status
            .store(Arc::new(ConnectionStatus::Disconnected));
        let _ = shared.event_tx.send(ClientEvent::Disconnected);

        // Frames queued while disconnected belong to calls that were just
        // force-rejected; drop them.
        loop {
            match write_rx.try_recv() {
                Ok(Outbound::Frame(_)) => continue,
                Ok(Outbound::Shutdown) => {
                    shutdown = true;
                    break;
                }
                Err(_) => break,
            }
        }
        if shutdown {
            info!(
                component = "connection",
                event = "conn.shutdown",
                "connection loop stopped"
            );
            return;
        }

        let delay = policy.next_delay();
        info!(
            component = "connection",
            event = "conn.reconnect_scheduled",
            delay_ms = delay.as_millis() as u64,
            "reconnecting after delay"
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shared.wake.notified() => {
                info!(
                    component = "connection",
                    event = "conn.reconnect_forced",
                    "manual reconnect, backoff timer cancelled"
                );
            }
        }
    }
}

/// Single attempt: open the transport, handshake, then pump frames until
/// the connection ends.
async fn connect_and_run(
    shared: &Arc<Shared>,
    write_rx: &mut mpsc::UnboundedReceiver<Outbound>,
    policy: &mut ReconnectPolicy,
) -> Result<RunEnd, Error> {
    let (ws_stream, _response) = connect_async(shared.config.url.as_str()).await?;
    let (mut ws_sink, mut ws_reader) = ws_stream.split();

    shared
        .status
        .store(Arc::new(ConnectionStatus::Handshaking));

    // The handshake is the first request on the wire.
    let connect_id = shared.rpc.next_id();
    let connect_frame = Frame::Request(skybridge_protocol::frames::RequestFrame {
        id: connect_id.clone(),
        method: "connect".into(),
        params: Some(serde_json::to_value(build_connect_params(&shared.config))?),
    });
    ws_sink
        .send(Message::Text(encode_frame(&connect_frame).into()))
        .await?;

    let hello = wait_for_hello(&mut ws_reader, &connect_id).await?;
    info!(
        component = "connection",
        event = "conn.connected",
        protocol = hello.protocol,
        server_version = %hello.server.version,
        conn_id = %hello.server.conn_id,
        "connected to gateway"
    );
    shared.status.store(Arc::new(ConnectionStatus::Connected {
        protocol: hello.protocol,
        server_version: hello.server.version.clone(),
    }));
    policy.reset();

    // Post-connect refresh hooks run exactly once per successful handshake.
    // Recording the handshake and snapshotting the hook list happen under
    // one lock acquisition; see `HookRegistry`.
    let hooks: Vec<ConnectedHook> = {
        let mut registry = shared.hooks.lock().unwrap();
        registry.current = Some(hello.clone());
        registry.hooks.clone()
    };
    for hook in hooks {
        hook(&hello);
    }
    let _ = shared
        .event_tx
        .send(ClientEvent::Connected(Box::new(hello)));

    loop {
        tokio::select! {
            msg = ws_reader.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_wire_text(shared, text.as_ref());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sink.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return Ok(RunEnd::ServerClosed);
                    }
                    Some(Ok(_)) => {} // binary, pong: ignore
                    Some(Err(e)) => return Err(Error::WebSocket(e)),
                }
            }
            outbound = write_rx.recv() => {
                match outbound {
                    Some(Outbound::Frame(text)) => {
                        ws_sink.send(Message::Text(text.into())).await?;
                    }
                    Some(Outbound::Shutdown) | None => {
                        let _ = ws_sink.send(Message::Close(None)).await;
                        return Ok(RunEnd::Shutdown);
                    }
                }
            }
        }
    }
}

/// Wait for the response to the `connect` request, skipping any events the
/// gateway pushes before it.
async fn wait_for_hello<S>(reader: &mut S, connect_id: &str) -> Result<HelloOk, Error>
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let timeout = Duration::from_millis(HANDSHAKE_TIMEOUT_MS);
    let result = tokio::time::timeout(timeout, async {
        while let Some(msg) = reader.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    let Ok(Frame::Response(res)) = decode_frame(text.as_ref()) else {
                        continue;
                    };
                    if res.id != connect_id {
                        continue;
                    }
                    if !res.ok {
                        return Err(Error::Handshake(res.error_message()));
                    }
                    let Some(payload) = res.payload else {
                        return Err(Error::Protocol("hello-ok response missing payload".into()));
                    };
                    let hello: HelloOk = serde_json::from_value(payload)?;
                    return Ok(hello);
                }
                Ok(Message::Close(_)) => {
                    return Err(Error::Connection(
                        "server closed connection during handshake".into(),
                    ));
                }
                Ok(_) => {}
                Err(e) => return Err(Error::WebSocket(e)),
            }
        }
        Err(Error::Connection("connection closed before handshake".into()))
    })
    .await;

    match result {
        Ok(inner) => inner,
        Err(_) => Err(Error::Connection("handshake timed out".into())),
    }
}

/// Classify one inbound wire message. A frame that fails to decode is
/// dropped; it must not tear down the connection.
fn handle_wire_text(shared: &Arc<Shared>, text: &str) {
    match decode_frame(text) {
        Ok(Frame::Response(res)) => shared.rpc.resolve(res),
        Ok(Frame::Event(ev)) => handle_event(shared, ev),
        Ok(Frame::Request(req)) => {
            debug!(
                component = "connection",
                event = "conn.frame.server_request",
                method = %req.method,
                "ignoring server-initiated request"
            );
        }
        Err(e) => {
            warn!(
                component = "connection",
                event = "conn.frame.undecodable",
                error = %e,
                payload_bytes = text.len(),
                "dropping undecodable frame"
            );
        }
    }
}

/// Fan an event out to external listeners, then run the built-in handler.
/// Listeners observe; they never gate what the built-in sees.
fn handle_event(shared: &Arc<Shared>, frame: EventFrame) {
    let payload = frame.payload.unwrap_or(Value::Null);
    shared
        .router
        .lock()
        .unwrap()
        .dispatch(&frame.event, &payload);

    match frame.event.as_str() {
        "chat" => handle_chat_event(shared, &payload),
        "session" => handle_session_event(shared, &payload),
        "shutdown" => {
            let _ = shared
                .event_tx
                .send(ClientEvent::Notice("Server is shutting down.".into()));
        }
        "tick" | "presence" | "health" => {}
        other => {
            debug!(
                component = "connection",
                event = "conn.event.unhandled",
                name = other,
                "event with no built-in handler"
            );
        }
    }
}

/// Built-in `chat` handler: route to the owning session, apply transcript
/// mutations for the viewed session, and always apply list bookkeeping.
fn handle_chat_event(shared: &Arc<Shared>, payload: &Value) {
    let Some(ev) = ChatEvent::from_payload(payload) else {
        return;
    };

    let mut needs_refresh = false;
    let mut changed = false;
    {
        let mut view = shared.view.lock().unwrap();
        let active = view.directory.active().to_string();
        let session = ev.session_key.clone().unwrap_or_else(|| active.clone());
        let decision = route(
            ev.session_key.as_deref(),
            &active,
            view.directory.is_known(&session),
            view.switching,
        );

        // Never drop an event because local metadata is stale: make the
        // session exist, then ask for a directory refresh.
        if decision.needs_refresh {
            view.directory.upsert(&decision.session, None);
            needs_refresh = true;
        }

        if decision.render {
            let progress = view.directory.progress(&decision.session);
            changed = view.stream.apply(&ev, progress);
        }

        for effect in session_effects(&ev, &decision.session, &active) {
            view.directory.apply(effect);
            changed = true;
        }
    }

    if needs_refresh {
        spawn_directory_refresh(shared.clone());
    }
    if changed {
        let _ = shared.event_tx.send(ClientEvent::ViewChanged);
    }
}

/// Built-in `session` handler: keep the directory in step with created,
/// renamed, and deleted sessions.
fn handle_session_event(shared: &Arc<Shared>, payload: &Value) {
    let kind = payload.get("kind").and_then(Value::as_str).unwrap_or("");
    let Some(key) = payload.get("sessionKey").and_then(Value::as_str) else {
        return;
    };

    let mut view = shared.view.lock().unwrap();
    match kind {
        "created" | "patched" => {
            let label = payload
                .get("label")
                .and_then(Value::as_str)
                .map(str::to_string);
            view.directory.upsert(key, label);
        }
        "deleted" => view.directory.remove(key),
        _ => return,
    }
    drop(view);
    let _ = shared.event_tx.send(ClientEvent::ViewChanged);
}

/// Refresh the session directory from the gateway, off the read path.
fn spawn_directory_refresh(shared: Arc<Shared>) {
    tokio::spawn(async move {
        match call_on(&shared, "sessions.list", Value::Null).await {
            Ok(payload) => {
                shared
                    .view
                    .lock()
                    .unwrap()
                    .directory
                    .replace_from_list(&payload);
                let _ = shared.event_tx.send(ClientEvent::ViewChanged);
            }
            Err(e) => {
                warn!(
                    component = "connection",
                    event = "conn.directory_refresh_failed",
                    error = %e,
                    "session directory refresh failed"
                );
            }
        }
    });
}
