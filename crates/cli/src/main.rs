//! Terminal front end for the Skybridge gateway.
//!
//! Connects once, then runs a line-oriented chat loop: stdin lines become
//! `chat.send` calls for the active session, streamed agent output is
//! printed as it arrives, and a few slash commands manage sessions.

use std::io::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use skybridge_client::{
    ClientConfig, ClientEvent, GatewayClient, SessionEntry, TranscriptEntry,
};
use skybridge_protocol::chat::{ChatEvent, ChatState};

#[derive(Parser, Debug)]
#[command(name = "skybridge", about = "Chat with gateway agent sessions from the terminal")]
struct Cli {
    /// Gateway WebSocket URL
    #[arg(long, env = "SKYBRIDGE_URL", default_value = "ws://127.0.0.1:4180/ws")]
    url: String,

    /// Bearer token for the gateway, if it requires one
    #[arg(long, env = "SKYBRIDGE_TOKEN")]
    token: Option<String>,

    /// Session to open at startup
    #[arg(long, default_value = "main")]
    session: String,

    /// Reconnect floor in milliseconds
    #[arg(long, default_value_t = 1000)]
    reconnect_floor_ms: u64,
}

fn log_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".skybridge")
        .join("logs")
}

fn init_logging() -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    let dir = log_dir();
    std::fs::create_dir_all(&dir).context("creating log directory")?;
    let appender = tracing_appender::rolling::daily(dir, "skybridge.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Ok(guard)
}

fn print_chunk(text: &str) {
    let mut out = std::io::stdout().lock();
    let _ = out.write_all(text.as_bytes());
    let _ = out.flush();
}

/// Print streamed chat output for the viewed session as it arrives.
///
/// Tracks how much of the reply was already streamed as deltas so the full
/// text on `final` is not printed a second time.
fn install_chat_printer(client: &GatewayClient) {
    let view_client = client.clone();
    let mut streamed = 0usize;
    client.on("chat", move |payload: &Value| {
        let Some(ev) = ChatEvent::from_payload(payload) else {
            return;
        };
        let active = view_client.with_view(|v| v.directory().active().to_string());
        if ev.session_key.as_deref().is_some_and(|key| key != active) {
            return;
        }
        match ev.state {
            Some(ChatState::Delta) => {
                if let Some(text) = &ev.text {
                    streamed += text.len();
                    print_chunk(text);
                }
            }
            Some(ChatState::Final) => {
                match &ev.text {
                    Some(text) if streamed == 0 && !text.is_empty() => {
                        print_chunk(text);
                    }
                    _ => {}
                }
                if streamed > 0 || ev.text.as_deref().is_some_and(|t| !t.is_empty()) {
                    print_chunk("\n");
                }
                streamed = 0;
            }
            Some(ChatState::ToolCallStart) => {
                let name = ev.tool_name.as_deref().unwrap_or("tool");
                print_chunk(&format!("\n[{name}] running…\n"));
            }
            Some(ChatState::ToolCallEnd) => {
                let ok = ev.success.unwrap_or(true);
                print_chunk(if ok { "[tool done]\n" } else { "[tool failed]\n" });
            }
            Some(ChatState::ChannelUser) => {
                if let Some(text) = &ev.text {
                    print_chunk(&format!("\n[channel] {text}\n"));
                }
            }
            Some(ChatState::Error) => {
                let text = ev.error_text().unwrap_or("agent error");
                print_chunk(&format!("\nerror: {text}\n"));
                streamed = 0;
            }
            Some(ChatState::Retrying) => {
                let seconds = ev.retry_after_ms.unwrap_or(0) as f64 / 1000.0;
                let reason = ev.error_text().unwrap_or("rate limited");
                print_chunk(&format!("\n[retrying in {seconds:.1}s: {reason}]\n"));
            }
            Some(ChatState::Notice) => {
                let title = ev.title.as_deref().unwrap_or("notice");
                let message = ev.message.as_deref().unwrap_or("");
                print_chunk(&format!("\n[{title}] {message}\n"));
            }
            _ => {}
        }
    });
}

fn print_sessions(entries: &[SessionEntry], active: &str) {
    for entry in entries {
        let marker = if entry.key == active { "*" } else { " " };
        let mut flags = String::new();
        if entry.replying {
            flags.push_str(" [replying]");
        }
        if entry.unread {
            flags.push_str(" [unread]");
        }
        println!("{marker} {}{flags}", entry.display_name());
    }
}

/// Load a session's persisted history, then route live events to it.
async fn switch_session(client: &GatewayClient, key: &str) {
    client.begin_session_switch(key);
    match client
        .call("chat.history", json!({"sessionKey": key}))
        .await
    {
        Ok(payload) => {
            let entries = payload
                .get("entries")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            client.with_view_mut(|view| {
                for item in &entries {
                    let text = item
                        .get("text")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let entry = match item.get("role").and_then(Value::as_str) {
                        Some("user") => TranscriptEntry::User { text },
                        Some("system") => TranscriptEntry::System { text },
                        _ => TranscriptEntry::Assistant { text },
                    };
                    view.stream_mut().push_history(entry);
                }
            });
            let last_index = payload.get("lastHistoryIndex").and_then(Value::as_u64);
            client.finish_session_switch(last_index);
            for item in &entries {
                if let Some(text) = item.get("text").and_then(Value::as_str) {
                    let role = item.get("role").and_then(Value::as_str).unwrap_or("agent");
                    println!("{role}> {text}");
                }
            }
            println!("switched to {key}");
        }
        Err(e) => {
            // Live events still flow; they just cannot be deduplicated
            // against history that failed to load.
            client.finish_session_switch(None);
            eprintln!("history load failed: {e}");
        }
    }
}

async fn handle_line(client: &GatewayClient, line: &str) -> bool {
    let line = line.trim();
    if line.is_empty() {
        return true;
    }
    match line.split_once(' ') {
        _ if line == "/quit" => return false,
        _ if line == "/sessions" => {
            client.with_view(|view| {
                print_sessions(view.directory().entries(), view.directory().active());
            });
        }
        _ if line == "/reconnect" => client.force_reconnect(),
        Some(("/switch", key)) => switch_session(client, key.trim()).await,
        _ => {
            let session = client.with_view(|v| v.directory().active().to_string());
            let result = client
                .call("chat.send", json!({"sessionKey": session, "text": line}))
                .await;
            if let Err(e) = result {
                eprintln!("send failed: {e}");
            }
        }
    }
    true
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging()?;
    info!(component = "cli", event = "cli.start", url = %cli.url, "starting");

    let mut config = ClientConfig::new(cli.url);
    config.token = cli.token;
    config.client_id = "skybridge-cli".into();
    config.initial_session = cli.session;
    config.reconnect_floor = Duration::from_millis(cli.reconnect_floor_ms.max(100));

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let client = GatewayClient::spawn(config, event_tx);

    // Session metadata is gateway state; re-pull it after every handshake.
    {
        let refresh = client.clone();
        client.on_connected(move |_| refresh.refresh_sessions());
    }
    install_chat_printer(&client);

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = event_rx.recv() => {
                match event {
                    Some(ClientEvent::Connected(hello)) => {
                        println!(
                            "connected (protocol {}, server {})",
                            hello.protocol, hello.server.version
                        );
                    }
                    Some(ClientEvent::Disconnected) => {
                        println!("disconnected, retrying…");
                    }
                    Some(ClientEvent::Notice(text)) => println!("{text}"),
                    Some(ClientEvent::ViewChanged) => {}
                    None => break,
                }
            }
            line = stdin.next_line() => {
                match line.context("reading stdin")? {
                    Some(line) => {
                        if !handle_line(&client, &line).await {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    client.shutdown();
    info!(component = "cli", event = "cli.stop", "exiting");
    Ok(())
}
