//! Chat stream state machine
//!
//! Pure interpretation of the ordered chat events for one session into
//! transcript mutations: `transition(state, event) -> changes + effects`.
//! No IO, no async. The connection task owns a `ChatStream` per viewed
//! session and applies events to it; session-list bookkeeping comes back
//! as explicit `SessionEffect` values so it happens even when transcript
//! rendering is skipped.

use serde_json::Value;
use tracing::debug;

use skybridge_protocol::chat::{ChatEvent, ChatState, CompactPhase};

use crate::sessions::SessionEffect;

/// How many normalized characters of a final reply are compared against the
/// last tool stdout when deciding whether the reply merely echoes it.
/// A heuristic, tunable, not a protocol guarantee.
pub const ECHO_PREFIX_CHARS: usize = 80;

/// One materialized transcript entry.
#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptEntry {
    User {
        text: String,
    },
    Assistant {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        arguments: Option<Value>,
        output: Option<String>,
        ok: Option<bool>,
    },
    System {
        text: String,
    },
    Error {
        text: String,
    },
}

/// Per-turn stream scratch state. Reset whenever the stream closes
/// (final/error), the viewer navigates away, or the connection drops.
#[derive(Debug, Default)]
struct StreamState {
    /// Accumulated delta fragments for the in-progress entry.
    buffer: String,
    /// Index of the transcript entry being extended, if one is open.
    open_entry: Option<usize>,
    /// Transient "working" indicator label; no transcript space.
    thinking: Option<String>,
    /// Most recent tool stdout, for echo suppression at `final`.
    last_tool_output: Option<String>,
    /// Reply is arriving via an alternate medium; deltas stay silent.
    voice_pending: bool,
    /// The auto-compact placeholder awaiting its outcome.
    compact_ref: Option<usize>,
}

/// Transcript plus stream scratch state for the session being viewed.
#[derive(Debug, Default)]
pub struct ChatStream {
    transcript: Vec<TranscriptEntry>,
    state: StreamState,
}

/// Where an event should go, decided before any transition runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    /// The session the event belongs to (the active one when unscoped).
    pub session: String,
    /// Whether transcript-mutating transitions run.
    pub render: bool,
    /// The session is not in the local directory; refresh it.
    pub needs_refresh: bool,
}

/// Classify an event's target session. Pure function of the event's session
/// key, the active session, whether that session is locally known, and
/// whether a session switch is in progress.
pub fn route(
    event_session: Option<&str>,
    active: &str,
    known: bool,
    switching: bool,
) -> RouteDecision {
    let session = event_session.unwrap_or(active).to_string();
    RouteDecision {
        render: session == active && !switching,
        needs_refresh: !known,
        session,
    }
}

/// Session-list bookkeeping for an event. Applied regardless of routing so
/// sidebar flags stay correct for sessions that are not being viewed.
pub fn session_effects(ev: &ChatEvent, session: &str, active: &str) -> Vec<SessionEffect> {
    let mut effects = Vec::new();
    match ev.state {
        Some(
            ChatState::Thinking
            | ChatState::ThinkingText
            | ChatState::Delta
            | ChatState::ToolCallStart
            | ChatState::ToolCallEnd
            | ChatState::Retrying,
        ) => effects.push(SessionEffect::SetReplying {
            key: session.to_string(),
            replying: true,
        }),
        Some(ChatState::Final | ChatState::Error | ChatState::QueueCleared) => {
            effects.push(SessionEffect::SetReplying {
                key: session.to_string(),
                replying: false,
            });
            if matches!(ev.state, Some(ChatState::Final | ChatState::Error)) && session != active {
                effects.push(SessionEffect::MarkUnread {
                    key: session.to_string(),
                });
            }
        }
        _ => {}
    }
    effects
}

impl ChatStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transcript(&self) -> &[TranscriptEntry] {
        &self.transcript
    }

    /// The transient working-indicator label, when a turn is thinking.
    pub fn thinking(&self) -> Option<&str> {
        self.state.thinking.as_deref()
    }

    /// Full reset: navigation away or session switch.
    pub fn reset(&mut self) {
        self.transcript.clear();
        self.state = StreamState::default();
    }

    /// Drop per-turn scratch state but keep the transcript (disconnect).
    pub fn clear_stream_state(&mut self) {
        self.state = StreamState::default();
    }

    /// Seed an entry from persisted history (used while loading a session).
    pub fn push_history(&mut self, entry: TranscriptEntry) {
        self.transcript.push(entry);
    }

    /// Apply one chat event. `history_progress` is the session's
    /// `lastHistoryIndex`; events at or below it are duplicates of loaded
    /// history and mutate nothing. Returns true when the transcript or the
    /// working indicator changed.
    pub fn apply(&mut self, ev: &ChatEvent, history_progress: Option<u64>) -> bool {
        if let (Some(index), Some(progress)) = (ev.message_index, history_progress) {
            if index <= progress {
                debug!(
                    component = "chat_stream",
                    event = "chat.duplicate_of_history",
                    message_index = index,
                    "dropping live event already covered by loaded history"
                );
                // Terminal duplicates still close the turn's scratch state.
                if matches!(ev.state, Some(ChatState::Final | ChatState::Error)) {
                    self.state = StreamState::default();
                }
                return false;
            }
        }

        let Some(state) = ev.state else {
            return false;
        };

        match state {
            ChatState::Thinking => {
                self.state.thinking = Some("Thinking".into());
                self.state.buffer.clear();
                self.state.open_entry = None;
                true
            }
            ChatState::ThinkingText => {
                if let Some(text) = ev.text.as_deref() {
                    self.state.thinking = Some(text.to_string());
                    true
                } else {
                    false
                }
            }
            ChatState::Delta => self.on_delta(ev.text.as_deref().unwrap_or_default()),
            ChatState::ToolCallStart => self.on_tool_call_start(ev),
            ChatState::ToolCallEnd => self.on_tool_call_end(ev),
            ChatState::ChannelUser => {
                if let Some(text) = ev.text.clone() {
                    self.transcript.push(TranscriptEntry::User { text });
                    true
                } else {
                    false
                }
            }
            ChatState::Final => self.on_final(ev),
            ChatState::Error => {
                let text = ev.error_text().unwrap_or("unknown error").to_string();
                self.transcript.push(TranscriptEntry::Error { text });
                self.state = StreamState::default();
                true
            }
            ChatState::AutoCompact => self.on_auto_compact(ev),
            ChatState::Notice => {
                let Some(message) = ev.message.as_deref() else {
                    return false;
                };
                let title = ev.title.as_deref().unwrap_or("Notice");
                self.transcript.push(TranscriptEntry::System {
                    text: format!("{title}: {message}"),
                });
                true
            }
            ChatState::VoicePending => {
                self.state.voice_pending = true;
                false
            }
            ChatState::Retrying => {
                let seconds = ev.retry_after_ms.unwrap_or(0) as f64 / 1000.0;
                let reason = ev.error_text().unwrap_or("rate limited");
                self.transcript.push(TranscriptEntry::System {
                    text: format!("Retrying in {seconds:.1}s: {reason}"),
                });
                true
            }
            ChatState::QueueCleared => false,
            ChatState::Unknown => {
                debug!(
                    component = "chat_stream",
                    event = "chat.state.unknown",
                    "unhandled chat state"
                );
                false
            }
        }
    }

    fn on_delta(&mut self, text: &str) -> bool {
        self.state.thinking = None;
        self.state.buffer.push_str(text);

        // While a reply is pending via an alternate medium, accumulate
        // silently instead of flashing partial text.
        if self.state.voice_pending {
            return false;
        }

        let index = match self.state.open_entry {
            Some(index) => index,
            None => {
                self.transcript.push(TranscriptEntry::Assistant {
                    text: String::new(),
                });
                let index = self.transcript.len() - 1;
                self.state.open_entry = Some(index);
                index
            }
        };
        if let Some(TranscriptEntry::Assistant { text }) = self.transcript.get_mut(index) {
            *text = self.state.buffer.clone();
        }
        true
    }

    fn on_tool_call_start(&mut self, ev: &ChatEvent) -> bool {
        self.state.thinking = None;
        // Close the in-progress delta buffer so later deltas open a fresh
        // entry positioned after the tool record.
        self.state.open_entry = None;
        self.state.buffer.clear();

        self.transcript.push(TranscriptEntry::ToolCall {
            id: ev.tool_call_id.clone().unwrap_or_default(),
            name: ev.tool_name.clone().unwrap_or_else(|| "unknown".into()),
            arguments: ev.arguments.clone(),
            output: None,
            ok: None,
        });
        true
    }

    fn on_tool_call_end(&mut self, ev: &ChatEvent) -> bool {
        let call_id = ev.tool_call_id.as_deref().unwrap_or_default();
        let stdout = ev.tool_stdout().map(str::to_string);
        if let Some(out) = &stdout {
            self.state.last_tool_output = Some(out.clone());
        }

        // The record may have been evicted by navigation; that is fine.
        for entry in self.transcript.iter_mut().rev() {
            if let TranscriptEntry::ToolCall { id, output, ok, .. } = entry {
                if id == call_id {
                    *output = stdout;
                    *ok = ev.success;
                    return true;
                }
            }
        }
        false
    }

    fn on_final(&mut self, ev: &ChatEvent) -> bool {
        let text = ev.text.as_deref().unwrap_or_default();
        let content = if text.is_empty() {
            std::mem::take(&mut self.state.buffer)
        } else {
            text.to_string()
        };

        let changed = if echoes_tool_output(&content, self.state.last_tool_output.as_deref()) {
            // The closing message restates tool output already shown
            // verbatim; discard instead of duplicating.
            if let Some(index) = self.state.open_entry {
                self.transcript.remove(index);
            }
            true
        } else if content.is_empty() {
            // A turn of empty deltas must not leave an empty reply behind.
            if let Some(index) = self.state.open_entry {
                self.transcript.remove(index);
                true
            } else {
                false
            }
        } else if let Some(index) = self.state.open_entry {
            if let Some(TranscriptEntry::Assistant { text }) = self.transcript.get_mut(index) {
                *text = content;
            }
            true
        } else {
            self.transcript.push(TranscriptEntry::Assistant { text: content });
            true
        };

        self.state = StreamState::default();
        changed
    }

    fn on_auto_compact(&mut self, ev: &ChatEvent) -> bool {
        match ev.phase {
            Some(CompactPhase::Start) => {
                self.transcript.push(TranscriptEntry::System {
                    text: "Compacting conversation history…".into(),
                });
                self.state.compact_ref = Some(self.transcript.len() - 1);
                true
            }
            Some(CompactPhase::Done) | Some(CompactPhase::Error) => {
                let text = if ev.phase == Some(CompactPhase::Done) {
                    "Conversation history compacted.".to_string()
                } else {
                    let detail = ev.error_text().unwrap_or("unknown error");
                    format!("History compaction failed: {detail}")
                };
                // Replace the exact placeholder; append if it was evicted.
                match self.state.compact_ref.take() {
                    Some(index)
                        if matches!(
                            self.transcript.get(index),
                            Some(TranscriptEntry::System { .. })
                        ) =>
                    {
                        self.transcript[index] = TranscriptEntry::System { text };
                    }
                    _ => self.transcript.push(TranscriptEntry::System { text }),
                }
                true
            }
            None => false,
        }
    }
}

/// Whether a final reply merely restates the last tool stdout. Both sides
/// are normalized by dropping whitespace and backticks, then the first
/// `ECHO_PREFIX_CHARS` characters of the reply are substring-matched
/// against the output.
fn echoes_tool_output(final_text: &str, tool_output: Option<&str>) -> bool {
    let Some(output) = tool_output else {
        return false;
    };
    let normalized_final = normalize_echo(final_text);
    let normalized_output = normalize_echo(output);
    if normalized_final.is_empty() || normalized_output.is_empty() {
        return false;
    }
    let prefix: String = normalized_final.chars().take(ECHO_PREFIX_CHARS).collect();
    normalized_output.contains(&prefix)
}

fn normalize_echo(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_whitespace() && *c != '`')
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(payload: Value) -> ChatEvent {
        ChatEvent::from_payload(&payload).expect("chat event")
    }

    fn assistant_texts(stream: &ChatStream) -> Vec<&str> {
        stream
            .transcript()
            .iter()
            .filter_map(|e| match e {
                TranscriptEntry::Assistant { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn deltas_then_final_render_exactly_once() {
        let mut stream = ChatStream::new();
        stream.apply(&event(json!({"state":"thinking"})), None);
        stream.apply(&event(json!({"state":"delta","text":"Hel"})), None);
        stream.apply(&event(json!({"state":"delta","text":"lo"})), None);
        stream.apply(&event(json!({"state":"final","text":"Hello"})), None);

        assert_eq!(assistant_texts(&stream), vec!["Hello"]);
        assert!(stream.thinking().is_none());
    }

    #[test]
    fn final_without_deltas_creates_entry() {
        let mut stream = ChatStream::new();
        stream.apply(&event(json!({"state":"final","text":"Just this"})), None);
        assert_eq!(assistant_texts(&stream), vec!["Just this"]);
    }

    #[test]
    fn empty_turn_leaves_no_empty_entry() {
        let mut stream = ChatStream::new();
        stream.apply(&event(json!({"state":"delta","text":""})), None);
        stream.apply(&event(json!({"state":"final"})), None);
        assert!(stream.transcript().is_empty());
    }

    #[test]
    fn thinking_text_replaces_indicator_label() {
        let mut stream = ChatStream::new();
        stream.apply(&event(json!({"state":"thinking"})), None);
        assert_eq!(stream.thinking(), Some("Thinking"));

        stream.apply(
            &event(json!({"state":"thinking_text","text":"Reading files"})),
            None,
        );
        assert_eq!(stream.thinking(), Some("Reading files"));
        assert!(stream.transcript().is_empty());
    }

    #[test]
    fn history_duplicates_mutate_nothing() {
        let mut stream = ChatStream::new();
        let changed = stream.apply(
            &event(json!({"state":"final","text":"old reply","messageIndex":5})),
            Some(9),
        );
        assert!(!changed);
        assert!(stream.transcript().is_empty());

        // An index past the loaded history renders normally.
        let changed = stream.apply(
            &event(json!({"state":"final","text":"new reply","messageIndex":10})),
            Some(9),
        );
        assert!(changed);
        assert_eq!(assistant_texts(&stream), vec!["new reply"]);
    }

    #[test]
    fn tool_calls_bracket_by_id_even_interleaved() {
        let mut stream = ChatStream::new();
        stream.apply(
            &event(json!({"state":"tool_call_start","toolCallId":"t-1","toolName":"read"})),
            None,
        );
        stream.apply(
            &event(json!({"state":"tool_call_start","toolCallId":"t-2","toolName":"bash"})),
            None,
        );
        stream.apply(
            &event(json!({
                "state":"tool_call_end","toolCallId":"t-1",
                "success":true,"result":{"stdout":"contents"}
            })),
            None,
        );

        let tool = stream
            .transcript()
            .iter()
            .find_map(|e| match e {
                TranscriptEntry::ToolCall { id, output, ok, .. } if id == "t-1" => {
                    Some((output.clone(), *ok))
                }
                _ => None,
            })
            .expect("t-1 present");
        assert_eq!(tool, (Some("contents".into()), Some(true)));

        let open = stream.transcript().iter().any(|e| {
            matches!(e, TranscriptEntry::ToolCall { id, output, .. } if id == "t-2" && output.is_some())
        });
        assert!(!open, "t-2 must remain open");
    }

    #[test]
    fn tool_call_end_without_record_is_tolerated() {
        let mut stream = ChatStream::new();
        let changed = stream.apply(
            &event(json!({"state":"tool_call_end","toolCallId":"ghost"})),
            None,
        );
        assert!(!changed);
    }

    #[test]
    fn deltas_after_tool_call_open_a_new_entry() {
        let mut stream = ChatStream::new();
        stream.apply(&event(json!({"state":"delta","text":"Let me check."})), None);
        stream.apply(
            &event(json!({"state":"tool_call_start","toolCallId":"t-1","toolName":"bash"})),
            None,
        );
        stream.apply(&event(json!({"state":"delta","text":"Found it."})), None);
        stream.apply(&event(json!({"state":"final"})), None);

        assert_eq!(assistant_texts(&stream), vec!["Let me check.", "Found it."]);
        // Entry order: first text, tool record, second text.
        assert!(matches!(
            stream.transcript()[1],
            TranscriptEntry::ToolCall { .. }
        ));
    }

    #[test]
    fn final_echoing_tool_output_is_suppressed() {
        let mut stream = ChatStream::new();
        stream.apply(
            &event(json!({"state":"tool_call_start","toolCallId":"t-1","toolName":"bash"})),
            None,
        );
        stream.apply(
            &event(json!({
                "state":"tool_call_end","toolCallId":"t-1","success":true,
                "result":{"stdout":"total 12\ndrwxr-x a\ndrwxr-x b\n"}
            })),
            None,
        );
        stream.apply(
            &event(json!({"state":"final","text":"```\ntotal 12\ndrwxr-x a\n```"})),
            None,
        );

        assert!(assistant_texts(&stream).is_empty());
        // The tool record itself stays.
        assert_eq!(stream.transcript().len(), 1);
    }

    #[test]
    fn distinct_final_after_tool_output_is_kept() {
        let mut stream = ChatStream::new();
        stream.apply(
            &event(json!({"state":"tool_call_start","toolCallId":"t-1","toolName":"bash"})),
            None,
        );
        stream.apply(
            &event(json!({
                "state":"tool_call_end","toolCallId":"t-1","success":true,
                "result":{"stdout":"total 12\n"}
            })),
            None,
        );
        stream.apply(
            &event(json!({"state":"final","text":"The directory holds two entries."})),
            None,
        );
        assert_eq!(assistant_texts(&stream), vec!["The directory holds two entries."]);
    }

    #[test]
    fn voice_pending_accumulates_silently() {
        let mut stream = ChatStream::new();
        stream.apply(&event(json!({"state":"voice_pending"})), None);
        stream.apply(&event(json!({"state":"delta","text":"partial "})), None);
        stream.apply(&event(json!({"state":"delta","text":"text"})), None);
        assert!(stream.transcript().is_empty());

        stream.apply(&event(json!({"state":"final"})), None);
        assert_eq!(assistant_texts(&stream), vec!["partial text"]);
    }

    #[test]
    fn error_resolves_turn_and_clears_state() {
        let mut stream = ChatStream::new();
        stream.apply(&event(json!({"state":"delta","text":"half-finish"})), None);
        stream.apply(
            &event(json!({"state":"error","error":{"detail":"agent crashed"}})),
            None,
        );

        assert!(matches!(
            stream.transcript().last(),
            Some(TranscriptEntry::Error { text }) if text == "agent crashed"
        ));

        // A later turn starts from scratch.
        stream.apply(&event(json!({"state":"delta","text":"fresh"})), None);
        assert_eq!(assistant_texts(&stream).last(), Some(&"fresh"));
    }

    #[test]
    fn auto_compact_replaces_its_own_placeholder() {
        let mut stream = ChatStream::new();
        stream.apply(&event(json!({"state":"delta","text":"before"})), None);
        stream.apply(&event(json!({"state":"auto_compact","phase":"start"})), None);
        let placeholder_index = stream.transcript().len() - 1;

        stream.apply(&event(json!({"state":"auto_compact","phase":"done"})), None);
        assert!(matches!(
            &stream.transcript()[placeholder_index],
            TranscriptEntry::System { text } if text == "Conversation history compacted."
        ));
        // The earlier entry is untouched.
        assert_eq!(assistant_texts(&stream), vec!["before"]);
    }

    #[test]
    fn auto_compact_outcome_appends_when_placeholder_evicted() {
        let mut stream = ChatStream::new();
        stream.apply(&event(json!({"state":"auto_compact","phase":"start"})), None);
        stream.reset();
        stream.apply(
            &event(json!({"state":"auto_compact","phase":"error","error":{"detail":"too large"}})),
            None,
        );
        assert!(matches!(
            stream.transcript().last(),
            Some(TranscriptEntry::System { text }) if text.contains("too large")
        ));
    }

    #[test]
    fn channel_user_and_notice_render() {
        let mut stream = ChatStream::new();
        stream.apply(
            &event(json!({"state":"channel_user","text":"hi from telegram"})),
            None,
        );
        stream.apply(
            &event(json!({"state":"notice","title":"Update","message":"v2 available"})),
            None,
        );
        assert_eq!(
            stream.transcript(),
            &[
                TranscriptEntry::User {
                    text: "hi from telegram".into()
                },
                TranscriptEntry::System {
                    text: "Update: v2 available".into()
                },
            ]
        );
    }

    #[test]
    fn retrying_renders_visible_notice() {
        let mut stream = ChatStream::new();
        stream.apply(&event(json!({"state":"delta","text":"partial"})), None);
        stream.apply(
            &event(json!({
                "state":"retrying",
                "retryAfterMs":2500,
                "error":{"title":"overloaded"}
            })),
            None,
        );

        assert!(matches!(
            stream.transcript().last(),
            Some(TranscriptEntry::System { text }) if text == "Retrying in 2.5s: overloaded"
        ));
        // The turn is still in flight; the partial text stays.
        assert_eq!(assistant_texts(&stream), vec!["partial"]);
    }

    #[test]
    fn routing_defaults_to_active_session() {
        let decision = route(None, "main", true, false);
        assert_eq!(decision.session, "main");
        assert!(decision.render);
        assert!(!decision.needs_refresh);
    }

    #[test]
    fn routing_other_session_is_metadata_only() {
        let decision = route(Some("other"), "main", true, false);
        assert!(!decision.render);
        assert!(!decision.needs_refresh);
    }

    #[test]
    fn routing_unknown_session_requests_refresh() {
        let decision = route(Some("brand-new"), "main", false, false);
        assert!(decision.needs_refresh);
        assert!(!decision.render);
    }

    #[test]
    fn routing_suppresses_render_during_session_switch() {
        let decision = route(None, "main", true, true);
        assert!(!decision.render);
    }

    #[test]
    fn final_for_other_session_marks_unread() {
        let ev = event(json!({"state":"final","text":"done","sessionKey":"b"}));
        let effects = session_effects(&ev, "b", "a");
        assert!(effects.contains(&SessionEffect::SetReplying {
            key: "b".into(),
            replying: false
        }));
        assert!(effects.contains(&SessionEffect::MarkUnread { key: "b".into() }));
    }

    #[test]
    fn streaming_states_set_replying() {
        for state in ["thinking", "delta", "tool_call_start"] {
            let ev = event(json!({"state": state, "sessionKey":"b"}));
            let effects = session_effects(&ev, "b", "a");
            assert_eq!(
                effects,
                vec![SessionEffect::SetReplying {
                    key: "b".into(),
                    replying: true
                }],
                "state {state}"
            );
        }
    }

    #[test]
    fn queue_cleared_clears_replying_without_unread() {
        let ev = event(json!({"state":"queue_cleared","sessionKey":"b"}));
        let effects = session_effects(&ev, "b", "a");
        assert_eq!(
            effects,
            vec![SessionEffect::SetReplying {
                key: "b".into(),
                replying: false
            }]
        );
    }
}
