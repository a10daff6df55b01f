//! Session directory
//!
//! Client-side bookkeeping for the session list: which session is active,
//! per-session unread/replying flags, and the per-session history progress
//! used to suppress live duplicates of already-loaded transcript entries.
//! Progress outlives connections; everything else is metadata refreshed
//! from `sessions.list`.

use serde_json::Value;

/// One entry in the session list.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub key: String,
    pub label: Option<String>,
    pub replying: bool,
    pub unread: bool,
    /// Highest message index already materialized from persisted history.
    pub last_history_index: Option<u64>,
}

impl SessionEntry {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            label: None,
            replying: false,
            unread: false,
            last_history_index: None,
        }
    }

    /// Display name: label if set, otherwise key.
    pub fn display_name(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.key)
    }
}

/// Session-list bookkeeping produced by the chat stream state machine and
/// applied here regardless of whether the event was rendered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEffect {
    SetReplying { key: String, replying: bool },
    MarkUnread { key: String },
}

#[derive(Debug, Default)]
pub struct SessionDirectory {
    entries: Vec<SessionEntry>,
    active: String,
}

impl SessionDirectory {
    pub fn new(active: impl Into<String>) -> Self {
        let active = active.into();
        Self {
            entries: vec![SessionEntry::new(active.clone())],
            active,
        }
    }

    pub fn active(&self) -> &str {
        &self.active
    }

    pub fn set_active(&mut self, key: impl Into<String>) {
        self.active = key.into();
        if !self.is_known(&self.active) {
            let entry = SessionEntry::new(self.active.clone());
            self.entries.push(entry);
        }
    }

    pub fn is_known(&self, key: &str) -> bool {
        self.entries.iter().any(|e| e.key == key)
    }

    pub fn entries(&self) -> &[SessionEntry] {
        &self.entries
    }

    pub fn get(&self, key: &str) -> Option<&SessionEntry> {
        self.entries.iter().find(|e| e.key == key)
    }

    fn get_mut(&mut self, key: &str) -> Option<&mut SessionEntry> {
        self.entries.iter_mut().find(|e| e.key == key)
    }

    /// Insert or update an entry (from a `session` event or list refresh).
    pub fn upsert(&mut self, key: &str, label: Option<String>) {
        match self.get_mut(key) {
            Some(entry) => {
                if label.is_some() {
                    entry.label = label;
                }
            }
            None => {
                let mut entry = SessionEntry::new(key);
                entry.label = label;
                self.entries.push(entry);
            }
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.entries.retain(|e| e.key != key);
    }

    /// Replace the list from a `sessions.list` payload, preserving local
    /// progress and flags for sessions that survive the refresh.
    pub fn replace_from_list(&mut self, payload: &Value) {
        let Some(items) = payload
            .get("sessions")
            .and_then(Value::as_array)
            .or_else(|| payload.as_array())
        else {
            return;
        };

        let old = std::mem::take(&mut self.entries);
        for item in items {
            let Some(key) = item.get("key").and_then(Value::as_str) else {
                continue;
            };
            let mut entry = old
                .iter()
                .find(|e| e.key == key)
                .cloned()
                .unwrap_or_else(|| SessionEntry::new(key));
            if let Some(label) = item.get("label").and_then(Value::as_str) {
                entry.label = Some(label.to_string());
            }
            self.entries.push(entry);
        }
        if !self.is_known(&self.active) {
            let entry = SessionEntry::new(self.active.clone());
            self.entries.push(entry);
        }
    }

    /// History progress for a session; `None` when nothing is loaded.
    pub fn progress(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|e| e.last_history_index)
    }

    /// Record how much persisted history has been materialized.
    pub fn set_progress(&mut self, key: &str, last_history_index: u64) {
        if self.get_mut(key).is_none() {
            self.entries.push(SessionEntry::new(key));
        }
        if let Some(entry) = self.get_mut(key) {
            entry.last_history_index = Some(last_history_index);
        }
    }

    /// Apply one bookkeeping effect.
    pub fn apply(&mut self, effect: SessionEffect) {
        match effect {
            SessionEffect::SetReplying { key, replying } => {
                if let Some(entry) = self.get_mut(&key) {
                    entry.replying = replying;
                }
            }
            SessionEffect::MarkUnread { key } => {
                if key != self.active {
                    if let Some(entry) = self.get_mut(&key) {
                        entry.unread = true;
                    }
                }
            }
        }
    }

    /// Clear the unread flag, e.g. when the viewer switches to a session.
    pub fn mark_read(&mut self, key: &str) {
        if let Some(entry) = self.get_mut(key) {
            entry.unread = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn active_session_always_known() {
        let dir = SessionDirectory::new("main");
        assert!(dir.is_known("main"));
        assert_eq!(dir.active(), "main");
    }

    #[test]
    fn unread_only_set_for_inactive_sessions() {
        let mut dir = SessionDirectory::new("a");
        dir.upsert("b", None);

        dir.apply(SessionEffect::MarkUnread { key: "a".into() });
        dir.apply(SessionEffect::MarkUnread { key: "b".into() });

        assert!(!dir.get("a").unwrap().unread);
        assert!(dir.get("b").unwrap().unread);

        dir.mark_read("b");
        assert!(!dir.get("b").unwrap().unread);
    }

    #[test]
    fn refresh_preserves_progress_and_flags() {
        let mut dir = SessionDirectory::new("a");
        dir.upsert("b", None);
        dir.set_progress("b", 17);
        dir.apply(SessionEffect::SetReplying {
            key: "b".into(),
            replying: true,
        });

        dir.replace_from_list(&json!({
            "sessions": [
                {"key": "a", "label": "Main"},
                {"key": "b"},
                {"key": "c", "label": "New"}
            ]
        }));

        assert_eq!(dir.entries().len(), 3);
        assert_eq!(dir.progress("b"), Some(17));
        assert!(dir.get("b").unwrap().replying);
        assert_eq!(dir.get("a").unwrap().display_name(), "Main");
    }

    #[test]
    fn set_progress_creates_missing_entry() {
        let mut dir = SessionDirectory::new("a");
        dir.set_progress("ghost", 4);
        assert_eq!(dir.progress("ghost"), Some(4));
    }
}
