//! Event fan-out
//!
//! Broadcast frames are dispatched to externally registered listeners in
//! registration order, then to the single built-in handler for that event
//! name. Listeners observe events; they cannot suppress or alter what the
//! built-in handler sees. Events with zero listeners are not an error.

use std::collections::HashMap;

use serde_json::Value;

type Listener = Box<dyn FnMut(&Value) + Send>;

#[derive(Default)]
pub struct EventRouter {
    listeners: HashMap<String, Vec<Listener>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an external listener for `event`. Listeners for one event
    /// run in registration order.
    pub fn on(&mut self, event: &str, listener: impl FnMut(&Value) + Send + 'static) {
        self.listeners
            .entry(event.to_string())
            .or_default()
            .push(Box::new(listener));
    }

    /// Fan an event out to its external listeners.
    ///
    /// The caller invokes its built-in handler *after* this returns, so
    /// listeners always run first and never gate the built-in.
    pub fn dispatch(&mut self, event: &str, payload: &Value) {
        if let Some(listeners) = self.listeners.get_mut(event) {
            for listener in listeners.iter_mut() {
                listener(payload);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[test]
    fn listeners_run_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut router = EventRouter::new();
        for tag in ["a", "b", "c"] {
            let order = order.clone();
            router.on("chat", move |_| order.lock().unwrap().push(tag));
        }

        router.dispatch("chat", &json!({}));
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn dispatch_without_listeners_is_fine() {
        let mut router = EventRouter::new();
        router.dispatch("presence", &json!({"nodes": 3}));
    }

    #[test]
    fn listeners_see_the_payload_unaltered() {
        let seen = Arc::new(Mutex::new(None));
        let mut router = EventRouter::new();
        {
            let seen = seen.clone();
            router.on("health", move |payload| {
                *seen.lock().unwrap() = Some(payload.clone());
            });
        }

        let payload = json!({"ok": true});
        router.dispatch("health", &payload);
        assert_eq!(seen.lock().unwrap().as_ref(), Some(&payload));
    }

    #[test]
    fn listeners_are_scoped_to_their_event() {
        let count = Arc::new(Mutex::new(0));
        let mut router = EventRouter::new();
        {
            let count = count.clone();
            router.on("chat", move |_| *count.lock().unwrap() += 1);
        }

        router.dispatch("session", &json!({}));
        router.dispatch("chat", &json!({}));
        assert_eq!(*count.lock().unwrap(), 1);
    }
}
