//! Fan-out of inbound stream events to registered callbacks.
//!
//! Listeners are keyed by event name and scoped to one stream key. An event
//! carrying a stream key reaches only listeners registered for that key; an
//! event without one reaches every listener of the event name.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{trace, warn};

use crate::stream::proto::ServerMessage;

/// Callback invoked for every matching inbound event.
pub type EventCallback = Arc<dyn Fn(&ServerMessage) + Send + Sync>;

/// Identifies one registered listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Listener {
    id: ListenerId,
    stream_key: String,
    callback: EventCallback,
}

/// Dispatches inbound events by event name.
#[derive(Default)]
pub struct EventRouter {
    listeners: RwLock<HashMap<String, Vec<Listener>>>,
    next_id: AtomicU64,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a listener; callbacks for the same event run in insertion order.
    pub fn add(
        &self,
        event_name: impl Into<String>,
        stream_key: impl Into<String>,
        callback: EventCallback,
    ) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut listeners = self.listeners.write().unwrap_or_else(|err| err.into_inner());
        listeners.entry(event_name.into()).or_default().push(Listener {
            id,
            stream_key: stream_key.into(),
            callback,
        });
        id
    }

    /// Removes a listener. Returns `false` if it was already gone.
    pub fn remove(&self, event_name: &str, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(|err| err.into_inner());
        let Some(entries) = listeners.get_mut(event_name) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|listener| listener.id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            listeners.remove(event_name);
        }
        removed
    }

    /// Number of listeners registered for `event_name`.
    pub fn listener_count(&self, event_name: &str) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .get(event_name)
            .map_or(0, Vec::len)
    }

    /// Delivers `message` to every matching listener and returns how many ran.
    ///
    /// Iterates over a snapshot taken before the first callback, so callbacks
    /// may register or unregister listeners freely. A panicking callback is
    /// logged and skipped.
    pub fn dispatch(&self, message: &ServerMessage) -> usize {
        let snapshot: Vec<EventCallback> = {
            let listeners = self.listeners.read().unwrap_or_else(|err| err.into_inner());
            let Some(entries) = listeners.get(&message.event) else {
                trace!(event = "stream_event_unrouted", name = %message.event);
                return 0;
            };
            entries
                .iter()
                .filter(|listener| match message.stream.as_deref() {
                    Some(stream) => listener.stream_key == stream,
                    None => true,
                })
                .map(|listener| Arc::clone(&listener.callback))
                .collect()
        };

        let mut delivered = 0;
        for callback in snapshot {
            match catch_unwind(AssertUnwindSafe(|| callback(message))) {
                Ok(()) => delivered += 1,
                Err(_) => warn!(
                    event = "stream_listener_panicked",
                    name = %message.event,
                    stream = ?message.stream
                ),
            }
        }
        delivered
    }
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let listeners = self.listeners.read().unwrap_or_else(|err| err.into_inner());
        let counts: HashMap<&str, usize> = listeners
            .iter()
            .map(|(name, entries)| (name.as_str(), entries.len()))
            .collect();
        f.debug_struct("EventRouter")
            .field("listeners", &counts)
            .finish()
    }
}
