//! Reference-counted interest in stream keys.
//!
//! Subscribe goes out only on the 0 -> 1 transition of a key and unsubscribe
//! only on 1 -> 0, after a debounce window that a new acquire cancels.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::stream::client::StreamSender;
use crate::stream::proto::ClientMessage;

#[derive(Debug, Default)]
struct SubscriptionEntry {
    ref_count: usize,
    // Bumped whenever a pending release is armed or cancelled.
    generation: u64,
    pending_release: Option<JoinHandle<()>>,
}

/// Shared table of stream keys and their ref counts.
///
/// The connection worker reads it on every (re)connect to resubscribe.
#[derive(Debug, Default)]
pub struct SubscriptionTable {
    entries: Mutex<HashMap<String, SubscriptionEntry>>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys that should be subscribed on the server, sorted.
    ///
    /// Includes keys whose debounced unsubscribe has not fired yet.
    pub fn active_keys(&self) -> Vec<String> {
        let entries = self.lock();
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.ref_count > 0 || entry.pending_release.is_some())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn ref_count(&self, stream_key: &str) -> usize {
        self.lock()
            .get(stream_key)
            .map_or(0, |entry| entry.ref_count)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SubscriptionEntry>> {
        self.entries.lock().unwrap_or_else(|err| err.into_inner())
    }
}

/// Issues subscribe/unsubscribe control messages on ref-count transitions.
#[derive(Debug)]
pub struct SubscriptionRegistry {
    table: Arc<SubscriptionTable>,
    sender: StreamSender,
    unsubscribe_debounce: Duration,
}

impl SubscriptionRegistry {
    pub fn new(
        table: Arc<SubscriptionTable>,
        sender: StreamSender,
        unsubscribe_debounce: Duration,
    ) -> Self {
        Self {
            table,
            sender,
            unsubscribe_debounce,
        }
    }

    pub fn table(&self) -> &Arc<SubscriptionTable> {
        &self.table
    }

    /// Adds one unit of interest in `stream_key`.
    pub fn acquire(&self, stream_key: &str) {
        let mut entries = self.table.lock();
        let entry = entries.entry(stream_key.to_string()).or_default();
        entry.ref_count += 1;

        if let Some(pending) = entry.pending_release.take() {
            // The server subscription is still live; keep it.
            pending.abort();
            entry.generation += 1;
            debug!(event = "stream_unsubscribe_cancelled", stream = stream_key);
            return;
        }

        if entry.ref_count == 1 {
            debug!(event = "stream_subscribe", stream = stream_key);
            send_control(&self.sender, ClientMessage::subscribe(stream_key));
        }
    }

    /// Removes one unit of interest in `stream_key`.
    pub fn release(&self, stream_key: &str) {
        let mut entries = self.table.lock();
        let Some(entry) = entries.get_mut(stream_key) else {
            warn!(event = "stream_release_unknown_key", stream = stream_key);
            return;
        };
        if entry.ref_count == 0 {
            return;
        }
        entry.ref_count -= 1;
        if entry.ref_count > 0 {
            return;
        }

        let runtime = Handle::try_current().ok();
        match runtime {
            Some(runtime) if !self.unsubscribe_debounce.is_zero() => {
                entry.generation += 1;
                entry.pending_release = Some(self.schedule_unsubscribe(
                    &runtime,
                    stream_key.to_string(),
                    entry.generation,
                ));
            }
            _ => {
                entries.remove(stream_key);
                debug!(event = "stream_unsubscribe", stream = stream_key);
                send_control(&self.sender, ClientMessage::unsubscribe(stream_key));
            }
        }
    }

    fn schedule_unsubscribe(
        &self,
        runtime: &Handle,
        stream_key: String,
        generation: u64,
    ) -> JoinHandle<()> {
        let table = Arc::clone(&self.table);
        let sender = self.sender.clone();
        let debounce = self.unsubscribe_debounce;
        runtime.spawn(async move {
            tokio::time::sleep(debounce).await;
            let mut entries = table.lock();
            let still_idle = entries
                .get(&stream_key)
                .is_some_and(|entry| entry.generation == generation && entry.ref_count == 0);
            if !still_idle {
                return;
            }
            entries.remove(&stream_key);
            debug!(event = "stream_unsubscribe", stream = %stream_key);
            send_control(&sender, ClientMessage::unsubscribe(stream_key));
        })
    }
}

impl Drop for SubscriptionRegistry {
    fn drop(&mut self) {
        for entry in self.table.lock().values_mut() {
            if let Some(pending) = entry.pending_release.take() {
                pending.abort();
            }
        }
    }
}

fn send_control(sender: &StreamSender, message: ClientMessage) {
    // While disconnected the worker queues it; this fails only after shutdown.
    if let Err(err) = sender.send(message) {
        debug!(event = "stream_control_dropped", error = %err);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::{SubscriptionRegistry, SubscriptionTable};
    use crate::stream::client::{StreamCommand, StreamSender};
    use crate::stream::proto::ClientMessage;

    fn registry(
        debounce: Duration,
    ) -> (SubscriptionRegistry, mpsc::UnboundedReceiver<StreamCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = SubscriptionRegistry::new(
            Arc::new(SubscriptionTable::new()),
            StreamSender::from_channel(tx),
            debounce,
        );
        (registry, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<StreamCommand>) -> Vec<ClientMessage> {
        let mut sent = Vec::new();
        while let Ok(command) = rx.try_recv() {
            if let StreamCommand::Send(message) = command {
                sent.push(message);
            }
        }
        sent
    }

    #[test]
    fn many_acquires_send_one_subscribe_and_one_unsubscribe() {
        let (registry, mut rx) = registry(Duration::ZERO);

        for _ in 0..5 {
            registry.acquire("BTCUSDT");
        }
        assert_eq!(drain(&mut rx), vec![ClientMessage::subscribe("BTCUSDT")]);
        assert_eq!(registry.table().ref_count("BTCUSDT"), 5);

        for _ in 0..4 {
            registry.release("BTCUSDT");
        }
        assert!(drain(&mut rx).is_empty());

        registry.release("BTCUSDT");
        assert_eq!(drain(&mut rx), vec![ClientMessage::unsubscribe("BTCUSDT")]);
        assert!(registry.table().active_keys().is_empty());
    }

    #[test]
    fn extra_release_is_ignored() {
        let (registry, mut rx) = registry(Duration::ZERO);
        registry.release("BTCUSDT");
        registry.acquire("BTCUSDT");
        registry.release("BTCUSDT");
        registry.release("BTCUSDT");
        assert_eq!(
            drain(&mut rx),
            vec![
                ClientMessage::subscribe("BTCUSDT"),
                ClientMessage::unsubscribe("BTCUSDT"),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_waits_for_debounce() {
        let (registry, mut rx) = registry(Duration::from_millis(250));
        registry.acquire("ETHUSDT");
        registry.release("ETHUSDT");
        assert_eq!(drain(&mut rx), vec![ClientMessage::subscribe("ETHUSDT")]);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(drain(&mut rx).is_empty());
        assert_eq!(registry.table().active_keys(), vec!["ETHUSDT".to_string()]);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(drain(&mut rx), vec![ClientMessage::unsubscribe("ETHUSDT")]);
        assert!(registry.table().active_keys().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reacquire_within_debounce_keeps_subscription() {
        let (registry, mut rx) = registry(Duration::from_millis(250));
        registry.acquire("ETHUSDT");
        registry.release("ETHUSDT");
        tokio::time::sleep(Duration::from_millis(100)).await;
        registry.acquire("ETHUSDT");

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(drain(&mut rx), vec![ClientMessage::subscribe("ETHUSDT")]);
        assert_eq!(registry.table().active_keys(), vec!["ETHUSDT".to_string()]);
    }

    #[test]
    fn active_keys_lists_only_held_keys() {
        let (registry, _rx) = registry(Duration::ZERO);
        registry.acquire("SOLUSDT");
        registry.acquire("BTCUSDT");
        registry.acquire("ETHUSDT");
        registry.release("ETHUSDT");
        assert_eq!(
            registry.table().active_keys(),
            vec!["BTCUSDT".to_string(), "SOLUSDT".to_string()]
        );
    }
}
