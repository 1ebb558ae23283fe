//! Consumer-facing stream surface.
//!
//! `StreamSession` ties the connection worker, the subscription registry and
//! the event router together. Each [`StreamSession::register`] call returns a
//! [`Registration`] guard that removes the listener and releases its stream
//! key exactly once, when unregistered or dropped.

use std::sync::Arc;

use tokio::sync::watch;

use crate::stream::client::{
    ConnectionManager, ConnectionState, StreamClient, StreamClientError, StreamSender,
};
use crate::stream::proto::ServerMessage;
use crate::stream::registry::{SubscriptionRegistry, SubscriptionTable};
use crate::stream::router::{EventRouter, ListenerId};

/// One multiplexed stream connection shared by many listeners.
#[derive(Debug)]
pub struct StreamSession {
    router: Arc<EventRouter>,
    registry: Arc<SubscriptionRegistry>,
    connection: ConnectionManager,
}

impl StreamSession {
    /// Starts the connection worker for `client` and returns immediately.
    pub fn start(client: &StreamClient) -> Self {
        let router = Arc::new(EventRouter::new());
        let table = Arc::new(SubscriptionTable::new());
        let connection = client.spawn(Arc::clone(&router), Arc::clone(&table));
        let registry = Arc::new(SubscriptionRegistry::new(
            table,
            connection.sender(),
            client.options().unsubscribe_debounce,
        ));

        Self {
            router,
            registry,
            connection,
        }
    }

    /// Registers `callback` for `event_name` events on `stream_key`.
    ///
    /// The first registration of a key subscribes it on the server. The
    /// callback runs on the connection task and must not block.
    pub fn register<F>(&self, event_name: &str, stream_key: &str, callback: F) -> Registration
    where
        F: Fn(&ServerMessage) + Send + Sync + 'static,
    {
        let listener = self
            .router
            .add(event_name, stream_key, Arc::new(callback));
        self.registry.acquire(stream_key);

        Registration {
            router: Arc::clone(&self.router),
            registry: Arc::clone(&self.registry),
            event_name: event_name.to_string(),
            stream_key: stream_key.to_string(),
            listener,
            active: true,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.watch_state()
    }

    pub async fn wait_for_state(&self, target: ConnectionState) -> Result<(), StreamClientError> {
        self.connection.wait_for_state(target).await
    }

    /// Number of live registrations sharing `stream_key`.
    pub fn ref_count(&self, stream_key: &str) -> usize {
        self.registry.table().ref_count(stream_key)
    }

    /// Stream keys with at least one live registration.
    pub fn active_streams(&self) -> Vec<String> {
        self.registry.table().active_keys()
    }

    pub fn sender(&self) -> StreamSender {
        self.connection.sender()
    }

    /// Forces the current socket closed and reconnects.
    pub fn reconnect(&self) -> Result<(), StreamClientError> {
        self.connection.sender().reconnect()
    }

    /// Shuts the connection worker down.
    ///
    /// Outstanding [`Registration`]s stay valid to drop but receive nothing.
    pub async fn close(self) {
        self.connection.shutdown().await;
    }
}

/// Scoped listener registration.
///
/// Dropping it is equivalent to calling [`Registration::unregister`].
#[derive(Debug)]
pub struct Registration {
    router: Arc<EventRouter>,
    registry: Arc<SubscriptionRegistry>,
    event_name: String,
    stream_key: String,
    listener: ListenerId,
    active: bool,
}

impl Registration {
    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    /// Removes the listener and releases its stream key.
    pub fn unregister(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        self.router.remove(&self.event_name, self.listener);
        self.registry.release(&self.stream_key);
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.release();
    }
}
