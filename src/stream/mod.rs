//! Realtime stream modules.
//!
//! - `client`: websocket connection manager with reconnect and resubscribe.
//! - `proto`: protocol messages shared with the stream service.
//! - `registry`: ref-counted stream key subscriptions.
//! - `router`: fan-out of inbound events to listeners.
//! - `session`: consumer-facing registration surface.

/// Websocket connection manager and command sender.
pub mod client;
/// Stream protocol messages.
pub mod proto;
/// Subscription ref counting and debounced unsubscribe.
pub mod registry;
/// Event dispatch by event name and stream key.
pub mod router;
/// Listener registration guards over one shared connection.
pub mod session;
