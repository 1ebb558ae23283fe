//! Client SDK for authenticated folio API calls and realtime portfolio streams.
//!
//! The crate is organized by transport surface:
//! - `api`: HTTP request dispatcher with single-flight access token refresh.
//! - `stream`: one multiplexed websocket shared by many listeners.
//! - `credentials`: the access token store shared by both surfaces.
//! - `session`: the owned context that wires everything for one login.
//! - `retry`: shared retry and timeout utilities.

/// HTTP dispatcher and refresh coordination.
pub mod api;
/// Access token storage and auth state.
pub mod credentials;
/// Retry and timeout helpers used across the SDK.
pub mod retry;
/// Per-login session context.
pub mod session;
/// Realtime stream client, subscription registry, and event routing.
pub mod stream;

pub use api::client::{ApiClient, ApiResponse, RequestDescriptor, RequestError};
pub use credentials::{AuthState, Credential, CredentialStore};
pub use session::{SessionContext, SessionOptions};
pub use stream::session::{Registration, StreamSession};
