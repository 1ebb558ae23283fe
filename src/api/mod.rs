//! Authenticated HTTP surface.
//!
//! - `client`: request dispatcher that attaches the bearer token and replays
//!   once after an auth rejection.
//! - `refresh`: single-flight coordinator for the token refresh call.

/// Request dispatcher, descriptors, and response types.
pub mod client;
/// Single-flight access token refresh.
pub mod refresh;

/// `true` for statuses that mean the credential was refused (401 and 403).
///
/// Shared by the HTTP dispatcher and the websocket handshake.
pub(crate) fn is_auth_rejection(status: u16) -> bool {
    status == 401 || status == 403
}
