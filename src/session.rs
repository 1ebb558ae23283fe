//! Per-login session context.
//!
//! `SessionContext` owns everything that lives for one authenticated session:
//! the credential store, the request dispatcher with its refresh coordinator,
//! and the stream connection. Nothing here is global; dropping or logging out
//! the context tears it all down.

use std::sync::Arc;

use secrecy::SecretString;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::api::client::{ApiClient, ApiClientOptions, ApiResponse, RequestDescriptor, RequestError};
use crate::credentials::{AuthState, CredentialStore};
use crate::stream::client::{StreamClient, StreamOptions};
use crate::stream::proto::ServerMessage;
use crate::stream::session::{Registration, StreamSession};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SessionDefaults;

impl SessionDefaults {
    pub const AUTH_ENTRY_POINT: &'static str = "/login";
}

#[derive(Clone, Debug)]
pub struct SessionOptions {
    pub api_base_url: String,
    pub stream_endpoint: String,
    /// Where the application sends the user after the session expires.
    pub auth_entry_point: String,
    pub api: ApiClientOptions,
    pub stream: StreamOptions,
}

impl SessionOptions {
    pub fn new(api_base_url: impl Into<String>, stream_endpoint: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            stream_endpoint: stream_endpoint.into(),
            auth_entry_point: SessionDefaults::AUTH_ENTRY_POINT.to_string(),
            api: ApiClientOptions::default(),
            stream: StreamOptions::default(),
        }
    }

    pub fn with_auth_entry_point(mut self, auth_entry_point: impl Into<String>) -> Self {
        self.auth_entry_point = auth_entry_point.into();
        self
    }

    pub fn with_api_options(mut self, api: ApiClientOptions) -> Self {
        self.api = api;
        self
    }

    pub fn with_stream_options(mut self, stream: StreamOptions) -> Self {
        self.stream = stream;
        self
    }
}

/// Owned state of one authenticated session.
#[derive(Debug)]
pub struct SessionContext {
    options: SessionOptions,
    credentials: Arc<CredentialStore>,
    api: ApiClient,
    stream: StreamSession,
}

impl SessionContext {
    /// Logs in with username and password and starts the stream connection.
    pub async fn login(
        options: SessionOptions,
        username: &str,
        password: &SecretString,
    ) -> Result<Self, RequestError> {
        let (credentials, api) = build_api(&options)?;
        let credential = api.login(username, password).await?;
        info!(event = "session_logged_in", generation = credential.generation);
        Ok(Self::start(options, credentials, api))
    }

    /// Resumes a session from an access token obtained elsewhere.
    ///
    /// Must be called inside a tokio runtime.
    pub fn resume(options: SessionOptions, access_token: SecretString) -> Result<Self, RequestError> {
        let (credentials, api) = build_api(&options)?;
        credentials.replace(access_token);
        Ok(Self::start(options, credentials, api))
    }

    fn start(options: SessionOptions, credentials: Arc<CredentialStore>, api: ApiClient) -> Self {
        let stream_client =
            StreamClient::new(options.stream_endpoint.clone(), Arc::clone(&credentials))
                .with_options(options.stream.clone())
                .with_refresh(api.refresh_coordinator());
        let stream = StreamSession::start(&stream_client);

        Self {
            options,
            credentials,
            api,
            stream,
        }
    }

    /// Dispatches an authenticated request.
    pub async fn request(&self, descriptor: &RequestDescriptor) -> Result<ApiResponse, RequestError> {
        let result = self.api.request(descriptor).await;
        if let Err(err) = &result {
            if err.is_hard_auth_failure() {
                warn!(
                    event = "session_expired",
                    error = %err,
                    redirect = %self.options.auth_entry_point
                );
            }
        }
        result
    }

    /// Registers a stream listener; see [`StreamSession::register`].
    pub fn register<F>(&self, event_name: &str, stream_key: &str, callback: F) -> Registration
    where
        F: Fn(&ServerMessage) + Send + Sync + 'static,
    {
        self.stream.register(event_name, stream_key, callback)
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn stream(&self) -> &StreamSession {
        &self.stream
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    pub fn auth_state(&self) -> AuthState {
        self.credentials.state()
    }

    pub fn watch_auth_state(&self) -> watch::Receiver<AuthState> {
        self.credentials.watch_state()
    }

    pub fn auth_entry_point(&self) -> &str {
        &self.options.auth_entry_point
    }

    /// Clears the credential and closes the stream connection.
    pub async fn logout(self) {
        self.credentials.sign_out();
        self.stream.close().await;
        info!(event = "session_logged_out");
    }
}

fn build_api(options: &SessionOptions) -> Result<(Arc<CredentialStore>, ApiClient), RequestError> {
    let credentials = Arc::new(CredentialStore::new());
    let api = ApiClient::with_options(
        options.api_base_url.clone(),
        Arc::clone(&credentials),
        options.api.clone(),
    )?;
    Ok((credentials, api))
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::{SessionContext, SessionOptions};
    use crate::credentials::AuthState;
    use crate::stream::client::ConnectionState;

    #[test]
    fn options_default_to_login_entry_point() {
        let options = SessionOptions::new("https://api.folio.test", "wss://stream.folio.test/ws");
        assert_eq!(options.auth_entry_point, "/login");
        let options = options.with_auth_entry_point("/auth/sign-in");
        assert_eq!(options.auth_entry_point, "/auth/sign-in");
    }

    #[tokio::test]
    async fn logout_clears_credential_and_stops_stream() {
        let options = SessionOptions::new("http://127.0.0.1:9", "ws://127.0.0.1:9/ws");
        let session = SessionContext::resume(options, SecretString::new("token".to_string()))
            .expect("resume session");
        assert_eq!(session.auth_state(), AuthState::Authenticated);

        let credentials = std::sync::Arc::clone(session.credentials());
        let mut stream_state = session.stream().watch_state();
        session.logout().await;

        assert!(credentials.current().is_none());
        assert_eq!(credentials.state(), AuthState::SignedOut);
        assert_eq!(*stream_state.borrow_and_update(), ConnectionState::Disconnected);
    }
}
