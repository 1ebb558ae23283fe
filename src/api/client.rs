use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use reqwest::{Client, Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::api::is_auth_rejection;
use crate::api::refresh::{RefreshCoordinator, RefreshFailure, TokenRefresher};
use crate::credentials::{Credential, CredentialStore};

const ERROR_BODY_SNIPPET_LEN: usize = 220;
const MAX_AUTH_REPLAYS: usize = 1;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ApiClientDefaults;

impl ApiClientDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);
    pub const REFRESH_TIMEOUT: Duration = Duration::from_secs(10);
    pub const REFRESH_PATH: &'static str = "/auth/refresh";
    pub const LOGIN_PATH: &'static str = "/auth/login";
}

#[derive(Clone, Debug)]
pub struct ApiClientOptions {
    pub connect_timeout: Duration,
    pub attempt_timeout: Duration,
    /// Upper bound for one refresh call; exceeding it ends the session.
    pub refresh_timeout: Duration,
    pub refresh_path: String,
    pub login_path: String,
}

impl Default for ApiClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: ApiClientDefaults::CONNECT_TIMEOUT,
            attempt_timeout: ApiClientDefaults::ATTEMPT_TIMEOUT,
            refresh_timeout: ApiClientDefaults::REFRESH_TIMEOUT,
            refresh_path: ApiClientDefaults::REFRESH_PATH.to_string(),
            login_path: ApiClientDefaults::LOGIN_PATH.to_string(),
        }
    }
}

/// Dispatches authenticated requests and recovers from expired tokens.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
    credentials: Arc<CredentialStore>,
    refresh: Arc<RefreshCoordinator>,
    attempt_timeout: Duration,
    login_path: String,
}

impl ApiClient {
    pub fn new(
        base_url: impl Into<String>,
        credentials: Arc<CredentialStore>,
    ) -> Result<Self, RequestError> {
        Self::with_options(base_url, credentials, ApiClientOptions::default())
    }

    pub fn with_options(
        base_url: impl Into<String>,
        credentials: Arc<CredentialStore>,
        options: ApiClientOptions,
    ) -> Result<Self, RequestError> {
        // The cookie store carries the refresh session set at login.
        let http = Client::builder()
            .no_proxy()
            .cookie_store(true)
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(RequestError::Transport)?;

        let base_url = base_url.into().trim_end().trim_end_matches('/').to_string();
        let refresher = HttpTokenRefresher {
            http: http.clone(),
            url: format!("{base_url}{}", options.refresh_path),
            attempt_timeout: options.attempt_timeout,
        };
        let refresh = Arc::new(RefreshCoordinator::new(
            Arc::clone(&credentials),
            Arc::new(refresher),
            options.refresh_timeout,
        ));

        Ok(Self {
            http,
            base_url,
            credentials,
            refresh,
            attempt_timeout: options.attempt_timeout,
            login_path: options.login_path,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    /// Coordinator shared with the stream client for handshake re-authentication.
    pub fn refresh_coordinator(&self) -> Arc<RefreshCoordinator> {
        Arc::clone(&self.refresh)
    }

    /// Exchanges username and password for an access token.
    ///
    /// The server also sets the refresh cookie, which the client keeps for
    /// later refresh calls.
    pub async fn login(
        &self,
        username: &str,
        password: &SecretString,
    ) -> Result<Credential, RequestError> {
        let body = json!({
            "username": username,
            "password": password.expose_secret(),
        });
        let response = self
            .http
            .post(self.endpoint(&self.login_path))
            .timeout(self.attempt_timeout)
            .json(&body)
            .send()
            .await
            .map_err(RequestError::Transport)?;
        let status = response.status();
        let body = response.text().await.map_err(RequestError::Transport)?;

        if !status.is_success() {
            return Err(RequestError::ServerRejected { status, body });
        }

        let token = parse_access_token(&body).map_err(RequestError::Parse)?;
        Ok(self.credentials.replace(token))
    }

    /// Sends `descriptor` with the current bearer token.
    ///
    /// An auth rejection triggers (or joins) one refresh and a single replay.
    /// A rejected replay is returned as [`RequestError::AuthExpired`].
    pub async fn request(&self, descriptor: &RequestDescriptor) -> Result<ApiResponse, RequestError> {
        let mut credential = self
            .credentials
            .current()
            .ok_or(RequestError::NotAuthenticated)?;
        let mut replays = 0;

        loop {
            let response = self.send_attempt(descriptor, &credential).await?;
            if !is_auth_rejection(response.status.as_u16()) {
                return response.into_result();
            }

            if replays >= MAX_AUTH_REPLAYS {
                warn!(
                    event = "auth_rejected_after_refresh",
                    method = %descriptor.method,
                    path = %descriptor.path,
                    status = response.status.as_u16()
                );
                return Err(RequestError::AuthExpired {
                    status: response.status,
                    body: response.body,
                });
            }

            debug!(
                event = "auth_rejected",
                method = %descriptor.method,
                path = %descriptor.path,
                status = response.status.as_u16(),
                generation = credential.generation
            );
            credential = self
                .refresh
                .refresh_after_rejection(credential.generation)
                .await
                .map_err(RequestError::AuthHardFailure)?;
            replays += 1;
        }
    }

    fn endpoint(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!("{}{}", self.base_url, path)
    }

    async fn send_attempt(
        &self,
        descriptor: &RequestDescriptor,
        credential: &Credential,
    ) -> Result<ApiResponse, RequestError> {
        let mut builder = self
            .http
            .request(descriptor.method.clone(), self.endpoint(&descriptor.path))
            .timeout(self.attempt_timeout)
            .bearer_auth(credential.token.expose_secret());

        if !descriptor.query.is_empty() {
            builder = builder.query(&descriptor.query);
        }
        for (name, value) in &descriptor.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = descriptor.body.as_ref() {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(RequestError::Transport)?;
        let status = response.status();
        let body = response.text().await.map_err(RequestError::Transport)?;
        Ok(ApiResponse { status, body })
    }
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .field("attempt_timeout", &self.attempt_timeout)
            .finish_non_exhaustive()
    }
}

/// Refreshes the access token against the refresh endpoint.
///
/// Authentication comes from the ambient session cookie, not the bearer token.
#[derive(Clone, Debug)]
pub struct HttpTokenRefresher {
    http: Client,
    url: String,
    attempt_timeout: Duration,
}

impl TokenRefresher for HttpTokenRefresher {
    fn refresh(&self) -> BoxFuture<'static, Result<SecretString, RefreshFailure>> {
        let http = self.http.clone();
        let url = self.url.clone();
        let attempt_timeout = self.attempt_timeout;
        async move {
            let response = http
                .post(&url)
                .timeout(attempt_timeout)
                .send()
                .await
                .map_err(|err| RefreshFailure::Transport(err.to_string()))?;
            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(|err| RefreshFailure::Transport(err.to_string()))?;

            if !status.is_success() {
                return Err(RefreshFailure::Rejected {
                    status: status.as_u16(),
                    detail: summarize_error_body(&body),
                });
            }

            parse_access_token(&body).map_err(RefreshFailure::Parse)
        }
        .boxed()
    }
}

/// Everything needed to (re)issue one HTTP call.
#[derive(Clone, Debug, PartialEq)]
pub struct RequestDescriptor {
    pub method: Method,
    /// Path relative to the API base URL, or an absolute URL.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl RequestDescriptor {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// Response returned by the server for a dispatched request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: String,
}

impl ApiResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, RequestError> {
        serde_json::from_str(&self.body).map_err(|err| RequestError::Parse(err.to_string()))
    }

    fn into_result(self) -> Result<Self, RequestError> {
        if self.status.is_success() {
            return Ok(self);
        }
        Err(RequestError::ServerRejected {
            status: self.status,
            body: self.body,
        })
    }
}

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    #[error("no access credential is held")]
    NotAuthenticated,

    #[error("authorization rejected with status {status}: {}", summarize_error_body(.body))]
    AuthExpired { status: StatusCode, body: String },

    #[error("session could not be renewed: {0}")]
    AuthHardFailure(RefreshFailure),

    #[error("http status {status}: {}", summarize_error_body(.body))]
    ServerRejected { status: StatusCode, body: String },

    #[error("failed to parse response: {0}")]
    Parse(String),
}

impl RequestError {
    /// `true` when the session was reset and the user must log in again.
    pub fn is_hard_auth_failure(&self) -> bool {
        matches!(self, Self::AuthHardFailure(_))
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::AuthExpired { status, .. } | Self::ServerRejected { status, .. } => Some(*status),
            Self::Transport(err) => err.status(),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AccessTokenBody {
    #[serde(rename = "accessToken", alias = "access_token", alias = "token")]
    access_token: String,
}

fn parse_access_token(body: &str) -> Result<SecretString, String> {
    let parsed: AccessTokenBody = serde_json::from_str(body).map_err(|err| err.to_string())?;
    if parsed.access_token.trim().is_empty() {
        return Err("access token is empty".to_string());
    }
    Ok(SecretString::new(parsed.access_token))
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        reason: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.error.or(parsed.message).or(parsed.reason) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}
