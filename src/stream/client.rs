//! Websocket connection manager and outbound command sender.
//!
//! A single background worker owns the socket. It authenticates the upgrade
//! request with the current access token, reconnects in bounded rounds with
//! a fixed delay, resubscribes every key held in the subscription table after
//! each connect, and hands inbound events to the event router in arrival
//! order. Commands issued while disconnected are queued and flushed once a
//! connection is back.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use secrecy::ExposeSecret;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{InvalidHeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use crate::api::is_auth_rejection;
use crate::api::refresh::{RefreshCoordinator, RefreshFailure};
use crate::credentials::{AuthState, Credential, CredentialStore};
use crate::retry::{retry_async, with_timeout, RetryPolicy};
use crate::stream::proto::{ClientMessage, ServerMessage};
use crate::stream::registry::SubscriptionTable;
use crate::stream::router::EventRouter;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StreamDefaults;

impl StreamDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const RECONNECT_ATTEMPTS: usize = 5;
    pub const RECONNECT_DELAY: Duration = Duration::from_secs(2);
    pub const UNSUBSCRIBE_DEBOUNCE: Duration = Duration::from_millis(500);
    pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
}

/// Tuning for the stream connection.
#[derive(Clone, Debug)]
pub struct StreamOptions {
    pub connect_timeout: Duration,
    /// Attempts per reconnect round and the fixed delay between them.
    pub reconnect: RetryPolicy,
    /// How long an unreferenced key stays subscribed before unsubscribe.
    pub unsubscribe_debounce: Duration,
    /// Websocket ping period; `None` disables keepalive pings.
    pub keepalive_interval: Option<Duration>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            connect_timeout: StreamDefaults::CONNECT_TIMEOUT,
            reconnect: RetryPolicy::fixed(
                StreamDefaults::RECONNECT_ATTEMPTS,
                StreamDefaults::RECONNECT_DELAY,
            ),
            unsubscribe_debounce: StreamDefaults::UNSUBSCRIBE_DEBOUNCE,
            keepalive_interval: Some(StreamDefaults::KEEPALIVE_INTERVAL),
        }
    }
}

/// Entry point for creating the stream connection of a session.
#[derive(Clone)]
pub struct StreamClient {
    endpoint: String,
    credentials: Arc<CredentialStore>,
    refresh: Option<Arc<RefreshCoordinator>>,
    options: StreamOptions,
}

impl StreamClient {
    pub fn new(endpoint: impl Into<String>, credentials: Arc<CredentialStore>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end().to_string(),
            credentials,
            refresh: None,
            options: StreamOptions::default(),
        }
    }

    pub fn with_options(mut self, options: StreamOptions) -> Self {
        self.options = options;
        self
    }

    /// Lets a rejected handshake renew the token through `refresh`.
    pub fn with_refresh(mut self, refresh: Arc<RefreshCoordinator>) -> Self {
        self.refresh = Some(refresh);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn options(&self) -> &StreamOptions {
        &self.options
    }

    /// Spawns the connection worker.
    ///
    /// Returns immediately; connection progress is observable through
    /// [`ConnectionManager::watch_state`].
    pub fn spawn(
        &self,
        router: Arc<EventRouter>,
        table: Arc<SubscriptionTable>,
    ) -> ConnectionManager {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let ctx = WorkerContext {
            endpoint: self.endpoint.clone(),
            credentials: Arc::clone(&self.credentials),
            refresh: self.refresh.clone(),
            options: self.options.clone(),
            router,
            table,
            state: state_tx,
        };
        let task = tokio::spawn(connection_worker(ctx, command_rx));

        ConnectionManager {
            sender: StreamSender { tx: command_tx },
            state: state_rx,
            task,
        }
    }
}

impl std::fmt::Debug for StreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamClient")
            .field("endpoint", &self.endpoint)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Lifecycle of the single stream connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// A reconnect round was exhausted; waiting for new demand.
    Erroring,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }
}

pub(crate) enum StreamCommand {
    Send(ClientMessage),
    Reconnect,
    Shutdown,
}

/// Cloneable handle for queueing work on the connection worker.
#[derive(Clone, Debug)]
pub struct StreamSender {
    tx: mpsc::UnboundedSender<StreamCommand>,
}

impl StreamSender {
    pub(crate) fn from_channel(tx: mpsc::UnboundedSender<StreamCommand>) -> Self {
        Self { tx }
    }

    pub(crate) fn send(&self, message: ClientMessage) -> Result<(), StreamClientError> {
        self.command(StreamCommand::Send(message))
    }

    /// Sends a heartbeat ping with client timestamp.
    pub fn ping(&self, client_time_ms: u64) -> Result<(), StreamClientError> {
        self.send(ClientMessage::Ping { client_time_ms })
    }

    /// Drops the current socket (if any) and starts a new connect round.
    pub fn reconnect(&self) -> Result<(), StreamClientError> {
        self.command(StreamCommand::Reconnect)
    }

    /// Stops the worker and closes the socket.
    pub fn shutdown(&self) -> Result<(), StreamClientError> {
        self.command(StreamCommand::Shutdown)
    }

    fn command(&self, command: StreamCommand) -> Result<(), StreamClientError> {
        self.tx
            .send(command)
            .map_err(|_| StreamClientError::SendQueueClosed)
    }
}

impl std::fmt::Debug for StreamCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Send(message) => f.debug_tuple("Send").field(message).finish(),
            Self::Reconnect => f.write_str("Reconnect"),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// Owner of the connection worker task.
///
/// Dropping it shuts the worker down.
#[derive(Debug)]
pub struct ConnectionManager {
    sender: StreamSender,
    state: watch::Receiver<ConnectionState>,
    task: JoinHandle<()>,
}

impl ConnectionManager {
    pub fn sender(&self) -> StreamSender {
        self.sender.clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Resolves once the connection reaches `target`.
    pub async fn wait_for_state(&self, target: ConnectionState) -> Result<(), StreamClientError> {
        let mut state = self.state.clone();
        state
            .wait_for(|current| *current == target)
            .await
            .map(|_| ())
            .map_err(|_| StreamClientError::SendQueueClosed)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops the worker and waits for it to exit.
    pub async fn shutdown(mut self) {
        let _ = self.sender.shutdown();
        if let Err(err) = (&mut self.task).await {
            warn!(event = "stream_worker_join_failed", error = %err);
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let _ = self.sender.shutdown();
    }
}

/// Errors produced by stream transport and protocol handling.
#[derive(Debug, Error)]
pub enum StreamClientError {
    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Access token could not be converted to a valid HTTP header value.
    #[error("invalid authorization header: {0}")]
    InvalidAuthHeader(#[from] InvalidHeaderValue),

    /// The server refused the upgrade because of the credential.
    #[error("websocket handshake rejected with status {status}")]
    Unauthorized { status: u16 },

    /// The connect handshake did not finish in time.
    #[error("websocket connect timed out after {}ms", .0.as_millis())]
    ConnectTimeout(Duration),

    /// There is no credential to connect with.
    #[error("no access credential is held")]
    NotAuthenticated,

    /// The handshake was refused again with a freshly refreshed token.
    #[error("websocket handshake rejected with status {status} after re-authentication")]
    AuthRejected { status: u16 },

    /// Renewing the token after a rejected handshake failed.
    #[error("re-authentication failed: {0}")]
    Reauthentication(RefreshFailure),

    /// Outbound command queue has been closed.
    #[error("send queue is closed")]
    SendQueueClosed,
}

impl StreamClientError {
    /// Transient failures that a reconnect round keeps retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::WebSocket(WsError::Http(response)) => response.status().is_server_error(),
            Self::WebSocket(_) | Self::ConnectTimeout(_) | Self::Unauthorized { .. } => true,
            Self::Json(_)
            | Self::InvalidAuthHeader(_)
            | Self::NotAuthenticated
            | Self::AuthRejected { .. }
            | Self::Reauthentication(_)
            | Self::SendQueueClosed => false,
        }
    }

    fn from_handshake(err: WsError) -> Self {
        if let WsError::Http(response) = &err {
            let status = response.status().as_u16();
            if is_auth_rejection(status) {
                return Self::Unauthorized { status };
            }
        }
        Self::WebSocket(err)
    }
}

struct WorkerContext {
    endpoint: String,
    credentials: Arc<CredentialStore>,
    refresh: Option<Arc<RefreshCoordinator>>,
    options: StreamOptions,
    router: Arc<EventRouter>,
    table: Arc<SubscriptionTable>,
    state: watch::Sender<ConnectionState>,
}

impl WorkerContext {
    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            debug!(event = "stream_state_changed", state = ?next);
        }
    }
}

enum SessionOutcome {
    Shutdown,
    Reconnect,
}

enum Flow {
    Continue,
    Stop,
}

async fn connection_worker(
    ctx: WorkerContext,
    mut commands: mpsc::UnboundedReceiver<StreamCommand>,
) {
    let mut auth = ctx.credentials.watch_state();
    let mut pending = VecDeque::new();
    let mut reconnecting = false;

    'worker: loop {
        if reconnecting {
            let flow = collect_commands_during_delay(
                ctx.options.reconnect.delay,
                &mut commands,
                &mut pending,
                &mut auth,
            )
            .await;
            if let Flow::Stop = flow {
                break;
            }
        }

        ctx.set_state(ConnectionState::Connecting);
        let opened = {
            let ctx_ref = &ctx;
            let reauth_used = AtomicBool::new(false);
            let reauthenticated = &reauth_used;
            let round = retry_async(
                &ctx.options.reconnect,
                move |attempt| open_authenticated(ctx_ref, attempt, reauthenticated),
                StreamClientError::is_retryable,
            );
            tokio::pin!(round);

            loop {
                tokio::select! {
                    result = &mut round => break result,
                    command = commands.recv() => match command {
                        Some(StreamCommand::Send(message)) => pending.push_back(message),
                        Some(StreamCommand::Reconnect) => {}
                        Some(StreamCommand::Shutdown) | None => break 'worker,
                    },
                    _ = signed_out(&mut auth) => break 'worker,
                }
            }
        };

        let socket = match opened {
            Ok(socket) => socket,
            Err(err) => {
                warn!(
                    event = "stream_connect_failed",
                    error = %err,
                    max_attempts = ctx.options.reconnect.max_attempts
                );
                ctx.set_state(ConnectionState::Erroring);
                match wait_for_demand(&mut commands, &mut pending, &mut auth).await {
                    Flow::Continue => {
                        reconnecting = false;
                        continue;
                    }
                    Flow::Stop => break,
                }
            }
        };

        ctx.set_state(ConnectionState::Connected);
        info!(event = "stream_connected", endpoint = %ctx.endpoint);

        match run_connected_session(&ctx, socket, &mut commands, &mut pending, &mut auth).await {
            SessionOutcome::Shutdown => break,
            SessionOutcome::Reconnect => {
                ctx.set_state(ConnectionState::Disconnected);
                info!(event = "stream_disconnected", endpoint = %ctx.endpoint);
                reconnecting = true;
            }
        }
    }

    ctx.set_state(ConnectionState::Disconnected);
    info!(event = "stream_worker_stopped", endpoint = %ctx.endpoint);
}

/// Opens the socket, renewing the token at most once per reconnect round.
async fn open_authenticated(
    ctx: &WorkerContext,
    attempt: usize,
    reauthenticated: &AtomicBool,
) -> Result<WsStream, StreamClientError> {
    let credential = ctx
        .credentials
        .current()
        .ok_or(StreamClientError::NotAuthenticated)?;
    debug!(event = "stream_connect_attempt", attempt, endpoint = %ctx.endpoint);

    match open_socket(ctx, &credential).await {
        Err(StreamClientError::Unauthorized { status }) => {
            let Some(refresh) = ctx.refresh.as_ref() else {
                return Err(StreamClientError::Unauthorized { status });
            };
            if reauthenticated.swap(true, Ordering::SeqCst) {
                return Err(StreamClientError::AuthRejected { status });
            }
            info!(event = "stream_reauthenticating", status);
            let renewed = refresh
                .refresh_after_rejection(credential.generation)
                .await
                .map_err(StreamClientError::Reauthentication)?;
            // A refusal right after renewing ends the round.
            match open_socket(ctx, &renewed).await {
                Err(StreamClientError::Unauthorized { status }) => {
                    warn!(event = "stream_reauthentication_rejected", status);
                    Err(StreamClientError::AuthRejected { status })
                }
                other => other,
            }
        }
        other => other,
    }
}

async fn open_socket(
    ctx: &WorkerContext,
    credential: &Credential,
) -> Result<WsStream, StreamClientError> {
    let mut request = ctx.endpoint.as_str().into_client_request()?;
    let bearer: HeaderValue = format!("Bearer {}", credential.token.expose_secret()).parse()?;
    request.headers_mut().insert(AUTHORIZATION, bearer);

    let (socket, _) = with_timeout(ctx.options.connect_timeout, connect_async(request))
        .await
        .map_err(|_| StreamClientError::ConnectTimeout(ctx.options.connect_timeout))?
        .map_err(StreamClientError::from_handshake)?;
    Ok(socket)
}

async fn run_connected_session(
    ctx: &WorkerContext,
    mut socket: WsStream,
    commands: &mut mpsc::UnboundedReceiver<StreamCommand>,
    pending: &mut VecDeque<ClientMessage>,
    auth: &mut watch::Receiver<AuthState>,
) -> SessionOutcome {
    // Keys the server has been asked to stream on this socket.
    let mut subscribed = HashSet::new();

    let active = ctx.table.active_keys();
    if !active.is_empty() {
        info!(event = "stream_resubscribing", streams = active.len());
    }
    for stream in active {
        if let Err(err) = forward(&mut socket, &mut subscribed, &ClientMessage::subscribe(stream)).await {
            warn!(event = "stream_resubscribe_failed", error = %err);
            return SessionOutcome::Reconnect;
        }
    }

    while let Some(next) = pending.pop_front() {
        if is_stale_control(&next, &ctx.table) {
            trace!(event = "stream_queued_control_skipped", message = ?next);
            continue;
        }
        if let Err(err) = forward(&mut socket, &mut subscribed, &next).await {
            warn!(event = "stream_flush_failed", error = %err);
            pending.push_front(next);
            return SessionOutcome::Reconnect;
        }
    }

    let mut keepalive = ctx
        .options
        .keepalive_interval
        .filter(|period| !period.is_zero())
        .map(|period| tokio::time::interval_at(Instant::now() + period, period));

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(StreamCommand::Send(message)) => {
                    if let Err(err) = forward(&mut socket, &mut subscribed, &message).await {
                        warn!(event = "stream_send_failed", error = %err);
                        pending.push_front(message);
                        return SessionOutcome::Reconnect;
                    }
                }
                Some(StreamCommand::Reconnect) => {
                    let _ = socket.close(None).await;
                    return SessionOutcome::Reconnect;
                }
                Some(StreamCommand::Shutdown) | None => {
                    let _ = socket.close(None).await;
                    return SessionOutcome::Shutdown;
                }
            },
            inbound = socket.next() => match inbound {
                Some(Ok(Message::Text(text))) => route_inbound(ctx, &text),
                Some(Ok(Message::Ping(payload))) => {
                    if socket.send(Message::Pong(payload)).await.is_err() {
                        return SessionOutcome::Reconnect;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(event = "stream_closed_by_server", frame = ?frame);
                    return SessionOutcome::Reconnect;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(event = "stream_receive_failed", error = %err);
                    return SessionOutcome::Reconnect;
                }
                None => return SessionOutcome::Reconnect,
            },
            _ = keepalive_tick(&mut keepalive) => {
                if socket.send(Message::Ping(Vec::new())).await.is_err() {
                    return SessionOutcome::Reconnect;
                }
            }
            _ = signed_out(auth) => {
                info!(event = "stream_session_ended");
                let _ = socket.close(None).await;
                return SessionOutcome::Shutdown;
            }
        }
    }
}

fn route_inbound(ctx: &WorkerContext, text: &str) {
    match ServerMessage::from_text(text) {
        Ok(message) => {
            let delivered = ctx.router.dispatch(&message);
            trace!(
                event = "stream_event_routed",
                name = %message.event,
                stream = ?message.stream,
                delivered
            );
        }
        Err(err) => warn!(event = "stream_message_invalid", error = %err),
    }
}

/// Sends `message` unless it would repeat the socket's subscription state.
async fn forward(
    socket: &mut WsStream,
    subscribed: &mut HashSet<String>,
    message: &ClientMessage,
) -> Result<(), StreamClientError> {
    let needed = match message {
        ClientMessage::Subscribe { stream } => subscribed.insert(stream.clone()),
        ClientMessage::Unsubscribe { stream } => subscribed.remove(stream),
        ClientMessage::Ping { .. } => true,
    };
    if !needed {
        trace!(event = "stream_control_deduplicated", message = ?message);
        return Ok(());
    }
    send_client_message(socket, message).await
}

// Queued control messages are superseded by the resubscribe from the table.
fn is_stale_control(message: &ClientMessage, table: &SubscriptionTable) -> bool {
    match message {
        ClientMessage::Subscribe { stream } => table.ref_count(stream) == 0,
        ClientMessage::Unsubscribe { stream } => table.ref_count(stream) > 0,
        ClientMessage::Ping { .. } => false,
    }
}

async fn send_client_message(
    socket: &mut WsStream,
    message: &ClientMessage,
) -> Result<(), StreamClientError> {
    let text = message.to_text()?;
    socket.send(Message::Text(text)).await?;
    Ok(())
}

async fn keepalive_tick(keepalive: &mut Option<Interval>) {
    match keepalive.as_mut() {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Resolves once the session is no longer authenticated.
async fn signed_out(auth: &mut watch::Receiver<AuthState>) {
    if auth
        .wait_for(|state| !state.is_authenticated())
        .await
        .is_err()
    {
        std::future::pending::<()>().await;
    }
}

async fn collect_commands_during_delay(
    delay: Duration,
    commands: &mut mpsc::UnboundedReceiver<StreamCommand>,
    pending: &mut VecDeque<ClientMessage>,
    auth: &mut watch::Receiver<AuthState>,
) -> Flow {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return Flow::Continue,
            command = commands.recv() => match command {
                Some(StreamCommand::Send(message)) => pending.push_back(message),
                Some(StreamCommand::Reconnect) => return Flow::Continue,
                Some(StreamCommand::Shutdown) | None => return Flow::Stop,
            },
            _ = signed_out(auth) => return Flow::Stop,
        }
    }
}

async fn wait_for_demand(
    commands: &mut mpsc::UnboundedReceiver<StreamCommand>,
    pending: &mut VecDeque<ClientMessage>,
    auth: &mut watch::Receiver<AuthState>,
) -> Flow {
    tokio::select! {
        command = commands.recv() => match command {
            Some(StreamCommand::Send(message)) => {
                pending.push_back(message);
                Flow::Continue
            }
            Some(StreamCommand::Reconnect) => Flow::Continue,
            Some(StreamCommand::Shutdown) | None => Flow::Stop,
        },
        _ = signed_out(auth) => Flow::Stop,
    }
}
