use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::audio::{AudioCapture, AudioGate, AudioPlayback};
use crate::auth::{CredentialExchange, HttpCredentialExchange, TokenStore};
use crate::avatar::{AvatarCoordinator, AvatarState};
use crate::error::ClientError;
use crate::reconnect::Reconnector;
use crate::sessions::{SessionRegistry, SessionSnapshot};
use crate::transport::{Connector, Transport, WebSocketConnector};
use crate::turn::{self, TurnCoordinator, TurnSnapshot};
use crate::types::{
    AudioCaptureState, ChatSession, ConnectionState, CredentialPayload, ReconnectionState, ServerFrame, TurnState,
    TurnTransition,
};

use self::driver::{Command, Driver, DriverParts};
use self::stats::SharedStats;

pub use self::config::{Config, ConfigBuilder};
pub use self::stats::Stats;

mod config;
mod consts;
mod driver;
pub(crate) mod stats;
#[cfg(test)]
mod tests;
pub(crate) mod utils;

/// Ordered event stream. A receiver that falls more than `event_capacity` events behind gets
/// `RecvError::Lagged(n)` in place of the `n` oldest events it missed; the watch snapshots
/// (`watch_sessions`, `watch_turn`, ...) always hold the current state.
pub type EventRx = broadcast::Receiver<ClientEvent>;

/// What the client reports on its event stream, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Every inbound frame, after the client's own state has been updated from it.
    Frame(ServerFrame),
    Ready,
    Disconnected,
    Reconnecting { attempt: u32, delay: Duration },
    /// A server `error` frame, or a failure the caller may want to show.
    Error(ClientError),
    /// The client stopped retrying. Only `connect()` resumes.
    Fatal(ClientError),
}

pub struct ClientBuilder {
    config: Config,
    connector: Option<Arc<dyn Connector>>,
    exchange: Option<Arc<dyn CredentialExchange>>,
    capture: Option<Arc<dyn AudioCapture>>,
    playback: Option<Arc<dyn AudioPlayback>>,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            connector: None,
            exchange: None,
            capture: None,
            playback: None,
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Replaces the websocket connector, e.g. with an in-memory one.
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Defaults to HTTP against `auth_base_url` when one is configured.
    pub fn with_credential_exchange(mut self, exchange: Arc<dyn CredentialExchange>) -> Self {
        self.exchange = Some(exchange);
        self
    }

    pub fn with_capture(mut self, capture: Arc<dyn AudioCapture>) -> Self {
        self.capture = Some(capture);
        self
    }

    pub fn with_playback(mut self, playback: Arc<dyn AudioPlayback>) -> Self {
        self.playback = Some(playback);
        self
    }

    /// Spawns the client's tasks; must be called inside a tokio runtime.
    pub fn build(self) -> Client {
        let config = self.config;
        let stats: SharedStats = Arc::new(Mutex::new(Stats::new()));
        let exchange = self.exchange.or_else(|| {
            config
                .auth_base_url()
                .map(|url| Arc::new(HttpCredentialExchange::new(url)) as Arc<dyn CredentialExchange>)
        });
        let tokens = Arc::new(TokenStore::new(exchange));
        let connector = self.connector.unwrap_or_else(|| Arc::new(WebSocketConnector));
        let transport = Arc::new(Transport::new(config.event_capacity(), stats.clone()));
        let gate = Arc::new(AudioGate::new(
            config.audio_queue_capacity(),
            transport.clone(),
            stats.clone(),
            self.capture,
            self.playback,
        ));

        let mut turn = TurnCoordinator::new(config.turn_history_limit());
        turn.add_observer(gate.clone());
        let sessions = SessionRegistry::new(config.request_timeout());
        let avatar = AvatarCoordinator::new(config.request_timeout());
        let reconnector = Reconnector::new(config.reconnect_policy());

        let (events, _) = broadcast::channel(config.event_capacity());
        let (commands, command_rx) = mpsc::channel(32);

        let client = Client {
            commands,
            events: events.clone(),
            tokens: tokens.clone(),
            transport: transport.clone(),
            gate: gate.clone(),
            turn: turn.subscribe(),
            sessions: sessions.subscribe(),
            avatar: avatar.subscribe(),
            reconnection: reconnector.subscribe(),
            stats: stats.clone(),
            closed: AtomicBool::new(false),
            forwarder: Mutex::new(Some(gate.spawn_forwarder())),
            driver: Mutex::new(None),
        };

        let driver = Driver::new(DriverParts {
            config,
            connector,
            tokens,
            transport,
            gate,
            turn,
            sessions,
            avatar,
            reconnector,
            events,
            stats,
            commands: command_rx,
        });
        let handle = tokio::spawn(driver.run().instrument(tracing::info_span!("realtime_client")));
        *client.driver.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        client
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to one realtime session. Share it by reference or behind an `Arc`.
pub struct Client {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<ClientEvent>,
    tokens: Arc<TokenStore>,
    transport: Arc<Transport>,
    gate: Arc<AudioGate>,
    turn: watch::Receiver<TurnSnapshot>,
    sessions: watch::Receiver<SessionSnapshot>,
    avatar: watch::Receiver<AvatarState>,
    reconnection: watch::Receiver<ReconnectionState>,
    stats: SharedStats,
    closed: AtomicBool,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        Ok(())
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<Result<T, ClientError>>) -> Command) -> Result<T, ClientError> {
        self.ensure_open()?;
        let (tx, rx) = oneshot::channel();
        self.commands.send(command(tx)).await.map_err(|_| ClientError::Closed)?;
        rx.await.map_err(|_| ClientError::Closed)?
    }

    // auth

    pub fn token_store(&self) -> &TokenStore {
        &self.tokens
    }

    pub fn initialize_from_payload(&self, payload: CredentialPayload) -> Result<(), ClientError> {
        self.ensure_open()?;
        self.tokens.initialize_from_payload(payload)
    }

    pub async fn login_for_development(&self, username: &str, password: &str) -> Result<(), ClientError> {
        self.ensure_open()?;
        self.tokens.login_for_development(username, password).await
    }

    // connection

    /// Resolves on READY, or with the error once retrying has stopped. Concurrent calls share one attempt.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.request(Command::Connect).await
    }

    /// Tears everything down. Idempotent.
    pub async fn close(&self) -> Result<(), ClientError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Close(tx)).await.is_ok() {
            let _ = rx.await;
        }
        if let Some(forwarder) = self.forwarder.lock().unwrap_or_else(PoisonError::into_inner).take() {
            forwarder.abort();
        }
        let driver = self.driver.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(driver) = driver {
            if let Err(e) = driver.await {
                tracing::error!("client driver failed: {}", e);
            }
        }
        Ok(())
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub fn watch_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.transport.subscribe_state()
    }

    pub fn reconnection_state(&self) -> ReconnectionState {
        *self.reconnection.borrow()
    }

    pub fn watch_reconnection_state(&self) -> watch::Receiver<ReconnectionState> {
        self.reconnection.clone()
    }

    /// Events from now on. Slow receivers are told how many events they skipped, see [`EventRx`].
    pub fn subscribe(&self) -> EventRx {
        self.events.subscribe()
    }

    pub fn stats(&self) -> Stats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    // turn

    pub fn turn_state(&self) -> TurnState {
        self.turn.borrow().state
    }

    pub fn turn_history(&self) -> Vec<TurnTransition> {
        self.turn.borrow().history.clone()
    }

    pub fn watch_turn(&self) -> watch::Receiver<TurnSnapshot> {
        self.turn.clone()
    }

    /// Asks for the floor. The turn only changes when the server confirms with `turn_start`.
    pub fn request_user_turn(&self) -> Result<(), ClientError> {
        self.ensure_open()?;
        let current = self.sessions.borrow().current_session_id.clone();
        turn::request_user_turn(&self.transport, current.as_deref())
    }

    // audio

    pub async fn start_capture(&self) -> Result<(), ClientError> {
        self.ensure_open()?;
        self.gate.start_capture().await
    }

    pub async fn stop_capture(&self) {
        self.gate.stop_capture().await
    }

    /// Returns whether audio is now armed; refused outside the user's turn.
    pub fn arm_streaming(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.gate.arm_streaming()
    }

    pub fn disarm_streaming(&self) {
        self.gate.disarm_streaming()
    }

    pub fn audio_state(&self) -> AudioCaptureState {
        self.gate.state()
    }

    pub fn watch_audio_state(&self) -> watch::Receiver<AudioCaptureState> {
        self.gate.subscribe()
    }

    // sessions

    pub async fn send_message(&self, text: &str) -> Result<(), ClientError> {
        let text = text.to_string();
        self.request(|reply| Command::SendMessage { text, reply }).await
    }

    pub async fn new_session(&self, agent_key: Option<&str>) -> Result<ChatSession, ClientError> {
        let agent_key = agent_key.map(str::to_string);
        self.request(|reply| Command::NewSession { agent_key, reply }).await
    }

    pub async fn resume_session(&self, session_id: &str) -> Result<ChatSession, ClientError> {
        let session_id = session_id.to_string();
        self.request(|reply| Command::ResumeSession { session_id, reply }).await
    }

    pub async fn set_session_name(&self, name: &str) -> Result<(), ClientError> {
        let name = name.to_string();
        self.request(|reply| Command::RenameSession { name, reply }).await
    }

    pub async fn clear_messages(&self) -> Result<(), ClientError> {
        self.request(Command::ClearMessages).await
    }

    pub fn sessions(&self) -> Vec<ChatSession> {
        self.sessions.borrow().sessions.clone()
    }

    pub fn current_session(&self) -> Option<ChatSession> {
        self.sessions.borrow().current().cloned()
    }

    pub fn streaming_text(&self) -> Option<String> {
        self.sessions.borrow().streaming_text.clone()
    }

    pub fn watch_sessions(&self) -> watch::Receiver<SessionSnapshot> {
        self.sessions.clone()
    }

    // avatar

    /// Resolves once the server reports `avatar_ready`.
    pub async fn start_avatar_session(&self, avatar_id: &str) -> Result<AvatarState, ClientError> {
        let avatar_id = avatar_id.to_string();
        self.request(|reply| Command::StartAvatar { avatar_id, reply }).await
    }

    /// Stops the avatar and resets local state without waiting for the server.
    pub async fn end_avatar_session(&self) -> Result<(), ClientError> {
        self.ensure_open()?;
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::EndAvatar(tx)).await.map_err(|_| ClientError::Closed)?;
        rx.await.map_err(|_| ClientError::Closed)
    }

    pub fn avatar_state(&self) -> AvatarState {
        self.avatar.borrow().clone()
    }

    pub fn watch_avatar_state(&self) -> watch::Receiver<AvatarState> {
        self.avatar.clone()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        // The driver sees the command channel close and tears down on its own.
        if let Some(forwarder) = self.forwarder.lock().unwrap_or_else(PoisonError::into_inner).take() {
            forwarder.abort();
        }
    }
}

/// Builds a default client from a pre-issued credential bundle and waits for READY.
pub async fn connect(payload: CredentialPayload) -> Result<Client, ClientError> {
    connect_with_config(payload, Config::default()).await
}

pub async fn connect_with_config(payload: CredentialPayload, config: Config) -> Result<Client, ClientError> {
    let client = ClientBuilder::new().with_config(config).build();
    client.initialize_from_payload(payload)?;
    client.connect().await?;
    Ok(client)
}
