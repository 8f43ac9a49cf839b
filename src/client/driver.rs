use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{self, BoxFuture, FutureExt};
use secrecy::ExposeSecret;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};

use crate::audio::AudioGate;
use crate::auth::{Credentials, TokenStore};
use crate::avatar::{AvatarCoordinator, AvatarReply};
use crate::client::config::Config;
use crate::client::stats::{self, SharedStats, Stats};
use crate::client::ClientEvent;
use crate::error::ClientError;
use crate::reconnect::{Reconnector, RetryDecision};
use crate::sessions::{SessionRegistry, SessionReply};
use crate::transport::{parse_frame, Connector, Handshake, Link, Transport};
use crate::turn::TurnCoordinator;
use crate::types::events::RefreshEvent;
use crate::types::{ClientFrame, ConnectionState, ServerFrame};

pub(crate) type Reply<T> = oneshot::Sender<Result<T, ClientError>>;

pub(crate) enum Command {
    Connect(Reply<()>),
    SendMessage { text: String, reply: Reply<()> },
    NewSession { agent_key: Option<String>, reply: SessionReply },
    ResumeSession { session_id: String, reply: SessionReply },
    RenameSession { name: String, reply: Reply<()> },
    ClearMessages(Reply<()>),
    StartAvatar { avatar_id: String, reply: AvatarReply },
    EndAvatar(oneshot::Sender<()>),
    Close(oneshot::Sender<()>),
}

enum Phase {
    Idle,
    Handshaking(BoxFuture<'static, Result<Handshake, ClientError>>),
    Connected(Link),
    /// Backing off before the next attempt.
    Waiting(Pin<Box<Sleep>>),
}

enum PhaseEvent {
    Handshake(Result<Handshake, ClientError>),
    Inbound(Option<Result<String, ClientError>>),
    RetryDue,
}

async fn next_phase_event(phase: &mut Phase) -> PhaseEvent {
    match phase {
        Phase::Idle => future::pending().await,
        Phase::Handshaking(attempt) => PhaseEvent::Handshake(attempt.await),
        Phase::Connected(link) => PhaseEvent::Inbound(link.next().await),
        Phase::Waiting(sleep) => {
            sleep.as_mut().await;
            PhaseEvent::RetryDue
        }
    }
}

async fn next_refresh(refresh: &mut Option<BoxFuture<'static, Result<Arc<Credentials>, ClientError>>>) -> Result<Arc<Credentials>, ClientError> {
    match refresh {
        Some(refresh) => refresh.await,
        None => future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}

/// The single task that owns turn, session, avatar and reconnection state.
/// Inbound frames and commands are processed here strictly one at a time.
pub(crate) struct Driver {
    config: Config,
    connector: Arc<dyn Connector>,
    tokens: Arc<TokenStore>,
    transport: Arc<Transport>,
    gate: Arc<AudioGate>,
    turn: TurnCoordinator,
    sessions: SessionRegistry,
    avatar: AvatarCoordinator,
    reconnector: Reconnector,
    events: broadcast::Sender<ClientEvent>,
    stats: SharedStats,
    commands: mpsc::Receiver<Command>,
    phase: Phase,
    refresh: Option<BoxFuture<'static, Result<Arc<Credentials>, ClientError>>>,
    token_check: Interval,
    connect_waiters: Vec<Reply<()>>,
    has_been_ready: bool,
}

pub(crate) struct DriverParts {
    pub(crate) config: Config,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) tokens: Arc<TokenStore>,
    pub(crate) transport: Arc<Transport>,
    pub(crate) gate: Arc<AudioGate>,
    pub(crate) turn: TurnCoordinator,
    pub(crate) sessions: SessionRegistry,
    pub(crate) avatar: AvatarCoordinator,
    pub(crate) reconnector: Reconnector,
    pub(crate) events: broadcast::Sender<ClientEvent>,
    pub(crate) stats: SharedStats,
    pub(crate) commands: mpsc::Receiver<Command>,
}

impl Driver {
    pub(crate) fn new(parts: DriverParts) -> Self {
        let mut token_check = tokio::time::interval(parts.config.token_check_interval());
        token_check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            config: parts.config,
            connector: parts.connector,
            tokens: parts.tokens,
            transport: parts.transport,
            gate: parts.gate,
            turn: parts.turn,
            sessions: parts.sessions,
            avatar: parts.avatar,
            reconnector: parts.reconnector,
            events: parts.events,
            stats: parts.stats,
            commands: parts.commands,
            phase: Phase::Idle,
            refresh: None,
            token_check,
            connect_waiters: Vec::new(),
            has_been_ready: false,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            let deadline = match (self.sessions.next_deadline(), self.avatar.deadline()) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(Command::Close(reply)) => {
                            self.shutdown().await;
                            let _ = reply.send(());
                            break;
                        }
                        Some(command) => self.handle_command(command),
                        None => {
                            tracing::debug!("client dropped");
                            self.shutdown().await;
                            break;
                        }
                    }
                }
                event = next_phase_event(&mut self.phase) => {
                    match event {
                        PhaseEvent::Handshake(Ok(handshake)) => self.on_ready(handshake),
                        PhaseEvent::Handshake(Err(e)) => self.on_attempt_failed(e),
                        PhaseEvent::Inbound(Some(Ok(text))) => self.on_text(&text),
                        PhaseEvent::Inbound(Some(Err(e))) => self.on_connection_lost(e),
                        PhaseEvent::Inbound(None) => {
                            self.on_connection_lost(ClientError::Network("connection closed by server".to_string()))
                        }
                        PhaseEvent::RetryDue => self.start_attempt(),
                    }
                }
                result = next_refresh(&mut self.refresh) => {
                    self.refresh = None;
                    self.on_background_refresh(result);
                }
                _ = self.token_check.tick() => self.check_token(),
                _ = sleep_until(deadline) => {
                    let now = Instant::now();
                    self.sessions.expire(now);
                    self.avatar.expire(&self.transport, now);
                }
            }
        }
        tracing::debug!("driver finished");
    }

    fn emit(&self, event: ClientEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(reply) => self.connect(reply),
            Command::SendMessage { text, reply } => {
                let _ = reply.send(self.sessions.send_message(&self.transport, &text));
            }
            Command::NewSession { agent_key, reply } => {
                self.sessions.request_new_session(&self.transport, agent_key.as_deref(), reply)
            }
            Command::ResumeSession { session_id, reply } => {
                self.sessions.request_resume(&self.transport, &session_id, reply)
            }
            Command::RenameSession { name, reply } => {
                let _ = reply.send(self.sessions.rename_current(&self.transport, &name));
            }
            Command::ClearMessages(reply) => {
                let _ = reply.send(self.sessions.clear_current(&self.transport));
            }
            Command::StartAvatar { avatar_id, reply } => {
                let token = self
                    .tokens
                    .credentials()
                    .and_then(|c| c.avatar_token().map(|t| t.expose_secret().to_string()));
                self.avatar.start(&self.transport, &avatar_id, token.as_deref(), reply);
            }
            Command::EndAvatar(reply) => {
                self.avatar.end(&self.transport);
                let _ = reply.send(());
            }
            Command::Close(reply) => {
                let _ = reply.send(());
            }
        }
    }

    fn connect(&mut self, reply: Reply<()>) {
        match &self.phase {
            Phase::Connected(_) => {
                let _ = reply.send(Ok(()));
            }
            Phase::Handshaking(_) => {
                tracing::debug!("joining connect attempt in flight");
                self.connect_waiters.push(reply);
            }
            Phase::Waiting(_) | Phase::Idle => {
                if self.tokens.credentials().is_none() {
                    let _ = reply.send(Err(ClientError::Auth("no credentials, initialize the token store first".to_string())));
                    return;
                }
                self.connect_waiters.push(reply);
                self.reconnector.reset();
                self.start_attempt();
            }
        }
    }

    fn start_attempt(&mut self) {
        let transport = self.transport.clone();
        let connector = self.connector.clone();
        let tokens = self.tokens.clone();
        let timeouts = self.config.handshake_timeouts();
        let refresh_buffer = self.config.refresh_buffer();

        self.phase = Phase::Handshaking(
            async move {
                transport.set_state(ConnectionState::Connecting);
                if tokens.is_expiring_soon(refresh_buffer) {
                    match tokens.refresh().await {
                        Ok(_) => {}
                        // Still usable; let the server decide.
                        Err(e) if e.is_auth() && tokens.credentials().is_some_and(|c| !c.is_expiring_within(Duration::ZERO)) => {
                            tracing::warn!("refresh before connect failed, using current token: {}", e);
                        }
                        Err(e) => return Err(e),
                    }
                }
                let credentials = tokens
                    .credentials()
                    .ok_or_else(|| ClientError::Auth("no credentials".to_string()))?;
                transport.connect(connector.as_ref(), &credentials, timeouts).await
            }
            .boxed(),
        );
    }

    fn on_ready(&mut self, handshake: Handshake) {
        let Handshake {
            link,
            outbound,
            backlog,
        } = handshake;

        if self.has_been_ready {
            stats::update(&self.stats, Stats::record_reconnect);
        }
        self.has_been_ready = true;
        self.transport.attach(outbound);
        self.reconnector.reset();
        self.phase = Phase::Connected(link);
        self.emit(ClientEvent::Ready);

        for frame in backlog {
            self.dispatch(frame);
        }
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }

    fn on_text(&mut self, text: &str) {
        match parse_frame(text, &self.stats) {
            Ok(Some(frame)) => self.dispatch(frame),
            Ok(None) => {}
            Err(e) => self.on_connection_lost(e),
        }
    }

    /// Updates components, then publishes the frame.
    fn dispatch(&mut self, frame: ServerFrame) {
        match &frame {
            ServerFrame::TurnStart(event) => {
                if !self.turn.on_turn_start(event.holder()).is_empty() {
                    self.avatar.on_turn(self.turn.state());
                }
            }
            ServerFrame::TurnEnd(event) => {
                if self.turn.on_turn_end(event.holder()).is_some() {
                    self.avatar.on_turn(self.turn.state());
                }
            }
            ServerFrame::TextDelta(event) => self.sessions.on_text_delta(event),
            ServerFrame::TextComplete(event) => self.sessions.on_text_complete(event),
            ServerFrame::SessionList(event) => self.sessions.on_session_list(event),
            ServerFrame::SessionStarted(event) => self.sessions.on_session_started(event),
            ServerFrame::ToolNotification(event) => self.sessions.on_tool_notification(event),
            ServerFrame::AudioDelta(event) => self.gate.play(event),
            ServerFrame::AvatarReady(event) => self.avatar.on_ready(event, self.turn.state()),
            ServerFrame::AvatarDisconnected(event) => self.avatar.on_disconnected(event),
            ServerFrame::Authenticated(_) => tracing::debug!("token accepted"),
            ServerFrame::Error(event) if event.is_auth_rejection() => {
                let error = ClientError::AuthRejected(event.message().to_string());
                self.emit(ClientEvent::Frame(frame));
                self.on_connection_lost(error);
                return;
            }
            ServerFrame::Error(event) => {
                tracing::warn!("server error ({}): {}", event.code().unwrap_or("no code"), event.message());
                self.emit(ClientEvent::Frame(frame.clone()));
                self.emit(ClientEvent::Error(ClientError::Server {
                    code: event.code().map(str::to_string),
                    message: event.message().to_string(),
                }));
                return;
            }
            ServerFrame::Unknown => return,
        }
        self.emit(ClientEvent::Frame(frame));
    }

    fn on_connection_lost(&mut self, error: ClientError) {
        tracing::warn!("connection lost: {}", error);
        self.transport.detach();
        self.phase = Phase::Idle;
        self.refresh = None;

        self.turn.reset();
        self.sessions.on_disconnect();
        self.avatar.on_transport_lost();
        self.gate.discard_queued();
        self.emit(ClientEvent::Disconnected);

        self.on_attempt_failed(error);
    }

    fn on_attempt_failed(&mut self, error: ClientError) {
        match self.reconnector.on_failure(&error) {
            RetryDecision::Retry { attempt, delay } => {
                self.transport.set_state(ConnectionState::Reconnecting);
                self.emit(ClientEvent::Reconnecting { attempt, delay });
                self.phase = Phase::Waiting(Box::pin(tokio::time::sleep(delay)));
            }
            RetryDecision::GiveUp(error) => {
                self.transport.set_state(ConnectionState::Error);
                self.phase = Phase::Idle;
                self.emit(ClientEvent::Error(error.clone()));
                self.emit(ClientEvent::Fatal(error.clone()));
                for waiter in self.connect_waiters.drain(..) {
                    let _ = waiter.send(Err(error.clone()));
                }
            }
        }
    }

    fn check_token(&mut self) {
        if self.refresh.is_some() || !self.transport.state().is_ready() {
            return;
        }
        if self.tokens.is_expiring_soon(self.config.refresh_buffer()) {
            let tokens = self.tokens.clone();
            self.refresh = Some(async move { tokens.refresh().await }.boxed());
        }
    }

    fn on_background_refresh(&mut self, result: Result<Arc<Credentials>, ClientError>) {
        match result {
            Ok(credentials) => {
                let frame = ClientFrame::Refresh(RefreshEvent::new(credentials.access_token().expose_secret()));
                if let Err(e) = self.transport.send(frame) {
                    tracing::warn!("refreshed token not sent: {}", e);
                }
            }
            Err(e) if e.is_auth() => {
                tracing::error!("token refresh rejected: {}", e);
                self.emit(ClientEvent::Error(e));
            }
            Err(e) => tracing::warn!("token refresh failed, retrying on next check: {}", e),
        }
    }

    async fn shutdown(&mut self) {
        tracing::info!("closing client");
        self.avatar.end(&self.transport);
        self.gate.stop_capture().await;
        self.transport.close();
        if let Phase::Connected(link) = std::mem::replace(&mut self.phase, Phase::Idle) {
            link.finish();
        }
        self.refresh = None;
        self.turn.reset();
        self.sessions.fail_pending(ClientError::Closed);
        self.sessions.on_disconnect();
        self.avatar.fail_waiters(ClientError::Closed);
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(ClientError::Closed));
        }
    }
}
