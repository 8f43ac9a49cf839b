use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::auth::Credentials;
use crate::client::stats::{self, SharedStats, Stats};
use crate::error::ClientError;
use crate::types::events::{AuthenticatedEvent, ErrorEvent, LoginEvent};
use crate::types::{ClientFrame, ConnectionState, ServerFrame};

#[cfg(test)]
pub(crate) mod mock;
mod websocket;

pub use websocket::WebSocketConnector;

/// Outgoing JSON text frames.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = ClientError> + Send>>;
/// Incoming JSON text frames, in arrival order.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, ClientError>> + Send>>;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Opens the raw duplex channel.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, url: &str, token: &SecretString) -> Result<(FrameSink, FrameStream), ClientError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HandshakeTimeouts {
    pub connect: Duration,
    pub auth: Duration,
    pub init: Duration,
}

/// A live connection: the inbound stream plus the writer task that owns the sink.
pub(crate) struct Link {
    stream: FrameStream,
    writer: JoinHandle<()>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Link {
    pub(crate) async fn next(&mut self) -> Option<Result<String, ClientError>> {
        self.stream.next().await
    }

    /// Lets the writer flush what is already queued before it closes the socket.
    /// The writer stops once the outbound sender is dropped, see [`Transport::detach`].
    pub(crate) fn finish(mut self) {
        self.shutdown.take();
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            if shutdown.send(()).is_err() {
                self.writer.abort();
            }
        }
    }
}

/// Result of a completed handshake, not yet attached to the [`Transport`].
pub(crate) struct Handshake {
    pub(crate) link: Link,
    pub(crate) outbound: mpsc::Sender<ClientFrame>,
    /// Frames received before READY, in arrival order. Ends with the first `session_list`.
    pub(crate) backlog: Vec<ServerFrame>,
}

/// Owns the connection state and the outbound queue.
pub struct Transport {
    state: watch::Sender<ConnectionState>,
    outbound: Mutex<Option<mpsc::Sender<ClientFrame>>>,
    capacity: usize,
    stats: SharedStats,
}

impl Transport {
    pub(crate) fn new(capacity: usize, stats: SharedStats) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            state,
            outbound: Mutex::new(None),
            capacity,
            stats,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub(crate) fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::info!("connection state: {} -> {}", previous, next);
        }
    }

    /// Queues a frame for the writer. Fails unless the connection is READY; never waits.
    pub fn send(&self, frame: ClientFrame) -> Result<(), ClientError> {
        let state = self.state();
        if !state.is_ready() {
            return Err(ClientError::NotReady(state));
        }
        let outbound = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = outbound.as_ref() else {
            return Err(ClientError::NotReady(state));
        };
        tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(frame) => {
                ClientError::Network(format!("outbound queue full, dropped {}", frame.kind()))
            }
            mpsc::error::TrySendError::Closed(_) => ClientError::Network("connection closed".to_string()),
        })
    }

    /// Makes a completed handshake's writer the outbound path and enters READY.
    pub(crate) fn attach(&self, outbound: mpsc::Sender<ClientFrame>) {
        *self.outbound.lock().unwrap_or_else(PoisonError::into_inner) = Some(outbound);
        self.set_state(ConnectionState::Ready);
    }

    /// Drops the outbound queue. The state is left for the caller to decide.
    pub(crate) fn detach(&self) {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    /// Idempotent.
    pub(crate) fn close(&self) {
        self.detach();
        self.set_state(ConnectionState::Disconnected);
    }

    /// Runs CONNECTING, AUTHENTICATING and INITIALIZING against `connector`.
    pub(crate) async fn connect(
        &self,
        connector: &dyn Connector,
        credentials: &Credentials,
        timeouts: HandshakeTimeouts,
    ) -> Result<Handshake, ClientError> {
        self.set_state(ConnectionState::Connecting);
        tracing::debug!("opening {}", credentials.websocket_url());
        let (mut sink, mut stream) = tokio::time::timeout(
            timeouts.connect,
            connector.open(credentials.websocket_url(), credentials.access_token()),
        )
        .await
        .map_err(|_| ClientError::Network("timed out opening connection".to_string()))??;

        let login = ClientFrame::Login(LoginEvent::new(credentials.access_token().expose_secret()));
        sink.send(encode(&login)?).await?;
        stats::update(&self.stats, Stats::record_sent);

        self.set_state(ConnectionState::Authenticating);
        let mut backlog = Vec::new();
        let authenticated = tokio::time::timeout(timeouts.auth, self.await_authenticated(&mut stream, &mut backlog))
            .await
            .map_err(|_| ClientError::Protocol("timed out waiting for authentication".to_string()))??;
        tracing::info!("authenticated as {}", authenticated.user_id().unwrap_or("<anonymous>"));

        self.set_state(ConnectionState::Initializing);
        tokio::time::timeout(timeouts.init, self.await_session_list(&mut stream, &mut backlog))
            .await
            .map_err(|_| ClientError::Protocol("timed out waiting for session list".to_string()))??;

        let (outbound, rx) = mpsc::channel(self.capacity);
        let (shutdown, shutdown_rx) = oneshot::channel();
        let writer = tokio::spawn(write_loop(sink, rx, shutdown_rx, self.stats.clone()));

        Ok(Handshake {
            link: Link {
                stream,
                writer,
                shutdown: Some(shutdown),
            },
            outbound,
            backlog,
        })
    }

    async fn await_authenticated(
        &self,
        stream: &mut FrameStream,
        backlog: &mut Vec<ServerFrame>,
    ) -> Result<AuthenticatedEvent, ClientError> {
        loop {
            match self.next_handshake_frame(stream).await? {
                ServerFrame::Authenticated(event) => return Ok(event),
                ServerFrame::Error(event) => return Err(handshake_error(&event)),
                other => backlog.push(other),
            }
        }
    }

    async fn await_session_list(&self, stream: &mut FrameStream, backlog: &mut Vec<ServerFrame>) -> Result<(), ClientError> {
        loop {
            match self.next_handshake_frame(stream).await? {
                ServerFrame::Error(event) => return Err(handshake_error(&event)),
                frame @ ServerFrame::SessionList(_) => {
                    backlog.push(frame);
                    return Ok(());
                }
                other => backlog.push(other),
            }
        }
    }

    async fn next_handshake_frame(&self, stream: &mut FrameStream) -> Result<ServerFrame, ClientError> {
        loop {
            let text = stream
                .next()
                .await
                .ok_or_else(|| ClientError::Network("connection closed during handshake".to_string()))??;
            if let Some(frame) = parse_frame(&text, &self.stats)? {
                return Ok(frame);
            }
        }
    }
}

fn handshake_error(event: &ErrorEvent) -> ClientError {
    if event.is_auth_rejection() {
        ClientError::AuthRejected(event.message().to_string())
    } else {
        ClientError::Protocol(format!(
            "server error during handshake ({}): {}",
            event.code().unwrap_or("no code"),
            event.message()
        ))
    }
}

fn encode(frame: &ClientFrame) -> Result<String, ClientError> {
    serde_json::to_string(frame).map_err(|e| ClientError::Protocol(format!("failed to serialize {}: {}", frame.kind(), e)))
}

/// Parses one inbound text frame. Unknown discriminants are counted and yield `None`.
pub(crate) fn parse_frame(text: &str, stats: &SharedStats) -> Result<Option<ServerFrame>, ClientError> {
    let json = serde_json::from_str::<serde_json::Value>(text)
        .map_err(|e| ClientError::Protocol(format!("frame is not json: {}", e)))?;
    let frame_type = json.get("type").and_then(|v| v.as_str()).unwrap_or("unknown").to_string();
    tracing::debug!("received frame: {}", frame_type);
    stats::update(stats, Stats::record_received);

    match serde_json::from_value::<ServerFrame>(json) {
        Ok(ServerFrame::Unknown) => {
            tracing::warn!("dropping frame with unknown type: {}", frame_type);
            stats::update(stats, Stats::record_unknown);
            Ok(None)
        }
        Ok(frame) => Ok(Some(frame)),
        Err(e) => {
            tracing::error!("failed to deserialize {} frame: {}", frame_type, e);
            Err(ClientError::Protocol(format!("malformed {} frame: {}", frame_type, e)))
        }
    }
}

async fn write_loop(
    mut sink: FrameSink,
    mut rx: mpsc::Receiver<ClientFrame>,
    mut shutdown: oneshot::Receiver<()>,
    stats: SharedStats,
) {
    loop {
        tokio::select! {
            biased;
            Ok(()) = &mut shutdown => break,
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                let text = match encode(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!("{}", e);
                        continue;
                    }
                };
                tracing::debug!("sending frame: {}", frame.kind());
                if let Err(e) = sink.send(text).await {
                    tracing::error!("failed to send frame: {}", e);
                    break;
                }
                stats::update(&stats, Stats::record_sent);
            }
        }
    }

    match tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await {
        Ok(Ok(())) => tracing::debug!("writer closed"),
        Ok(Err(e)) => tracing::debug!("error closing connection: {}", e),
        Err(_) => tracing::warn!("timed out closing connection"),
    }
}
