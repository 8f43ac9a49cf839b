use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::time::Instant;

use crate::error::ClientError;
use crate::transport::Transport;
use crate::types::events::{AvatarDisconnectedEvent, AvatarReadyEvent, StartAvatarEvent, StopAvatarEvent};
use crate::types::{ClientFrame, TurnState};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AvatarState {
    #[default]
    Idle,
    Starting {
        avatar_id: String,
    },
    Active {
        avatar_id: String,
        session_id: Option<String>,
        /// Mirrors the agent holding the floor.
        speaking: bool,
    },
}

impl AvatarState {
    pub fn avatar_id(&self) -> Option<&str> {
        match self {
            AvatarState::Idle => None,
            AvatarState::Starting { avatar_id } | AvatarState::Active { avatar_id, .. } => Some(avatar_id),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, AvatarState::Active { .. })
    }
}

pub(crate) type AvatarReply = oneshot::Sender<Result<AvatarState, ClientError>>;

/// Tracks the optional avatar session riding on the main connection.
pub struct AvatarCoordinator {
    state: AvatarState,
    waiters: Vec<AvatarReply>,
    deadline: Option<Instant>,
    request_timeout: Duration,
    publisher: watch::Sender<AvatarState>,
}

impl AvatarCoordinator {
    pub fn new(request_timeout: Duration) -> Self {
        let (publisher, _) = watch::channel(AvatarState::Idle);
        Self {
            state: AvatarState::Idle,
            waiters: Vec::new(),
            deadline: None,
            request_timeout,
            publisher,
        }
    }

    pub fn state(&self) -> &AvatarState {
        &self.state
    }

    pub fn subscribe(&self) -> watch::Receiver<AvatarState> {
        self.publisher.subscribe()
    }

    fn set_state(&mut self, state: AvatarState) {
        if self.state != state {
            tracing::info!("avatar: {:?} -> {:?}", self.state, state);
            self.state = state;
            self.publisher.send_replace(self.state.clone());
        }
    }

    fn resolve(&mut self, result: Result<AvatarState, ClientError>) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }

    /// Sends `start_avatar`; `reply` resolves once `avatar_ready` arrives.
    pub(crate) fn start(&mut self, transport: &Transport, avatar_id: &str, avatar_token: Option<&str>, reply: AvatarReply) {
        match &self.state {
            AvatarState::Starting { avatar_id: current } if current == avatar_id => {
                self.waiters.push(reply);
                return;
            }
            AvatarState::Active { avatar_id: current, .. } if current == avatar_id => {
                let _ = reply.send(Ok(self.state.clone()));
                return;
            }
            AvatarState::Idle => {}
            _ => {
                tracing::info!("switching avatar to {}", avatar_id);
                self.end(transport);
            }
        }
        if avatar_id.trim().is_empty() {
            let _ = reply.send(Err(ClientError::InvalidInput("avatar id is empty".to_string())));
            return;
        }

        let frame = ClientFrame::StartAvatar(StartAvatarEvent::new(avatar_id).with_avatar_token(avatar_token));
        if let Err(e) = transport.send(frame) {
            let _ = reply.send(Err(e));
            return;
        }
        self.waiters.push(reply);
        self.deadline = Some(Instant::now() + self.request_timeout);
        self.set_state(AvatarState::Starting {
            avatar_id: avatar_id.to_string(),
        });
    }

    pub fn on_ready(&mut self, event: &AvatarReadyEvent, turn: TurnState) {
        let AvatarState::Starting { avatar_id } = &self.state else {
            tracing::warn!("ignoring avatar_ready while {:?}", self.state);
            return;
        };
        if event.avatar_id().is_some_and(|id| id != avatar_id) {
            tracing::warn!("ignoring avatar_ready for {:?}, waiting for {}", event.avatar_id(), avatar_id);
            return;
        }
        let active = AvatarState::Active {
            avatar_id: avatar_id.clone(),
            session_id: event.session_id().map(str::to_string),
            speaking: turn == TurnState::AgentTurn,
        };
        self.deadline = None;
        self.set_state(active.clone());
        self.resolve(Ok(active));
    }

    /// Sends `stop_avatar` if a session exists and resets locally without waiting for an answer.
    pub fn end(&mut self, transport: &Transport) {
        let Some(avatar_id) = self.state.avatar_id().map(str::to_string) else {
            return;
        };
        if let Err(e) = transport.send(ClientFrame::StopAvatar(StopAvatarEvent::new(Some(&avatar_id)))) {
            tracing::debug!("stop_avatar not sent: {}", e);
        }
        self.deadline = None;
        self.set_state(AvatarState::Idle);
        self.resolve(Err(ClientError::Closed));
    }

    pub fn on_disconnected(&mut self, event: &AvatarDisconnectedEvent) {
        tracing::info!("avatar disconnected: {}", event.reason().unwrap_or("no reason given"));
        self.deadline = None;
        self.set_state(AvatarState::Idle);
        self.resolve(Err(ClientError::Server {
            code: Some("avatar_disconnected".to_string()),
            message: event.reason().unwrap_or("avatar disconnected").to_string(),
        }));
    }

    pub fn on_transport_lost(&mut self) {
        self.deadline = None;
        self.set_state(AvatarState::Idle);
        self.resolve(Err(ClientError::Network("connection lost".to_string())));
    }

    pub(crate) fn fail_waiters(&mut self, error: ClientError) {
        self.resolve(Err(error));
    }

    pub fn on_turn(&mut self, turn: TurnState) {
        if let AvatarState::Active { avatar_id, session_id, speaking } = &self.state {
            let now_speaking = turn == TurnState::AgentTurn;
            if *speaking != now_speaking {
                let next = AvatarState::Active {
                    avatar_id: avatar_id.clone(),
                    session_id: session_id.clone(),
                    speaking: now_speaking,
                };
                self.set_state(next);
            }
        }
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Abandons a start whose `avatar_ready` did not arrive in time.
    pub(crate) fn expire(&mut self, transport: &Transport, now: Instant) {
        if self.deadline.is_some_and(|d| d <= now) {
            tracing::warn!("timed out waiting for avatar_ready");
            if let Some(avatar_id) = self.state.avatar_id().map(str::to_string) {
                let _ = transport.send(ClientFrame::StopAvatar(StopAvatarEvent::new(Some(&avatar_id))));
            }
            self.deadline = None;
            self.set_state(AvatarState::Idle);
            self.resolve(Err(ClientError::Protocol("timed out waiting for avatar_ready".to_string())));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::stats::Stats;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    fn ready_transport() -> (Transport, mpsc::Receiver<ClientFrame>) {
        let transport = Transport::new(64, Arc::new(Mutex::new(Stats::new())));
        let (tx, rx) = mpsc::channel(64);
        transport.attach(tx);
        (transport, rx)
    }

    fn ready_event(avatar_id: &str) -> AvatarReadyEvent {
        serde_json::from_value(json!({"avatar_id": avatar_id, "session_id": "av-1"})).unwrap()
    }

    #[tokio::test]
    async fn start_resolves_on_ready_and_joins_duplicates() {
        let (transport, mut frames) = ready_transport();
        let mut avatar = AvatarCoordinator::new(Duration::from_secs(5));

        let (first_tx, first_rx) = oneshot::channel();
        let (second_tx, second_rx) = oneshot::channel();
        avatar.start(&transport, "anna", Some("avatar-token"), first_tx);
        avatar.start(&transport, "anna", Some("avatar-token"), second_tx);

        match frames.try_recv().unwrap() {
            ClientFrame::StartAvatar(event) => {
                assert_eq!(event.avatar_id(), "anna");
                assert_eq!(event.avatar_token(), Some("avatar-token"));
            }
            other => panic!("unexpected frame: {:?}", other),
        }
        assert!(frames.try_recv().is_err());

        avatar.on_ready(&ready_event("anna"), TurnState::AgentTurn);
        let expected = AvatarState::Active {
            avatar_id: "anna".into(),
            session_id: Some("av-1".into()),
            speaking: true,
        };
        assert_eq!(first_rx.await.unwrap(), Ok(expected.clone()));
        assert_eq!(second_rx.await.unwrap(), Ok(expected));
    }

    #[tokio::test]
    async fn end_resets_without_acknowledgement() {
        let (transport, mut frames) = ready_transport();
        let mut avatar = AvatarCoordinator::new(Duration::from_secs(5));
        let (tx, _rx) = oneshot::channel();
        avatar.start(&transport, "anna", None, tx);
        avatar.on_ready(&ready_event("anna"), TurnState::Idle);

        avatar.end(&transport);
        assert_eq!(avatar.state(), &AvatarState::Idle);
        let kinds: Vec<_> = std::iter::from_fn(|| frames.try_recv().ok()).map(|f| f.kind()).collect();
        assert_eq!(kinds, vec!["start_avatar", "stop_avatar"]);

        avatar.end(&transport);
        assert!(frames.try_recv().is_err());
    }

    #[tokio::test]
    async fn switching_avatars_stops_the_previous_one() {
        let (transport, mut frames) = ready_transport();
        let mut avatar = AvatarCoordinator::new(Duration::from_secs(5));
        let (first_tx, first_rx) = oneshot::channel();
        let (second_tx, _second_rx) = oneshot::channel();
        avatar.start(&transport, "anna", None, first_tx);
        avatar.start(&transport, "ben", None, second_tx);

        assert_eq!(first_rx.await.unwrap(), Err(ClientError::Closed));
        let kinds: Vec<_> = std::iter::from_fn(|| frames.try_recv().ok()).map(|f| f.kind()).collect();
        assert_eq!(kinds, vec!["start_avatar", "stop_avatar", "start_avatar"]);
        assert_eq!(avatar.state().avatar_id(), Some("ben"));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_ready_times_out_to_idle() {
        let (transport, _frames) = ready_transport();
        let mut avatar = AvatarCoordinator::new(Duration::from_secs(5));
        let (tx, rx) = oneshot::channel();
        avatar.start(&transport, "anna", None, tx);

        tokio::time::sleep_until(avatar.deadline().unwrap()).await;
        avatar.expire(&transport, Instant::now());
        assert!(matches!(rx.await.unwrap(), Err(ClientError::Protocol(_))));
        assert_eq!(avatar.state(), &AvatarState::Idle);
        assert!(avatar.deadline().is_none());
    }

    #[tokio::test]
    async fn speaking_follows_agent_turn_and_disconnect_resets() {
        let (transport, _frames) = ready_transport();
        let mut avatar = AvatarCoordinator::new(Duration::from_secs(5));
        let rx = avatar.subscribe();
        let (tx, _reply) = oneshot::channel();
        avatar.start(&transport, "anna", None, tx);
        avatar.on_ready(&ready_event("anna"), TurnState::Idle);

        avatar.on_turn(TurnState::AgentTurn);
        assert!(matches!(&*rx.borrow(), AvatarState::Active { speaking: true, .. }));
        avatar.on_turn(TurnState::UserTurn);
        assert!(matches!(&*rx.borrow(), AvatarState::Active { speaking: false, .. }));

        avatar.on_disconnected(&serde_json::from_value(json!({"reason": "idle timeout"})).unwrap());
        assert_eq!(*rx.borrow(), AvatarState::Idle);
    }
}
