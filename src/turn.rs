use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::ClientError;
use crate::transport::Transport;
use crate::types::events::RequestUserTurnEvent;
use crate::types::{ClientFrame, TurnHolder, TurnState, TurnTransition};

/// Receives every turn transition synchronously, before the new state is published.
pub trait TurnObserver: Send + Sync {
    fn on_turn_changed(&self, transition: &TurnTransition);
}

/// Published view of the floor.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnSnapshot {
    pub state: TurnState,
    /// Wall-clock time `state` was entered.
    pub since: DateTime<Utc>,
    /// Most recent transitions, oldest first.
    pub history: Vec<TurnTransition>,
}

/// Server-authoritative turn state. Only `turn_start` / `turn_end` frames and disconnects move it.
pub struct TurnCoordinator {
    state: TurnState,
    entered_at: Instant,
    entered_wall: DateTime<Utc>,
    history: VecDeque<TurnTransition>,
    limit: usize,
    observers: Vec<Arc<dyn TurnObserver>>,
    publisher: watch::Sender<TurnSnapshot>,
}

impl TurnCoordinator {
    pub fn new(history_limit: usize) -> Self {
        let now = Utc::now();
        let (publisher, _) = watch::channel(TurnSnapshot {
            state: TurnState::Idle,
            since: now,
            history: Vec::new(),
        });
        Self {
            state: TurnState::Idle,
            entered_at: Instant::now(),
            entered_wall: now,
            history: VecDeque::with_capacity(history_limit),
            limit: history_limit,
            observers: Vec::new(),
            publisher,
        }
    }

    pub fn add_observer(&mut self, observer: Arc<dyn TurnObserver>) {
        self.observers.push(observer);
    }

    pub fn subscribe(&self) -> watch::Receiver<TurnSnapshot> {
        self.publisher.subscribe()
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    /// How long the current state has been held.
    pub fn held_for(&self) -> Duration {
        self.entered_at.elapsed()
    }

    pub fn history(&self) -> impl Iterator<Item = &TurnTransition> {
        self.history.iter()
    }

    /// Applies `turn_start{holder}`. A start for the other party passes through IDLE.
    pub fn on_turn_start(&mut self, holder: TurnHolder) -> Vec<TurnTransition> {
        let target = TurnState::from(holder);
        let mut applied = Vec::with_capacity(2);
        if self.state == target {
            tracing::debug!("turn_start for {:?} while already held", holder);
            return applied;
        }
        if self.state != TurnState::Idle {
            tracing::info!("turn pre-empted: {:?} -> {:?}", self.state, target);
            applied.push(self.transition(TurnState::Idle));
        }
        applied.push(self.transition(target));
        applied
    }

    /// Applies `turn_end{holder}`. An end that does not match the current holder is ignored.
    pub fn on_turn_end(&mut self, holder: TurnHolder) -> Option<TurnTransition> {
        if self.state.holder() != Some(holder) {
            tracing::warn!("ignoring stale turn_end for {:?} while {:?}", holder, self.state);
            return None;
        }
        Some(self.transition(TurnState::Idle))
    }

    /// Returns to IDLE after a disconnect.
    pub fn reset(&mut self) -> Option<TurnTransition> {
        if self.state == TurnState::Idle {
            return None;
        }
        Some(self.transition(TurnState::Idle))
    }

    fn transition(&mut self, to: TurnState) -> TurnTransition {
        let now = Instant::now();
        let at = Utc::now();
        let transition = TurnTransition::new(self.state, to, at, now.duration_since(self.entered_at));
        tracing::info!(
            "turn: {:?} -> {:?} (held {:?})",
            transition.from(),
            transition.to(),
            transition.held_for()
        );

        self.state = to;
        self.entered_at = now;
        self.entered_wall = at;
        if self.limit > 0 {
            if self.history.len() == self.limit {
                self.history.pop_front();
            }
            self.history.push_back(transition.clone());
        }

        for observer in &self.observers {
            observer.on_turn_changed(&transition);
        }
        self.publisher.send_replace(TurnSnapshot {
            state: self.state,
            since: self.entered_wall,
            history: self.history.iter().cloned().collect(),
        });
        transition
    }
}

/// Asks the server for the floor. The turn only changes when the server confirms.
pub fn request_user_turn(transport: &Transport, session_id: Option<&str>) -> Result<(), ClientError> {
    let mut event = RequestUserTurnEvent::new();
    if let Some(session_id) = session_id {
        event = event.with_session_id(session_id);
    }
    transport.send(ClientFrame::RequestUserTurn(event))
}
