use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Lifecycle of the duplex connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Authenticating,
    Initializing,
    Ready,
    Reconnecting,
    Error,
}

impl ConnectionState {
    /// True while a connect attempt is running its handshake.
    pub fn is_handshaking(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Authenticating | ConnectionState::Initializing
        )
    }

    pub fn is_ready(&self) -> bool {
        *self == ConnectionState::Ready
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Initializing => "initializing",
            ConnectionState::Ready => "ready",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
        };
        f.write_str(name)
    }
}

/// The party named in `turn_start` / `turn_end` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnHolder {
    User,
    Agent,
}

/// Who currently holds the floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    #[default]
    Idle,
    UserTurn,
    AgentTurn,
}

impl TurnState {
    pub fn holder(&self) -> Option<TurnHolder> {
        match self {
            TurnState::Idle => None,
            TurnState::UserTurn => Some(TurnHolder::User),
            TurnState::AgentTurn => Some(TurnHolder::Agent),
        }
    }

    pub fn is_user_turn(&self) -> bool {
        *self == TurnState::UserTurn
    }
}

impl From<TurnHolder> for TurnState {
    fn from(holder: TurnHolder) -> Self {
        match holder {
            TurnHolder::User => TurnState::UserTurn,
            TurnHolder::Agent => TurnState::AgentTurn,
        }
    }
}

/// One recorded change of [`TurnState`].
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TurnTransition {
    from: TurnState,
    to: TurnState,
    /// Wall-clock time the transition was applied.
    at: DateTime<Utc>,
    /// How long `from` had been held.
    held_for: Duration,
}

impl TurnTransition {
    pub fn new(from: TurnState, to: TurnState, at: DateTime<Utc>, held_for: Duration) -> Self {
        Self { from, to, at, held_for }
    }

    pub fn from(&self) -> TurnState {
        self.from
    }

    pub fn to(&self) -> TurnState {
        self.to
    }

    pub fn at(&self) -> DateTime<Utc> {
        self.at
    }

    pub fn held_for(&self) -> Duration {
        self.held_for
    }
}

/// Progress of the reconnection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct ReconnectionState {
    /// Consecutive failed attempts since the last READY.
    pub attempt_count: u32,
    /// Delay before the scheduled retry, if one is scheduled.
    pub next_delay: Option<Duration>,
    pub max_attempts: u32,
}

impl ReconnectionState {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempt_count: 0,
            next_delay: None,
            max_attempts,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }
}
