use crate::audio::Base64EncodedAudioBytes;
use crate::message::ChatMessage;
use crate::session::SessionSummary;
use crate::state::TurnHolder;

/// `authenticated` event, acknowledges `login`
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AuthenticatedEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user_id: Option<String>,
}

impl AuthenticatedEvent {
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }
}

/// `turn_start` / `turn_end` event
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TurnEvent {
    /// The party gaining or giving up the floor
    holder: TurnHolder,
}

impl TurnEvent {
    pub fn new(holder: TurnHolder) -> Self {
        Self { holder }
    }

    pub fn holder(&self) -> TurnHolder {
        self.holder
    }
}

/// `text_delta` event
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TextDeltaEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,

    /// The partial assistant text
    delta: String,
}

impl TextDeltaEvent {
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn delta(&self) -> &str {
        &self.delta
    }
}

/// `text_complete` event
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TextCompleteEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    message_id: Option<String>,

    /// The final text, when the server repeats it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

impl TextCompleteEvent {
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }
}

/// `session_list` event
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SessionListEvent {
    #[serde(default)]
    sessions: Vec<SessionSummary>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    current_session_id: Option<String>,
}

impl SessionListEvent {
    pub fn sessions(&self) -> &[SessionSummary] {
        &self.sessions
    }

    pub fn current_session_id(&self) -> Option<&str> {
        self.current_session_id.as_deref()
    }
}

/// `session_started` event, the answer to `new_session` and `resume_session`
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SessionStartedEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,

    session_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,

    /// Replayed history; empty for a fresh session
    #[serde(default)]
    messages: Vec<ChatMessage>,
}

impl SessionStartedEvent {
    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }
}

/// `tool_notification` event
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ToolNotificationEvent {
    tool: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl ToolNotificationEvent {
    pub fn tool(&self) -> &str {
        &self.tool
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

/// `audio_delta` event
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AudioDeltaEvent {
    /// Base64 encoded little-endian PCM16
    audio: Base64EncodedAudioBytes,
}

impl AudioDeltaEvent {
    pub fn audio(&self) -> &Base64EncodedAudioBytes {
        &self.audio
    }
}

/// `avatar_ready` event
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AvatarReadyEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    avatar_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
}

impl AvatarReadyEvent {
    pub fn avatar_id(&self) -> Option<&str> {
        self.avatar_id.as_deref()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }
}

/// `avatar_disconnected` event
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AvatarDisconnectedEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

impl AvatarDisconnectedEvent {
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }
}

/// Codes the server uses to reject credentials.
pub const AUTH_ERROR_CODES: [&str; 3] = ["auth_failed", "unauthorized", "token_expired"];

/// `error` event
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ErrorEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    code: Option<String>,

    message: String,
}

impl ErrorEvent {
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether the server rejected the presented credentials.
    pub fn is_auth_rejection(&self) -> bool {
        self.code()
            .map(|code| AUTH_ERROR_CODES.contains(&code))
            .unwrap_or(false)
    }
}
