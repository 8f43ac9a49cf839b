use std::fmt;

use crate::audio::Base64EncodedAudioBytes;

/// `login` event, the first frame of every handshake
#[derive(Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LoginEvent {
    access_token: String,
}

impl LoginEvent {
    pub fn new(access_token: &str) -> Self {
        Self {
            access_token: access_token.to_string(),
        }
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }
}

impl fmt::Debug for LoginEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginEvent").field("access_token", &"[REDACTED]").finish()
    }
}

/// `refresh` event, rebinds a live connection to a rotated access token
#[derive(Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RefreshEvent {
    access_token: String,
}

impl RefreshEvent {
    pub fn new(access_token: &str) -> Self {
        Self {
            access_token: access_token.to_string(),
        }
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }
}

impl fmt::Debug for RefreshEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshEvent").field("access_token", &"[REDACTED]").finish()
    }
}

/// `send_text` event
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SendTextEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,

    text: String,
}

impl SendTextEvent {
    pub fn new(text: &str) -> Self {
        Self {
            session_id: None,
            text: text.to_string(),
        }
    }

    pub fn with_session_id(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

/// `request_user_turn` event. The server answers with `turn_start` or not at all.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RequestUserTurnEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
}

impl RequestUserTurnEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session_id(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }
}

/// `start_audio_stream` / `stop_audio_stream` events
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AudioStreamEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
}

impl AudioStreamEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session_id(mut self, session_id: Option<&str>) -> Self {
        self.session_id = session_id.map(str::to_string);
        self
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }
}

/// `audio_chunk` event
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AudioChunkEvent {
    sequence: u64,
    timestamp_ms: u64,

    /// Base64 encoded little-endian PCM16, mono
    audio: Base64EncodedAudioBytes,
}

impl AudioChunkEvent {
    pub fn new(sequence: u64, timestamp_ms: u64, audio: Base64EncodedAudioBytes) -> Self {
        Self {
            sequence,
            timestamp_ms,
            audio,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    pub fn audio(&self) -> &Base64EncodedAudioBytes {
        &self.audio
    }
}

/// `new_session` event
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct NewSessionEvent {
    /// Client generated id used to correlate the `session_started` answer
    request_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    agent_key: Option<String>,
}

impl NewSessionEvent {
    pub fn new(request_id: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            agent_key: None,
        }
    }

    pub fn with_agent_key(mut self, agent_key: Option<&str>) -> Self {
        self.agent_key = agent_key.map(str::to_string);
        self
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn agent_key(&self) -> Option<&str> {
        self.agent_key.as_deref()
    }
}

/// `resume_session` event, asks the server to replay a session's history
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ResumeSessionEvent {
    request_id: String,
    session_id: String,
}

impl ResumeSessionEvent {
    pub fn new(request_id: &str, session_id: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            session_id: session_id.to_string(),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

/// `rename_session` event
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RenameSessionEvent {
    session_id: String,
    name: String,
}

impl RenameSessionEvent {
    pub fn new(session_id: &str, name: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            name: name.to_string(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// `clear_session` event
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ClearSessionEvent {
    session_id: String,
}

impl ClearSessionEvent {
    pub fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

/// `start_avatar` event
#[derive(Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StartAvatarEvent {
    avatar_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    avatar_token: Option<String>,
}

impl StartAvatarEvent {
    pub fn new(avatar_id: &str) -> Self {
        Self {
            avatar_id: avatar_id.to_string(),
            avatar_token: None,
        }
    }

    pub fn with_avatar_token(mut self, avatar_token: Option<&str>) -> Self {
        self.avatar_token = avatar_token.map(str::to_string);
        self
    }

    pub fn avatar_id(&self) -> &str {
        &self.avatar_id
    }

    pub fn avatar_token(&self) -> Option<&str> {
        self.avatar_token.as_deref()
    }
}

impl fmt::Debug for StartAvatarEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartAvatarEvent")
            .field("avatar_id", &self.avatar_id)
            .field("avatar_token", &self.avatar_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// `stop_avatar` event
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StopAvatarEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    avatar_id: Option<String>,
}

impl StopAvatarEvent {
    pub fn new(avatar_id: Option<&str>) -> Self {
        Self {
            avatar_id: avatar_id.map(str::to_string),
        }
    }

    pub fn avatar_id(&self) -> Option<&str> {
        self.avatar_id.as_deref()
    }
}
