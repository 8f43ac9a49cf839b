pub mod client;
pub mod server;

pub use client::*;
pub use server::*;

/// Frames the client writes to the socket.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    #[serde(rename = "login")]
    Login(LoginEvent),
    #[serde(rename = "refresh")]
    Refresh(RefreshEvent),
    #[serde(rename = "send_text")]
    SendText(SendTextEvent),
    #[serde(rename = "request_user_turn")]
    RequestUserTurn(RequestUserTurnEvent),
    #[serde(rename = "start_audio_stream")]
    StartAudioStream(AudioStreamEvent),
    #[serde(rename = "stop_audio_stream")]
    StopAudioStream(AudioStreamEvent),
    #[serde(rename = "audio_chunk")]
    AudioChunk(AudioChunkEvent),
    #[serde(rename = "new_session")]
    NewSession(NewSessionEvent),
    #[serde(rename = "resume_session")]
    ResumeSession(ResumeSessionEvent),
    #[serde(rename = "rename_session")]
    RenameSession(RenameSessionEvent),
    #[serde(rename = "clear_session")]
    ClearSession(ClearSessionEvent),
    #[serde(rename = "start_avatar")]
    StartAvatar(StartAvatarEvent),
    #[serde(rename = "stop_avatar")]
    StopAvatar(StopAvatarEvent),
}

impl ClientFrame {
    /// The wire discriminant, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientFrame::Login(_) => "login",
            ClientFrame::Refresh(_) => "refresh",
            ClientFrame::SendText(_) => "send_text",
            ClientFrame::RequestUserTurn(_) => "request_user_turn",
            ClientFrame::StartAudioStream(_) => "start_audio_stream",
            ClientFrame::StopAudioStream(_) => "stop_audio_stream",
            ClientFrame::AudioChunk(_) => "audio_chunk",
            ClientFrame::NewSession(_) => "new_session",
            ClientFrame::ResumeSession(_) => "resume_session",
            ClientFrame::RenameSession(_) => "rename_session",
            ClientFrame::ClearSession(_) => "clear_session",
            ClientFrame::StartAvatar(_) => "start_avatar",
            ClientFrame::StopAvatar(_) => "stop_avatar",
        }
    }
}

/// Frames the server pushes to the client.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "authenticated")]
    Authenticated(AuthenticatedEvent),
    #[serde(rename = "turn_start")]
    TurnStart(TurnEvent),
    #[serde(rename = "turn_end")]
    TurnEnd(TurnEvent),
    #[serde(rename = "text_delta")]
    TextDelta(TextDeltaEvent),
    #[serde(rename = "text_complete")]
    TextComplete(TextCompleteEvent),
    #[serde(rename = "session_list")]
    SessionList(SessionListEvent),
    #[serde(rename = "session_started")]
    SessionStarted(SessionStartedEvent),
    #[serde(rename = "tool_notification")]
    ToolNotification(ToolNotificationEvent),
    #[serde(rename = "audio_delta")]
    AudioDelta(AudioDeltaEvent),
    #[serde(rename = "avatar_ready")]
    AvatarReady(AvatarReadyEvent),
    #[serde(rename = "avatar_disconnected")]
    AvatarDisconnected(AvatarDisconnectedEvent),
    #[serde(rename = "error")]
    Error(ErrorEvent),
    /// Any discriminant this client does not know.
    #[serde(other)]
    Unknown,
}

impl ServerFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerFrame::Authenticated(_) => "authenticated",
            ServerFrame::TurnStart(_) => "turn_start",
            ServerFrame::TurnEnd(_) => "turn_end",
            ServerFrame::TextDelta(_) => "text_delta",
            ServerFrame::TextComplete(_) => "text_complete",
            ServerFrame::SessionList(_) => "session_list",
            ServerFrame::SessionStarted(_) => "session_started",
            ServerFrame::ToolNotification(_) => "tool_notification",
            ServerFrame::AudioDelta(_) => "audio_delta",
            ServerFrame::AvatarReady(_) => "avatar_ready",
            ServerFrame::AvatarDisconnected(_) => "avatar_disconnected",
            ServerFrame::Error(_) => "error",
            ServerFrame::Unknown => "unknown",
        }
    }
}
