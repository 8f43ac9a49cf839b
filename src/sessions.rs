use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::time::Instant;

use crate::error::ClientError;
use crate::transport::Transport;
use crate::types::events::{
    ClearSessionEvent, NewSessionEvent, RenameSessionEvent, ResumeSessionEvent, SendTextEvent, SessionListEvent,
    SessionStartedEvent, TextCompleteEvent, TextDeltaEvent, ToolNotificationEvent,
};
use crate::types::{ChatMessage, ChatSession, ClientFrame};

pub(crate) type SessionReply = oneshot::Sender<Result<ChatSession, ClientError>>;

/// Published view of the registry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    /// In the order the server listed them.
    pub sessions: Vec<ChatSession>,
    pub current_session_id: Option<String>,
    /// Partial assistant text of the current stream, if one is open.
    pub streaming_text: Option<String>,
}

impl SessionSnapshot {
    pub fn session(&self, session_id: &str) -> Option<&ChatSession> {
        self.sessions.iter().find(|s| s.session_id() == session_id)
    }

    pub fn current(&self) -> Option<&ChatSession> {
        self.current_session_id.as_deref().and_then(|id| self.session(id))
    }
}

struct StreamingBuffer {
    session_id: String,
    text: String,
}

enum RequestKind {
    New,
    Resume(String),
}

struct PendingRequest {
    request_id: String,
    kind: RequestKind,
    reply: SessionReply,
    deadline: Instant,
}

/// In-memory index of conversation sessions, fed by inbound frames and local sends.
pub struct SessionRegistry {
    sessions: Vec<ChatSession>,
    current: Option<String>,
    streaming: Option<StreamingBuffer>,
    pending: VecDeque<PendingRequest>,
    request_timeout: Duration,
    publisher: watch::Sender<SessionSnapshot>,
}

impl SessionRegistry {
    pub fn new(request_timeout: Duration) -> Self {
        let (publisher, _) = watch::channel(SessionSnapshot::default());
        Self {
            sessions: Vec::new(),
            current: None,
            streaming: None,
            pending: VecDeque::new(),
            request_timeout,
            publisher,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.publisher.subscribe()
    }

    pub fn current_session_id(&self) -> Option<&str> {
        self.current.as_deref()
    }

    fn session_mut(&mut self, session_id: &str) -> Option<&mut ChatSession> {
        self.sessions.iter_mut().find(|s| s.session_id() == session_id)
    }

    fn publish(&self) {
        self.publisher.send_replace(SessionSnapshot {
            sessions: self.sessions.clone(),
            current_session_id: self.current.clone(),
            streaming_text: self.streaming.as_ref().map(|b| b.text.clone()),
        });
    }

    /// Appends a user message to the current session and transmits it.
    pub fn send_message(&mut self, transport: &Transport, text: &str) -> Result<(), ClientError> {
        let state = transport.state();
        if !state.is_ready() {
            return Err(ClientError::NotReady(state));
        }
        let session_id = self.current.clone().ok_or(ClientError::NoActiveSession)?;
        if text.trim().is_empty() {
            return Err(ClientError::InvalidInput("message text is empty".to_string()));
        }

        transport.send(ClientFrame::SendText(SendTextEvent::new(text).with_session_id(&session_id)))?;
        if let Some(session) = self.session_mut(&session_id) {
            session.push_message(ChatMessage::user(text));
        }
        self.publish();
        Ok(())
    }

    /// Asks the server for a fresh session; `reply` resolves on the matching `session_started`.
    pub(crate) fn request_new_session(&mut self, transport: &Transport, agent_key: Option<&str>, reply: SessionReply) {
        let request_id = uuid::Uuid::new_v4().to_string();
        let frame = ClientFrame::NewSession(NewSessionEvent::new(&request_id).with_agent_key(agent_key));
        self.request(transport, frame, request_id, RequestKind::New, reply);
    }

    /// Asks the server to replay an existing session's history.
    pub(crate) fn request_resume(&mut self, transport: &Transport, session_id: &str, reply: SessionReply) {
        if session_id.trim().is_empty() {
            let _ = reply.send(Err(ClientError::InvalidInput("session id is empty".to_string())));
            return;
        }
        let request_id = uuid::Uuid::new_v4().to_string();
        let frame = ClientFrame::ResumeSession(ResumeSessionEvent::new(&request_id, session_id));
        self.request(transport, frame, request_id, RequestKind::Resume(session_id.to_string()), reply);
    }

    fn request(&mut self, transport: &Transport, frame: ClientFrame, request_id: String, kind: RequestKind, reply: SessionReply) {
        if let Err(e) = transport.send(frame) {
            let _ = reply.send(Err(e));
            return;
        }
        tracing::debug!("session request {} pending", request_id);
        self.pending.push_back(PendingRequest {
            request_id,
            kind,
            reply,
            deadline: Instant::now() + self.request_timeout,
        });
    }

    pub fn rename_current(&mut self, transport: &Transport, name: &str) -> Result<(), ClientError> {
        let session_id = self.current.clone().ok_or(ClientError::NoActiveSession)?;
        if name.trim().is_empty() {
            return Err(ClientError::InvalidInput("session name is empty".to_string()));
        }
        transport.send(ClientFrame::RenameSession(RenameSessionEvent::new(&session_id, name)))?;
        if let Some(session) = self.session_mut(&session_id) {
            session.set_name(Some(name.to_string()));
        }
        self.publish();
        Ok(())
    }

    pub fn clear_current(&mut self, transport: &Transport) -> Result<(), ClientError> {
        let session_id = self.current.clone().ok_or(ClientError::NoActiveSession)?;
        transport.send(ClientFrame::ClearSession(ClearSessionEvent::new(&session_id)))?;
        if let Some(session) = self.session_mut(&session_id) {
            session.clear_messages();
        }
        if self.streaming.as_ref().is_some_and(|b| b.session_id == session_id) {
            self.streaming = None;
        }
        self.publish();
        Ok(())
    }

    pub fn on_text_delta(&mut self, event: &TextDeltaEvent) {
        let Some(session_id) = event.session_id().map(str::to_string).or_else(|| self.current.clone()) else {
            tracing::warn!("dropping text_delta with no session");
            return;
        };
        match &mut self.streaming {
            Some(buffer) if buffer.session_id == session_id => buffer.text.push_str(event.delta()),
            other => {
                if let Some(stale) = other.as_ref() {
                    tracing::warn!("discarding unfinished stream for {}", stale.session_id);
                }
                *other = Some(StreamingBuffer {
                    session_id,
                    text: event.delta().to_string(),
                });
            }
        }
        self.publish();
    }

    /// Materializes the streaming buffer (or the frame's final text) as an assistant message.
    /// A buffer that belongs to another session is discarded, never attributed to this one.
    pub fn on_text_complete(&mut self, event: &TextCompleteEvent) {
        let buffer = self.streaming.take();
        let session_id = event
            .session_id()
            .map(str::to_string)
            .or_else(|| buffer.as_ref().map(|b| b.session_id.clone()))
            .or_else(|| self.current.clone());
        let buffer = match (buffer, session_id.as_deref()) {
            (Some(buffer), Some(target)) if buffer.session_id != target => {
                tracing::warn!("discarding stale stream for {} on text_complete for {}", buffer.session_id, target);
                None
            }
            (buffer, _) => buffer,
        };
        let text = match buffer {
            Some(buffer) if !buffer.text.is_empty() => buffer.text,
            _ => event.text().unwrap_or_default().to_string(),
        };

        match session_id {
            Some(session_id) if !text.is_empty() => match self.session_mut(&session_id) {
                Some(session) => session.push_message(ChatMessage::assistant(&text)),
                None => tracing::warn!("text_complete for unknown session {}", session_id),
            },
            _ => tracing::debug!("empty text_complete, nothing to record"),
        }
        self.publish();
    }

    /// Replaces the listing, keeping cached messages for sessions that remain listed.
    pub fn on_session_list(&mut self, event: &SessionListEvent) {
        let mut previous = std::mem::take(&mut self.sessions);
        for summary in event.sessions() {
            let session = match previous.iter().position(|s| s.session_id() == summary.session_id()) {
                Some(index) => {
                    let mut session = previous.swap_remove(index);
                    session.merge_summary(summary);
                    session
                }
                None => ChatSession::from_summary(summary),
            };
            self.sessions.push(session);
        }

        if let Some(current) = event.current_session_id() {
            self.current = Some(current.to_string());
        }
        if let Some(current) = self.current.clone() {
            if self.session_mut(&current).is_none() {
                match previous.into_iter().find(|s| s.session_id() == current) {
                    Some(session) => self.sessions.push(session),
                    None => self.sessions.push(ChatSession::new(&current)),
                }
            }
        }
        tracing::debug!("session list: {} sessions, current {:?}", self.sessions.len(), self.current);
        self.publish();
    }

    /// Installs the started session as current and answers the request it belongs to.
    pub fn on_session_started(&mut self, event: &SessionStartedEvent) {
        self.pending.retain(|p| !p.reply.is_closed());

        let session_id = event.session_id().to_string();
        let mut session = match self.sessions.iter().position(|s| s.session_id() == session_id) {
            Some(index) => self.sessions.remove(index),
            None => ChatSession::new(&session_id),
        };
        session.replace_messages(event.messages().to_vec());
        if let Some(name) = event.name() {
            session.set_name(Some(name.to_string()));
        }
        self.sessions.push(session.clone());

        if self.streaming.as_ref().is_some_and(|b| b.session_id != session_id) {
            tracing::debug!("discarding stream of previous session");
            self.streaming = None;
        }
        self.current = Some(session_id.clone());
        self.publish();

        let index = event
            .request_id()
            .and_then(|id| self.pending.iter().position(|p| p.request_id == id))
            .or_else(|| {
                self.pending
                    .iter()
                    .position(|p| matches!(&p.kind, RequestKind::Resume(id) if *id == session_id))
            })
            .or_else(|| self.pending.iter().position(|p| matches!(p.kind, RequestKind::New)));
        match index.and_then(|i| self.pending.remove(i)) {
            Some(pending) => {
                tracing::debug!("session request {} answered with {}", pending.request_id, session_id);
                let _ = pending.reply.send(Ok(session));
            }
            None => tracing::info!("server started session {}", session_id),
        }
    }

    pub fn on_tool_notification(&mut self, event: &ToolNotificationEvent) {
        let Some(session_id) = self.current.clone() else {
            tracing::warn!("dropping tool_notification for {} with no current session", event.tool());
            return;
        };
        let content = event.message().unwrap_or(event.tool());
        let message = ChatMessage::system(content).with_metadata(serde_json::json!({ "tool": event.tool() }));
        if let Some(session) = self.session_mut(&session_id) {
            session.push_message(message);
        }
        self.publish();
    }

    /// Drops the partial stream, never materializing it, and fails outstanding requests.
    pub fn on_disconnect(&mut self) {
        if let Some(buffer) = self.streaming.take() {
            tracing::debug!("discarding {} bytes of partial text for {}", buffer.text.len(), buffer.session_id);
        }
        self.fail_pending(ClientError::Network("connection lost".to_string()));
        self.publish();
    }

    pub(crate) fn fail_pending(&mut self, error: ClientError) {
        for pending in self.pending.drain(..) {
            let _ = pending.reply.send(Err(error.clone()));
        }
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.pending.iter().map(|p| p.deadline).min()
    }

    /// Fails requests whose deadline has passed.
    pub(crate) fn expire(&mut self, now: Instant) {
        let (expired, waiting): (VecDeque<_>, VecDeque<_>) = self.pending.drain(..).partition(|p| p.deadline <= now);
        self.pending = waiting;
        for pending in expired {
            tracing::warn!("session request {} timed out", pending.request_id);
            let _ = pending
                .reply
                .send(Err(ClientError::Protocol("timed out waiting for session_started".to_string())));
        }
    }
}
