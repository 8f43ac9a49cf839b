use chrono::{DateTime, Utc};

use crate::message::ChatMessage;

/// A session as disclosed by the server in a `session_list` frame.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SessionSummary {
    session_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    updated_at: Option<DateTime<Utc>>,
}

impl SessionSummary {
    pub fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            name: None,
            updated_at: None,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }
}

/// A conversation and its cached messages.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ChatSession {
    session_id: String,
    name: Option<String>,
    messages: Vec<ChatMessage>,
    updated_at: DateTime<Utc>,
}

impl ChatSession {
    pub fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            name: None,
            messages: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn from_summary(summary: &SessionSummary) -> Self {
        Self {
            session_id: summary.session_id.clone(),
            name: summary.name.clone(),
            messages: Vec::new(),
            updated_at: summary.updated_at.unwrap_or_else(Utc::now),
        }
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

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn push_message(&mut self, message: ChatMessage) {
        self.updated_at = message.timestamp().max(self.updated_at);
        self.messages.push(message);
    }

    pub fn replace_messages(&mut self, messages: Vec<ChatMessage>) {
        self.messages = messages;
        self.updated_at = Utc::now();
    }

    pub fn set_name(&mut self, name: Option<String>) {
        self.name = name;
        self.updated_at = Utc::now();
    }

    pub fn clear_messages(&mut self) {
        self.messages.clear();
        self.updated_at = Utc::now();
    }

    /// Applies the server's listing metadata without touching cached messages.
    pub fn merge_summary(&mut self, summary: &SessionSummary) {
        if summary.name.is_some() {
            self.name = summary.name.clone();
        }
        if let Some(updated_at) = summary.updated_at {
            self.updated_at = updated_at;
        }
    }
}
