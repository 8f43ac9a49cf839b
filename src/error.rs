use agent_realtime_types::ConnectionState;

/// Coarse classification of a [`ClientError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Auth,
    AuthRejected,
    Network,
    Protocol,
    Server,
    PermissionDenied,
    DeviceNotFound,
    DeviceBusy,
    NotReady,
    NoActiveSession,
    InvalidInput,
    ReconnectExhausted,
    Closed,
}

/// What a consumer should do about an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Recovery {
    /// Show a banner and wait; the client recovers by itself.
    Wait,
    /// Ask the user to act (grant permission, plug a device, press retry).
    UserAction,
    /// Credentials are unusable; re-authenticate out-of-band.
    Relogin,
    /// The caller issued a command at the wrong time.
    FixCaller,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClientError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("server rejected credentials: {0}")]
    AuthRejected(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("server error{}: {message}", .code.as_deref().map(|c| format!(" ({c})")).unwrap_or_default())]
    Server { code: Option<String>, message: String },
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),
    #[error("capture device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture device busy: {0}")]
    DeviceBusy(String),
    #[error("connection is not ready (state: {0})")]
    NotReady(ConnectionState),
    #[error("no active session")]
    NoActiveSession,
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("gave up reconnecting after {attempts} attempts: {last}")]
    ReconnectExhausted { attempts: u32, last: String },
    #[error("client is closed")]
    Closed,
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Auth(_) => ErrorKind::Auth,
            ClientError::AuthRejected(_) => ErrorKind::AuthRejected,
            ClientError::Network(_) => ErrorKind::Network,
            ClientError::Protocol(_) => ErrorKind::Protocol,
            ClientError::Server { .. } => ErrorKind::Server,
            ClientError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            ClientError::DeviceNotFound(_) => ErrorKind::DeviceNotFound,
            ClientError::DeviceBusy(_) => ErrorKind::DeviceBusy,
            ClientError::NotReady(_) => ErrorKind::NotReady,
            ClientError::NoActiveSession => ErrorKind::NoActiveSession,
            ClientError::InvalidInput(_) => ErrorKind::InvalidInput,
            ClientError::ReconnectExhausted { .. } => ErrorKind::ReconnectExhausted,
            ClientError::Closed => ErrorKind::Closed,
        }
    }

    pub fn recovery(&self) -> Recovery {
        match self.kind() {
            ErrorKind::Auth | ErrorKind::AuthRejected => Recovery::Relogin,
            ErrorKind::Network | ErrorKind::Protocol | ErrorKind::Server => Recovery::Wait,
            ErrorKind::PermissionDenied
            | ErrorKind::DeviceNotFound
            | ErrorKind::DeviceBusy
            | ErrorKind::ReconnectExhausted => Recovery::UserAction,
            ErrorKind::NotReady | ErrorKind::NoActiveSession | ErrorKind::InvalidInput | ErrorKind::Closed => {
                Recovery::FixCaller
            }
        }
    }

    /// Errors the reconnection policy may retry.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Network | ErrorKind::Protocol)
    }

    pub fn is_auth(&self) -> bool {
        matches!(self.kind(), ErrorKind::Auth | ErrorKind::AuthRejected)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match e {
            WsError::Http(response) if matches!(response.status().as_u16(), 401 | 403) => {
                ClientError::AuthRejected(format!("handshake rejected with {}", response.status()))
            }
            WsError::Protocol(e) => ClientError::Protocol(e.to_string()),
            other => ClientError::Network(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ClientError::Protocol(e.to_string())
        } else {
            ClientError::Network(e.to_string())
        }
    }
}
