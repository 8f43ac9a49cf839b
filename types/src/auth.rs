use std::fmt;

/// Credential bundle issued by the authentication authority.
#[derive(Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CredentialPayload {
    pub access_token: String,
    pub refresh_token: String,
    /// Access token expiry as Unix seconds.
    #[serde(alias = "expires_at")]
    pub expiry: i64,
    pub websocket_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_token: Option<String>,
}

impl fmt::Debug for CredentialPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialPayload")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expiry", &self.expiry)
            .field("websocket_url", &self.websocket_url)
            .field("avatar_token", &self.avatar_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}
