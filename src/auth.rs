use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;
use secrecy::{ExposeSecret, SecretString};

use crate::client::utils::validate_websocket_url;
use crate::error::ClientError;
use crate::single_flight::SingleFlight;
use crate::types::CredentialPayload;

/// A validated credential bundle. Replaced wholesale, never edited in place.
pub struct Credentials {
    access_token: SecretString,
    refresh_token: SecretString,
    expires_at: DateTime<Utc>,
    websocket_url: String,
    avatar_token: Option<SecretString>,
}

impl Credentials {
    pub fn from_payload(payload: CredentialPayload) -> Result<Self, ClientError> {
        if payload.access_token.trim().is_empty() {
            return Err(ClientError::Auth("access token is empty".to_string()));
        }
        if payload.refresh_token.trim().is_empty() {
            return Err(ClientError::Auth("refresh token is empty".to_string()));
        }
        if !validate_websocket_url(&payload.websocket_url) {
            return Err(ClientError::Auth(format!("invalid websocket url: {:?}", payload.websocket_url)));
        }
        let expires_at = DateTime::from_timestamp(payload.expiry, 0)
            .ok_or_else(|| ClientError::Auth(format!("expiry out of range: {}", payload.expiry)))?;

        Ok(Self {
            access_token: SecretString::from(payload.access_token),
            refresh_token: SecretString::from(payload.refresh_token),
            expires_at,
            websocket_url: payload.websocket_url,
            avatar_token: payload.avatar_token.filter(|t| !t.is_empty()).map(SecretString::from),
        })
    }

    pub fn access_token(&self) -> &SecretString {
        &self.access_token
    }

    pub fn refresh_token(&self) -> &SecretString {
        &self.refresh_token
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn websocket_url(&self) -> &str {
        &self.websocket_url
    }

    pub fn avatar_token(&self) -> Option<&SecretString> {
        self.avatar_token.as_ref()
    }

    /// True when the access token expires within `buffer` from now.
    pub fn is_expiring_within(&self, buffer: Duration) -> bool {
        match chrono::Duration::from_std(buffer) {
            Ok(buffer) => match self.expires_at.checked_sub_signed(buffer) {
                Some(refresh_at) => refresh_at <= Utc::now(),
                None => true,
            },
            Err(_) => true,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("expires_at", &self.expires_at)
            .field("websocket_url", &self.websocket_url)
            .field("has_avatar_token", &self.avatar_token.is_some())
            .finish_non_exhaustive()
    }
}

/// Network side of the token lifecycle.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CredentialExchange: Send + Sync {
    /// Exchanges a refresh token for a new bundle.
    async fn refresh(&self, refresh_token: &str) -> Result<CredentialPayload, ClientError>;

    /// Development-only direct login.
    async fn login(&self, username: &str, password: &str) -> Result<CredentialPayload, ClientError>;
}

/// [`CredentialExchange`] against the authentication authority's HTTP API.
pub struct HttpCredentialExchange {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCredentialExchange {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<CredentialPayload, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        tracing::debug!("POST {}", url);
        let response = self.client.post(&url).json(&body).send().await?;
        let status = response.status();
        if matches!(status.as_u16(), 400 | 401 | 403) {
            let detail = response.text().await.unwrap_or_default();
            return Err(ClientError::Auth(format!("{} rejected with {}: {}", path, status, detail)));
        }
        if !status.is_success() {
            return Err(ClientError::Network(format!("{} failed with {}", path, status)));
        }
        Ok(response.json::<CredentialPayload>().await?)
    }
}

#[async_trait]
impl CredentialExchange for HttpCredentialExchange {
    async fn refresh(&self, refresh_token: &str) -> Result<CredentialPayload, ClientError> {
        self.post("/auth/refresh", serde_json::json!({ "refresh_token": refresh_token })).await
    }

    async fn login(&self, username: &str, password: &str) -> Result<CredentialPayload, ClientError> {
        self.post("/auth/login", serde_json::json!({ "username": username, "password": password })).await
    }
}

type RefreshResult = Result<Arc<Credentials>, ClientError>;

/// Holds the current credentials and refreshes them at most once at a time.
pub struct TokenStore {
    credentials: Arc<RwLock<Option<Arc<Credentials>>>>,
    exchange: Option<Arc<dyn CredentialExchange>>,
    refresh_flight: SingleFlight<RefreshResult>,
}

impl TokenStore {
    pub fn new(exchange: Option<Arc<dyn CredentialExchange>>) -> Self {
        Self {
            credentials: Arc::new(RwLock::new(None)),
            exchange,
            refresh_flight: SingleFlight::new(),
        }
    }

    /// Validates and stores a pre-issued bundle. Invalid bundles leave the current credentials untouched.
    pub fn initialize_from_payload(&self, payload: CredentialPayload) -> Result<(), ClientError> {
        let credentials = Credentials::from_payload(payload)?;
        tracing::info!("credentials stored, expires at {}", credentials.expires_at());
        store(&self.credentials, Arc::new(credentials));
        Ok(())
    }

    pub fn credentials(&self) -> Option<Arc<Credentials>> {
        match self.credentials.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Also true when nothing is stored yet.
    pub fn is_expiring_soon(&self, buffer: Duration) -> bool {
        self.credentials()
            .map(|c| c.is_expiring_within(buffer))
            .unwrap_or(true)
    }

    /// Exchanges the refresh token for a new bundle. Concurrent callers share one exchange.
    pub async fn refresh(&self) -> RefreshResult {
        let credentials = self.credentials.clone();
        let current = self.credentials();
        let exchange = self.exchange.clone();
        self.refresh_flight
            .run(move || async move {
                let current = current.ok_or_else(|| ClientError::Auth("no credentials to refresh".to_string()))?;
                let exchange = exchange.ok_or_else(|| ClientError::Auth("no credential exchange configured".to_string()))?;
                tracing::info!("refreshing access token");
                let payload = exchange.refresh(current.refresh_token().expose_secret()).await.map_err(|e| {
                    tracing::error!("token refresh failed: {}", e);
                    e
                })?;
                let fresh = Arc::new(Credentials::from_payload(payload)?);
                store(&credentials, fresh.clone());
                tracing::info!("access token refreshed, expires at {}", fresh.expires_at());
                Ok::<_, ClientError>(fresh)
            })
            .await
    }

    pub fn is_refreshing(&self) -> bool {
        self.refresh_flight.is_running()
    }

    /// Development-only: logs in with a username and password instead of a pre-issued bundle.
    pub async fn login_for_development(&self, username: &str, password: &str) -> Result<(), ClientError> {
        let exchange = self
            .exchange
            .as_ref()
            .ok_or_else(|| ClientError::Auth("no credential exchange configured".to_string()))?;
        tracing::warn!("using development login for {}", username);
        let payload = exchange.login(username, password).await?;
        self.initialize_from_payload(payload)
    }
}

fn store(slot: &RwLock<Option<Arc<Credentials>>>, credentials: Arc<Credentials>) {
    match slot.write() {
        Ok(mut guard) => *guard = Some(credentials),
        Err(poisoned) => *poisoned.into_inner() = Some(credentials),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) fn payload_expiring_in(secs: i64, suffix: &str) -> CredentialPayload {
        CredentialPayload {
            access_token: format!("access-{}", suffix),
            refresh_token: format!("refresh-{}", suffix),
            expiry: Utc::now().timestamp() + secs,
            websocket_url: "wss://agent.example/ws".to_string(),
            avatar_token: None,
        }
    }

    struct SlowExchange {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CredentialExchange for SlowExchange {
        async fn refresh(&self, _refresh_token: &str) -> Result<CredentialPayload, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(payload_expiring_in(3600, "fresh"))
        }

        async fn login(&self, _username: &str, _password: &str) -> Result<CredentialPayload, ClientError> {
            unreachable!()
        }
    }

    #[tokio::test]
    async fn concurrent_pollers_trigger_one_refresh() {
        let exchange = Arc::new(SlowExchange { calls: AtomicUsize::new(0) });
        let store = TokenStore::new(Some(exchange.clone()));
        store.initialize_from_payload(payload_expiring_in(5, "old")).unwrap();

        let buffer = Duration::from_secs(10);
        let poll = || async {
            if store.is_expiring_soon(buffer) {
                store.refresh().await.map(|c| c.access_token().expose_secret().to_string())
            } else {
                Err(ClientError::Auth("not expiring".into()))
            }
        };

        let (a, b, c) = tokio::join!(poll(), poll(), poll());
        assert_eq!(exchange.calls.load(Ordering::SeqCst), 1);
        for token in [a, b, c] {
            assert_eq!(token.unwrap(), "access-fresh");
        }
        assert!(!store.is_expiring_soon(buffer));
        assert!(!store.is_refreshing());
    }

    #[tokio::test]
    async fn rejected_refresh_keeps_old_credentials() {
        let mut exchange = MockCredentialExchange::new();
        exchange
            .expect_refresh()
            .withf(|token| token == "refresh-old")
            .times(1)
            .returning(|_| Err(ClientError::Auth("refresh token expired".into())));

        let store = TokenStore::new(Some(Arc::new(exchange)));
        store.initialize_from_payload(payload_expiring_in(5, "old")).unwrap();

        let err = store.refresh().await.unwrap_err();
        assert!(err.is_auth());
        let current = store.credentials().unwrap();
        assert_eq!(current.access_token().expose_secret(), "access-old");
    }

    #[tokio::test]
    async fn development_login_stores_bundle() {
        let mut exchange = MockCredentialExchange::new();
        exchange
            .expect_login()
            .withf(|user, pass| user == "dev" && pass == "pw")
            .times(1)
            .returning(|_, _| Ok(payload_expiring_in(600, "dev")));

        let store = TokenStore::new(Some(Arc::new(exchange)));
        store.login_for_development("dev", "pw").await.unwrap();
        assert_eq!(store.credentials().unwrap().access_token().expose_secret(), "access-dev");
    }

    #[test]
    fn invalid_payload_is_rejected_without_replacing() {
        let store = TokenStore::new(None);
        store.initialize_from_payload(payload_expiring_in(600, "good")).unwrap();

        let mut bad = payload_expiring_in(600, "bad");
        bad.access_token = String::new();
        assert!(matches!(store.initialize_from_payload(bad), Err(ClientError::Auth(_))));

        let mut bad = payload_expiring_in(600, "bad");
        bad.websocket_url = "not a url".to_string();
        assert!(matches!(store.initialize_from_payload(bad), Err(ClientError::Auth(_))));

        assert_eq!(store.credentials().unwrap().access_token().expose_secret(), "access-good");
    }

    #[test]
    fn empty_store_counts_as_expiring() {
        let store = TokenStore::new(None);
        assert!(store.is_expiring_soon(Duration::from_secs(1)));
        store.initialize_from_payload(payload_expiring_in(600, "x")).unwrap();
        assert!(!store.is_expiring_soon(Duration::from_secs(60)));
        assert!(store.is_expiring_soon(Duration::from_secs(601)));
    }

    #[test]
    fn out_of_range_buffer_counts_as_expiring() {
        let credentials = Credentials::from_payload(payload_expiring_in(600, "x")).unwrap();
        // Representable as a chrono duration, but past the earliest representable date.
        assert!(credentials.is_expiring_within(Duration::from_secs(10_000_000_000_000)));
        assert!(credentials.is_expiring_within(Duration::MAX));
    }

    #[test]
    fn debug_hides_tokens() {
        let credentials = Credentials::from_payload(payload_expiring_in(60, "secret")).unwrap();
        let printed = format!("{:?}", credentials);
        assert!(!printed.contains("access-secret"));
        assert!(!printed.contains("refresh-secret"));
    }
}
