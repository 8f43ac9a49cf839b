use std::time::Duration;

use crate::client::consts::*;
use crate::reconnect::ReconnectPolicy;
use crate::transport::HandshakeTimeouts;

/// Tunables of a [`Client`](crate::Client). Build one with [`Config::builder`].
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    connect_timeout: Duration,
    auth_timeout: Duration,
    init_timeout: Duration,
    request_timeout: Duration,
    initial_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
    jitter: f64,
    audio_queue_capacity: usize,
    turn_history_limit: usize,
    refresh_buffer: Duration,
    token_check_interval: Duration,
    event_capacity: usize,
    auth_base_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            init_timeout: DEFAULT_INIT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            jitter: DEFAULT_JITTER,
            audio_queue_capacity: DEFAULT_AUDIO_QUEUE_CAPACITY,
            turn_history_limit: DEFAULT_TURN_HISTORY_LIMIT,
            refresh_buffer: DEFAULT_REFRESH_BUFFER,
            token_check_interval: DEFAULT_TOKEN_CHECK_INTERVAL,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            auth_base_url: None,
        }
    }

    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn auth_timeout(&self) -> Duration {
        self.auth_timeout
    }

    pub fn init_timeout(&self) -> Duration {
        self.init_timeout
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    pub fn audio_queue_capacity(&self) -> usize {
        self.audio_queue_capacity
    }

    pub fn turn_history_limit(&self) -> usize {
        self.turn_history_limit
    }

    pub fn refresh_buffer(&self) -> Duration {
        self.refresh_buffer
    }

    pub fn token_check_interval(&self) -> Duration {
        self.token_check_interval
    }

    pub fn event_capacity(&self) -> usize {
        self.event_capacity
    }

    pub fn auth_base_url(&self) -> Option<&str> {
        self.auth_base_url.as_deref()
    }

    pub(crate) fn handshake_timeouts(&self) -> HandshakeTimeouts {
        HandshakeTimeouts {
            connect: self.connect_timeout,
            auth: self.auth_timeout,
            init: self.init_timeout,
        }
    }

    pub(crate) fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(self.initial_delay, self.max_delay, self.max_attempts).with_jitter(self.jitter)
    }
}

pub struct ConfigBuilder {
    config: Config,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self { config: Config::new() }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.config.auth_timeout = timeout;
        self
    }

    pub fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.config.init_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.config.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.config.max_delay = delay;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.config.max_attempts = max_attempts;
        self
    }

    /// Clamped to `0.0..=1.0`.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.config.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// At least one frame is always kept.
    pub fn with_audio_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.audio_queue_capacity = capacity.max(1);
        self
    }

    pub fn with_turn_history_limit(mut self, limit: usize) -> Self {
        self.config.turn_history_limit = limit;
        self
    }

    pub fn with_refresh_buffer(mut self, buffer: Duration) -> Self {
        self.config.refresh_buffer = buffer;
        self
    }

    /// Clamped to at least one millisecond.
    pub fn with_token_check_interval(mut self, interval: Duration) -> Self {
        self.config.token_check_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity.max(1);
        self
    }

    pub fn with_auth_base_url(mut self, url: &str) -> Self {
        self.config.auth_base_url = Some(url.trim_end_matches('/').to_string());
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::new();
        assert_eq!(config.max_attempts(), 5);
        assert_eq!(config.initial_delay(), Duration::from_secs(1));
        assert_eq!(config.max_delay(), Duration::from_secs(30));
        assert_eq!(config.audio_queue_capacity(), 64);
        assert_eq!(config.turn_history_limit(), 32);
        assert_eq!(config.auth_base_url(), None);
    }

    #[test]
    fn builder_overrides_and_clamps() {
        let config = Config::builder()
            .with_max_attempts(2)
            .with_jitter(3.0)
            .with_audio_queue_capacity(0)
            .with_auth_base_url("https://auth.example/")
            .build();
        assert_eq!(config.max_attempts(), 2);
        assert_eq!(config.jitter(), 1.0);
        assert_eq!(config.audio_queue_capacity(), 1);
        assert_eq!(config.auth_base_url(), Some("https://auth.example"));
    }

    #[test]
    fn zero_token_check_interval_is_clamped() {
        let config = Config::builder().with_token_check_interval(Duration::ZERO).build();
        assert_eq!(config.token_check_interval(), Duration::from_millis(1));
    }
}
