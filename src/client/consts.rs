use std::time::Duration;

pub const AUTHORIZATION_HEADER: &str = "Authorization";

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_JITTER: f64 = 0.2;

pub const DEFAULT_AUDIO_QUEUE_CAPACITY: usize = 64;
pub const DEFAULT_TURN_HISTORY_LIMIT: usize = 32;

pub const DEFAULT_REFRESH_BUFFER: Duration = Duration::from_secs(60);
pub const DEFAULT_TOKEN_CHECK_INTERVAL: Duration = Duration::from_secs(30);

pub const DEFAULT_EVENT_CAPACITY: usize = 1024;
