use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;

use crate::error::{ClientError, ErrorKind};
use crate::types::ReconnectionState;

/// Exponential backoff with proportional jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    initial_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
    jitter: f64,
}

impl ReconnectPolicy {
    pub fn new(initial_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            initial_delay,
            max_delay,
            max_attempts,
            jitter: 0.2,
        }
    }

    /// Fraction of the computed delay added or subtracted at random, clamped to `0.0..=1.0`.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// `min(max_delay, initial_delay * 2^attempt)`
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub fn delay_for<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt).as_secs_f64();
        let spread = base * self.jitter;
        if spread <= 0.0 {
            return Duration::from_secs_f64(base);
        }
        let offset = rng.gen_range(-spread..=spread);
        Duration::from_secs_f64((base + offset).max(0.0))
    }
}

/// What to do after a failed connection attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    Retry { attempt: u32, delay: Duration },
    GiveUp(ClientError),
}

/// Counts consecutive failures and decides between retrying and giving up.
pub struct Reconnector {
    policy: ReconnectPolicy,
    state: ReconnectionState,
    protocol_strikes: u32,
    publisher: watch::Sender<ReconnectionState>,
}

impl Reconnector {
    pub fn new(policy: ReconnectPolicy) -> Self {
        let state = ReconnectionState::new(policy.max_attempts());
        let (publisher, _) = watch::channel(state);
        Self {
            policy,
            state,
            protocol_strikes: 0,
            publisher,
        }
    }

    pub fn state(&self) -> ReconnectionState {
        self.state
    }

    pub fn subscribe(&self) -> watch::Receiver<ReconnectionState> {
        self.publisher.subscribe()
    }

    pub fn on_failure(&mut self, error: &ClientError) -> RetryDecision {
        if !error.is_transient() {
            tracing::error!("not retrying after {:?} error: {}", error.kind(), error);
            return RetryDecision::GiveUp(error.clone());
        }
        if error.kind() == ErrorKind::Protocol {
            self.protocol_strikes += 1;
            if self.protocol_strikes > 1 {
                tracing::error!("repeated protocol error, giving up: {}", error);
                return RetryDecision::GiveUp(error.clone());
            }
        }

        self.state.attempt_count += 1;
        if self.state.attempt_count >= self.policy.max_attempts() {
            self.state.next_delay = None;
            self.publish();
            tracing::error!("giving up after {} attempts: {}", self.state.attempt_count, error);
            return RetryDecision::GiveUp(ClientError::ReconnectExhausted {
                attempts: self.state.attempt_count,
                last: error.to_string(),
            });
        }

        let delay = self.policy.delay_for(self.state.attempt_count - 1, &mut rand::thread_rng());
        self.state.next_delay = Some(delay);
        self.publish();
        tracing::warn!(
            "connection attempt {} failed ({}), retrying in {:?}",
            self.state.attempt_count,
            error,
            delay
        );
        RetryDecision::Retry {
            attempt: self.state.attempt_count,
            delay,
        }
    }

    /// Clears the failure count. Called on READY and on a caller-driven connect.
    pub fn reset(&mut self) {
        self.state.attempt_count = 0;
        self.state.next_delay = None;
        self.protocol_strikes = 0;
        self.publish();
    }

    fn publish(&self) {
        self.publisher.send_replace(self.state);
    }
}
