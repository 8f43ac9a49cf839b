/// Running counters of one client, read with [`Client::stats`](crate::Client::stats).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
    frames_received: u64,
    frames_sent: u64,
    unknown_frames: u64,
    audio_frames_forwarded: u64,
    audio_frames_discarded: u64,
    audio_frames_overwritten: u64,
    reconnects: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    /// Inbound frames dropped because their discriminant is unknown.
    pub fn unknown_frames(&self) -> u64 {
        self.unknown_frames
    }

    pub fn audio_frames_forwarded(&self) -> u64 {
        self.audio_frames_forwarded
    }

    /// Captured while streaming was off.
    pub fn audio_frames_discarded(&self) -> u64 {
        self.audio_frames_discarded
    }

    /// Pushed out of a full queue by newer frames.
    pub fn audio_frames_overwritten(&self) -> u64 {
        self.audio_frames_overwritten
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    pub(crate) fn record_received(&mut self) {
        self.frames_received += 1;
    }

    pub(crate) fn record_sent(&mut self) {
        self.frames_sent += 1;
    }

    pub(crate) fn record_unknown(&mut self) {
        self.unknown_frames += 1;
    }

    pub(crate) fn record_forwarded(&mut self) {
        self.audio_frames_forwarded += 1;
    }

    pub(crate) fn record_discarded(&mut self) {
        self.audio_frames_discarded += 1;
    }

    pub(crate) fn record_overwritten(&mut self) {
        self.audio_frames_overwritten += 1;
    }

    pub(crate) fn record_reconnect(&mut self) {
        self.reconnects += 1;
    }
}

pub(crate) type SharedStats = std::sync::Arc<std::sync::Mutex<Stats>>;

/// Applies `f` to the shared counters, logging instead of panicking on a poisoned lock.
pub(crate) fn update(stats: &SharedStats, f: impl FnOnce(&mut Stats)) {
    match stats.lock() {
        Ok(mut guard) => f(&mut guard),
        Err(_) => tracing::error!("failed to update stats"),
    }
}
