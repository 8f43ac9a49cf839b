use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use ringbuf::traits::{Consumer, RingBuffer};
use ringbuf::HeapRb;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::client::stats::{self, SharedStats, Stats};
use crate::error::ClientError;
use crate::single_flight::SingleFlight;
use crate::transport::Transport;
use crate::turn::TurnObserver;
use crate::types::events::{AudioChunkEvent, AudioDeltaEvent, AudioStreamEvent};
use crate::types::{AudioCaptureState, AudioFrame, ClientFrame, TurnState, TurnTransition};
use crate::utils::audio::{decode_i16, encode_i16, rms_level};

#[cfg(feature = "device")]
pub mod native;

/// A microphone. Frames are delivered through the [`CaptureSink`] handed to `start`.
#[async_trait]
pub trait AudioCapture: Send + Sync {
    /// Acquires the device. Fails with `PermissionDenied`, `DeviceNotFound` or `DeviceBusy`.
    async fn start(&self, sink: CaptureSink) -> Result<(), ClientError>;

    async fn stop(&self);
}

/// A speaker for agent audio.
pub trait AudioPlayback: Send + Sync {
    fn play(&self, frame: AudioFrame);
}

struct GateInner {
    recording: bool,
    has_permission: bool,
    armed: bool,
    turn: TurnState,
    level: f32,
    next_sequence: u64,
    queue: HeapRb<AudioFrame>,
}

impl GateInner {
    fn is_streaming(&self) -> bool {
        self.armed && self.recording && self.turn.is_user_turn()
    }

    fn snapshot(&self) -> AudioCaptureState {
        AudioCaptureState {
            is_recording: self.recording,
            is_streaming: self.is_streaming(),
            has_permission: self.has_permission,
            current_level: self.level,
        }
    }

    fn drain(&mut self) -> usize {
        let mut dropped = 0;
        while self.queue.try_pop().is_some() {
            dropped += 1;
        }
        dropped
    }
}

struct GateShared {
    inner: Mutex<GateInner>,
    notify: Notify,
    publisher: watch::Sender<AudioCaptureState>,
    stats: SharedStats,
}

impl GateShared {
    fn lock(&self) -> MutexGuard<'_, GateInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, inner: &GateInner) {
        self.publisher.send_replace(inner.snapshot());
    }
}

/// Producer handle given to an [`AudioCapture`]. Cheap to clone; safe to call from any thread.
#[derive(Clone)]
pub struct CaptureSink {
    shared: Arc<GateShared>,
}

impl CaptureSink {
    /// Hands one captured PCM16 mono frame to the gate. Frames captured while not streaming are discarded.
    pub fn push(&self, timestamp_ms: u64, samples: Vec<i16>) {
        let mut inner = self.shared.lock();
        if !inner.recording {
            return;
        }
        inner.level = rms_level(&samples);
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;

        if inner.is_streaming() {
            if inner.queue.push_overwrite(AudioFrame::new(sequence, timestamp_ms, samples)).is_some() {
                stats::update(&self.shared.stats, Stats::record_overwritten);
            }
            self.shared.notify.notify_one();
        } else {
            stats::update(&self.shared.stats, Stats::record_discarded);
        }
        self.shared.publish(&inner);
    }
}

/// Decides when captured audio may leave the client: only while armed, recording and in the user's turn.
pub struct AudioGate {
    shared: Arc<GateShared>,
    transport: Arc<Transport>,
    capture: Option<Arc<dyn AudioCapture>>,
    playback: Option<Arc<dyn AudioPlayback>>,
    capture_flight: SingleFlight<Result<(), ClientError>>,
    playback_sequence: AtomicU64,
}

impl AudioGate {
    pub(crate) fn new(
        queue_capacity: usize,
        transport: Arc<Transport>,
        stats: SharedStats,
        capture: Option<Arc<dyn AudioCapture>>,
        playback: Option<Arc<dyn AudioPlayback>>,
    ) -> Self {
        let inner = GateInner {
            recording: false,
            has_permission: false,
            armed: false,
            turn: TurnState::Idle,
            level: 0.0,
            next_sequence: 0,
            queue: HeapRb::new(queue_capacity.max(1)),
        };
        let (publisher, _) = watch::channel(inner.snapshot());
        Self {
            shared: Arc::new(GateShared {
                inner: Mutex::new(inner),
                notify: Notify::new(),
                publisher,
                stats,
            }),
            transport,
            capture,
            playback,
            capture_flight: SingleFlight::new(),
            playback_sequence: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> AudioCaptureState {
        *self.shared.publisher.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<AudioCaptureState> {
        self.shared.publisher.subscribe()
    }

    /// Acquires the microphone. Returns immediately if already recording; concurrent callers share one acquisition.
    pub async fn start_capture(&self) -> Result<(), ClientError> {
        if self.shared.lock().recording {
            return Ok(());
        }
        let capture = self
            .capture
            .clone()
            .ok_or_else(|| ClientError::DeviceNotFound("no capture device configured".to_string()))?;
        let shared = self.shared.clone();
        self.capture_flight
            .run(move || async move {
                tracing::info!("starting audio capture");
                let result = capture.start(CaptureSink { shared: shared.clone() }).await;
                let mut inner = shared.lock();
                match &result {
                    Ok(()) => {
                        inner.recording = true;
                        inner.has_permission = true;
                    }
                    Err(ClientError::PermissionDenied(_)) => inner.has_permission = false,
                    Err(_) => {}
                }
                if let Err(e) = &result {
                    tracing::error!("failed to start audio capture: {}", e);
                }
                shared.publish(&inner);
                result
            })
            .await
    }

    /// Releases the microphone, disarming and discarding anything queued.
    pub async fn stop_capture(&self) {
        let was_streaming = {
            let mut inner = self.shared.lock();
            if !inner.recording {
                return;
            }
            let was_streaming = inner.is_streaming();
            inner.recording = false;
            inner.armed = false;
            inner.level = 0.0;
            inner.drain();
            self.shared.publish(&inner);
            was_streaming
        };
        if was_streaming {
            self.send_stream_edge(false);
        }
        if let Some(capture) = &self.capture {
            capture.stop().await;
        }
        tracing::info!("audio capture stopped");
    }

    /// Turns forwarding on. Refused (returns `false`) outside the user's turn or while not recording.
    pub fn arm_streaming(&self) -> bool {
        {
            let mut inner = self.shared.lock();
            if !inner.recording || !inner.turn.is_user_turn() {
                tracing::debug!(
                    "refusing to arm streaming (recording: {}, turn: {:?})",
                    inner.recording,
                    inner.turn
                );
                return false;
            }
            if inner.armed {
                return true;
            }
            inner.armed = true;
            self.shared.publish(&inner);
        }
        self.send_stream_edge(true);
        true
    }

    pub fn disarm_streaming(&self) {
        let was_streaming = {
            let mut inner = self.shared.lock();
            if !inner.armed {
                return;
            }
            let was_streaming = inner.is_streaming();
            inner.armed = false;
            inner.drain();
            self.shared.publish(&inner);
            was_streaming
        };
        if was_streaming {
            self.send_stream_edge(false);
        }
    }

    /// Drops queued frames without touching the armed flag.
    pub(crate) fn discard_queued(&self) {
        let mut inner = self.shared.lock();
        let dropped = inner.drain();
        if dropped > 0 {
            tracing::debug!("discarded {} queued audio frames", dropped);
        }
    }

    fn send_stream_edge(&self, start: bool) {
        let event = AudioStreamEvent::new();
        let frame = if start {
            ClientFrame::StartAudioStream(event)
        } else {
            ClientFrame::StopAudioStream(event)
        };
        let kind = frame.kind();
        if let Err(e) = self.transport.send(frame) {
            tracing::debug!("{} not sent: {}", kind, e);
        }
    }

    /// Spawns the task that moves queued frames to the transport while streaming.
    pub(crate) fn spawn_forwarder(&self) -> JoinHandle<()> {
        let shared = self.shared.clone();
        let transport = self.transport.clone();
        tokio::spawn(async move {
            loop {
                shared.notify.notified().await;
                loop {
                    // Sending under the gate lock keeps turn changes from interleaving with a send.
                    let mut inner = shared.lock();
                    if !inner.is_streaming() {
                        inner.drain();
                        break;
                    }
                    let Some(frame) = inner.queue.try_pop() else { break };
                    let event = AudioChunkEvent::new(frame.sequence, frame.timestamp_ms, encode_i16(&frame.samples));
                    match transport.send(ClientFrame::AudioChunk(event)) {
                        Ok(()) => stats::update(&shared.stats, Stats::record_forwarded),
                        Err(e) => tracing::warn!("dropping audio frame {}: {}", frame.sequence, e),
                    }
                }
            }
        })
    }

    /// Decodes an `audio_delta` and hands it to the playback device, if any.
    pub(crate) fn play(&self, event: &AudioDeltaEvent) {
        let Some(playback) = &self.playback else {
            return;
        };
        match decode_i16(event.audio()) {
            Ok(samples) => {
                let sequence = self.playback_sequence.fetch_add(1, Ordering::Relaxed);
                let timestamp_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;
                playback.play(AudioFrame::new(sequence, timestamp_ms, samples));
            }
            Err(e) => tracing::warn!("dropping undecodable audio_delta: {}", e),
        }
    }
}

impl TurnObserver for AudioGate {
    fn on_turn_changed(&self, transition: &TurnTransition) {
        let was_streaming = {
            let mut inner = self.shared.lock();
            let was_streaming = inner.is_streaming();
            inner.turn = transition.to();
            if transition.from().is_user_turn() {
                inner.armed = false;
                inner.drain();
            }
            self.shared.publish(&inner);
            was_streaming
        };
        if was_streaming {
            tracing::info!("user turn ended, streaming disarmed");
            self.send_stream_edge(false);
        }
    }
}
