/// Audio data encoded as base64 little-endian PCM16
pub type Base64EncodedAudioBytes = String;

/// One block of captured mono PCM16 audio.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Assigned by the audio gate; strictly increasing per client.
    pub sequence: u64,
    /// Capture timestamp reported by the device, in milliseconds.
    pub timestamp_ms: u64,
    pub samples: Vec<i16>,
}

impl AudioFrame {
    pub fn new(sequence: u64, timestamp_ms: u64, samples: Vec<i16>) -> Self {
        Self {
            sequence,
            timestamp_ms,
            samples,
        }
    }
}

/// Observable state of local capture.
#[derive(Debug, Clone, Copy, PartialEq, Default, serde::Serialize, serde::Deserialize)]
pub struct AudioCaptureState {
    pub is_recording: bool,
    /// Only ever true while recording during the user's turn.
    pub is_streaming: bool,
    pub has_permission: bool,
    /// RMS level of the latest captured frame, 0.0 to 1.0.
    pub current_level: f32,
}
