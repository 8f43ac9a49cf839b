//! Microphone and speaker backed by cpal.
//!
//! cpal streams are not `Send`, so each one lives on its own thread for as long as it runs.

use std::collections::VecDeque;
use std::sync::mpsc as std_mpsc;
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::HeapProd;
use rubato::Resampler;
use tokio::sync::oneshot;

use crate::audio::{AudioCapture, AudioPlayback, CaptureSink};
use crate::error::ClientError;
use crate::types::AudioFrame;
use crate::utils::audio::{create_resampler, f32_to_i16, i16_to_f32, shared_buffer, split_for_chunks, AGENT_PCM16_SAMPLE_RATE};
use crate::utils::device::cpal::traits::{DeviceTrait, StreamTrait};
use crate::utils::device::cpal::{self, FrameCount, StreamConfig};
use crate::utils::device::{get_or_default_input, get_or_default_output, DeviceError};

const INPUT_CHUNK_SIZE: usize = 1024;
const OUTPUT_CHUNK_SIZE: usize = 1024;
const OUTPUT_LATENCY_MS: usize = 1000;
const POLL_INTERVAL: Duration = Duration::from_millis(100);

impl From<DeviceError> for ClientError {
    fn from(e: DeviceError) -> Self {
        match e {
            DeviceError::NotFound(_) | DeviceError::NoDefault(_) => ClientError::DeviceNotFound(e.to_string()),
            DeviceError::Busy(_) => ClientError::DeviceBusy(e.to_string()),
            DeviceError::PermissionDenied(_) => ClientError::PermissionDenied(e.to_string()),
            DeviceError::Backend(_) => ClientError::DeviceBusy(e.to_string()),
        }
    }
}

struct Worker {
    stop: std_mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// Captures mono PCM16 at the agent's sample rate from an input device.
pub struct CpalCapture {
    device_name: Option<String>,
    worker: Mutex<Option<Worker>>,
}

impl CpalCapture {
    pub fn new() -> Self {
        Self {
            device_name: None,
            worker: Mutex::new(None),
        }
    }

    pub fn with_device_name(mut self, device_name: &str) -> Self {
        self.device_name = Some(device_name.to_string());
        self
    }
}

impl Default for CpalCapture {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AudioCapture for CpalCapture {
    async fn start(&self, sink: CaptureSink) -> Result<(), ClientError> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop, stop_rx) = std_mpsc::channel();
        let device_name = self.device_name.clone();
        let handle = std::thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || run_capture(device_name, sink, ready_tx, stop_rx))
            .map_err(|e| ClientError::DeviceBusy(format!("failed to spawn capture thread: {}", e)))?;

        match ready_rx.await {
            Ok(Ok(())) => {
                if let Ok(mut worker) = self.worker.lock() {
                    *worker = Some(Worker { stop, handle });
                }
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ClientError::DeviceBusy("capture thread exited during startup".to_string())),
        }
    }

    async fn stop(&self) {
        let worker = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(worker) = worker {
            let _ = worker.stop.send(());
            if tokio::task::spawn_blocking(move || worker.handle.join()).await.is_err() {
                tracing::error!("capture thread panicked");
            }
        }
    }
}

fn run_capture(
    device_name: Option<String>,
    sink: CaptureSink,
    ready: oneshot::Sender<Result<(), ClientError>>,
    stop: std_mpsc::Receiver<()>,
) {
    let (audio_tx, audio_rx) = std_mpsc::sync_channel::<Vec<f32>>(64);
    let setup = || -> Result<(cpal::Stream, f64), DeviceError> {
        let input = get_or_default_input(device_name)?;
        let supported = input.default_input_config()?;
        let config = StreamConfig {
            channels: supported.channels(),
            sample_rate: supported.sample_rate(),
            buffer_size: cpal::BufferSize::Fixed(FrameCount::from(INPUT_CHUNK_SIZE as u32)),
        };
        tracing::info!("input: device={:?}, config={:?}", input.name().ok(), &config);
        let channels = config.channels.max(1) as usize;
        let stream = input.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let mono: Vec<f32> = data.chunks(channels).map(|frame| frame[0]).collect();
                if let Err(e) = audio_tx.try_send(mono) {
                    tracing::warn!("dropping captured audio: {}", e);
                }
            },
            |err| tracing::error!("an error occurred on input stream: {}", err),
            None,
        )?;
        stream.play()?;
        Ok((stream, config.sample_rate.0 as f64))
    };

    let (stream, input_rate) = match setup() {
        Ok(ok) => ok,
        Err(e) => {
            let _ = ready.send(Err(e.into()));
            return;
        }
    };
    let mut resampler = match create_resampler(input_rate, AGENT_PCM16_SAMPLE_RATE, INPUT_CHUNK_SIZE) {
        Ok(resampler) => resampler,
        Err(e) => {
            let _ = ready.send(Err(ClientError::DeviceBusy(format!("failed to create resampler: {}", e))));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    let started = Instant::now();
    let mut buffer: VecDeque<f32> = VecDeque::with_capacity(INPUT_CHUNK_SIZE * 2);
    loop {
        match stop.try_recv() {
            Err(std_mpsc::TryRecvError::Empty) => {}
            _ => break,
        }
        match audio_rx.recv_timeout(POLL_INTERVAL) {
            Ok(samples) => buffer.extend(samples),
            Err(std_mpsc::RecvTimeoutError::Timeout) => continue,
            Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
        }
        while buffer.len() >= INPUT_CHUNK_SIZE {
            let chunk: Vec<f32> = buffer.drain(..INPUT_CHUNK_SIZE).collect();
            match resampler.process(&[chunk.as_slice()], None) {
                Ok(resampled) => {
                    if let Some(channel) = resampled.first() {
                        sink.push(started.elapsed().as_millis() as u64, f32_to_i16(channel));
                    }
                }
                Err(e) => tracing::warn!("failed to resample input: {}", e),
            }
        }
    }
    drop(stream);
    tracing::debug!("capture thread finished");
}

/// Plays agent audio on an output device. The device stays open until this is dropped.
pub struct CpalPlayback {
    producer: Mutex<PlaybackState>,
    stop: std_mpsc::Sender<()>,
}

struct PlaybackState {
    producer: HeapProd<f32>,
    resampler: rubato::FastFixedIn<f32>,
}

impl CpalPlayback {
    pub fn open(device_name: Option<String>) -> Result<Self, ClientError> {
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (stop, stop_rx) = std_mpsc::channel::<()>();

        std::thread::Builder::new()
            .name("audio-playback".to_string())
            .spawn(move || {
                let setup = || -> Result<(cpal::Stream, HeapProd<f32>, f64), DeviceError> {
                    let output = get_or_default_output(device_name)?;
                    let supported = output.default_output_config()?;
                    let config = StreamConfig {
                        channels: supported.channels(),
                        sample_rate: supported.sample_rate(),
                        buffer_size: cpal::BufferSize::Fixed(FrameCount::from(OUTPUT_CHUNK_SIZE as u32)),
                    };
                    tracing::info!("output: device={:?}, config={:?}", output.name().ok(), &config);
                    let channels = config.channels.max(1) as usize;
                    let rate = config.sample_rate.0 as usize;
                    let (producer, mut consumer) = shared_buffer(rate * OUTPUT_LATENCY_MS / 1000).split();
                    let stream = output.build_output_stream(
                        &config,
                        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                            for frame in data.chunks_mut(channels) {
                                let sample = consumer.try_pop().unwrap_or(0.0);
                                frame.fill(sample);
                            }
                        },
                        |err| tracing::error!("an error occurred on output stream: {}", err),
                        None,
                    )?;
                    stream.play()?;
                    Ok((stream, producer, rate as f64))
                };

                match setup() {
                    Ok((stream, producer, rate)) => {
                        let _ = ready_tx.send(Ok((producer, rate)));
                        let _ = stop_rx.recv();
                        drop(stream);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(ClientError::from(e)));
                    }
                }
            })
            .map_err(|e| ClientError::DeviceBusy(format!("failed to spawn playback thread: {}", e)))?;

        let (producer, rate) = ready_rx
            .recv()
            .map_err(|_| ClientError::DeviceBusy("playback thread exited during startup".to_string()))??;
        let resampler = create_resampler(AGENT_PCM16_SAMPLE_RATE, rate, 100)
            .map_err(|e| ClientError::DeviceBusy(format!("failed to create resampler: {}", e)))?;

        Ok(Self {
            producer: Mutex::new(PlaybackState { producer, resampler }),
            stop,
        })
    }
}

impl AudioPlayback for CpalPlayback {
    fn play(&self, frame: AudioFrame) {
        let Ok(mut state) = self.producer.lock() else {
            tracing::error!("playback state poisoned");
            return;
        };
        let PlaybackState { producer, resampler } = &mut *state;
        let samples = i16_to_f32(&frame.samples);
        let chunk_size = resampler.input_frames_next();
        for chunk in split_for_chunks(&samples, chunk_size) {
            match resampler.process(&[chunk.as_slice()], None) {
                Ok(resampled) => {
                    if let Some(channel) = resampled.first() {
                        let pushed = producer.push_slice(channel);
                        if pushed < channel.len() {
                            tracing::warn!("playback buffer full, dropped {} samples", channel.len() - pushed);
                        }
                    }
                }
                Err(e) => tracing::warn!("failed to resample output: {}", e),
            }
        }
    }
}

impl Drop for CpalPlayback {
    fn drop(&mut self) {
        let _ = self.stop.send(());
    }
}
