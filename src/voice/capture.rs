//! Audio capture
//!
//! [`AudioSource`] turns an [`AudioDevice`] into a lazy, infinite stream of
//! [`AudioFrame`]s on a dedicated task. A read that takes longer than the
//! stall timeout, or fails outright, is reported as a stall; the device is
//! then reopened with exponential backoff until it produces frames again.

use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::AudioFrame;
use crate::config::AudioConfig;
use crate::{Error, Result};

/// Input device abstraction
///
/// Implementations own the physical device between `open` and `close`.
#[async_trait]
pub trait AudioDevice: Send {
    /// Human-readable device name
    fn name(&self) -> String;

    /// Acquire the device
    ///
    /// # Errors
    ///
    /// Returns error if the device cannot be opened
    async fn open(&mut self) -> Result<()>;

    /// Read exactly `frame_size` mono samples
    ///
    /// # Errors
    ///
    /// Returns error if the device stopped delivering samples
    async fn read_frame(&mut self, frame_size: usize) -> Result<Vec<f32>>;

    /// Release the device
    async fn close(&mut self);
}

/// Device health notifications from the capture task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    /// The device stopped producing frames
    Stalled { message: String },
    /// Frames are flowing again
    Recovered,
}

/// Exponential backoff for device reopen attempts
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    /// Create a backoff starting at `base` and never exceeding `cap`
    #[must_use]
    pub const fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    /// Delay before the next attempt: `min(base * 2^attempt, cap)`
    pub fn next_delay(&mut self) -> Duration {
        let delay = self
            .base
            .saturating_mul(2u32.saturating_pow(self.attempt))
            .min(self.cap);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Start over after a successful read
    pub const fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Capture task producing frames from an [`AudioDevice`]
pub struct AudioSource {
    device: Box<dyn AudioDevice>,
    config: AudioConfig,
}

impl AudioSource {
    /// Wrap a device with the capture settings
    #[must_use]
    pub fn new(device: Box<dyn AudioDevice>, config: AudioConfig) -> Self {
        Self { device, config }
    }

    /// Start capturing on a dedicated task
    ///
    /// Frames go to `frames`; a frame that cannot be queued within one frame
    /// period is dropped so capture never stalls behind its consumer.
    pub fn spawn(
        self,
        frames: mpsc::Sender<AudioFrame>,
        status: mpsc::Sender<SourceEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(frames, status, cancel))
    }

    async fn run(
        mut self,
        frames: mpsc::Sender<AudioFrame>,
        status: mpsc::Sender<SourceEvent>,
        cancel: CancellationToken,
    ) {
        let name = self.device.name();
        let frame_period = self.config.frame_period();
        let mut backoff = Backoff::new(self.config.backoff_base, self.config.backoff_cap);
        let mut seq: u64 = 0;
        let mut opened = false;
        let mut stalled = false;

        tracing::info!(device = %name, sample_rate = self.config.sample_rate, "audio source started");

        loop {
            if !opened {
                let result = tokio::select! {
                    () = cancel.cancelled() => break,
                    r = self.device.open() => r,
                };
                match result {
                    Ok(()) => {
                        opened = true;
                        tracing::debug!(device = %name, "input device opened");
                    }
                    Err(e) => {
                        if !stalled {
                            stalled = true;
                            let _ = status.try_send(SourceEvent::Stalled {
                                message: e.to_string(),
                            });
                        }
                        let delay = backoff.next_delay();
                        tracing::warn!(device = %name, error = %e, ?delay, "failed to open input device");
                        if sleep_or_cancel(delay, &cancel).await {
                            break;
                        }
                        continue;
                    }
                }
            }

            let read = tokio::select! {
                () = cancel.cancelled() => break,
                r = tokio::time::timeout(
                    self.config.stall_timeout,
                    self.device.read_frame(self.config.frame_size),
                ) => r,
            };

            let failure = match read {
                Ok(Ok(samples)) => {
                    if stalled {
                        stalled = false;
                        backoff.reset();
                        tracing::info!(device = %name, "input device recovered");
                        let _ = status.try_send(SourceEvent::Recovered);
                    }

                    let frame = AudioFrame::new(seq, self.config.sample_rate, samples);
                    seq += 1;

                    match tokio::time::timeout(frame_period, frames.send(frame)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) => {
                            tracing::debug!("frame consumer closed, stopping capture");
                            break;
                        }
                        Err(_) => tracing::trace!(seq, "frame queue full, dropping frame"),
                    }
                    continue;
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!(
                    "no samples within {} ms",
                    self.config.stall_timeout.as_millis()
                ),
            };

            if !stalled {
                stalled = true;
                let _ = status.try_send(SourceEvent::Stalled {
                    message: failure.clone(),
                });
            }

            self.device.close().await;
            opened = false;

            let delay = backoff.next_delay();
            tracing::warn!(device = %name, error = %failure, ?delay, "input device stalled, reopening");
            if sleep_or_cancel(delay, &cancel).await {
                break;
            }
        }

        if opened {
            self.device.close().await;
        }
        tracing::info!(device = %name, frames = seq, "audio source stopped");
    }
}

/// Sleep for `delay`; returns true if cancelled first
async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = cancel.cancelled() => true,
        () = tokio::time::sleep(delay) => false,
    }
}

/// Default microphone via cpal
///
/// The cpal stream is not `Send`, so it lives on its own OS thread for as
/// long as the device is open. Samples reach the async side via a channel.
pub struct CpalDevice {
    sample_rate: u32,
    samples: Option<mpsc::Receiver<Vec<f32>>>,
    stop: Option<std::sync::mpsc::Sender<()>>,
    pending: Vec<f32>,
}

impl CpalDevice {
    /// Create a device capturing at `sample_rate`
    #[must_use]
    pub const fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            samples: None,
            stop: None,
            pending: Vec::new(),
        }
    }
}

#[async_trait]
impl AudioDevice for CpalDevice {
    fn name(&self) -> String {
        cpal::default_host()
            .default_input_device()
            .and_then(|d| d.name().ok())
            .unwrap_or_else(|| "default".to_string())
    }

    async fn open(&mut self) -> Result<()> {
        let (sample_tx, sample_rx) = mpsc::channel::<Vec<f32>>(256);
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();
        let sample_rate = self.sample_rate;

        std::thread::Builder::new()
            .name("vocal-capture".to_string())
            .spawn(move || {
                let stream = match build_input_stream(sample_rate, sample_tx) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(Error::Audio(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));
                // Park until close() drops the sender
                let _ = stop_rx.recv();
                drop(stream);
            })?;

        ready_rx
            .await
            .map_err(|_| Error::Audio("capture thread exited".to_string()))??;

        self.samples = Some(sample_rx);
        self.stop = Some(stop_tx);
        self.pending.clear();
        tracing::debug!(sample_rate, "audio capture started");
        Ok(())
    }

    async fn read_frame(&mut self, frame_size: usize) -> Result<Vec<f32>> {
        let rx = self
            .samples
            .as_mut()
            .ok_or_else(|| Error::Audio("device not open".to_string()))?;

        while self.pending.len() < frame_size {
            let chunk = rx
                .recv()
                .await
                .ok_or_else(|| Error::Audio("input stream closed".to_string()))?;
            self.pending.extend_from_slice(&chunk);
        }

        Ok(self.pending.drain(..frame_size).collect())
    }

    async fn close(&mut self) {
        self.stop.take();
        self.samples.take();
        self.pending.clear();
        tracing::debug!("audio capture stopped");
    }
}

/// Build and return a paused input stream on the calling thread
fn build_input_stream(sample_rate: u32, tx: mpsc::Sender<Vec<f32>>) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| Error::Audio("no input device available".to_string()))?;

    let supported = device
        .supported_input_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .filter(|c| {
            c.min_sample_rate() <= SampleRate(sample_rate)
                && c.max_sample_rate() >= SampleRate(sample_rate)
        })
        .min_by_key(cpal::SupportedStreamConfigRange::channels)
        .ok_or_else(|| Error::Audio("no suitable audio config found".to_string()))?;

    let config: StreamConfig = supported.with_sample_rate(SampleRate(sample_rate)).config();
    let channels = usize::from(config.channels.max(1));

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate,
        channels,
        "audio capture initialized"
    );

    device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let mono = downmix(data, channels);
                if tx.try_send(mono).is_err() {
                    tracing::trace!("capture channel full, dropping samples");
                }
            },
            |err| {
                tracing::error!(error = %err, "audio capture error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))
}

/// Average interleaved channels into mono
#[allow(clippy::cast_precision_loss)]
fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|c| c.iter().sum::<f32>() / c.len() as f32)
        .collect()
}

/// Names of the available input devices
///
/// # Errors
///
/// Returns error if the audio host cannot enumerate devices
pub fn list_input_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let devices = host
        .input_devices()
        .map_err(|e| Error::Audio(e.to_string()))?;
    Ok(devices.filter_map(|d| d.name().ok()).collect())
}

/// Convert f32 samples to WAV bytes for STT APIs
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            #[allow(clippy::cast_possible_truncation)]
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer
                .write_sample(sample_i16)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}
