//! Audio playback to speakers

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleRate;
use tokio::sync::oneshot;

use super::AudioFrame;
use crate::{Error, Result};

/// Output device abstraction
#[async_trait]
pub trait AudioSink: Send {
    /// Queue a frame for playback, waiting while the device buffer is full
    ///
    /// # Errors
    ///
    /// Returns error if the output device fails
    async fn play(&mut self, frame: AudioFrame) -> Result<()>;

    /// Wait until everything queued has reached the speaker
    ///
    /// # Errors
    ///
    /// Returns error if the output device fails
    async fn drain(&mut self) -> Result<()>;

    /// Discard everything queued but not yet played
    fn flush(&mut self);
}

/// Buffered audio ahead of the device before `play` waits, in ms
const MAX_BUFFERED_MS: u32 = 500;

/// Plays frames on the default output device via cpal
///
/// The stream lives on a dedicated thread; frames are handed over through a
/// shared sample queue that the output callback drains.
pub struct CpalSink {
    sample_rate: u32,
    queue: Arc<Mutex<VecDeque<f32>>>,
    stop: Option<std::sync::mpsc::Sender<()>>,
}

impl CpalSink {
    /// Create a sink playing at `sample_rate`; the device opens on first use
    #[must_use]
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            queue: Arc::new(Mutex::new(VecDeque::new())),
            stop: None,
        }
    }

    async fn ensure_open(&mut self) -> Result<()> {
        if self.stop.is_some() {
            return Ok(());
        }

        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();
        let queue = Arc::clone(&self.queue);
        let sample_rate = self.sample_rate;

        std::thread::Builder::new()
            .name("vocal-playback".to_string())
            .spawn(move || {
                let stream = match build_output_stream(sample_rate, queue) {
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
                let _ = stop_rx.recv();
                drop(stream);
            })?;

        ready_rx
            .await
            .map_err(|_| Error::Audio("playback thread exited".to_string()))??;
        self.stop = Some(stop_tx);
        Ok(())
    }

    fn buffered(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl AudioSink for CpalSink {
    async fn play(&mut self, frame: AudioFrame) -> Result<()> {
        self.ensure_open().await?;

        if frame.sample_rate != self.sample_rate {
            tracing::warn!(
                frame_rate = frame.sample_rate,
                device_rate = self.sample_rate,
                "sample rate mismatch, playback pitch will be off"
            );
        }

        let max_buffered = usize::try_from(self.sample_rate / 1000 * MAX_BUFFERED_MS)
            .unwrap_or(usize::MAX);
        while self.buffered() > max_buffered {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(frame.samples.iter().copied());
        Ok(())
    }

    async fn drain(&mut self) -> Result<()> {
        if self.stop.is_none() {
            return Ok(());
        }
        while self.buffered() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tracing::trace!("playback drained");
        Ok(())
    }

    fn flush(&mut self) {
        let dropped = {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            let n = queue.len();
            queue.clear();
            n
        };
        tracing::debug!(samples = dropped, "playback flushed");
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.stop.take();
    }
}

fn build_output_stream(
    sample_rate: u32,
    queue: Arc<Mutex<VecDeque<f32>>>,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

    let supported = device
        .supported_output_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .filter(|c| {
            c.channels() <= 2
                && c.min_sample_rate() <= SampleRate(sample_rate)
                && c.max_sample_rate() >= SampleRate(sample_rate)
        })
        .min_by_key(cpal::SupportedStreamConfigRange::channels)
        .ok_or_else(|| Error::Audio("no suitable output config found".to_string()))?;

    let config = supported.with_sample_rate(SampleRate(sample_rate)).config();
    let channels = usize::from(config.channels.max(1));

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate,
        channels,
        "audio playback initialized"
    );

    device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let mut queue = queue.lock().unwrap_or_else(PoisonError::into_inner);
                for frame in data.chunks_mut(channels) {
                    let sample = queue.pop_front().unwrap_or(0.0);
                    frame.fill(sample);
                }
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))
}
