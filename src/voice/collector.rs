//! Utterance collection
//!
//! After a wake trigger the collector accumulates frames until trailing
//! silence reaches the silence timeout or the utterance reaches its maximum
//! duration. Durations are measured in samples so results do not depend on
//! scheduling jitter; a wall-clock deadline additionally finalizes the
//! utterance when frames stop arriving altogether.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use uuid::Uuid;

use super::AudioFrame;
use crate::config::CollectorConfig;

/// How an utterance ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// Trailing silence reached the silence timeout
    SilenceTerminated,
    /// Maximum utterance duration reached
    TimeoutTerminated,
    /// No speech followed the trigger
    FalseWake,
}

/// Bounded, finalized sequence of frames
#[derive(Debug)]
pub struct Utterance {
    id: Uuid,
    frames: Vec<AudioFrame>,
    sample_rate: u32,
    started_at: Instant,
    ended_at: Instant,
    termination: Termination,
}

impl Utterance {
    /// Unique id, used to correlate logs
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Frames in sequence order
    #[must_use]
    pub fn frames(&self) -> &[AudioFrame] {
        &self.frames
    }

    /// How collection ended
    #[must_use]
    pub const fn termination(&self) -> Termination {
        self.termination
    }

    /// Sample rate of the frames
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Trigger time
    #[must_use]
    pub const fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Finalization time
    #[must_use]
    pub const fn ended_at(&self) -> Instant {
        self.ended_at
    }

    /// Audio duration derived from the sample count
    #[must_use]
    pub fn duration(&self) -> Duration {
        samples_duration(
            self.frames.iter().map(AudioFrame::len).sum(),
            self.sample_rate,
        )
    }

    /// Concatenated samples
    #[must_use]
    pub fn samples(&self) -> Vec<f32> {
        self.frames
            .iter()
            .flat_map(|f| f.samples.iter().copied())
            .collect()
    }

    /// Whether the utterance holds no audio
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Result of feeding a frame to the collector
#[derive(Debug)]
pub enum CollectorStatus {
    /// Not collecting; the frame was dropped
    Idle,
    /// Frame appended
    Collecting,
    /// Utterance complete
    Finalized(Utterance),
}

struct Collecting {
    started_at: Instant,
    last_frame_at: Instant,
    sample_rate: u32,
    frames: Vec<AudioFrame>,
    samples: usize,
    heard_speech: bool,
    silent_samples: usize,
    energies: VecDeque<f32>,
}

/// Accumulates frames into at most one utterance at a time
pub struct UtteranceCollector {
    config: CollectorConfig,
    sample_rate: u32,
    active: Option<Collecting>,
}

impl UtteranceCollector {
    /// Create an idle collector
    #[must_use]
    pub const fn new(config: CollectorConfig, sample_rate: u32) -> Self {
        Self {
            config,
            sample_rate,
            active: None,
        }
    }

    /// Begin a new utterance, discarding any partial one
    pub fn start(&mut self) {
        let now = Instant::now();
        if self.active.is_some() {
            tracing::debug!("restarting utterance collection");
        }
        self.active = Some(Collecting {
            started_at: now,
            last_frame_at: now,
            sample_rate: self.sample_rate,
            frames: Vec::new(),
            samples: 0,
            heard_speech: false,
            silent_samples: 0,
            energies: VecDeque::with_capacity(self.config.energy_window_frames),
        });
    }

    /// Drop the utterance in progress
    pub fn cancel(&mut self) {
        self.active = None;
    }

    /// Whether an utterance is being collected
    #[must_use]
    pub const fn is_collecting(&self) -> bool {
        self.active.is_some()
    }

    /// Append a frame and evaluate termination
    ///
    /// A frame that would carry the utterance past its maximum duration is
    /// truncated to the samples that still fit.
    pub fn push(&mut self, mut frame: AudioFrame) -> CollectorStatus {
        let cap = duration_samples(self.config.max_utterance, self.sample_rate);
        let Some(active) = self.active.as_mut() else {
            return CollectorStatus::Idle;
        };

        let remaining = cap.saturating_sub(active.samples);
        if frame.len() > remaining {
            tracing::trace!(
                seq = frame.seq,
                kept = remaining,
                "frame truncated at max duration"
            );
            frame.samples = frame.samples[..remaining].into();
        }

        let energy = frame.rms();
        if active.energies.len() == self.config.energy_window_frames {
            active.energies.pop_front();
        }
        active.energies.push_back(energy);
        let window_energy = window_rms(&active.energies);
        let voiced = window_energy > self.config.silence_threshold;

        active.last_frame_at = Instant::now();
        active.samples += frame.len();
        if voiced {
            active.heard_speech = true;
            active.silent_samples = 0;
        } else if active.heard_speech {
            active.silent_samples += frame.len();
        }
        active.frames.push(frame);

        tracing::trace!(
            frames = active.frames.len(),
            energy,
            window_energy,
            voiced,
            "collecting"
        );

        let sample_rate = active.sample_rate;
        let termination = if !active.heard_speech
            && active.frames.len() >= self.config.false_wake_frames
        {
            Some(Termination::FalseWake)
        } else if active.samples >= cap {
            Some(Termination::TimeoutTerminated)
        } else if active.heard_speech
            && samples_duration(active.silent_samples, sample_rate)
                >= self.config.silence_timeout
        {
            Some(Termination::SilenceTerminated)
        } else {
            None
        };

        match termination {
            Some(termination) => CollectorStatus::Finalized(self.finalize(termination)),
            None => CollectorStatus::Collecting,
        }
    }

    /// Wall-clock instant at which collection ends if no more frames arrive
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.active.as_ref().map(|active| {
            let cap = active.started_at + self.config.max_utterance;
            let stalled = active.last_frame_at + self.config.silence_timeout;
            cap.min(stalled)
        })
    }

    /// Finalize if the wall-clock deadline has passed
    pub fn poll(&mut self, now: Instant) -> Option<Utterance> {
        let active = self.active.as_ref()?;
        if now < self.deadline()? {
            return None;
        }

        let termination = if now >= active.started_at + self.config.max_utterance {
            Termination::TimeoutTerminated
        } else if active.heard_speech {
            Termination::SilenceTerminated
        } else {
            Termination::FalseWake
        };
        tracing::debug!(?termination, "collection deadline reached");
        Some(self.finalize(termination))
    }

    fn finalize(&mut self, termination: Termination) -> Utterance {
        let active = self.active.take();
        let now = Instant::now();
        let (started_at, frames) = active.map_or((now, Vec::new()), |a| (a.started_at, a.frames));

        // A false wake carries no audio
        let frames = if termination == Termination::FalseWake {
            Vec::new()
        } else {
            frames
        };

        let utterance = Utterance {
            id: Uuid::new_v4(),
            frames,
            sample_rate: self.sample_rate,
            started_at,
            ended_at: now,
            termination,
        };
        tracing::debug!(
            id = %utterance.id,
            ?termination,
            frames = utterance.frames.len(),
            duration_ms = u64::try_from(utterance.duration().as_millis()).unwrap_or(u64::MAX),
            "utterance finalized"
        );
        utterance
    }
}

/// RMS over a window of per-frame RMS values
#[allow(clippy::cast_precision_loss)]
fn window_rms(energies: &VecDeque<f32>) -> f32 {
    if energies.is_empty() {
        return 0.0;
    }
    let mean_square = energies.iter().map(|e| e * e).sum::<f32>() / energies.len() as f32;
    mean_square.sqrt()
}

/// Whole samples that fit in `duration` at `sample_rate`
fn duration_samples(duration: Duration, sample_rate: u32) -> usize {
    let samples = duration.as_nanos() * u128::from(sample_rate) / 1_000_000_000;
    usize::try_from(samples).unwrap_or(usize::MAX)
}

/// Duration represented by `samples` at `sample_rate`
fn samples_duration(samples: usize, sample_rate: u32) -> Duration {
    crate::config::frame_period(samples, sample_rate)
}
