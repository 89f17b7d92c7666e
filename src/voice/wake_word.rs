//! Wake word gating
//!
//! A [`WakeWordDetector`] scores one frame at a time over a sliding window.
//! [`WakeWordGate`] runs the detector on its own task so evaluation never
//! backpressures capture, and forwards every frame tagged with its
//! [`Detection`].

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::AudioFrame;
use crate::config::WakeConfig;

/// Outcome of evaluating one frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    /// Whether the keyword was detected on this frame
    pub triggered: bool,
    /// Detector confidence in `[0, 1]`
    pub confidence: f32,
}

impl Detection {
    /// No trigger
    pub const NONE: Self = Self {
        triggered: false,
        confidence: 0.0,
    };
}

/// Black-box keyword detector
///
/// Frames arrive in sequence order; implementations keep their own window.
pub trait WakeWordDetector: Send {
    /// Evaluate one frame
    fn process(&mut self, frame: &AudioFrame) -> Detection;

    /// Forget buffered context
    fn reset(&mut self);
}

/// Energy-onset detector
///
/// Triggers when enough loud frames appear inside the sliding window, then
/// stays quiet for a cooldown. It recognizes speech onset, not a particular
/// phrase; the configured wake phrases are stripped from transcripts later.
pub struct EnergyWakeDetector {
    threshold: f32,
    window: VecDeque<bool>,
    window_frames: usize,
    min_active_frames: usize,
    cooldown_frames: usize,
    cooldown: usize,
}

impl EnergyWakeDetector {
    /// Create a detector from the wake configuration
    #[must_use]
    pub fn new(config: &WakeConfig) -> Self {
        let sensitivity = config.sensitivity.clamp(0.0, 1.0);
        let threshold = (1.0 - sensitivity).mul_add(0.08, 0.02);

        tracing::debug!(
            wake_words = ?config.phrases,
            threshold,
            window = config.window_frames,
            "wake word detector initialized"
        );

        Self {
            threshold,
            window: VecDeque::with_capacity(config.window_frames),
            window_frames: config.window_frames.max(1),
            min_active_frames: config.min_active_frames.max(1),
            cooldown_frames: config.cooldown_frames,
            cooldown: 0,
        }
    }

    /// RMS energy a frame needs to count as loud
    #[must_use]
    pub const fn threshold(&self) -> f32 {
        self.threshold
    }
}

impl WakeWordDetector for EnergyWakeDetector {
    #[allow(clippy::cast_precision_loss)]
    fn process(&mut self, frame: &AudioFrame) -> Detection {
        if self.cooldown > 0 {
            self.cooldown -= 1;
            return Detection::NONE;
        }

        let energy = frame.rms();
        if self.window.len() == self.window_frames {
            self.window.pop_front();
        }
        self.window.push_back(energy > self.threshold);

        let active = self.window.iter().filter(|&&loud| loud).count();
        let confidence = (active as f32 / self.window_frames as f32).min(1.0);

        if active >= self.min_active_frames {
            tracing::trace!(seq = frame.seq, energy, active, "wake trigger");
            self.window.clear();
            self.cooldown = self.cooldown_frames;
            return Detection {
                triggered: true,
                confidence,
            };
        }

        Detection {
            triggered: false,
            confidence,
        }
    }

    fn reset(&mut self) {
        self.window.clear();
        self.cooldown = 0;
    }
}

/// Frame annotated with the gate's verdict
#[derive(Debug, Clone)]
pub struct GatedFrame {
    pub frame: AudioFrame,
    pub detection: Detection,
}

/// Runs a detector over the capture stream on a dedicated task
pub struct WakeWordGate {
    detector: Box<dyn WakeWordDetector>,
    frame_period: Duration,
}

impl WakeWordGate {
    /// Wrap a detector; evaluations slower than `frame_period` are logged
    #[must_use]
    pub fn new(detector: Box<dyn WakeWordDetector>, frame_period: Duration) -> Self {
        Self {
            detector,
            frame_period,
        }
    }

    /// Evaluate one frame synchronously
    pub fn evaluate(&mut self, frame: &AudioFrame) -> Detection {
        let started = std::time::Instant::now();
        let detection = self.detector.process(frame);
        let elapsed = started.elapsed();
        if elapsed >= self.frame_period {
            tracing::warn!(
                seq = frame.seq,
                elapsed_us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX),
                "wake word evaluation exceeded frame period"
            );
        }
        detection
    }

    /// Start gating `frames` into `out`
    pub fn spawn(
        mut self,
        mut frames: mpsc::Receiver<AudioFrame>,
        out: mpsc::Sender<GatedFrame>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    () = cancel.cancelled() => break,
                    frame = frames.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                };

                let detection = self.evaluate(&frame);
                if detection.triggered {
                    tracing::debug!(seq = frame.seq, confidence = detection.confidence, "wake word detected");
                }

                if out.send(GatedFrame { frame, detection }).await.is_err() {
                    break;
                }
            }
            tracing::debug!("wake word gate stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(seq: u64, level: f32) -> AudioFrame {
        AudioFrame::new(seq, 16_000, vec![level; 320])
    }

    fn config() -> WakeConfig {
        WakeConfig {
            window_frames: 4,
            min_active_frames: 3,
            cooldown_frames: 5,
            ..WakeConfig::default()
        }
    }

    #[tokio::test]
    async fn test_triggers_on_sustained_energy() {
        let mut detector = EnergyWakeDetector::new(&config());

        assert!(!detector.process(&frame(0, 0.3)).triggered);
        assert!(!detector.process(&frame(1, 0.3)).triggered);
        let hit = detector.process(&frame(2, 0.3));
        assert!(hit.triggered);
        assert!(hit.confidence > 0.5);
    }

    #[tokio::test]
    async fn test_cooldown_suppresses_retrigger() {
        let mut detector = EnergyWakeDetector::new(&config());
        let triggers = (0..8)
            .filter(|&n| detector.process(&frame(n, 0.3)).triggered)
            .count();
        assert_eq!(triggers, 1);
    }

    #[tokio::test]
    async fn test_sensitivity_lowers_threshold() {
        let strict = EnergyWakeDetector::new(&WakeConfig {
            sensitivity: 0.0,
            ..config()
        });
        let loose = EnergyWakeDetector::new(&WakeConfig {
            sensitivity: 1.0,
            ..config()
        });
        assert!(loose.threshold() < strict.threshold());
    }

    #[tokio::test]
    async fn test_gate_forwards_every_frame() {
        let (frame_tx, frame_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let gate = WakeWordGate::new(
            Box::new(EnergyWakeDetector::new(&config())),
            Duration::from_millis(20),
        );
        let handle = gate.spawn(frame_rx, out_tx, cancel.clone());

        for n in 0..4 {
            frame_tx.send(frame(n, 0.3)).await.unwrap();
        }
        drop(frame_tx);

        let mut seen = Vec::new();
        while let Some(gated) = out_rx.recv().await {
            seen.push((gated.frame.seq, gated.detection.triggered));
        }
        assert_eq!(seen, vec![(0, false), (1, false), (2, true), (3, false)]);
        handle.await.unwrap();
    }
}
