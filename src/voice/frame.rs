//! Audio frame type shared by capture, gating, collection and playback

use tokio::time::Instant;

/// Fixed-length PCM buffer with a monotonic sequence number
///
/// Frames are immutable once produced; ownership moves through the
/// capture → gate → orchestrator queues.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Monotonic sequence number assigned by the producer
    pub seq: u64,
    /// Capture (or synthesis) timestamp
    pub captured_at: Instant,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Mono samples in `[-1.0, 1.0]`
    pub samples: Box<[f32]>,
}

impl AudioFrame {
    /// Build a frame stamped with the current time
    #[must_use]
    pub fn new(seq: u64, sample_rate: u32, samples: impl Into<Box<[f32]>>) -> Self {
        Self {
            seq,
            captured_at: Instant::now(),
            sample_rate,
            samples: samples.into(),
        }
    }

    /// Number of samples
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the frame carries no samples
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// RMS energy of the frame
    #[must_use]
    pub fn rms(&self) -> f32 {
        calculate_energy(&self.samples)
    }
}

/// Calculate RMS energy of audio samples
#[allow(clippy::cast_precision_loss)]
pub(crate) fn calculate_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_energy_calculation() {
        let silence = vec![0.0f32; 100];
        assert!(calculate_energy(&silence) < 0.001);

        let loud = vec![0.5f32; 100];
        assert!(calculate_energy(&loud) > 0.4);

        assert!(calculate_energy(&[]).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn test_frame_rms() {
        let frame = AudioFrame::new(0, 16_000, vec![0.25f32; 320]);
        assert_eq!(frame.len(), 320);
        assert!((frame.rms() - 0.25).abs() < 1e-4);
    }
}
