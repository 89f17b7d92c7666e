//! Deterministic in-memory ports
//!
//! Every port trait has an implementation here so the orchestrator can run
//! without audio hardware, network, or models. Used by the `simulate`
//! command and the test suite.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;

use crate::conversation::{ReplyRequest, ResponseGenerator};
use crate::voice::{
    AudioDevice, AudioFrame, AudioSink, Detection, FrameStream, SpeechPort, Transcript,
    TranscriptionPort, Utterance, WakeWordDetector,
};
use crate::{Error, Result};

/// First-sample value that marks a frame as containing the wake word
pub const WAKE_MARKER: f32 = 0.777;

/// Loud alternating samples (RMS 0.3)
#[must_use]
pub fn speech_samples(len: usize) -> Vec<f32> {
    (0..len)
        .map(|i| if i % 2 == 0 { 0.3 } else { -0.3 })
        .collect()
}

/// All-zero samples
#[must_use]
pub fn silence_samples(len: usize) -> Vec<f32> {
    vec![0.0; len]
}

/// Samples recognized by [`MarkerWakeDetector`]
#[must_use]
pub fn wake_samples(len: usize) -> Vec<f32> {
    vec![WAKE_MARKER; len]
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

enum Feed {
    Samples(Vec<f32>),
    Fail(String),
}

/// Microphone stand-in driven by a [`MicFeeder`]
///
/// Queued samples are returned immediately. With nothing queued the device
/// behaves like a quiet room and yields a silent frame every frame period.
pub struct FeedDevice {
    rx: mpsc::UnboundedReceiver<Feed>,
    frame_period: Duration,
    opens: Arc<AtomicUsize>,
}

/// Test-side handle pushing audio into a [`FeedDevice`]
#[derive(Clone)]
pub struct MicFeeder {
    tx: mpsc::UnboundedSender<Feed>,
    frame_size: usize,
    opens: Arc<AtomicUsize>,
}

/// Create a connected device and feeder
#[must_use]
pub fn feed_device(sample_rate: u32, frame_size: usize) -> (FeedDevice, MicFeeder) {
    let (tx, rx) = mpsc::unbounded_channel();
    let opens = Arc::new(AtomicUsize::new(0));
    (
        FeedDevice {
            rx,
            frame_period: crate::config::frame_period(frame_size, sample_rate),
            opens: Arc::clone(&opens),
        },
        MicFeeder {
            tx,
            frame_size,
            opens,
        },
    )
}

impl MicFeeder {
    /// Queue `count` speech frames
    pub fn speech(&self, count: usize) {
        self.push(count, speech_samples);
    }

    /// Queue `count` silent frames
    pub fn silence(&self, count: usize) {
        self.push(count, silence_samples);
    }

    /// Queue one wake-word frame
    pub fn wake(&self) {
        self.push(1, wake_samples);
    }

    /// Make the next read fail
    pub fn fail(&self, message: &str) {
        let _ = self.tx.send(Feed::Fail(message.to_string()));
    }

    /// Times the device has been opened
    #[must_use]
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    fn push(&self, count: usize, make: fn(usize) -> Vec<f32>) {
        for _ in 0..count {
            let _ = self.tx.send(Feed::Samples(make(self.frame_size)));
        }
    }
}

#[async_trait]
impl AudioDevice for FeedDevice {
    fn name(&self) -> String {
        "feed".to_string()
    }

    async fn open(&mut self) -> Result<()> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read_frame(&mut self, frame_size: usize) -> Result<Vec<f32>> {
        if let Ok(feed) = self.rx.try_recv() {
            return match feed {
                Feed::Samples(samples) => Ok(samples),
                Feed::Fail(message) => Err(Error::Audio(message)),
            };
        }

        match tokio::time::timeout(self.frame_period, self.rx.recv()).await {
            Ok(Some(Feed::Samples(samples))) => Ok(samples),
            Ok(Some(Feed::Fail(message))) => Err(Error::Audio(message)),
            Ok(None) => {
                tokio::time::sleep(self.frame_period).await;
                Ok(silence_samples(frame_size))
            }
            Err(_) => Ok(silence_samples(frame_size)),
        }
    }

    async fn close(&mut self) {}
}

/// Detector that fires on frames starting with [`WAKE_MARKER`]
#[derive(Debug, Default)]
pub struct MarkerWakeDetector;

impl WakeWordDetector for MarkerWakeDetector {
    fn process(&mut self, frame: &AudioFrame) -> Detection {
        let triggered = frame
            .samples
            .first()
            .is_some_and(|s| (s - WAKE_MARKER).abs() < f32::EPSILON);
        if triggered {
            Detection {
                triggered: true,
                confidence: 0.95,
            }
        } else {
            Detection::NONE
        }
    }

    fn reset(&mut self) {}
}

/// Transcriber replaying a script of results in order
#[derive(Default)]
pub struct ScriptedTranscriber {
    script: Mutex<VecDeque<std::result::Result<(String, f32), String>>>,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedTranscriber {
    /// Empty script; every call fails until entries are added
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait this long before answering
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Append a successful transcript
    #[must_use]
    pub fn then_text(self, text: &str, confidence: f32) -> Self {
        lock(&self.script).push_back(Ok((text.to_string(), confidence)));
        self
    }

    /// Append a failure
    #[must_use]
    pub fn then_fail(self, message: &str) -> Self {
        lock(&self.script).push_back(Err(message.to_string()));
        self
    }

    /// Calls made so far
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TranscriptionPort for ScriptedTranscriber {
    async fn transcribe(&self, utterance: Arc<Utterance>) -> Result<Transcript> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        // Each call consumes its entry, even if it is cancelled while waiting
        let next = lock(&self.script).pop_front();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match next {
            Some(Ok((text, confidence))) => {
                Ok(Transcript::new(text, confidence).with_source(&utterance))
            }
            Some(Err(message)) => Err(Error::Stt(message)),
            None => Err(Error::Stt("no scripted transcript left".to_string())),
        }
    }
}

/// Responder returning the same reply every time
pub struct FixedResponder {
    reply: std::result::Result<String, String>,
    requests: Mutex<Vec<ReplyRequest>>,
}

impl FixedResponder {
    /// Always answer `reply`
    #[must_use]
    pub fn new(reply: &str) -> Self {
        Self {
            reply: Ok(reply.to_string()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Always fail with `message`
    #[must_use]
    pub fn failing(message: &str) -> Self {
        Self {
            reply: Err(message.to_string()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Requests received so far
    #[must_use]
    pub fn requests(&self) -> Vec<ReplyRequest> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl ResponseGenerator for FixedResponder {
    async fn generate(&self, request: &ReplyRequest) -> Result<String> {
        lock(&self.requests).push(request.clone());
        self.reply.clone().map_err(Error::Llm)
    }
}

/// Speech port yielding a fixed number of frames per reply
pub struct ScriptedSpeaker {
    chunks: usize,
    delay: Duration,
    fail: bool,
    yielded: Arc<AtomicUsize>,
}

impl ScriptedSpeaker {
    /// `chunks` frames per reply, `delay` before each
    #[must_use]
    pub fn new(chunks: usize, delay: Duration) -> Self {
        Self {
            chunks,
            delay,
            fail: false,
            yielded: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Fail every synthesis
    #[must_use]
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(0, Duration::ZERO)
        }
    }

    /// Frames produced across all replies
    #[must_use]
    pub fn yielded(&self) -> usize {
        self.yielded.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechPort for ScriptedSpeaker {
    async fn synthesize(&self, text: &str) -> Result<FrameStream> {
        if self.fail {
            return Err(Error::Tts(format!("cannot synthesize {text:?}")));
        }

        let delay = self.delay;
        let yielded = Arc::clone(&self.yielded);
        Ok(stream::unfold(0u64, move |seq| {
            let yielded = Arc::clone(&yielded);
            async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                yielded.fetch_add(1, Ordering::SeqCst);
                Some((Ok(AudioFrame::new(seq, 24_000, speech_samples(240))), seq + 1))
            }
        })
        .take(self.chunks)
        .boxed())
    }
}

/// Sink that records what it was asked to play
#[derive(Clone, Default)]
pub struct RecordingSink {
    played: Arc<Mutex<Vec<AudioFrame>>>,
    flushes: Arc<AtomicUsize>,
    drains: Arc<AtomicUsize>,
    latency: Duration,
}

impl RecordingSink {
    /// Empty recording
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take `latency` to drain, like a device with buffered audio
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Frames played so far
    #[must_use]
    pub fn played(&self) -> usize {
        lock(&self.played).len()
    }

    /// Number of flushes
    #[must_use]
    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    /// Number of completed drains
    #[must_use]
    pub fn drains(&self) -> usize {
        self.drains.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioSink for RecordingSink {
    async fn play(&mut self, frame: AudioFrame) -> Result<()> {
        lock(&self.played).push(frame);
        Ok(())
    }

    async fn drain(&mut self) -> Result<()> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.drains.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn flush(&mut self) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
    }
}
