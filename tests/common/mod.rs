//! Shared test utilities
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use vocal_assistant::events::Subscription;
use vocal_assistant::mock::{
    self, FixedResponder, MarkerWakeDetector, MicFeeder, RecordingSink, ScriptedSpeaker,
    ScriptedTranscriber,
};
use vocal_assistant::{AssistantEvent, Config, Halt, Orchestrator, OrchestratorHandle};

/// Longest a test waits for an event (virtual time under a paused clock)
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default configuration with no surfaces
#[must_use]
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.surfaces.console = false;
    config
}

/// In-memory backends shared with the test body
pub struct Ports {
    pub transcriber: Arc<ScriptedTranscriber>,
    pub responder: Arc<FixedResponder>,
    pub speaker: Arc<ScriptedSpeaker>,
    pub sink: RecordingSink,
}

impl Ports {
    /// Backends answering `reply` with a short, quick synthesis
    #[must_use]
    pub fn new(transcriber: ScriptedTranscriber, reply: &str) -> Self {
        Self {
            transcriber: Arc::new(transcriber),
            responder: Arc::new(FixedResponder::new(reply)),
            speaker: Arc::new(ScriptedSpeaker::new(3, Duration::from_millis(20))),
            sink: RecordingSink::new(),
        }
    }

    /// Replace the speaker
    #[must_use]
    pub fn with_speaker(mut self, speaker: ScriptedSpeaker) -> Self {
        self.speaker = Arc::new(speaker);
        self
    }

    /// Replace the sink
    #[must_use]
    pub fn with_sink(mut self, sink: RecordingSink) -> Self {
        self.sink = sink;
        self
    }

    /// Replace the responder
    #[must_use]
    pub fn with_responder(mut self, responder: FixedResponder) -> Self {
        self.responder = Arc::new(responder);
        self
    }
}

/// A running orchestrator driven by a mic feeder
pub struct Harness {
    pub handle: OrchestratorHandle,
    pub feeder: MicFeeder,
    pub events: Subscription,
    pub shutdown: CancellationToken,
    pub main_loop: JoinHandle<vocal_assistant::Result<Halt>>,
}

/// Build and start an orchestrator over `ports`
pub fn start(config: Config, ports: &Ports) -> Harness {
    let (device, feeder) = mock::feed_device(config.audio.sample_rate, config.audio.frame_size);

    let (orchestrator, handle) = Orchestrator::builder(Arc::new(config))
        .device(Box::new(device))
        .detector(Box::new(MarkerWakeDetector))
        .transcriber(ports.transcriber.clone())
        .responder(ports.responder.clone())
        .speaker(ports.speaker.clone())
        .sink(Box::new(ports.sink.clone()))
        .build()
        .expect("failed to build orchestrator");

    let events = handle.subscribe();
    let shutdown = CancellationToken::new();
    let main_loop = tokio::spawn(orchestrator.run(shutdown.clone()));

    Harness {
        handle,
        feeder,
        events,
        shutdown,
        main_loop,
    }
}

impl Harness {
    /// Collect events up to and including the first one matching `done`
    pub async fn until(
        &mut self,
        done: impl Fn(&AssistantEvent) -> bool,
    ) -> Vec<AssistantEvent> {
        let mut seen = Vec::new();
        let collect = async {
            while let Some(event) = self.events.receiver.recv().await {
                let last = done(&event);
                seen.push(event);
                if last {
                    return;
                }
            }
        };
        if tokio::time::timeout(EVENT_TIMEOUT, collect).await.is_err() {
            panic!("timed out waiting for event, got {seen:?}");
        }
        seen
    }

    /// Events already delivered
    pub fn drain(&mut self) -> Vec<AssistantEvent> {
        std::iter::from_fn(|| self.events.receiver.try_recv()).collect()
    }

    /// Push-to-talk, then speak `frames` frames and let silence end it
    pub async fn say(&self, frames: usize) {
        self.handle.activate().await.expect("orchestrator stopped");
        self.feeder.speech(frames);
    }

    /// Request shutdown and wait for the main loop
    pub async fn stop(self) -> Halt {
        self.shutdown.cancel();
        self.main_loop
            .await
            .expect("main loop panicked")
            .expect("main loop failed")
    }
}

/// Event names, for compact assertions
#[must_use]
pub fn names(events: &[AssistantEvent]) -> Vec<&'static str> {
    events.iter().map(AssistantEvent::name).collect()
}

/// Whether `event` is the end of a spoken response
#[must_use]
pub fn is_speech_end(event: &AssistantEvent) -> bool {
    matches!(event, AssistantEvent::SpeechEnded { .. })
}

/// Whether `event` reports an error
#[must_use]
pub fn is_error(event: &AssistantEvent) -> bool {
    matches!(event, AssistantEvent::ErrorOccurred { .. })
}
