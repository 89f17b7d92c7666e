//! Top-level state machine
//!
//! The [`Orchestrator`] owns the main loop. It binds capture, wake gating,
//! utterance collection, the speech ports and the conversation engine, and
//! publishes one [`AssistantEvent`](crate::events::AssistantEvent) per state
//! transition. It is built explicitly with its collaborators injected:
//!
//! ```ignore
//! let (orchestrator, handle) = Orchestrator::builder(config)
//!     .device(Box::new(CpalDevice::new(16_000)))
//!     .detector(Box::new(EnergyWakeDetector::new(&wake)))
//!     .transcriber(Arc::new(transcriber))
//!     .responder(Arc::new(OllamaResponder::new(url, model)))
//!     .speaker(Arc::new(speech))
//!     .sink(Box::new(CpalSink::new(24_000)))
//!     .build()?;
//! let halt = orchestrator.run(shutdown).await?;
//! ```

mod failures;
mod machine;
mod tasks;

pub use failures::FailureTracker;

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, watch};

use crate::config::Config;
use crate::conversation::{ConversationEngine, ConversationState, ResponseGenerator};
use crate::events::{ErrorKind, EventBus, Subscription};
use crate::voice::{
    AudioDevice, AudioSink, AudioSource, SpeechPort, TranscriptionPort, UtteranceCollector,
    WakeWordDetector, WakeWordGate,
};
use crate::{Error, Result};

use tasks::{SharedSink, TaskEvent};

/// Capacity of the handle → orchestrator command queue
const COMMAND_QUEUE: usize = 16;

/// Why the main loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Halt {
    /// Shutdown was requested
    Shutdown,
    /// Repeated failures of this kind exhausted recovery
    Escalated(ErrorKind),
}

#[derive(Debug)]
enum Command {
    Activate,
    SubmitText(String),
    NewSession,
}

/// Cloneable control surface for a running orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorHandle {
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<ConversationState>,
    bus: EventBus,
}

impl OrchestratorHandle {
    /// Start listening without a wake trigger (push-to-talk)
    ///
    /// # Errors
    ///
    /// Returns error if the orchestrator has stopped
    pub async fn activate(&self) -> Result<()> {
        self.send(Command::Activate).await
    }

    /// Process typed text as if it had been transcribed
    ///
    /// # Errors
    ///
    /// Returns error if the orchestrator has stopped
    pub async fn submit_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(Command::SubmitText(text.into())).await
    }

    /// Reset history while idle; the profile is kept
    ///
    /// # Errors
    ///
    /// Returns error if the orchestrator has stopped
    pub async fn new_session(&self) -> Result<()> {
        self.send(Command::NewSession).await
    }

    /// Copy of the current conversation state
    #[must_use]
    pub fn snapshot(&self) -> ConversationState {
        self.snapshots.borrow().clone()
    }

    /// Receiver notified on every state change
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<ConversationState> {
        self.snapshots.clone()
    }

    /// Subscribe to assistant events
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }

    /// The event bus
    #[must_use]
    pub const fn bus(&self) -> &EventBus {
        &self.bus
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::Orchestrator("orchestrator stopped".to_string()))
    }
}

/// The assistant's main loop and state machine
pub struct Orchestrator {
    config: Arc<Config>,
    bus: EventBus,
    engine: ConversationEngine,
    state: ConversationState,
    snapshots: watch::Sender<ConversationState>,
    source: Option<AudioSource>,
    gate: Option<WakeWordGate>,
    collector: UtteranceCollector,
    transcriber: Arc<dyn TranscriptionPort>,
    responder: Arc<dyn ResponseGenerator>,
    speaker: Arc<dyn SpeechPort>,
    sink: SharedSink,
    commands: mpsc::Receiver<Command>,
    task_tx: mpsc::UnboundedSender<TaskEvent>,
    task_rx: mpsc::UnboundedReceiver<TaskEvent>,
    generation: u64,
    inflight: Option<tokio_util::sync::CancellationToken>,
    failures: FailureTracker,
}

impl Orchestrator {
    /// Start building an orchestrator
    #[must_use]
    pub fn builder(config: Arc<Config>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            bus: None,
            device: None,
            detector: None,
            transcriber: None,
            responder: None,
            speaker: None,
            sink: None,
        }
    }

    /// The event bus this orchestrator publishes to
    #[must_use]
    pub const fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Current conversation state
    #[must_use]
    pub const fn state(&self) -> &ConversationState {
        &self.state
    }
}

/// Collects the orchestrator's collaborators
pub struct OrchestratorBuilder {
    config: Arc<Config>,
    bus: Option<EventBus>,
    device: Option<Box<dyn AudioDevice>>,
    detector: Option<Box<dyn WakeWordDetector>>,
    transcriber: Option<Arc<dyn TranscriptionPort>>,
    responder: Option<Arc<dyn ResponseGenerator>>,
    speaker: Option<Arc<dyn SpeechPort>>,
    sink: Option<Box<dyn AudioSink>>,
}

impl OrchestratorBuilder {
    /// Publish to an existing bus instead of a new one
    #[must_use]
    pub fn bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Input device
    #[must_use]
    pub fn device(mut self, device: Box<dyn AudioDevice>) -> Self {
        self.device = Some(device);
        self
    }

    /// Wake word detector
    #[must_use]
    pub fn detector(mut self, detector: Box<dyn WakeWordDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    /// Speech-to-text port
    #[must_use]
    pub fn transcriber(mut self, transcriber: Arc<dyn TranscriptionPort>) -> Self {
        self.transcriber = Some(transcriber);
        self
    }

    /// Response generator
    #[must_use]
    pub fn responder(mut self, responder: Arc<dyn ResponseGenerator>) -> Self {
        self.responder = Some(responder);
        self
    }

    /// Text-to-speech port
    #[must_use]
    pub fn speaker(mut self, speaker: Arc<dyn SpeechPort>) -> Self {
        self.speaker = Some(speaker);
        self
    }

    /// Output device
    #[must_use]
    pub fn sink(mut self, sink: Box<dyn AudioSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Assemble the orchestrator and its handle
    ///
    /// # Errors
    ///
    /// Returns error if a collaborator is missing or the config is invalid
    pub fn build(self) -> Result<(Orchestrator, OrchestratorHandle)> {
        fn missing(what: &str) -> Error {
            Error::Config(format!("orchestrator needs a {what}"))
        }

        let config = self.config;
        config.validate()?;

        let device = self.device.ok_or_else(|| missing("audio device"))?;
        let detector = self.detector.ok_or_else(|| missing("wake word detector"))?;
        let transcriber = self.transcriber.ok_or_else(|| missing("transcriber"))?;
        let responder = self.responder.ok_or_else(|| missing("response generator"))?;
        let speaker = self.speaker.ok_or_else(|| missing("speech port"))?;
        let sink = self.sink.ok_or_else(|| missing("audio sink"))?;
        let bus = self
            .bus
            .unwrap_or_else(|| EventBus::new(config.events.queue_depth));

        let state = ConversationState::new(config.conversation.profile_id.clone());
        let (snapshot_tx, snapshot_rx) = watch::channel(state.clone());
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let (task_tx, task_rx) = mpsc::unbounded_channel();

        let orchestrator = Orchestrator {
            engine: ConversationEngine::new(&config.conversation, &config.wake),
            collector: UtteranceCollector::new(config.collector.clone(), config.audio.sample_rate),
            source: Some(AudioSource::new(device, config.audio.clone())),
            gate: Some(WakeWordGate::new(detector, config.audio.frame_period())),
            failures: FailureTracker::new(
                config.orchestrator.escalation_window,
                config.orchestrator.escalation_threshold,
            ),
            bus: bus.clone(),
            state,
            snapshots: snapshot_tx,
            transcriber,
            responder,
            speaker,
            sink: Arc::new(Mutex::new(sink)),
            commands: command_rx,
            task_tx,
            task_rx,
            generation: 0,
            inflight: None,
            config,
        };

        let handle = OrchestratorHandle {
            commands: command_tx,
            snapshots: snapshot_rx,
            bus,
        };

        Ok((orchestrator, handle))
    }
}
