//! Assistant events and the fan-out bus that carries them
//!
//! Every state change of the orchestrator is published as an
//! [`AssistantEvent`]. Surfaces subscribe through [`EventBus::subscribe`]
//! and receive events in emission order on their own bounded queue.

mod bus;

pub use bus::{EventBus, EventReceiver, SubscriberId, Subscription};

use serde::Serialize;

use crate::voice::Termination;

/// Runtime failure taxonomy reported to surfaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Input device stopped producing frames
    DeviceStall,
    /// Wake trigger followed by silence (informational)
    FalseWake,
    /// Transcription port failed
    TranscriptionFailed,
    /// Speech port failed
    SynthesisFailed,
    /// Response generator failed
    ResponseFailed,
    /// A subscriber queue overflowed
    SubscriberOverflow,
    /// Repeated failures halted the main loop
    Escalated,
}

impl ErrorKind {
    /// Whether repeated occurrences count toward escalation
    #[must_use]
    pub const fn escalates(self) -> bool {
        matches!(
            self,
            Self::TranscriptionFailed | Self::SynthesisFailed | Self::ResponseFailed
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::DeviceStall => "device stall",
            Self::FalseWake => "false wake",
            Self::TranscriptionFailed => "transcription failed",
            Self::SynthesisFailed => "synthesis failed",
            Self::ResponseFailed => "response failed",
            Self::SubscriberOverflow => "subscriber overflow",
            Self::Escalated => "escalated",
        };
        f.write_str(s)
    }
}

/// State-change notification broadcast to every subscriber
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistantEvent {
    /// Wake word detected on the input stream
    WakeDetected { confidence: f32 },
    /// Collection of a new utterance began
    UtteranceStarted,
    /// Collection ended
    UtteranceEnded {
        termination: Termination,
        duration_ms: u64,
    },
    /// Transcript accepted for processing
    TranscriptReady { text: String, confidence: f32 },
    /// Response text produced; `recorded` is false for clarifications
    ResponseReady { text: String, recorded: bool },
    /// Playback of the response began
    SpeechStarted,
    /// Playback ended, either completed or cut off by barge-in
    SpeechEnded { interrupted: bool },
    /// A failure occurred
    ErrorOccurred { kind: ErrorKind, message: String },
    /// Events were dropped from this subscriber's queue
    OverflowDropped { dropped: u64 },
    /// Conversation history was reset
    SessionStarted { session_id: String },
}

impl AssistantEvent {
    /// Short event name for logs and traces
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::WakeDetected { .. } => "wake_detected",
            Self::UtteranceStarted => "utterance_started",
            Self::UtteranceEnded { .. } => "utterance_ended",
            Self::TranscriptReady { .. } => "transcript_ready",
            Self::ResponseReady { .. } => "response_ready",
            Self::SpeechStarted => "speech_started",
            Self::SpeechEnded { .. } => "speech_ended",
            Self::ErrorOccurred { .. } => "error_occurred",
            Self::OverflowDropped { .. } => "overflow_dropped",
            Self::SessionStarted { .. } => "session_started",
        }
    }

    pub(crate) fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::ErrorOccurred {
            kind,
            message: message.into(),
        }
    }
}
