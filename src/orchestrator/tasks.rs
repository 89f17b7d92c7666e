//! Slow port calls, each on its own task
//!
//! Every task carries the generation it was started under and a cancellation
//! token. A cancelled task reports nothing; a result that arrives after the
//! orchestrator has moved on is recognized by its stale generation.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::conversation::{ReplyRequest, ResponseGenerator};
use crate::voice::{AudioSink, SpeechPort, Transcript, TranscriptionPort, Utterance};

/// Completion report from a background task
#[derive(Debug)]
pub enum TaskEvent {
    Transcribed {
        generation: u64,
        result: Result<Transcript>,
    },
    Replied {
        generation: u64,
        transcript: Transcript,
        result: Result<String>,
    },
    SpeechFinished {
        generation: u64,
        frames: usize,
        result: Result<()>,
    },
}

impl TaskEvent {
    pub const fn generation(&self) -> u64 {
        match self {
            Self::Transcribed { generation, .. }
            | Self::Replied { generation, .. }
            | Self::SpeechFinished { generation, .. } => *generation,
        }
    }
}

pub type SharedSink = Arc<Mutex<Box<dyn AudioSink>>>;

pub fn spawn_transcription(
    port: Arc<dyn TranscriptionPort>,
    utterance: Arc<Utterance>,
    generation: u64,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<TaskEvent>,
) {
    tokio::spawn(async move {
        let id = utterance.id();
        let result = tokio::select! {
            () = cancel.cancelled() => {
                tracing::debug!(utterance = %id, generation, "transcription cancelled");
                return;
            }
            r = port.transcribe(utterance) => r,
        };
        let _ = tx.send(TaskEvent::Transcribed { generation, result });
    });
}

pub fn spawn_reply(
    responder: Arc<dyn ResponseGenerator>,
    request: ReplyRequest,
    transcript: Transcript,
    generation: u64,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<TaskEvent>,
) {
    tokio::spawn(async move {
        let result = tokio::select! {
            () = cancel.cancelled() => {
                tracing::debug!(generation, "reply generation cancelled");
                return;
            }
            r = responder.generate(&request) => r,
        };
        let _ = tx.send(TaskEvent::Replied {
            generation,
            transcript,
            result,
        });
    });
}

/// Synthesize and play `text`, checking for cancellation between chunks
///
/// Completion is reported once the sink has played the last sample.
pub fn spawn_speech(
    speaker: Arc<dyn SpeechPort>,
    sink: SharedSink,
    text: String,
    generation: u64,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<TaskEvent>,
) {
    tokio::spawn(async move {
        let mut frames = 0usize;
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            r = play_all(speaker.as_ref(), &sink, &text, &mut frames) => Some(r),
        };

        match result {
            Some(result) => {
                let _ = tx.send(TaskEvent::SpeechFinished {
                    generation,
                    frames,
                    result,
                });
            }
            None => {
                sink.lock().await.flush();
                tracing::debug!(generation, frames, "speech cancelled");
            }
        }
    });
}

async fn play_all(
    speaker: &dyn SpeechPort,
    sink: &SharedSink,
    text: &str,
    frames: &mut usize,
) -> Result<()> {
    let mut stream = speaker.synthesize(text).await?;
    while let Some(frame) = stream.next().await {
        sink.lock().await.play(frame?).await?;
        *frames += 1;
    }
    sink.lock().await.drain().await
}
