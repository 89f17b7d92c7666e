//! Terminal rendering of assistant events

use std::io::Write;

use async_trait::async_trait;

use super::Surface;
use crate::Result;
use crate::events::{AssistantEvent, ErrorKind};
use crate::voice::Termination;

/// Prints one line per meaningful event
pub struct ConsoleSurface<W: Write + Send> {
    out: W,
}

impl ConsoleSurface<std::io::Stdout> {
    /// Console on stdout
    #[must_use]
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> ConsoleSurface<W> {
    /// Console writing to `out`
    pub const fn new(out: W) -> Self {
        Self { out }
    }

    /// Recover the writer
    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Line shown for an event, if any
fn render(event: &AssistantEvent) -> Option<String> {
    let line = match event {
        AssistantEvent::WakeDetected { .. } => "👂 wake word".to_string(),
        AssistantEvent::UtteranceStarted => "🎤 listening...".to_string(),
        AssistantEvent::UtteranceEnded {
            termination: Termination::FalseWake,
            ..
        } => "💤 nothing heard".to_string(),
        AssistantEvent::UtteranceEnded { duration_ms, .. } => {
            format!(
                "⏳ processing {}.{}s of audio",
                duration_ms / 1000,
                duration_ms % 1000 / 100
            )
        }
        AssistantEvent::TranscriptReady { text, .. } => format!("🧑 {text}"),
        AssistantEvent::ResponseReady { text, .. } => format!("🤖 {text}"),
        AssistantEvent::SpeechEnded { interrupted: true } => "✋ interrupted".to_string(),
        AssistantEvent::ErrorOccurred {
            kind: ErrorKind::Escalated,
            message,
        } => format!("[ERREUR] arrêt: {message}"),
        AssistantEvent::ErrorOccurred { kind, message } => format!("[ERREUR] {kind}: {message}"),
        AssistantEvent::OverflowDropped { dropped } => format!("… {dropped} events skipped"),
        AssistantEvent::SessionStarted { .. } => "🧹 conversation effacée".to_string(),
        AssistantEvent::SpeechStarted | AssistantEvent::SpeechEnded { .. } => return None,
    };
    Some(line)
}

#[async_trait]
impl<W: Write + Send> Surface for ConsoleSurface<W> {
    fn name(&self) -> &str {
        "console"
    }

    async fn receive(&mut self, event: &AssistantEvent) -> Result<()> {
        if let Some(line) = render(event) {
            writeln!(self.out, "{line}")?;
            self.out.flush()?;
        }
        Ok(())
    }
}
