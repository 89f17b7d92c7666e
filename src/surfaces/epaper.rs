//! Compact status panel
//!
//! E-paper refreshes are slow and visible, so the panel only shows a short
//! status line and is redrawn when that line actually changes.

use async_trait::async_trait;

use super::Surface;
use crate::Result;
use crate::events::AssistantEvent;

/// Something that can display a short text
pub trait Panel: Send {
    /// Replace the displayed text
    ///
    /// # Errors
    ///
    /// Returns error if the display cannot be driven
    fn show_text(&mut self, text: &str) -> Result<()>;
}

/// Panel that only logs what it would draw
#[derive(Debug, Default)]
pub struct LogPanel {
    last: Option<String>,
}

impl LogPanel {
    /// Text most recently shown
    #[must_use]
    pub fn last(&self) -> Option<&str> {
        self.last.as_deref()
    }
}

impl Panel for LogPanel {
    fn show_text(&mut self, text: &str) -> Result<()> {
        tracing::info!(panel = "log", text, "panel refresh");
        self.last = Some(text.to_string());
        Ok(())
    }
}

/// Status surface in front of a [`Panel`]
pub struct EpaperSurface<P: Panel> {
    panel: P,
    shown: Option<String>,
    refreshes: usize,
}

impl<P: Panel> EpaperSurface<P> {
    /// Wrap a panel
    pub const fn new(panel: P) -> Self {
        Self {
            panel,
            shown: None,
            refreshes: 0,
        }
    }

    /// Number of redraws so far
    #[must_use]
    pub const fn refreshes(&self) -> usize {
        self.refreshes
    }

    /// The wrapped panel
    pub const fn panel(&self) -> &P {
        &self.panel
    }
}

/// Status line after `event`; `None` keeps the current one
fn status(event: &AssistantEvent) -> Option<String> {
    let text = match event {
        AssistantEvent::UtteranceStarted => "Écoute...".to_string(),
        AssistantEvent::UtteranceEnded { .. } | AssistantEvent::TranscriptReady { .. } => {
            "Réflexion...".to_string()
        }
        AssistantEvent::ResponseReady { text, .. } => truncate(text, 120),
        AssistantEvent::SpeechEnded { interrupted: false }
        | AssistantEvent::SessionStarted { .. } => "En attente".to_string(),
        AssistantEvent::ErrorOccurred { kind, .. } => format!("Erreur: {kind}"),
        AssistantEvent::WakeDetected { .. }
        | AssistantEvent::SpeechStarted
        | AssistantEvent::SpeechEnded { interrupted: true }
        | AssistantEvent::OverflowDropped { .. } => return None,
    };
    Some(text)
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars - 1).collect();
    out.push('…');
    out
}

#[async_trait]
impl<P: Panel> Surface for EpaperSurface<P> {
    fn name(&self) -> &str {
        "epaper"
    }

    async fn receive(&mut self, event: &AssistantEvent) -> Result<()> {
        let Some(text) = status(event) else {
            return Ok(());
        };
        if self.shown.as_deref() == Some(text.as_str()) {
            return Ok(());
        }

        self.panel.show_text(&text)?;
        self.refreshes += 1;
        self.shown = Some(text);
        Ok(())
    }
}
