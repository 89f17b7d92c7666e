//! Conversation state
//!
//! Only the orchestrator and the engine write this; everyone else reads
//! cloned snapshots.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Assistant mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Waiting for a wake trigger
    #[default]
    Idle,
    /// Collecting an utterance
    Listening,
    /// Transcribing and producing a reply
    Processing,
    /// Playing the reply
    Speaking,
    /// Recovering from a failure
    Error,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Processing => "processing",
            Self::Speaking => "speaking",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// One exchange between the user and the assistant
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Turn {
    /// What the user said
    pub user: String,
    /// What the assistant answered
    pub assistant: String,
    /// When the user's words were transcribed
    pub at: DateTime<Utc>,
}

/// Session state: history, mode and profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationState {
    session_id: Uuid,
    started_at: DateTime<Utc>,
    history: Vec<Turn>,
    mode: Mode,
    profile_id: String,
}

impl ConversationState {
    /// Fresh session for `profile_id`
    #[must_use]
    pub fn new(profile_id: impl Into<String>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            started_at: Utc::now(),
            history: Vec::new(),
            mode: Mode::Idle,
            profile_id: profile_id.into(),
        }
    }

    #[must_use]
    pub const fn session_id(&self) -> Uuid {
        self.session_id
    }

    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Turns in the order they happened
    #[must_use]
    pub fn history(&self) -> &[Turn] {
        &self.history
    }

    #[must_use]
    pub const fn mode(&self) -> Mode {
        self.mode
    }

    #[must_use]
    pub fn profile_id(&self) -> &str {
        &self.profile_id
    }

    pub(crate) const fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    pub(crate) fn push_turn(&mut self, turn: Turn) {
        self.history.push(turn);
    }

    /// Drop all but the newest `keep` turns
    pub(crate) fn retain_recent(&mut self, keep: usize) {
        let excess = self.history.len().saturating_sub(keep);
        self.history.drain(..excess);
    }

    /// New session id and empty history; mode and profile carry over
    #[must_use]
    pub(crate) fn restart(&self) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            started_at: Utc::now(),
            history: Vec::new(),
            mode: self.mode,
            profile_id: self.profile_id.clone(),
        }
    }
}
