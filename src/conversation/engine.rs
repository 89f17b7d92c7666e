//! Conversation transition function
//!
//! The engine never performs I/O. [`ConversationEngine::plan`] decides
//! whether a transcript needs a generated reply; the caller obtains it from a
//! [`super::ResponseGenerator`] and hands it to [`ConversationEngine::apply`],
//! which produces the next state deterministically.

use super::{ConversationState, Turn};
use crate::config::{ConversationConfig, WakeConfig};
use crate::voice::Transcript;

/// Input for the response generator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyRequest {
    /// System prompt, if configured
    pub system_prompt: Option<String>,
    /// Prior turns of the session, oldest first
    pub history: Vec<Turn>,
    /// The user's request, wake phrase removed
    pub prompt: String,
    /// Active profile
    pub profile_id: String,
}

/// What the engine needs before it can apply a transcript
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    /// Transcript unusable; answer with this clarification
    Clarify(String),
    /// Ask the response generator, then apply its reply
    Respond(ReplyRequest),
}

/// Outcome of [`ConversationEngine::apply`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// Next state
    pub state: ConversationState,
    /// Text to speak
    pub response: String,
    /// Whether a turn was appended to history
    pub recorded: bool,
}

/// Stateless rules for advancing a conversation
#[derive(Debug, Clone)]
pub struct ConversationEngine {
    confidence_threshold: f32,
    clarification: String,
    wake_phrases: Vec<String>,
    system_prompt: Option<String>,
    trim_threshold: usize,
    retain_turns: usize,
}

impl ConversationEngine {
    /// Build the engine from configuration
    #[must_use]
    pub fn new(conversation: &ConversationConfig, wake: &WakeConfig) -> Self {
        Self {
            confidence_threshold: conversation.confidence_threshold,
            clarification: conversation.clarification.clone(),
            wake_phrases: wake.phrases.clone(),
            system_prompt: conversation.system_prompt.clone(),
            trim_threshold: conversation.trim_threshold,
            retain_turns: conversation.retain_turns.max(1),
        }
    }

    /// Decide how to handle `transcript` without touching the state
    #[must_use]
    pub fn plan(&self, state: &ConversationState, transcript: &Transcript) -> Plan {
        let Some(prompt) = self.usable_prompt(transcript) else {
            return Plan::Clarify(self.clarification.clone());
        };

        Plan::Respond(ReplyRequest {
            system_prompt: self.system_prompt.clone(),
            history: state.history().to_vec(),
            prompt,
            profile_id: state.profile_id().to_string(),
        })
    }

    /// Apply a transcript and its generated reply to the state
    ///
    /// Unusable transcripts, or a missing or blank reply, yield the
    /// clarification response and leave history untouched.
    #[must_use]
    pub fn apply(
        &self,
        mut state: ConversationState,
        transcript: &Transcript,
        reply: Option<&str>,
    ) -> Transition {
        let prompt = self.usable_prompt(transcript);
        let reply = reply.map(str::trim).filter(|r| !r.is_empty());

        match (prompt, reply) {
            (Some(user), Some(assistant)) => {
                state.push_turn(Turn {
                    user,
                    assistant: assistant.to_string(),
                    at: transcript.produced_at,
                });
                Transition {
                    state,
                    response: assistant.to_string(),
                    recorded: true,
                }
            }
            _ => Transition {
                state,
                response: self.clarification.clone(),
                recorded: false,
            },
        }
    }

    /// Whether history has grown past the trim threshold
    #[must_use]
    pub fn needs_trim(&self, state: &ConversationState) -> bool {
        state.history().len() > self.trim_threshold
    }

    /// Drop old turns, always keeping the most recent ones
    #[must_use]
    pub fn trim(&self, mut state: ConversationState) -> ConversationState {
        let before = state.history().len();
        state.retain_recent(self.retain_turns);
        tracing::debug!(
            before,
            after = state.history().len(),
            "conversation history trimmed"
        );
        state
    }

    /// Start a new session: empty history, same profile
    #[must_use]
    pub fn new_session(&self, state: &ConversationState) -> ConversationState {
        state.restart()
    }

    fn usable_prompt(&self, transcript: &Transcript) -> Option<String> {
        if transcript.confidence < self.confidence_threshold {
            return None;
        }
        let prompt = self.strip_wake_phrase(&transcript.text);
        (!prompt.is_empty()).then_some(prompt)
    }

    /// Remove a leading wake phrase ("Mario, quelle heure..." → "quelle heure...")
    fn strip_wake_phrase(&self, text: &str) -> String {
        let trimmed = text.trim();
        let lower = trimmed.to_lowercase();

        for phrase in &self.wake_phrases {
            if phrase.is_empty() || !lower.starts_with(phrase.as_str()) {
                continue;
            }
            // Lowercasing can change byte lengths; only cut on a char boundary
            if let Some(rest) = trimmed.get(phrase.len()..) {
                let at_word_end = rest
                    .chars()
                    .next()
                    .is_none_or(|c| !c.is_alphanumeric());
                if at_word_end {
                    return rest
                        .trim_start_matches(|c: char| c.is_whitespace() || c == ',' || c == '.')
                        .to_string();
                }
            }
        }
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> ConversationEngine {
        ConversationEngine::new(
            &ConversationConfig {
                trim_threshold: 4,
                retain_turns: 2,
                ..ConversationConfig::default()
            },
            &WakeConfig::default(),
        )
    }

    #[test]
    fn test_apply_records_turn() {
        let engine = engine();
        let state = ConversationState::new("default");
        let transcript = Transcript::new("quelle heure est-il", 0.9);

        assert!(matches!(engine.plan(&state, &transcript), Plan::Respond(_)));

        let t = engine.apply(state, &transcript, Some("il est dix heures"));
        assert!(t.recorded);
        assert_eq!(t.response, "il est dix heures");
        assert_eq!(t.state.history().len(), 1);
        assert_eq!(t.state.history()[0].user, "quelle heure est-il");
        assert_eq!(t.state.history()[0].at, transcript.produced_at);
    }

    #[test]
    fn test_apply_is_deterministic() {
        let engine = engine();
        let state = ConversationState::new("default");
        let transcript = Transcript::new("quelle heure est-il", 0.9);

        let a = engine.apply(state.clone(), &transcript, Some("il est dix heures"));
        let b = engine.apply(state, &transcript, Some("il est dix heures"));
        assert_eq!(a, b);
    }

    #[test]
    fn test_low_confidence_clarifies_without_recording() {
        let engine = engine();
        let state = ConversationState::new("default");
        let transcript = Transcript::new("quelle heure", 0.2);

        assert_eq!(
            engine.plan(&state, &transcript),
            Plan::Clarify(ConversationConfig::default().clarification)
        );
        let t = engine.apply(state, &transcript, None);
        assert!(!t.recorded);
        assert!(t.state.history().is_empty());
    }

    #[test]
    fn test_blank_reply_clarifies() {
        let engine = engine();
        let t = engine.apply(
            ConversationState::new("default"),
            &Transcript::new("bonjour", 1.0),
            Some("   "),
        );
        assert!(!t.recorded);
        assert_eq!(t.response, ConversationConfig::default().clarification);
    }

    #[test]
    fn test_strip_wake_phrase() {
        let engine = engine();
        assert_eq!(
            engine.strip_wake_phrase("Mario, quelle heure est-il ?"),
            "quelle heure est-il ?"
        );
        assert_eq!(engine.strip_wake_phrase("Marionnette"), "Marionnette");
        assert_eq!(engine.strip_wake_phrase("mario"), "");
    }

    #[test]
    fn test_wake_phrase_only_clarifies() {
        let engine = engine();
        let state = ConversationState::new("default");
        assert!(matches!(
            engine.plan(&state, &Transcript::new("Mario.", 1.0)),
            Plan::Clarify(_)
        ));
    }

    #[test]
    fn test_trim_keeps_latest_turns() {
        let engine = engine();
        let mut state = ConversationState::new("default");
        for n in 0..5 {
            state = engine
                .apply(state, &Transcript::new(format!("q{n}"), 1.0), Some("a"))
                .state;
        }

        assert!(engine.needs_trim(&state));
        let trimmed = engine.trim(state);
        let users: Vec<_> = trimmed.history().iter().map(|t| t.user.as_str()).collect();
        assert_eq!(users, vec!["q3", "q4"]);
        assert!(!engine.needs_trim(&trimmed));
    }
}
