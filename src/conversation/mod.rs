//! Conversation state and the engine that advances it

mod engine;
mod llm;
mod state;

pub use engine::{ConversationEngine, Plan, ReplyRequest, Transition};
pub use llm::{OllamaResponder, ResponseGenerator};
pub use state::{ConversationState, Mode, Turn};
