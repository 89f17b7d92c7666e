//! Vocal Assistant - real-time orchestration core for a voice assistant
//!
//! This library turns continuously arriving microphone audio into triggered
//! interactions (wake word, listen, transcribe, answer, speak) while keeping
//! any number of presentation surfaces in sync with one conversation state:
//! - Capture and wake word gating that never block on slow backends
//! - Utterance collection with silence, timeout and false-wake detection
//! - A deterministic conversation engine with bounded history
//! - An event bus with bounded per-subscriber queues
//! - Barge-in, cancellation and failure escalation in the orchestrator
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   frames   ┌──────────────┐  gated frames
//! │ AudioSource  ├───────────►│ WakeWordGate ├──────────────┐
//! └──────────────┘            └──────────────┘              │
//!                                                           ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Orchestrator                            │
//! │  UtteranceCollector │ ConversationEngine │ generation + cancel   │
//! └───────┬──────────────────────┬──────────────────────┬────────────┘
//!         │ spawn                │ spawn                │ publish
//! ┌───────▼────────┐   ┌─────────▼─────────┐   ┌────────▼────────┐
//! │ Transcription  │   │ ResponseGenerator │   │    EventBus     │
//! │ Speech / Sink  │   │                   │   │ console, epaper │
//! └────────────────┘   └───────────────────┘   │ trace, ...      │
//!                                              └─────────────────┘
//! ```

pub mod config;
pub mod conversation;
pub mod daemon;
pub mod error;
pub mod events;
pub mod mock;
pub mod orchestrator;
pub mod surfaces;
pub mod voice;

pub use config::Config;
pub use daemon::Daemon;
pub use error::{Error, Result};
pub use events::{AssistantEvent, ErrorKind, EventBus};
pub use orchestrator::{Halt, Orchestrator, OrchestratorHandle};
