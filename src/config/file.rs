//! TOML configuration file loading
//!
//! Supports `~/.config/vocal/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.
//! Durations are expressed in milliseconds.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::BargeInAction;
use crate::Result;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    /// Capture settings
    #[serde(default)]
    pub audio: AudioFileConfig,

    /// Wake word gate settings
    #[serde(default)]
    pub wake: WakeFileConfig,

    /// Utterance collection settings
    #[serde(default)]
    pub collector: CollectorFileConfig,

    /// Conversation engine settings
    #[serde(default)]
    pub conversation: ConversationFileConfig,

    /// Orchestrator settings (barge-in, escalation)
    #[serde(default)]
    pub orchestrator: OrchestratorFileConfig,

    /// Event bus settings
    #[serde(default)]
    pub events: EventsFileConfig,

    /// STT/TTS/LLM backend settings
    #[serde(default)]
    pub backends: BackendFileConfig,

    /// Presentation surfaces
    #[serde(default)]
    pub surfaces: SurfacesFileConfig,
}

/// Capture configuration
#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    pub sample_rate: Option<u32>,
    pub frame_size: Option<usize>,
    pub stall_timeout_ms: Option<u64>,
    pub frame_queue_depth: Option<usize>,
}

/// Wake word gate configuration
#[derive(Debug, Default, Deserialize)]
pub struct WakeFileConfig {
    /// Wake phrases (e.g. `["mario"]`)
    pub phrases: Option<Vec<String>>,
    /// Detector sensitivity in `[0, 1]`
    pub sensitivity: Option<f32>,
    pub window_frames: Option<usize>,
    pub min_active_frames: Option<usize>,
    pub cooldown_frames: Option<usize>,
}

/// Utterance collector configuration
#[derive(Debug, Default, Deserialize)]
pub struct CollectorFileConfig {
    pub silence_threshold: Option<f32>,
    pub silence_timeout_ms: Option<u64>,
    pub max_utterance_ms: Option<u64>,
    pub false_wake_frames: Option<usize>,
    pub energy_window_frames: Option<usize>,
}

/// Conversation engine configuration
#[derive(Debug, Default, Deserialize)]
pub struct ConversationFileConfig {
    pub confidence_threshold: Option<f32>,
    pub clarification: Option<String>,
    pub profile: Option<String>,
    pub system_prompt: Option<String>,
    pub trim_threshold: Option<usize>,
    pub retain_turns: Option<usize>,
}

/// Orchestrator configuration
#[derive(Debug, Default, Deserialize)]
pub struct OrchestratorFileConfig {
    /// Barge-in action while processing
    pub barge_in_processing: Option<BargeInAction>,
    /// Barge-in action while speaking
    pub barge_in_speaking: Option<BargeInAction>,
    /// Whether capture keeps running during playback
    pub full_duplex_capture: Option<bool>,
    pub escalation_window_ms: Option<u64>,
    pub escalation_threshold: Option<u32>,
}

/// Event bus configuration
#[derive(Debug, Default, Deserialize)]
pub struct EventsFileConfig {
    /// Per-subscriber queue depth
    pub queue_depth: Option<usize>,
}

/// Backend configuration
#[derive(Debug, Default, Deserialize)]
pub struct BackendFileConfig {
    pub openai_api_key: Option<String>,
    pub deepgram_api_key: Option<String>,
    pub elevenlabs_api_key: Option<String>,
    pub stt_model: Option<String>,
    pub tts_model: Option<String>,
    pub tts_voice: Option<String>,
    pub tts_speed: Option<f32>,
    pub language: Option<String>,
    pub ollama_url: Option<String>,
    pub llm_model: Option<String>,
}

/// Surface toggles
#[derive(Debug, Default, Deserialize)]
pub struct SurfacesFileConfig {
    pub console: Option<bool>,
    pub epaper: Option<bool>,
    pub trace_path: Option<PathBuf>,
}

/// Default config file location: `~/.config/vocal/config.toml`
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("vocal").join("config.toml"))
}

/// Load the config file from its default location
///
/// A missing or unreadable file yields an empty overlay; a malformed file is
/// logged and ignored so the assistant still starts on defaults.
#[must_use]
pub fn load_config_file() -> ConfigFile {
    let Some(path) = config_file_path() else {
        return ConfigFile::default();
    };

    if !path.exists() {
        tracing::debug!(path = %path.display(), "no config file found");
        return ConfigFile::default();
    }

    match load_from(&path) {
        Ok(fc) => {
            tracing::info!(path = %path.display(), "loaded config file");
            fc
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring invalid config file");
            ConfigFile::default()
        }
    }
}

/// Parse a config file at an explicit path
///
/// # Errors
///
/// Returns error if the file cannot be read or is not valid TOML
pub fn load_from(path: &Path) -> Result<ConfigFile> {
    let raw = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&raw)?)
}
