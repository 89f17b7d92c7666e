//! Configuration management for the voice assistant
//!
//! Values are resolved with the precedence env > TOML file > default and then
//! frozen: the orchestrator and its components receive an immutable [`Config`]
//! at construction time.

pub mod file;

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::{Error, Result};
use file::ConfigFile;

/// Voice assistant configuration
#[derive(Debug)]
pub struct Config {
    /// Capture settings
    pub audio: AudioConfig,

    /// Wake word gate settings
    pub wake: WakeConfig,

    /// Utterance collection settings
    pub collector: CollectorConfig,

    /// Conversation engine settings
    pub conversation: ConversationConfig,

    /// Barge-in and escalation settings
    pub orchestrator: OrchestratorConfig,

    /// Event bus settings
    pub events: EventsConfig,

    /// STT/TTS/LLM backends
    pub backends: BackendConfig,

    /// Presentation surfaces
    pub surfaces: SurfacesConfig,
}

/// Audio capture configuration
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Capture sample rate in Hz
    pub sample_rate: u32,

    /// Samples per frame
    pub frame_size: usize,

    /// A device read taking longer than this is treated as a stall
    pub stall_timeout: Duration,

    /// First reopen delay after a stall
    pub backoff_base: Duration,

    /// Upper bound on the reopen delay
    pub backoff_cap: Duration,

    /// Capacity of the capture → gate → orchestrator queues
    pub frame_queue_depth: usize,
}

impl AudioConfig {
    /// Wall-clock duration of one frame
    #[must_use]
    pub fn frame_period(&self) -> Duration {
        frame_period(self.frame_size, self.sample_rate)
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            frame_size: 320,
            stall_timeout: Duration::from_millis(500),
            backoff_base: Duration::from_millis(200),
            backoff_cap: Duration::from_secs(5),
            frame_queue_depth: 64,
        }
    }
}

/// Wake word gate configuration
#[derive(Debug, Clone)]
pub struct WakeConfig {
    /// Wake phrases, normalized to lowercase
    pub phrases: Vec<String>,

    /// Detector sensitivity in `[0, 1]`; higher triggers more easily
    pub sensitivity: f32,

    /// Sliding window length in frames
    pub window_frames: usize,

    /// Loud frames required inside the window to trigger
    pub min_active_frames: usize,

    /// Frames ignored after a trigger
    pub cooldown_frames: usize,
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            phrases: vec!["mario".to_string()],
            sensitivity: 0.5,
            window_frames: 10,
            min_active_frames: 6,
            cooldown_frames: 50,
        }
    }
}

/// Utterance collector configuration
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// RMS energy below which a frame counts as silence
    pub silence_threshold: f32,

    /// Trailing silence that ends an utterance
    pub silence_timeout: Duration,

    /// Hard cap on utterance length
    pub max_utterance: Duration,

    /// Frames after the trigger that must contain speech, else false wake
    pub false_wake_frames: usize,

    /// Trailing window (in frames) for silence evaluation
    pub energy_window_frames: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            silence_threshold: 0.02,
            silence_timeout: Duration::from_millis(800),
            max_utterance: Duration::from_secs(10),
            false_wake_frames: 25,
            energy_window_frames: 5,
        }
    }
}

/// Conversation engine configuration
#[derive(Debug, Clone)]
pub struct ConversationConfig {
    /// Transcripts below this confidence get a clarification response
    pub confidence_threshold: f32,

    /// Response used when the transcript is unusable
    pub clarification: String,

    /// Active user profile
    pub profile_id: String,

    /// System prompt forwarded to the language model
    pub system_prompt: Option<String>,

    /// History length that triggers trimming
    pub trim_threshold: usize,

    /// Turns kept after trimming
    pub retain_turns: usize,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            clarification: "Désolé, je n'ai pas compris. Pouvez-vous répéter ?".to_string(),
            profile_id: "default".to_string(),
            system_prompt: Some(DEFAULT_SYSTEM_PROMPT.to_string()),
            trim_threshold: 50,
            retain_turns: 20,
        }
    }
}

/// Default system prompt for spoken replies
const DEFAULT_SYSTEM_PROMPT: &str = "Tu es un assistant vocal. Réponds en une ou deux phrases \
courtes, sans mise en forme, car ta réponse sera lue à voix haute.";

/// What to do with a wake trigger that arrives while busy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BargeInAction {
    /// Drop the trigger
    Ignore,
    /// Cancel in-flight work and start listening
    InterruptAndRestart,
}

impl FromStr for BargeInAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "ignore" => Ok(Self::Ignore),
            "interrupt" | "interrupt-and-restart" => Ok(Self::InterruptAndRestart),
            other => Err(Error::Config(format!("unknown barge-in action: {other}"))),
        }
    }
}

/// Barge-in policy per busy state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BargeInPolicy {
    /// Action for triggers during PROCESSING
    pub processing: BargeInAction,
    /// Action for triggers during SPEAKING
    pub speaking: BargeInAction,
}

impl Default for BargeInPolicy {
    fn default() -> Self {
        Self {
            processing: BargeInAction::Ignore,
            speaking: BargeInAction::InterruptAndRestart,
        }
    }
}

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Barge-in policy
    pub barge_in: BargeInPolicy,

    /// Capture and playback can share the device; required for
    /// SPEAKING-state wake triggers
    pub full_duplex_capture: bool,

    /// Rolling window for consecutive-failure escalation
    pub escalation_window: Duration,

    /// Consecutive same-kind failures that halt the main loop
    pub escalation_threshold: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            barge_in: BargeInPolicy::default(),
            full_duplex_capture: false,
            escalation_window: Duration::from_secs(60),
            escalation_threshold: 3,
        }
    }
}

/// Event bus configuration
#[derive(Debug, Clone)]
pub struct EventsConfig {
    /// Per-subscriber queue bound
    pub queue_depth: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { queue_depth: 128 }
    }
}

/// STT/TTS/LLM backend configuration
#[derive(Debug)]
pub struct BackendConfig {
    /// `OpenAI` API key (Whisper and TTS)
    pub openai_api_key: Option<SecretString>,

    /// Deepgram API key (optional STT)
    pub deepgram_api_key: Option<SecretString>,

    /// `ElevenLabs` API key (optional TTS)
    pub elevenlabs_api_key: Option<SecretString>,

    /// STT model (e.g. "whisper-1", "nova-2")
    pub stt_model: String,

    /// TTS model (e.g. "tts-1")
    pub tts_model: String,

    /// TTS voice identifier
    pub tts_voice: String,

    /// TTS speed multiplier (0.25 to 4.0)
    pub tts_speed: f32,

    /// Spoken language hint (ISO 639-1)
    pub language: String,

    /// Ollama base URL
    pub ollama_url: String,

    /// Ollama model name
    pub llm_model: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            openai_api_key: None,
            deepgram_api_key: None,
            elevenlabs_api_key: None,
            stt_model: "whisper-1".to_string(),
            tts_model: "tts-1".to_string(),
            tts_voice: "alloy".to_string(),
            tts_speed: 1.0,
            language: "fr".to_string(),
            ollama_url: "http://localhost:11434".to_string(),
            llm_model: "qwen3-coder".to_string(),
        }
    }
}

/// Presentation surface toggles
#[derive(Debug, Clone)]
pub struct SurfacesConfig {
    /// Print events to the terminal
    pub console: bool,

    /// Drive the e-paper status panel
    pub epaper: bool,

    /// Write a JSON-lines event trace here
    pub trace_path: Option<PathBuf>,
}

impl Default for SurfacesConfig {
    fn default() -> Self {
        Self {
            console: true,
            epaper: false,
            trace_path: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            wake: WakeConfig::default(),
            collector: CollectorConfig::default(),
            conversation: ConversationConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            events: EventsConfig::default(),
            backends: BackendConfig::default(),
            surfaces: SurfacesConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the process environment and the config file
    ///
    /// # Errors
    ///
    /// Returns error if a value is malformed or fails validation
    pub fn load() -> Result<Self> {
        Self::from_sources(file::load_config_file(), |key| std::env::var(key).ok())
    }

    /// Resolve configuration from an explicit file overlay and env lookup
    ///
    /// # Errors
    ///
    /// Returns error if a value is malformed or fails validation
    #[allow(clippy::too_many_lines)]
    pub fn from_sources(fc: ConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let audio = AudioConfig {
            sample_rate: parse_env(&env, "VOCAL_SAMPLE_RATE")?
                .or(fc.audio.sample_rate)
                .unwrap_or(defaults.audio.sample_rate),
            frame_size: parse_env(&env, "VOCAL_FRAME_SIZE")?
                .or(fc.audio.frame_size)
                .unwrap_or(defaults.audio.frame_size),
            stall_timeout: fc
                .audio
                .stall_timeout_ms
                .map_or(defaults.audio.stall_timeout, Duration::from_millis),
            frame_queue_depth: fc
                .audio
                .frame_queue_depth
                .unwrap_or(defaults.audio.frame_queue_depth),
            ..defaults.audio
        };

        let wake = WakeConfig {
            phrases: env("VOCAL_WAKE_WORDS")
                .map(|s| s.split(',').map(ToString::to_string).collect())
                .or(fc.wake.phrases)
                .unwrap_or(defaults.wake.phrases)
                .into_iter()
                .map(|w| w.trim().to_lowercase())
                .filter(|w| !w.is_empty())
                .collect(),
            sensitivity: parse_env(&env, "VOCAL_WAKE_SENSITIVITY")?
                .or(fc.wake.sensitivity)
                .unwrap_or(defaults.wake.sensitivity),
            window_frames: fc.wake.window_frames.unwrap_or(defaults.wake.window_frames),
            min_active_frames: fc
                .wake
                .min_active_frames
                .unwrap_or(defaults.wake.min_active_frames),
            cooldown_frames: fc.wake.cooldown_frames.unwrap_or(defaults.wake.cooldown_frames),
        };

        let collector = CollectorConfig {
            silence_threshold: fc
                .collector
                .silence_threshold
                .unwrap_or(defaults.collector.silence_threshold),
            silence_timeout: parse_env::<u64>(&env, "VOCAL_SILENCE_TIMEOUT_MS")?
                .or(fc.collector.silence_timeout_ms)
                .map_or(defaults.collector.silence_timeout, Duration::from_millis),
            max_utterance: parse_env::<u64>(&env, "VOCAL_MAX_UTTERANCE_MS")?
                .or(fc.collector.max_utterance_ms)
                .map_or(defaults.collector.max_utterance, Duration::from_millis),
            false_wake_frames: fc
                .collector
                .false_wake_frames
                .unwrap_or(defaults.collector.false_wake_frames),
            energy_window_frames: fc
                .collector
                .energy_window_frames
                .unwrap_or(defaults.collector.energy_window_frames),
        };

        let conversation = ConversationConfig {
            confidence_threshold: parse_env(&env, "VOCAL_CONFIDENCE_THRESHOLD")?
                .or(fc.conversation.confidence_threshold)
                .unwrap_or(defaults.conversation.confidence_threshold),
            clarification: fc
                .conversation
                .clarification
                .unwrap_or(defaults.conversation.clarification),
            profile_id: env("VOCAL_PROFILE")
                .or(fc.conversation.profile)
                .unwrap_or(defaults.conversation.profile_id),
            system_prompt: fc
                .conversation
                .system_prompt
                .or(defaults.conversation.system_prompt),
            trim_threshold: fc
                .conversation
                .trim_threshold
                .unwrap_or(defaults.conversation.trim_threshold),
            retain_turns: fc
                .conversation
                .retain_turns
                .unwrap_or(defaults.conversation.retain_turns),
        };

        let orchestrator = OrchestratorConfig {
            barge_in: BargeInPolicy {
                processing: parse_env(&env, "VOCAL_BARGE_IN_PROCESSING")?
                    .or(fc.orchestrator.barge_in_processing)
                    .unwrap_or(defaults.orchestrator.barge_in.processing),
                speaking: parse_env(&env, "VOCAL_BARGE_IN_SPEAKING")?
                    .or(fc.orchestrator.barge_in_speaking)
                    .unwrap_or(defaults.orchestrator.barge_in.speaking),
            },
            full_duplex_capture: env("VOCAL_FULL_DUPLEX")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .or(fc.orchestrator.full_duplex_capture)
                .unwrap_or(defaults.orchestrator.full_duplex_capture),
            escalation_window: fc
                .orchestrator
                .escalation_window_ms
                .map_or(defaults.orchestrator.escalation_window, Duration::from_millis),
            escalation_threshold: fc
                .orchestrator
                .escalation_threshold
                .unwrap_or(defaults.orchestrator.escalation_threshold),
        };

        let events = EventsConfig {
            queue_depth: parse_env(&env, "VOCAL_EVENT_QUEUE_DEPTH")?
                .or(fc.events.queue_depth)
                .unwrap_or(defaults.events.queue_depth),
        };

        let secret = |key: &str, file_value: Option<String>| {
            env(key).or(file_value).filter(|k| !k.is_empty()).map(SecretString::from)
        };
        let backends = BackendConfig {
            openai_api_key: secret("OPENAI_API_KEY", fc.backends.openai_api_key),
            deepgram_api_key: secret("DEEPGRAM_API_KEY", fc.backends.deepgram_api_key),
            elevenlabs_api_key: secret("ELEVENLABS_API_KEY", fc.backends.elevenlabs_api_key),
            stt_model: env("VOCAL_STT_MODEL")
                .or(fc.backends.stt_model)
                .unwrap_or(defaults.backends.stt_model),
            tts_model: env("VOCAL_TTS_MODEL")
                .or(fc.backends.tts_model)
                .unwrap_or(defaults.backends.tts_model),
            tts_voice: env("VOCAL_TTS_VOICE")
                .or(fc.backends.tts_voice)
                .unwrap_or(defaults.backends.tts_voice),
            tts_speed: fc.backends.tts_speed.unwrap_or(defaults.backends.tts_speed),
            language: env("VOCAL_LANGUAGE")
                .or(fc.backends.language)
                .unwrap_or(defaults.backends.language),
            ollama_url: env("OLLAMA_URL")
                .or(fc.backends.ollama_url)
                .unwrap_or(defaults.backends.ollama_url),
            llm_model: env("VOCAL_LLM_MODEL")
                .or(fc.backends.llm_model)
                .unwrap_or(defaults.backends.llm_model),
        };

        let surfaces = SurfacesConfig {
            console: fc.surfaces.console.unwrap_or(defaults.surfaces.console),
            epaper: fc.surfaces.epaper.unwrap_or(defaults.surfaces.epaper),
            trace_path: env("VOCAL_TRACE_PATH")
                .map(PathBuf::from)
                .or(fc.surfaces.trace_path),
        };

        let config = Self {
            audio,
            wake,
            collector,
            conversation,
            orchestrator,
            events,
            backends,
            surfaces,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would break runtime invariants
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid value
    pub fn validate(&self) -> Result<()> {
        if self.audio.sample_rate == 0 || self.audio.frame_size == 0 {
            return Err(Error::Config("sample rate and frame size must be non-zero".to_string()));
        }
        if self.audio.frame_queue_depth == 0 {
            return Err(Error::Config("frame queue depth must be at least 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.wake.sensitivity) {
            return Err(Error::Config(format!(
                "wake sensitivity must be within [0, 1], got {}",
                self.wake.sensitivity
            )));
        }
        if self.wake.window_frames == 0
            || self.wake.min_active_frames == 0
            || self.wake.min_active_frames > self.wake.window_frames
        {
            return Err(Error::Config(
                "wake min_active_frames must be within 1..=window_frames".to_string(),
            ));
        }
        if self.collector.max_utterance <= self.audio.frame_period() {
            return Err(Error::Config(
                "max utterance duration must exceed one frame period".to_string(),
            ));
        }
        if self.collector.energy_window_frames == 0 {
            return Err(Error::Config("energy window must be at least 1 frame".to_string()));
        }
        if self.conversation.retain_turns == 0
            || self.conversation.retain_turns > self.conversation.trim_threshold
        {
            return Err(Error::Config(
                "retain_turns must be within 1..=trim_threshold".to_string(),
            ));
        }
        if self.events.queue_depth == 0 {
            return Err(Error::Config("event queue depth must be at least 1".to_string()));
        }
        if self.orchestrator.escalation_threshold == 0 {
            return Err(Error::Config("escalation threshold must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Duration covered by `samples` at `sample_rate`
#[must_use]
pub fn frame_period(samples: usize, sample_rate: u32) -> Duration {
    let nanos = (samples as u128 * 1_000_000_000) / u128::from(sample_rate.max(1));
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

/// Parse an optional env value, reporting malformed input
fn parse_env<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>> {
    env(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|_| Error::Config(format!("invalid value for {key}: {raw}")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = Config::from_sources(ConfigFile::default(), |_| None).unwrap();
        assert_eq!(config.audio.frame_period(), Duration::from_millis(20));
        assert_eq!(config.orchestrator.barge_in, BargeInPolicy::default());
        assert_eq!(config.orchestrator.escalation_threshold, 3);
        assert_eq!(config.audio.backoff_base, Duration::from_millis(200));
        assert_eq!(config.audio.backoff_cap, Duration::from_secs(5));
    }

    #[test]
    fn env_overrides_file() {
        let fc: ConfigFile = toml::from_str(
            r#"
            [collector]
            silence_timeout_ms = 1000
            [events]
            queue_depth = 16
            "#,
        )
        .unwrap();
        let env = env_from(&[
            ("VOCAL_SILENCE_TIMEOUT_MS", "400"),
            ("VOCAL_BARGE_IN_SPEAKING", "ignore"),
            ("OPENAI_API_KEY", "sk-test"),
        ]);

        let config = Config::from_sources(fc, env).unwrap();
        assert_eq!(config.collector.silence_timeout, Duration::from_millis(400));
        assert_eq!(config.events.queue_depth, 16);
        assert_eq!(config.orchestrator.barge_in.speaking, BargeInAction::Ignore);
        assert_eq!(
            config
                .backends
                .openai_api_key
                .as_ref()
                .map(|k| k.expose_secret().to_string()),
            Some("sk-test".to_string())
        );
    }

    #[test]
    fn wake_phrases_are_normalized() {
        let env = env_from(&[("VOCAL_WAKE_WORDS", "  Hey MARIO , ,Ordi")]);
        let config = Config::from_sources(ConfigFile::default(), env).unwrap();
        assert_eq!(config.wake.phrases, vec!["hey mario", "ordi"]);
    }

    #[test]
    fn malformed_env_is_an_error() {
        let env = env_from(&[("VOCAL_EVENT_QUEUE_DEPTH", "lots")]);
        let err = Config::from_sources(ConfigFile::default(), env).unwrap_err();
        assert!(err.to_string().contains("VOCAL_EVENT_QUEUE_DEPTH"));
    }

    #[test]
    fn zero_queue_depth_is_rejected() {
        let env = env_from(&[("VOCAL_EVENT_QUEUE_DEPTH", "0")]);
        assert!(Config::from_sources(ConfigFile::default(), env).is_err());
    }

    #[test]
    fn barge_in_action_from_str() {
        assert_eq!("Ignore".parse::<BargeInAction>().unwrap(), BargeInAction::Ignore);
        assert_eq!(
            "interrupt".parse::<BargeInAction>().unwrap(),
            BargeInAction::InterruptAndRestart
        );
        assert!("later".parse::<BargeInAction>().is_err());
    }
}
