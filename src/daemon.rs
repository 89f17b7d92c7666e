//! Daemon - the assistant service
//!
//! Builds the real adapters from configuration, wires them into an
//! [`Orchestrator`], attaches the configured surfaces and runs until ctrl-c,
//! `/quit` on stdin, or an escalated failure.

use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{BackendConfig, SurfacesConfig};
use crate::conversation::OllamaResponder;
use crate::events::EventBus;
use crate::orchestrator::{Halt, Orchestrator, OrchestratorHandle};
use crate::surfaces::{ConsoleSurface, EpaperSurface, LogPanel, Surface, TraceSurface, spawn_surface};
use crate::voice::{
    CloudSpeech, CpalDevice, CpalSink, EnergyWakeDetector, PLAYBACK_SAMPLE_RATE, SpeechPort,
    TranscriptionPort, WhisperTranscriber,
};
use crate::{Config, Error, Result};

/// Deepgram model used when Deepgram handles transcription
const DEEPGRAM_MODEL: &str = "nova-2";

/// `ElevenLabs` voice used when `ElevenLabs` handles synthesis
const ELEVENLABS_VOICE: &str = "21m00Tcm4TlvDq8ikWAM";

/// `ElevenLabs` model supporting French
const ELEVENLABS_MODEL: &str = "eleven_multilingual_v2";

/// Time given to surfaces to drain the last events before shutdown
const SURFACE_DRAIN: Duration = Duration::from_millis(200);

/// A line typed on stdin
#[derive(Debug, PartialEq, Eq)]
enum Input {
    /// Push-to-talk
    Talk,
    /// Clear the conversation
    Reset,
    /// Stop the daemon
    Quit,
    /// Text to answer
    Text(String),
}

fn parse_input(line: &str) -> Option<Input> {
    let line = line.trim();
    match line {
        "" => None,
        "/talk" => Some(Input::Talk),
        "/reset" | "/clear" => Some(Input::Reset),
        "/quit" | "/exit" => Some(Input::Quit),
        text => Some(Input::Text(text.to_string())),
    }
}

/// The voice assistant service
pub struct Daemon {
    config: Arc<Config>,
}

impl Daemon {
    /// Create a daemon from loaded configuration
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Run until shutdown
    ///
    /// # Errors
    ///
    /// Returns error if an adapter cannot be built, a surface cannot be
    /// opened, or repeated failures halt the orchestrator
    pub async fn run(self) -> Result<()> {
        let backends = &self.config.backends;
        let transcriber = build_transcriber(backends)?;
        let speaker = build_speaker(backends)?;

        let (orchestrator, handle) = Orchestrator::builder(Arc::clone(&self.config))
            .device(Box::new(CpalDevice::new(self.config.audio.sample_rate)))
            .detector(Box::new(EnergyWakeDetector::new(&self.config.wake)))
            .transcriber(transcriber)
            .responder(Arc::new(OllamaResponder::new(
                &backends.ollama_url,
                &backends.llm_model,
            )))
            .speaker(speaker)
            .sink(Box::new(CpalSink::new(PLAYBACK_SAMPLE_RATE)))
            .build()?;

        let surfaces = spawn_surfaces(&self.config.surfaces, handle.bus())?;
        tracing::info!(surfaces = surfaces.len(), "surfaces attached");

        let shutdown = CancellationToken::new();
        let input = tokio::spawn(read_stdin(handle.clone(), shutdown.clone()));
        let signal = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("shutdown requested");
                    shutdown.cancel();
                }
            })
        };

        tracing::info!(
            wake_words = ?self.config.wake.phrases,
            profile = %self.config.conversation.profile_id,
            "assistant ready"
        );
        let halt = orchestrator.run(shutdown.clone()).await;

        shutdown.cancel();
        input.abort();
        signal.abort();
        tokio::time::sleep(SURFACE_DRAIN).await;
        for surface in surfaces {
            surface.abort();
        }

        match halt? {
            Halt::Shutdown => {
                tracing::info!("daemon stopped");
                Ok(())
            }
            Halt::Escalated(kind) => Err(Error::Orchestrator(format!(
                "halted after repeated failures: {kind}"
            ))),
        }
    }
}

/// Pick the transcription backend from the configured keys
///
/// # Errors
///
/// Returns error if neither an `OpenAI` nor a Deepgram key is configured
pub fn build_transcriber(backends: &BackendConfig) -> Result<Arc<dyn TranscriptionPort>> {
    if let Some(key) = &backends.openai_api_key {
        tracing::info!(provider = "whisper", model = %backends.stt_model, "transcription backend");
        return Ok(Arc::new(WhisperTranscriber::new_whisper(
            copy_secret(key),
            backends.stt_model.clone(),
            backends.language.clone(),
        )?));
    }
    if let Some(key) = &backends.deepgram_api_key {
        tracing::info!(provider = "deepgram", model = DEEPGRAM_MODEL, "transcription backend");
        return Ok(Arc::new(WhisperTranscriber::new_deepgram(
            copy_secret(key),
            DEEPGRAM_MODEL.to_string(),
            backends.language.clone(),
        )?));
    }
    Err(Error::Config(
        "no transcription backend: set OPENAI_API_KEY or DEEPGRAM_API_KEY".to_string(),
    ))
}

/// Pick the synthesis backend from the configured keys
///
/// # Errors
///
/// Returns error if neither an `OpenAI` nor an `ElevenLabs` key is configured
pub fn build_speaker(backends: &BackendConfig) -> Result<Arc<dyn SpeechPort>> {
    if let Some(key) = &backends.openai_api_key {
        tracing::info!(provider = "openai", voice = %backends.tts_voice, "speech backend");
        return Ok(Arc::new(CloudSpeech::new_openai(
            copy_secret(key),
            backends.tts_voice.clone(),
            backends.tts_speed,
            backends.tts_model.clone(),
        )?));
    }
    if let Some(key) = &backends.elevenlabs_api_key {
        tracing::info!(provider = "elevenlabs", "speech backend");
        return Ok(Arc::new(CloudSpeech::new_elevenlabs(
            copy_secret(key),
            ELEVENLABS_VOICE.to_string(),
            ELEVENLABS_MODEL.to_string(),
        )?));
    }
    Err(Error::Config(
        "no speech backend: set OPENAI_API_KEY or ELEVENLABS_API_KEY".to_string(),
    ))
}

fn copy_secret(key: &SecretString) -> SecretString {
    SecretString::from(key.expose_secret().to_string())
}

/// Attach the surfaces enabled in `config`
///
/// # Errors
///
/// Returns error if the trace file cannot be opened
pub fn spawn_surfaces(config: &SurfacesConfig, bus: &EventBus) -> Result<Vec<JoinHandle<()>>> {
    let mut surfaces: Vec<Box<dyn Surface>> = Vec::new();
    if config.console {
        surfaces.push(Box::new(ConsoleSurface::stdout()));
    }
    if config.epaper {
        surfaces.push(Box::new(EpaperSurface::new(LogPanel::default())));
    }
    if let Some(path) = &config.trace_path {
        surfaces.push(Box::new(TraceSurface::open(path)?));
    }

    Ok(surfaces
        .into_iter()
        .map(|surface| spawn_surface(bus, surface))
        .collect())
}

/// Forward stdin lines to the orchestrator
async fn read_stdin(handle: OrchestratorHandle, shutdown: CancellationToken) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            () = shutdown.cancelled() => return,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                tracing::debug!("stdin closed");
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "stdin read failed");
                return;
            }
        };

        let sent = match parse_input(&line) {
            None => continue,
            Some(Input::Talk) => handle.activate().await,
            Some(Input::Reset) => handle.new_session().await,
            Some(Input::Quit) => {
                shutdown.cancel();
                return;
            }
            Some(Input::Text(text)) => handle.submit_text(text).await,
        };
        if sent.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::AssistantEvent;

    #[test]
    fn test_parse_input() {
        assert_eq!(parse_input("  "), None);
        assert_eq!(parse_input("/talk"), Some(Input::Talk));
        assert_eq!(parse_input("/reset"), Some(Input::Reset));
        assert_eq!(parse_input("/clear\n"), Some(Input::Reset));
        assert_eq!(parse_input("/quit"), Some(Input::Quit));
        assert_eq!(
            parse_input(" quelle heure est-il ? "),
            Some(Input::Text("quelle heure est-il ?".to_string()))
        );
    }

    #[test]
    fn backends_require_a_key() {
        let backends = BackendConfig::default();
        assert!(matches!(build_transcriber(&backends), Err(Error::Config(_))));
        assert!(matches!(build_speaker(&backends), Err(Error::Config(_))));
    }

    #[test]
    fn deepgram_and_elevenlabs_are_fallbacks() {
        let backends = BackendConfig {
            deepgram_api_key: Some(SecretString::from("dg-key".to_string())),
            elevenlabs_api_key: Some(SecretString::from("el-key".to_string())),
            ..BackendConfig::default()
        };
        assert!(build_transcriber(&backends).is_ok());
        assert!(build_speaker(&backends).is_ok());
    }

    #[tokio::test]
    async fn trace_surface_follows_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.jsonl");
        let config = SurfacesConfig {
            console: false,
            epaper: true,
            trace_path: Some(path.clone()),
        };
        let bus = EventBus::new(8);

        let handles = spawn_surfaces(&config, &bus).unwrap();
        assert_eq!(handles.len(), 2);
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(&AssistantEvent::SpeechEnded { interrupted: false });
        for _ in 0..200 {
            if std::fs::read_to_string(&path).is_ok_and(|s| s.lines().count() == 1) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("\"type\":\"speech_ended\""));

        for handle in handles {
            handle.abort();
        }
    }
}
