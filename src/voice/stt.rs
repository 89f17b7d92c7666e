//! Speech-to-text (STT) processing

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};

use super::{Utterance, samples_to_wav};
use crate::{Error, Result};

/// Recognized text for one utterance
#[derive(Debug, Clone)]
pub struct Transcript {
    /// Recognized text
    pub text: String,
    /// Recognition confidence in `[0, 1]`
    pub confidence: f32,
    /// When the transcript was produced; becomes the turn timestamp
    pub produced_at: DateTime<Utc>,
    /// Source utterance, kept for diagnostics only
    pub source: Weak<Utterance>,
}

impl Transcript {
    /// Build a transcript produced now
    #[must_use]
    pub fn new(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence: confidence.clamp(0.0, 1.0),
            produced_at: Utc::now(),
            source: Weak::new(),
        }
    }

    /// Attach the source utterance
    #[must_use]
    pub fn with_source(mut self, utterance: &Arc<Utterance>) -> Self {
        self.source = Arc::downgrade(utterance);
        self
    }
}

/// Speech-to-text port
///
/// Calls may take arbitrarily long; the orchestrator runs them on their own
/// task and drops the future on barge-in.
#[async_trait]
pub trait TranscriptionPort: Send + Sync {
    /// Transcribe a finalized utterance
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails
    async fn transcribe(&self, utterance: Arc<Utterance>) -> Result<Transcript>;
}

/// Response from `OpenAI` Whisper (`verbose_json`)
#[derive(serde::Deserialize)]
struct WhisperResponse {
    text: String,
    #[serde(default)]
    segments: Vec<WhisperSegment>,
}

#[derive(serde::Deserialize)]
struct WhisperSegment {
    avg_logprob: f32,
    no_speech_prob: f32,
}

/// Response from Deepgram transcription API
#[derive(serde::Deserialize)]
struct DeepgramResponse {
    results: DeepgramResults,
}

#[derive(serde::Deserialize)]
struct DeepgramResults {
    channels: Vec<DeepgramChannel>,
}

#[derive(serde::Deserialize)]
struct DeepgramChannel {
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(serde::Deserialize)]
struct DeepgramAlternative {
    transcript: String,
    #[serde(default)]
    confidence: f32,
}

/// STT provider backend
#[derive(Clone, Copy, Debug)]
enum SttProvider {
    Whisper,
    Deepgram,
}

/// Cloud transcriber (`OpenAI` Whisper or Deepgram)
pub struct WhisperTranscriber {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    language: String,
    provider: SttProvider,
}

impl WhisperTranscriber {
    /// Create a transcriber using `OpenAI` Whisper
    ///
    /// # Errors
    ///
    /// Returns error if the API key is empty
    pub fn new_whisper(api_key: SecretString, model: String, language: String) -> Result<Self> {
        Self::new(api_key, model, language, SttProvider::Whisper)
    }

    /// Create a transcriber using Deepgram
    ///
    /// # Errors
    ///
    /// Returns error if the API key is empty
    pub fn new_deepgram(api_key: SecretString, model: String, language: String) -> Result<Self> {
        Self::new(api_key, model, language, SttProvider::Deepgram)
    }

    fn new(
        api_key: SecretString,
        model: String,
        language: String,
        provider: SttProvider,
    ) -> Result<Self> {
        if api_key.expose_secret().is_empty() {
            return Err(Error::Config(format!("{provider:?} API key required")));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            language,
            provider,
        })
    }

    /// Transcribe using `OpenAI` Whisper
    async fn transcribe_whisper(&self, audio: Vec<u8>) -> Result<(String, f32)> {
        tracing::debug!(audio_bytes = audio.len(), "starting Whisper transcription");

        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(audio)
                    .file_name("audio.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| Error::Stt(e.to_string()))?,
            )
            .text("model", self.model.clone())
            .text("language", self.language.clone())
            .text("response_format", "verbose_json");

        let response = self
            .client
            .post("https://api.openai.com/v1/audio/transcriptions")
            .bearer_auth(self.api_key.expose_secret())
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Whisper request failed");
                e
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Whisper API error");
            return Err(Error::Stt(format!("Whisper API error {status}: {body}")));
        }

        let result: WhisperResponse = response.json().await?;
        let confidence = whisper_confidence(&result.text, &result.segments);
        Ok((result.text.trim().to_string(), confidence))
    }

    /// Transcribe using Deepgram
    async fn transcribe_deepgram(&self, audio: Vec<u8>) -> Result<(String, f32)> {
        tracing::debug!(audio_bytes = audio.len(), "starting Deepgram transcription");

        let url = format!(
            "https://api.deepgram.com/v1/listen?model={}&language={}&punctuate=true",
            self.model, self.language
        );

        let response = self
            .client
            .post(&url)
            .header(
                "Authorization",
                format!("Token {}", self.api_key.expose_secret()),
            )
            .header("Content-Type", "audio/wav")
            .body(audio)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Deepgram request failed");
                e
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Deepgram API error");
            return Err(Error::Stt(format!("Deepgram API error {status}: {body}")));
        }

        let result: DeepgramResponse = response.json().await?;
        Ok(result
            .results
            .channels
            .first()
            .and_then(|c| c.alternatives.first())
            .map(|a| (a.transcript.trim().to_string(), a.confidence))
            .unwrap_or_default())
    }
}

#[async_trait]
impl TranscriptionPort for WhisperTranscriber {
    async fn transcribe(&self, utterance: Arc<Utterance>) -> Result<Transcript> {
        let audio = samples_to_wav(&utterance.samples(), utterance.sample_rate())?;

        let (text, confidence) = match self.provider {
            SttProvider::Whisper => self.transcribe_whisper(audio).await?,
            SttProvider::Deepgram => self.transcribe_deepgram(audio).await?,
        };

        tracing::info!(utterance = %utterance.id(), transcript = %text, confidence, "transcription complete");
        Ok(Transcript::new(text, confidence).with_source(&utterance))
    }
}

/// Estimate confidence from Whisper segment statistics
///
/// Mean over segments of `exp(avg_logprob) * (1 - no_speech_prob)`.
#[allow(clippy::cast_precision_loss)]
fn whisper_confidence(text: &str, segments: &[WhisperSegment]) -> f32 {
    if text.trim().is_empty() {
        return 0.0;
    }
    if segments.is_empty() {
        return 1.0;
    }
    let total: f32 = segments
        .iter()
        .map(|s| s.avg_logprob.exp() * (1.0 - s.no_speech_prob))
        .sum();
    (total / segments.len() as f32).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whisper_confidence() {
        assert!(whisper_confidence("", &[]).abs() < f32::EPSILON);
        assert!((whisper_confidence("bonjour", &[]) - 1.0).abs() < f32::EPSILON);

        let confident = [WhisperSegment {
            avg_logprob: -0.1,
            no_speech_prob: 0.01,
        }];
        let doubtful = [WhisperSegment {
            avg_logprob: -1.5,
            no_speech_prob: 0.6,
        }];
        assert!(whisper_confidence("bonjour", &confident) > 0.85);
        assert!(whisper_confidence("bonjour", &doubtful) < 0.2);
    }

    #[test]
    fn test_parse_deepgram_response() {
        let body = r#"{"results":{"channels":[{"alternatives":[{"transcript":"quelle heure est-il","confidence":0.93}]}]}}"#;
        let parsed: DeepgramResponse = serde_json::from_str(body).unwrap();
        let alt = &parsed.results.channels[0].alternatives[0];
        assert_eq!(alt.transcript, "quelle heure est-il");
        assert!((alt.confidence - 0.93).abs() < 1e-6);
    }

    #[test]
    fn test_empty_key_rejected() {
        let result = WhisperTranscriber::new_whisper(
            SecretString::from(String::new()),
            "whisper-1".to_string(),
            "fr".to_string(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_transcript_confidence_clamped() {
        assert!((Transcript::new("x", 1.7).confidence - 1.0).abs() < f32::EPSILON);
        assert!(Transcript::new("x", 0.5).source.upgrade().is_none());
    }
}
