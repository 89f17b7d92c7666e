//! Text-to-speech (TTS) processing
//!
//! Synthesis is exposed as a lazy stream of frames so playback can start
//! before the whole reply is synthesized. Dropping the stream cancels any
//! request still in flight.

use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use secrecy::{ExposeSecret, SecretString};

use super::AudioFrame;
use crate::{Error, Result};

/// Sample rate of decoded TTS audio
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

/// Samples per synthesized frame (100 ms)
const SYNTH_FRAME_SAMPLES: usize = 2_400;

/// Lazily produced playable frames
pub type FrameStream = BoxStream<'static, Result<AudioFrame>>;

/// Text-to-speech port
#[async_trait]
pub trait SpeechPort: Send + Sync {
    /// Start synthesizing `text`
    ///
    /// # Errors
    ///
    /// Returns error if synthesis cannot start; later failures arrive as
    /// `Err` items in the stream
    async fn synthesize(&self, text: &str) -> Result<FrameStream>;
}

/// TTS provider backend
#[derive(Clone, Copy, Debug)]
enum TtsProvider {
    OpenAI,
    ElevenLabs,
}

struct SpeechClient {
    client: reqwest::Client,
    api_key: SecretString,
    voice: String,
    speed: f32,
    model: String,
    provider: TtsProvider,
}

/// Cloud speech synthesis (`OpenAI` or `ElevenLabs`), sentence by sentence
#[derive(Clone)]
pub struct CloudSpeech {
    inner: Arc<SpeechClient>,
}

impl CloudSpeech {
    /// Create a synthesizer using `OpenAI`
    ///
    /// # Errors
    ///
    /// Returns error if the API key is empty
    pub fn new_openai(api_key: SecretString, voice: String, speed: f32, model: String) -> Result<Self> {
        if api_key.expose_secret().is_empty() {
            return Err(Error::Config("OpenAI API key required for TTS".to_string()));
        }
        Ok(Self::build(api_key, voice, speed, model, TtsProvider::OpenAI))
    }

    /// Create a synthesizer using `ElevenLabs`
    ///
    /// # Errors
    ///
    /// Returns error if the API key is empty
    pub fn new_elevenlabs(api_key: SecretString, voice_id: String, model: String) -> Result<Self> {
        if api_key.expose_secret().is_empty() {
            return Err(Error::Config(
                "ElevenLabs API key required for TTS".to_string(),
            ));
        }
        Ok(Self::build(api_key, voice_id, 1.0, model, TtsProvider::ElevenLabs))
    }

    fn build(
        api_key: SecretString,
        voice: String,
        speed: f32,
        model: String,
        provider: TtsProvider,
    ) -> Self {
        Self {
            inner: Arc::new(SpeechClient {
                client: reqwest::Client::new(),
                api_key,
                voice,
                speed: speed.clamp(0.25, 4.0),
                model,
                provider,
            }),
        }
    }
}

impl SpeechClient {
    async fn synthesize_mp3(&self, text: &str) -> Result<Vec<u8>> {
        match self.provider {
            TtsProvider::OpenAI => self.synthesize_openai(text).await,
            TtsProvider::ElevenLabs => self.synthesize_elevenlabs(text).await,
        }
    }

    /// Synthesize using `OpenAI` TTS
    async fn synthesize_openai(&self, text: &str) -> Result<Vec<u8>> {
        #[derive(serde::Serialize)]
        struct TtsRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            speed: f32,
        }

        let request = TtsRequest {
            model: &self.model,
            input: text,
            voice: &self.voice,
            speed: self.speed,
        };

        let response = self
            .client
            .post("https://api.openai.com/v1/audio/speech")
            .bearer_auth(self.api_key.expose_secret())
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("OpenAI TTS error {status}: {body}")));
        }

        Ok(response.bytes().await?.to_vec())
    }

    /// Synthesize using `ElevenLabs` TTS
    async fn synthesize_elevenlabs(&self, text: &str) -> Result<Vec<u8>> {
        #[derive(serde::Serialize)]
        struct ElevenLabsRequest<'a> {
            text: &'a str,
            model_id: &'a str,
        }

        let url = format!(
            "https://api.elevenlabs.io/v1/text-to-speech/{}",
            self.voice
        );

        let response = self
            .client
            .post(&url)
            .header("xi-api-key", self.api_key.expose_secret())
            .json(&ElevenLabsRequest {
                text,
                model_id: &self.model,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("ElevenLabs TTS error {status}: {body}")));
        }

        Ok(response.bytes().await?.to_vec())
    }
}

struct SynthState {
    client: Arc<SpeechClient>,
    sentences: VecDeque<String>,
    pending: VecDeque<AudioFrame>,
    seq: u64,
    failed: bool,
}

#[async_trait]
impl SpeechPort for CloudSpeech {
    async fn synthesize(&self, text: &str) -> Result<FrameStream> {
        let sentences: VecDeque<String> = split_sentences(text).into();
        if sentences.is_empty() {
            return Err(Error::Tts("nothing to synthesize".to_string()));
        }
        tracing::debug!(sentences = sentences.len(), provider = ?self.inner.provider, "starting synthesis");

        let state = SynthState {
            client: Arc::clone(&self.inner),
            sentences,
            pending: VecDeque::new(),
            seq: 0,
            failed: false,
        };

        Ok(stream::unfold(state, |mut state| async move {
            loop {
                if state.failed {
                    return None;
                }
                if let Some(frame) = state.pending.pop_front() {
                    return Some((Ok(frame), state));
                }
                let sentence = state.sentences.pop_front()?;

                let decoded = match state.client.synthesize_mp3(&sentence).await {
                    Ok(mp3) => decode_mp3(&mp3),
                    Err(e) => Err(e),
                };
                match decoded {
                    Ok(samples) => {
                        for chunk in samples.chunks(SYNTH_FRAME_SAMPLES) {
                            state
                                .pending
                                .push_back(AudioFrame::new(state.seq, PLAYBACK_SAMPLE_RATE, chunk));
                            state.seq += 1;
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "sentence synthesis failed");
                        state.failed = true;
                        return Some((Err(e), state));
                    }
                }
            }
        })
        .boxed())
    }
}

/// Split a reply into sentences, keeping terminal punctuation
#[must_use]
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();

    for c in text.chars() {
        current.push(c);
        if matches!(c, '.' | '!' | '?' | '…' | ';' | '\n') {
            let sentence = current.trim();
            if !sentence.is_empty() {
                sentences.push(sentence.to_string());
            }
            current.clear();
        }
    }

    let rest = current.trim();
    if !rest.is_empty() {
        sentences.push(rest.to_string());
    }
    sentences
}

/// Decode MP3 bytes to mono f32 samples
///
/// # Errors
///
/// Returns error if the stream is not valid MP3
pub fn decode_mp3(mp3_data: &[u8]) -> Result<Vec<f32>> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                let channels = frame.channels.max(1);
                samples.extend(frame.data.chunks(channels).map(mix_to_mono));
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Tts(format!("MP3 decode error: {e}"))),
        }
    }

    Ok(samples)
}

/// Average one interleaved i16 frame into a mono sample
#[allow(clippy::cast_precision_loss)]
fn mix_to_mono(chunk: &[i16]) -> f32 {
    let sum: f32 = chunk.iter().map(|&s| f32::from(s) / 32768.0).sum();
    sum / chunk.len() as f32
}
