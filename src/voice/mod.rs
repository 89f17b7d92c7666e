//! Voice processing module
//!
//! Capture, wake word gating, utterance collection, and the speech ports
//! (STT, TTS, playback) with their cloud/cpal implementations.

mod capture;
mod collector;
mod frame;
mod playback;
mod stt;
mod tts;
mod wake_word;

pub use capture::{
    AudioDevice, AudioSource, Backoff, CpalDevice, SourceEvent, list_input_devices,
    samples_to_wav,
};
pub use collector::{CollectorStatus, Termination, Utterance, UtteranceCollector};
pub use frame::AudioFrame;
pub use playback::{AudioSink, CpalSink};
pub use stt::{Transcript, TranscriptionPort, WhisperTranscriber};
pub use tts::{
    CloudSpeech, FrameStream, PLAYBACK_SAMPLE_RATE, SpeechPort, decode_mp3, split_sentences,
};
pub use wake_word::{Detection, EnergyWakeDetector, GatedFrame, WakeWordDetector, WakeWordGate};
