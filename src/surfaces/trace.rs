//! JSON lines trace of every event

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::Surface;
use crate::Result;
use crate::events::AssistantEvent;

#[derive(Serialize)]
struct Record<'a> {
    at: DateTime<Utc>,
    #[serde(flatten)]
    event: &'a AssistantEvent,
}

/// Appends one JSON object per event
///
/// Output is flushed at the end of each exchange and on errors; the writer
/// buffers everything in between.
pub struct TraceSurface<W: Write + Send> {
    out: W,
}

impl TraceSurface<BufWriter<File>> {
    /// Append to the file at `path`, creating it if needed
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be opened
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        tracing::info!(path = %path.display(), "event trace enabled");
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write + Send> TraceSurface<W> {
    /// Trace into `out`
    pub const fn new(out: W) -> Self {
        Self { out }
    }

    /// Recover the writer
    pub fn into_inner(self) -> W {
        self.out
    }
}

#[async_trait]
impl<W: Write + Send> Surface for TraceSurface<W> {
    fn name(&self) -> &str {
        "trace"
    }

    async fn receive(&mut self, event: &AssistantEvent) -> Result<()> {
        let record = Record {
            at: Utc::now(),
            event,
        };
        serde_json::to_writer(&mut self.out, &record)?;
        self.out.write_all(b"\n")?;
        if ends_burst(event) {
            self.out.flush()?;
        }
        Ok(())
    }
}

/// Events after which the trace is likely to stay quiet for a while
const fn ends_burst(event: &AssistantEvent) -> bool {
    matches!(
        event,
        AssistantEvent::SpeechEnded { .. }
            | AssistantEvent::ErrorOccurred { .. }
            | AssistantEvent::SessionStarted { .. }
            | AssistantEvent::UtteranceEnded {
                termination: crate::voice::Termination::FalseWake,
                ..
            }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ErrorKind;

    #[tokio::test]
    async fn writes_one_object_per_line() {
        let mut trace = TraceSurface::new(Vec::new());
        trace.receive(&AssistantEvent::SpeechStarted).await.unwrap();
        trace
            .receive(&AssistantEvent::error(ErrorKind::TranscriptionFailed, "timeout"))
            .await
            .unwrap();

        let out = String::from_utf8(trace.into_inner()).unwrap();
        let lines: Vec<serde_json::Value> = out
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["type"], "speech_started");
        assert!(lines[0]["at"].is_string());
        assert_eq!(lines[1]["type"], "error_occurred");
        assert_eq!(lines[1]["kind"], "transcription_failed");
        assert_eq!(lines[1]["message"], "timeout");
    }

    #[derive(Default)]
    struct CountingWriter {
        buf: Vec<u8>,
        flushes: usize,
    }

    impl Write for CountingWriter {
        fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
            self.buf.write(data)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.flushes += 1;
            Ok(())
        }
    }

    #[tokio::test]
    async fn flushes_only_at_exchange_end() {
        let mut trace = TraceSurface::new(CountingWriter::default());
        trace.receive(&AssistantEvent::UtteranceStarted).await.unwrap();
        trace.receive(&AssistantEvent::SpeechStarted).await.unwrap();
        assert_eq!(trace.out.flushes, 0);

        trace
            .receive(&AssistantEvent::SpeechEnded { interrupted: false })
            .await
            .unwrap();
        assert_eq!(trace.out.flushes, 1);

        let out = trace.into_inner();
        assert_eq!(String::from_utf8(out.buf).unwrap().lines().count(), 3);
    }

    #[tokio::test]
    async fn open_appends_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/trace.jsonl");

        let mut trace = TraceSurface::open(&path).unwrap();
        trace.receive(&AssistantEvent::UtteranceStarted).await.unwrap();
        drop(trace);
        let mut trace = TraceSurface::open(&path).unwrap();
        trace.receive(&AssistantEvent::SpeechStarted).await.unwrap();
        drop(trace);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
