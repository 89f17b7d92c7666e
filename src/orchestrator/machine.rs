//! Main loop and transition handlers

use std::ops::ControlFlow;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::tasks::{self, TaskEvent};
use super::{Command, Halt, Orchestrator};
use crate::Result;
use crate::config::BargeInAction;
use crate::conversation::{Mode, Plan};
use crate::events::{AssistantEvent, ErrorKind};
use crate::voice::{
    CollectorStatus, GatedFrame, SourceEvent, Termination, Transcript, Utterance,
};

type Flow = ControlFlow<Halt>;

impl Orchestrator {
    /// Run until shutdown or escalation
    ///
    /// Spawns capture and wake gating, then processes commands, task results,
    /// device status, gated frames and collection deadlines in that priority.
    ///
    /// # Errors
    ///
    /// Returns error if the orchestrator was already run
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<Halt> {
        let (Some(source), Some(gate)) = (self.source.take(), self.gate.take()) else {
            return Err(crate::Error::Orchestrator("already running".to_string()));
        };

        let depth = self.config.audio.frame_queue_depth;
        let capture = shutdown.child_token();
        let (frame_tx, frame_rx) = mpsc::channel(depth);
        let (gated_tx, mut gated_rx) = mpsc::channel::<GatedFrame>(depth);
        let (status_tx, mut status_rx) = mpsc::channel::<SourceEvent>(8);

        let source_task = source.spawn(frame_tx, status_tx, capture.clone());
        let gate_task = gate.spawn(frame_rx, gated_tx, capture.clone());

        tracing::info!(
            session = %self.state.session_id(),
            profile = self.state.profile_id(),
            "orchestrator started"
        );

        let halt = loop {
            let deadline = self.collector.deadline();
            let flow = tokio::select! {
                biased;
                () = shutdown.cancelled() => break Halt::Shutdown,
                Some(command) = self.commands.recv() => self.handle_command(command),
                Some(event) = self.task_rx.recv() => self.handle_task(event),
                Some(status) = status_rx.recv() => {
                    self.handle_source(status);
                    Flow::Continue(())
                }
                Some(gated) = gated_rx.recv() => self.handle_frame(gated),
                () = sleep_until(deadline) => self.handle_deadline(),
            };
            if let ControlFlow::Break(halt) = flow {
                break halt;
            }
        };

        self.cancel_inflight();
        capture.cancel();
        // Unblock a gate waiting on a full queue
        drop(gated_rx);
        drop(status_rx);
        let _ = tokio::join!(source_task, gate_task);

        tracing::info!(?halt, "orchestrator stopped");
        Ok(halt)
    }

    fn handle_command(&mut self, command: Command) -> Flow {
        match command {
            Command::Activate => self.handle_trigger(None),
            Command::SubmitText(text) => {
                if self.mode() != Mode::Idle {
                    tracing::info!(mode = %self.mode(), "busy, text input dropped");
                    return Flow::Continue(());
                }
                self.begin_pipeline();
                let transcript = Transcript::new(text, 1.0);
                self.transition(
                    Mode::Processing,
                    AssistantEvent::TranscriptReady {
                        text: transcript.text.clone(),
                        confidence: transcript.confidence,
                    },
                );
                self.process_transcript(transcript);
                Flow::Continue(())
            }
            Command::NewSession => {
                if self.mode() != Mode::Idle {
                    tracing::info!(mode = %self.mode(), "new session only allowed while idle");
                    return Flow::Continue(());
                }
                self.state = self.engine.new_session(&self.state);
                self.publish_snapshot();
                tracing::info!(session = %self.state.session_id(), "new session");
                self.bus.publish(&AssistantEvent::SessionStarted {
                    session_id: self.state.session_id().to_string(),
                });
                Flow::Continue(())
            }
        }
    }

    fn handle_frame(&mut self, gated: GatedFrame) -> Flow {
        let GatedFrame { frame, detection } = gated;

        if detection.triggered && self.mode() != Mode::Listening {
            if self.mode() == Mode::Speaking && !self.config.orchestrator.full_duplex_capture {
                tracing::trace!(seq = frame.seq, "trigger during half-duplex playback ignored");
                return Flow::Continue(());
            }
            // The trigger frame carries the wake word itself and is not collected
            return self.handle_trigger(Some(detection.confidence));
        }

        if self.mode() != Mode::Listening {
            return Flow::Continue(());
        }

        match self.collector.push(frame) {
            CollectorStatus::Finalized(utterance) => self.finish_utterance(utterance),
            CollectorStatus::Collecting | CollectorStatus::Idle => Flow::Continue(()),
        }
    }

    /// Wake word (`Some(confidence)`) or push-to-talk (`None`)
    fn handle_trigger(&mut self, confidence: Option<f32>) -> Flow {
        let policy = self.config.orchestrator.barge_in;
        match self.mode() {
            Mode::Idle | Mode::Error => {
                if let Some(confidence) = confidence {
                    self.bus
                        .publish(&AssistantEvent::WakeDetected { confidence });
                }
                self.begin_pipeline();
                self.start_listening();
            }
            Mode::Listening => {
                tracing::trace!("already listening, trigger ignored");
            }
            Mode::Processing => {
                if policy.processing == BargeInAction::Ignore {
                    tracing::debug!("trigger during processing ignored");
                    return Flow::Continue(());
                }
                tracing::info!(generation = self.generation, "barge-in during processing");
                if let Some(confidence) = confidence {
                    self.bus
                        .publish(&AssistantEvent::WakeDetected { confidence });
                }
                self.begin_pipeline();
                self.start_listening();
            }
            Mode::Speaking => {
                if policy.speaking == BargeInAction::Ignore {
                    tracing::debug!("trigger during speech ignored");
                    return Flow::Continue(());
                }
                tracing::info!(generation = self.generation, "barge-in during speech");
                if let Some(confidence) = confidence {
                    self.bus
                        .publish(&AssistantEvent::WakeDetected { confidence });
                }
                self.begin_pipeline();
                self.transition(Mode::Idle, AssistantEvent::SpeechEnded { interrupted: true });
                self.start_listening();
            }
        }
        Flow::Continue(())
    }

    fn handle_deadline(&mut self) -> Flow {
        match self.collector.poll(Instant::now()) {
            Some(utterance) => self.finish_utterance(utterance),
            None => Flow::Continue(()),
        }
    }

    fn handle_source(&self, status: SourceEvent) {
        match status {
            SourceEvent::Stalled { message } => {
                tracing::warn!(error = %message, "audio device stalled");
                self.bus
                    .publish(&AssistantEvent::error(ErrorKind::DeviceStall, message));
            }
            SourceEvent::Recovered => tracing::info!("audio device recovered"),
        }
    }

    fn handle_task(&mut self, event: TaskEvent) -> Flow {
        if event.generation() != self.generation {
            tracing::debug!(
                stale = event.generation(),
                current = self.generation,
                "discarding stale task result"
            );
            return Flow::Continue(());
        }

        match event {
            TaskEvent::Transcribed { result, .. } if self.mode() == Mode::Processing => {
                match result {
                    Ok(transcript) => {
                        self.failures.record_success(ErrorKind::TranscriptionFailed);
                        tracing::info!(text = %transcript.text, confidence = transcript.confidence, "transcript ready");
                        self.bus.publish(&AssistantEvent::TranscriptReady {
                            text: transcript.text.clone(),
                            confidence: transcript.confidence,
                        });
                        self.process_transcript(transcript);
                        Flow::Continue(())
                    }
                    Err(e) => self.fail(ErrorKind::TranscriptionFailed, &e.to_string()),
                }
            }
            TaskEvent::Replied {
                transcript, result, ..
            } if self.mode() == Mode::Processing => match result {
                Ok(reply) => {
                    self.failures.record_success(ErrorKind::ResponseFailed);
                    self.respond(&transcript, Some(&reply));
                    Flow::Continue(())
                }
                Err(e) => self.fail(ErrorKind::ResponseFailed, &e.to_string()),
            },
            TaskEvent::SpeechFinished { result, frames, .. } if self.mode() == Mode::Speaking => {
                match result {
                    Ok(()) => {
                        self.failures.record_success(ErrorKind::SynthesisFailed);
                        tracing::debug!(frames, "speech finished");
                        self.inflight = None;
                        self.transition(Mode::Idle, AssistantEvent::SpeechEnded { interrupted: false });
                        Flow::Continue(())
                    }
                    Err(e) => self.fail(ErrorKind::SynthesisFailed, &e.to_string()),
                }
            }
            other => {
                tracing::debug!(mode = %self.mode(), ?other, "task result does not match mode, discarded");
                Flow::Continue(())
            }
        }
    }

    fn finish_utterance(&mut self, utterance: Utterance) -> Flow {
        let termination = utterance.termination();
        let duration_ms = u64::try_from(utterance.duration().as_millis()).unwrap_or(u64::MAX);

        if termination == Termination::FalseWake {
            tracing::info!("false wake, back to idle");
            self.inflight = None;
            self.transition(
                Mode::Idle,
                AssistantEvent::UtteranceEnded {
                    termination,
                    duration_ms,
                },
            );
            return Flow::Continue(());
        }

        self.transition(
            Mode::Processing,
            AssistantEvent::UtteranceEnded {
                termination,
                duration_ms,
            },
        );

        let cancel = self.inflight_token();
        tasks::spawn_transcription(
            Arc::clone(&self.transcriber),
            Arc::new(utterance),
            self.generation,
            cancel,
            self.task_tx.clone(),
        );
        Flow::Continue(())
    }

    fn process_transcript(&mut self, transcript: Transcript) {
        match self.engine.plan(&self.state, &transcript) {
            Plan::Clarify(_) => {
                tracing::info!(confidence = transcript.confidence, "transcript unusable, asking to repeat");
                self.respond(&transcript, None);
            }
            Plan::Respond(request) => {
                let cancel = self.inflight_token();
                tasks::spawn_reply(
                    Arc::clone(&self.responder),
                    request,
                    transcript,
                    self.generation,
                    cancel,
                    self.task_tx.clone(),
                );
            }
        }
    }

    fn respond(&mut self, transcript: &Transcript, reply: Option<&str>) {
        let transition = self.engine.apply(self.state.clone(), transcript, reply);
        self.state = transition.state;
        if self.engine.needs_trim(&self.state) {
            self.state = self.engine.trim(self.state.clone());
        }
        self.publish_snapshot();

        self.bus.publish(&AssistantEvent::ResponseReady {
            text: transition.response.clone(),
            recorded: transition.recorded,
        });

        self.transition(Mode::Speaking, AssistantEvent::SpeechStarted);
        let cancel = self.inflight_token();
        tasks::spawn_speech(
            Arc::clone(&self.speaker),
            Arc::clone(&self.sink),
            transition.response,
            self.generation,
            cancel,
            self.task_tx.clone(),
        );
    }

    /// Report a failure, then recover to idle or escalate
    fn fail(&mut self, kind: ErrorKind, message: &str) -> Flow {
        tracing::warn!(%kind, error = %message, "pipeline failure");
        self.cancel_inflight();
        self.collector.cancel();
        self.transition(Mode::Error, AssistantEvent::error(kind, message));

        if self.failures.record_failure(kind, Instant::now()) {
            tracing::error!(%kind, "repeated failures, halting");
            self.bus.publish(&AssistantEvent::error(
                ErrorKind::Escalated,
                format!("{kind} repeated {} times", self.config.orchestrator.escalation_threshold),
            ));
            return Flow::Break(Halt::Escalated(kind));
        }

        // ERROR is transient; the ErrorOccurred event already marks it
        self.set_mode(Mode::Idle);
        Flow::Continue(())
    }

    /// New generation: anything still running belongs to the past
    fn begin_pipeline(&mut self) {
        self.cancel_inflight();
        self.generation += 1;
    }

    fn start_listening(&mut self) {
        self.collector.start();
        self.transition(Mode::Listening, AssistantEvent::UtteranceStarted);
    }

    fn inflight_token(&mut self) -> CancellationToken {
        self.inflight.get_or_insert_with(CancellationToken::new).clone()
    }

    fn cancel_inflight(&mut self) {
        if let Some(token) = self.inflight.take() {
            token.cancel();
        }
    }

    const fn mode(&self) -> Mode {
        self.state.mode()
    }

    fn set_mode(&mut self, mode: Mode) {
        if self.state.mode() != mode {
            self.state.set_mode(mode);
            self.publish_snapshot();
        }
    }

    /// Change mode and publish the event that marks the transition
    fn transition(&mut self, mode: Mode, event: AssistantEvent) {
        tracing::debug!(from = %self.mode(), to = %mode, event = event.name(), "transition");
        self.set_mode(mode);
        self.bus.publish(&event);
    }

    fn publish_snapshot(&self) {
        self.snapshots.send_replace(self.state.clone());
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
