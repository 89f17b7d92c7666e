//! Orchestrator integration tests
//!
//! Runs the full main loop over in-memory ports under a paused clock

use std::time::Duration;

use tokio::time::Instant;
use vocal_assistant::config::BargeInAction;
use vocal_assistant::conversation::Mode;
use vocal_assistant::mock::{FixedResponder, RecordingSink, ScriptedSpeaker, ScriptedTranscriber};
use vocal_assistant::voice::Termination;
use vocal_assistant::{AssistantEvent, ErrorKind, Halt};

mod common;
use common::{Ports, is_error, is_speech_end, names, start, test_config};

#[tokio::test(start_paused = true)]
async fn test_spoken_exchange() {
    let ports = Ports::new(
        ScriptedTranscriber::new().then_text("quelle heure est-il", 0.92),
        "il est dix heures",
    );
    let mut h = start(test_config(), &ports);

    h.say(10).await;
    let events = h.until(is_speech_end).await;

    assert_eq!(
        names(&events),
        vec![
            "utterance_started",
            "utterance_ended",
            "transcript_ready",
            "response_ready",
            "speech_started",
            "speech_ended",
        ]
    );
    assert!(matches!(
        events[1],
        AssistantEvent::UtteranceEnded {
            termination: Termination::SilenceTerminated,
            ..
        }
    ));
    assert!(matches!(
        &events[2],
        AssistantEvent::TranscriptReady { text, .. } if text == "quelle heure est-il"
    ));
    assert_eq!(
        events[3],
        AssistantEvent::ResponseReady {
            text: "il est dix heures".to_string(),
            recorded: true,
        }
    );
    assert_eq!(events[5], AssistantEvent::SpeechEnded { interrupted: false });

    let state = h.handle.snapshot();
    assert_eq!(state.mode(), Mode::Idle);
    assert_eq!(state.history().len(), 1);
    assert_eq!(state.history()[0].user, "quelle heure est-il");
    assert_eq!(state.history()[0].assistant, "il est dix heures");
    assert_eq!(ports.sink.played(), 3);

    // Nothing else happens while idle
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(h.drain().is_empty());

    assert_eq!(h.stop().await, Halt::Shutdown);
}

#[tokio::test(start_paused = true)]
async fn test_wake_word_starts_listening() {
    let ports = Ports::new(
        ScriptedTranscriber::new().then_text("Mario, allume la lumière", 0.9),
        "c'est fait",
    );
    let mut h = start(test_config(), &ports);

    h.feeder.wake();
    h.feeder.speech(10);
    let events = h.until(is_speech_end).await;

    assert_eq!(names(&events)[..2], ["wake_detected", "utterance_started"]);
    // The wake phrase is not part of the recorded turn
    let state = h.handle.snapshot();
    assert_eq!(state.history()[0].user, "allume la lumière");
    assert_eq!(ports.responder.requests()[0].prompt, "allume la lumière");

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_false_wake_returns_to_idle() {
    let ports = Ports::new(ScriptedTranscriber::new(), "unused");
    let mut h = start(test_config(), &ports);

    h.handle.activate().await.unwrap();
    let events = h.until(|e| matches!(e, AssistantEvent::UtteranceEnded { .. })).await;

    assert_eq!(
        events,
        vec![
            AssistantEvent::UtteranceStarted,
            AssistantEvent::UtteranceEnded {
                termination: Termination::FalseWake,
                duration_ms: 0,
            },
        ]
    );
    assert_eq!(h.handle.snapshot().mode(), Mode::Idle);
    assert_eq!(ports.transcriber.calls(), 0);

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_long_utterance_times_out() {
    let mut config = test_config();
    config.collector.max_utterance = Duration::from_secs(1);
    let ports = Ports::new(ScriptedTranscriber::new().then_text("bla bla", 0.9), "d'accord");
    let mut h = start(config, &ports);

    h.say(200).await;
    let events = h.until(|e| matches!(e, AssistantEvent::UtteranceEnded { .. })).await;

    assert!(matches!(
        events.last(),
        Some(AssistantEvent::UtteranceEnded {
            termination: Termination::TimeoutTerminated,
            duration_ms: 1000,
        })
    ));

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_low_confidence_asks_to_repeat() {
    let config = test_config();
    let clarification = config.conversation.clarification.clone();
    let ports = Ports::new(ScriptedTranscriber::new().then_text("hmm", 0.1), "unused");
    let mut h = start(config, &ports);

    h.say(10).await;
    let events = h.until(is_speech_end).await;

    assert!(events.contains(&AssistantEvent::ResponseReady {
        text: clarification,
        recorded: false,
    }));
    assert!(ports.responder.requests().is_empty());
    assert!(h.handle.snapshot().history().is_empty());

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_submit_text() {
    let ports = Ports::new(ScriptedTranscriber::new(), "il est dix heures");
    let mut h = start(test_config(), &ports);

    h.handle.submit_text("quelle heure est-il").await.unwrap();
    let events = h.until(is_speech_end).await;

    assert_eq!(
        names(&events),
        vec!["transcript_ready", "response_ready", "speech_started", "speech_ended"]
    );
    assert!(matches!(
        &events[0],
        AssistantEvent::TranscriptReady { text, confidence }
            if text == "quelle heure est-il" && *confidence > 0.99
    ));
    assert_eq!(ports.transcriber.calls(), 0);
    assert_eq!(ports.responder.requests().len(), 1);

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_new_session_keeps_profile() {
    let mut config = test_config();
    config.conversation.profile_id = "alice".to_string();
    let ports = Ports::new(ScriptedTranscriber::new(), "bonjour");
    let mut h = start(config, &ports);

    h.handle.submit_text("salut").await.unwrap();
    h.until(is_speech_end).await;
    let before = h.handle.snapshot();
    assert_eq!(before.history().len(), 1);

    h.handle.new_session().await.unwrap();
    let events = h.until(|e| matches!(e, AssistantEvent::SessionStarted { .. })).await;

    let after = h.handle.snapshot();
    assert!(after.history().is_empty());
    assert_eq!(after.profile_id(), "alice");
    assert_ne!(after.session_id(), before.session_id());
    assert_eq!(
        events,
        vec![AssistantEvent::SessionStarted {
            session_id: after.session_id().to_string(),
        }]
    );

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_barge_in_interrupts_speech() {
    let mut config = test_config();
    config.orchestrator.full_duplex_capture = true;
    let ports = Ports::new(
        ScriptedTranscriber::new().then_text("raconte une histoire", 0.9),
        "il était une fois",
    )
    .with_speaker(ScriptedSpeaker::new(50, Duration::from_millis(100)));
    let mut h = start(config, &ports);

    h.say(10).await;
    h.until(|e| *e == AssistantEvent::SpeechStarted).await;
    tokio::time::sleep(Duration::from_millis(350)).await;

    h.feeder.wake();
    let events = h.until(|e| *e == AssistantEvent::UtteranceStarted).await;
    assert_eq!(
        names(&events),
        vec!["wake_detected", "speech_ended", "utterance_started"]
    );
    assert_eq!(events[1], AssistantEvent::SpeechEnded { interrupted: true });
    assert_eq!(h.handle.snapshot().mode(), Mode::Listening);

    // Synthesis stops within one chunk and nothing late shows up
    let yielded = ports.speaker.yielded();
    assert!(yielded < 50);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(ports.speaker.yielded() <= yielded + 1);
    assert!(ports.sink.flushes() >= 1);

    // The new collection hears only silence
    let events = h.until(|e| matches!(e, AssistantEvent::UtteranceEnded { .. })).await;
    assert!(!events.iter().any(is_speech_end));
    assert_eq!(h.handle.snapshot().history().len(), 1);

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_half_duplex_ignores_trigger_while_speaking() {
    let ports = Ports::new(ScriptedTranscriber::new().then_text("bonjour", 0.9), "salut")
        .with_speaker(ScriptedSpeaker::new(10, Duration::from_millis(100)));
    let mut h = start(test_config(), &ports);

    h.say(10).await;
    h.until(|e| *e == AssistantEvent::SpeechStarted).await;
    h.feeder.wake();

    let events = h.until(is_speech_end).await;
    assert_eq!(events, vec![AssistantEvent::SpeechEnded { interrupted: false }]);
    assert_eq!(ports.speaker.yielded(), 10);

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_trigger_during_processing_is_ignored() {
    let ports = Ports::new(
        ScriptedTranscriber::new()
            .with_delay(Duration::from_secs(2))
            .then_text("quelle heure est-il", 0.9),
        "il est dix heures",
    );
    let mut h = start(test_config(), &ports);

    h.say(10).await;
    h.until(|e| matches!(e, AssistantEvent::UtteranceEnded { .. })).await;
    assert_eq!(h.handle.snapshot().mode(), Mode::Processing);
    h.feeder.wake();
    h.handle.activate().await.unwrap();

    let events = h.until(is_speech_end).await;
    assert_eq!(
        names(&events),
        vec!["transcript_ready", "response_ready", "speech_started", "speech_ended"]
    );
    assert_eq!(ports.transcriber.calls(), 1);

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_trigger_during_processing_restarts_when_allowed() {
    let mut config = test_config();
    config.orchestrator.barge_in.processing = BargeInAction::InterruptAndRestart;
    let ports = Ports::new(
        ScriptedTranscriber::new()
            .with_delay(Duration::from_secs(2))
            .then_text("quelle heure est-il", 0.9)
            .then_text("quel temps fait-il", 0.9),
        "il fait beau",
    );
    let mut h = start(config, &ports);

    h.say(10).await;
    h.until(|e| matches!(e, AssistantEvent::UtteranceEnded { .. })).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.handle.snapshot().mode(), Mode::Processing);
    assert_eq!(ports.transcriber.calls(), 1);

    h.feeder.wake();
    let events = h.until(|e| *e == AssistantEvent::UtteranceStarted).await;
    assert_eq!(names(&events), vec!["wake_detected", "utterance_started"]);

    h.feeder.speech(10);
    let events = h.until(is_speech_end).await;
    let transcripts: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            AssistantEvent::TranscriptReady { text, .. } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(transcripts, vec!["quel temps fait-il"]);
    assert_eq!(ports.transcriber.calls(), 2);

    // The abandoned transcription never reports back
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(h.drain().is_empty());
    let state = h.handle.snapshot();
    assert_eq!(state.history().len(), 1);
    assert_eq!(state.history()[0].user, "quel temps fait-il");

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_speech_ends_after_playback_drains() {
    let ports = Ports::new(ScriptedTranscriber::new().then_text("bonjour", 0.9), "salut")
        .with_sink(RecordingSink::new().with_latency(Duration::from_millis(500)));
    let mut h = start(test_config(), &ports);

    h.say(10).await;
    h.until(|e| *e == AssistantEvent::SpeechStarted).await;
    let started = Instant::now();

    // Every frame is queued but the speaker is still playing
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(ports.sink.played(), 3);
    assert_eq!(ports.sink.drains(), 0);
    assert_eq!(h.handle.snapshot().mode(), Mode::Speaking);

    // Half duplex: the assistant's own voice cannot wake it
    h.feeder.wake();

    let events = h.until(is_speech_end).await;
    assert_eq!(events, vec![AssistantEvent::SpeechEnded { interrupted: false }]);
    assert!(started.elapsed() >= Duration::from_millis(500));
    assert_eq!(ports.sink.drains(), 1);
    assert_eq!(h.handle.snapshot().mode(), Mode::Idle);

    h.stop().await;
}

/// Run one spoken exchange, optionally with a subscriber that never reads
async fn timed_exchange(
    slow_subscriber: bool,
) -> (Duration, Vec<AssistantEvent>, Vec<AssistantEvent>) {
    let mut config = test_config();
    config.events.queue_depth = 4;
    let ports = Ports::new(
        ScriptedTranscriber::new().then_text("quelle heure est-il", 0.92),
        "il est dix heures",
    );
    let mut h = start(config, &ports);
    let mut slow = slow_subscriber.then(|| h.handle.subscribe());

    let started = Instant::now();
    h.say(10).await;
    let events = h.until(is_speech_end).await;
    let elapsed = started.elapsed();

    let backlog: Vec<AssistantEvent> = slow
        .as_mut()
        .map(|sub| std::iter::from_fn(|| sub.receiver.try_recv()).collect())
        .unwrap_or_default();
    assert_eq!(h.handle.snapshot().history().len(), 1);
    h.stop().await;
    (elapsed, events, backlog)
}

#[tokio::test(start_paused = true)]
async fn test_slow_subscriber_does_not_hold_back_exchange() {
    let (baseline, _, _) = timed_exchange(false).await;
    let (elapsed, events, backlog) = timed_exchange(true).await;

    assert!(elapsed <= baseline + Duration::from_millis(20));
    assert_eq!(
        names(&events),
        vec![
            "utterance_started",
            "utterance_ended",
            "transcript_ready",
            "response_ready",
            "speech_started",
            "error_occurred",
            "speech_ended",
        ]
    );
    assert!(matches!(
        events[5],
        AssistantEvent::ErrorOccurred {
            kind: ErrorKind::SubscriberOverflow,
            ..
        }
    ));

    // The lagging subscriber sees one marker for the whole gap
    assert_eq!(backlog[0], AssistantEvent::OverflowDropped { dropped: 2 });
    assert_eq!(
        names(&backlog[1..]),
        vec!["transcript_ready", "response_ready", "speech_started", "speech_ended"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_repeated_transcription_failures_escalate() {
    let ports = Ports::new(
        ScriptedTranscriber::new()
            .then_fail("timeout")
            .then_fail("timeout")
            .then_fail("timeout"),
        "unused",
    );
    let mut h = start(test_config(), &ports);

    for _ in 0..2 {
        h.say(10).await;
        let events = h.until(is_error).await;
        assert!(matches!(
            events.last(),
            Some(AssistantEvent::ErrorOccurred {
                kind: ErrorKind::TranscriptionFailed,
                ..
            })
        ));
        assert_eq!(h.handle.snapshot().mode(), Mode::Idle);
    }

    h.say(10).await;
    h.until(is_error).await;
    let events = h
        .until(|e| {
            matches!(
                e,
                AssistantEvent::ErrorOccurred {
                    kind: ErrorKind::Escalated,
                    ..
                }
            )
        })
        .await;
    assert_eq!(events.len(), 1);

    let halt = h.main_loop.await.unwrap().unwrap();
    assert_eq!(halt, Halt::Escalated(ErrorKind::TranscriptionFailed));
    assert!(h.handle.activate().await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_success_resets_failure_streak() {
    let ports = Ports::new(
        ScriptedTranscriber::new()
            .then_fail("timeout")
            .then_fail("timeout")
            .then_text("bonjour", 0.9)
            .then_fail("timeout")
            .then_fail("timeout"),
        "salut",
    );
    let mut h = start(test_config(), &ports);

    let mut all = Vec::new();
    for round in 0..5 {
        h.say(10).await;
        let events = if round == 2 {
            h.until(is_speech_end).await
        } else {
            h.until(is_error).await
        };
        all.extend(events);
    }

    let escalated = all.iter().any(|e| {
        matches!(
            e,
            AssistantEvent::ErrorOccurred {
                kind: ErrorKind::Escalated,
                ..
            }
        )
    });
    assert!(!escalated);
    assert_eq!(all.iter().filter(|e| is_error(e)).count(), 4);
    assert_eq!(h.stop().await, Halt::Shutdown);
}

#[tokio::test(start_paused = true)]
async fn test_response_failure_recovers() {
    let ports = Ports::new(ScriptedTranscriber::new().then_text("bonjour", 0.9), "unused")
        .with_responder(FixedResponder::failing("model not loaded"));
    let mut h = start(test_config(), &ports);

    h.say(10).await;
    let events = h.until(is_error).await;

    assert!(matches!(
        events.last(),
        Some(AssistantEvent::ErrorOccurred {
            kind: ErrorKind::ResponseFailed,
            ..
        })
    ));
    assert_eq!(h.handle.snapshot().mode(), Mode::Idle);
    assert!(h.handle.snapshot().history().is_empty());

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_synthesis_failure_recovers() {
    let ports = Ports::new(ScriptedTranscriber::new().then_text("bonjour", 0.9), "salut")
        .with_speaker(ScriptedSpeaker::failing());
    let mut h = start(test_config(), &ports);

    h.say(10).await;
    let events = h.until(is_error).await;

    assert_eq!(
        names(&events)[events.len() - 3..],
        ["response_ready", "speech_started", "error_occurred"]
    );
    assert!(matches!(
        events.last(),
        Some(AssistantEvent::ErrorOccurred {
            kind: ErrorKind::SynthesisFailed,
            ..
        })
    ));
    // The turn was recorded before playback failed
    assert_eq!(h.handle.snapshot().history().len(), 1);
    assert_eq!(h.handle.snapshot().mode(), Mode::Idle);

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_device_stall_is_reported_and_recovered() {
    let ports = Ports::new(ScriptedTranscriber::new(), "unused");
    let mut h = start(test_config(), &ports);

    h.feeder.fail("unplugged");
    let events = h.until(is_error).await;
    assert!(matches!(
        events.last(),
        Some(AssistantEvent::ErrorOccurred {
            kind: ErrorKind::DeviceStall,
            message,
        }) if message.contains("unplugged")
    ));

    // Reopened after backoff
    for _ in 0..50 {
        if h.feeder.opens() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(h.feeder.opens(), 2);

    // Capture works again
    h.say(10).await;
    let events = h.until(|e| matches!(e, AssistantEvent::UtteranceEnded { .. })).await;
    assert!(matches!(
        events.last(),
        Some(AssistantEvent::UtteranceEnded {
            termination: Termination::SilenceTerminated,
            ..
        })
    ));

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_snapshots_follow_modes() {
    let ports = Ports::new(
        ScriptedTranscriber::new()
            .with_delay(Duration::from_millis(100))
            .then_text("bonjour", 0.9),
        "salut",
    );
    let h = start(test_config(), &ports);
    let mut watch = h.handle.watch();
    assert_eq!(watch.borrow_and_update().mode(), Mode::Idle);

    h.say(10).await;
    let mut modes = Vec::new();
    let collect = async {
        while watch.changed().await.is_ok() {
            let mode = watch.borrow_and_update().mode();
            if modes.last() != Some(&mode) {
                modes.push(mode);
            }
            if mode == Mode::Idle {
                break;
            }
        }
    };
    tokio::time::timeout(common::EVENT_TIMEOUT, collect).await.unwrap();

    assert_eq!(modes.first(), Some(&Mode::Listening));
    assert!(modes.contains(&Mode::Processing));
    assert!(modes.contains(&Mode::Speaking));
    assert_eq!(modes.last(), Some(&Mode::Idle));

    h.stop().await;
}
