use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use vocal_assistant::daemon::build_speaker;
use vocal_assistant::events::AssistantEvent;
use vocal_assistant::mock::{
    self, FixedResponder, MarkerWakeDetector, RecordingSink, ScriptedSpeaker, ScriptedTranscriber,
};
use vocal_assistant::surfaces::{ConsoleSurface, spawn_surface};
use vocal_assistant::voice::{
    AudioDevice, AudioFrame, AudioSink, CpalDevice, CpalSink, PLAYBACK_SAMPLE_RATE,
    list_input_devices,
};
use vocal_assistant::{Config, Daemon, Orchestrator};

/// Vocal - French-speaking voice assistant
#[derive(Parser)]
#[command(name = "vocal", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
#[allow(clippy::enum_variant_names)]
enum Command {
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
    /// Test TTS output
    TestTts {
        /// Text to speak
        #[arg(default_value = "Bonjour ! Ceci est un test de la synthèse vocale.")]
        text: String,
    },
    /// List audio input devices
    Devices,
    /// Run one exchange with in-memory backends
    Simulate {
        /// What the user says
        #[arg(short, long, default_value = "quelle heure est-il")]
        text: String,
        /// What the assistant answers
        #[arg(short, long, default_value = "il est dix heures")]
        reply: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,vocal_assistant=info",
        1 => "info,vocal_assistant=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    if let Some(cmd) = cli.command {
        return match cmd {
            Command::TestMic { duration } => test_mic(duration).await,
            Command::TestSpeaker => test_speaker().await,
            Command::TestTts { text } => test_tts(&text).await,
            Command::Devices => devices(),
            Command::Simulate { text, reply } => simulate(&text, &reply).await,
        };
    }

    tracing::info!("starting vocal assistant");

    let config = Config::load()?;
    tracing::debug!(?config, "loaded configuration");

    Daemon::new(config).run().await?;

    Ok(())
}

/// Test microphone input
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let config = Config::load()?;
    let sample_rate = config.audio.sample_rate;
    let frame_size = usize::try_from(sample_rate / 10)?;

    let mut device = CpalDevice::new(sample_rate);
    device.open().await?;
    println!("Device: {}", device.name());
    println!("Sample rate: {sample_rate} Hz");
    println!("---");

    for i in 0..duration {
        let mut second = Vec::with_capacity(frame_size * 10);
        for _ in 0..10 {
            second.extend(device.read_frame(frame_size).await?);
        }

        let frame = AudioFrame::new(i, sample_rate, second);
        let energy = frame.rms();
        let peak = frame.samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[{:2}s] RMS: {:.4} | Peak: {:.4} | [{}]",
            i + 1,
            energy,
            peak,
            meter
        );
    }

    device.close().await;

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: vocal devices");
    println!("  3. Try: pavucontrol (to check levels)");

    Ok(())
}

/// Test speaker output with a sine wave
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let frequency = 440.0_f32;
    let frame_len = usize::try_from(PLAYBACK_SAMPLE_RATE / 10)?;
    let mut sink = CpalSink::new(PLAYBACK_SAMPLE_RATE);

    for seq in 0..20_u64 {
        #[allow(clippy::cast_precision_loss)]
        let samples: Vec<f32> = (0..frame_len)
            .map(|i| {
                let n = seq as f32 * frame_len as f32 + i as f32;
                let t = n / PLAYBACK_SAMPLE_RATE as f32;
                (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3 // 30% volume
            })
            .collect();
        sink.play(AudioFrame::new(seq, PLAYBACK_SAMPLE_RATE, samples))
            .await?;
    }
    sink.drain().await?;

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");
    println!("  3. Try: pavucontrol (to check output levels)");

    Ok(())
}

/// Test TTS output with the configured speech backend
async fn test_tts(text: &str) -> anyhow::Result<()> {
    println!("Testing TTS with text: \"{text}\"\n");

    let config = Config::load()?;
    let speaker = build_speaker(&config.backends)?;
    let mut sink = CpalSink::new(PLAYBACK_SAMPLE_RATE);

    println!("Synthesizing speech...");
    let mut frames = speaker.synthesize(text).await?;
    let mut count = 0usize;
    while let Some(frame) = frames.next().await {
        sink.play(frame?).await?;
        count += 1;
    }
    sink.drain().await?;
    println!("Played {count} frames");

    println!("\n---");
    println!("If you heard the speech, TTS is working!");

    Ok(())
}

/// List audio input devices
fn devices() -> anyhow::Result<()> {
    let devices = list_input_devices()?;
    if devices.is_empty() {
        println!("No input device found");
        return Ok(());
    }
    println!("Input devices:");
    for name in devices {
        println!("  - {name}");
    }
    Ok(())
}

/// One typed exchange through the real orchestrator with in-memory backends
async fn simulate(text: &str, reply: &str) -> anyhow::Result<()> {
    let config = Arc::new(Config::default());
    let (device, _feeder) =
        mock::feed_device(config.audio.sample_rate, config.audio.frame_size);

    let (orchestrator, handle) = Orchestrator::builder(Arc::clone(&config))
        .device(Box::new(device))
        .detector(Box::new(MarkerWakeDetector))
        .transcriber(Arc::new(ScriptedTranscriber::new()))
        .responder(Arc::new(FixedResponder::new(reply)))
        .speaker(Arc::new(ScriptedSpeaker::new(5, Duration::from_millis(20))))
        .sink(Box::new(RecordingSink::new()))
        .build()?;

    let mut events = handle.subscribe();
    let console = spawn_surface(handle.bus(), Box::new(ConsoleSurface::stdout()));

    let shutdown = CancellationToken::new();
    let main_loop = tokio::spawn(orchestrator.run(shutdown.clone()));

    handle.submit_text(text).await?;
    let finished = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = events.receiver.recv().await {
            if matches!(event, AssistantEvent::SpeechEnded { .. }) {
                return true;
            }
        }
        false
    })
    .await;

    shutdown.cancel();
    main_loop.await??;
    tokio::time::sleep(Duration::from_millis(50)).await;
    console.abort();

    match finished {
        Ok(true) => {
            let turns = handle.snapshot().history().len();
            println!("---\n{turns} turn(s) recorded");
            Ok(())
        }
        _ => anyhow::bail!("simulated exchange did not complete"),
    }
}
