use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use beacon_voice::speech::pcm16_to_wav;
use beacon_voice::voice::calculate_energy;
use beacon_voice::{
    AudioCapture, Config, CpalSink, LoggingEvents, PlaybackQueue, ResponseSpeaker,
    SentenceSegmenter, SynthesisClient, VoiceSession,
};

/// Beacon Voice - real-time voice client for the Beacon voice server
#[derive(Parser)]
#[command(name = "beacon-voice", version, about)]
struct Cli {
    /// Config file (defaults to ~/.config/omni/beacon/voice.toml)
    #[arg(short, long, env = "BEACON_VOICE_CONFIG")]
    config: Option<PathBuf>,

    /// Voice server WebSocket URL
    #[arg(long, env = "BEACON_VOICE_URL")]
    url: Option<String>,

    /// Synthesis backend WebSocket URL
    #[arg(long, env = "BEACON_SYNTHESIS_URL")]
    synthesis_url: Option<String>,

    /// Synthesis voice
    #[arg(long, env = "BEACON_TTS_VOICE")]
    voice: Option<String>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run a voice session against the server (default)
    Connect {
        /// Driver identifier sent when the session starts
        #[arg(long, env = "BEACON_DRIVER_ID")]
        driver_id: Option<String>,

        /// Keep listening while the assistant talks (needs echo cancellation)
        #[arg(long)]
        barge_in: bool,
    },
    /// Speak text through the streaming synthesis pipeline
    Say {
        /// Text to speak
        text: String,
    },
    /// Synthesize text into a WAV file
    Synthesize {
        /// Text to synthesize
        text: String,
        /// Output WAV file
        #[arg(short, long, default_value = "speech.wav")]
        output: PathBuf,
    },
    /// Print the sentence units text would be spoken in
    Segment {
        /// Text to segment
        text: String,
    },
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,beacon_voice=info",
        1 => "info,beacon_voice=debug",
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

#[allow(clippy::future_not_send)]
async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(url) = cli.url {
        config.control.url = url;
    }
    if let Some(url) = cli.synthesis_url {
        config.synthesis.url = url;
    }
    if let Some(voice) = cli.voice {
        config.synthesis.voice_id = voice;
    }
    tracing::debug!(?config, "loaded configuration");

    match cli.command.unwrap_or(Command::Connect {
        driver_id: None,
        barge_in: false,
    }) {
        Command::Connect {
            driver_id,
            barge_in,
        } => {
            if driver_id.is_some() {
                config.control.driver_id = driver_id;
            }
            config.vad.barge_in |= barge_in;
            connect(config).await
        }
        Command::Say { text } => say(config, &text).await,
        Command::Synthesize { text, output } => synthesize(config, &text, &output).await,
        Command::Segment { text } => {
            segment(config, &text);
            Ok(())
        }
        Command::TestMic { duration } => test_mic(duration).await,
        Command::TestSpeaker => test_speaker().await,
    }
}

/// Run a live session until Ctrl-C or until the connection is given up
#[allow(clippy::future_not_send)]
async fn connect(config: Config) -> anyhow::Result<()> {
    let sink = Arc::new(CpalSink::new(config.playback.sample_rate)?);
    let playback = PlaybackQueue::new(sink, config.playback.sample_rate);
    let mut capture = AudioCapture::new(config.vad.frame_size)?;

    let session = VoiceSession::connect(config, playback, Arc::new(LoggingEvents)).await?;
    capture.start(session.frame_handler())?;

    tracing::info!(session_id = %session.id(), "voice session running, press Ctrl-C to stop");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("shutdown requested");
        }
        () = session.closed() => {
            tracing::warn!("voice session closed by connection loss");
        }
    }

    capture.stop();
    session.end().await;
    Ok(())
}

/// Stream text through segmenter, synthesis and playback
async fn say(config: Config, text: &str) -> anyhow::Result<()> {
    let sink = Arc::new(CpalSink::new(config.playback.sample_rate)?);
    let playback = PlaybackQueue::new(sink, config.playback.sample_rate);
    let client = Arc::new(SynthesisClient::new(config.synthesis.clone()));

    let speaker = ResponseSpeaker::start(
        Arc::clone(&client),
        Arc::new(playback.clone()),
        Arc::new(LoggingEvents),
        &config.segmenter,
        &config.batcher,
        config.synthesis.sample_rate,
    );

    // feed word by word, the way a generator streams
    for word in text.split_inclusive(' ') {
        speaker.push_text(word);
    }
    let report = speaker.finish().await;
    println!(
        "Spoke {} sentence(s) in {} unit(s), {} failed",
        report.sentences_spoken, report.units_delivered, report.sentences_failed
    );

    let mut idle = playback.subscribe();
    while !*idle.borrow_and_update() {
        if idle.changed().await.is_err() {
            break;
        }
    }

    client.disconnect();
    Ok(())
}

/// Batch synthesis into a WAV file
async fn synthesize(config: Config, text: &str, output: &Path) -> anyhow::Result<()> {
    let client = SynthesisClient::new(config.synthesis.clone());
    client.connect().await?;

    println!("Synthesizing speech...");
    let pcm = client.synthesize_all(text).await?;
    client.disconnect();

    let wav = pcm16_to_wav(&pcm, config.synthesis.sample_rate)?;
    std::fs::write(output, &wav)?;
    println!("Wrote {} bytes of audio to {}", wav.len(), output.display());
    Ok(())
}

/// Print the sentence units for `text`
fn segment(config: Config, text: &str) {
    let mut segmenter = SentenceSegmenter::new(config.segmenter);
    let mut units = segmenter.push(text);
    units.extend(segmenter.finish());

    for (i, unit) in units.iter().enumerate() {
        println!("{:2}. [{:3}] {unit}", i + 1, unit.chars().count());
    }
}

/// Test microphone input with a level meter
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<f32>();
    let mut capture = AudioCapture::new(1600)?;
    capture.start(move |frame: &[f32]| {
        let _ = tx.send(calculate_energy(frame));
    })?;

    println!("Sample rate: {} Hz", capture.sample_rate());
    println!("---");

    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let mut frames = Vec::new();
        while let Ok(frame_energy) = rx.try_recv() {
            frames.push(frame_energy);
        }
        #[allow(clippy::cast_precision_loss)]
        let energy = if frames.is_empty() {
            0.0
        } else {
            frames.iter().sum::<f32>() / frames.len() as f32
        };
        let peak = frames.iter().copied().fold(0.0f32, f32::max);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!("[{:2}s] RMS: {:.4} | Peak: {:.4} | [{}]", i + 1, energy, peak, meter);
    }

    capture.stop();

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Test speaker output with a sine wave through the playback queue
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let sample_rate = beacon_voice::config::PLAYBACK_SAMPLE_RATE;
    let sink = Arc::new(CpalSink::new(sample_rate)?);
    let playback = PlaybackQueue::new(sink, sample_rate);

    let frequency = 440.0_f32;
    let num_samples = sample_rate as usize * 2;
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    let pcm: Vec<u8> = (0..num_samples)
        .flat_map(|i| {
            let t = i as f32 / sample_rate as f32;
            let s = (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3; // 30% volume
            ((s * 32767.0) as i16).to_le_bytes()
        })
        .collect();

    println!("Playing {num_samples} samples at {sample_rate} Hz...");
    playback.enqueue(beacon_voice::PlaybackUnit {
        correlation_id: "test-speaker".to_string(),
        sequence: 0,
        audio: pcm16_to_wav(&pcm, sample_rate)?,
    });

    let mut idle = playback.subscribe();
    while !*idle.borrow_and_update() {
        if idle.changed().await.is_err() {
            break;
        }
    }

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");

    Ok(())
}
