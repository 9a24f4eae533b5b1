use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use voxturn::audio::{
    AudioInput, CpalOutput, FrameSource, Microphone, OutputDevice, SilentOutput, energy,
};
use voxturn::config::Fallback;
use voxturn::conversation::EndReason;
use voxturn::playback::PlaybackScheduler;
use voxturn::transport::{ReplyFrame, Strategy, TransportAdapter};
use voxturn::{Config, ConversationLoop, SessionState, StopHandle};

/// Voxturn - talk to a remote voice agent, one turn at a time
#[derive(Parser)]
#[command(name = "voxturn", version, about)]
struct Cli {
    /// Wire strategy (overrides config and VOXTURN_STRATEGY)
    #[arg(short, long, value_enum)]
    strategy: Option<Strategy>,

    /// Fallback strategy, "auto", or "none" to disable fallback
    #[arg(long)]
    fallback: Option<Fallback>,

    /// WebSocket endpoint of the remote agent
    #[arg(short, long)]
    endpoint: Option<String>,

    /// Write every captured utterance as a WAV file into this directory
    #[arg(long, env = "VOXTURN_SAVE_UTTERANCES")]
    save_utterances: Option<PathBuf>,

    /// Keep time without playing replies (for headless machines)
    #[arg(long)]
    mute: bool,

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
    /// Test speaker output through the playback scheduler
    TestSpeaker,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,voxturn=info",
        1 => "info,voxturn=debug",
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
    let mut config = Config::load()?;

    if let Some(strategy) = cli.strategy {
        config.transport.strategy = strategy;
    }
    if let Some(fallback) = cli.fallback {
        config.transport.fallback = fallback;
    }
    if let Some(endpoint) = cli.endpoint {
        config.transport.endpoint = endpoint;
    }
    config.validate()?;
    tracing::debug!(?config, "loaded configuration");

    if let Some(cmd) = cli.command {
        return match cmd {
            Command::TestMic { duration } => test_mic(&config, duration).await,
            Command::TestSpeaker => test_speaker(&config).await,
        };
    }

    let stop = StopHandle::new();
    let ctrl_c = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("stop requested, finishing current turn");
            ctrl_c.stop();
        }
    });

    let sample_rate = config.audio.sample_rate;
    let transport =
        TransportAdapter::from_config(&config.transport, config.audio.wire_format(), None)?;
    let input = Microphone::new(sample_rate, config.audio.frame_samples())?;
    let output: Box<dyn OutputDevice> = if cli.mute {
        Box::new(SilentOutput::new(sample_rate))
    } else {
        Box::new(CpalOutput::new(sample_rate)?)
    };

    let observer = |state: SessionState, cause: Option<&str>| match cause {
        Some(cause) => tracing::warn!(%state, cause, "session state"),
        None => tracing::info!(%state, "session state"),
    };

    let mut conversation = ConversationLoop::new(
        &config,
        Box::new(input),
        transport,
        output,
        observer,
        stop,
    )?;

    if let Some(dir) = cli.save_utterances {
        std::fs::create_dir_all(&dir)?;
        conversation = conversation.with_utterance_dir(dir);
    }

    tracing::info!(
        endpoint = %config.transport.endpoint,
        strategy = %config.transport.strategy,
        sample_rate,
        "voxturn ready - start speaking"
    );

    let summary = conversation.run().await?;

    match summary.end {
        EndReason::NoSpeech => println!(
            "Session ended after {} turn(s): no speech detected",
            summary.turns
        ),
        EndReason::Stopped => println!("Session stopped after {} turn(s)", summary.turns),
    }
    if summary.underruns > 0 {
        println!("Playback underruns: {}", summary.underruns);
    }

    Ok(())
}

/// Test microphone input
#[allow(clippy::future_not_send)]
async fn test_mic(config: &Config, duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let mut microphone = Microphone::new(config.audio.sample_rate, config.audio.frame_samples())?;
    let mut source = microphone.open()?;

    println!("Sample rate: {} Hz", microphone.sample_rate());
    println!("Speech threshold: {:.4}", config.vad.energy_threshold);
    println!("---");

    let second = Duration::from_secs(1);
    for i in 0..duration {
        let mut samples = Vec::new();
        let mut captured = Duration::ZERO;
        while captured < second {
            let Some(frame) = source.next_frame().await? else {
                anyhow::bail!("microphone stopped delivering audio");
            };
            captured += frame.duration();
            samples.extend_from_slice(frame.samples());
        }

        let level = energy::rms(&samples);
        let peak = energy::peak(&samples);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (level * 100.0).min(50.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);
        let marker = if level >= config.vad.energy_threshold {
            "speech"
        } else {
            ""
        };

        println!(
            "[{:2}s] RMS: {:.4} | Peak: {:.4} | [{}] {}",
            i + 1,
            level,
            peak,
            meter,
            marker
        );
    }

    source.close();

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Test speaker output with a sine wave
#[allow(clippy::future_not_send)]
async fn test_speaker(config: &Config) -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let sample_rate = config.audio.sample_rate;
    let output = CpalOutput::new(sample_rate)?;
    let mut scheduler = PlaybackScheduler::new(Box::new(output), config.playback.lead_in());
    scheduler.begin_turn(None);

    let frequency = 440.0_f32;
    let frame_samples = sample_rate as usize / 10;

    // 20 frames of 100ms, phase-continuous across frame boundaries
    for seq in 0..20_u64 {
        #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
        let samples: Vec<f32> = (0..frame_samples)
            .map(|i| {
                let n = seq as usize * frame_samples + i;
                let t = n as f32 / sample_rate as f32;
                (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3 // 30% volume
            })
            .collect();

        scheduler.submit(ReplyFrame {
            seq,
            samples,
            sample_rate,
        })?;
    }

    println!(
        "Scheduled {} frames at {} Hz...",
        scheduler.outstanding(),
        sample_rate
    );

    scheduler.finish()?;
    scheduler.drain().await?;

    println!("\n---");
    println!("If you heard a steady tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");
    println!("  3. Try: pavucontrol (to check output levels)");

    Ok(())
}
