use anyhow::{Context, Result};
use rhovoice::capture::{list_input_devices, CapturePipeline, PulseMicrophone};
use rhovoice::encoder::{encode_frame, FRAME_SAMPLES, INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE};
use rhovoice::output::spawn_output;
use rhovoice::playback::{PcmBuffer, PlaybackScheduler};
use rhovoice::visualizer::Tap;
use std::f32::consts::PI;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const CAPTURE_SECONDS: u64 = 3;
const TONE_HZ: f32 = 440.0;
const TONE_CHUNKS: usize = 5;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    println!("Available audio sources:");
    match list_input_devices() {
        Ok(devices) if devices.is_empty() => println!("No audio sources found!"),
        Ok(devices) => {
            for (i, device) in devices.iter().enumerate() {
                println!(
                    "{}: {} ({})",
                    i + 1,
                    device.description,
                    if device.is_monitor { "Monitor" } else { "Microphone" }
                );
                println!("   Name: {}", device.name);
                println!("   Rate: {} Hz, Channels: {}", device.sample_rate, device.channels);
            }
        }
        Err(e) => println!("Error listing sources: {}", e),
    }

    check_microphone(std::env::var("RHOVOICE_INPUT_DEVICE").ok())?;
    check_playback().await?;

    println!("\nDevice check complete!");
    Ok(())
}

/// Capture for a few seconds and report per-second levels.
fn check_microphone(device: Option<String>) -> Result<()> {
    println!(
        "\nRecording {}s from {} at {} Hz...",
        CAPTURE_SECONDS,
        device.as_deref().unwrap_or("the default source"),
        INPUT_SAMPLE_RATE
    );

    // (frames, sum of squares, peak, encoded bytes)
    let stats = Arc::new(Mutex::new((0usize, 0.0f64, 0.0f32, 0usize)));
    let sink = stats.clone();

    let mut pipeline = CapturePipeline::new();
    let started = pipeline.start(
        Arc::new(PulseMicrophone::new("rhovoice-check", device)),
        move |frame| {
            let encoded = encode_frame(frame).map(|c| c.bytes().len()).unwrap_or(0);
            if let Ok(mut s) = sink.lock() {
                s.0 += 1;
                s.1 += frame.iter().map(|&v| (v as f64) * (v as f64)).sum::<f64>();
                s.2 = frame.iter().fold(s.2, |peak, v| peak.max(v.abs()));
                s.3 += encoded;
            }
        },
    );
    if let Err(e) = started {
        println!("  ❌ Could not open microphone: {}", e);
        return Ok(());
    }

    for second in 1..=CAPTURE_SECONDS {
        std::thread::sleep(Duration::from_secs(1));
        let mut s = stats.lock().map_err(|_| anyhow::anyhow!("stats poisoned"))?;
        let rms = if s.0 > 0 {
            (s.1 / (s.0 * FRAME_SAMPLES) as f64).sqrt()
        } else {
            0.0
        };
        println!(
            "  {}s: {} frames, rms {:.4}, peak {:.4}, {} bytes encoded",
            second, s.0, rms, s.2, s.3
        );
        *s = (0, 0.0, 0.0, 0);
    }

    pipeline.stop();
    println!("  ✅ Microphone OK");
    Ok(())
}

/// Play a short tone in several back-to-back chunks through the scheduler.
async fn check_playback() -> Result<()> {
    println!("\nPlaying a {} Hz tone at {} Hz...", TONE_HZ, OUTPUT_SAMPLE_RATE);

    let (mut engine, mut ended) =
        spawn_output("rhovoice-check", None, Tap::new()).context("failed to open playback")?;
    let mut scheduler = PlaybackScheduler::new(engine.handle());

    let chunk_len = OUTPUT_SAMPLE_RATE as usize / 5;
    for chunk in 0..TONE_CHUNKS {
        let samples = (0..chunk_len)
            .map(|i| {
                let t = (chunk * chunk_len + i) as f32 / OUTPUT_SAMPLE_RATE as f32;
                0.2 * (2.0 * PI * TONE_HZ * t).sin()
            })
            .collect();
        let scheduled = scheduler.schedule(PcmBuffer::new(samples, OUTPUT_SAMPLE_RATE));
        println!(
            "  chunk {} scheduled at {:.3}s for {:.3}s",
            scheduled.id, scheduled.start, scheduled.duration
        );
    }

    while scheduler.in_flight() > 0 {
        match tokio::time::timeout(Duration::from_secs(3), ended.recv()).await {
            Ok(Some(id)) => {
                scheduler.on_ended(id);
            }
            Ok(None) | Err(_) => {
                println!("  ❌ Playback stalled with {} chunk(s) pending", scheduler.in_flight());
                engine.shutdown();
                return Ok(());
            }
        }
    }

    engine.shutdown();
    println!("  ✅ Playback OK");
    Ok(())
}
