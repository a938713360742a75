//! Voice Bridge operator CLI
//!
//! `voice-bridge devices [--json]` lists capture devices.
//! `voice-bridge probe <device-id> [seconds]` captures from a device at the
//! transport's 20 ms cadence and reports what it heard.

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voice_bridge::{
    audio::{audio_level, CpalBackend, DeviceId, DeviceRegistry, FrameSource},
    config::BridgeConfig,
    constants::*,
};

const DEFAULT_PROBE_SECS: u64 = 5;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = BridgeConfig::load_or_default(None)?;

    match args.first().map(String::as_str) {
        Some("devices") => list_devices(args.iter().any(|a| a == "--json")),
        Some("probe") => {
            let id: DeviceId = args
                .get(1)
                .context("usage: voice-bridge probe <device-id> [seconds]")?
                .parse()
                .context("device id must be a number")?;
            let secs = match args.get(2) {
                Some(s) => s.parse().context("seconds must be a number")?,
                None => DEFAULT_PROBE_SECS,
            };
            probe(&config, id, Duration::from_secs(secs)).await
        }
        _ => {
            eprintln!("usage: voice-bridge devices [--json]");
            eprintln!("       voice-bridge probe <device-id> [seconds]");
            bail!("no command given")
        }
    }
}

fn list_devices(json: bool) -> Result<()> {
    let registry = DeviceRegistry::new(Arc::new(CpalBackend))?;

    if json {
        println!("{}", serde_json::to_string_pretty(registry.devices())?);
        return Ok(());
    }

    println!("\n=== Capture Devices ===");
    for device in registry.devices() {
        println!("  [{}] {}", device.id, device.name);
        println!("      Input channels: {}", device.max_input_channels);
    }
    println!();
    Ok(())
}

async fn probe(config: &BridgeConfig, id: DeviceId, duration: Duration) -> Result<()> {
    let backend = Arc::new(CpalBackend);
    let registry = DeviceRegistry::new(backend.clone())?;
    let device = registry.get(id)?.clone();

    let source = FrameSource::new(backend, config.capture.clone());
    source.open(&device)?;

    tracing::info!(
        device = %device.name,
        sample_rate = SAMPLE_RATE,
        channels = CHANNELS,
        frame_bytes = FRAME_BYTES,
        "probing capture device"
    );

    let mut ticker = tokio::time::interval(Duration::from_millis(FRAME_DURATION_MS));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let total = duration.as_millis() as u64 / FRAME_DURATION_MS;
    let mut frames = 0u64;
    let mut glitches = 0u64;
    let mut peak_rms = 0f32;

    for _ in 0..total {
        ticker.tick().await;
        match source.read_frame() {
            Ok(Some(frame)) => {
                frames += 1;
                peak_rms = peak_rms.max(audio_level(&frame));
            }
            Ok(None) => bail!("capture device closed during probe"),
            Err(e) if e.is_read_glitch() => glitches += 1,
            Err(e) => return Err(e.into()),
        }
    }

    source.close();

    println!("\n=== Probe: {} ===", device.name);
    println!("  Frames:   {} / {}", frames, total);
    println!("  Glitches: {}", glitches);
    println!("  Peak RMS: {:.0}", peak_rms);
    if peak_rms <= config.capture.noise_floor {
        println!("  No audio above the noise floor ({:.0})", config.capture.noise_floor);
    }
    println!();
    Ok(())
}
