//! Loopback - a full session against the in-memory device.
//!
//! This demo shows:
//! - Building a session with the fluent builder (or a JSON config file)
//! - Running it under the reconnecting run loop with Ctrl+C handling
//! - A scripted phone app: APP_CONNECTED, TEST echoes, EXIT, TERMINATE
//!
//! ```text
//! cargo run --example loopback -- --count 5 --start 100
//! RUST_LOG=accessory_bridge=debug cargo run --example loopback
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use accessory_bridge::protocol::Command;
use accessory_bridge::transport::{MemoryDevice, MemoryProvider};
use accessory_bridge::{runner, Session, SessionConfig, SessionState, ShutdownSignal};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Run an accessory session against a simulated phone")]
struct Args {
    /// Number of TEST round trips.
    #[arg(long, default_value_t = 3)]
    count: u16,

    /// First TEST value sent by the phone.
    #[arg(long, default_value_t = 5)]
    start: u16,

    /// Start the phone in normal mode so the mode switch runs first.
    #[arg(long)]
    switch: bool,

    /// JSON session configuration.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("accessory_bridge=info")),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => SessionConfig::from_json_file(path)?,
        None => SessionConfig::default(),
    };

    let device = MemoryDevice::new();
    let provider = if args.switch {
        MemoryProvider::phone(device.clone(), 0x04E8, 0x6860)
    } else {
        MemoryProvider::accessory(device.clone())
    };

    let session = Session::builder(Arc::new(provider))
        .config(config)
        .settle_delay(Duration::from_millis(100))
        .build()?;

    let phone = tokio::spawn(play_phone(
        device,
        session.handle().state_changes(),
        args.start,
        args.count,
    ));

    let shutdown = ShutdownSignal::new();
    runner::spawn_signal_listener(shutdown.clone());
    runner::run_until_shutdown(&session, shutdown).await?;

    phone.await??;
    Ok(())
}

/// The phone side: echo a few values, then ask the host to quit.
async fn play_phone(
    device: MemoryDevice,
    mut states: tokio::sync::watch::Receiver<SessionState>,
    start: u16,
    count: u16,
) -> Result<(), String> {
    states
        .wait_for(|s| *s == SessionState::Connected)
        .await
        .map_err(|e| e.to_string())?;

    device.inject_frame(Command::AppConnected, &[]);
    for i in 0..count {
        let value = start.wrapping_add(i);
        device.inject_frame(Command::Test, &value.to_be_bytes());
    }

    if !device
        .wait_for_writes(count as usize, Duration::from_secs(5))
        .await
    {
        return Err("host did not answer every TEST".to_string());
    }

    for frame in device.written_frames() {
        if let [hi, lo] = frame.payload() {
            println!("TEST reply: {}", u16::from_be_bytes([*hi, *lo]));
        }
    }

    // EXIT from the phone: the host echoes EXIT once.
    device.inject_frame(Command::Exit, &[]);
    device
        .wait_for_writes(count as usize + 1, Duration::from_secs(5))
        .await;
    device.inject_frame(Command::Terminate, &[]);

    let exits = device
        .written_frames()
        .iter()
        .filter(|f| f.command == Command::Exit)
        .count();
    println!("EXIT frames from host: {}", exits);
    Ok(())
}
