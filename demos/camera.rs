//! Camera - forwarding capture frames as CAM_FRAME messages.
//!
//! A synthetic camera produces numbered frames at a fixed rate. The simulated
//! phone sends CAM_START, counts the CAM_FRAME messages it receives, then
//! sends CAM_STOP and TERMINATE.
//!
//! ```text
//! cargo run --example camera -- --fps 60 --frames 120
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use accessory_bridge::capture::CaptureSource;
use accessory_bridge::protocol::Command;
use accessory_bridge::transport::{MemoryDevice, MemoryProvider};
use accessory_bridge::{runner, Session, SessionState, ShutdownSignal};
use bytes::{BufMut, Bytes, BytesMut};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Stream synthetic camera frames over a simulated accessory link")]
struct Args {
    /// Frames per second produced by the synthetic camera.
    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Frames to receive before stopping.
    #[arg(long, default_value_t = 60)]
    frames: usize,

    /// Size of each synthetic frame in bytes.
    #[arg(long, default_value_t = 4096)]
    frame_size: usize,
}

/// Emits `[sequence: u64 BE][filler]` frames at a fixed rate.
struct SyntheticCamera {
    interval: Duration,
    frame_size: usize,
    sequence: AtomicU64,
}

impl CaptureSource for SyntheticCamera {
    fn start(&self) -> accessory_bridge::Result<()> {
        tracing::info!(interval = ?self.interval, "synthetic camera on");
        Ok(())
    }

    fn stop(&self) -> accessory_bridge::Result<()> {
        tracing::info!("synthetic camera off");
        Ok(())
    }

    fn get_frame(&self, timeout: Duration) -> accessory_bridge::Result<Option<Bytes>> {
        if self.interval > timeout {
            std::thread::sleep(timeout);
            return Ok(None);
        }
        std::thread::sleep(self.interval);

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let mut frame = BytesMut::with_capacity(self.frame_size.max(8));
        frame.put_u64(sequence);
        frame.resize(self.frame_size.max(8), 0xA5);
        Ok(Some(frame.freeze()))
    }
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
    let camera = Arc::new(SyntheticCamera {
        interval: Duration::from_secs(1) / args.fps.max(1),
        frame_size: args.frame_size,
        sequence: AtomicU64::new(0),
    });

    let device = MemoryDevice::new();
    let session = Session::builder(Arc::new(MemoryProvider::accessory(device.clone())))
        .capture_source(camera)
        .build()?;

    let mut states = session.handle().state_changes();
    let wanted = args.frames;
    let phone = tokio::spawn(async move {
        if states.wait_for(|s| *s == SessionState::Connected).await.is_err() {
            return;
        }

        let started = Instant::now();
        device.inject_frame(Command::CamStart, &[]);
        device.wait_for_writes(wanted, Duration::from_secs(60)).await;
        device.inject_frame(Command::CamStop, &[]);

        let frames = device.written_frames();
        let bytes: usize = frames.iter().map(|f| f.payload_len()).sum();
        println!(
            "received {} frames ({} bytes) in {:?}",
            frames.len(),
            bytes,
            started.elapsed()
        );

        device.inject_frame(Command::Terminate, &[]);
    });

    let shutdown = ShutdownSignal::new();
    runner::spawn_signal_listener(shutdown.clone());
    runner::run_until_shutdown(&session, shutdown).await?;

    phone.await?;
    Ok(())
}
