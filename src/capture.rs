//! Camera capture control and frame forwarding.
//!
//! The capture backend is a blocking collaborator behind [`CaptureSource`].
//! [`CaptureController`] runs it on a blocking thread that pulls frames and
//! queues them as `CAM_FRAME` messages, and stops it from a single supervised
//! task so the dispatch path never waits on the camera.
//!
//! ```text
//!            start()                       stop()
//! Idle ───────────────► Running ─────────────────► Stopping ──► Idle
//!  ▲                      │ forwarder thread          │ supervisor task
//!  └──────── forwarder exited on its own ─────────────┘ (joins forwarder)
//! ```
//!
//! Camera frames use the non-blocking enqueue: a full writer queue drops the
//! frame instead of stalling the capture thread.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::task::JoinHandle;

use crate::config::CaptureConfig;
use crate::error::{AccessoryError, Result};
use crate::protocol::Command;
use crate::writer::WriterHandle;

/// A frame source such as a UVC camera.
///
/// All methods may block; they are only called from a blocking thread.
pub trait CaptureSource: Send + Sync + 'static {
    fn start(&self) -> Result<()>;

    fn stop(&self) -> Result<()>;

    /// Wait up to `timeout` for the next encoded frame.
    ///
    /// `Ok(None)` means no frame arrived in time.
    fn get_frame(&self, timeout: Duration) -> Result<Option<Bytes>>;
}

enum CaptureState {
    Idle,
    Running {
        stop: Arc<AtomicBool>,
        forwarder: JoinHandle<()>,
    },
    Stopping {
        /// A start arrived while stopping; honoured once the stop finishes.
        restart: bool,
        supervisor: Option<JoinHandle<()>>,
    },
}

#[derive(Default)]
struct CaptureStats {
    forwarded: AtomicU64,
    dropped: AtomicU64,
}

struct Shared {
    source: Option<Arc<dyn CaptureSource>>,
    writer: WriterHandle,
    config: CaptureConfig,
    state: Mutex<CaptureState>,
    /// Set by `shutdown` under the state lock; later starts are ignored.
    closed: AtomicBool,
    stats: CaptureStats,
}

/// Idempotent start/stop around one [`CaptureSource`].
#[derive(Clone)]
pub struct CaptureController {
    shared: Arc<Shared>,
}

impl CaptureController {
    /// Create a controller. Without a source, start and stop are no-ops.
    pub fn new(
        source: Option<Arc<dyn CaptureSource>>,
        writer: WriterHandle,
        config: CaptureConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                source,
                writer,
                config,
                state: Mutex::new(CaptureState::Idle),
                closed: AtomicBool::new(false),
                stats: CaptureStats::default(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CaptureState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start capturing unless already running. Returns immediately.
    pub fn start(&self) -> Result<()> {
        let Some(source) = self.shared.source.clone() else {
            tracing::debug!("no capture source configured, CAM_START ignored");
            return Ok(());
        };

        let mut state = self.lock();
        if self.shared.closed.load(Ordering::Acquire) {
            tracing::debug!("capture closed, CAM_START ignored");
            return Ok(());
        }
        match &mut *state {
            CaptureState::Running { forwarder, .. } if !forwarder.is_finished() => {
                tracing::debug!("capture already running");
                return Ok(());
            }
            CaptureState::Stopping { restart, .. } => {
                tracing::debug!("capture stopping, restart queued");
                *restart = true;
                return Ok(());
            }
            _ => {}
        }

        let stop = Arc::new(AtomicBool::new(false));
        let forwarder = {
            let shared = self.shared.clone();
            let stop = stop.clone();
            tokio::task::spawn_blocking(move || forward_frames(&shared, source.as_ref(), &stop))
        };
        *state = CaptureState::Running { stop, forwarder };
        Ok(())
    }

    /// Stop capturing if running. Returns immediately.
    ///
    /// The forwarder is joined by a supervisor task; a stop while another is
    /// in flight is a no-op.
    pub fn stop(&self) {
        let mut state = self.lock();
        self.begin_stop(&mut state);
    }

    /// Move a running capture to `Stopping` and spawn its supervisor.
    fn begin_stop(&self, state: &mut CaptureState) {
        let previous = std::mem::replace(
            state,
            CaptureState::Stopping {
                restart: false,
                supervisor: None,
            },
        );

        match previous {
            CaptureState::Running { stop, forwarder } => {
                stop.store(true, Ordering::Release);
                let supervisor = tokio::spawn(supervise_stop(
                    self.clone(),
                    forwarder,
                    self.shared.config.stop_timeout(),
                ));
                *state = CaptureState::Stopping {
                    restart: false,
                    supervisor: Some(supervisor),
                };
            }
            // Idle or already stopping.
            other => *state = other,
        }
    }

    /// Stop capture for good and wait (bounded) for it to finish. Used when a
    /// session closes; queued and later starts are discarded.
    pub async fn shutdown(&self) {
        let supervisor = {
            let mut state = self.lock();
            self.shared.closed.store(true, Ordering::Release);
            self.begin_stop(&mut state);

            match &mut *state {
                CaptureState::Stopping {
                    restart,
                    supervisor,
                } => {
                    *restart = false;
                    supervisor.take()
                }
                _ => None,
            }
        };

        if let Some(supervisor) = supervisor {
            let timeout = self.shared.config.stop_timeout();
            if tokio::time::timeout(timeout, supervisor).await.is_err() {
                tracing::warn!(?timeout, "capture did not stop before session close");
            }
        }
    }

    /// True while the forwarder thread is alive and not asked to stop.
    pub fn is_running(&self) -> bool {
        matches!(
            &*self.lock(),
            CaptureState::Running { forwarder, .. } if !forwarder.is_finished()
        )
    }

    pub fn is_stopping(&self) -> bool {
        matches!(&*self.lock(), CaptureState::Stopping { .. })
    }

    /// Camera frames queued to the writer so far.
    pub fn forwarded_frames(&self) -> u64 {
        self.shared.stats.forwarded.load(Ordering::Relaxed)
    }

    /// Camera frames dropped on a full writer queue so far.
    pub fn dropped_frames(&self) -> u64 {
        self.shared.stats.dropped.load(Ordering::Relaxed)
    }
}

async fn supervise_stop(controller: CaptureController, mut forwarder: JoinHandle<()>, timeout: Duration) {
    if tokio::time::timeout(timeout, &mut forwarder).await.is_err() {
        tracing::warn!(?timeout, "capture forwarder slow to stop, still waiting");
        let _ = forwarder.await;
    }

    let restart = {
        let mut state = controller.lock();
        let restart = matches!(&*state, CaptureState::Stopping { restart: true, .. });
        *state = CaptureState::Idle;
        restart
    };

    if restart {
        if let Err(e) = controller.start() {
            tracing::warn!(error = %e, "queued capture restart failed");
        }
    }
}

/// Body of the blocking forwarder thread.
fn forward_frames(shared: &Shared, source: &dyn CaptureSource, stop: &AtomicBool) {
    if let Err(e) = source.start() {
        tracing::error!(error = %e, "capture source failed to start");
        return;
    }
    tracing::info!("capture started");

    let frame_timeout = shared.config.frame_timeout();
    while !stop.load(Ordering::Acquire) {
        let frame = match source.get_frame(frame_timeout) {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!(error = %e, "capture source failed");
                break;
            }
        };

        match shared.writer.try_enqueue(Command::CamFrame, frame) {
            Ok(()) => {
                shared.stats.forwarded.fetch_add(1, Ordering::Relaxed);
            }
            Err(AccessoryError::QueueFull) => {
                shared.stats.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("writer queue full, camera frame dropped");
            }
            Err(_) => {
                tracing::debug!("writer closed, capture forwarder exiting");
                break;
            }
        }
    }

    if let Err(e) = source.stop() {
        tracing::warn!(error = %e, "capture source failed to stop");
    }
    tracing::info!("capture stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WriterConfig;
    use crate::shutdown::ShutdownSignal;
    use crate::transport::BoxFuture;
    use crate::writer::{spawn_writer_task, FrameSink, OutboundMessage};
    use std::sync::atomic::AtomicUsize;

    /// Produces a 4-byte frame every couple of milliseconds.
    #[derive(Default)]
    struct FakeCamera {
        starts: AtomicUsize,
        stops: AtomicUsize,
    }

    impl CaptureSource for FakeCamera {
        fn start(&self) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn stop(&self) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn get_frame(&self, _timeout: Duration) -> Result<Option<Bytes>> {
            std::thread::sleep(Duration::from_millis(2));
            Ok(Some(Bytes::from_static(b"jpeg")))
        }
    }

    /// Counts messages, optionally taking its time about it.
    struct CountingSink {
        count: AtomicUsize,
        delay: Duration,
    }

    impl FrameSink for CountingSink {
        fn write_message<'a>(&'a self, _message: &'a OutboundMessage) -> BoxFuture<'a, Result<()>> {
            Box::pin(async move {
                tokio::time::sleep(self.delay).await;
                self.count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    fn controller(
        camera: Arc<FakeCamera>,
        queue_capacity: usize,
        delay: Duration,
    ) -> (CaptureController, Arc<CountingSink>) {
        let sink = Arc::new(CountingSink {
            count: AtomicUsize::new(0),
            delay,
        });
        let (writer, _task) = spawn_writer_task(
            sink.clone(),
            &WriterConfig { queue_capacity },
            ShutdownSignal::new(),
        );
        let config = CaptureConfig {
            frame_timeout_ms: 10,
            stop_timeout_ms: 500,
        };
        (CaptureController::new(Some(camera), writer, config), sink)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let camera = Arc::new(FakeCamera::default());
        let (capture, sink) = controller(camera.clone(), 64, Duration::ZERO);

        capture.start().unwrap();
        capture.start().unwrap();
        assert!(capture.is_running());

        wait_until(|| sink.count.load(Ordering::SeqCst) >= 3).await;
        assert_eq!(camera.starts.load(Ordering::SeqCst), 1);

        capture.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_non_blocking() {
        let camera = Arc::new(FakeCamera::default());
        let (capture, _sink) = controller(camera.clone(), 64, Duration::ZERO);

        // Not running: no-op.
        capture.stop();
        assert!(!capture.is_stopping());

        capture.start().unwrap();
        capture.stop();
        capture.stop();
        assert!(!capture.is_running());

        wait_until(|| !capture.is_stopping()).await;
        assert_eq!(camera.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_start_during_stop_restarts() {
        let camera = Arc::new(FakeCamera::default());
        let (capture, _sink) = controller(camera.clone(), 64, Duration::ZERO);

        capture.start().unwrap();
        capture.stop();
        capture.start().unwrap();

        wait_until(|| camera.starts.load(Ordering::SeqCst) == 2).await;
        assert!(capture.is_running());
        capture.shutdown().await;
        assert_eq!(camera.stops.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_shutdown_discards_queued_restart() {
        let camera = Arc::new(FakeCamera::default());
        let (capture, _sink) = controller(camera.clone(), 64, Duration::ZERO);

        capture.start().unwrap();
        capture.stop();
        capture.start().unwrap();
        capture.shutdown().await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!capture.is_running());
        assert!(!capture.is_stopping());
        assert_eq!(camera.starts.load(Ordering::SeqCst), 1);
        assert_eq!(camera.stops.load(Ordering::SeqCst), 1);

        capture.start().unwrap();
        assert!(!capture.is_running());
    }

    #[tokio::test]
    async fn test_full_queue_drops_frames() {
        let camera = Arc::new(FakeCamera::default());
        let (capture, _sink) = controller(camera, 1, Duration::from_secs(5));

        capture.start().unwrap();
        wait_until(|| capture.dropped_frames() >= 2).await;
        assert!(capture.forwarded_frames() >= 1);

        capture.stop();
        wait_until(|| !capture.is_stopping()).await;
    }

    #[tokio::test]
    async fn test_no_source_is_noop() {
        let sink = Arc::new(CountingSink {
            count: AtomicUsize::new(0),
            delay: Duration::ZERO,
        });
        let (writer, _task) =
            spawn_writer_task(sink, &WriterConfig::default(), ShutdownSignal::new());
        let capture = CaptureController::new(None, writer, CaptureConfig::default());

        capture.start().unwrap();
        assert!(!capture.is_running());
        capture.shutdown().await;
    }
}
