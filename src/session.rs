//! Session builder and lifecycle.
//!
//! A [`Session`] owns one device connection at a time and walks it through
//! `Disconnected → Connecting → Connected → Closing → Disconnected`:
//! 1. Detect a device, switching it to accessory mode if needed
//! 2. Claim the interface, start perpetual reads and the writer task
//! 3. Decode inbound frames and dispatch commands until a close is requested
//!    or a transfer fails
//! 4. Send EXIT if the app is connected, let queued writes drain, cancel every
//!    transfer, release the interface
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use accessory_bridge::{Session, CloseReason};
//!
//! let session = Session::builder(Arc::new(provider))
//!     .detect_attempts(10)
//!     .build()?;
//!
//! match session.run().await? {
//!     CloseReason::Terminated => println!("device asked us to exit"),
//!     other => println!("session ended: {:?}", other),
//! }
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::capture::{CaptureController, CaptureSource};
use crate::config::{AccessoryIdentity, SessionConfig};
use crate::error::{AccessoryError, Result};
use crate::handler::{spawn_reply_task, CommandContext, Dispatcher, ReplySender};
use crate::protocol::{Command, FrameCodec};
use crate::transport::{
    DetectedDevice, DeviceHandle, DeviceProvider, ReadEvent, ReadPump, TransferPool,
};
use crate::writer::{spawn_writer_task, WriterHandle};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The device sent TERMINATE; the process should exit.
    Terminated,
    /// [`SessionHandle::stop`] was called.
    Stopped,
    /// A transfer failed or the inbound stream was corrupt.
    ConnectionLost(String),
}

impl CloseReason {
    /// True if the outer loop should try to reconnect.
    pub fn should_reconnect(&self) -> bool {
        matches!(self, CloseReason::ConnectionLost(_))
    }
}

struct SessionShared {
    state: watch::Sender<SessionState>,
    connected: AtomicBool,
    app_connected: AtomicBool,
    shutdown_requested: AtomicBool,
    /// First close request of the current connection wins.
    close_reason: Mutex<Option<CloseReason>>,
    close_notify: Notify,
    writer: Mutex<Option<WriterHandle>>,
}

impl SessionShared {
    fn new() -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            state,
            connected: AtomicBool::new(false),
            app_connected: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
            close_reason: Mutex::new(None),
            close_notify: Notify::new(),
            writer: Mutex::new(None),
        }
    }

    fn close_reason(&self) -> MutexGuard<'_, Option<CloseReason>> {
        self.close_reason
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn writer(&self) -> MutexGuard<'_, Option<WriterHandle>> {
        self.writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record `reason` unless a close is already pending; returns the reason
    /// in effect.
    fn record_close(&self, reason: CloseReason) -> CloseReason {
        let mut current = self.close_reason();
        current.get_or_insert(reason).clone()
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "session state changed");
        }
    }
}

/// Cloneable handle to a session's shared state.
///
/// Used by command handlers, external producers and the run loop.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<SessionShared>,
}

impl SessionHandle {
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(SessionShared::new()),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    /// Receiver notified on every state transition.
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    pub fn is_app_connected(&self) -> bool {
        self.shared.app_connected.load(Ordering::Acquire)
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shared.shutdown_requested.load(Ordering::Acquire)
    }

    pub fn set_app_connected(&self, connected: bool) {
        self.shared.app_connected.store(connected, Ordering::Release);
    }

    /// Queue a message to the device.
    ///
    /// Waits while the writer queue is full. Fails with `ConnectionClosed`
    /// when no device is connected.
    pub async fn write_command(&self, command: Command, payload: impl Into<Bytes>) -> Result<()> {
        let writer = self.shared.writer().clone();
        match writer {
            Some(writer) => writer.enqueue(command, payload).await,
            None => Err(AccessoryError::ConnectionClosed),
        }
    }

    /// Tell the device application to exit.
    ///
    /// Only sends EXIT while the app is connected, and clears the flag, so at
    /// most one EXIT goes out per APP_CONNECTED. Returns whether one was sent.
    pub async fn signal_app_exit(&self) -> Result<bool> {
        if !self.take_app_connected() {
            return Ok(false);
        }
        self.write_command(Command::Exit, Bytes::new()).await?;
        Ok(true)
    }

    /// Clear `app_connected`, returning whether it was set.
    pub(crate) fn take_app_connected(&self) -> bool {
        self.shared.app_connected.swap(false, Ordering::AcqRel)
    }

    /// Mark the process for shutdown and close the session.
    ///
    /// Returns immediately; the close runs on the session task.
    pub fn request_shutdown(&self) {
        self.shared.shutdown_requested.store(true, Ordering::Release);
        self.request_close(CloseReason::Terminated);
    }

    /// Close the session without marking the process for shutdown.
    pub fn stop(&self) {
        self.request_close(CloseReason::Stopped);
    }

    fn request_close(&self, reason: CloseReason) {
        let reason = self.shared.record_close(reason);
        tracing::debug!(?reason, "session close requested");
        self.shared.close_notify.notify_one();
    }

    async fn closed(&self) -> CloseReason {
        loop {
            let pending = self.shared.close_reason().clone();
            if let Some(reason) = pending {
                return reason;
            }
            self.shared.close_notify.notified().await;
        }
    }

    pub(crate) fn attach(&self, writer: WriterHandle) {
        *self.shared.writer() = Some(writer);
        self.shared.app_connected.store(false, Ordering::Release);
        self.shared.connected.store(true, Ordering::Release);
    }

    fn detach(&self) {
        self.shared.connected.store(false, Ordering::Release);
        self.shared.app_connected.store(false, Ordering::Release);
        *self.shared.writer() = None;
    }
}

/// Builder for configuring a [`Session`].
pub struct SessionBuilder {
    provider: Arc<dyn DeviceProvider>,
    capture_source: Option<Arc<dyn CaptureSource>>,
    config: SessionConfig,
}

impl SessionBuilder {
    pub fn new(provider: Arc<dyn DeviceProvider>) -> Self {
        Self {
            provider,
            capture_source: None,
            config: SessionConfig::default(),
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Camera forwarded on CAM_START.
    pub fn capture_source(mut self, source: Arc<dyn CaptureSource>) -> Self {
        self.capture_source = Some(source);
        self
    }

    /// Identity strings sent during the mode switch.
    pub fn identity(mut self, identity: AccessoryIdentity) -> Self {
        self.config.connect.identity = identity;
        self
    }

    /// Only accept this vendor (and optionally product) id.
    pub fn device_filter(mut self, vendor_id: u16, product_id: Option<u16>) -> Self {
        self.config.connect.vendor_id = Some(vendor_id);
        self.config.connect.product_id = product_id;
        self
    }

    /// Default: 5
    pub fn detect_attempts(mut self, attempts: u32) -> Self {
        self.config.connect.detect_attempts = attempts;
        self
    }

    /// Default: 1 second
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.connect.retry_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Default: 1 second
    pub fn settle_delay(mut self, delay: Duration) -> Self {
        self.config.connect.settle_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Default: 64
    pub fn read_slots(mut self, slots: usize) -> Self {
        self.config.transfer.read_slots = slots;
        self
    }

    /// Default: 16 KiB
    pub fn read_size(mut self, size: usize) -> Self {
        self.config.transfer.read_size = size;
        self
    }

    /// Default: 1 second
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.transfer.write_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Default: 256
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.writer.queue_capacity = capacity;
        self
    }

    /// Default: 2 seconds
    pub fn close_grace(mut self, grace: Duration) -> Self {
        self.config.close_grace_ms = grace.as_millis() as u64;
        self
    }

    /// Validate the configuration and build the session.
    pub fn build(self) -> Result<Session> {
        self.config.validate()?;
        Ok(Session {
            provider: self.provider,
            capture_source: self.capture_source,
            config: self.config,
            handle: SessionHandle::new(),
        })
    }
}

/// Host side of the accessory link.
pub struct Session {
    provider: Arc<dyn DeviceProvider>,
    capture_source: Option<Arc<dyn CaptureSource>>,
    config: SessionConfig,
    handle: SessionHandle,
}

/// Everything alive while connected.
struct Connection {
    device: Arc<dyn DeviceHandle>,
    pool: Arc<TransferPool>,
    writer: WriterHandle,
    replies: ReplySender,
    capture: CaptureController,
    reader_task: JoinHandle<Result<()>>,
    writer_task: JoinHandle<Result<()>>,
    reply_task: JoinHandle<Result<()>>,
}

impl Session {
    pub fn builder(provider: Arc<dyn DeviceProvider>) -> SessionBuilder {
        SessionBuilder::new(provider)
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.handle.state()
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_connected()
    }

    pub fn is_app_connected(&self) -> bool {
        self.handle.is_app_connected()
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.handle.is_shutdown_requested()
    }

    /// Queue a message to the connected device.
    pub async fn write_command(&self, command: Command, payload: impl Into<Bytes>) -> Result<()> {
        self.handle.write_command(command, payload).await
    }

    /// Run one connection from detection to close.
    ///
    /// Returns why the session closed, or `DeviceNotFound` if no accessory
    /// appeared within the configured attempts. The session is
    /// `Disconnected` again when this returns.
    pub async fn run(&self) -> Result<CloseReason> {
        let shared = &self.handle.shared;
        shared.set_state(SessionState::Connecting);

        let device = tokio::select! {
            biased;
            reason = self.handle.closed() => {
                self.finish();
                return Ok(reason);
            }
            connected = self.connect() => connected,
        };
        let device = match device {
            Ok(device) => device,
            Err(e) => {
                shared.set_state(SessionState::Disconnected);
                return Err(e);
            }
        };

        let mut connection = match self.start(device).await {
            Ok(connection) => connection,
            Err(e) => {
                shared.set_state(SessionState::Disconnected);
                return Err(e);
            }
        };
        tracing::info!("accessory session connected");

        let (reason, reader_done, writer_done) = tokio::select! {
            reason = self.handle.closed() => (reason, false, false),
            joined = &mut connection.reader_task => {
                (shared.record_close(lost("read", joined)), true, false)
            }
            joined = &mut connection.writer_task => {
                (shared.record_close(lost("write", joined)), false, true)
            }
        };

        self.close(connection, &reason, reader_done, writer_done).await;
        self.finish();
        tracing::info!(?reason, "accessory session closed");
        Ok(reason)
    }

    /// Detect, switch if needed, and open an accessory-mode device.
    ///
    /// A failed detect, switch or open counts as one failed attempt.
    async fn connect(&self) -> Result<Arc<dyn DeviceHandle>> {
        let connect = &self.config.connect;

        for attempt in 1..=connect.detect_attempts {
            match self.attempt(attempt).await {
                Ok(Some(device)) => return Ok(device),
                Ok(None) => {}
                Err(e) => tracing::warn!(attempt, error = %e, "connect attempt failed"),
            }

            if attempt < connect.detect_attempts {
                tokio::time::sleep(connect.retry_delay()).await;
            }
        }

        tracing::warn!(attempts = connect.detect_attempts, "no accessory device found");
        Err(AccessoryError::DeviceNotFound {
            attempts: connect.detect_attempts,
        })
    }

    /// One detection pass. A matching device in normal mode is switched and
    /// detected again after the settle delay.
    async fn attempt(&self, attempt: u32) -> Result<Option<Arc<dyn DeviceHandle>>> {
        let connect = &self.config.connect;

        let device = match self.provider.detect().await? {
            Some(device) if device.is_accessory_mode() => device,
            Some(device) if device.matches(connect.vendor_id, connect.product_id) => {
                tracing::info!(%device, attempt, "requesting accessory mode");
                self.provider
                    .switch_to_accessory(device, &connect.identity)
                    .await?;
                tokio::time::sleep(connect.settle_delay()).await;

                match self.provider.detect().await? {
                    Some(device) if device.is_accessory_mode() => device,
                    other => {
                        tracing::debug!(attempt, device = ?other, "device not in accessory mode after switch");
                        return Ok(None);
                    }
                }
            }
            Some(device) => {
                tracing::debug!(%device, attempt, "device does not match filter");
                return Ok(None);
            }
            None => {
                tracing::debug!(attempt, "no compatible device");
                return Ok(None);
            }
        };

        self.open(device, attempt).await.map(Some)
    }

    async fn open(&self, device: DetectedDevice, attempt: u32) -> Result<Arc<dyn DeviceHandle>> {
        tracing::info!(%device, attempt, "accessory found");
        self.provider.open(device).await
    }

    /// Claim the device and start the read and write pipelines.
    async fn start(&self, device: Arc<dyn DeviceHandle>) -> Result<Connection> {
        device.claim().await?;

        let pool = TransferPool::new(device.clone(), self.config.transfer.clone());
        let (writer, writer_task) =
            spawn_writer_task(pool.clone(), &self.config.writer, pool.cancel_signal());
        let capture = CaptureController::new(
            self.capture_source.clone(),
            writer.clone(),
            self.config.capture.clone(),
        );

        let (replies, reply_task) = spawn_reply_task(writer.clone());

        self.handle.attach(writer.clone());
        self.handle.shared.set_state(SessionState::Connected);

        let dispatcher = Dispatcher::new(CommandContext::new(
            self.handle.clone(),
            replies.clone(),
            capture.clone(),
        ));
        let reader_task = tokio::spawn(read_loop(
            ReadPump::start(pool.clone()),
            FrameCodec::with_max_payload(self.config.max_payload_size),
            dispatcher,
        ));

        Ok(Connection {
            device,
            pool,
            writer,
            replies,
            capture,
            reader_task,
            writer_task,
            reply_task,
        })
    }

    async fn close(
        &self,
        connection: Connection,
        reason: &CloseReason,
        reader_done: bool,
        writer_done: bool,
    ) {
        let Connection {
            device,
            pool,
            writer,
            replies,
            capture,
            mut reader_task,
            mut writer_task,
            mut reply_task,
        } = connection;

        self.handle.shared.set_state(SessionState::Closing);
        tracing::info!(?reason, "closing accessory session");

        capture.shutdown().await;

        if !writer_done {
            let deadline = Instant::now() + self.config.close_grace();

            // EXIT goes behind any replies still queued.
            if self.handle.take_app_connected() {
                match replies.send(Command::Exit, Bytes::new()) {
                    Ok(()) => tracing::debug!("EXIT queued"),
                    Err(e) => tracing::debug!(error = %e, "could not queue EXIT"),
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if !replies.wait_forwarded(remaining).await {
                tracing::warn!(queued = replies.queued(), "replies not forwarded before close");
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if !writer.wait_drained(remaining).await {
                tracing::warn!(pending = writer.pending_count(), "writer queue not drained before close");
            }
        }

        self.handle.detach();
        drop(replies);
        drop(writer);
        pool.cancel();

        let cancel_timeout = self.config.transfer.cancel_timeout();
        if !reader_done {
            join_or_abort("reader", &mut reader_task, cancel_timeout).await;
        }
        if !writer_done {
            join_or_abort("writer", &mut writer_task, cancel_timeout).await;
        }
        join_or_abort("replies", &mut reply_task, cancel_timeout).await;

        if !pool.wait_idle(cancel_timeout).await {
            tracing::warn!(in_flight = pool.in_flight(), "transfers still in flight at release");
        }

        if let Err(e) = device.release().await {
            tracing::warn!(error = %e, "failed to release accessory interface");
        }
    }

    fn finish(&self) {
        *self.handle.shared.close_reason() = None;
        self.handle.shared.set_state(SessionState::Disconnected);
    }
}

/// Pull bytes from the read pump, decode frames, dispatch them.
async fn read_loop(mut pump: ReadPump, mut codec: FrameCodec, dispatcher: Dispatcher) -> Result<()> {
    loop {
        if pump.read_into(&mut codec).await? == ReadEvent::Cancelled {
            return Ok(());
        }

        for frame in codec.frames() {
            dispatcher.dispatch(&frame?);
        }
    }
}

fn lost(
    pipeline: &str,
    joined: std::result::Result<Result<()>, tokio::task::JoinError>,
) -> CloseReason {
    let cause = match joined {
        Ok(Ok(())) => format!("{} pipeline stopped", pipeline),
        Ok(Err(e)) => e.to_string(),
        Err(e) => format!("{} task failed: {}", pipeline, e),
    };
    tracing::error!(pipeline, %cause, "connection lost");
    CloseReason::ConnectionLost(cause)
}

async fn join_or_abort(name: &str, task: &mut JoinHandle<Result<()>>, timeout: Duration) {
    match tokio::time::timeout(timeout, &mut *task).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => tracing::debug!(task = name, error = %e, "task ended with error during close"),
        Ok(Err(e)) => tracing::warn!(task = name, error = %e, "task panicked during close"),
        Err(_) => {
            tracing::warn!(task = name, ?timeout, "task did not stop, aborting");
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryDevice, MemoryProvider};

    fn fast_builder(provider: MemoryProvider) -> SessionBuilder {
        Session::builder(Arc::new(provider))
            .detect_attempts(3)
            .retry_delay(Duration::from_millis(5))
            .settle_delay(Duration::from_millis(5))
            .read_slots(4)
            .close_grace(Duration::from_millis(200))
    }

    #[test]
    fn test_builder_configuration() {
        let builder = fast_builder(MemoryProvider::absent(MemoryDevice::new()))
            .queue_capacity(8)
            .read_size(512)
            .device_filter(0x04E8, Some(0x6860));

        assert_eq!(builder.config.connect.detect_attempts, 3);
        assert_eq!(builder.config.writer.queue_capacity, 8);
        assert_eq!(builder.config.transfer.read_size, 512);
        assert_eq!(builder.config.connect.product_id, Some(0x6860));
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let result = fast_builder(MemoryProvider::absent(MemoryDevice::new()))
            .queue_capacity(0)
            .build();
        assert!(matches!(result, Err(AccessoryError::Config(_))));
    }

    #[test]
    fn test_first_close_reason_wins() {
        let handle = SessionHandle::new();
        handle.request_shutdown();
        handle.stop();

        assert!(handle.is_shutdown_requested());
        assert_eq!(
            handle.shared.close_reason().clone(),
            Some(CloseReason::Terminated)
        );
    }

    #[tokio::test]
    async fn test_exit_requires_app_connected() {
        let handle = SessionHandle::new();
        assert!(!handle.signal_app_exit().await.unwrap());

        handle.set_app_connected(true);
        // Not connected: the flag is consumed but the write fails.
        assert!(matches!(
            handle.signal_app_exit().await,
            Err(AccessoryError::ConnectionClosed)
        ));
        assert!(!handle.is_app_connected());
    }

    #[tokio::test]
    async fn test_device_not_found_after_attempts() {
        let provider = Arc::new(MemoryProvider::absent(MemoryDevice::new()));
        let session = Session::builder(provider.clone())
            .detect_attempts(3)
            .retry_delay(Duration::from_millis(1))
            .build()
            .unwrap();

        let result = session.run().await;
        assert!(matches!(result, Err(AccessoryError::DeviceNotFound { attempts: 3 })));
        assert_eq!(provider.detections(), 3);
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_failed_open_is_retried() {
        let provider = Arc::new(MemoryProvider::accessory(MemoryDevice::new()).fail_opens(2));
        let session = Session::builder(provider.clone())
            .detect_attempts(5)
            .retry_delay(Duration::from_millis(1))
            .build()
            .unwrap();
        let handle = session.handle();
        let mut states = handle.state_changes();

        let run = tokio::spawn(async move { session.run().await });
        states
            .wait_for(|state| *state == SessionState::Connected)
            .await
            .unwrap();
        assert_eq!(provider.opens(), 1);
        assert_eq!(provider.detections(), 3);

        handle.stop();
        assert_eq!(run.await.unwrap().unwrap(), CloseReason::Stopped);
    }

    #[tokio::test]
    async fn test_switch_on_last_attempt_still_connects() {
        let provider = Arc::new(MemoryProvider::phone(MemoryDevice::new(), 0x04E8, 0x6860));
        let session = Session::builder(provider.clone())
            .detect_attempts(1)
            .settle_delay(Duration::from_millis(1))
            .build()
            .unwrap();
        let handle = session.handle();
        let mut states = handle.state_changes();

        let run = tokio::spawn(async move { session.run().await });
        states
            .wait_for(|state| *state == SessionState::Connected)
            .await
            .unwrap();
        assert_eq!(provider.switch_requests().len(), 1);
        assert_eq!(provider.opens(), 1);

        handle.stop();
        assert_eq!(run.await.unwrap().unwrap(), CloseReason::Stopped);
    }

    #[tokio::test]
    async fn test_stop_while_connecting() {
        let provider = MemoryProvider::absent(MemoryDevice::new());
        let session = Session::builder(Arc::new(provider))
            .detect_attempts(1000)
            .retry_delay(Duration::from_millis(10))
            .build()
            .unwrap();

        let handle = session.handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            handle.stop();
        });

        assert_eq!(session.run().await.unwrap(), CloseReason::Stopped);
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_and_stop_releases_device() {
        let device = MemoryDevice::new();
        let session = fast_builder(MemoryProvider::accessory(device.clone()))
            .build()
            .unwrap();
        let handle = session.handle();
        let mut states = handle.state_changes();

        let run = tokio::spawn(async move { session.run().await });
        states
            .wait_for(|state| *state == SessionState::Connected)
            .await
            .unwrap();
        assert!(handle.is_connected());
        assert!(device.is_claimed());

        handle.stop();
        assert_eq!(run.await.unwrap().unwrap(), CloseReason::Stopped);
        assert!(device.is_released());
        assert!(!handle.is_connected());
        assert_eq!(device.pending_reads(), 0);
    }
}
