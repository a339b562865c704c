//! Dedicated writer task for outbound frames.
//!
//! Every producer (command handlers, the capture forwarder, the close
//! sequence) sends complete messages through one bounded mpsc channel. A
//! single task drains it and performs one bulk OUT transfer per message, so
//! bytes of different messages never interleave on the wire.
//!
//! # Architecture
//!
//! ```text
//! Dispatcher ─────┐
//! Capture fwd ────┼─► mpsc::Sender<OutboundMessage> ─► Writer Task ─► FrameSink (TransferPool)
//! Close sequence ─┘
//! ```
//!
//! A write that times out is logged and dropped; the loop carries on with
//! the next message. Any other transport error ends the task with `Err`,
//! which the session treats as a lost connection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::WriterConfig;
use crate::error::{AccessoryError, Result};
use crate::protocol::{Command, Header, HEADER_SIZE};
use crate::shutdown::ShutdownSignal;
use crate::transport::BoxFuture;

/// A message ready to be written to the device.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    command: Command,
    /// Pre-encoded header (6 bytes).
    pub header: [u8; HEADER_SIZE],
    /// Payload bytes (empty for EXIT, CAM_STOP and friends).
    pub payload: Bytes,
}

impl OutboundMessage {
    /// Encode the header for `payload` and wrap both.
    ///
    /// Fails with `PayloadTooLarge` if the length does not fit the header.
    #[inline]
    pub fn new(command: Command, payload: Bytes) -> Result<Self> {
        let header = Header::for_payload(command, payload.len())?;
        Ok(Self {
            command,
            header: header.encode(),
            payload,
        })
    }

    #[inline]
    pub fn empty(command: Command) -> Self {
        Self {
            command,
            header: Header::new(command, 0).encode(),
            payload: Bytes::new(),
        }
    }

    #[inline]
    pub fn command(&self) -> Command {
        self.command
    }

    /// Total size on the wire (header + payload).
    #[inline]
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Destination of the writer task.
///
/// One call writes one whole message or fails.
pub trait FrameSink: Send + Sync {
    fn write_message<'a>(&'a self, message: &'a OutboundMessage) -> BoxFuture<'a, Result<()>>;
}

/// Handle for queueing messages to the writer task.
///
/// Cheaply cloneable and shared by every producer.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundMessage>,
    /// Messages queued or being written.
    pending: Arc<AtomicUsize>,
    capacity: usize,
}

impl WriterHandle {
    fn new(tx: mpsc::Sender<OutboundMessage>, pending: Arc<AtomicUsize>, capacity: usize) -> Self {
        Self {
            tx,
            pending,
            capacity,
        }
    }

    /// Queue a message, waiting for room if the queue is full.
    pub async fn send(&self, message: OutboundMessage) -> Result<()> {
        self.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.send(message).await.map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            AccessoryError::ConnectionClosed
        })
    }

    /// Encode and queue a command, waiting for room if the queue is full.
    pub async fn enqueue(&self, command: Command, payload: impl Into<Bytes>) -> Result<()> {
        self.send(OutboundMessage::new(command, payload.into())?).await
    }

    /// Queue a message without waiting.
    ///
    /// Returns `QueueFull` immediately if the queue is at capacity.
    pub fn try_send(&self, message: OutboundMessage) -> Result<()> {
        self.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.try_send(message).map_err(|e| {
            self.pending.fetch_sub(1, Ordering::Release);
            match e {
                mpsc::error::TrySendError::Full(_) => AccessoryError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => AccessoryError::ConnectionClosed,
            }
        })
    }

    /// Encode and queue a command without waiting.
    pub fn try_enqueue(&self, command: Command, payload: impl Into<Bytes>) -> Result<()> {
        self.try_send(OutboundMessage::new(command, payload.into())?)
    }

    /// True while producers would have to wait.
    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.pending.load(Ordering::Acquire) >= self.capacity
    }

    /// Messages queued or being written.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// True once the writer task has exited.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Wait until every queued message has been written or dropped.
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub async fn wait_drained(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        let check_interval = Duration::from_millis(1);

        loop {
            if self.pending.load(Ordering::Acquire) == 0 {
                return true;
            }

            if self.tx.is_closed() || start.elapsed() > timeout {
                return false;
            }

            tokio::time::sleep(check_interval).await;
        }
    }
}

/// Spawn the writer task and return a handle for queueing messages.
///
/// The task stops when `cancel` triggers or every handle has been dropped.
pub fn spawn_writer_task<S>(
    sink: Arc<S>,
    config: &WriterConfig,
    cancel: ShutdownSignal,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    S: FrameSink + ?Sized + 'static,
{
    let (tx, rx) = mpsc::channel(config.queue_capacity);
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = WriterHandle::new(tx, pending.clone(), config.queue_capacity);
    let task = tokio::spawn(writer_loop(rx, sink, pending, cancel));

    (handle, task)
}

async fn writer_loop<S>(
    mut rx: mpsc::Receiver<OutboundMessage>,
    sink: Arc<S>,
    pending: Arc<AtomicUsize>,
    cancel: ShutdownSignal,
) -> Result<()>
where
    S: FrameSink + ?Sized,
{
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.triggered() => {
                tracing::debug!("writer cancelled");
                return Ok(());
            }
            message = rx.recv() => match message {
                Some(m) => m,
                None => return Ok(()),
            },
        };

        let result = sink.write_message(&message).await;
        pending.fetch_sub(1, Ordering::Release);

        match result {
            Ok(()) => {
                tracing::trace!(command = %message.command(), bytes = message.size(), "message written");
            }
            Err(e) if e.is_timeout() => {
                tracing::warn!(command = %message.command(), "write timed out, message dropped");
            }
            Err(AccessoryError::ConnectionClosed) => return Ok(()),
            Err(e) => {
                tracing::error!(command = %message.command(), error = %e, "write failed");
                return Err(e);
            }
        }
    }
}
