//! Ordered reply queue between the dispatcher and the writer.
//!
//! Handlers run on the read pipeline, which has to keep decoding while the OUT
//! endpoint is stalled. Replies go onto an unbounded channel and a per-session
//! task forwards them, in order, into the blocking [`WriterHandle::send`].
//!
//! ```text
//! Dispatcher ─► ReplySender ─► reply task ─► WriterHandle::send (may wait) ─► writer task
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{AccessoryError, Result};
use crate::protocol::Command;
use crate::writer::{OutboundMessage, WriterHandle};

/// Non-blocking handle for queueing replies.
#[derive(Clone)]
pub struct ReplySender {
    tx: mpsc::UnboundedSender<OutboundMessage>,
    /// Replies accepted but not yet handed to the writer.
    queued: Arc<AtomicUsize>,
}

impl ReplySender {
    /// Queue a reply. Never waits for writer capacity.
    pub fn send(&self, command: Command, payload: impl Into<Bytes>) -> Result<()> {
        let message = OutboundMessage::new(command, payload.into())?;
        self.queued.fetch_add(1, Ordering::AcqRel);

        self.tx.send(message).map_err(|_| {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            AccessoryError::ConnectionClosed
        })
    }

    /// Replies not yet handed to the writer.
    #[inline]
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    /// True once the reply task has exited.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Wait until every queued reply reached the writer queue.
    ///
    /// Returns `false` if `timeout` elapsed first or the task is gone.
    pub async fn wait_forwarded(&self, timeout: Duration) -> bool {
        let start = Instant::now();

        loop {
            if self.queued() == 0 {
                return true;
            }

            if self.tx.is_closed() || start.elapsed() > timeout {
                return false;
            }

            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

/// Spawn the reply task feeding `writer`.
///
/// The task ends once every sender is dropped, or with the writer's error if
/// the writer task is gone.
pub fn spawn_reply_task(writer: WriterHandle) -> (ReplySender, JoinHandle<Result<()>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let queued = Arc::new(AtomicUsize::new(0));

    let task = tokio::spawn(forward_replies(rx, writer, queued.clone()));
    (ReplySender { tx, queued }, task)
}

async fn forward_replies(
    mut rx: mpsc::UnboundedReceiver<OutboundMessage>,
    writer: WriterHandle,
    queued: Arc<AtomicUsize>,
) -> Result<()> {
    while let Some(message) = rx.recv().await {
        let command = message.command();
        let result = writer.send(message).await;
        queued.fetch_sub(1, Ordering::AcqRel);

        if let Err(e) = result {
            tracing::debug!(%command, error = %e, "reply dropped, writer gone");
            return Err(e);
        }
    }
    Ok(())
}
