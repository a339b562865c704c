//! Context handed to command handlers.
//!
//! Bundles what a handler may touch: the session flags, the reply queue and
//! the capture controller. Nothing in here waits on the OUT endpoint.

use bytes::Bytes;

use crate::capture::CaptureController;
use crate::error::Result;
use crate::protocol::Command;
use crate::session::SessionHandle;

use super::reply::ReplySender;

/// Context passed to the dispatcher for every inbound frame.
///
/// `CommandContext` is `Clone`; every clone refers to the same session.
#[derive(Clone)]
pub struct CommandContext {
    session: SessionHandle,
    replies: ReplySender,
    capture: CaptureController,
}

impl CommandContext {
    pub fn new(session: SessionHandle, replies: ReplySender, capture: CaptureController) -> Self {
        Self {
            session,
            replies,
            capture,
        }
    }

    #[inline]
    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    #[inline]
    pub fn capture(&self) -> &CaptureController {
        &self.capture
    }

    #[inline]
    pub fn replies(&self) -> &ReplySender {
        &self.replies
    }

    /// Queue a reply to the device. Returns without waiting for the writer.
    pub fn reply(&self, command: Command, payload: impl Into<Bytes>) -> Result<()> {
        self.replies.send(command, payload)
    }

    /// Queue a reply with an empty payload.
    pub fn reply_empty(&self, command: Command) -> Result<()> {
        self.replies.send(command, Bytes::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CaptureConfig, TransferConfig, WriterConfig};
    use crate::handler::spawn_reply_task;
    use crate::shutdown::ShutdownSignal;
    use crate::transport::{MemoryDevice, TransferPool};
    use crate::writer::spawn_writer_task;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_reply_reaches_device_in_order() {
        let device = MemoryDevice::new();
        let pool = TransferPool::new(Arc::new(device.clone()), TransferConfig::default());
        let (writer, _task) = spawn_writer_task(pool, &WriterConfig::default(), ShutdownSignal::new());
        let (replies, _reply_task) = spawn_reply_task(writer.clone());
        let capture = CaptureController::new(None, writer, CaptureConfig::default());
        let ctx = CommandContext::new(SessionHandle::new(), replies, capture);

        ctx.reply(Command::Test, vec![0x00, 0x0F]).unwrap();
        ctx.reply_empty(Command::CamStop).unwrap();
        assert!(device.wait_for_writes(2, Duration::from_secs(1)).await);

        let frames = device.written_frames();
        assert_eq!(frames[0].payload(), &[0x00, 0x0F]);
        assert_eq!(frames[1].command, Command::CamStop);
        assert!(frames[1].payload.is_empty());
        assert_eq!(ctx.replies().queued(), 0);
    }
}
