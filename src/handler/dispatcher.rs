//! Command dispatch table.
//!
//! | Command       | Effect                                                |
//! |---------------|-------------------------------------------------------|
//! | TERMINATE     | mark for shutdown, close the session (non-blocking)   |
//! | EXIT          | send EXIT back if the app is connected                |
//! | APP_CONNECTED | set `app_connected`                                   |
//! | CAM_START     | start capture (idempotent)                            |
//! | CAM_STOP      | stop capture on a supervisor task (idempotent)        |
//! | TEST          | reply with the 16-bit value plus 10                   |
//! | anything else | ignored                                               |
//!
//! Handling never waits on the OUT endpoint: replies go through the session's
//! reply queue, and camera stops run on a supervisor task, so a stalled writer
//! cannot hold up TERMINATE or APP_CONNECTED behind it.
//!
//! Protocol errors stop at this boundary: [`Dispatcher::dispatch`] logs them
//! and the session stays connected.

use crate::error::{AccessoryError, Result};
use crate::protocol::{Command, Frame};

use super::context::CommandContext;

/// Amount the device's TEST value is incremented by.
pub const TEST_INCREMENT: u16 = 10;

/// Routes decoded frames to their handlers.
#[derive(Clone)]
pub struct Dispatcher {
    ctx: CommandContext,
}

impl Dispatcher {
    pub fn new(ctx: CommandContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &CommandContext {
        &self.ctx
    }

    /// Handle one frame, logging any error.
    pub fn dispatch(&self, frame: &Frame) {
        match self.handle(frame) {
            Ok(()) => {}
            Err(e) if e.is_fatal_to_session() => {
                tracing::debug!(command = %frame.command, error = %e, "command dropped, connection closing");
            }
            Err(e) => {
                tracing::warn!(command = %frame.command, error = %e, "command failed");
            }
        }
    }

    /// Handle one frame.
    pub fn handle(&self, frame: &Frame) -> Result<()> {
        tracing::debug!(command = %frame.command, len = frame.payload_len(), "dispatching frame");

        match frame.command {
            Command::Terminate => {
                tracing::info!("TERMINATE received");
                self.ctx.session().request_shutdown();
                Ok(())
            }
            Command::Exit => {
                if self.ctx.session().take_app_connected() {
                    tracing::info!("device application asked to exit");
                    self.ctx.reply_empty(Command::Exit)?;
                }
                Ok(())
            }
            Command::AppConnected => {
                tracing::info!("device application connected");
                self.ctx.session().set_app_connected(true);
                Ok(())
            }
            Command::CamStart => self.ctx.capture().start(),
            Command::CamStop => {
                self.ctx.capture().stop();
                Ok(())
            }
            Command::Test => self.handle_test(frame),
            Command::CamFrame => {
                tracing::debug!("ignoring inbound CAM_FRAME");
                Ok(())
            }
            Command::None | Command::Unknown(_) => Ok(()),
        }
    }

    fn handle_test(&self, frame: &Frame) -> Result<()> {
        let value = match frame.payload() {
            [hi, lo] => u16::from_be_bytes([*hi, *lo]),
            other => {
                return Err(AccessoryError::Protocol(format!(
                    "TEST payload must be 2 bytes, got {}",
                    other.len()
                )))
            }
        };

        let reply = value.wrapping_add(TEST_INCREMENT);
        tracing::debug!(value, reply, "TEST");
        self.ctx.reply(Command::Test, reply.to_be_bytes().to_vec())
    }
}
