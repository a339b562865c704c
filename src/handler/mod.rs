//! Handler module - inbound command dispatch.
//!
//! Provides:
//! - [`Dispatcher`] - applies the command table to decoded frames
//! - [`CommandContext`] - what a handler can reach: session flags, replies, capture
//! - [`ReplySender`] - ordered, non-blocking path from handlers to the writer

mod context;
mod dispatcher;
mod reply;

pub use context::CommandContext;
pub use dispatcher::{Dispatcher, TEST_INCREMENT};
pub use reply::{spawn_reply_task, ReplySender};
