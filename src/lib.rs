//! # accessory-bridge
//!
//! Host side of a framed command/streaming protocol spoken with an Android
//! device in USB accessory mode.
//!
//! This crate bridges a host to the device over one pair of bulk endpoints.
//! Control commands (terminate, exit, app-connected, camera start/stop, echo
//! test) and camera frames share the same pipe.
//!
//! ## Architecture
//!
//! - **Framing**: every message is `[2-byte command][4-byte BE length][payload]`
//! - **Read path**: perpetual bulk IN reads → [`protocol::FrameCodec`] →
//!   [`handler::Dispatcher`]; replies go through [`handler::ReplySender`] so
//!   the read path never waits on the OUT endpoint
//! - **Write path**: any producer → [`writer::WriterHandle`] → writer task →
//!   one bulk OUT transfer per message
//! - **Lifecycle**: [`Session`] connects, supervises and closes one device
//!   connection; [`runner::run_until_shutdown`] reconnects until told to stop
//!
//! USB access and the camera are collaborators behind
//! [`transport::DeviceProvider`] / [`transport::DeviceHandle`] and
//! [`capture::CaptureSource`].
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use accessory_bridge::{runner, Session, ShutdownSignal};
//!
//! #[tokio::main]
//! async fn main() -> accessory_bridge::Result<()> {
//!     let session = Session::builder(Arc::new(usb_provider)).build()?;
//!
//!     let shutdown = ShutdownSignal::new();
//!     runner::spawn_signal_listener(shutdown.clone());
//!     runner::run_until_shutdown(&session, shutdown).await
//! }
//! ```

pub mod capture;
pub mod config;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod runner;
pub mod session;
pub mod shutdown;
pub mod transport;
pub mod writer;

pub use config::SessionConfig;
pub use error::{AccessoryError, Result};
pub use protocol::{Command, Frame, FrameCodec};
pub use session::{CloseReason, Session, SessionBuilder, SessionHandle, SessionState};
pub use shutdown::ShutdownSignal;
