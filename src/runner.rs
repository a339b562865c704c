//! Outer run loop and OS signal handling.
//!
//! [`run_until_shutdown`] keeps a [`Session`] connected: it reconnects after a
//! lost device or a failed detection and returns once the device sends
//! TERMINATE or the [`ShutdownSignal`] fires. OS signals are translated into
//! that same signal by [`spawn_signal_listener`], so signal delivery never
//! touches session internals directly.

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::{AccessoryError, Result};
use crate::session::{CloseReason, Session};
use crate::shutdown::ShutdownSignal;

/// Run sessions back to back until shutdown.
pub async fn run_until_shutdown(session: &Session, shutdown: ShutdownSignal) -> Result<()> {
    let stopper = {
        let handle = session.handle();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown.triggered().await;
            info!("shutdown requested, stopping session");
            handle.stop();
        })
    };

    let reconnect_delay = session.config().connect.reconnect_delay();
    loop {
        if shutdown.is_triggered() {
            break;
        }

        match session.run().await {
            Ok(CloseReason::Terminated) => {
                info!("device requested termination");
                break;
            }
            Ok(CloseReason::Stopped) => break,
            Ok(CloseReason::ConnectionLost(cause)) => {
                warn!(%cause, "connection lost, reconnecting");
            }
            Err(e @ AccessoryError::DeviceNotFound { .. }) => {
                info!(error = %e, "waiting for accessory device");
            }
            Err(e) => {
                warn!(error = %e, "session failed, retrying");
            }
        }

        tokio::select! {
            _ = shutdown.triggered() => break,
            _ = tokio::time::sleep(reconnect_delay) => {}
        }
    }

    stopper.abort();
    Ok(())
}

/// Trigger `shutdown` on SIGINT or SIGTERM (Ctrl+C elsewhere).
pub fn spawn_signal_listener(shutdown: ShutdownSignal) -> JoinHandle<()> {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "failed to install SIGTERM handler");
                    return;
                }
            };

            let mut sigint = match signal(SignalKind::interrupt()) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "failed to install SIGINT handler");
                    return;
                }
            };

            tokio::select! {
                _ = sigterm.recv() => info!("received SIGTERM"),
                _ = sigint.recv() => info!("received SIGINT"),
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for Ctrl+C");
                return;
            }
            info!("received Ctrl+C");
        }

        shutdown.trigger();
    })
}
