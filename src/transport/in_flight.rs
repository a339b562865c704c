//! Outstanding transfer accounting.
//!
//! Every submitted transfer holds an [`InFlightGuard`]; the guard decrements
//! the shared counter when the transfer completes or its future is dropped
//! (cancelled). The stop sequence uses [`InFlightTracker::wait_idle`] to give
//! cancelled transfers a bounded amount of time to retire.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Interval between idle checks.
const CHECK_INTERVAL: Duration = Duration::from_millis(1);

/// Lock-free counter of in-flight transfers.
#[derive(Debug, Clone, Default)]
pub struct InFlightTracker {
    count: Arc<AtomicUsize>,
}

impl InFlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one transfer; it counts until the guard is dropped.
    pub fn guard(&self) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            count: self.count.clone(),
        }
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.count() == 0
    }

    /// Wait until no transfer is in flight.
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let start = Instant::now();

        loop {
            if self.is_idle() {
                return true;
            }

            if start.elapsed() > timeout {
                return false;
            }

            tokio::time::sleep(CHECK_INTERVAL).await;
        }
    }
}

/// Releases one in-flight slot on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    count: Arc<AtomicUsize>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
    }
}
