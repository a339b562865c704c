//! Device collaborator interfaces.
//!
//! USB enumeration, the accessory mode switch and the bulk transfers
//! themselves live behind two traits:
//! - [`DeviceProvider`] finds a device, switches it to accessory mode and
//!   opens it
//! - [`DeviceHandle`] is the opened device: claim, bulk IN/OUT, release
//!
//! Transfers are futures. Dropping a transfer future cancels the transfer;
//! implementations must cancel the underlying USB transfer when that happens.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;

use crate::config::AccessoryIdentity;
use crate::error::Result;

/// Boxed future used by the collaborator traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Vendors known to ship devices that support accessory mode.
pub const COMPATIBLE_VENDOR_IDS: [u16; 4] = [0x18D1, 0x0FCE, 0x0E0F, 0x04E8];

/// Vendor id a device reports once it is in accessory mode.
pub const ACCESSORY_VENDOR_ID: u16 = 0x18D1;

/// Product ids a device reports once it is in accessory mode.
pub const ACCESSORY_PRODUCT_IDS: [u16; 4] = [0x2D00, 0x2D01, 0x2D04, 0x2D05];

/// A device seen during detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DetectedDevice {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl DetectedDevice {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }

    /// True if the device already enumerates as an accessory.
    pub fn is_accessory_mode(&self) -> bool {
        self.vendor_id == ACCESSORY_VENDOR_ID && ACCESSORY_PRODUCT_IDS.contains(&self.product_id)
    }

    /// True if the vendor is known to support accessory mode.
    pub fn is_compatible(&self) -> bool {
        COMPATIBLE_VENDOR_IDS.contains(&self.vendor_id)
    }

    /// Check against an optional vendor/product filter.
    pub fn matches(&self, vendor_id: Option<u16>, product_id: Option<u16>) -> bool {
        match (vendor_id, product_id) {
            (Some(vid), Some(pid)) => self.vendor_id == vid && self.product_id == pid,
            (Some(vid), None) => self.vendor_id == vid,
            _ => self.is_compatible(),
        }
    }
}

impl fmt::Display for DetectedDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

/// A finished bulk transfer.
///
/// The buffer is handed back so its slot can be resubmitted without
/// reallocating. For reads, `buffer` is truncated to the received bytes.
#[derive(Debug)]
pub struct Completion {
    pub buffer: BytesMut,
    /// Bytes transferred, `TransportTimeout`, or `Transport`.
    pub result: Result<usize>,
}

impl Completion {
    pub fn ok(buffer: BytesMut, transferred: usize) -> Self {
        Self {
            buffer,
            result: Ok(transferred),
        }
    }

    pub fn err(buffer: BytesMut, error: crate::error::AccessoryError) -> Self {
        Self {
            buffer,
            result: Err(error),
        }
    }
}

/// An opened accessory with one bulk IN and one bulk OUT endpoint.
pub trait DeviceHandle: Send + Sync + 'static {
    /// Claim the accessory interface.
    fn claim(&self) -> BoxFuture<'_, Result<()>>;

    /// Submit a bulk IN transfer.
    ///
    /// `buffer.len()` is the requested transfer size; on completion the buffer
    /// holds the received bytes.
    fn submit_read(&self, buffer: BytesMut, timeout: Duration) -> BoxFuture<'static, Completion>;

    /// Submit a bulk OUT transfer of the whole buffer.
    fn submit_write(&self, buffer: BytesMut, timeout: Duration) -> BoxFuture<'static, Completion>;

    /// Release the interface. Called once all transfers have retired.
    fn release(&self) -> BoxFuture<'_, Result<()>>;
}

/// Finds and opens accessory devices.
pub trait DeviceProvider: Send + Sync + 'static {
    /// Report the first compatible device currently attached, if any.
    fn detect(&self) -> BoxFuture<'_, Result<Option<DetectedDevice>>>;

    /// Send the identity strings and ask the device to re-enumerate as an
    /// accessory.
    fn switch_to_accessory<'a>(
        &'a self,
        device: DetectedDevice,
        identity: &'a AccessoryIdentity,
    ) -> BoxFuture<'a, Result<()>>;

    /// Open a device found by [`detect`](Self::detect).
    fn open(&self, device: DetectedDevice) -> BoxFuture<'_, Result<Arc<dyn DeviceHandle>>>;
}
