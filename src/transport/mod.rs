//! Transport module - USB accessory device access and bulk transfers.
//!
//! Provides:
//! - [`DeviceProvider`] / [`DeviceHandle`] - the seam to the USB stack
//! - [`TransferPool`] / [`ReadPump`] - outstanding bulk transfers of one session
//! - [`MemoryDevice`] / [`MemoryProvider`] - in-memory device for tests and demos

mod device;
mod in_flight;
pub mod memory;
mod pool;

pub use device::{
    BoxFuture, Completion, DetectedDevice, DeviceHandle, DeviceProvider, ACCESSORY_PRODUCT_IDS,
    ACCESSORY_VENDOR_ID, COMPATIBLE_VENDOR_IDS,
};
pub use in_flight::{InFlightGuard, InFlightTracker};
pub use memory::{MemoryDevice, MemoryProvider};
pub use pool::{ReadEvent, ReadPump, TransferPool, WriteSlot};
