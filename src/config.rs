//! Session configuration.
//!
//! All settings have defaults matching the reference accessory host, so
//! `SessionConfig::default()` is a working configuration. A JSON file may
//! override any subset of fields:
//!
//! ```
//! use accessory_bridge::config::SessionConfig;
//!
//! let config = SessionConfig::from_json_str(r#"{ "transfer": { "read_slots": 8 } }"#).unwrap();
//! assert_eq!(config.transfer.read_slots, 8);
//! assert_eq!(config.transfer.read_size, 16 * 1024);
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AccessoryError, Result};
use crate::protocol::DEFAULT_MAX_PAYLOAD_SIZE;

/// Strings sent to the device when switching it into accessory mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessoryIdentity {
    pub manufacturer: String,
    pub model: String,
    pub description: String,
    pub version: String,
    pub uri: String,
    pub serial: String,
}

impl Default for AccessoryIdentity {
    fn default() -> Self {
        Self {
            manufacturer: "Arksine".to_string(),
            model: "AccesoryTest".to_string(),
            description: "Test Accessory comms with android".to_string(),
            version: "0.1".to_string(),
            uri: "http://put.github.url.here".to_string(),
            serial: "1337".to_string(),
        }
    }
}

impl AccessoryIdentity {
    /// Identity strings in the order the accessory protocol indexes them.
    pub fn strings(&self) -> [&str; 6] {
        [
            &self.manufacturer,
            &self.model,
            &self.description,
            &self.version,
            &self.uri,
            &self.serial,
        ]
    }
}

/// Device detection and mode-switch settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectConfig {
    /// Detection attempts before `DeviceNotFound`.
    pub detect_attempts: u32,
    /// Sleep between detection attempts.
    pub retry_delay_ms: u64,
    /// Sleep after requesting the mode switch, before re-detecting.
    pub settle_delay_ms: u64,
    /// Sleep between sessions in the outer run loop.
    pub reconnect_delay_ms: u64,
    /// Only accept this vendor id (any compatible vendor if unset).
    pub vendor_id: Option<u16>,
    /// Only accept this product id (requires `vendor_id`).
    pub product_id: Option<u16>,
    pub identity: AccessoryIdentity,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            detect_attempts: 5,
            retry_delay_ms: 1000,
            settle_delay_ms: 1000,
            reconnect_delay_ms: 1000,
            vendor_id: None,
            product_id: None,
            identity: AccessoryIdentity::default(),
        }
    }
}

impl ConnectConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// Bulk transfer pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Reads kept outstanding on the IN endpoint.
    pub read_slots: usize,
    /// Size of each read buffer.
    pub read_size: usize,
    /// Write slots pre-allocated at startup (the pool grows past this).
    pub write_slots: usize,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    /// Bounded wait for cancelled transfers to retire.
    pub cancel_timeout_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            read_slots: 64,
            read_size: 16 * 1024,
            write_slots: 10,
            read_timeout_ms: 1000,
            write_timeout_ms: 1000,
            cancel_timeout_ms: 2000,
        }
    }
}

impl TransferConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_timeout_ms)
    }
}

/// Writer queue settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Maximum queued outbound messages before producers wait.
    pub queue_capacity: usize,
}

/// Default writer queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Capture forwarding settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Timeout passed to each `get_frame` call.
    pub frame_timeout_ms: u64,
    /// How long a stop waits for the forwarder before logging a warning.
    pub stop_timeout_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            frame_timeout_ms: 100,
            stop_timeout_ms: 1000,
        }
    }
}

impl CaptureConfig {
    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// Complete session configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub connect: ConnectConfig,
    pub transfer: TransferConfig,
    pub writer: WriterConfig,
    pub capture: CaptureConfig,
    /// Grace period for queued writes when closing.
    pub close_grace_ms: u64,
    /// Largest payload the decoder accepts.
    pub max_payload_size: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect: ConnectConfig::default(),
            transfer: TransferConfig::default(),
            writer: WriterConfig::default(),
            capture: CaptureConfig::default(),
            close_grace_ms: 2000,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }
}

impl SessionConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: SessionConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    /// Reject values the session cannot run with.
    pub fn validate(&self) -> Result<()> {
        let checks: [(bool, &str); 6] = [
            (self.connect.detect_attempts == 0, "connect.detect_attempts must be at least 1"),
            (self.transfer.read_slots == 0, "transfer.read_slots must be at least 1"),
            (self.transfer.read_size == 0, "transfer.read_size must be non-zero"),
            (self.writer.queue_capacity == 0, "writer.queue_capacity must be at least 1"),
            (
                self.connect.product_id.is_some() && self.connect.vendor_id.is_none(),
                "connect.product_id requires connect.vendor_id",
            ),
            (self.transfer.write_timeout_ms == 0, "transfer.write_timeout_ms must be non-zero"),
        ];

        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, message)) => Err(AccessoryError::Config((*message).to_string())),
            None => Ok(()),
        }
    }
}
