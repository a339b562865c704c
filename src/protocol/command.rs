//! Command codes carried in the first two bytes of every frame.
//!
//! The numeric values are shared with the device-side application and must
//! not change without a protocol version bump.

use std::fmt;

/// Raw 16-bit wire codes.
pub mod codes {
    /// No command.
    pub const NONE: u16 = 0x0000;
    /// Echo test: payload is a big-endian u16, the reply carries value + 10.
    pub const TEST: u16 = 0x0001;
    /// Camera frame (host to device).
    pub const CAM_FRAME: u16 = 0x0002;
    /// Start camera capture.
    pub const CAM_START: u16 = 0x0003;
    /// Stop camera capture.
    pub const CAM_STOP: u16 = 0x0004;
    /// Device application is connected.
    pub const APP_CONNECTED: u16 = 0xFFFD;
    /// Terminate both the device application and the host process.
    pub const TERMINATE: u16 = 0xFFFE;
    /// Ask the device application to exit (host keeps running).
    pub const EXIT: u16 = 0xFFFF;
}

/// A decoded command.
///
/// Codes outside the reserved set decode to [`Command::Unknown`], which keeps
/// the raw value for logging and is treated like [`Command::None`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    None,
    Test,
    CamFrame,
    CamStart,
    CamStop,
    AppConnected,
    Terminate,
    Exit,
    Unknown(u16),
}

impl Command {
    /// Decode a wire code.
    pub const fn from_code(code: u16) -> Self {
        match code {
            codes::NONE => Command::None,
            codes::TEST => Command::Test,
            codes::CAM_FRAME => Command::CamFrame,
            codes::CAM_START => Command::CamStart,
            codes::CAM_STOP => Command::CamStop,
            codes::APP_CONNECTED => Command::AppConnected,
            codes::TERMINATE => Command::Terminate,
            codes::EXIT => Command::Exit,
            other => Command::Unknown(other),
        }
    }

    /// Wire code for this command.
    pub const fn code(self) -> u16 {
        match self {
            Command::None => codes::NONE,
            Command::Test => codes::TEST,
            Command::CamFrame => codes::CAM_FRAME,
            Command::CamStart => codes::CAM_START,
            Command::CamStop => codes::CAM_STOP,
            Command::AppConnected => codes::APP_CONNECTED,
            Command::Terminate => codes::TERMINATE,
            Command::Exit => codes::EXIT,
            Command::Unknown(code) => code,
        }
    }

    /// Big-endian wire bytes.
    #[inline]
    pub const fn to_bytes(self) -> [u8; 2] {
        self.code().to_be_bytes()
    }

    /// Decode from big-endian wire bytes.
    #[inline]
    pub const fn from_bytes(bytes: [u8; 2]) -> Self {
        Self::from_code(u16::from_be_bytes(bytes))
    }

    /// True if the code is one of the reserved values.
    #[inline]
    pub const fn is_known(self) -> bool {
        !matches!(self, Command::Unknown(_))
    }

    /// Short name used in logs.
    pub const fn name(self) -> &'static str {
        match self {
            Command::None => "NONE",
            Command::Test => "TEST",
            Command::CamFrame => "CAM_FRAME",
            Command::CamStart => "CAM_START",
            Command::CamStop => "CAM_STOP",
            Command::AppConnected => "APP_CONNECTED",
            Command::Terminate => "TERMINATE",
            Command::Exit => "EXIT",
            Command::Unknown(_) => "UNKNOWN",
        }
    }
}

impl From<u16> for Command {
    fn from(code: u16) -> Self {
        Command::from_code(code)
    }
}

impl From<Command> for u16 {
    fn from(command: Command) -> Self {
        command.code()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Unknown(code) => write!(f, "UNKNOWN(0x{:04X})", code),
            known => f.write_str(known.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_codes() {
        assert_eq!(Command::None.code(), 0x0000);
        assert_eq!(Command::Test.code(), 0x0001);
        assert_eq!(Command::CamFrame.code(), 0x0002);
        assert_eq!(Command::CamStart.code(), 0x0003);
        assert_eq!(Command::CamStop.code(), 0x0004);
        assert_eq!(Command::AppConnected.code(), 0xFFFD);
        assert_eq!(Command::Terminate.code(), 0xFFFE);
        assert_eq!(Command::Exit.code(), 0xFFFF);
    }

    #[test]
    fn test_known_codes_decode() {
        for command in [
            Command::None,
            Command::Test,
            Command::CamFrame,
            Command::CamStart,
            Command::CamStop,
            Command::AppConnected,
            Command::Terminate,
            Command::Exit,
        ] {
            assert_eq!(Command::from_code(command.code()), command);
            assert!(command.is_known());
        }
    }

    #[test]
    fn test_unknown_code_keeps_value() {
        let command = Command::from_code(0x1234);
        assert_eq!(command, Command::Unknown(0x1234));
        assert_eq!(command.code(), 0x1234);
        assert!(!command.is_known());
        assert_eq!(command.to_string(), "UNKNOWN(0x1234)");
    }

    #[test]
    fn test_wire_bytes_are_big_endian() {
        assert_eq!(Command::AppConnected.to_bytes(), [0xFF, 0xFD]);
        assert_eq!(Command::CamStop.to_bytes(), [0x00, 0x04]);
        assert_eq!(Command::from_bytes([0xFF, 0xFE]), Command::Terminate);
    }

    #[test]
    fn test_display_known() {
        assert_eq!(Command::Exit.to_string(), "EXIT");
        assert_eq!(Command::CamStart.to_string(), "CAM_START");
    }
}
