//! Common error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("USB transfer timed out")]
    Timeout,

    #[error("USB device is no longer available")]
    NoDevice,

    #[error("USB error: {0}")]
    Usb(String),

    #[error("Failed to write data to USB. status={status}")]
    WriteFailed { status: usize },

    #[error("Device {0} has no HID interface with both an IN and an OUT endpoint")]
    NoHidEndpoints(String),

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterface { interface: u8, message: String },

    #[error("Permission to access {0} was denied")]
    PermissionDenied(String),

    #[error("No device matching {vendor_id:#06x}:{product_id:#06x}")]
    DeviceNotFound { vendor_id: u16, product_id: u16 },

    #[error("{0} worker is already running")]
    AlreadyRunning(&'static str),

    #[error("{worker} worker panicked: {message}")]
    WorkerPanicked {
        worker: &'static str,
        message: String,
    },

    #[error("Connection is not open")]
    NotOpen,

    #[error("Hot-plug notifications are not supported on this platform")]
    HotplugUnsupported,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_failed_message() {
        let err = Error::WriteFailed { status: 0 };
        assert_eq!(err.to_string(), "Failed to write data to USB. status=0");
    }

    #[test]
    fn test_device_not_found_formats_hex() {
        let err = Error::DeviceNotFound {
            vendor_id: 0x1234,
            product_id: 0x0006,
        };
        assert_eq!(err.to_string(), "No device matching 0x1234:0x0006");
    }
}
